//! Pretrained weight retrieval.
//!
//! [`WeightFetcher`] is the download collaborator behind a job's weight
//! acquisition. [`HttpWeightFetcher`] keeps a local cache directory and
//! streams missing weights over HTTP into `<name>.part`, renaming the file
//! into place once the body is complete.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use trainyard_core::job_spec::Algorithm;

use crate::cancellation::CancellationController;

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("Weight download failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Weight cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Weight download cancelled")]
    Cancelled,
}

/// Receives download percentages (`0..=100`).
pub type ProgressFn<'a> = &'a (dyn Fn(u8) + Send + Sync);

#[async_trait]
pub trait WeightFetcher: Send + Sync {
    /// Local path of the weight if it is already cached.
    async fn cached(&self, algorithm: Algorithm) -> Option<PathBuf>;

    /// Download the weight, reporting progress as bytes arrive. Checks
    /// `cancel` between chunks.
    async fn download(
        &self,
        algorithm: Algorithm,
        progress: ProgressFn<'_>,
        cancel: &CancellationController,
    ) -> Result<PathBuf, FetchError>;
}

/// Percentage of `received` out of `total`, capped at 99 until the file is
/// complete on disk. Unknown totals report 0.
pub fn download_percentage(received: u64, total: Option<u64>) -> u8 {
    match total {
        Some(total) if total > 0 => (received.saturating_mul(100) / total).min(99) as u8,
        _ => 0,
    }
}

pub struct HttpWeightFetcher {
    client: reqwest::Client,
    base_url: String,
    cache_dir: PathBuf,
}

impl HttpWeightFetcher {
    pub fn new(base_url: impl Into<String>, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            cache_dir: cache_dir.into(),
        }
    }

    fn url(&self, algorithm: Algorithm) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            algorithm.pretrained_weight_file()
        )
    }
}

#[async_trait]
impl WeightFetcher for HttpWeightFetcher {
    async fn cached(&self, algorithm: Algorithm) -> Option<PathBuf> {
        let path = self.cache_dir.join(algorithm.pretrained_weight_file());
        match tokio::fs::try_exists(&path).await {
            Ok(true) => Some(path),
            _ => None,
        }
    }

    async fn download(
        &self,
        algorithm: Algorithm,
        progress: ProgressFn<'_>,
        cancel: &CancellationController,
    ) -> Result<PathBuf, FetchError> {
        let url = self.url(algorithm);
        let target = self.cache_dir.join(algorithm.pretrained_weight_file());
        let partial = target.with_extension("part");

        tokio::fs::create_dir_all(&self.cache_dir).await?;
        tracing::info!(url = %url, path = %target.display(), "Downloading pretrained weight");

        let mut response = self.client.get(&url).send().await?.error_for_status()?;
        let total = response.content_length();
        let mut file = tokio::fs::File::create(&partial).await?;
        let mut received: u64 = 0;

        while let Some(chunk) = response.chunk().await? {
            if cancel.is_cancelled() {
                drop(file);
                let _ = tokio::fs::remove_file(&partial).await;
                return Err(FetchError::Cancelled);
            }
            file.write_all(&chunk).await?;
            received += chunk.len() as u64;
            progress(download_percentage(received, total));
        }

        file.flush().await?;
        drop(file);
        tokio::fs::rename(&partial, &target).await?;
        progress(100);

        tracing::info!(path = %target.display(), bytes = received, "Pretrained weight downloaded");
        Ok(target)
    }
}
