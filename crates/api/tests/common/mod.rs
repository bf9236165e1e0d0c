#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Method, Request, Response};
use axum::Router;
use http_body_util::BodyExt;
use tower::ServiceExt;
use trainyard_api::config::ServerConfig;
use trainyard_api::router::build_app_router;
use trainyard_api::state::AppState;
use trainyard_core::detection::{BoundingBox, Detection, PredictedImage};
use trainyard_core::job_spec::{Algorithm, PredictionSpec, TrainingSpec};
use trainyard_core::lifecycle::JobState;
use trainyard_core::types::JobId;
use trainyard_engine::backend::{
    Backend, BackendError, PredictionSession, SessionContext, TrainingSession, ValidationOutcome,
};
use trainyard_engine::fetcher::{FetchError, ProgressFn, WeightFetcher};
use trainyard_engine::memory::MemoryJobStore;
use trainyard_engine::{CancellationController, JobScheduler, PollConfig};

/// Build a test `ServerConfig` with safe defaults and short poll windows.
pub fn test_config() -> ServerConfig {
    let poll = PollConfig {
        max_wait_iterations: 5,
        poll_interval: Duration::from_millis(10),
    };
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        cors_origins: vec!["http://localhost:8080".to_string()],
        request_timeout_secs: 30,
        shutdown_timeout_secs: 5,
        gpu_count: Some(1),
        stop_timeout: Duration::from_secs(10),
        progress_poll: poll,
        weight_poll: poll,
        pretrained_weight_dir: PathBuf::from("/pretrained"),
        pretrained_weight_url: "http://weights.invalid".to_string(),
        trained_weight_dir: PathBuf::from("/trained"),
        python_bin: PathBuf::from("python3"),
        trainer_script: PathBuf::from("trainer.py"),
    }
}

// ---------------------------------------------------------------------------
// Fake collaborators
// ---------------------------------------------------------------------------

/// Backend whose batches take a few milliseconds, or wait while held.
#[derive(Clone, Default)]
pub struct FakeBackend {
    held: Arc<AtomicBool>,
}

impl FakeBackend {
    /// Make batches wait until [`release`](Self::release).
    pub fn hold(&self) {
        self.held.store(true, Ordering::SeqCst);
    }

    pub fn release(&self) {
        self.held.store(false, Ordering::SeqCst);
    }
}

struct FakeSession {
    held: Arc<AtomicBool>,
}

impl FakeSession {
    fn step(&self) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while self.held.load(Ordering::SeqCst) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(2));
        }
        std::thread::sleep(Duration::from_millis(2));
    }
}

fn image(name: &str) -> PredictedImage {
    PredictedImage {
        image: name.to_string(),
        detections: vec![Detection {
            class_id: 0,
            class_name: "person".into(),
            score: 0.75,
            bbox: BoundingBox {
                x: 0.4,
                y: 0.4,
                w: 0.1,
                h: 0.3,
            },
        }],
    }
}

impl TrainingSession for FakeSession {
    fn batch_count(&self) -> u64 {
        2
    }

    fn train_batch(&mut self, index: u64) -> Result<f64, BackendError> {
        self.step();
        Ok(0.5 / (index + 1) as f64)
    }

    fn validate(&mut self) -> Result<ValidationOutcome, BackendError> {
        Ok(ValidationOutcome {
            loss: 0.4,
            iou: 0.6,
            map: 0.7,
            prediction: vec![image("valid.jpg")],
        })
    }

    fn save_weights(&mut self, _path: &Path) -> Result<(), BackendError> {
        Ok(())
    }
}

impl PredictionSession for FakeSession {
    fn batch_count(&self) -> u64 {
        3
    }

    fn predict_batch(&mut self, index: u64) -> Result<Vec<PredictedImage>, BackendError> {
        self.step();
        Ok(vec![image(&format!("frame-{index}.jpg"))])
    }
}

impl Backend for FakeBackend {
    fn open_training(
        &self,
        _ctx: SessionContext,
        _spec: &TrainingSpec,
        _pretrained_weight: Option<&Path>,
    ) -> Result<Box<dyn TrainingSession>, BackendError> {
        Ok(Box::new(FakeSession {
            held: Arc::clone(&self.held),
        }))
    }

    fn open_prediction(
        &self,
        _ctx: SessionContext,
        _spec: &PredictionSpec,
        _weight: &Path,
    ) -> Result<Box<dyn PredictionSession>, BackendError> {
        Ok(Box::new(FakeSession {
            held: Arc::clone(&self.held),
        }))
    }
}

/// Every pretrained weight is already cached.
pub struct CachedFetcher;

#[async_trait]
impl WeightFetcher for CachedFetcher {
    async fn cached(&self, algorithm: Algorithm) -> Option<PathBuf> {
        Some(PathBuf::from("/pretrained").join(algorithm.pretrained_weight_file()))
    }

    async fn download(
        &self,
        algorithm: Algorithm,
        _progress: ProgressFn<'_>,
        _cancel: &CancellationController,
    ) -> Result<PathBuf, FetchError> {
        Ok(PathBuf::from("/pretrained").join(algorithm.pretrained_weight_file()))
    }
}

// ---------------------------------------------------------------------------
// App
// ---------------------------------------------------------------------------

pub struct TestApp {
    pub router: Router,
    pub scheduler: Arc<JobScheduler>,
    pub store: Arc<MemoryJobStore>,
    pub backend: FakeBackend,
}

/// Build the full application router with all middleware layers over an
/// in-memory store and a fake compute backend.
///
/// Uses [`build_app_router`], so tests exercise the same middleware stack
/// (CORS, request ID, timeout, tracing, panic recovery) that production uses.
pub fn build_test_app() -> TestApp {
    let config = test_config();
    let store = Arc::new(MemoryJobStore::new());
    let backend = FakeBackend::default();
    let scheduler = JobScheduler::new(
        config.scheduler_config(1),
        Arc::new(backend.clone()),
        Arc::new(CachedFetcher),
        Arc::clone(&store) as Arc<dyn trainyard_core::store::JobStore>,
    );
    let state = AppState::new(Arc::clone(&scheduler), config.clone());

    TestApp {
        router: build_app_router(state, &config),
        scheduler,
        store,
        backend,
    }
}

// ---------------------------------------------------------------------------
// Request helpers
// ---------------------------------------------------------------------------

pub async fn send(
    app: &Router,
    method: Method,
    uri: &str,
    body: Option<serde_json::Value>,
) -> Response<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(json) => {
            builder = builder.header("content-type", "application/json");
            Body::from(json.to_string())
        }
        None => Body::empty(),
    };
    app.clone()
        .oneshot(builder.body(body).unwrap())
        .await
        .unwrap()
}

pub async fn get(app: &Router, uri: &str) -> Response<Body> {
    send(app, Method::GET, uri, None).await
}

pub async fn post_json(app: &Router, uri: &str, json: serde_json::Value) -> Response<Body> {
    send(app, Method::POST, uri, Some(json)).await
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

pub async fn body_text(response: Response<Body>) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

/// SSD training submission body.
pub fn training_body(dataset: &str) -> serde_json::Value {
    serde_json::json!({
        "kind": "training",
        "dataset_ref": dataset,
        "hyper_parameters": {
            "batch_size": 4,
            "total_epoch": 2,
            "image_width": 300,
            "image_height": 300,
            "load_pretrained_weight": false
        },
        "algorithm": "ssd"
    })
}

/// Submit a job and return its ID.
pub async fn submit(app: &TestApp, body: serde_json::Value) -> JobId {
    let response = post_json(&app.router, "/api/v1/jobs", body).await;
    assert_eq!(response.status(), axum::http::StatusCode::CREATED);
    let json = body_json(response).await;
    json["data"]["job_id"].as_str().unwrap().parse().unwrap()
}

pub async fn wait_for_state(app: &TestApp, id: JobId, state: JobState) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while app.scheduler.state(id).ok() != Some(state) {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for job {id} to reach {state}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
