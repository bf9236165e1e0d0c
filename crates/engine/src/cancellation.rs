//! Cooperative stop signal.
//!
//! The scheduler raises the flag; the worker polls it before every batch
//! and returns as soon as it sees it. Nothing is interrupted mid-batch, so
//! cancellation latency is bounded by one batch.

use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Default)]
pub struct CancellationController {
    cancelled: AtomicBool,
}

impl CancellationController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag. Returns `true` if this call raised it.
    pub fn cancel(&self) -> bool {
        !self.cancelled.swap(true, Ordering::AcqRel)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}
