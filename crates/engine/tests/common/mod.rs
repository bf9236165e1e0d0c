#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use trainyard_core::detection::{BoundingBox, Detection, PredictedImage};
use trainyard_core::job_spec::{
    Algorithm, AlgorithmParamsRequest, HyperParameters, PredictionSpec, SubmitJob,
    TrainingRequest, TrainingSpec,
};
use trainyard_core::job_spec::JobSpec;
use trainyard_core::lifecycle::JobState;
use trainyard_core::store::{EpochSummary, JobRecord, JobStore, StoreError};
use trainyard_core::types::{DeviceId, JobId};
use trainyard_engine::backend::{
    Backend, BackendError, PredictionSession, SessionContext, TrainingSession, ValidationOutcome,
};
use trainyard_engine::cancellation::CancellationController;
use trainyard_engine::fetcher::{FetchError, ProgressFn, WeightFetcher};
use trainyard_engine::memory::MemoryJobStore;
use trainyard_engine::{JobScheduler, SchedulerConfig};

/// Upper bound for anything a test waits on.
const WAIT_LIMIT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Gate
// ---------------------------------------------------------------------------

/// Counting gate for fake batches. Each batch takes one permit; an open gate
/// lets everything through.
#[derive(Default)]
pub struct Gate {
    permits: Mutex<(u64, bool)>,
    cv: Condvar,
    entered: AtomicUsize,
}

impl Gate {
    pub fn release(&self, n: u64) {
        self.permits.lock().unwrap().0 += n;
        self.cv.notify_all();
    }

    pub fn open(&self) {
        self.permits.lock().unwrap().1 = true;
        self.cv.notify_all();
    }

    /// Number of batches that have reached the gate.
    pub fn entered(&self) -> usize {
        self.entered.load(Ordering::SeqCst)
    }

    fn wait(&self) {
        self.entered.fetch_add(1, Ordering::SeqCst);
        let guard = self.permits.lock().unwrap();
        let (mut guard, _) = self
            .cv
            .wait_timeout_while(guard, WAIT_LIMIT, |(permits, open)| !*open && *permits == 0)
            .unwrap();
        if !guard.1 && guard.0 > 0 {
            guard.0 -= 1;
        }
    }
}

// ---------------------------------------------------------------------------
// Fake compute backend
// ---------------------------------------------------------------------------

/// Scripted backend.
///
/// Behaviour is keyed by the job's dataset ref: `fail*` datasets fail on
/// the first batch, `panic*` datasets panic on it. With gating enabled
/// every batch waits on the dataset's [`Gate`].
#[derive(Clone)]
pub struct FakeBackend {
    inner: Arc<Inner>,
}

struct Inner {
    batches: u64,
    batch_delay: Duration,
    gated: bool,
    maps: Vec<f64>,
    gates: Mutex<HashMap<String, Arc<Gate>>>,
    live: AtomicUsize,
    max_live: AtomicUsize,
    busy_devices: Mutex<HashSet<DeviceId>>,
    device_conflict: AtomicBool,
    opened: Mutex<Vec<JobId>>,
    saved: Mutex<Vec<PathBuf>>,
    prediction_weights: Mutex<Vec<PathBuf>>,
}

impl FakeBackend {
    fn build(batches: u64, gated: bool, maps: Vec<f64>) -> Self {
        Self {
            inner: Arc::new(Inner {
                batches,
                batch_delay: Duration::from_millis(2),
                gated,
                maps,
                gates: Mutex::new(HashMap::new()),
                live: AtomicUsize::new(0),
                max_live: AtomicUsize::new(0),
                busy_devices: Mutex::new(HashSet::new()),
                device_conflict: AtomicBool::new(false),
                opened: Mutex::new(Vec::new()),
                saved: Mutex::new(Vec::new()),
                prediction_weights: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Batches run freely with a short delay.
    pub fn new(batches: u64) -> Self {
        Self::build(batches, false, vec![0.5])
    }

    /// Every batch waits for a permit on its dataset's gate.
    pub fn gated(batches: u64) -> Self {
        Self::build(batches, true, vec![0.5])
    }

    /// Validation mAP per epoch; the last value repeats.
    pub fn with_maps(batches: u64, maps: Vec<f64>) -> Self {
        Self::build(batches, false, maps)
    }

    pub fn gate(&self, dataset: &str) -> Arc<Gate> {
        let mut gates = self.inner.gates.lock().unwrap();
        Arc::clone(gates.entry(dataset.to_string()).or_default())
    }

    /// Open every gate handed out so far.
    pub fn open_all(&self) {
        for gate in self.inner.gates.lock().unwrap().values() {
            gate.open();
        }
    }

    pub fn max_live(&self) -> usize {
        self.inner.max_live.load(Ordering::SeqCst)
    }

    pub fn device_conflict(&self) -> bool {
        self.inner.device_conflict.load(Ordering::SeqCst)
    }

    /// Jobs in the order their sessions were opened.
    pub fn opened(&self) -> Vec<JobId> {
        self.inner.opened.lock().unwrap().clone()
    }

    pub fn saved_weights(&self) -> Vec<PathBuf> {
        self.inner.saved.lock().unwrap().clone()
    }

    pub fn prediction_weights(&self) -> Vec<PathBuf> {
        self.inner.prediction_weights.lock().unwrap().clone()
    }

    fn open(&self, ctx: SessionContext, dataset: &str) -> SessionGuard {
        if !self.inner.busy_devices.lock().unwrap().insert(ctx.device) {
            self.inner.device_conflict.store(true, Ordering::SeqCst);
        }
        let live = self.inner.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.max_live.fetch_max(live, Ordering::SeqCst);
        self.inner.opened.lock().unwrap().push(ctx.job_id);
        SessionGuard {
            inner: Arc::clone(&self.inner),
            device: ctx.device,
            gate: self.inner.gated.then(|| self.gate(dataset)),
            dataset: dataset.to_string(),
        }
    }
}

/// Per-session bookkeeping shared by both session kinds.
struct SessionGuard {
    inner: Arc<Inner>,
    device: DeviceId,
    gate: Option<Arc<Gate>>,
    dataset: String,
}

impl SessionGuard {
    fn batch(&self, index: u64) -> Result<(), BackendError> {
        match &self.gate {
            Some(gate) => gate.wait(),
            None => std::thread::sleep(self.inner.batch_delay),
        }
        if self.dataset.starts_with("fail") {
            return Err(BackendError::Failed("exploding gradients".into()));
        }
        if self.dataset.starts_with("panic") {
            panic!("model crashed at batch {index}");
        }
        Ok(())
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.inner.live.fetch_sub(1, Ordering::SeqCst);
        if let Ok(mut busy) = self.inner.busy_devices.lock() {
            busy.remove(&self.device);
        }
    }
}

struct FakeTraining {
    guard: SessionGuard,
    epoch: usize,
}

impl TrainingSession for FakeTraining {
    fn batch_count(&self) -> u64 {
        self.guard.inner.batches
    }

    fn train_batch(&mut self, index: u64) -> Result<f64, BackendError> {
        self.guard.batch(index)?;
        Ok(1.0 / (index + 1) as f64)
    }

    fn validate(&mut self) -> Result<ValidationOutcome, BackendError> {
        let maps = &self.guard.inner.maps;
        let map = maps[self.epoch.min(maps.len() - 1)];
        self.epoch += 1;
        Ok(ValidationOutcome {
            loss: 1.0 - map,
            iou: map / 2.0,
            map,
            prediction: vec![image("valid.jpg")],
        })
    }

    fn save_weights(&mut self, path: &Path) -> Result<(), BackendError> {
        self.guard.inner.saved.lock().unwrap().push(path.to_path_buf());
        Ok(())
    }
}

struct FakePrediction {
    guard: SessionGuard,
}

impl PredictionSession for FakePrediction {
    fn batch_count(&self) -> u64 {
        self.guard.inner.batches
    }

    fn predict_batch(&mut self, index: u64) -> Result<Vec<PredictedImage>, BackendError> {
        self.guard.batch(index)?;
        Ok(vec![image(&format!("img-{index}.jpg"))])
    }
}

impl Backend for FakeBackend {
    fn open_training(
        &self,
        ctx: SessionContext,
        spec: &TrainingSpec,
        _pretrained_weight: Option<&Path>,
    ) -> Result<Box<dyn TrainingSession>, BackendError> {
        Ok(Box::new(FakeTraining {
            guard: self.open(ctx, &spec.dataset_ref),
            epoch: 0,
        }))
    }

    fn open_prediction(
        &self,
        ctx: SessionContext,
        spec: &PredictionSpec,
        weight: &Path,
    ) -> Result<Box<dyn PredictionSession>, BackendError> {
        self.inner
            .prediction_weights
            .lock()
            .unwrap()
            .push(weight.to_path_buf());
        Ok(Box::new(FakePrediction {
            guard: self.open(ctx, &spec.dataset_ref),
        }))
    }
}

pub fn image(name: &str) -> PredictedImage {
    PredictedImage {
        image: name.to_string(),
        detections: vec![Detection {
            class_id: 1,
            class_name: "car".into(),
            score: 0.9,
            bbox: BoundingBox {
                x: 0.5,
                y: 0.5,
                w: 0.2,
                h: 0.1,
            },
        }],
    }
}

// ---------------------------------------------------------------------------
// Fake weight fetchers
// ---------------------------------------------------------------------------

/// Every pretrained weight is already cached.
pub struct CachedFetcher;

#[async_trait]
impl WeightFetcher for CachedFetcher {
    async fn cached(&self, algorithm: Algorithm) -> Option<PathBuf> {
        Some(PathBuf::from("/cache").join(algorithm.pretrained_weight_file()))
    }

    async fn download(
        &self,
        algorithm: Algorithm,
        _progress: ProgressFn<'_>,
        _cancel: &CancellationController,
    ) -> Result<PathBuf, FetchError> {
        Ok(PathBuf::from("/cache").join(algorithm.pretrained_weight_file()))
    }
}

/// Nothing is cached; the download reports `steps` one permit at a time
/// and needs one more permit to finish.
pub struct ScriptedFetcher {
    steps: Vec<u8>,
    permits: Arc<Semaphore>,
}

impl ScriptedFetcher {
    pub fn new(steps: Vec<u8>) -> Self {
        Self {
            steps,
            permits: Arc::new(Semaphore::new(0)),
        }
    }

    pub fn release(&self, n: usize) {
        self.permits.add_permits(n);
    }

    async fn step(&self, cancel: &CancellationController) -> Result<(), FetchError> {
        let permit = tokio::time::timeout(WAIT_LIMIT, self.permits.acquire())
            .await
            .map_err(|_| FetchError::Cancelled)?
            .map_err(|_| FetchError::Cancelled)?;
        permit.forget();
        if cancel.is_cancelled() {
            return Err(FetchError::Cancelled);
        }
        Ok(())
    }
}

#[async_trait]
impl WeightFetcher for ScriptedFetcher {
    async fn cached(&self, _algorithm: Algorithm) -> Option<PathBuf> {
        None
    }

    async fn download(
        &self,
        algorithm: Algorithm,
        progress: ProgressFn<'_>,
        cancel: &CancellationController,
    ) -> Result<PathBuf, FetchError> {
        for &step in &self.steps {
            self.step(cancel).await?;
            progress(step);
        }
        self.step(cancel).await?;
        Ok(PathBuf::from("/downloads").join(algorithm.pretrained_weight_file()))
    }
}

/// Panics in async worker code, outside any blocking call.
pub struct PanickingFetcher;

#[async_trait]
impl WeightFetcher for PanickingFetcher {
    async fn cached(&self, _algorithm: Algorithm) -> Option<PathBuf> {
        panic!("weight cache corrupted");
    }

    async fn download(
        &self,
        _algorithm: Algorithm,
        _progress: ProgressFn<'_>,
        _cancel: &CancellationController,
    ) -> Result<PathBuf, FetchError> {
        unreachable!()
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Memory store whose `register_job` waits until [`open`](Self::open).
pub struct GatedStore {
    pub inner: Arc<MemoryJobStore>,
    registering: AtomicBool,
    gate: Semaphore,
}

impl Default for GatedStore {
    fn default() -> Self {
        Self {
            inner: Arc::new(MemoryJobStore::new()),
            registering: AtomicBool::new(false),
            gate: Semaphore::new(0),
        }
    }
}

impl GatedStore {
    /// Whether a `register_job` call is waiting on the gate.
    pub fn registering(&self) -> bool {
        self.registering.load(Ordering::SeqCst)
    }

    pub fn open(&self) {
        self.gate.add_permits(Semaphore::MAX_PERMITS / 2);
    }
}

#[async_trait]
impl JobStore for GatedStore {
    async fn register_job(&self, id: JobId, spec: &JobSpec) -> Result<(), StoreError> {
        self.registering.store(true, Ordering::SeqCst);
        let _permit = self.gate.acquire().await.unwrap();
        self.inner.register_job(id, spec).await
    }

    async fn fetch_job(&self, id: JobId) -> Result<Option<JobRecord>, StoreError> {
        self.inner.fetch_job(id).await
    }

    async fn save_job_state(
        &self,
        id: JobId,
        state: JobState,
        error_message: Option<&str>,
    ) -> Result<(), StoreError> {
        self.inner.save_job_state(id, state, error_message).await
    }

    async fn save_epoch(&self, epoch: &EpochSummary) -> Result<(), StoreError> {
        self.inner.save_epoch(epoch).await
    }

    async fn delete_weight_file(&self, id: JobId) -> Result<(), StoreError> {
        self.inner.delete_weight_file(id).await
    }
}

pub struct Harness {
    pub scheduler: Arc<JobScheduler>,
    pub backend: FakeBackend,
    pub store: Arc<MemoryJobStore>,
}

pub fn test_config(slots: usize) -> SchedulerConfig {
    SchedulerConfig {
        slot_count: slots,
        stop_timeout: WAIT_LIMIT,
        trained_weight_dir: PathBuf::from("/trained"),
    }
}

pub fn harness(slots: usize, backend: FakeBackend) -> Harness {
    harness_with(test_config(slots), backend, Arc::new(CachedFetcher))
}

pub fn harness_with(
    config: SchedulerConfig,
    backend: FakeBackend,
    fetcher: Arc<dyn WeightFetcher>,
) -> Harness {
    let store = Arc::new(MemoryJobStore::new());
    let scheduler = JobScheduler::new(
        config,
        Arc::new(backend.clone()),
        fetcher,
        Arc::clone(&store) as Arc<dyn JobStore>,
    );
    Harness {
        scheduler,
        backend,
        store,
    }
}

pub fn harness_with_store(
    config: SchedulerConfig,
    backend: FakeBackend,
    store: Arc<GatedStore>,
) -> Harness {
    let inner = Arc::clone(&store.inner);
    let scheduler = JobScheduler::new(
        config,
        Arc::new(backend.clone()),
        Arc::new(CachedFetcher),
        store as Arc<dyn JobStore>,
    );
    Harness {
        scheduler,
        backend,
        store: inner,
    }
}

/// SSD training request without a pretrained weight.
pub fn training(dataset: &str, epochs: i64) -> SubmitJob {
    SubmitJob::Training(TrainingRequest {
        dataset_ref: dataset.to_string(),
        hyper_parameters: HyperParameters {
            batch_size: 4,
            total_epoch: epochs,
            image_width: 64,
            image_height: 64,
            load_pretrained_weight: false,
        },
        algorithm: "ssd".into(),
        algorithm_params: AlgorithmParamsRequest::default(),
    })
}

/// SSD training request that needs the pretrained weight.
pub fn training_with_weight(dataset: &str, epochs: i64) -> SubmitJob {
    match training(dataset, epochs) {
        SubmitJob::Training(mut req) => {
            req.hyper_parameters.load_pretrained_weight = true;
            SubmitJob::Training(req)
        }
        other => other,
    }
}

/// Poll `condition` every few milliseconds until it holds.
pub async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT_LIMIT;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub async fn wait_for_state(scheduler: &JobScheduler, id: JobId, state: JobState) {
    wait_until(&format!("job {id} to reach {state}"), || {
        scheduler.state(id).ok() == Some(state)
    })
    .await;
}

/// Wait until a batch of `dataset` is blocked on its gate.
pub async fn wait_for_batch(backend: &FakeBackend, dataset: &str) {
    let gate = backend.gate(dataset);
    wait_until(&format!("a batch of {dataset} to start"), || gate.entered() >= 1).await;
}

/// Wait until the job's worker has exited and its completion is persisted.
pub async fn wait_for_exit(scheduler: &JobScheduler, id: JobId) {
    wait_until(&format!("worker of job {id} to exit"), || {
        scheduler.job(id).is_some_and(|job| job.has_exited())
    })
    .await;
}

/// Run `fut` with the test-wide time limit.
pub async fn within<T>(fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(WAIT_LIMIT, fut)
        .await
        .expect("operation timed out")
}
