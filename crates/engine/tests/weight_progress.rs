mod common;

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use common::*;
use trainyard_core::lifecycle::JobState;
use trainyard_core::types::JobId;
use trainyard_core::weight::WeightState;
use trainyard_engine::{EngineError, PollConfig, WeightProgressService};

fn service(h: &Harness, iterations: u32) -> Arc<WeightProgressService> {
    Arc::new(WeightProgressService::new(
        Arc::clone(&h.scheduler),
        PollConfig {
            max_wait_iterations: iterations,
            poll_interval: Duration::from_millis(10),
        },
    ))
}

async fn wait_for_download(h: &Harness, id: JobId) {
    wait_until("download to start", || {
        h.scheduler
            .weight_status(id)
            .unwrap()
            .is_some_and(|w| w.state() == WeightState::Downloading)
    })
    .await;
}

#[tokio::test]
async fn job_without_pretrained_weight_reports_complete() {
    let h = harness(1, FakeBackend::new(1));
    let id = h.scheduler.submit(training("voc", 1)).await.unwrap();

    assert_eq!(service(&h, 1).poll(id, 0).await.unwrap(), Some(100));
    wait_for_exit(&h.scheduler, id).await;
}

#[tokio::test]
async fn poll_returns_once_the_threshold_is_passed() {
    let fetcher = Arc::new(ScriptedFetcher::new(vec![20, 60]));
    let h = harness_with(test_config(1), FakeBackend::new(1), fetcher.clone());
    let id = h
        .scheduler
        .submit(training_with_weight("voc", 1))
        .await
        .unwrap();
    wait_for_download(&h, id).await;

    let svc = service(&h, 1000);
    let waiting = Arc::clone(&svc);
    let poll = tokio::spawn(async move { waiting.poll(id, 0).await });
    fetcher.release(1);
    assert_eq!(within(poll).await.unwrap().unwrap(), Some(20));

    let waiting = Arc::clone(&svc);
    let poll = tokio::spawn(async move { waiting.poll(id, 50).await });
    fetcher.release(1);
    assert_eq!(within(poll).await.unwrap().unwrap(), Some(60));

    // Nothing further until the last chunk lands.
    assert_eq!(service(&h, 5).poll(id, 60).await.unwrap(), None);

    fetcher.release(1);
    assert_eq!(within(svc.poll(id, 60)).await.unwrap(), Some(100));
    wait_for_exit(&h.scheduler, id).await;
}

#[tokio::test]
async fn ended_job_reports_its_last_percentage() {
    let fetcher = Arc::new(ScriptedFetcher::new(vec![35, 70]));
    let h = harness_with(test_config(1), FakeBackend::new(1), fetcher.clone());
    let id = h
        .scheduler
        .submit(training_with_weight("voc", 1))
        .await
        .unwrap();
    wait_for_download(&h, id).await;
    fetcher.release(1);
    wait_until("35%", || {
        h.scheduler.weight_status(id).unwrap().map(|w| w.percentage()) == Some(35)
    })
    .await;

    let scheduler = Arc::clone(&h.scheduler);
    let stop = tokio::spawn(async move { scheduler.stop(id).await });
    wait_for_state(&h.scheduler, id, JobState::Stopping).await;
    fetcher.release(1);
    within(stop).await.unwrap().unwrap();

    let percentage = within(service(&h, 1000).poll(id, 90)).await.unwrap();
    assert_matches!(percentage, Some(p) if p == 35 || p == 70);
}

#[tokio::test]
async fn unknown_job_is_not_found() {
    let h = harness(1, FakeBackend::new(1));
    let id = JobId::new();
    assert_matches!(service(&h, 1).poll(id, 0).await, Err(EngineError::NotFound(x)) if x == id);
}
