//! Integration tests for the batch coordinator.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use assert_matches::assert_matches;
use duat_scheduler::{BatchJob, BatchOutcome, SchedulerError, SchedulerEvent};

use common::{drain_events, request, start, test_config, MockBackend};

// ---------------------------------------------------------------------------
// Test: succeeded + failed always covers every request
// ---------------------------------------------------------------------------

#[tokio::test]
async fn outcome_accounts_for_every_request() {
    let dir = tempfile::tempdir().unwrap();
    let backend = MockBackend::new(2);
    let scheduler = start(test_config(dir.path(), 2), &backend);

    let calls = Arc::new(AtomicUsize::new(0));
    let seen: Arc<Mutex<Option<BatchOutcome>>> = Arc::new(Mutex::new(None));
    let job = BatchJob::new(
        "pantheon",
        vec![
            request("Ra"),
            request("fail-submit Set"),
            request("Isis"),
            request("fail-fetch Apep"),
            request("Osiris"),
        ],
    )
    .with_concurrency_limit(3)
    .on_complete({
        let calls = Arc::clone(&calls);
        let seen = Arc::clone(&seen);
        move |outcome| {
            calls.fetch_add(1, Ordering::SeqCst);
            *seen.lock().unwrap() = Some(outcome.clone());
        }
    });

    let outcome = scheduler.run_batch(job).await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let seen = seen.lock().unwrap().clone().expect("callback should have fired");
    assert_eq!(seen.total(), 5);
    assert_eq!(seen.succeeded.len(), 3);
    assert_eq!(seen.failed.len(), 2);
    assert_eq!(outcome.succeeded, seen.succeeded);
    assert_eq!(outcome.batch_name, "pantheon");
    assert!(outcome.finished_at >= outcome.started_at);
}

// ---------------------------------------------------------------------------
// Test: one failure does not stop its siblings
// ---------------------------------------------------------------------------

#[tokio::test]
async fn failed_request_does_not_abort_siblings() {
    let dir = tempfile::tempdir().unwrap();
    let backend = MockBackend::new(1);
    let scheduler = start(test_config(dir.path(), 2), &backend);

    let job = BatchJob::new(
        "trio",
        vec![request("Horus"), request("fail-submit Set"), request("Thoth")],
    );
    let outcome = scheduler.run_batch(job).await.unwrap();

    assert_eq!(
        outcome.succeeded.keys().cloned().collect::<Vec<_>>(),
        vec!["Horus", "Thoth"],
    );
    assert_eq!(outcome.failed, vec!["fail-submit Set"]);
    assert_eq!(
        outcome.succeeded["Horus"],
        dir.path().join("horus_anim.gif"),
    );
    assert!(outcome.succeeded["Thoth"].exists());
}

// ---------------------------------------------------------------------------
// Test: the batch limit applies under a larger global ceiling
// ---------------------------------------------------------------------------

#[tokio::test]
async fn batch_limit_bounds_its_own_requests() {
    let dir = tempfile::tempdir().unwrap();
    let backend = MockBackend::new(3);
    let scheduler = start(test_config(dir.path(), 4), &backend);

    let requests = (0..5).map(|i| request(&format!("scarab {i}"))).collect();
    let outcome = scheduler
        .run_batch(BatchJob::new("serial", requests).with_concurrency_limit(1))
        .await
        .unwrap();

    assert_eq!(outcome.succeeded.len(), 5);
    assert_eq!(backend.max_in_flight(), 1);
}

#[tokio::test]
async fn batch_uses_config_limit_by_default() {
    let dir = tempfile::tempdir().unwrap();
    let backend = MockBackend::new(3);
    let mut config = test_config(dir.path(), 4);
    config.batch_concurrency_limit = 2;
    let scheduler = start(config, &backend);

    let requests = (0..6).map(|i| request(&format!("ankh {i}"))).collect();
    let outcome = scheduler.run_batch(BatchJob::new("default", requests)).await.unwrap();

    assert_eq!(outcome.succeeded.len(), 6);
    assert!(backend.max_in_flight() <= 2);
}

// ---------------------------------------------------------------------------
// Test: validation happens before anything is enqueued
// ---------------------------------------------------------------------------

#[tokio::test]
async fn duplicate_names_reject_the_batch() {
    let dir = tempfile::tempdir().unwrap();
    let backend = MockBackend::new(1);
    let scheduler = start(test_config(dir.path(), 2), &backend);

    let called = Arc::new(AtomicUsize::new(0));
    let job = BatchJob::new("dupes", vec![request("Ra"), request("Ra")]).on_complete({
        let called = Arc::clone(&called);
        move |_| {
            called.fetch_add(1, Ordering::SeqCst);
        }
    });

    assert_matches!(scheduler.run_batch(job).await, Err(SchedulerError::Validation(_)));
    assert_eq!(called.load(Ordering::SeqCst), 0);
    assert!(backend.submitted().is_empty());
}

#[tokio::test]
async fn names_differing_only_in_case_reject_the_batch() {
    let dir = tempfile::tempdir().unwrap();
    let backend = MockBackend::new(1);
    let scheduler = start(test_config(dir.path(), 2), &backend);

    let job = BatchJob::new("echoes", vec![request("Ra"), request("ra")]);

    assert_matches!(
        scheduler.run_batch(job).await,
        Err(SchedulerError::Validation(msg)) if msg.contains("'ra'")
    );
    assert!(backend.submitted().is_empty());
    assert!(!dir.path().join("ra_anim.gif").exists());
}

#[tokio::test]
async fn zero_limit_rejects_the_batch() {
    let dir = tempfile::tempdir().unwrap();
    let backend = MockBackend::new(1);
    let scheduler = start(test_config(dir.path(), 2), &backend);

    let job = BatchJob::new("stalled", vec![request("Ra")]).with_concurrency_limit(0);
    assert_matches!(scheduler.run_batch(job).await, Err(SchedulerError::Validation(_)));
}

#[tokio::test]
async fn invalid_request_counts_as_failed() {
    let dir = tempfile::tempdir().unwrap();
    let backend = MockBackend::new(1);
    let scheduler = start(test_config(dir.path(), 2), &backend);

    let mut bad = request("Nephthys");
    bad.params.width = 0;
    let outcome = scheduler
        .run_batch(BatchJob::new("mixed", vec![request("Bes"), bad]))
        .await
        .unwrap();

    assert_eq!(outcome.succeeded.len(), 1);
    assert_eq!(outcome.failed, vec!["Nephthys"]);
}

// ---------------------------------------------------------------------------
// Test: empty batches and events
// ---------------------------------------------------------------------------

#[tokio::test]
async fn empty_batch_still_calls_back() {
    let dir = tempfile::tempdir().unwrap();
    let backend = MockBackend::new(1);
    let scheduler = start(test_config(dir.path(), 2), &backend);

    let called = Arc::new(AtomicUsize::new(0));
    let job = BatchJob::new("nothing", Vec::new()).on_complete({
        let called = Arc::clone(&called);
        move |outcome| {
            assert_eq!(outcome.total(), 0);
            called.fetch_add(1, Ordering::SeqCst);
        }
    });

    scheduler.run_batch(job).await.unwrap();
    assert_eq!(called.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn batch_finished_event_is_published() {
    let dir = tempfile::tempdir().unwrap();
    let backend = MockBackend::new(1);
    let scheduler = start(test_config(dir.path(), 2), &backend);
    let mut events = scheduler.subscribe();

    scheduler
        .run_batch(BatchJob::new("heralds", vec![request("Wepwawet"), request("fail-submit Ammit")]))
        .await
        .unwrap();

    let finished = drain_events(&mut events)
        .into_iter()
        .find_map(|event| match event {
            SchedulerEvent::BatchFinished {
                batch_name,
                succeeded,
                failed,
            } => Some((batch_name, succeeded, failed)),
            _ => None,
        });
    assert_eq!(finished, Some(("heralds".to_string(), 1, 1)));
}

#[tokio::test]
async fn report_round_trips_through_disk() {
    let dir = tempfile::tempdir().unwrap();
    let backend = MockBackend::new(1);
    let scheduler = start(test_config(&dir.path().join("out"), 2), &backend);

    let outcome = scheduler
        .run_batch(BatchJob::new("report", vec![request("Maat")]))
        .await
        .unwrap();
    let report = dir.path().join("report.json");
    outcome.write_report(&report).unwrap();

    let json: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(report).unwrap()).unwrap();
    assert_eq!(json["batch_name"], "report");
    assert!(json["succeeded"]["Maat"]
        .as_str()
        .unwrap()
        .ends_with("maat_anim.gif"));
}
