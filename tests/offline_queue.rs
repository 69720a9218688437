//! Offline queue replay through the background worker.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};

use resilient_client::config::{ResilienceConfig, StorageBackend};
use resilient_client::queue::{DropReason, EnqueueOptions, ExecutionOutcome, ExecutorResult, Priority};
use resilient_client::AppContext;

mod common;
use common::{eventually, test_config};

fn offline_config() -> ResilienceConfig {
    test_config("ws://127.0.0.1:1/graphql", None)
}

/// Executor that records payloads and succeeds.
fn recorder(log: &Arc<Mutex<Vec<Value>>>) -> impl Fn(Value) -> std::future::Ready<ExecutorResult> + Send + Sync + 'static {
    let log = Arc::clone(log);
    move |payload| {
        log.lock().unwrap().push(payload);
        std::future::ready(Ok(json!({"ok": true})))
    }
}

#[tokio::test]
async fn test_online_call_executes_immediately() {
    let ctx = AppContext::new(offline_config()).unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));

    let outcome = ctx
        .queue
        .execute_or_enqueue("castVote", json!({"vote": 1}), recorder(&log), EnqueueOptions::default())
        .await
        .unwrap();

    assert_eq!(outcome, ExecutionOutcome::Executed(json!({"ok": true})));
    assert!(ctx.queue.is_empty());
    assert_eq!(log.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_offline_operations_replay_in_priority_order() {
    let ctx = AppContext::new(offline_config()).unwrap();
    ctx.connectivity.set_connected(false);
    ctx.start().await.unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));

    for (n, priority) in [(1, Priority::Low), (2, Priority::Medium), (3, Priority::High), (4, Priority::Medium)] {
        let outcome = ctx
            .queue
            .execute_or_enqueue(
                "castVote",
                json!({"n": n}),
                recorder(&log),
                EnqueueOptions::default().priority(priority).room("room-1"),
            )
            .await
            .unwrap();
        assert!(matches!(outcome, ExecutionOutcome::Queued { .. }));
    }
    assert_eq!(ctx.queue.pending_for_room("room-1").len(), 4);
    assert!(log.lock().unwrap().is_empty());

    let stats = ctx.queue.stats();
    assert_eq!((stats.total, stats.high, stats.medium, stats.low), (4, 1, 2, 1));

    ctx.connectivity.set_connected(true);
    assert!(eventually(|| ctx.queue.is_empty()).await);

    let order: Vec<i64> = log
        .lock()
        .unwrap()
        .iter()
        .map(|payload| payload["n"].as_i64().unwrap())
        .collect();
    assert_eq!(order, vec![3, 2, 4, 1]);

    ctx.stop().await;
}

#[tokio::test]
async fn test_queue_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = offline_config();
    config.storage.backend = StorageBackend::File;
    config.storage.directory = dir.path().to_string_lossy().into_owned();

    {
        let ctx = AppContext::new(config.clone()).unwrap();
        ctx.connectivity.set_connected(false);
        ctx.queue
            .enqueue("castVote", json!({"n": 1}), EnqueueOptions::default())
            .await
            .unwrap();
        ctx.queue
            .enqueue("sendMessage", json!({"text": "hi"}), EnqueueOptions::default().priority(Priority::High))
            .await
            .unwrap();
    }

    let ctx = AppContext::new(config).unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));
    ctx.queue.executors().register("castVote", recorder(&log));
    ctx.queue.executors().register("sendMessage", recorder(&log));
    ctx.start().await.unwrap();

    assert!(eventually(|| log.lock().unwrap().len() == 2).await);
    assert_eq!(log.lock().unwrap()[0], json!({"text": "hi"}));
    assert!(eventually(|| ctx.queue.is_empty()).await);
    ctx.stop().await;
}

#[tokio::test]
async fn test_failing_operation_dropped_after_retries() {
    let ctx = AppContext::new(offline_config()).unwrap();
    let mut dropped = ctx.queue.subscribe_dropped();
    ctx.connectivity.set_connected(false);
    ctx.start().await.unwrap();

    let outcome = ctx
        .queue
        .execute_or_enqueue(
            "castVote",
            json!({"n": 1}),
            |_| async { Err::<Value, _>("backend rejected vote".to_string()) },
            EnqueueOptions::default().max_retries(2),
        )
        .await
        .unwrap();
    assert!(matches!(outcome, ExecutionOutcome::Queued { .. }));

    ctx.connectivity.set_connected(true);
    let dropped = tokio::time::timeout(Duration::from_secs(5), dropped.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(dropped.reason, DropReason::RetriesExhausted);
    assert_eq!(dropped.operation.retry_count, 2);
    assert_eq!(dropped.last_error.as_deref(), Some("backend rejected vote"));
    assert!(ctx.queue.is_empty());

    ctx.stop().await;
}

#[tokio::test]
async fn test_expired_operation_is_not_replayed() {
    let ctx = AppContext::new(offline_config()).unwrap();
    let mut dropped = ctx.queue.subscribe_dropped();
    ctx.connectivity.set_connected(false);
    ctx.start().await.unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));

    ctx.queue
        .execute_or_enqueue(
            "typing",
            json!({"room": "room-1"}),
            recorder(&log),
            EnqueueOptions::default().expires_in(Duration::from_millis(10)),
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;

    ctx.connectivity.set_connected(true);
    let dropped = tokio::time::timeout(Duration::from_secs(5), dropped.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(dropped.reason, DropReason::Expired);
    assert!(log.lock().unwrap().is_empty());

    ctx.stop().await;
}

#[tokio::test]
async fn test_connectivity_loss_interrupts_drain() {
    let mut config = offline_config();
    config.queue.drain_item_delay_ms = 50;
    let ctx = Arc::new(AppContext::new(config).unwrap());
    ctx.connectivity.set_connected(false);

    let log = Arc::new(Mutex::new(Vec::new()));
    ctx.queue.executors().register("castVote", recorder(&log));
    for n in 0..3 {
        ctx.queue
            .enqueue("castVote", json!({"n": n}), EnqueueOptions::default())
            .await
            .unwrap();
    }

    ctx.connectivity.set_connected(true);
    let drain = {
        let ctx = Arc::clone(&ctx);
        tokio::spawn(async move { ctx.queue.drain().await })
    };
    assert!(eventually(|| log.lock().unwrap().len() == 1).await);
    ctx.connectivity.set_connected(false);

    let report = drain.await.unwrap();
    assert!(report.interrupted);
    assert_eq!(report.succeeded, 1);
    assert_eq!(ctx.queue.len(), 2);
}
