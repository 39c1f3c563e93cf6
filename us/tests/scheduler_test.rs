//! Integration tests for the upload scheduler
//!
//! These drive the public API end to end with scripted processors.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::{Semaphore, mpsc};

use uploadsched::domain::{JobRecord, JobSnapshot, JobStatus, Payload, Priority};
use uploadsched::events::{EventKind, JobEvent};
use uploadsched::scheduler::{
    ConflictDecision, ConflictPredicate, ConflictResolution, HealthStatus, JobContext, JobFilter, JobProcessor, JobRequest,
    ProcessorError, Scheduler, SchedulerConfig, SchedulerError, processor_fn,
};

// =============================================================================
// Helpers
// =============================================================================

/// Processor driven by payload metadata
///
/// - `{"hold": true}` blocks until the gate opens
/// - `{"fail": true}` always fails
/// - `{"fail_until": n}` fails attempts below n
/// - anything else succeeds at once
#[derive(Clone)]
struct Scripted {
    calls: Arc<AtomicU32>,
    started: Arc<std::sync::Mutex<Vec<String>>>,
    gate: Arc<Semaphore>,
}

impl Scripted {
    fn new() -> Self {
        Self {
            calls: Arc::new(AtomicU32::new(0)),
            started: Arc::new(std::sync::Mutex::new(Vec::new())),
            gate: Arc::new(Semaphore::new(0)),
        }
    }

    fn open_gate(&self) {
        self.gate.add_permits(1_000);
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn started(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }

    fn calls_for(&self, id: &str) -> usize {
        self.started().iter().filter(|s| *s == id).count()
    }

    fn processor(&self) -> Arc<dyn JobProcessor> {
        let script = self.clone();
        processor_fn(move |ctx: JobContext| {
            let script = script.clone();
            async move {
                script.calls.fetch_add(1, Ordering::SeqCst);
                script.started.lock().unwrap().push(ctx.job_id.clone());

                let meta = &ctx.payload.metadata;
                if meta["hold"] == true {
                    let _permit = script
                        .gate
                        .acquire()
                        .await
                        .map_err(|e| ProcessorError::failed(e.to_string()))?;
                }
                if meta["fail"] == true {
                    return Err(ProcessorError::failed(format!("row 7: bad price on attempt {}", ctx.attempt)));
                }
                if meta["fail_until"].as_u64().is_some_and(|until| u64::from(ctx.attempt) < until) {
                    return Err(ProcessorError::failed(format!("flaky storage on attempt {}", ctx.attempt)));
                }
                Ok(json!({ "job": ctx.job_id, "attempt": ctx.attempt }))
            }
        })
    }
}

fn fast_config() -> SchedulerConfig {
    SchedulerConfig {
        base_retry_delay_ms: 5,
        max_retry_delay_ms: 20,
        ..Default::default()
    }
}

fn scheduler_with(config: SchedulerConfig, script: &Scripted) -> Scheduler {
    Scheduler::new(config, script.processor()).expect("valid config")
}

fn job(id: &str, group: &str, meta: Value) -> JobRequest {
    JobRequest::new(Payload::from_metadata(meta), group).with_id(id)
}

fn held(id: &str, group: &str) -> JobRequest {
    job(id, group, json!({ "hold": true }))
}

fn quick(id: &str, group: &str) -> JobRequest {
    job(id, group, json!({ "ok": true }))
}

async fn wait_for_status(scheduler: &Scheduler, id: &str, status: JobStatus) -> JobSnapshot {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(snapshot) = scheduler.status(id).await.filter(|s| s.status == status) {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {} to reach {}", id, status))
}

fn drain(rx: &mut mpsc::UnboundedReceiver<JobEvent>) -> Vec<JobEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn event_types_for(events: &[JobEvent], id: &str) -> Vec<&'static str> {
    events
        .iter()
        .filter(|e| e.job_id == id)
        .map(|e| e.event_type())
        .collect()
}

// =============================================================================
// Ordering and concurrency
// =============================================================================

#[tokio::test]
async fn test_priority_ordering() {
    let script = Scripted::new();
    let scheduler = scheduler_with(
        SchedulerConfig {
            max_concurrent_total: 1,
            ..fast_config()
        },
        &script,
    );

    scheduler.submit(held("blocker", "g0")).await.unwrap();
    scheduler
        .submit(quick("low", "g1").with_priority(Priority::Low))
        .await
        .unwrap();
    scheduler
        .submit(quick("high", "g2").with_priority(Priority::High))
        .await
        .unwrap();
    scheduler
        .submit(quick("normal", "g3").with_priority(Priority::Normal))
        .await
        .unwrap();

    assert_eq!(scheduler.queued_ids().await, vec!["high", "normal", "low"]);

    script.open_gate();
    scheduler.wait_idle().await;
    assert_eq!(script.started(), vec!["blocker", "high", "normal", "low"]);
}

#[tokio::test]
async fn test_fifo_within_priority_band() {
    let script = Scripted::new();
    let scheduler = scheduler_with(
        SchedulerConfig {
            max_concurrent_total: 1,
            ..fast_config()
        },
        &script,
    );

    scheduler.submit(held("blocker", "g")).await.unwrap();
    for id in ["a", "b", "c"] {
        scheduler.submit(quick(id, id)).await.unwrap();
    }
    let receipt = scheduler
        .submit(quick("urgent", "u").with_priority(Priority::Urgent))
        .await
        .unwrap();
    assert_eq!(receipt.position, Some(1));

    script.open_gate();
    scheduler.wait_idle().await;
    assert_eq!(script.started(), vec!["blocker", "urgent", "a", "b", "c"]);
}

#[tokio::test]
async fn test_concurrency_bound() {
    let script = Scripted::new();
    let scheduler = scheduler_with(
        SchedulerConfig {
            max_concurrent_total: 3,
            ..fast_config()
        },
        &script,
    );

    for i in 0..5 {
        scheduler.submit(held(&format!("job-{}", i), "supplier-1")).await.unwrap();
    }

    assert_eq!(scheduler.list(JobFilter::status(JobStatus::Processing)).await.len(), 3);
    assert_eq!(scheduler.list(JobFilter::status(JobStatus::Queued)).await.len(), 2);

    let stats = scheduler.statistics().await;
    assert_eq!(stats.processing.total, 3);
    assert_eq!(stats.queue.waiting, 2);

    script.open_gate();
    scheduler.wait_idle().await;

    assert_eq!(scheduler.list(JobFilter::status(JobStatus::Completed)).await.len(), 5);
    assert_eq!(scheduler.statistics().await.processing.peak, 3);
}

#[tokio::test]
async fn test_per_group_cap_skips_blocked_group() {
    let script = Scripted::new();
    let scheduler = scheduler_with(
        SchedulerConfig {
            max_concurrent_total: 3,
            max_concurrent_per_group: Some(1),
            ..fast_config()
        },
        &script,
    );

    let a1 = scheduler.submit(held("a1", "supplier-a")).await.unwrap();
    let a2 = scheduler.submit(held("a2", "supplier-a")).await.unwrap();
    let b1 = scheduler.submit(held("b1", "supplier-b")).await.unwrap();

    assert_eq!(a1.status, JobStatus::Processing);
    assert_eq!(a2.status, JobStatus::Queued);
    assert_eq!(b1.status, JobStatus::Processing);

    let stats = scheduler.statistics().await;
    assert_eq!(stats.processing.by_group.get("supplier-a"), Some(&1));
    assert_eq!(stats.processing.by_group.get("supplier-b"), Some(&1));

    script.open_gate();
    scheduler.wait_idle().await;
    assert_eq!(scheduler.statistics().await.processing.peak, 2);
}

// =============================================================================
// Retry
// =============================================================================

#[tokio::test]
async fn test_retry_exhaustion() {
    let script = Scripted::new();
    let scheduler = scheduler_with(
        SchedulerConfig {
            retry_attempts: 2,
            ..fast_config()
        },
        &script,
    );
    let mut rx = scheduler.subscribe();

    scheduler
        .submit(job("doomed", "supplier-1", json!({ "fail": true })))
        .await
        .unwrap();
    let err = scheduler.wait("doomed").await.unwrap_err();

    assert_eq!(script.calls(), 3);
    match err {
        SchedulerError::Processor {
            id,
            source: ProcessorError::Failed { message },
        } => {
            assert_eq!(id, "doomed");
            assert_eq!(message, "row 7: bad price on attempt 3");
        }
        other => panic!("unexpected error: {:?}", other),
    }

    let snapshot = scheduler.status("doomed").await.unwrap();
    assert_eq!(snapshot.status, JobStatus::Failed);
    assert_eq!(snapshot.attempt, 3);
    assert_eq!(snapshot.retries, 2);
    assert_eq!(snapshot.error.as_deref(), Some("row 7: bad price on attempt 3"));

    let types = event_types_for(&drain(&mut rx), "doomed");
    assert_eq!(types.iter().filter(|t| **t == "retry_scheduled").count(), 2);
    assert_eq!(types.last(), Some(&"failed"));
}

#[tokio::test]
async fn test_retry_success() {
    let script = Scripted::new();
    let scheduler = scheduler_with(fast_config(), &script);
    let mut rx = scheduler.subscribe();

    scheduler
        .submit(job("flaky", "supplier-1", json!({ "fail_until": 3 })))
        .await
        .unwrap();
    let result = scheduler.wait("flaky").await.unwrap();
    assert_eq!(result["attempt"], 3);

    let snapshot = scheduler.status("flaky").await.unwrap();
    assert_eq!(snapshot.status, JobStatus::Completed);
    assert_eq!(snapshot.attempt, 3);

    let events = drain(&mut rx);
    let retries: Vec<u32> = events
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::RetryScheduled { attempt, .. } => Some(*attempt),
            _ => None,
        })
        .collect();
    assert_eq!(retries, vec![1, 2]);
    assert_eq!(event_types_for(&events, "flaky").last(), Some(&"completed"));
}

#[tokio::test]
async fn test_backoff_delays_in_events() {
    let script = Scripted::new();
    let scheduler = scheduler_with(
        SchedulerConfig {
            retry_attempts: 3,
            base_retry_delay_ms: 5,
            max_retry_delay_ms: 12,
            ..Default::default()
        },
        &script,
    );
    let mut rx = scheduler.subscribe();

    scheduler
        .submit(job("doomed", "g", json!({ "fail": true })))
        .await
        .unwrap();
    let _ = scheduler.wait("doomed").await;

    let delays: Vec<u64> = drain(&mut rx)
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::RetryScheduled { delay_ms, .. } => Some(*delay_ms),
            _ => None,
        })
        .collect();
    assert_eq!(delays, vec![5, 10, 12]);
}

#[tokio::test]
async fn test_timeout_counts_as_failure() {
    let script = Scripted::new();
    let scheduler = scheduler_with(
        SchedulerConfig {
            retry_attempts: 0,
            ..fast_config()
        },
        &script,
    );

    scheduler
        .submit(held("slow", "supplier-1").with_timeout(Duration::from_millis(30)))
        .await
        .unwrap();
    let err = scheduler.wait("slow").await.unwrap_err();
    assert!(matches!(
        err,
        SchedulerError::Processor {
            source: ProcessorError::Timeout { .. },
            ..
        }
    ));

    let snapshot = scheduler.status("slow").await.unwrap();
    assert_eq!(snapshot.status, JobStatus::Failed);
    assert!(snapshot.error.unwrap().contains("Timed out"));
    assert_eq!(scheduler.statistics().await.processing.total, 0);
}

#[tokio::test]
async fn test_panic_is_retried() {
    let processor = processor_fn(|ctx: JobContext| async move {
        if ctx.attempt == 1 {
            panic!("parser exploded");
        }
        Ok::<_, ProcessorError>(json!({ "attempt": ctx.attempt }))
    });
    let scheduler = Scheduler::new(fast_config(), processor).unwrap();
    let mut rx = scheduler.subscribe();

    scheduler.submit(quick("fragile", "g")).await.unwrap();
    let result = scheduler.wait("fragile").await.unwrap();
    assert_eq!(result["attempt"], 2);

    let retry_error = drain(&mut rx).into_iter().find_map(|e| match e.kind {
        EventKind::RetryScheduled { error, .. } => Some(error),
        _ => None,
    });
    assert_eq!(retry_error.as_deref(), Some("Processor panicked: parser exploded"));
}

// =============================================================================
// Cancellation
// =============================================================================

#[tokio::test]
async fn test_cancel_before_start() {
    let script = Scripted::new();
    let scheduler = scheduler_with(
        SchedulerConfig {
            max_concurrent_total: 1,
            ..fast_config()
        },
        &script,
    );

    scheduler.submit(held("blocker", "g")).await.unwrap();
    let receipt = scheduler.submit(quick("victim", "g")).await.unwrap();
    assert_eq!(receipt.status, JobStatus::Queued);

    let outcome = scheduler.cancel("victim").await.unwrap();
    assert!(outcome.success);
    assert_eq!(outcome.status, JobStatus::Cancelled);
    assert!(matches!(
        scheduler.wait("victim").await,
        Err(SchedulerError::Cancelled { .. })
    ));

    script.open_gate();
    scheduler.wait_idle().await;
    assert_eq!(script.calls_for("victim"), 0);
    assert!(scheduler.queued_ids().await.is_empty());

    // Terminal jobs can't be cancelled again
    let again = scheduler.cancel("victim").await.unwrap();
    assert!(!again.success);
    assert_eq!(again.status, JobStatus::Cancelled);
}

#[tokio::test]
async fn test_cancel_during_processing() {
    let script = Scripted::new();
    let scheduler = scheduler_with(fast_config(), &script);
    let mut rx = scheduler.subscribe();

    scheduler.submit(held("running", "g")).await.unwrap();
    let outcome = scheduler.cancel("running").await.unwrap();
    assert!(outcome.success);
    assert_eq!(outcome.status, JobStatus::Processing);

    let snapshot = scheduler.status("running").await.unwrap();
    assert_eq!(snapshot.status, JobStatus::Processing);
    assert!(snapshot.cancel_requested);
    assert_eq!(scheduler.statistics().await.processing.total, 1);

    // Processor succeeds anyway
    script.open_gate();
    assert!(matches!(
        scheduler.wait("running").await,
        Err(SchedulerError::Cancelled { .. })
    ));

    let snapshot = scheduler.status("running").await.unwrap();
    assert_eq!(snapshot.status, JobStatus::Cancelled);
    assert!(snapshot.result.is_none());

    let types = event_types_for(&drain(&mut rx), "running");
    assert_eq!(types, vec!["queued", "started", "cancel_requested", "cancelled"]);
}

#[tokio::test]
async fn test_cancel_retry_scheduled_stops_timer() {
    let script = Scripted::new();
    let scheduler = scheduler_with(
        SchedulerConfig {
            base_retry_delay_ms: 200,
            max_retry_delay_ms: 200,
            ..Default::default()
        },
        &script,
    );

    scheduler
        .submit(job("flaky", "g", json!({ "fail": true })))
        .await
        .unwrap();
    wait_for_status(&scheduler, "flaky", JobStatus::RetryScheduled).await;

    let outcome = scheduler.cancel("flaky").await.unwrap();
    assert!(outcome.success);
    assert_eq!(outcome.status, JobStatus::Cancelled);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(script.calls(), 1);
    assert_eq!(scheduler.status("flaky").await.unwrap().status, JobStatus::Cancelled);
}

// =============================================================================
// Conflicts
// =============================================================================

#[tokio::test]
async fn test_conflict_replace() {
    let script = Scripted::new();
    let scheduler = scheduler_with(
        SchedulerConfig {
            max_concurrent_per_group: Some(1),
            ..fast_config()
        },
        &script,
    );

    scheduler.submit(held("a", "supplier-x")).await.unwrap();
    let receipt = scheduler
        .submit(quick("b", "supplier-x").with_conflict_resolution(ConflictResolution::Replace))
        .await
        .unwrap();
    assert_eq!(receipt.conflicts_with, vec!["a"]);
    assert_eq!(receipt.status, JobStatus::Queued);

    let a = scheduler.status("a").await.unwrap();
    assert!(a.cancel_requested);

    script.open_gate();
    assert!(matches!(scheduler.wait("a").await, Err(SchedulerError::Cancelled { .. })));
    assert!(scheduler.wait("b").await.is_ok());
}

#[tokio::test]
async fn test_conflict_replace_cancels_queued() {
    let script = Scripted::new();
    let scheduler = scheduler_with(
        SchedulerConfig {
            max_concurrent_total: 1,
            ..fast_config()
        },
        &script,
    );

    scheduler.submit(held("blocker", "other")).await.unwrap();
    scheduler.submit(quick("old", "supplier-x")).await.unwrap();
    scheduler
        .submit(quick("new", "supplier-x").with_conflict_resolution(ConflictResolution::Replace))
        .await
        .unwrap();

    assert_eq!(scheduler.status("old").await.unwrap().status, JobStatus::Cancelled);
    assert_eq!(scheduler.queued_ids().await, vec!["new"]);

    script.open_gate();
    scheduler.wait_idle().await;
    assert_eq!(script.calls_for("old"), 0);
}

#[tokio::test]
async fn test_conflict_reject_and_resolve() {
    let script = Scripted::new();
    let scheduler = scheduler_with(fast_config(), &script);

    scheduler.submit(held("a", "supplier-x")).await.unwrap();

    let receipt = scheduler
        .submit(quick("b", "supplier-x").with_conflict_resolution(ConflictResolution::Reject))
        .await
        .unwrap();
    assert_eq!(receipt.status, JobStatus::Conflict);
    assert_eq!(receipt.conflicts_with, vec!["a"]);
    assert!(matches!(
        scheduler.wait("b").await,
        Err(SchedulerError::Conflict { conflicting_with, .. }) if conflicting_with == vec!["a".to_string()]
    ));

    // Different group: no conflict
    let other = scheduler
        .submit(quick("c", "supplier-y").with_conflict_resolution(ConflictResolution::Reject))
        .await
        .unwrap();
    assert_ne!(other.status, JobStatus::Conflict);

    let outcome = scheduler.resolve_conflict("b", ConflictDecision::Proceed).await.unwrap();
    assert!(outcome.success);
    assert!(matches!(outcome.status, JobStatus::Queued | JobStatus::Processing));

    let again = scheduler.resolve_conflict("b", ConflictDecision::Proceed).await.unwrap();
    assert!(!again.success);

    script.open_gate();
    assert!(scheduler.wait("b").await.is_ok());
    assert!(scheduler.wait("a").await.is_ok());
}

#[tokio::test]
async fn test_conflict_cancel_existing_and_cancel_new() {
    let script = Scripted::new();
    let scheduler = scheduler_with(fast_config(), &script);

    scheduler.submit(held("a", "supplier-x")).await.unwrap();
    let reject = ConflictResolution::Reject;
    scheduler
        .submit(quick("b", "supplier-x").with_conflict_resolution(reject))
        .await
        .unwrap();
    scheduler
        .submit(quick("c", "supplier-x").with_conflict_resolution(reject))
        .await
        .unwrap();

    let outcome = scheduler.resolve_conflict("c", ConflictDecision::CancelNew).await.unwrap();
    assert!(outcome.success);
    assert_eq!(outcome.status, JobStatus::Cancelled);

    let outcome = scheduler
        .resolve_conflict("b", ConflictDecision::CancelExisting)
        .await
        .unwrap();
    assert!(outcome.success);
    assert!(scheduler.status("a").await.unwrap().cancel_requested);

    script.open_gate();
    assert!(scheduler.wait("b").await.is_ok());
    assert!(matches!(scheduler.wait("a").await, Err(SchedulerError::Cancelled { .. })));
}

#[tokio::test]
async fn test_conflict_predicate_narrows() {
    let script = Scripted::new();
    let scheduler = scheduler_with(fast_config(), &script);

    scheduler
        .submit(job("v1", "supplier-x", json!({ "hold": true, "version": 1 })))
        .await
        .unwrap();

    let same_version: ConflictPredicate =
        Arc::new(|new: &JobRecord, old: &JobRecord| new.metadata()["version"] == old.metadata()["version"]);

    let receipt = scheduler
        .submit(
            job("v2", "supplier-x", json!({ "version": 2 }))
                .with_conflict_resolution(ConflictResolution::Reject)
                .with_conflict_predicate(same_version.clone()),
        )
        .await
        .unwrap();
    assert_ne!(receipt.status, JobStatus::Conflict);

    let receipt = scheduler
        .submit(
            job("v1-again", "supplier-x", json!({ "version": 1 }))
                .with_conflict_resolution(ConflictResolution::Reject)
                .with_conflict_predicate(same_version),
        )
        .await
        .unwrap();
    assert_eq!(receipt.status, JobStatus::Conflict);

    script.open_gate();
    scheduler.wait_idle().await;
}

#[tokio::test]
async fn test_default_queue_policy_admits_conflicts() {
    let script = Scripted::new();
    let scheduler = scheduler_with(fast_config(), &script);

    scheduler.submit(held("a", "supplier-x")).await.unwrap();
    let receipt = scheduler.submit(held("b", "supplier-x")).await.unwrap();
    assert_eq!(receipt.status, JobStatus::Processing);
    assert!(receipt.conflicts_with.is_empty());

    script.open_gate();
    scheduler.wait_idle().await;
}

// =============================================================================
// Requeue, progress, backpressure
// =============================================================================

#[tokio::test]
async fn test_requeue_failed_job() {
    let script = Scripted::new();
    let scheduler = scheduler_with(
        SchedulerConfig {
            retry_attempts: 1,
            ..fast_config()
        },
        &script,
    );

    scheduler
        .submit(job("j", "g", json!({ "fail_until": 3 })))
        .await
        .unwrap();
    assert!(scheduler.wait("j").await.is_err());

    let failed = scheduler.status("j").await.unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.attempt, 2);
    assert!(failed.payload_size.is_some());

    let outcome = scheduler.requeue("j", Some(Priority::High)).await.unwrap();
    assert!(outcome.success);

    // Attempt budget restarts, so attempts 1 and 2 fail again
    assert!(scheduler.wait("j").await.is_err());
    let snapshot = scheduler.status("j").await.unwrap();
    assert_eq!(snapshot.priority, Priority::High);
    assert_eq!(snapshot.attempt, 2);
    assert_eq!(snapshot.retries, 2);
    assert_eq!(script.calls(), 4);
}

#[tokio::test]
async fn test_requeue_only_from_failed() {
    let script = Scripted::new();
    let scheduler = scheduler_with(fast_config(), &script);

    scheduler.submit(quick("done", "g")).await.unwrap();
    scheduler.wait("done").await.unwrap();

    let outcome = scheduler.requeue("done", None).await.unwrap();
    assert!(!outcome.success);
    assert_eq!(outcome.status, JobStatus::Completed);
}

#[tokio::test]
async fn test_progress_reporting() {
    let gate = Arc::new(Semaphore::new(0));
    let processor = {
        let gate = gate.clone();
        processor_fn(move |ctx: JobContext| {
            let gate = gate.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                ctx.report(40.0, "parsing", Some("row 400 of 1000")).await;
                let _permit = gate.acquire().await.map_err(|e| ProcessorError::failed(e.to_string()))?;
                ctx.report(100.0, "saving", None).await;
                Ok(Value::Null)
            }
        })
    };
    let scheduler = Scheduler::new(fast_config(), processor).unwrap();
    let mut rx = scheduler.subscribe();

    scheduler.submit(quick("p", "g")).await.unwrap();

    let snapshot = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let snapshot = scheduler.status("p").await.unwrap();
            if snapshot.progress.is_some() {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    let progress = snapshot.progress.unwrap();
    assert_eq!(progress.percent, 40.0);
    assert_eq!(progress.stage, "parsing");
    assert_eq!(progress.message.as_deref(), Some("row 400 of 1000"));
    assert!(progress.eta_ms.is_some());

    gate.add_permits(1);
    scheduler.wait("p").await.unwrap();

    let progress_events: Vec<(f64, Option<u64>)> = drain(&mut rx)
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::Progress { percent, eta_ms, .. } => Some((*percent, *eta_ms)),
            _ => None,
        })
        .collect();
    assert_eq!(progress_events.len(), 2);
    assert_eq!(progress_events[1], (100.0, Some(0)));
}

#[tokio::test]
async fn test_backpressure_when_queue_full() {
    let script = Scripted::new();
    let scheduler = scheduler_with(
        SchedulerConfig {
            max_concurrent_total: 1,
            max_queue_length: 2,
            ..fast_config()
        },
        &script,
    );

    scheduler.submit(held("running", "g")).await.unwrap();
    scheduler.submit(quick("q1", "g")).await.unwrap();
    scheduler.submit(quick("q2", "g")).await.unwrap();

    let err = scheduler.submit(quick("q3", "g")).await.unwrap_err();
    assert!(matches!(
        err,
        SchedulerError::Backpressure {
            queue_length: 2,
            max_queue_length: 2
        }
    ));
    assert!(scheduler.status("q3").await.is_none());

    script.open_gate();
    scheduler.wait_idle().await;
    assert!(scheduler.submit(quick("q3", "g")).await.is_ok());
}

#[tokio::test]
async fn test_backpressure_before_conflict_hold() {
    let script = Scripted::new();
    let scheduler = scheduler_with(
        SchedulerConfig {
            max_concurrent_total: 1,
            max_queue_length: 1,
            ..fast_config()
        },
        &script,
    );

    scheduler.submit(held("running", "supplier-x")).await.unwrap();
    scheduler.submit(quick("queued", "other")).await.unwrap();

    let err = scheduler
        .submit(quick("late", "supplier-x").with_conflict_resolution(ConflictResolution::Reject))
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::Backpressure { max_queue_length: 1, .. }));
    assert!(scheduler.status("late").await.is_none());

    script.open_gate();
    scheduler.wait_idle().await;
}

// =============================================================================
// Queries, health and lifecycle
// =============================================================================

#[tokio::test]
async fn test_health_report() {
    let script = Scripted::new();
    let scheduler = scheduler_with(
        SchedulerConfig {
            max_concurrent_total: 1,
            max_queue_length: 4,
            queue_high_water_ratio: 0.5,
            ..fast_config()
        },
        &script,
    );

    let health = scheduler.health().await;
    assert_eq!(health.status, HealthStatus::Healthy);
    assert_eq!(health.queue_high_water, 2);
    assert_eq!(health.running_high_water, 1);

    scheduler.submit(held("a", "g")).await.unwrap();
    let health = scheduler.health().await;
    assert_eq!(health.status, HealthStatus::Degraded);
    assert_eq!(health.issues.len(), 1);

    scheduler.submit(quick("b", "g")).await.unwrap();
    scheduler.submit(quick("c", "g")).await.unwrap();
    let health = scheduler.health().await;
    assert_eq!(health.queue_length, 2);
    assert_eq!(health.issues.len(), 2);

    script.open_gate();
    scheduler.wait_idle().await;
    assert!(scheduler.health().await.is_healthy());
}

#[tokio::test]
async fn test_statistics_consistency() {
    let script = Scripted::new();
    let scheduler = scheduler_with(
        SchedulerConfig {
            max_concurrent_total: 2,
            retry_attempts: 0,
            ..fast_config()
        },
        &script,
    );

    scheduler.submit(quick("done", "g-done")).await.unwrap();
    scheduler.wait("done").await.unwrap();
    scheduler
        .submit(job("bad", "g-bad", json!({ "fail": true })))
        .await
        .unwrap();
    assert!(scheduler.wait("bad").await.is_err());

    scheduler.submit(held("h1", "g-h1")).await.unwrap();
    scheduler.submit(held("h2", "g-h2")).await.unwrap();
    scheduler.submit(quick("waiting", "g-w")).await.unwrap();
    scheduler.submit(quick("gone", "g-gone")).await.unwrap();
    scheduler.cancel("gone").await.unwrap();
    scheduler
        .submit(quick("clash", "g-h1").with_conflict_resolution(ConflictResolution::Reject))
        .await
        .unwrap();

    let stats = scheduler.statistics().await;
    let all = scheduler.list(JobFilter::default()).await.len();

    assert_eq!(stats.completed.successful, 1);
    assert_eq!(stats.completed.failed, 1);
    assert_eq!(stats.completed.cancelled, 1);
    assert_eq!(
        stats.completed.successful + stats.completed.failed + stats.completed.cancelled,
        stats.completed.total
    );
    assert_eq!(stats.processing.total, 2);
    assert_eq!(stats.queue.waiting, 1);
    assert_eq!(stats.queue.conflict, 1);
    assert_eq!(stats.queue.total, 2);
    assert_eq!(stats.completed.total + stats.processing.total + stats.queue.total, all);
    assert_eq!(all, 7);
    assert_eq!(stats.queue.by_priority.len(), 5);
    assert_eq!(stats.queue.by_priority[&Priority::Normal], 1);
    assert!((stats.performance.success_rate - 1.0 / 3.0).abs() < 1e-9);
    assert!(stats.performance.average_duration_ms.is_some());

    scheduler.cancel("clash").await.unwrap();
    script.open_gate();
    scheduler.wait_idle().await;
}

#[tokio::test]
async fn test_list_filters() {
    let script = Scripted::new();
    let scheduler = scheduler_with(fast_config(), &script);

    scheduler.submit(quick("a1", "supplier-a")).await.unwrap();
    scheduler.submit(quick("a2", "supplier-a")).await.unwrap();
    scheduler.submit(quick("b1", "supplier-b")).await.unwrap();
    scheduler.wait_idle().await;

    let a = scheduler.list(JobFilter::group("supplier-a")).await;
    assert_eq!(a.iter().map(|s| s.id.as_str()).collect::<Vec<_>>(), vec!["a1", "a2"]);
    assert_eq!(scheduler.list(JobFilter::status(JobStatus::Completed)).await.len(), 3);
    assert!(scheduler.list(JobFilter::status(JobStatus::Failed)).await.is_empty());
}

#[tokio::test]
async fn test_reap_evicts_finished_jobs() {
    let script = Scripted::new();
    let scheduler = scheduler_with(fast_config(), &script);

    scheduler.submit(quick("old", "g")).await.unwrap();
    scheduler.wait("old").await.unwrap();
    scheduler.submit(held("live", "g2")).await.unwrap();

    assert_eq!(scheduler.reap_expired().await, 0);
    assert_eq!(scheduler.reap(Duration::from_secs(3600)).await, 0);
    assert_eq!(scheduler.reap(Duration::ZERO).await, 1);

    assert!(scheduler.status("old").await.is_none());
    assert!(matches!(scheduler.wait("old").await, Err(SchedulerError::NotFound(_))));
    assert!(scheduler.status("live").await.is_some());

    script.open_gate();
    scheduler.wait_idle().await;
}

#[tokio::test]
async fn test_shutdown_drains_running_jobs() {
    let script = Scripted::new();
    let scheduler = scheduler_with(
        SchedulerConfig {
            max_concurrent_total: 1,
            ..fast_config()
        },
        &script,
    );

    scheduler.submit(held("running", "g")).await.unwrap();
    scheduler.submit(quick("queued", "g")).await.unwrap();

    let shutdown = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move { scheduler.shutdown().await })
    };

    wait_for_status(&scheduler, "queued", JobStatus::Cancelled).await;
    assert!(scheduler.status("running").await.unwrap().cancel_requested);
    assert!(matches!(
        scheduler.submit(quick("late", "g")).await,
        Err(SchedulerError::ShuttingDown)
    ));

    script.open_gate();
    tokio::time::timeout(Duration::from_secs(5), shutdown)
        .await
        .expect("shutdown should finish once the processor settles")
        .unwrap();

    assert_eq!(scheduler.status("running").await.unwrap().status, JobStatus::Cancelled);
    assert_eq!(script.calls_for("queued"), 0);
    assert!(!scheduler.health().await.accepting);
}

#[tokio::test]
async fn test_event_sequence_for_completed_job() {
    let script = Scripted::new();
    let scheduler = scheduler_with(fast_config(), &script);
    let mut rx = scheduler.subscribe();

    scheduler.submit(quick("j", "g")).await.unwrap();
    scheduler.wait("j").await.unwrap();

    let events = drain(&mut rx);
    assert_eq!(event_types_for(&events, "j"), vec!["queued", "started", "completed"]);
    let statuses: Vec<JobStatus> = events.iter().map(|e| e.status).collect();
    assert_eq!(
        statuses,
        vec![JobStatus::Queued, JobStatus::Processing, JobStatus::Completed]
    );
}

#[tokio::test]
async fn test_every_event_reaches_slow_subscriber() {
    let script = Scripted::new();
    let scheduler = scheduler_with(
        SchedulerConfig {
            event_channel_capacity: 1,
            ..fast_config()
        },
        &script,
    );
    let mut rx = scheduler.subscribe();

    for id in ["a", "b", "c"] {
        scheduler.submit(quick(id, id)).await.unwrap();
    }
    scheduler.wait_idle().await;

    let events = drain(&mut rx);
    assert_eq!(events.len(), 9);
    for id in ["a", "b", "c"] {
        assert_eq!(event_types_for(&events, id), vec!["queued", "started", "completed"]);
    }
}

#[tokio::test]
async fn test_generated_ids_are_unique() {
    let script = Scripted::new();
    let scheduler = scheduler_with(fast_config(), &script);

    let a = scheduler
        .submit(JobRequest::new(Payload::from_bytes(b"x\n".to_vec()), "g"))
        .await
        .unwrap();
    let b = scheduler
        .submit(JobRequest::new(Payload::from_bytes(b"y\n".to_vec()), "g"))
        .await
        .unwrap();
    assert_ne!(a.id, b.id);
    scheduler.wait_idle().await;
}
