//! Scheduler implementation
//!
//! All queue, slot and record state sits behind one mutex. Every operation
//! that can free a slot or add a runnable job finishes by calling
//! `dispatch_locked` while still holding that lock, so dispatch is driven by
//! events rather than by a polling task.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{TimeDelta, Utc};
use serde_json::Value;
use tokio::sync::{Mutex, Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::domain::{
    JobId, JobRecord, JobSnapshot, JobStatus, Priority, Progress, estimate_remaining, new_job_id,
};
use crate::events::{EventBus, JobEvent, create_event_bus};

use super::concurrency::ConcurrencyController;
use super::config::SchedulerConfig;
use super::conflict::{ConflictDecision, ConflictOutcome, find_conflicts};
use super::error::{ProcessorError, SchedulerError};
use super::processor::{JobContext, JobProcessor, ProgressReporter};
use super::queue::PriorityQueue;
use super::request::{ControlOutcome, JobFilter, JobRequest, SubmitReceipt};
use super::retry::{RetryDecision, RetryPolicy};
use super::stats::{
    CompletedStats, HealthReport, MemoryStats, PerformanceStats, ProcessingStats, QueueStats, Statistics,
    process_memory_bytes,
};

/// Scheduler-side bookkeeping for one job
struct JobEntry {
    record: JobRecord,

    /// Cooperative cancel signal handed to the processor
    cancel: CancellationToken,

    /// Pending re-admission while `RetryScheduled`
    retry_timer: Option<JoinHandle<()>>,

    /// Status feed for `wait`
    status_tx: watch::Sender<JobStatus>,

    /// Typed form of `record.error`
    last_error: Option<ProcessorError>,

    /// Monotonic start of the current attempt
    started: Option<Instant>,
}

impl JobEntry {
    fn new(record: JobRecord) -> Self {
        let (status_tx, _) = watch::channel(record.status);
        Self {
            record,
            cancel: CancellationToken::new(),
            retry_timer: None,
            status_tx,
            last_error: None,
            started: None,
        }
    }

    /// Apply a state machine transition
    fn set_status(&mut self, next: JobStatus) {
        let current = self.record.status;
        if !current.can_transition_to(next) {
            error!(job_id = %self.record.id, %current, %next, "JobEntry::set_status: illegal transition");
            debug_assert!(false, "illegal transition {} -> {}", current, next);
        }
        self.record.status = next;
        self.status_tx.send_replace(next);
    }

    fn finish(&mut self, status: JobStatus) {
        self.set_status(status);
        self.record.finish(status);
        if let Some(timer) = self.retry_timer.take() {
            timer.abort();
        }
    }
}

/// State guarded by the scheduler mutex
struct SchedulerState {
    jobs: HashMap<JobId, JobEntry>,
    queue: PriorityQueue,
    slots: ConcurrencyController,
    accepting: bool,
}

impl SchedulerState {
    /// Backpressure check for one admission, counting `leaving` jobs as already gone
    fn ensure_room(&self, leaving: &[JobId]) -> Result<(), SchedulerError> {
        let leaving = leaving.iter().filter(|id| self.queue.contains(id)).count();
        self.queue.ensure_room(leaving)
    }

    /// No job is queued, running or waiting on a retry timer
    fn is_idle(&self) -> bool {
        self.jobs.values().all(|e| !e.record.status.is_active())
    }
}

pub(crate) struct Inner {
    config: SchedulerConfig,
    retry: RetryPolicy,
    processor: Arc<dyn JobProcessor>,
    events: Arc<EventBus>,
    state: Mutex<SchedulerState>,
    idle: Notify,
}

/// In-process upload job scheduler
///
/// Cheap to clone; clones share the same queue, slots and history.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    /// Create a scheduler that runs jobs through `processor`
    pub fn new(config: SchedulerConfig, processor: Arc<dyn JobProcessor>) -> Result<Self, SchedulerError> {
        debug!(?config, "Scheduler::new: called");
        config.validate()?;

        let state = SchedulerState {
            jobs: HashMap::new(),
            queue: PriorityQueue::new(config.max_queue_length),
            slots: ConcurrencyController::new(config.max_concurrent_total, config.max_concurrent_per_group),
            accepting: true,
        };

        Ok(Self {
            inner: Arc::new(Inner {
                retry: RetryPolicy::from_config(&config),
                events: create_event_bus(config.event_channel_capacity),
                config,
                processor,
                state: Mutex::new(state),
                idle: Notify::new(),
            }),
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// The bus all lifecycle and progress events go through
    pub fn events(&self) -> Arc<EventBus> {
        Arc::clone(&self.inner.events)
    }

    /// Subscribe to every event emitted from now on
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<JobEvent> {
        self.inner.events.subscribe()
    }

    /// Admit a job
    ///
    /// Returns as soon as the job is queued, started or held in `Conflict`.
    /// Processor failures never surface here.
    pub async fn submit(&self, request: JobRequest) -> Result<SubmitReceipt, SchedulerError> {
        let JobRequest {
            id,
            payload,
            group_key,
            priority,
            conflict_resolution,
            conflict_predicate,
            timeout,
        } = request;
        debug!(?id, %group_key, ?priority, "Scheduler::submit: called");

        if group_key.trim().is_empty() {
            return Err(SchedulerError::Validation("group_key must not be empty".to_string()));
        }
        if payload.is_empty() {
            return Err(SchedulerError::Validation("payload must not be empty".to_string()));
        }
        let id = match id {
            Some(id) if id.trim().is_empty() => {
                return Err(SchedulerError::Validation("job id must not be empty".to_string()));
            }
            Some(id) => id,
            None => new_job_id(),
        };

        let config = &self.inner.config;
        let priority = priority.unwrap_or(config.default_priority);
        let resolution = conflict_resolution.unwrap_or(config.default_conflict_resolution);

        let mut guard = self.inner.state.lock().await;
        let state = &mut *guard;

        if !state.accepting {
            debug!(%id, "Scheduler::submit: shutting down, rejecting");
            return Err(SchedulerError::ShuttingDown);
        }
        if state.jobs.contains_key(&id) {
            return Err(SchedulerError::Validation(format!("job id {} is already in use", id)));
        }

        let mut record = JobRecord::new(id.clone(), group_key, priority, payload);
        record.timeout = timeout.or_else(|| config.job_timeout());

        let conflicts = find_conflicts(
            &record,
            state.jobs.values().map(|e| &e.record),
            conflict_predicate.as_ref(),
        );
        let outcome = resolution.outcome(conflicts);
        match &outcome {
            ConflictOutcome::Replace(conflicting) => state.ensure_room(conflicting)?,
            _ => state.ensure_room(&[])?,
        }
        let replaced = match outcome {
            ConflictOutcome::Hold(conflicting) => {
                info!(%id, group_key = %record.group_key, ?conflicting, "Job held in conflict");
                record.status = JobStatus::Conflict;
                record.conflicts_with = conflicting.clone();
                self.inner
                    .events
                    .emitter_for(&id)
                    .conflict(&record.group_key, &conflicting);
                state.jobs.insert(id.clone(), JobEntry::new(record));
                return Ok(SubmitReceipt {
                    id,
                    status: JobStatus::Conflict,
                    position: None,
                    conflicts_with: conflicting,
                });
            }
            ConflictOutcome::Replace(conflicting) => conflicting,
            ConflictOutcome::Admit => Vec::new(),
        };

        for old in &replaced {
            info!(%id, replaced = %old, "Replacing conflicting job");
            self.inner.cancel_locked(state, old);
        }
        record.conflicts_with = replaced;

        let group_key = record.group_key.clone();
        state.queue.enqueue(&id, &group_key, priority)?;
        state.jobs.insert(id.clone(), JobEntry::new(record));
        self.inner
            .events
            .emitter_for(&id)
            .queued(&group_key, priority, 0, state.queue.position(&id));
        info!(%id, %group_key, %priority, "Job queued");

        self.inner.dispatch_locked(state);

        let (status, conflicts_with) = state
            .jobs
            .get(&id)
            .map(|e| (e.record.status, e.record.conflicts_with.clone()))
            .unwrap_or_default();
        Ok(SubmitReceipt {
            position: state.queue.position(&id),
            id,
            status,
            conflicts_with,
        })
    }

    /// Cancel a job
    ///
    /// Queued, retry-scheduled and conflict-held jobs are cancelled at once.
    /// A running job is only flagged; it becomes `Cancelled` when its
    /// processor settles, whatever the processor returns.
    pub async fn cancel(&self, id: &str) -> Result<ControlOutcome, SchedulerError> {
        debug!(%id, "Scheduler::cancel: called");
        let mut guard = self.inner.state.lock().await;
        let state = &mut *guard;
        if !state.jobs.contains_key(id) {
            return Err(SchedulerError::NotFound(id.to_string()));
        }
        let outcome = self.inner.cancel_locked(state, id);
        self.inner.notify_if_idle(state);
        Ok(outcome)
    }

    /// Settle a job held in `Conflict`
    pub async fn resolve_conflict(&self, id: &str, decision: ConflictDecision) -> Result<ControlOutcome, SchedulerError> {
        debug!(%id, ?decision, "Scheduler::resolve_conflict: called");
        let mut guard = self.inner.state.lock().await;
        let state = &mut *guard;

        let Some(entry) = state.jobs.get(id) else {
            return Err(SchedulerError::NotFound(id.to_string()));
        };
        if entry.record.status != JobStatus::Conflict {
            debug!(%id, status = %entry.record.status, "Scheduler::resolve_conflict: not in conflict");
            return Ok(ControlOutcome {
                success: false,
                status: entry.record.status,
            });
        }
        let conflicting = entry.record.conflicts_with.clone();

        let to_cancel = match decision {
            ConflictDecision::CancelNew => {
                info!(%id, "Conflict resolved: cancelling new job");
                return Ok(self.inner.cancel_locked(state, id));
            }
            ConflictDecision::Proceed => Vec::new(),
            ConflictDecision::CancelExisting => conflicting,
        };

        if !state.accepting {
            return Err(SchedulerError::ShuttingDown);
        }
        state.ensure_room(&to_cancel)?;
        for old in &to_cancel {
            self.inner.cancel_locked(state, old);
        }

        let Some(entry) = state.jobs.get_mut(id) else {
            return Err(SchedulerError::NotFound(id.to_string()));
        };
        let (group_key, priority) = (entry.record.group_key.clone(), entry.record.priority);
        entry.record.enqueued_at = Utc::now();
        entry.set_status(JobStatus::Queued);
        state.queue.enqueue(id, &group_key, priority)?;
        self.inner
            .events
            .emitter_for(id)
            .queued(&group_key, priority, 0, state.queue.position(id));
        info!(%id, ?decision, "Conflict resolved: job queued");

        self.inner.dispatch_locked(state);
        Ok(ControlOutcome {
            success: true,
            status: state.jobs.get(id).map(|e| e.record.status).unwrap_or_default(),
        })
    }

    /// Put a failed job back in the queue with a fresh attempt budget
    pub async fn requeue(&self, id: &str, priority: Option<Priority>) -> Result<ControlOutcome, SchedulerError> {
        debug!(%id, ?priority, "Scheduler::requeue: called");
        let mut guard = self.inner.state.lock().await;
        let state = &mut *guard;

        let Some(entry) = state.jobs.get(id) else {
            return Err(SchedulerError::NotFound(id.to_string()));
        };
        if entry.record.status != JobStatus::Failed {
            debug!(%id, status = %entry.record.status, "Scheduler::requeue: only failed jobs can be requeued");
            return Ok(ControlOutcome {
                success: false,
                status: entry.record.status,
            });
        }
        if !state.accepting {
            return Err(SchedulerError::ShuttingDown);
        }
        let group_key = entry.record.group_key.clone();
        let priority = priority.unwrap_or(entry.record.priority);
        state.queue.enqueue(id, &group_key, priority)?;

        let Some(entry) = state.jobs.get_mut(id) else {
            return Err(SchedulerError::NotFound(id.to_string()));
        };
        entry.record.revive(Some(priority));
        entry.last_error = None;
        entry.started = None;
        entry.cancel = CancellationToken::new();
        entry.status_tx.send_replace(JobStatus::Queued);
        self.inner
            .events
            .emitter_for(id)
            .queued(&group_key, priority, 0, state.queue.position(id));
        info!(%id, %priority, "Failed job requeued");

        self.inner.dispatch_locked(state);
        Ok(ControlOutcome {
            success: true,
            status: state.jobs.get(id).map(|e| e.record.status).unwrap_or_default(),
        })
    }

    /// Snapshot of one job, None when unknown or reaped
    pub async fn status(&self, id: &str) -> Option<JobSnapshot> {
        debug!(%id, "Scheduler::status: called");
        let state = self.inner.state.lock().await;
        state.jobs.get(id).map(|e| e.record.snapshot())
    }

    /// Snapshots of all known jobs matching `filter`, oldest first
    pub async fn list(&self, filter: JobFilter) -> Vec<JobSnapshot> {
        debug!(?filter, "Scheduler::list: called");
        let state = self.inner.state.lock().await;
        let mut jobs: Vec<JobSnapshot> = state
            .jobs
            .values()
            .filter(|e| filter.matches(e.record.status, &e.record.group_key))
            .map(|e| e.record.snapshot())
            .collect();
        jobs.sort_by(|a, b| a.submitted_at.cmp(&b.submitted_at).then_with(|| a.id.cmp(&b.id)));
        jobs
    }

    /// Ids of queued jobs in the order they will be dispatched
    pub async fn queued_ids(&self) -> Vec<JobId> {
        self.inner.state.lock().await.queue.ordered_ids()
    }

    /// Wait until the job is terminal
    ///
    /// `Ok` carries the processor result. A job held in `Conflict` returns
    /// `Err(Conflict)` straight away since it will not move without a
    /// `resolve_conflict` call.
    pub async fn wait(&self, id: &str) -> Result<Value, SchedulerError> {
        debug!(%id, "Scheduler::wait: called");
        let mut rx = {
            let state = self.inner.state.lock().await;
            let entry = state
                .jobs
                .get(id)
                .ok_or_else(|| SchedulerError::NotFound(id.to_string()))?;
            entry.status_tx.subscribe()
        };

        loop {
            let status = *rx.borrow_and_update();
            if status.is_terminal() || status == JobStatus::Conflict {
                break;
            }
            if rx.changed().await.is_err() {
                debug!(%id, "Scheduler::wait: record reaped while waiting");
                break;
            }
        }

        let state = self.inner.state.lock().await;
        let entry = state
            .jobs
            .get(id)
            .ok_or_else(|| SchedulerError::NotFound(id.to_string()))?;
        let record = &entry.record;
        match record.status {
            JobStatus::Completed => Ok(record.result.clone().unwrap_or(Value::Null)),
            JobStatus::Failed => Err(SchedulerError::Processor {
                id: record.id.clone(),
                source: entry
                    .last_error
                    .clone()
                    .unwrap_or_else(|| ProcessorError::failed(record.error.clone().unwrap_or_default())),
            }),
            JobStatus::Cancelled => Err(SchedulerError::Cancelled { id: record.id.clone() }),
            JobStatus::Conflict => Err(SchedulerError::Conflict {
                id: record.id.clone(),
                conflicting_with: record.conflicts_with.clone(),
            }),
            status => {
                error!(%id, %status, "Scheduler::wait: woke on a non-terminal status");
                Err(SchedulerError::NotFound(id.to_string()))
            }
        }
    }

    /// Aggregate counters over every job still held
    pub async fn statistics(&self) -> Statistics {
        debug!("Scheduler::statistics: called");
        let mut stats = {
            let state = self.inner.state.lock().await;

            let mut queue = QueueStats {
                waiting: state.queue.len(),
                capacity: state.queue.capacity(),
                by_priority: Priority::ALL.iter().map(|p| (*p, 0)).collect(),
                ..Default::default()
            };
            queue.by_priority.extend(state.queue.counts_by_priority());

            let mut completed = CompletedStats::default();
            let mut durations = Vec::new();
            let mut total_retries = 0u64;
            for entry in state.jobs.values() {
                let record = &entry.record;
                total_retries += u64::from(record.retries);
                match record.status {
                    JobStatus::RetryScheduled => queue.retry_scheduled += 1,
                    JobStatus::Conflict => queue.conflict += 1,
                    JobStatus::Completed => {
                        completed.successful += 1;
                        durations.extend(record.processing_duration());
                    }
                    JobStatus::Failed => completed.failed += 1,
                    JobStatus::Cancelled => completed.cancelled += 1,
                    JobStatus::Queued | JobStatus::Processing => {}
                }
            }
            queue.total = queue.waiting + queue.retry_scheduled + queue.conflict;
            completed.total = completed.successful + completed.failed + completed.cancelled;

            let processing = ProcessingStats {
                total: state.slots.running(),
                max_concurrent: state.slots.max_total(),
                by_group: state
                    .slots
                    .per_group()
                    .iter()
                    .filter(|(_, n)| **n > 0)
                    .map(|(g, n)| (g.clone(), *n))
                    .collect(),
                peak: state.slots.peak(),
            };

            let average_duration_ms = (!durations.is_empty())
                .then(|| durations.iter().map(|d| d.as_millis() as u64).sum::<u64>() / durations.len() as u64);
            let performance = PerformanceStats {
                success_rate: completed.success_rate(),
                average_duration_ms,
                peak_duration_ms: durations.iter().max().map(|d| d.as_millis() as u64),
                total_retries,
            };

            Statistics {
                queue,
                processing,
                completed,
                performance,
                memory: MemoryStats::default(),
                collected_at: Utc::now(),
            }
        };

        stats.memory.resident_bytes = tokio::task::spawn_blocking(process_memory_bytes)
            .await
            .ok()
            .flatten();
        stats
    }

    /// Health verdict from queue depth and running count
    pub async fn health(&self) -> HealthReport {
        debug!("Scheduler::health: called");
        let config = &self.inner.config;
        let state = self.inner.state.lock().await;
        HealthReport::evaluate(
            state.queue.len(),
            state.queue.capacity(),
            config.queue_high_water_ratio,
            state.slots.running(),
            state.slots.max_total(),
            config.running_high_water_ratio,
            state.accepting,
        )
    }

    /// Evict terminal records that finished more than `max_age` ago
    ///
    /// Returns the number of records removed. Callers awaiting a reaped job
    /// get `NotFound`.
    pub async fn reap(&self, max_age: Duration) -> usize {
        debug!(?max_age, "Scheduler::reap: called");
        let Some(cutoff) = TimeDelta::from_std(max_age)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
        else {
            return 0;
        };

        let mut state = self.inner.state.lock().await;
        let before = state.jobs.len();
        state.jobs.retain(|_, e| {
            !(e.record.status.is_terminal() && e.record.finished_at.is_some_and(|finished| finished <= cutoff))
        });
        let reaped = before - state.jobs.len();
        if reaped > 0 {
            info!(reaped, "Reaped finished jobs");
        }
        reaped
    }

    /// `reap` with the configured history retention
    pub async fn reap_expired(&self) -> usize {
        self.reap(self.inner.config.history_retention()).await
    }

    /// Stop admitting, cancel everything pending and wait for running jobs to settle
    pub async fn shutdown(&self) {
        debug!("Scheduler::shutdown: called");
        {
            let mut guard = self.inner.state.lock().await;
            let state = &mut *guard;
            state.accepting = false;
            let pending: Vec<JobId> = state
                .jobs
                .values()
                .filter(|e| !e.record.status.is_terminal())
                .map(|e| e.record.id.clone())
                .collect();
            info!(pending = pending.len(), "Scheduler shutting down");
            for id in &pending {
                self.inner.cancel_locked(state, id);
            }
            self.inner.notify_if_idle(state);
        }
        self.wait_idle().await;
        info!("Scheduler shut down");
    }

    /// Wait until no job is queued, running or scheduled for retry
    pub async fn wait_idle(&self) {
        debug!("Scheduler::wait_idle: called");
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.state.lock().await.is_idle() {
                return;
            }
            notified.await;
        }
    }
}

impl Inner {
    /// Start queued jobs while slots are free
    ///
    /// A job whose group is at its cap goes back to its place in its band
    /// and the next candidate is tried.
    fn dispatch_locked(self: &Arc<Self>, state: &mut SchedulerState) {
        let mut blocked = Vec::new();
        while state.slots.has_capacity() {
            let Some(next) = state.queue.dequeue_next() else {
                break;
            };
            let queued = state
                .jobs
                .get(&next.job_id)
                .is_some_and(|e| e.record.status == JobStatus::Queued);
            if !queued {
                error!(job_id = %next.job_id, "Inner::dispatch_locked: queue entry without a queued record");
                debug_assert!(false, "queue entry {} has no queued record", next.job_id);
                continue;
            }
            if !state.slots.try_acquire(&next.group_key) {
                debug!(job_id = %next.job_id, group_key = %next.group_key, "Inner::dispatch_locked: group at cap");
                blocked.push(next);
                continue;
            }
            self.start_locked(state, &next.job_id);
        }
        for job in blocked {
            state.queue.restore(job);
        }
    }

    /// Move a job holding a fresh slot into `Processing` and invoke the processor
    fn start_locked(self: &Arc<Self>, state: &mut SchedulerState, id: &str) {
        let Some(entry) = state.jobs.get_mut(id) else {
            return;
        };
        entry.record.attempt += 1;
        entry.record.started_at = Some(Utc::now());
        entry.record.progress = None;
        entry.started = Some(Instant::now());
        entry.set_status(JobStatus::Processing);

        let attempt = entry.record.attempt;
        let group_key = entry.record.group_key.clone();
        let payload = entry.record.payload.clone().unwrap_or_else(|| {
            error!(job_id = %id, "Inner::start_locked: payload already released");
            debug_assert!(false, "payload of {} released before processing", id);
            Default::default()
        });

        let ctx = JobContext {
            job_id: id.to_string(),
            group_key: group_key.clone(),
            attempt,
            payload,
            progress: ProgressReporter::new(Arc::downgrade(self), id.to_string(), attempt),
            cancel: entry.cancel.clone(),
        };
        let timeout = entry.record.timeout;

        self.events.emitter_for(id).started(&group_key, attempt);
        info!(job_id = %id, %group_key, attempt, "Job started");

        let inner = Arc::clone(self);
        let job_id = id.to_string();
        tokio::spawn(async move {
            let outcome = inner.run_attempt(ctx, timeout).await;
            inner.finish_attempt(&job_id, attempt, outcome).await;
        });
    }

    /// Run the processor on its own task so panics and timeouts stay contained
    async fn run_attempt(&self, ctx: JobContext, timeout: Option<Duration>) -> Result<Value, ProcessorError> {
        let job_id = ctx.job_id.clone();
        let processor = Arc::clone(&self.processor);
        let mut handle = tokio::spawn(async move { processor.process(ctx).await });

        let joined = match timeout {
            Some(after) => match tokio::time::timeout(after, &mut handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    warn!(%job_id, ?after, "Job timed out, aborting processor");
                    handle.abort();
                    return Err(ProcessorError::Timeout { after });
                }
            },
            None => handle.await,
        };

        match joined {
            Ok(result) => result,
            Err(e) if e.is_panic() => {
                let message = panic_message(e.into_panic());
                error!(%job_id, %message, "Processor panicked");
                Err(ProcessorError::Panicked { message })
            }
            Err(e) => Err(ProcessorError::failed(format!("processor task ended unexpectedly: {}", e))),
        }
    }

    /// Record the outcome of an attempt, release its slot and dispatch
    async fn finish_attempt(self: &Arc<Self>, id: &str, attempt: u32, outcome: Result<Value, ProcessorError>) {
        debug!(job_id = %id, attempt, ok = outcome.is_ok(), "Inner::finish_attempt: called");
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let Some(entry) = state.jobs.get_mut(id) else {
            error!(job_id = %id, "Inner::finish_attempt: running job has no record");
            debug_assert!(false, "running job {} has no record", id);
            return;
        };
        if entry.record.status != JobStatus::Processing || entry.record.attempt != attempt {
            error!(
                job_id = %id,
                status = %entry.record.status,
                attempt,
                "Inner::finish_attempt: job is not running this attempt"
            );
            debug_assert!(false, "finish_attempt on {} in {}", id, entry.record.status);
            return;
        }

        let emitter = self.events.emitter_for(id);
        let group_key = entry.record.group_key.clone();
        let elapsed = entry.started.take().map(|s| s.elapsed()).unwrap_or_default();

        if entry.record.cancel_requested {
            info!(job_id = %id, attempt, "Job cancelled after processor settled");
            entry.finish(JobStatus::Cancelled);
            emitter.cancelled(attempt);
        } else {
            match outcome {
                Ok(value) => {
                    entry.record.result = Some(value);
                    entry.finish(JobStatus::Completed);
                    emitter.completed(attempt, elapsed);
                    info!(job_id = %id, attempt, ?elapsed, "Job completed");
                }
                Err(err) => {
                    let message = err.to_string();
                    entry.record.error = Some(message.clone());
                    entry.last_error = Some(err);
                    match self.retry.decide(attempt) {
                        RetryDecision::Retry { delay } => {
                            warn!(job_id = %id, attempt, ?delay, error = %message, "Job failed, retry scheduled");
                            entry.record.retries += 1;
                            entry.set_status(JobStatus::RetryScheduled);
                            emitter.retry_scheduled(attempt, delay, &message);

                            let inner = Arc::clone(self);
                            let job_id = id.to_string();
                            entry.retry_timer = Some(tokio::spawn(async move {
                                tokio::time::sleep(delay).await;
                                inner.readmit(&job_id).await;
                            }));
                        }
                        RetryDecision::Exhausted => {
                            warn!(job_id = %id, attempt, error = %message, "Job failed, retries exhausted");
                            entry.finish(JobStatus::Failed);
                            emitter.failed(attempt, &message);
                        }
                    }
                }
            }
        }

        state.slots.release(&group_key);
        self.dispatch_locked(state);
        self.notify_if_idle(state);
    }

    /// Put a job back in the queue once its backoff has elapsed
    async fn readmit(self: &Arc<Self>, id: &str) {
        debug!(job_id = %id, "Inner::readmit: called");
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let Some(entry) = state.jobs.get_mut(id) else {
            return;
        };
        if entry.record.status != JobStatus::RetryScheduled {
            debug!(job_id = %id, status = %entry.record.status, "Inner::readmit: no longer waiting on retry");
            return;
        }
        entry.retry_timer = None;
        entry.record.enqueued_at = Utc::now();
        entry.set_status(JobStatus::Queued);
        let (group_key, priority, attempt) =
            (entry.record.group_key.clone(), entry.record.priority, entry.record.attempt);

        state.queue.force_enqueue(id, &group_key, priority);
        self.events
            .emitter_for(id)
            .queued(&group_key, priority, attempt, state.queue.position(id));
        info!(job_id = %id, attempt, "Job re-admitted after backoff");

        self.dispatch_locked(state);
    }

    fn cancel_locked(&self, state: &mut SchedulerState, id: &str) -> ControlOutcome {
        let Some(entry) = state.jobs.get_mut(id) else {
            return ControlOutcome {
                success: false,
                status: JobStatus::Cancelled,
            };
        };
        let emitter = self.events.emitter_for(id);

        match entry.record.status {
            JobStatus::Queued | JobStatus::RetryScheduled | JobStatus::Conflict => {
                state.queue.remove(id);
                entry.cancel.cancel();
                entry.record.cancel_requested = true;
                entry.finish(JobStatus::Cancelled);
                emitter.cancelled(entry.record.attempt);
                info!(job_id = %id, "Job cancelled");
                ControlOutcome {
                    success: true,
                    status: JobStatus::Cancelled,
                }
            }
            JobStatus::Processing => {
                if !entry.record.cancel_requested {
                    entry.record.cancel_requested = true;
                    entry.cancel.cancel();
                    emitter.cancel_requested();
                    info!(job_id = %id, "Cancel requested for running job");
                }
                ControlOutcome {
                    success: true,
                    status: JobStatus::Processing,
                }
            }
            status => {
                debug!(job_id = %id, %status, "Inner::cancel_locked: already terminal");
                ControlOutcome { success: false, status }
            }
        }
    }

    fn notify_if_idle(&self, state: &SchedulerState) {
        if state.is_idle() {
            self.idle.notify_waiters();
        }
    }

    /// Store a progress report from the processor and publish it
    pub(crate) async fn record_progress(
        &self,
        job_id: &str,
        attempt: u32,
        started: Instant,
        percent: f64,
        stage: &str,
        message: Option<&str>,
    ) {
        if !percent.is_finite() {
            warn!(%job_id, percent, "Inner::record_progress: ignoring non-finite percent");
            return;
        }
        let percent = percent.clamp(0.0, 100.0);

        let mut state = self.state.lock().await;
        let Some(entry) = state.jobs.get_mut(job_id) else {
            return;
        };
        if entry.record.status != JobStatus::Processing || entry.record.attempt != attempt {
            debug!(%job_id, attempt, "Inner::record_progress: stale report, ignoring");
            return;
        }

        let eta = estimate_remaining(started.elapsed(), percent);
        entry.record.progress = Some(Progress {
            percent,
            stage: stage.to_string(),
            message: message.map(str::to_string),
            eta_ms: eta.map(|d| d.as_millis() as u64),
            updated_at: Utc::now(),
        });
        self.events.emitter_for(job_id).progress(percent, stage, message, eta);
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Payload;
    use crate::scheduler::processor::processor_fn;

    fn scheduler(config: SchedulerConfig) -> Scheduler {
        let processor = processor_fn(|ctx: JobContext| async move {
            Ok::<_, ProcessorError>(serde_json::json!({ "bytes": ctx.payload.len() }))
        });
        Scheduler::new(config, processor).unwrap()
    }

    #[test]
    fn test_panic_message() {
        assert_eq!(panic_message(Box::new("boom")), "boom");
        assert_eq!(panic_message(Box::new("kaboom".to_string())), "kaboom");
        assert_eq!(panic_message(Box::new(42u8)), "unknown panic payload");
    }

    #[tokio::test]
    async fn test_new_rejects_invalid_config() {
        let processor = processor_fn(|_ctx: JobContext| async { Ok::<_, ProcessorError>(Value::Null) });
        let config = SchedulerConfig {
            max_concurrent_total: 0,
            ..Default::default()
        };
        assert!(matches!(
            Scheduler::new(config, processor),
            Err(SchedulerError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_submit_validation() {
        let scheduler = scheduler(SchedulerConfig::default());

        let err = scheduler
            .submit(JobRequest::new(Payload::default(), "supplier-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::Validation(_)));

        let err = scheduler
            .submit(JobRequest::new(Payload::from_bytes(vec![1]), "  "))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::Validation(_)));
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let scheduler = scheduler(SchedulerConfig::default());
        let request = || JobRequest::new(Payload::from_bytes(vec![1]), "supplier-1").with_id("same");
        scheduler.submit(request()).await.unwrap();
        assert!(matches!(
            scheduler.submit(request()).await,
            Err(SchedulerError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_submit_and_wait() {
        let scheduler = scheduler(SchedulerConfig::default());
        let receipt = scheduler
            .submit(JobRequest::new(Payload::from_bytes(vec![1, 2, 3]), "supplier-1"))
            .await
            .unwrap();

        let result = scheduler.wait(&receipt.id).await.unwrap();
        assert_eq!(result["bytes"], 3);

        let snapshot = scheduler.status(&receipt.id).await.unwrap();
        assert_eq!(snapshot.status, JobStatus::Completed);
        assert_eq!(snapshot.attempt, 1);
        assert_eq!(snapshot.payload_size, None);
    }

    #[tokio::test]
    async fn test_unknown_id() {
        let scheduler = scheduler(SchedulerConfig::default());
        assert!(scheduler.status("nope").await.is_none());
        assert!(matches!(scheduler.cancel("nope").await, Err(SchedulerError::NotFound(_))));
        assert!(matches!(scheduler.wait("nope").await, Err(SchedulerError::NotFound(_))));
        assert!(matches!(
            scheduler.requeue("nope", None).await,
            Err(SchedulerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_submit_after_shutdown() {
        let scheduler = scheduler(SchedulerConfig::default());
        scheduler.shutdown().await;
        assert!(matches!(
            scheduler
                .submit(JobRequest::new(Payload::from_bytes(vec![1]), "supplier-1"))
                .await,
            Err(SchedulerError::ShuttingDown)
        ));
        assert!(!scheduler.health().await.accepting);
    }
}
