//! Event Bus - local pub/sub for job notifications
//!
//! Every subscriber owns an unbounded mpsc queue, so no event is dropped
//! for a reader that falls behind. A broadcast tap is kept for consumers
//! that would rather skip events than buffer them. The scheduler emits
//! while holding its state lock, so each job's events arrive in the order
//! its transitions happened.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::domain::{JobId, JobStatus, Priority};

use super::types::{EventKind, JobEvent};

/// Default capacity of the lossy tap (events)
pub const DEFAULT_CHANNEL_CAPACITY: usize = 10_000;

/// Subscriber list shared by the bus and its emitters
struct Subscribers {
    senders: Mutex<Vec<mpsc::UnboundedSender<JobEvent>>>,
    tap: broadcast::Sender<JobEvent>,
}

impl Subscribers {
    fn publish(&self, event: JobEvent) {
        let mut senders = self.senders.lock().unwrap_or_else(|e| e.into_inner());
        // Dropped receivers unsubscribe
        senders.retain(|tx| tx.send(event.clone()).is_ok());
        drop(senders);
        let _ = self.tap.send(event);
    }
}

/// Central event bus for scheduler activity
///
/// `subscribe` delivers every event emitted after the call. `tap` is a
/// bounded broadcast view that skips the oldest events once a reader lags
/// more than `capacity` behind.
pub struct EventBus {
    shared: Arc<Subscribers>,
    capacity: usize,
}

impl EventBus {
    /// Create a new event bus; `capacity` bounds the lossy tap only
    pub fn new(capacity: usize) -> Self {
        debug!(capacity, "EventBus::new: creating event bus");
        let (tap, _) = broadcast::channel(capacity.max(1));
        Self {
            shared: Arc::new(Subscribers {
                senders: Mutex::new(Vec::new()),
                tap,
            }),
            capacity,
        }
    }

    /// Create a new event bus with default capacity
    pub fn with_default_capacity() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Emit an event to all subscribers
    ///
    /// Fire-and-forget: with no subscribers the event is dropped.
    pub fn emit(&self, event: JobEvent) {
        debug!(
            event_type = event.event_type(),
            job_id = %event.job_id,
            status = %event.status,
            "EventBus::emit"
        );
        self.shared.publish(event);
    }

    /// Subscribe to every event emitted from now on
    ///
    /// The receiver yields `None` once the bus and all emitters are gone.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<JobEvent> {
        debug!("EventBus::subscribe: new subscriber");
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared
            .senders
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
        rx
    }

    /// Bounded broadcast view of the bus; lagging readers miss events
    pub fn tap(&self) -> broadcast::Receiver<JobEvent> {
        debug!("EventBus::tap: new lossy subscriber");
        self.shared.tap.subscribe()
    }

    /// Create an emitter bound to one job
    pub fn emitter_for(&self, job_id: impl Into<JobId>) -> EventEmitter {
        EventEmitter {
            shared: Arc::clone(&self.shared),
            job_id: job_id.into(),
        }
    }

    /// Run `handler` on a background task for every event `filter` accepts
    ///
    /// Each listener owns its own subscription, so a slow or panicking
    /// handler only affects itself.
    pub fn spawn_listener<F, H>(&self, filter: F, mut handler: H) -> JoinHandle<()>
    where
        F: Fn(&JobEvent) -> bool + Send + 'static,
        H: FnMut(JobEvent) + Send + 'static,
    {
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if filter(&event) {
                    handler(event);
                }
            }
            debug!("EventBus listener: bus closed, shutting down");
        })
    }

    /// Number of live lossless subscribers
    pub fn subscriber_count(&self) -> usize {
        let mut senders = self.shared.senders.lock().unwrap_or_else(|e| e.into_inner());
        senders.retain(|tx| !tx.is_closed());
        senders.len()
    }

    /// Capacity of the lossy tap
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

/// Handle for emitting events about one job
///
/// Cheap to clone; stamps the job id, the resulting status and the time.
#[derive(Clone)]
pub struct EventEmitter {
    shared: Arc<Subscribers>,
    job_id: JobId,
}

impl EventEmitter {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    fn emit(&self, status: JobStatus, kind: EventKind) {
        let event = JobEvent::new(self.job_id.clone(), status, kind);
        debug!(event_type = event.event_type(), job_id = %self.job_id, "EventEmitter::emit");
        self.shared.publish(event);
    }

    // === Convenience methods ===

    pub fn queued(&self, group_key: &str, priority: Priority, attempt: u32, position: Option<usize>) {
        self.emit(
            JobStatus::Queued,
            EventKind::Queued {
                group_key: group_key.to_string(),
                priority,
                attempt,
                position,
            },
        );
    }

    pub fn conflict(&self, group_key: &str, conflicting_with: &[JobId]) {
        self.emit(
            JobStatus::Conflict,
            EventKind::Conflict {
                group_key: group_key.to_string(),
                conflicting_with: conflicting_with.to_vec(),
            },
        );
    }

    pub fn started(&self, group_key: &str, attempt: u32) {
        self.emit(
            JobStatus::Processing,
            EventKind::Started {
                group_key: group_key.to_string(),
                attempt,
            },
        );
    }

    pub fn progress(&self, percent: f64, stage: &str, message: Option<&str>, eta: Option<Duration>) {
        self.emit(
            JobStatus::Processing,
            EventKind::Progress {
                percent,
                stage: stage.to_string(),
                message: message.map(str::to_string),
                eta_ms: eta.map(|d| d.as_millis() as u64),
            },
        );
    }

    pub fn retry_scheduled(&self, attempt: u32, delay: Duration, error: &str) {
        self.emit(
            JobStatus::RetryScheduled,
            EventKind::RetryScheduled {
                attempt,
                delay_ms: delay.as_millis() as u64,
                error: error.to_string(),
            },
        );
    }

    pub fn completed(&self, attempts: u32, duration: Duration) {
        self.emit(
            JobStatus::Completed,
            EventKind::Completed {
                attempts,
                duration_ms: duration.as_millis() as u64,
            },
        );
    }

    pub fn failed(&self, attempts: u32, error: &str) {
        self.emit(
            JobStatus::Failed,
            EventKind::Failed {
                attempts,
                error: error.to_string(),
            },
        );
    }

    pub fn cancel_requested(&self) {
        self.emit(JobStatus::Processing, EventKind::CancelRequested);
    }

    pub fn cancelled(&self, attempts: u32) {
        self.emit(JobStatus::Cancelled, EventKind::Cancelled { attempts });
    }
}

/// Create an event bus wrapped in an Arc for shared ownership
pub fn create_event_bus(capacity: usize) -> Arc<EventBus> {
    Arc::new(EventBus::new(capacity))
}
