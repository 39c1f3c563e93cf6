//! uploadsched - in-process asynchronous upload job scheduler
//!
//! Accepts file-processing jobs (supplier price-list uploads and the like),
//! admits them under a global and an optional per-group concurrency cap, runs
//! them through a pluggable [`JobProcessor`] and handles retry with backoff,
//! cooperative cancellation, conflict resolution, progress reporting and
//! health telemetry.
//!
//! # Core Concepts
//!
//! - **Single owner**: all queue and slot state sits behind one lock; concurrency
//!   comes from in-flight processor invocations only
//! - **Event-driven dispatch**: every submit, release, retry and resolution
//!   dispatches immediately, nothing polls
//! - **Cooperative cancel**: a running job is flagged, never killed, and ends
//!   `Cancelled` whatever its processor returns
//! - **Observable**: every transition is published on the [`EventBus`]
//!
//! # Modules
//!
//! - [`domain`] - Job records, statuses, priorities and payloads
//! - [`scheduler`] - Queue, slots, conflicts, retry policy and the dispatcher
//! - [`events`] - Typed events, per-subscriber event bus and JSONL logger
//! - [`config`] - Configuration file loading
//! - [`cli`] - Command-line interface
//! - [`line_count`] - Sample processor used by the CLI

pub mod cli;
pub mod config;
pub mod domain;
pub mod events;
pub mod line_count;
pub mod scheduler;

// Re-export commonly used types
pub use config::{Config, LoggingConfig};
pub use domain::{JobId, JobRecord, JobSnapshot, JobStatus, Payload, Priority, Progress};
pub use events::{EventBus, EventEmitter, EventKind, EventLogger, JobEvent, read_events, spawn_event_logger};
pub use line_count::LineCountProcessor;
pub use scheduler::{
    ConflictDecision, ConflictPredicate, ConflictResolution, ControlOutcome, HealthReport, HealthStatus, JobContext,
    JobFilter, JobProcessor, JobRequest, ProcessorError, ProgressReporter, Scheduler, SchedulerConfig, SchedulerError,
    Statistics, SubmitReceipt, processor_fn,
};
