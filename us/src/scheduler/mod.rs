//! Upload job scheduler
//!
//! Admits jobs into a bounded priority queue, runs them through a
//! [`JobProcessor`] under a global and an optional per-group concurrency cap,
//! and routes failures through capped exponential backoff.
//!
//! ```text
//!   submit ──► conflict check ──► PriorityQueue ──► dispatch ──► processor
//!                  │                    ▲              │             │
//!                  ▼                    │          slot held      settles
//!               CONFLICT           retry timer         │             │
//!                                       ▲              ▼             ▼
//!                                       └── RETRY_SCHEDULED ◄── failure
//! ```

mod concurrency;
mod config;
mod conflict;
mod core;
mod error;
mod processor;
mod queue;
mod request;
mod retry;
mod stats;

pub use self::core::Scheduler;
pub use concurrency::ConcurrencyController;
pub use config::SchedulerConfig;
pub use conflict::{ConflictDecision, ConflictOutcome, ConflictPredicate, ConflictResolution, find_conflicts};
pub use error::{ProcessorError, SchedulerError};
pub use processor::{FnProcessor, JobContext, JobProcessor, ProgressReporter, processor_fn};
pub use queue::{PriorityQueue, QueuedJob};
pub use request::{ControlOutcome, JobFilter, JobRequest, SubmitReceipt};
pub use retry::{RetryDecision, RetryPolicy};
pub use stats::{
    CompletedStats, HealthReport, HealthStatus, MemoryStats, PerformanceStats, ProcessingStats, QueueStats,
    Statistics, high_water_mark, process_memory_bytes,
};
