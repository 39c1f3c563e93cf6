//! Error types for the scheduler

use std::time::Duration;

use thiserror::Error;

use crate::domain::JobId;

/// Errors raised by a processor invocation
///
/// These never reach the submitter directly; they are recorded on the job
/// and feed the retry policy.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProcessorError {
    #[error("{message}")]
    Failed { message: String },

    #[error("Timed out after {after:?}")]
    Timeout { after: Duration },

    #[error("Processor panicked: {message}")]
    Panicked { message: String },
}

impl ProcessorError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }
}

/// Errors from scheduler operations
#[derive(Debug, Clone, Error)]
pub enum SchedulerError {
    #[error("Queue is full ({queue_length}/{max_queue_length}), retry later")]
    Backpressure {
        queue_length: usize,
        max_queue_length: usize,
    },

    #[error("Job {id} conflicts with {conflicting_with:?} and needs explicit resolution")]
    Conflict { id: JobId, conflicting_with: Vec<JobId> },

    #[error("Invalid submission: {0}")]
    Validation(String),

    #[error("Job {id} failed: {source}")]
    Processor {
        id: JobId,
        #[source]
        source: ProcessorError,
    },

    #[error("Job {id} was cancelled")]
    Cancelled { id: JobId },

    #[error("Job not found: {0}")]
    NotFound(JobId),

    #[error("Scheduler is shutting down")]
    ShuttingDown,
}
