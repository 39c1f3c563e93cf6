//! Event types for job lifecycle and progress notifications

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{JobId, JobStatus, Priority};

/// One notification about one job
///
/// Every event carries the job id, the job status the event leaves it in,
/// and when it happened.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobEvent {
    pub job_id: JobId,
    pub status: JobStatus,
    #[serde(rename = "ts")]
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

/// Event-specific fields
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// Admitted to the queue (first time, after a retry, or after requeue)
    Queued {
        group_key: String,
        priority: Priority,
        /// Attempts made before this admission
        attempt: u32,
        position: Option<usize>,
    },
    /// Held until a caller resolves the conflict
    Conflict {
        group_key: String,
        conflicting_with: Vec<JobId>,
    },
    /// Processor invoked
    Started { group_key: String, attempt: u32 },
    /// Processor reported progress
    Progress {
        percent: f64,
        stage: String,
        message: Option<String>,
        /// Estimated time remaining, None until percent > 0
        eta_ms: Option<u64>,
    },
    /// Attempt failed, re-admission scheduled
    RetryScheduled {
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    /// Processor succeeded
    Completed { attempts: u32, duration_ms: u64 },
    /// Retries exhausted
    Failed { attempts: u32, error: String },
    /// Cancel requested while the processor is still running
    CancelRequested,
    /// Job reached `Cancelled`
    Cancelled { attempts: u32 },
}

impl JobEvent {
    pub fn new(job_id: impl Into<JobId>, status: JobStatus, kind: EventKind) -> Self {
        Self {
            job_id: job_id.into(),
            status,
            timestamp: Utc::now(),
            kind,
        }
    }

    /// Get the event type name
    pub fn event_type(&self) -> &'static str {
        match self.kind {
            EventKind::Queued { .. } => "queued",
            EventKind::Conflict { .. } => "conflict",
            EventKind::Started { .. } => "started",
            EventKind::Progress { .. } => "progress",
            EventKind::RetryScheduled { .. } => "retry_scheduled",
            EventKind::Completed { .. } => "completed",
            EventKind::Failed { .. } => "failed",
            EventKind::CancelRequested => "cancel_requested",
            EventKind::Cancelled { .. } => "cancelled",
        }
    }

    /// Whether this event ends the job's lifecycle
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
