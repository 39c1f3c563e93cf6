//! Job record - the lifecycle state of one submitted upload
//!
//! A JobRecord is created on submission, mutated only by the scheduler while
//! the job moves through admission, execution and retry, and evicted by an
//! explicit reap call once it has been terminal for long enough.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::priority::Priority;

/// Job identifier, caller supplied or generated
pub type JobId = String;

/// Generate a fresh, time-ordered job id
pub fn new_job_id() -> JobId {
    uuid::Uuid::now_v7().to_string()
}

/// Job lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting in the priority queue
    #[default]
    Queued,
    /// Processor invocation outstanding
    Processing,
    /// Failed, waiting for the backoff timer before re-admission
    RetryScheduled,
    /// Processor succeeded
    Completed,
    /// Retries exhausted
    Failed,
    /// Cancelled by a caller or replaced by a newer job
    Cancelled,
    /// Held until a caller resolves the conflict
    Conflict,
}

impl JobStatus {
    /// Terminal states accept no further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Active jobs are the ones a newly submitted job can conflict with
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Queued | Self::Processing | Self::RetryScheduled)
    }

    /// Whether the lifecycle state machine allows `self -> next`
    ///
    /// Requeueing a failed job is a manual revival and is not a transition
    /// of the state machine; see [`JobRecord::revive`].
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Queued, Processing)
                | (Queued, Cancelled)
                | (Processing, Completed)
                | (Processing, RetryScheduled)
                | (Processing, Failed)
                | (Processing, Cancelled)
                | (RetryScheduled, Queued)
                | (RetryScheduled, Cancelled)
                | (Conflict, Queued)
                | (Conflict, Cancelled)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Processing => write!(f, "processing"),
            Self::RetryScheduled => write!(f, "retry_scheduled"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Conflict => write!(f, "conflict"),
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "queued" => Ok(Self::Queued),
            "processing" => Ok(Self::Processing),
            "retry_scheduled" | "retry-scheduled" => Ok(Self::RetryScheduled),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "conflict" => Ok(Self::Conflict),
            _ => Err(format!("Unknown job status: {}", s)),
        }
    }
}

/// Work input handed to the processor
///
/// The scheduler never looks inside; it only checks the payload is not empty.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Payload {
    /// Original file name of the upload
    pub file_name: Option<String>,

    /// MIME type as reported by the uploader
    pub content_type: Option<String>,

    /// Raw file bytes
    #[serde(default)]
    pub data: Vec<u8>,

    /// Resource identifiers and other caller metadata
    #[serde(default)]
    pub metadata: Value,
}

impl Payload {
    /// Payload carrying raw bytes
    pub fn from_bytes(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            ..Default::default()
        }
    }

    /// Payload carrying only metadata (e.g. a reference to stored content)
    pub fn from_metadata(metadata: Value) -> Self {
        Self {
            metadata,
            ..Default::default()
        }
    }

    pub fn with_file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = Some(file_name.into());
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// No bytes and no metadata
    pub fn is_empty(&self) -> bool {
        self.data.is_empty() && self.metadata.is_null()
    }

    /// Size of the byte content
    pub fn len(&self) -> usize {
        self.data.len()
    }
}

/// Last progress reported by the processor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    /// Percent complete, clamped to 0..=100
    pub percent: f64,
    pub stage: String,
    pub message: Option<String>,
    /// Estimated time remaining, unknown until percent > 0
    pub eta_ms: Option<u64>,
    pub updated_at: DateTime<Utc>,
}

/// Estimate the time remaining from the elapsed time and reported percent
///
/// Returns None until some progress has been reported.
pub fn estimate_remaining(elapsed: Duration, percent: f64) -> Option<Duration> {
    if !percent.is_finite() || percent <= 0.0 {
        return None;
    }
    let percent = percent.min(100.0);
    let total = elapsed.as_secs_f64() * 100.0 / percent;
    Some(Duration::from_secs_f64((total - elapsed.as_secs_f64()).max(0.0)))
}

/// State of one job, owned by the scheduler
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub id: JobId,

    /// Resource this job contends over (e.g. the owning supplier)
    pub group_key: String,

    pub priority: Priority,

    pub status: JobStatus,

    /// Processing attempts made so far
    pub attempt: u32,

    /// Retries scheduled over the record's lifetime
    pub retries: u32,

    /// Dropped once the job no longer needs it
    pub payload: Option<Arc<Payload>>,

    /// Per-job timeout, None means no timeout
    pub timeout: Option<Duration>,

    pub submitted_at: DateTime<Utc>,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,

    pub result: Option<Value>,

    /// Last processor error, verbatim
    pub error: Option<String>,

    pub cancel_requested: bool,

    pub progress: Option<Progress>,

    /// Jobs this one conflicted with at submission
    pub conflicts_with: Vec<JobId>,
}

impl JobRecord {
    /// Create a new queued record
    pub fn new(id: impl Into<JobId>, group_key: impl Into<String>, priority: Priority, payload: Payload) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            group_key: group_key.into(),
            priority,
            status: JobStatus::Queued,
            attempt: 0,
            retries: 0,
            payload: Some(Arc::new(payload)),
            timeout: None,
            submitted_at: now,
            enqueued_at: now,
            started_at: None,
            finished_at: None,
            result: None,
            error: None,
            cancel_requested: false,
            progress: None,
            conflicts_with: Vec::new(),
        }
    }

    /// Payload metadata, Null once the payload was released
    pub fn metadata(&self) -> &Value {
        static NULL: Value = Value::Null;
        self.payload.as_ref().map_or(&NULL, |p| &p.metadata)
    }

    /// Time spent inside the processor, for finished jobs
    pub fn processing_duration(&self) -> Option<Duration> {
        let started = self.started_at?;
        let finished = self.finished_at?;
        (finished - started).to_std().ok()
    }

    /// Move to a terminal state, releasing the payload unless it may be requeued
    pub fn finish(&mut self, status: JobStatus) {
        debug_assert!(status.is_terminal());
        self.status = status;
        self.finished_at = Some(Utc::now());
        if status != JobStatus::Failed {
            self.payload = None;
        }
    }

    /// Reset a failed record for a manual requeue
    pub fn revive(&mut self, priority: Option<Priority>) {
        if let Some(priority) = priority {
            self.priority = priority;
        }
        self.status = JobStatus::Queued;
        self.attempt = 0;
        self.enqueued_at = Utc::now();
        self.started_at = None;
        self.finished_at = None;
        self.result = None;
        self.error = None;
        self.cancel_requested = false;
        self.progress = None;
    }

    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            id: self.id.clone(),
            group_key: self.group_key.clone(),
            priority: self.priority,
            status: self.status,
            attempt: self.attempt,
            retries: self.retries,
            payload_size: self.payload.as_ref().map(|p| p.len()),
            file_name: self.payload.as_ref().and_then(|p| p.file_name.clone()),
            submitted_at: self.submitted_at,
            enqueued_at: self.enqueued_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            result: self.result.clone(),
            error: self.error.clone(),
            cancel_requested: self.cancel_requested,
            progress: self.progress.clone(),
            conflicts_with: self.conflicts_with.clone(),
        }
    }
}

/// Read-only copy of a job record returned by queries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub id: JobId,
    pub group_key: String,
    pub priority: Priority,
    pub status: JobStatus,
    pub attempt: u32,
    pub retries: u32,
    pub payload_size: Option<usize>,
    pub file_name: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub cancel_requested: bool,
    pub progress: Option<Progress>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflicts_with: Vec<JobId>,
}
