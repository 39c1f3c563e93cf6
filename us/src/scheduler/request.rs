//! Request and response types for the scheduler API

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::{JobId, JobStatus, Payload, Priority};

use super::conflict::{ConflictPredicate, ConflictResolution};

/// A submission: payload plus scheduling options
pub struct JobRequest {
    /// Caller-supplied id; generated when None
    pub id: Option<JobId>,
    pub payload: Payload,
    pub group_key: String,
    /// Falls back to the configured default priority
    pub priority: Option<Priority>,
    /// Falls back to the configured default conflict resolution
    pub conflict_resolution: Option<ConflictResolution>,
    /// Narrows which same-group jobs count as conflicting
    pub conflict_predicate: Option<ConflictPredicate>,
    /// Falls back to the configured default job timeout
    pub timeout: Option<Duration>,
}

impl JobRequest {
    pub fn new(payload: Payload, group_key: impl Into<String>) -> Self {
        Self {
            id: None,
            payload,
            group_key: group_key.into(),
            priority: None,
            conflict_resolution: None,
            conflict_predicate: None,
            timeout: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<JobId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_conflict_resolution(mut self, resolution: ConflictResolution) -> Self {
        self.conflict_resolution = Some(resolution);
        self
    }

    pub fn with_conflict_predicate(mut self, predicate: ConflictPredicate) -> Self {
        self.conflict_predicate = Some(predicate);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl std::fmt::Debug for JobRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRequest")
            .field("id", &self.id)
            .field("group_key", &self.group_key)
            .field("priority", &self.priority)
            .field("conflict_resolution", &self.conflict_resolution)
            .field("has_conflict_predicate", &self.conflict_predicate.is_some())
            .field("timeout", &self.timeout)
            .field("payload_size", &self.payload.len())
            .finish()
    }
}

/// Result of a submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitReceipt {
    pub id: JobId,
    /// Status right after admission and dispatch
    pub status: JobStatus,
    /// 1-based queue position when still waiting
    pub position: Option<usize>,
    /// Jobs this submission conflicted with (held or replaced)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflicts_with: Vec<JobId>,
}

/// Result of a control operation (cancel, resolve, requeue)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlOutcome {
    /// Whether the operation applied to the job's current state
    pub success: bool,
    /// Job status after the operation
    pub status: JobStatus,
}

/// Selects jobs for `Scheduler::list`
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub group_key: Option<String>,
}

impl JobFilter {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn group(group_key: impl Into<String>) -> Self {
        Self {
            group_key: Some(group_key.into()),
            ..Default::default()
        }
    }

    pub fn matches(&self, status: JobStatus, group_key: &str) -> bool {
        self.status.is_none_or(|s| s == status) && self.group_key.as_deref().is_none_or(|g| g == group_key)
    }
}
