//! Conflict detection between a new submission and active jobs of its group

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::domain::{JobId, JobRecord};

/// How a submission that conflicts with active jobs is handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConflictResolution {
    /// Admit normally; ordering and caps decide when it runs
    #[default]
    Queue,
    /// Hold the job in `Conflict` until a caller resolves it
    Reject,
    /// Cancel the older conflicting jobs and admit the new one
    Replace,
}

impl std::fmt::Display for ConflictResolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queue => write!(f, "queue"),
            Self::Reject => write!(f, "reject"),
            Self::Replace => write!(f, "replace"),
        }
    }
}

impl std::str::FromStr for ConflictResolution {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "queue" => Ok(Self::Queue),
            "reject" => Ok(Self::Reject),
            "replace" => Ok(Self::Replace),
            _ => Err(format!("Unknown conflict resolution: {}", s)),
        }
    }
}

/// Caller decision for a job held in `Conflict`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictDecision {
    /// Admit the held job alongside the existing ones
    Proceed,
    /// Cancel the jobs it conflicted with, then admit it
    CancelExisting,
    /// Cancel the held job
    CancelNew,
}

/// Decides whether `(new, existing)` contend for the same logical resource
///
/// Only called for pairs that already share a group key.
pub type ConflictPredicate = Arc<dyn Fn(&JobRecord, &JobRecord) -> bool + Send + Sync>;

/// What the scheduler should do with a new submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictOutcome {
    /// Enqueue normally
    Admit,
    /// Hold in `Conflict`, listing the jobs it clashes with
    Hold(Vec<JobId>),
    /// Cancel these jobs, then enqueue
    Replace(Vec<JobId>),
}

/// Active jobs in the new job's group that the predicate flags
///
/// Without a predicate every active job of the same group conflicts.
pub fn find_conflicts<'a>(
    new: &JobRecord,
    existing: impl IntoIterator<Item = &'a JobRecord>,
    predicate: Option<&ConflictPredicate>,
) -> Vec<JobId> {
    let mut conflicts: Vec<&JobRecord> = existing
        .into_iter()
        .filter(|job| job.id != new.id)
        .filter(|job| job.group_key == new.group_key)
        .filter(|job| job.status.is_active())
        .filter(|job| predicate.is_none_or(|p| p(new, *job)))
        .collect();
    conflicts.sort_by(|a, b| a.submitted_at.cmp(&b.submitted_at).then_with(|| a.id.cmp(&b.id)));
    conflicts.into_iter().map(|job| job.id.clone()).collect()
}

impl ConflictResolution {
    /// Map detected conflicts to an admission outcome under this policy
    pub fn outcome(&self, conflicts: Vec<JobId>) -> ConflictOutcome {
        if conflicts.is_empty() {
            return ConflictOutcome::Admit;
        }
        match self {
            Self::Queue => ConflictOutcome::Admit,
            Self::Reject => ConflictOutcome::Hold(conflicts),
            Self::Replace => ConflictOutcome::Replace(conflicts),
        }
    }
}
