//! Statistics and health snapshots

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sysinfo::{ProcessesToUpdate, System};
use tracing::debug;

use crate::domain::Priority;

/// Point-in-time view of the scheduler
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Statistics {
    pub queue: QueueStats,
    pub processing: ProcessingStats,
    pub completed: CompletedStats,
    pub performance: PerformanceStats,
    pub memory: MemoryStats,
    pub collected_at: DateTime<Utc>,
}

/// Jobs that are not running and not finished
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStats {
    /// waiting + retry_scheduled + conflict
    pub total: usize,
    /// In the priority queue
    pub waiting: usize,
    pub retry_scheduled: usize,
    pub conflict: usize,
    pub capacity: usize,
    /// Waiting jobs per band, every level present
    pub by_priority: BTreeMap<Priority, usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessingStats {
    pub total: usize,
    pub max_concurrent: usize,
    pub by_group: BTreeMap<String, usize>,
    /// Highest `total` seen since the scheduler started
    pub peak: usize,
}

/// Terminal jobs still held in history
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompletedStats {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub cancelled: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerformanceStats {
    /// successful / total finished, 0 when nothing finished
    pub success_rate: f64,
    pub average_duration_ms: Option<u64>,
    pub peak_duration_ms: Option<u64>,
    /// Retries scheduled across the jobs in history
    pub total_retries: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryStats {
    /// Resident memory of this process, None when the platform can't say
    pub resident_bytes: Option<u64>,
}

impl CompletedStats {
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.successful as f64 / self.total as f64
        }
    }
}

/// Overall health level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
        }
    }
}

/// Health derived from queue depth and running count against high-water marks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub queue_length: usize,
    pub queue_high_water: usize,
    pub running: usize,
    pub running_high_water: usize,
    /// False once shutdown has begun
    pub accepting: bool,
    pub issues: Vec<String>,
    pub checked_at: DateTime<Utc>,
}

/// `ceil(cap * ratio)`, never below 1
pub fn high_water_mark(cap: usize, ratio: f64) -> usize {
    ((cap as f64 * ratio).ceil() as usize).max(1)
}

impl HealthReport {
    pub fn evaluate(
        queue_length: usize,
        queue_capacity: usize,
        queue_ratio: f64,
        running: usize,
        running_cap: usize,
        running_ratio: f64,
        accepting: bool,
    ) -> Self {
        let queue_high_water = high_water_mark(queue_capacity, queue_ratio);
        let running_high_water = high_water_mark(running_cap, running_ratio);

        let mut issues = Vec::new();
        if queue_length >= queue_high_water {
            issues.push(format!(
                "queue length {} at or above high-water mark {}",
                queue_length, queue_high_water
            ));
        }
        if running >= running_high_water {
            issues.push(format!(
                "{} jobs running, at or above high-water mark {}",
                running, running_high_water
            ));
        }
        if !accepting {
            issues.push("scheduler is shutting down".to_string());
        }

        let status = if issues.is_empty() {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        };
        debug!(%status, queue_length, running, "HealthReport::evaluate");

        Self {
            status,
            queue_length,
            queue_high_water,
            running,
            running_high_water,
            accepting,
            issues,
            checked_at: Utc::now(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

/// Resident memory of the current process in bytes
pub fn process_memory_bytes() -> Option<u64> {
    let pid = sysinfo::get_current_pid().ok()?;
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    let bytes = sys.process(pid).map(|p| p.memory());
    debug!(?bytes, "process_memory_bytes");
    bytes
}
