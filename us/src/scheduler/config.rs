//! Scheduler configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::domain::Priority;

use super::conflict::ConflictResolution;
use super::error::SchedulerError;

/// Scheduler configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Max jobs processing at once, across all groups
    #[serde(default = "default_max_concurrent_total")]
    pub max_concurrent_total: usize,

    /// Max jobs processing at once within one group key (None = no per-group cap)
    #[serde(default)]
    pub max_concurrent_per_group: Option<usize>,

    /// Max jobs waiting in the queue before submissions are rejected
    #[serde(default = "default_max_queue_length")]
    pub max_queue_length: usize,

    /// Retries after the first failed attempt
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    /// Backoff for the first retry in milliseconds
    #[serde(default = "default_base_retry_delay_ms")]
    pub base_retry_delay_ms: u64,

    /// Backoff ceiling in milliseconds
    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,

    /// Priority for submissions that don't pick one
    #[serde(default)]
    pub default_priority: Priority,

    /// Conflict policy for submissions that don't pick one
    #[serde(default)]
    pub default_conflict_resolution: ConflictResolution,

    /// Default per-job timeout in milliseconds (None = no timeout)
    #[serde(default)]
    pub job_timeout_ms: Option<u64>,

    /// Queue fill ratio at which health degrades
    #[serde(default = "default_queue_high_water_ratio")]
    pub queue_high_water_ratio: f64,

    /// Running/cap ratio at which health degrades
    #[serde(default = "default_running_high_water_ratio")]
    pub running_high_water_ratio: f64,

    /// Buffer of the lossy event tap; subscriptions are unbounded
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,

    /// How long terminal records stay queryable before reap_expired evicts them
    #[serde(default = "default_history_retention_secs")]
    pub history_retention_secs: u64,
}

fn default_max_concurrent_total() -> usize {
    3
}

fn default_max_queue_length() -> usize {
    1000
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_base_retry_delay_ms() -> u64 {
    1000
}

fn default_max_retry_delay_ms() -> u64 {
    30_000
}

fn default_queue_high_water_ratio() -> f64 {
    0.8
}

fn default_running_high_water_ratio() -> f64 {
    1.0
}

fn default_event_channel_capacity() -> usize {
    10_000
}

fn default_history_retention_secs() -> u64 {
    3600
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_total: default_max_concurrent_total(),
            max_concurrent_per_group: None,
            max_queue_length: default_max_queue_length(),
            retry_attempts: default_retry_attempts(),
            base_retry_delay_ms: default_base_retry_delay_ms(),
            max_retry_delay_ms: default_max_retry_delay_ms(),
            default_priority: Priority::Normal,
            default_conflict_resolution: ConflictResolution::Queue,
            job_timeout_ms: None,
            queue_high_water_ratio: default_queue_high_water_ratio(),
            running_high_water_ratio: default_running_high_water_ratio(),
            event_channel_capacity: default_event_channel_capacity(),
            history_retention_secs: default_history_retention_secs(),
        }
    }
}

impl SchedulerConfig {
    /// Check the configuration before a scheduler is built from it
    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.max_concurrent_total == 0 {
            return Err(SchedulerError::Validation("max_concurrent_total must be at least 1".to_string()));
        }
        if self.max_concurrent_per_group == Some(0) {
            return Err(SchedulerError::Validation(
                "max_concurrent_per_group must be at least 1 when set".to_string(),
            ));
        }
        if self.max_queue_length == 0 {
            return Err(SchedulerError::Validation("max_queue_length must be at least 1".to_string()));
        }
        if self.base_retry_delay_ms > self.max_retry_delay_ms {
            return Err(SchedulerError::Validation(format!(
                "base_retry_delay_ms ({}) exceeds max_retry_delay_ms ({})",
                self.base_retry_delay_ms, self.max_retry_delay_ms
            )));
        }
        for (name, ratio) in [
            ("queue_high_water_ratio", self.queue_high_water_ratio),
            ("running_high_water_ratio", self.running_high_water_ratio),
        ] {
            if !(ratio > 0.0 && ratio <= 1.0) {
                return Err(SchedulerError::Validation(format!("{} must be in (0, 1], got {}", name, ratio)));
            }
        }
        if self.event_channel_capacity == 0 {
            return Err(SchedulerError::Validation("event_channel_capacity must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn base_retry_delay(&self) -> Duration {
        Duration::from_millis(self.base_retry_delay_ms)
    }

    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_millis(self.max_retry_delay_ms)
    }

    pub fn job_timeout(&self) -> Option<Duration> {
        self.job_timeout_ms.map(Duration::from_millis)
    }

    pub fn history_retention(&self) -> Duration {
        Duration::from_secs(self.history_retention_secs)
    }
}
