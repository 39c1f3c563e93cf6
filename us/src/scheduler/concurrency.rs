//! Concurrency slots: a global cap plus an optional per-group cap

use std::collections::HashMap;

use tracing::error;

/// Tracks running jobs against the global and per-group caps
///
/// Lives inside the scheduler's state lock, so `try_acquire` is a single
/// decision over both counters.
#[derive(Debug)]
pub struct ConcurrencyController {
    max_total: usize,
    max_per_group: Option<usize>,
    running: usize,
    per_group: HashMap<String, usize>,
    peak: usize,
}

impl ConcurrencyController {
    pub fn new(max_total: usize, max_per_group: Option<usize>) -> Self {
        Self {
            max_total,
            max_per_group,
            running: 0,
            per_group: HashMap::new(),
            peak: 0,
        }
    }

    /// Take a slot for `group_key` if both caps allow it
    pub fn try_acquire(&mut self, group_key: &str) -> bool {
        if self.running >= self.max_total {
            return false;
        }
        let group_running = self.group_running(group_key);
        if self.max_per_group.is_some_and(|cap| group_running >= cap) {
            return false;
        }

        self.running += 1;
        *self.per_group.entry(group_key.to_string()).or_insert(0) += 1;
        self.peak = self.peak.max(self.running);
        true
    }

    /// Give back a slot taken by `try_acquire`
    pub fn release(&mut self, group_key: &str) {
        match self.per_group.get_mut(group_key) {
            Some(count) if *count > 0 && self.running > 0 => {
                *count -= 1;
                if *count == 0 {
                    self.per_group.remove(group_key);
                }
                self.running -= 1;
            }
            _ => {
                error!(%group_key, running = self.running, "ConcurrencyController::release: no slot held for group");
                debug_assert!(false, "released a slot that was never acquired");
            }
        }
    }

    /// Global room left, ignoring group caps
    pub fn has_capacity(&self) -> bool {
        self.running < self.max_total
    }

    pub fn running(&self) -> usize {
        self.running
    }

    pub fn group_running(&self, group_key: &str) -> usize {
        self.per_group.get(group_key).copied().unwrap_or(0)
    }

    pub fn max_total(&self) -> usize {
        self.max_total
    }

    pub fn max_per_group(&self) -> Option<usize> {
        self.max_per_group
    }

    /// Highest number of simultaneous slots ever held
    pub fn peak(&self) -> usize {
        self.peak
    }

    /// Running count per group
    pub fn per_group(&self) -> &HashMap<String, usize> {
        &self.per_group
    }
}
