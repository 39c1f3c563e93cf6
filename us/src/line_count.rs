//! Sample processor: counts lines and data rows of a text upload
//!
//! Stands in for the real file parsers so the CLI has something to
//! schedule. It can be told to fail on purpose to exercise the retry path.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde_json::{Value, json};
use tracing::debug;

use crate::scheduler::{JobContext, JobProcessor, ProcessorError};

const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Counts newline-terminated lines, reporting progress per chunk
#[derive(Debug, Clone)]
pub struct LineCountProcessor {
    fail_first: u32,
    fail_rate: f64,
    chunk_size: usize,
    chunk_delay: Duration,
}

impl Default for LineCountProcessor {
    fn default() -> Self {
        Self {
            fail_first: 0,
            fail_rate: 0.0,
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_delay: Duration::ZERO,
        }
    }
}

impl LineCountProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail attempts `1..=n` of every job
    pub fn with_fail_first(mut self, n: u32) -> Self {
        self.fail_first = n;
        self
    }

    /// Fail each attempt with probability `rate`
    pub fn with_fail_rate(mut self, rate: f64) -> Self {
        self.fail_rate = rate.clamp(0.0, 1.0);
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Pause after each chunk, to make progress visible on small files
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }
}

#[async_trait]
impl JobProcessor for LineCountProcessor {
    async fn process(&self, ctx: JobContext) -> Result<Value, ProcessorError> {
        debug!(job_id = %ctx.job_id, attempt = ctx.attempt, "LineCountProcessor::process: called");

        if ctx.attempt <= self.fail_first {
            return Err(ProcessorError::failed(format!(
                "simulated failure on attempt {} of {}",
                ctx.attempt, self.fail_first
            )));
        }
        let roll_failed = self.fail_rate > 0.0 && rand::rng().random_bool(self.fail_rate);
        if roll_failed {
            return Err(ProcessorError::failed("simulated random failure"));
        }

        let data = &ctx.payload.data;
        let total = data.len().max(1);
        let mut lines = 0usize;
        let mut processed = 0usize;

        ctx.report(0.0, "counting", None).await;
        for chunk in data.chunks(self.chunk_size) {
            if ctx.is_cancelled() {
                debug!(job_id = %ctx.job_id, processed, "LineCountProcessor::process: cancelled");
                return Err(ProcessorError::failed("cancelled"));
            }
            lines += chunk.iter().filter(|b| **b == b'\n').count();
            processed += chunk.len();
            let message = format!("{} of {} bytes", processed, data.len());
            ctx.report(processed as f64 * 100.0 / total as f64, "counting", Some(&message))
                .await;
            if !self.chunk_delay.is_zero() {
                tokio::time::sleep(self.chunk_delay).await;
            }
        }
        if data.last().is_some_and(|b| *b != b'\n') {
            lines += 1;
        }

        Ok(json!({
            "file": ctx.payload.file_name,
            "bytes": data.len(),
            "lines": lines,
            // First line is the header
            "rows": lines.saturating_sub(1),
        }))
    }
}
