//! JobProcessor trait - the work the scheduler runs

use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Instant;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::domain::{JobId, Payload};

use super::core::Inner;
use super::error::ProcessorError;

/// Processes one job attempt
///
/// The scheduler knows nothing about what a processor does. It calls
/// `process` once per attempt and only observes the result and any progress
/// reports. Returning `Err` hands the job to the retry policy.
#[async_trait]
pub trait JobProcessor: Send + Sync {
    async fn process(&self, ctx: JobContext) -> Result<Value, ProcessorError>;
}

/// Everything a processor gets for one attempt
pub struct JobContext {
    pub job_id: JobId,
    pub group_key: String,
    /// 1-based attempt number
    pub attempt: u32,
    pub payload: Arc<Payload>,
    pub progress: ProgressReporter,
    /// Cancelled when a caller cancels the job; observing it is up to the processor
    pub cancel: CancellationToken,
}

impl JobContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Report progress for this attempt
    pub async fn report(&self, percent: f64, stage: &str, message: Option<&str>) {
        self.progress.report(percent, stage, message).await;
    }
}

/// Progress callback handed to the processor
///
/// Reports after the attempt has settled, or after the scheduler is gone,
/// are ignored.
#[derive(Clone)]
pub struct ProgressReporter {
    inner: Weak<Inner>,
    job_id: JobId,
    attempt: u32,
    started: Instant,
}

impl ProgressReporter {
    pub(crate) fn new(inner: Weak<Inner>, job_id: JobId, attempt: u32) -> Self {
        Self {
            inner,
            job_id,
            attempt,
            started: Instant::now(),
        }
    }

    /// Reporter connected to nothing, for driving processors outside a scheduler
    pub fn detached(job_id: impl Into<JobId>) -> Self {
        Self::new(Weak::new(), job_id.into(), 1)
    }

    /// Record `percent` (0-100) with a stage label and optional message
    pub async fn report(&self, percent: f64, stage: &str, message: Option<&str>) {
        let Some(inner) = self.inner.upgrade() else {
            debug!(job_id = %self.job_id, percent, %stage, "ProgressReporter::report: detached, ignoring");
            return;
        };
        inner
            .record_progress(&self.job_id, self.attempt, self.started, percent, stage, message)
            .await;
    }
}

/// Adapts an async closure into a [`JobProcessor`]
pub struct FnProcessor<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> JobProcessor for FnProcessor<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, ProcessorError>> + Send + 'static,
{
    async fn process(&self, ctx: JobContext) -> Result<Value, ProcessorError> {
        (self.f)(ctx).await
    }
}

/// Wrap an async closure as a shareable processor
pub fn processor_fn<F, Fut>(f: F) -> Arc<dyn JobProcessor>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ProcessorError>> + Send + 'static,
{
    Arc::new(FnProcessor { f })
}
