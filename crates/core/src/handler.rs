//! The job handler contract.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::JobError;
use crate::progress::ProgressReporter;
use crate::types::Job;

/// Per-invocation context handed to a [`JobHandler`].
pub struct JobContext<'a> {
    /// Where progress updates for this job go.
    pub progress: &'a dyn ProgressReporter,
    /// Cancelled when the worker is asked to stop while the job runs.
    pub cancel: CancellationToken,
}

/// One job type's inference logic.
///
/// Instances are created once per job type and reused for every job of
/// that type, so implementations must not keep per-job state between
/// calls. The supervisor never invokes a handler concurrently.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Run `job` to completion and return its output object.
    async fn run(&self, job: &Job, ctx: JobContext<'_>) -> Result<serde_json::Value, JobError>;
}
