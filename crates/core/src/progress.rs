//! Progress reporting seam between handlers and the supervisor.
//!
//! Handlers receive a `&dyn ProgressReporter` and call it whenever they
//! make headway. The supervisor's implementation turns each call into a
//! `progress` envelope for the controller.

/// Sink for job progress updates.
pub trait ProgressReporter: Send + Sync {
    /// Report that the job is `fraction` (0.0 to 1.0) done and currently
    /// in `stage`. `preview` optionally carries a base64 preview image.
    fn report(&self, fraction: f64, stage: &str, preview: Option<&str>);
}

/// A reporter that drops every update.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _fraction: f64, _stage: &str, _preview: Option<&str>) {}
}
