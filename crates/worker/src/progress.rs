//! Progress reporter that forwards handler updates to the controller.

use std::sync::Mutex;

use diffbox_core::progress::ProgressReporter;
use tokio::sync::mpsc;

use crate::protocol::Envelope;

/// Reporter for a single job.
///
/// Fractions are clamped to `0.0..=1.0` and never move backwards: a
/// report lower than the previous one is sent with the previous value.
pub struct JobProgress {
    job_id: String,
    outbox: mpsc::UnboundedSender<Envelope>,
    last: Mutex<f64>,
}

impl JobProgress {
    pub fn new(job_id: impl Into<String>, outbox: mpsc::UnboundedSender<Envelope>) -> Self {
        Self {
            job_id: job_id.into(),
            outbox,
            last: Mutex::new(0.0),
        }
    }

    fn advance(&self, fraction: f64) -> f64 {
        let mut last = match self.last.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if fraction.is_finite() {
            *last = last.max(fraction.clamp(0.0, 1.0));
        }
        *last
    }
}

impl ProgressReporter for JobProgress {
    fn report(&self, fraction: f64, stage: &str, preview: Option<&str>) {
        let fraction = self.advance(fraction);
        tracing::debug!(job_id = %self.job_id, fraction, stage, "Progress");
        if self
            .outbox
            .send(Envelope::progress(&self.job_id, fraction, stage, preview))
            .is_err()
        {
            tracing::warn!(job_id = %self.job_id, "Output closed, dropping progress update");
        }
    }
}
