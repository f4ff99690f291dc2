//! Execution tracking over a ComfyUI event stream.
//!
//! Reads frames from a WebSocket connection scoped to one client id,
//! filters them down to a single prompt, forwards step progress, and
//! stops at the first terminal condition: completion, remote failure,
//! the overall deadline, or cancellation.
//!
//! The socket is shared by every prompt the same client submits, and
//! some servers broadcast progress without a prompt id, so every
//! prompt-scoped message is checked against the tracked id before it is
//! interpreted.

use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;

use crate::messages::{parse_event, ServerEvent};

/// How long to wait for a single frame before logging that the stream
/// is quiet. Silence alone never ends tracking.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Receives step progress while an execution is tracked.
pub trait ExecutionProgress: Send + Sync {
    /// `fraction` is in `[0, 1]`; `stage` is a short human description
    /// such as `"3: Step 4/20"`.
    fn on_progress(&self, fraction: f64, stage: &str);
}

impl<F> ExecutionProgress for F
where
    F: Fn(f64, &str) + Send + Sync,
{
    fn on_progress(&self, fraction: f64, stage: &str) {
        self(fraction, stage)
    }
}

/// How tracking of one prompt ended.
#[derive(Debug, Clone, PartialEq)]
pub enum TrackOutcome {
    /// The prompt finished executing.
    Completed,
    /// ComfyUI reported an error or interruption for the prompt.
    Failed {
        node_id: Option<String>,
        message: String,
    },
    /// The deadline passed without a terminal event.
    TimedOut { elapsed: Duration },
    /// The cancellation token fired.
    Cancelled,
}

/// Connection-level failures while tracking.
#[derive(Debug, thiserror::Error)]
pub enum TrackingError {
    #[error("event stream closed before the execution finished")]
    Closed,

    #[error("event stream receive error: {0}")]
    Receive(#[from] tungstenite::Error),
}

/// Tracks one prompt on an event stream.
pub struct Tracker<'a> {
    prompt_id: &'a str,
    progress: &'a dyn ExecutionProgress,
    timeout: Duration,
    poll_interval: Duration,
}

impl<'a> Tracker<'a> {
    pub fn new(prompt_id: &'a str, progress: &'a dyn ExecutionProgress, timeout: Duration) -> Self {
        Self {
            prompt_id,
            progress,
            timeout,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Override the quiet-stream logging interval.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Consume frames from `stream` until a terminal condition.
    ///
    /// The deadline is measured from the moment this is called; a stream
    /// that never produces a terminal event yields
    /// [`TrackOutcome::TimedOut`] after exactly `timeout`.
    pub async fn run<S>(
        &self,
        stream: &mut S,
        cancel: &CancellationToken,
    ) -> Result<TrackOutcome, TrackingError>
    where
        S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
    {
        let started = Instant::now();
        let deadline = started + self.timeout;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::info!(prompt_id = %self.prompt_id, "Tracking cancelled");
                    return Ok(TrackOutcome::Cancelled);
                }
                _ = tokio::time::sleep_until(deadline) => {
                    let elapsed = started.elapsed();
                    tracing::warn!(
                        prompt_id = %self.prompt_id,
                        elapsed_secs = elapsed.as_secs_f64(),
                        "Execution tracking timed out",
                    );
                    return Ok(TrackOutcome::TimedOut { elapsed });
                }
                next = tokio::time::timeout(self.poll_interval, stream.next()) => next,
            };

            let frame = match next {
                Err(_) => {
                    tracing::debug!(
                        prompt_id = %self.prompt_id,
                        waited_secs = started.elapsed().as_secs(),
                        "No events within poll interval, still waiting",
                    );
                    continue;
                }
                Ok(None) => return Err(TrackingError::Closed),
                Ok(Some(Err(e))) => return Err(TrackingError::Receive(e)),
                Ok(Some(Ok(frame))) => frame,
            };

            match frame {
                Message::Text(text) => {
                    if let Some(outcome) = self.handle_text(&text) {
                        return Ok(outcome);
                    }
                }
                Message::Binary(_) => {
                    // Latent preview images; not forwarded.
                    tracing::trace!(prompt_id = %self.prompt_id, "Ignoring binary preview frame");
                }
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
                Message::Close(frame) => {
                    tracing::warn!(prompt_id = %self.prompt_id, ?frame, "ComfyUI closed the event stream");
                    return Err(TrackingError::Closed);
                }
            }
        }
    }

    /// Interpret one text frame. Returns the outcome if it is terminal.
    fn handle_text(&self, text: &str) -> Option<TrackOutcome> {
        let msg = match parse_event(text) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::debug!(error = %e, raw_message = %truncate(text, 200), "Skipping unrecognised ComfyUI message");
                return None;
            }
        };

        if let Some(id) = msg.prompt_id() {
            if id != self.prompt_id {
                tracing::trace!(prompt_id = %self.prompt_id, other = %id, "Ignoring event for another prompt");
                return None;
            }
        }

        match msg {
            // Unscoped progress is attributed to the tracked prompt. Only
            // prompts submitted under this socket's client id reach it.
            ServerEvent::Progress(data) => {
                let fraction = (data.value as f64 / data.max.max(1) as f64).clamp(0.0, 1.0);
                let mut stage = format!("Step {}/{}", data.value, data.max);
                if let Some(node) = &data.node {
                    stage = format!("{node}: {stage}");
                }
                tracing::debug!(prompt_id = %self.prompt_id, fraction, stage = %stage, "Generation progress");
                self.progress.on_progress(fraction, &stage);
                None
            }
            ServerEvent::Executing(data) => {
                // Unscoped `executing` frames cannot be attributed.
                data.prompt_id.as_ref()?;
                match data.node {
                    Some(node) => {
                        tracing::debug!(prompt_id = %self.prompt_id, node = %node, "Executing node");
                        None
                    }
                    None => {
                        tracing::info!(prompt_id = %self.prompt_id, "Execution completed (all nodes done)");
                        Some(TrackOutcome::Completed)
                    }
                }
            }
            ServerEvent::ExecutionSuccess(_) => {
                tracing::info!(prompt_id = %self.prompt_id, "Execution reported success");
                Some(TrackOutcome::Completed)
            }
            ServerEvent::ExecutionError(data) => {
                tracing::error!(
                    prompt_id = %self.prompt_id,
                    node_id = %data.node_id,
                    error_type = %data.exception_type,
                    error_message = %data.exception_message,
                    "Execution error",
                );
                Some(TrackOutcome::Failed {
                    node_id: Some(data.node_id),
                    message: data.exception_message,
                })
            }
            ServerEvent::ExecutionInterrupted(data) => {
                tracing::warn!(prompt_id = %self.prompt_id, node_id = ?data.node_id, "Execution interrupted");
                Some(TrackOutcome::Failed {
                    node_id: data.node_id,
                    message: "execution interrupted".to_string(),
                })
            }
            ServerEvent::ExecutionStart(_) => {
                tracing::debug!(prompt_id = %self.prompt_id, "Execution started");
                None
            }
            ServerEvent::ExecutionCached(data) => {
                tracing::debug!(prompt_id = %self.prompt_id, cached = data.nodes.len(), "Execution used cache");
                None
            }
            ServerEvent::Executed(data) => {
                tracing::debug!(prompt_id = %self.prompt_id, node = %data.node, "Node executed with output");
                None
            }
            ServerEvent::Status(data) => {
                tracing::debug!(
                    queue_remaining = data.status.exec_info.queue_remaining,
                    "ComfyUI queue status",
                );
                None
            }
        }
    }
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
