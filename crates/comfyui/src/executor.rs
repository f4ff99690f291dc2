//! Single-instance execution facade.
//!
//! [`RemoteExecutor`] combines the REST wrapper, the WebSocket client
//! and the tracker into the submit / track / fetch sequence a job
//! handler needs to run one workflow on ComfyUI.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::api::{ComfyUIApi, ComfyUIApiError};
use crate::client::{ComfyUIClient, ComfyUIConnection};
use crate::outputs::{self, OutputKind, OutputRef};
use crate::tracker::{ExecutionProgress, TrackOutcome, Tracker, DEFAULT_POLL_INTERVAL};

/// Identifies one submitted prompt and the event stream it reports on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionHandle {
    /// Server-assigned prompt id.
    pub submission_id: String,
    /// Client id the prompt was submitted under.
    pub correlation_id: String,
}

/// Final status of a tracked execution.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionStatus {
    Completed,
    Failed {
        node_id: Option<String>,
        message: String,
    },
    TimedOut {
        elapsed: Duration,
    },
    Cancelled,
}

/// What tracking produced. Outputs and history are only populated for
/// [`ExecutionStatus::Completed`].
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    pub outputs: BTreeMap<OutputKind, OutputRef>,
    pub raw_history: serde_json::Value,
}

/// A successfully completed execution.
#[derive(Debug, Clone)]
pub struct Execution {
    pub submission_id: String,
    /// History record of the prompt (the value under its id).
    pub history: serde_json::Value,
    pub outputs: BTreeMap<OutputKind, OutputRef>,
}

/// Errors raised while running a workflow remotely.
///
/// Messages carry no kind prefix; use [`ExecutionError::kind`] for that.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("{0}")]
    UploadFailed(String),

    #[error("{0}")]
    SubmitFailed(String),

    #[error("{0}")]
    TrackingFailed(String),

    #[error("no history recorded for prompt {0}")]
    HistoryNotFound(String),

    #[error("{0}")]
    HistoryFailed(String),

    #[error("{0}")]
    DownloadFailed(String),

    #[error("node {} failed: {message}", .node_id.as_deref().unwrap_or("unknown"))]
    ExecutionFailed {
        node_id: Option<String>,
        message: String,
    },

    #[error("execution did not finish within {}s", .elapsed.as_secs())]
    Timeout { elapsed: Duration },

    #[error("execution cancelled")]
    Cancelled,
}

impl ExecutionError {
    /// Short machine-readable kind of this error.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UploadFailed(_) => "UploadFailed",
            Self::SubmitFailed(_) => "SubmitFailed",
            Self::TrackingFailed(_) => "TrackingFailed",
            Self::HistoryNotFound(_) => "HistoryNotFound",
            Self::HistoryFailed(_) => "HistoryFailed",
            Self::DownloadFailed(_) => "DownloadFailed",
            Self::ExecutionFailed { .. } => "ExecutionFailed",
            Self::Timeout { .. } => "Timeout",
            Self::Cancelled => "Cancelled",
        }
    }
}

/// Runs workflows on one ComfyUI instance.
///
/// Every submission from one executor shares its client id, so events
/// for all of them arrive on sockets opened by this executor; the
/// tracker filters by prompt id.
pub struct RemoteExecutor {
    api: ComfyUIApi,
    client: ComfyUIClient,
    poll_interval: Duration,
}

impl RemoteExecutor {
    /// Executor for the instance at `api_url` with a fresh client id.
    pub fn new(api_url: &str) -> Self {
        Self {
            api: ComfyUIApi::new(api_url.trim_end_matches('/').to_string()),
            client: ComfyUIClient::new(api_url),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Override the quiet-stream logging interval used while tracking.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Client id this executor submits under.
    pub fn client_id(&self) -> &str {
        self.client.client_id()
    }

    /// Upload an input image; returns the name ComfyUI stored it under.
    pub async fn upload_asset(&self, bytes: Vec<u8>, filename: &str) -> Result<String, ExecutionError> {
        let size = bytes.len();
        let response = self
            .api
            .upload_image(bytes, filename)
            .await
            .map_err(|e| ExecutionError::UploadFailed(format!("{filename}: {e}")))?;

        tracing::info!(
            filename = %filename,
            stored_as = %response.name,
            size,
            "Uploaded input image",
        );

        Ok(response.name)
    }

    /// Queue a workflow graph.
    pub async fn submit(&self, graph: &serde_json::Value) -> Result<ExecutionHandle, ExecutionError> {
        let response = self
            .api
            .submit_workflow(graph, self.client.client_id())
            .await
            .map_err(|e| ExecutionError::SubmitFailed(e.to_string()))?;

        let rejected = response
            .node_errors
            .as_object()
            .is_some_and(|errors| !errors.is_empty());
        if rejected {
            return Err(ExecutionError::SubmitFailed(format!(
                "workflow rejected: {}",
                response.node_errors
            )));
        }

        tracing::info!(
            prompt_id = %response.prompt_id,
            queue_position = response.number,
            client_id = %self.client.client_id(),
            "Workflow submitted to ComfyUI",
        );

        Ok(ExecutionHandle {
            submission_id: response.prompt_id,
            correlation_id: self.client.client_id().to_string(),
        })
    }

    /// Open the event stream and track an already submitted prompt.
    ///
    /// The socket is opened under the handle's correlation id, which may
    /// belong to another executor. Events emitted between submission and
    /// connecting may be lost; [`execute`](Self::execute) connects first
    /// to avoid that.
    pub async fn track(
        &self,
        handle: &ExecutionHandle,
        progress: &dyn ExecutionProgress,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, ExecutionError> {
        let mut conn = if handle.correlation_id == self.client.client_id() {
            self.connect().await?
        } else {
            tracing::debug!(
                prompt_id = %handle.submission_id,
                correlation_id = %handle.correlation_id,
                "Tracking a prompt submitted under another client id",
            );
            ComfyUIClient::with_client_id(self.api.api_url(), handle.correlation_id.clone())
                .connect()
                .await
                .map_err(|e| ExecutionError::TrackingFailed(e.to_string()))?
        };
        self.track_on(&mut conn, handle, progress, timeout, cancel).await
    }

    /// Fetch the history record of a prompt.
    pub async fn fetch_history(&self, prompt_id: &str) -> Result<serde_json::Value, ExecutionError> {
        let mut history = self
            .api
            .get_history(prompt_id)
            .await
            .map_err(|e| ExecutionError::HistoryFailed(e.to_string()))?;

        history
            .as_object_mut()
            .and_then(|records| records.remove(prompt_id))
            .ok_or_else(|| ExecutionError::HistoryNotFound(prompt_id.to_string()))
    }

    /// Collect output file references from a history record.
    pub fn extract_outputs(&self, history: &serde_json::Value) -> BTreeMap<OutputKind, OutputRef> {
        outputs::extract_outputs(history)
    }

    /// Download one output file.
    pub async fn download_output(&self, output: &OutputRef) -> Result<Vec<u8>, ExecutionError> {
        let bytes = self
            .api
            .view(&output.filename, &output.subfolder, &output.store)
            .await
            .map_err(|e| ExecutionError::DownloadFailed(format!("{}: {e}", output.filename)))?;

        tracing::debug!(filename = %output.filename, size = bytes.len(), "Downloaded output");
        Ok(bytes)
    }

    /// Submit `graph` and wait for it to finish.
    ///
    /// The event stream is opened before submitting so that no event of
    /// the new prompt can be missed. Any status other than completed is
    /// returned as an error.
    pub async fn execute(
        &self,
        graph: &serde_json::Value,
        progress: &dyn ExecutionProgress,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Execution, ExecutionError> {
        let mut conn = self.connect().await?;

        let handle = match self.submit(graph).await {
            Ok(handle) => handle,
            Err(e) => {
                close(&mut conn).await;
                return Err(e);
            }
        };

        let result = self.track_on(&mut conn, &handle, progress, timeout, cancel).await?;

        match result.status {
            ExecutionStatus::Completed => Ok(Execution {
                submission_id: handle.submission_id,
                history: result.raw_history,
                outputs: result.outputs,
            }),
            ExecutionStatus::Failed { node_id, message } => {
                Err(ExecutionError::ExecutionFailed { node_id, message })
            }
            ExecutionStatus::TimedOut { elapsed } => Err(ExecutionError::Timeout { elapsed }),
            ExecutionStatus::Cancelled => Err(ExecutionError::Cancelled),
        }
    }

    /// Whether the instance answers `GET /` with a success status.
    pub async fn health_check(&self) -> bool {
        match self.api.ping().await {
            Ok(status) => (200..300).contains(&status),
            Err(e) => {
                tracing::debug!(error = %e, api_url = %self.api.api_url(), "ComfyUI health check failed");
                false
            }
        }
    }

    // ---- private helpers ----

    async fn connect(&self) -> Result<ComfyUIConnection, ExecutionError> {
        self.client
            .connect()
            .await
            .map_err(|e| ExecutionError::TrackingFailed(e.to_string()))
    }

    async fn track_on(
        &self,
        conn: &mut ComfyUIConnection,
        handle: &ExecutionHandle,
        progress: &dyn ExecutionProgress,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, ExecutionError> {
        let prompt_id = handle.submission_id.as_str();

        let outcome = Tracker::new(prompt_id, progress, timeout)
            .with_poll_interval(self.poll_interval)
            .run(&mut conn.ws_stream, cancel)
            .await;
        close(conn).await;

        let outcome = outcome.map_err(|e| ExecutionError::TrackingFailed(e.to_string()))?;

        let status = match outcome {
            TrackOutcome::Completed => {
                let history = self.fetch_history(prompt_id).await?;
                let outputs = self.extract_outputs(&history);
                return Ok(ExecutionResult {
                    status: ExecutionStatus::Completed,
                    outputs,
                    raw_history: history,
                });
            }
            TrackOutcome::Failed { node_id, message } => ExecutionStatus::Failed { node_id, message },
            TrackOutcome::TimedOut { elapsed } => {
                self.abandon(prompt_id).await;
                ExecutionStatus::TimedOut { elapsed }
            }
            TrackOutcome::Cancelled => {
                self.abandon(prompt_id).await;
                ExecutionStatus::Cancelled
            }
        };

        Ok(ExecutionResult {
            status,
            outputs: BTreeMap::new(),
            raw_history: serde_json::Value::Null,
        })
    }

    /// Best-effort removal of a prompt we stopped waiting for.
    async fn abandon(&self, prompt_id: &str) {
        if let Err(e) = self.api.cancel_execution(prompt_id).await {
            log_abandon_failure("dequeue", prompt_id, &e);
        }
        if let Err(e) = self.api.interrupt(prompt_id).await {
            log_abandon_failure("interrupt", prompt_id, &e);
        }
    }
}

fn log_abandon_failure(action: &str, prompt_id: &str, error: &ComfyUIApiError) {
    tracing::warn!(prompt_id = %prompt_id, action, error = %error, "Failed to stop abandoned prompt");
}

async fn close(conn: &mut ComfyUIConnection) {
    if let Err(e) = conn.ws_stream.close(None).await {
        tracing::debug!(client_id = %conn.client_id, error = %e, "Error closing ComfyUI event stream");
    }
}
