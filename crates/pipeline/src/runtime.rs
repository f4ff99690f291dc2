//! Shared plumbing for handlers that run a ComfyUI workflow.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use diffbox_comfyui::executor::RemoteExecutor;
use diffbox_comfyui::outputs::OutputKind;
use diffbox_comfyui::tracker::ExecutionProgress;
use diffbox_core::config::WorkerConfig;
use diffbox_core::handler::JobContext;
use diffbox_core::progress::ProgressReporter;

use crate::error::PipelineError;
use crate::inputs::file_stem;
use crate::templates::{self, RoleBindings, RoleSchema, TemplateStore, WorkflowGraph};

/// Share of overall job progress reached before remote execution starts.
const EXECUTION_START: f64 = 0.10;
/// Share of overall job progress covered by remote execution.
const EXECUTION_SPAN: f64 = 0.85;

/// Maps remote step progress onto the execution share of a job.
struct MappedProgress<'a> {
    reporter: &'a dyn ProgressReporter,
}

impl ExecutionProgress for MappedProgress<'_> {
    fn on_progress(&self, fraction: f64, stage: &str) {
        self.reporter
            .report(EXECUTION_START + fraction * EXECUTION_SPAN, stage, None);
    }
}

/// Everything a workflow handler needs to run a graph on ComfyUI.
pub struct WorkflowRuntime {
    executor: RemoteExecutor,
    templates: TemplateStore,
    outputs_dir: PathBuf,
    timeout: Duration,
}

impl WorkflowRuntime {
    pub fn new(config: &WorkerConfig) -> Self {
        tracing::info!(comfyui_url = %config.comfyui_url, "Initializing ComfyUI client");
        Self::with_executor(
            RemoteExecutor::new(&config.comfyui_url),
            TemplateStore::new(&config.templates_dir),
            config.outputs_dir.clone(),
            config.comfyui_timeout,
        )
    }

    pub fn with_executor(
        executor: RemoteExecutor,
        templates: TemplateStore,
        outputs_dir: PathBuf,
        timeout: Duration,
    ) -> Self {
        Self {
            executor,
            templates,
            outputs_dir,
            timeout,
        }
    }

    pub fn executor(&self) -> &RemoteExecutor {
        &self.executor
    }

    pub fn outputs_dir(&self) -> &Path {
        &self.outputs_dir
    }

    /// Load `workflow`, substitute `bindings` and validate the result.
    pub async fn build_graph(
        &self,
        workflow: &str,
        schema: &RoleSchema,
        bindings: &RoleBindings,
    ) -> Result<WorkflowGraph, PipelineError> {
        let template = self.templates.load(workflow).await?;
        let graph = templates::build(&template, schema, bindings)?;
        templates::validate(&graph)?;
        Ok(graph)
    }

    /// Upload a PNG input image; returns the name ComfyUI stored it under.
    pub async fn upload_image(&self, png: Vec<u8>, filename: &str) -> Result<String, PipelineError> {
        Ok(self.executor.upload_asset(png, filename).await?)
    }

    /// Execute `graph`, then download its `kind` output into
    /// `<outputs_dir>/<job_id>.<extension>`.
    pub async fn run_to_file(
        &self,
        job_id: &str,
        graph: &WorkflowGraph,
        kind: OutputKind,
        extension: &str,
        ctx: &JobContext<'_>,
    ) -> Result<PathBuf, PipelineError> {
        if ctx.cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        ctx.progress.report(EXECUTION_START, "Starting ComfyUI execution", None);
        let started = Instant::now();
        let mapped = MappedProgress {
            reporter: ctx.progress,
        };
        let execution = self
            .executor
            .execute(&graph.to_value(), &mapped, self.timeout, &ctx.cancel)
            .await?;
        tracing::info!(
            job_id = %job_id,
            prompt_id = %execution.submission_id,
            duration_secs = started.elapsed().as_secs_f64(),
            "Inference completed",
        );

        let output = execution
            .outputs
            .get(&kind)
            .ok_or(PipelineError::MissingOutput(kind))?;

        ctx.progress.report(
            EXECUTION_START + EXECUTION_SPAN,
            &format!("Downloading output {kind}"),
            None,
        );
        let bytes = self.executor.download_output(output).await?;

        tokio::fs::create_dir_all(&self.outputs_dir)
            .await
            .map_err(|e| PipelineError::io(format!("creating {}", self.outputs_dir.display()), e))?;
        let path = self
            .outputs_dir
            .join(format!("{}.{extension}", file_stem(job_id)));
        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|e| PipelineError::io(format!("writing {}", path.display()), e))?;

        tracing::info!(job_id = %job_id, path = %path.display(), size = bytes.len(), "Output saved");
        Ok(path)
    }
}
