//! Instruction-driven image editing through the `qwen` ComfyUI workflow.

use async_trait::async_trait;
use diffbox_comfyui::outputs::OutputKind;
use diffbox_core::config::WorkerConfig;
use diffbox_core::error::JobError;
use diffbox_core::handler::{JobContext, JobHandler};
use diffbox_core::types::Job;
use serde::Deserialize;
use serde_json::json;

use crate::error::PipelineError;
use crate::inputs::{decode_image, decode_params, file_stem, resolve_seed};
use crate::runtime::WorkflowRuntime;
use crate::templates::{RoleBindings, RoleSchema, WorkflowGraph};

const WORKFLOW: &str = "qwen";

const MASK_ROLE: &str = "LoadImageMask";

const ROLES: &[(&str, &[&str])] = &[
    ("LoadImage", &["image"]),
    (MASK_ROLE, &["image"]),
    ("CLIPTextEncode", &["text"]),
    ("KSampler", &["seed", "cfg", "steps", "denoise"]),
];

/// Full denoise so masked regions are regenerated from scratch.
const MASKED_DENOISE: f64 = 1.0;

fn default_cfg() -> f64 {
    7.0
}

fn default_steps() -> u32 {
    28
}

#[derive(Debug, Deserialize)]
struct QwenParams {
    #[serde(default)]
    instruction: Option<String>,
    #[serde(default)]
    prompt: Option<String>,
    /// Up to three source images; only the first is used.
    #[serde(default)]
    edit_images: Vec<String>,
    #[serde(default)]
    mask_image: Option<String>,
    #[serde(default)]
    seed: Option<i64>,
    #[serde(default = "default_cfg")]
    cfg_scale: f64,
    #[serde(default = "default_steps")]
    num_inference_steps: u32,
}

impl QwenParams {
    fn instruction(&self) -> &str {
        self.instruction
            .as_deref()
            .or(self.prompt.as_deref())
            .unwrap_or_default()
    }

    fn bindings(&self, image: &str, mask: Option<&str>, seed: u64) -> RoleBindings {
        let mut bindings = RoleBindings::new()
            .bind("LoadImage", "image", image)
            .bind("CLIPTextEncode", "text", self.instruction())
            .bind("KSampler", "seed", seed)
            .bind("KSampler", "cfg", self.cfg_scale)
            .bind("KSampler", "steps", self.num_inference_steps);
        if let Some(mask) = mask {
            bindings.set(MASK_ROLE, "image", mask);
            bindings.set("KSampler", "denoise", MASKED_DENOISE);
        }
        bindings
    }
}

/// Names an input image is uploaded under and ends up stored as.
struct Upload {
    requested: String,
    stored: String,
    png: Vec<u8>,
}

impl Upload {
    fn new(requested: String, png: Vec<u8>) -> Self {
        Self {
            stored: requested.clone(),
            requested,
            png,
        }
    }
}

/// Handler for `qwen` image edit jobs.
pub struct QwenHandler {
    runtime: WorkflowRuntime,
    schema: RoleSchema,
}

impl QwenHandler {
    pub fn new(config: &WorkerConfig) -> Self {
        Self::with_runtime(WorkflowRuntime::new(config))
    }

    pub fn with_runtime(runtime: WorkflowRuntime) -> Self {
        Self {
            runtime,
            schema: RoleSchema::new(WORKFLOW, ROLES),
        }
    }

    async fn build(
        &self,
        params: &QwenParams,
        image: &Upload,
        mask: Option<&Upload>,
        seed: u64,
    ) -> Result<WorkflowGraph, PipelineError> {
        let bindings = params.bindings(&image.stored, mask.map(|m| m.stored.as_str()), seed);
        self.runtime.build_graph(WORKFLOW, &self.schema, &bindings).await
    }

    async fn upload(&self, upload: &mut Upload) -> Result<(), PipelineError> {
        upload.stored = self
            .runtime
            .upload_image(std::mem::take(&mut upload.png), &upload.requested)
            .await?;
        Ok(())
    }

    async fn edit(&self, job: &Job, ctx: &JobContext<'_>) -> Result<serde_json::Value, PipelineError> {
        let params: QwenParams = decode_params(&job.params)?;
        tracing::info!(
            job_id = %job.id,
            images = params.edit_images.len(),
            masked = params.mask_image.is_some(),
            steps = params.num_inference_steps,
            "Starting qwen job",
        );

        let first = params.edit_images.first().ok_or_else(|| {
            PipelineError::InvalidParams("at least one edit_images entry is required for qwen".into())
        })?;
        if params.edit_images.len() > 1 {
            tracing::debug!(job_id = %job.id, ignored = params.edit_images.len() - 1, "Only the first edit image is used");
        }

        let stem = file_stem(&job.id);
        let mut image = Upload::new(format!("qwen_input_{stem}.png"), decode_image(first)?);
        let mut mask = match params.mask_image.as_deref().filter(|m| !m.is_empty()) {
            Some(encoded) => Some(Upload::new(format!("qwen_mask_{stem}.png"), decode_image(encoded)?)),
            None => None,
        };
        let seed = resolve_seed(params.seed)?;
        tracing::info!(job_id = %job.id, seed, "Using seed");

        let mut graph = self.build(&params, &image, mask.as_ref(), seed).await?;
        if mask.is_some() && !graph.has_role(MASK_ROLE) {
            return Err(PipelineError::InvalidParams(format!(
                "mask_image is not supported: the {WORKFLOW} workflow has no {MASK_ROLE} node"
            )));
        }

        ctx.progress.report(0.05, "Uploading input image", None);
        self.upload(&mut image).await?;
        if let Some(mask) = mask.as_mut() {
            self.upload(mask).await?;
        }

        ctx.progress.report(0.10, "Building workflow", None);
        let renamed = image.stored != image.requested
            || mask.as_ref().is_some_and(|m| m.stored != m.requested);
        if renamed {
            graph = self.build(&params, &image, mask.as_ref(), seed).await?;
        }
        tracing::info!(job_id = %job.id, nodes = graph.node_count(), "Workflow built");

        let path = self
            .runtime
            .run_to_file(&job.id, &graph, OutputKind::Image, "png", ctx)
            .await?;

        ctx.progress.report(1.0, "Complete", None);

        Ok(json!({
            "type": "image",
            "path": path.display().to_string(),
            "seed": seed,
        }))
    }
}

#[async_trait]
impl JobHandler for QwenHandler {
    async fn run(&self, job: &Job, ctx: JobContext<'_>) -> Result<serde_json::Value, JobError> {
        Ok(self.edit(job, &ctx).await?)
    }
}
