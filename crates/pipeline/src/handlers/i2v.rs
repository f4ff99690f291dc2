//! Image-to-video through the `i2v` ComfyUI workflow.

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

const WORKFLOW: &str = "i2v";

/// Substitutable fields of the i2v workflow family. Wan templates use
/// `WanImageToVideo`; SVD templates use the conditioning and linear CFG
/// nodes instead.
const ROLES: &[(&str, &[&str])] = &[
    ("LoadImage", &["image"]),
    ("CLIPTextEncode", &["text"]),
    ("KSampler", &["seed", "cfg", "steps"]),
    ("WanImageToVideo", &["length"]),
    ("SVD_img2vid_Conditioning", &["video_frames", "motion_bucket_id", "fps"]),
    ("VideoLinearCFGGuidance", &["min_cfg"]),
    ("VHS_VideoCombine", &["frame_rate", "format"]),
];

const OUTPUT_FORMAT: &str = "video/h264-mp4";

fn default_frames() -> u32 {
    49
}

fn default_fps() -> u32 {
    8
}

fn default_cfg() -> f64 {
    7.0
}

fn default_motion_bucket() -> u32 {
    127
}

fn default_steps() -> u32 {
    20
}

#[derive(Debug, Deserialize)]
struct I2vParams {
    #[serde(default)]
    prompt: String,
    #[serde(default)]
    input_image: Option<String>,
    #[serde(default)]
    seed: Option<i64>,
    #[serde(default = "default_frames")]
    num_frames: u32,
    #[serde(default = "default_fps")]
    fps: u32,
    #[serde(default = "default_cfg")]
    cfg_scale: f64,
    #[serde(default = "default_motion_bucket")]
    motion_bucket_id: u32,
    #[serde(default = "default_steps")]
    num_inference_steps: u32,
}

impl I2vParams {
    fn bindings(&self, image: &str, seed: u64) -> RoleBindings {
        RoleBindings::new()
            .bind("LoadImage", "image", image)
            .bind("CLIPTextEncode", "text", self.prompt.as_str())
            .bind("KSampler", "seed", seed)
            .bind("KSampler", "cfg", self.cfg_scale)
            .bind("KSampler", "steps", self.num_inference_steps)
            .bind("WanImageToVideo", "length", self.num_frames)
            .bind("SVD_img2vid_Conditioning", "video_frames", self.num_frames)
            .bind("SVD_img2vid_Conditioning", "motion_bucket_id", self.motion_bucket_id)
            .bind("SVD_img2vid_Conditioning", "fps", self.fps)
            .bind("VideoLinearCFGGuidance", "min_cfg", self.cfg_scale)
            .bind("VHS_VideoCombine", "frame_rate", self.fps)
            .bind("VHS_VideoCombine", "format", OUTPUT_FORMAT)
    }
}

/// Handler for `i2v` jobs.
pub struct I2vHandler {
    runtime: WorkflowRuntime,
    schema: RoleSchema,
}

impl I2vHandler {
    pub fn new(config: &WorkerConfig) -> Self {
        Self::with_runtime(WorkflowRuntime::new(config))
    }

    pub fn with_runtime(runtime: WorkflowRuntime) -> Self {
        Self {
            runtime,
            schema: RoleSchema::new(WORKFLOW, ROLES),
        }
    }

    async fn build(&self, params: &I2vParams, image: &str, seed: u64) -> Result<WorkflowGraph, PipelineError> {
        self.runtime
            .build_graph(WORKFLOW, &self.schema, &params.bindings(image, seed))
            .await
    }

    async fn generate(&self, job: &Job, ctx: &JobContext<'_>) -> Result<serde_json::Value, PipelineError> {
        let params: I2vParams = decode_params(&job.params)?;
        tracing::info!(
            job_id = %job.id,
            frames = params.num_frames,
            fps = params.fps,
            steps = params.num_inference_steps,
            "Starting i2v job",
        );

        let encoded = params
            .input_image
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| PipelineError::InvalidParams("input_image is required for i2v".into()))?;
        let png = decode_image(encoded)?;
        let seed = resolve_seed(params.seed)?;
        tracing::info!(job_id = %job.id, seed, "Using seed");

        // Validate against the requested upload name before touching ComfyUI.
        let upload_name = format!("i2v_input_{}.png", file_stem(&job.id));
        let mut graph = self.build(&params, &upload_name, seed).await?;

        ctx.progress.report(0.05, "Uploading input image", None);
        let stored = self.runtime.upload_image(png, &upload_name).await?;

        ctx.progress.report(0.10, "Building workflow", None);
        if stored != upload_name {
            graph = self.build(&params, &stored, seed).await?;
        }
        tracing::info!(job_id = %job.id, nodes = graph.node_count(), "Workflow built");

        let path = self
            .runtime
            .run_to_file(&job.id, &graph, OutputKind::Video, "mp4", ctx)
            .await?;

        ctx.progress.report(1.0, "Complete", None);

        Ok(json!({
            "type": "video",
            "path": path.display().to_string(),
            "frames": params.num_frames,
            "seed": seed,
        }))
    }
}

#[async_trait]
impl JobHandler for I2vHandler {
    async fn run(&self, job: &Job, ctx: JobContext<'_>) -> Result<serde_json::Value, JobError> {
        Ok(self.generate(job, &ctx).await?)
    }
}
