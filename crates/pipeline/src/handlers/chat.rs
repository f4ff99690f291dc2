//! Chat completion against a local OpenAI-compatible LLM server.
//!
//! Messages are rendered with the ChatML template used by the
//! Mistral-based chat model and sent as a raw completion, so the worker
//! controls prompt formatting regardless of the server's chat template.

use std::path::PathBuf;

use async_trait::async_trait;
use diffbox_core::config::WorkerConfig;
use diffbox_core::error::JobError;
use diffbox_core::handler::{JobContext, JobHandler};
use diffbox_core::types::Job;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::PipelineError;
use crate::inputs::decode_params;

/// Model directory name under the models root.
const MODEL_NAME: &str = "dolphin-mistral-24b";

const IM_START: &str = "<|im_start|>";
const IM_END: &str = "<|im_end|>";

fn default_role() -> String {
    "user".to_string()
}

fn default_max_tokens() -> u32 {
    512
}

fn default_temperature() -> f64 {
    0.7
}

fn default_top_p() -> f64 {
    0.9
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default = "default_role")]
    role: String,
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatParams {
    #[serde(default)]
    messages: Vec<ChatMessage>,
    #[serde(default = "default_max_tokens")]
    max_tokens: u32,
    #[serde(default = "default_temperature")]
    temperature: f64,
    #[serde(default = "default_top_p")]
    top_p: f64,
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    max_tokens: u32,
    temperature: f64,
    top_p: f64,
    stop: [&'a str; 1],
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
    #[serde(default)]
    usage: Option<CompletionUsage>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    text: String,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionUsage {
    completion_tokens: u64,
}

/// Render messages in ChatML and open the assistant turn.
fn format_chatml(messages: &[ChatMessage]) -> String {
    let mut turns: Vec<String> = messages
        .iter()
        .map(|m| format!("{IM_START}{}\n{}{IM_END}", m.role, m.content))
        .collect();
    turns.push(format!("{IM_START}assistant\n"));
    turns.join("\n")
}

/// Handler for `chat` jobs.
pub struct ChatHandler {
    http: reqwest::Client,
    completions_url: String,
    model: String,
}

impl ChatHandler {
    pub fn new(config: &WorkerConfig) -> Self {
        let model: PathBuf = config.models_dir.join(MODEL_NAME);
        Self::with_endpoint(&config.llm_url, model.display().to_string())
    }

    /// Handler talking to the server at `llm_url` about `model`.
    pub fn with_endpoint(llm_url: &str, model: String) -> Self {
        let completions_url = format!("{}/v1/completions", llm_url.trim_end_matches('/'));
        tracing::info!(url = %completions_url, model = %model, "Chat handler configured");
        Self {
            http: reqwest::Client::new(),
            completions_url,
            model,
        }
    }

    async fn complete(&self, prompt: &str, params: &ChatParams) -> Result<CompletionResponse, PipelineError> {
        let request = CompletionRequest {
            model: &self.model,
            prompt,
            max_tokens: params.max_tokens,
            temperature: params.temperature,
            top_p: params.top_p,
            stop: [IM_END],
        };

        let response = self
            .http
            .post(&self.completions_url)
            .json(&request)
            .send()
            .await
            .map_err(|e| PipelineError::InferenceFailed(format!("completion request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::InferenceFailed(format!(
                "completion server returned {}: {body}",
                status.as_u16()
            )));
        }

        response
            .json()
            .await
            .map_err(|e| PipelineError::InferenceFailed(format!("invalid completion response: {e}")))
    }

    async fn chat(&self, job: &Job, ctx: &JobContext<'_>) -> Result<serde_json::Value, PipelineError> {
        ctx.progress.report(0.1, "Loading model...", None);
        let params: ChatParams = decode_params(&job.params)?;
        if params.messages.is_empty() {
            return Err(PipelineError::InvalidParams("no messages provided".into()));
        }

        ctx.progress.report(0.3, "Preparing prompt...", None);
        let prompt = format_chatml(&params.messages);
        tracing::info!(job_id = %job.id, prompt_chars = prompt.len(), "Generated prompt");

        ctx.progress.report(0.5, "Generating response...", None);
        let completion = tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(PipelineError::Cancelled),
            result = self.complete(&prompt, &params) => result?,
        };

        ctx.progress.report(0.9, "Processing output...", None);
        let usage = completion.usage;
        let choice = completion
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| PipelineError::InferenceFailed("no output generated from model".into()))?;

        let tokens = usage
            .map(|u| u.completion_tokens)
            .unwrap_or_else(|| choice.text.split_whitespace().count() as u64);
        tracing::info!(job_id = %job.id, chars = choice.text.len(), tokens, "Generated response");

        ctx.progress.report(1.0, "Complete", None);

        Ok(json!({
            "response": choice.text,
            "tokens": tokens,
            "finish_reason": choice.finish_reason,
        }))
    }
}

#[async_trait]
impl JobHandler for ChatHandler {
    async fn run(&self, job: &Job, ctx: JobContext<'_>) -> Result<serde_json::Value, JobError> {
        Ok(self.chat(job, &ctx).await?)
    }
}
