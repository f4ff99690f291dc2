//! ComfyUI HTTP endpoints used by the worker.
//!
//! One method per endpoint; no retries. Non-2xx responses become
//! [`ComfyUIApiError::ApiError`] with the body kept for the job error.

use std::time::Duration;

use reqwest::RequestBuilder;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;

const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Body text used when an error response cannot be read.
const UNREADABLE_BODY: &str = "<unreadable body>";

pub struct ComfyUIApi {
    client: reqwest::Client,
    api_url: String,
}

/// Acknowledgement from `POST /prompt`.
#[derive(Debug, Deserialize)]
pub struct SubmitResponse {
    pub prompt_id: String,
    /// Queue position at submission time.
    #[serde(default)]
    pub number: i64,
    /// Per-node validation failures; `{}` when the graph was accepted.
    #[serde(default)]
    pub node_errors: serde_json::Value,
}

/// Acknowledgement from `POST /upload/image`.
#[derive(Debug, Deserialize)]
pub struct UploadResponse {
    /// Stored name. ComfyUI may rename to avoid collisions.
    pub name: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(default, rename = "type")]
    pub store: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ComfyUIApiError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("ComfyUI API error ({status}): {body}")]
    ApiError { status: u16, body: String },
}

impl ComfyUIApi {
    /// `api_url` is the HTTP base, e.g. `http://host:8188`.
    pub fn new(api_url: String) -> Self {
        Self::with_client(reqwest::Client::new(), api_url)
    }

    pub fn with_client(client: reqwest::Client, api_url: String) -> Self {
        Self { client, api_url }
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.api_url)
    }

    /// Store `bytes` in ComfyUI's input directory as a PNG, replacing
    /// any file with the same name.
    pub async fn upload_image(&self, bytes: Vec<u8>, filename: &str) -> Result<UploadResponse, ComfyUIApiError> {
        let image = reqwest::multipart::Part::bytes(bytes)
            .file_name(filename.to_string())
            .mime_str("image/png")?;
        let form = reqwest::multipart::Form::new()
            .part("image", image)
            .text("overwrite", "true");

        let request = self.client.post(self.url("/upload/image")).multipart(form);
        Self::json(request).await
    }

    /// Queue `workflow`; its events go to sockets opened with `client_id`.
    pub async fn submit_workflow(
        &self,
        workflow: &serde_json::Value,
        client_id: &str,
    ) -> Result<SubmitResponse, ComfyUIApiError> {
        let request = self
            .client
            .post(self.url("/prompt"))
            .json(&json!({"prompt": workflow, "client_id": client_id}));
        Self::json(request).await
    }

    /// Drop a prompt that has not started yet. A running prompt is left
    /// alone; see [`interrupt`](Self::interrupt).
    pub async fn cancel_execution(&self, prompt_id: &str) -> Result<(), ComfyUIApiError> {
        let request = self
            .client
            .post(self.url("/queue"))
            .json(&json!({"delete": [prompt_id]}));
        Self::send(request).await.map(drop)
    }

    /// Stop a running prompt. Older servers ignore the id and stop
    /// whatever is executing.
    pub async fn interrupt(&self, prompt_id: &str) -> Result<(), ComfyUIApiError> {
        let request = self
            .client
            .post(self.url("/interrupt"))
            .json(&json!({"prompt_id": prompt_id}));
        Self::send(request).await.map(drop)
    }

    /// History keyed by prompt id; `{}` when the id is unknown.
    pub async fn get_history(&self, prompt_id: &str) -> Result<serde_json::Value, ComfyUIApiError> {
        let request = self.client.get(self.url(&format!("/history/{prompt_id}")));
        Self::json(request).await
    }

    /// Bytes of a stored file.
    pub async fn view(&self, filename: &str, subfolder: &str, store: &str) -> Result<Vec<u8>, ComfyUIApiError> {
        let request = self
            .client
            .get(self.url("/view"))
            .query(&[("filename", filename), ("subfolder", subfolder), ("type", store)]);
        let response = Self::send(request).await?;
        Ok(response.bytes().await?.to_vec())
    }

    /// Status code of `GET /`. Any status counts as an answer.
    pub async fn ping(&self) -> Result<u16, ComfyUIApiError> {
        let response = self.client.get(&self.api_url).timeout(PING_TIMEOUT).send().await?;
        Ok(response.status().as_u16())
    }

    async fn send(request: RequestBuilder) -> Result<reqwest::Response, ComfyUIApiError> {
        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| UNREADABLE_BODY.to_string());
        Err(ComfyUIApiError::ApiError {
            status: status.as_u16(),
            body,
        })
    }

    async fn json<T: DeserializeOwned>(request: RequestBuilder) -> Result<T, ComfyUIApiError> {
        Ok(Self::send(request).await?.json::<T>().await?)
    }
}
