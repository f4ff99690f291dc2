//! Event socket setup.
//!
//! ComfyUI routes execution events to the sockets whose `clientId`
//! matches the `client_id` a prompt was submitted with, so each
//! [`ComfyUIClient`] carries one id for both.

use tokio_tungstenite::{connect_async, MaybeTlsStream};

pub type ComfyUIStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

pub struct ComfyUIClient {
    ws_url: String,
    client_id: String,
}

/// An open event socket.
pub struct ComfyUIConnection {
    pub client_id: String,
    pub ws_stream: ComfyUIStream,
}

#[derive(Debug, thiserror::Error)]
pub enum ComfyUIClientError {
    #[error("Connection error: {0}")]
    Connection(String),
}

impl ComfyUIClient {
    /// Client for the instance at HTTP base `api_url`, with a random id.
    pub fn new(api_url: &str) -> Self {
        Self::with_client_id(api_url, uuid::Uuid::new_v4().to_string())
    }

    pub fn with_client_id(api_url: &str, client_id: String) -> Self {
        Self {
            ws_url: ws_url_for(api_url),
            client_id,
        }
    }

    pub fn ws_url(&self) -> &str {
        &self.ws_url
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Open `/ws?clientId=<id>`.
    pub async fn connect(&self) -> Result<ComfyUIConnection, ComfyUIClientError> {
        let url = format!("{}/ws?clientId={}", self.ws_url, self.client_id);
        let (ws_stream, _) = connect_async(&url)
            .await
            .map_err(|e| ComfyUIClientError::Connection(format!("{}: {e}", self.ws_url)))?;

        tracing::debug!(client_id = %self.client_id, ws_url = %self.ws_url, "Event socket connected");
        Ok(ComfyUIConnection {
            client_id: self.client_id.clone(),
            ws_stream,
        })
    }
}

/// `http(s)://` base to `ws(s)://` base; other schemes pass through.
fn ws_url_for(api_url: &str) -> String {
    let base = api_url.trim_end_matches('/');
    match base.split_once("://") {
        Some(("https", rest)) => format!("wss://{rest}"),
        Some(("http", rest)) => format!("ws://{rest}"),
        _ => base.to_string(),
    }
}
