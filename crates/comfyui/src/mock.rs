//! In-process ComfyUI stand-in for tests.
//!
//! Serves the subset of the ComfyUI HTTP and WebSocket surface the
//! executor uses, on an ephemeral local port. Each `/prompt` call plays
//! the configured [`MockScenario`] onto the event stream of the
//! submitting client id; events are buffered until that client's socket
//! reads them, so submitting before connecting loses nothing.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;

/// How the mock answers every submitted prompt.
#[derive(Debug, Clone)]
pub enum MockScenario {
    /// Report `steps` progress events, then finish with `outputs` as the
    /// history `outputs` object.
    Complete {
        steps: u32,
        outputs: serde_json::Value,
    },
    /// Fail the prompt at `node_id`.
    Fail { node_id: String, message: String },
    /// Accept the prompt and never report anything about it.
    Silent,
    /// Acknowledge the prompt with a non-empty `node_errors` object.
    RejectNodes,
}

enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

#[derive(Default)]
struct Session {
    tx: Option<mpsc::UnboundedSender<Frame>>,
    rx: Option<mpsc::UnboundedReceiver<Frame>>,
}

impl Session {
    fn sender(&mut self) -> mpsc::UnboundedSender<Frame> {
        match &self.tx {
            Some(tx) => tx.clone(),
            None => {
                let (tx, rx) = mpsc::unbounded_channel();
                self.tx = Some(tx.clone());
                self.rx = Some(rx);
                tx
            }
        }
    }
}

struct MockState {
    scenario: Mutex<MockScenario>,
    foreign_noise: Mutex<bool>,
    upload_prefix: Mutex<String>,
    sessions: Mutex<HashMap<String, Session>>,
    next_prompt: AtomicU64,
    submitted: Mutex<Vec<serde_json::Value>>,
    uploads: Mutex<Vec<(String, usize)>>,
    cancelled: Mutex<Vec<String>>,
    interrupted: Mutex<Vec<String>>,
    history: Mutex<HashMap<String, serde_json::Value>>,
    files: Mutex<HashMap<String, Vec<u8>>>,
}

impl MockState {
    fn sender(&self, client_id: &str) -> mpsc::UnboundedSender<Frame> {
        lock(&self.sessions).entry(client_id.to_string()).or_default().sender()
    }

    fn take_receiver(&self, client_id: &str) -> Option<mpsc::UnboundedReceiver<Frame>> {
        let mut sessions = lock(&self.sessions);
        let session = sessions.entry(client_id.to_string()).or_default();
        session.sender();
        session.rx.take()
    }

    fn return_receiver(&self, client_id: &str, rx: mpsc::UnboundedReceiver<Frame>) {
        lock(&self.sessions).entry(client_id.to_string()).or_default().rx = Some(rx);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A running mock ComfyUI server. Stops when dropped.
pub struct MockComfyUI {
    addr: SocketAddr,
    state: Arc<MockState>,
    task: tokio::task::JoinHandle<()>,
}

impl MockComfyUI {
    /// Bind to an ephemeral port on 127.0.0.1 and start serving.
    pub async fn start(scenario: MockScenario) -> std::io::Result<Self> {
        let state = Arc::new(MockState {
            scenario: Mutex::new(scenario),
            foreign_noise: Mutex::new(false),
            upload_prefix: Mutex::new(String::new()),
            sessions: Mutex::new(HashMap::new()),
            next_prompt: AtomicU64::new(1),
            submitted: Mutex::new(Vec::new()),
            uploads: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
            interrupted: Mutex::new(Vec::new()),
            history: Mutex::new(HashMap::new()),
            files: Mutex::new(HashMap::new()),
        });

        let app = Router::new()
            .route("/", get(root))
            .route("/upload/image", post(upload_image))
            .route("/prompt", post(submit_prompt))
            .route("/ws", get(ws_handler))
            .route("/history/{prompt_id}", get(history))
            .route("/view", get(view))
            .route("/queue", post(queue))
            .route("/interrupt", post(interrupt))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!(error = %e, "Mock ComfyUI server stopped");
            }
        });

        Ok(Self { addr, state, task })
    }

    /// Base HTTP URL, e.g. `http://127.0.0.1:40123`.
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Replace the scenario used for subsequent prompts.
    pub fn set_scenario(&self, scenario: MockScenario) {
        *lock(&self.state.scenario) = scenario;
    }

    /// Interleave events for an unrelated prompt with every scenario.
    pub fn set_foreign_noise(&self, enabled: bool) {
        *lock(&self.state.foreign_noise) = enabled;
    }

    /// Store uploads under `prefix + requested name` instead of the
    /// requested name.
    pub fn set_upload_prefix(&self, prefix: &str) {
        *lock(&self.state.upload_prefix) = prefix.to_string();
    }

    /// Make a file downloadable through `/view`.
    pub fn add_file(&self, filename: &str, bytes: Vec<u8>) {
        lock(&self.state.files).insert(filename.to_string(), bytes);
    }

    /// Request bodies received on `/prompt`, in order.
    pub fn submitted(&self) -> Vec<serde_json::Value> {
        lock(&self.state.submitted).clone()
    }

    /// `(requested filename, byte length)` per upload, in order.
    pub fn uploads(&self) -> Vec<(String, usize)> {
        lock(&self.state.uploads).clone()
    }

    /// Bytes of an uploaded file, keyed by stored name.
    pub fn uploaded_file(&self, stored_name: &str) -> Option<Vec<u8>> {
        lock(&self.state.files).get(stored_name).cloned()
    }

    /// Prompt ids removed through `/queue`.
    pub fn cancelled(&self) -> Vec<String> {
        lock(&self.state.cancelled).clone()
    }

    /// Prompt ids passed to `/interrupt`.
    pub fn interrupted(&self) -> Vec<String> {
        lock(&self.state.interrupted).clone()
    }
}

impl Drop for MockComfyUI {
    fn drop(&mut self) {
        self.task.abort();
    }
}

// ---- handlers ----

async fn root() -> &'static str {
    "ComfyUI mock"
}

async fn upload_image(State(state): State<Arc<MockState>>, mut multipart: Multipart) -> Response {
    let mut upload = None;
    while let Ok(Some(field)) = multipart.next_field().await {
        if field.name() != Some("image") {
            continue;
        }
        let filename = field.file_name().unwrap_or("upload.png").to_string();
        match field.bytes().await {
            Ok(bytes) => upload = Some((filename, bytes.to_vec())),
            Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
        }
    }

    let Some((filename, bytes)) = upload else {
        return (StatusCode::BAD_REQUEST, "missing image field").into_response();
    };

    let stored = format!("{}{filename}", lock(&state.upload_prefix));
    lock(&state.uploads).push((filename, bytes.len()));
    lock(&state.files).insert(stored.clone(), bytes);

    Json(json!({"name": stored, "subfolder": "", "type": "input"})).into_response()
}

#[derive(Deserialize)]
struct PromptRequest {
    prompt: serde_json::Value,
    client_id: String,
}

async fn submit_prompt(
    State(state): State<Arc<MockState>>,
    Json(body): Json<serde_json::Value>,
) -> Response {
    let request: PromptRequest = match serde_json::from_value(body.clone()) {
        Ok(request) => request,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };
    if !request.prompt.is_object() {
        return (StatusCode::BAD_REQUEST, "prompt must be an object").into_response();
    }
    lock(&state.submitted).push(body);

    let number = state.next_prompt.fetch_add(1, Ordering::SeqCst);
    let prompt_id = format!("prompt-{number}");
    let scenario = lock(&state.scenario).clone();
    let noise = *lock(&state.foreign_noise);
    let tx = state.sender(&request.client_id);
    let send = |frame: Frame| {
        let _ = tx.send(frame);
    };
    let event = |kind: &str, data: serde_json::Value| Frame::Text(json!({"type": kind, "data": data}).to_string());

    if let MockScenario::RejectNodes = scenario {
        return Json(json!({
            "prompt_id": prompt_id,
            "number": number,
            "node_errors": {"1": {"errors": [{"message": "Required input is missing"}]}}
        }))
        .into_response();
    }

    send(event("execution_start", json!({"prompt_id": prompt_id})));
    if noise {
        let foreign = "prompt-foreign";
        send(event("progress", json!({"value": 7, "max": 10, "prompt_id": foreign})));
        send(event(
            "execution_error",
            json!({"prompt_id": foreign, "node_id": "1", "exception_message": "not yours"}),
        ));
        send(event("executing", json!({"node": null, "prompt_id": foreign})));
        send(Frame::Text("{\"type\":\"crystools.monitor\",\"data\":{}}".to_string()));
    }

    match scenario {
        MockScenario::Complete { steps, outputs } => {
            send(event("executing", json!({"node": "3", "prompt_id": prompt_id})));
            for step in 1..=steps {
                send(event(
                    "progress",
                    json!({"value": step, "max": steps, "node": "3", "prompt_id": prompt_id}),
                ));
                send(Frame::Binary(vec![0, 0, 0, 1]));
            }
            lock(&state.history).insert(
                prompt_id.clone(),
                json!({
                    "prompt": [number, prompt_id, request.prompt],
                    "outputs": outputs,
                    "status": {"status_str": "success", "completed": true}
                }),
            );
            send(event("executing", json!({"node": null, "prompt_id": prompt_id})));
        }
        MockScenario::Fail { node_id, message } => {
            send(event(
                "execution_error",
                json!({
                    "prompt_id": prompt_id,
                    "node_id": node_id,
                    "node_type": "KSampler",
                    "exception_message": message,
                    "exception_type": "RuntimeError"
                }),
            ));
        }
        MockScenario::Silent | MockScenario::RejectNodes => {}
    }

    Json(json!({"prompt_id": prompt_id, "number": number, "node_errors": {}})).into_response()
}

#[derive(Deserialize)]
struct WsQuery {
    #[serde(rename = "clientId")]
    client_id: String,
}

async fn ws_handler(
    State(state): State<Arc<MockState>>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| serve_events(state, query.client_id, socket))
}

async fn serve_events(state: Arc<MockState>, client_id: String, mut socket: WebSocket) {
    let Some(mut rx) = state.take_receiver(&client_id) else {
        tracing::warn!(client_id = %client_id, "Second concurrent mock socket for client");
        return;
    };

    let status = json!({
        "type": "status",
        "data": {"status": {"exec_info": {"queue_remaining": 0}}, "sid": client_id}
    });
    if socket.send(Message::Text(status.to_string().into())).await.is_ok() {
        loop {
            tokio::select! {
                frame = rx.recv() => {
                    let message = match frame {
                        Some(Frame::Text(text)) => Message::Text(text.into()),
                        Some(Frame::Binary(bytes)) => Message::Binary(bytes.into()),
                        None => break,
                    };
                    if socket.send(message).await.is_err() {
                        break;
                    }
                }
                incoming = socket.recv() => {
                    match incoming {
                        Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                        Some(Ok(_)) => {}
                    }
                }
            }
        }
    }

    state.return_receiver(&client_id, rx);
}

async fn history(State(state): State<Arc<MockState>>, Path(prompt_id): Path<String>) -> Json<serde_json::Value> {
    let mut records = serde_json::Map::new();
    if let Some(record) = lock(&state.history).get(&prompt_id) {
        records.insert(prompt_id, record.clone());
    }
    Json(serde_json::Value::Object(records))
}

#[derive(Deserialize)]
struct ViewQuery {
    filename: String,
}

async fn view(State(state): State<Arc<MockState>>, Query(query): Query<ViewQuery>) -> Response {
    match lock(&state.files).get(&query.filename) {
        Some(bytes) => bytes.clone().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

#[derive(Deserialize)]
struct QueueRequest {
    #[serde(default)]
    delete: Vec<String>,
}

async fn queue(State(state): State<Arc<MockState>>, Json(body): Json<QueueRequest>) -> StatusCode {
    lock(&state.cancelled).extend(body.delete);
    StatusCode::OK
}

#[derive(Deserialize)]
struct InterruptRequest {
    prompt_id: Option<String>,
}

async fn interrupt(State(state): State<Arc<MockState>>, Json(body): Json<InterruptRequest>) -> StatusCode {
    if let Some(prompt_id) = body.prompt_id {
        lock(&state.interrupted).push(prompt_id);
    }
    StatusCode::OK
}
