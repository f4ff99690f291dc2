#![allow(dead_code)]

use std::collections::HashMap;
use std::io::Cursor;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use diffbox_core::error::JobError;
use diffbox_core::handler::{JobContext, JobHandler};
use diffbox_core::types::{Job, JobType};
use diffbox_worker::protocol::{encode_line, Envelope, EnvelopeReader, EnvelopeType};
use diffbox_worker::registry::{HandlerFactory, HandlerRegistry};
use diffbox_worker::supervisor::{RunSummary, Supervisor};
use serde_json::{json, Value};
use tokio::io::{AsyncWriteExt, BufReader, DuplexStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const RECV_TIMEOUT: Duration = Duration::from_secs(10);

/// The workflow templates shipped with the repository.
pub fn repo_templates() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../templates")
}

/// A base64 encoded 1x1 PNG.
pub fn tiny_png() -> String {
    let image = image::RgbImage::from_pixel(1, 1, image::Rgb([10, 20, 30]));
    let mut out = Cursor::new(Vec::new());
    image::DynamicImage::ImageRgb8(image)
        .write_to(&mut out, image::ImageFormat::Png)
        .unwrap();
    STANDARD.encode(out.into_inner())
}

pub fn job_envelope(id: &str, job_type: &str, params: Value) -> Envelope {
    Envelope::job(id, job_type, params.as_object().cloned().unwrap_or_default())
}

/// A supervisor running on in-memory pipes.
pub struct Harness {
    input: Option<DuplexStream>,
    output: EnvelopeReader<BufReader<DuplexStream>>,
    task: JoinHandle<RunSummary>,
    pub shutdown: CancellationToken,
}

impl Harness {
    pub fn start<F: HandlerFactory + 'static>(factory: F) -> Self {
        let (input, worker_in) = tokio::io::duplex(64 * 1024);
        let (worker_out, output) = tokio::io::duplex(64 * 1024);
        let shutdown = CancellationToken::new();

        let supervisor = Supervisor::new(HandlerRegistry::new(factory), shutdown.clone());
        let task = tokio::spawn(supervisor.run(worker_in, worker_out));

        Self {
            input: Some(input),
            output: EnvelopeReader::new(BufReader::new(output)),
            task,
            shutdown,
        }
    }

    /// Start and consume the `ready` message.
    pub async fn ready<F: HandlerFactory + 'static>(factory: F) -> Self {
        let mut harness = Self::start(factory);
        assert_eq!(harness.recv().await.kind, EnvelopeType::Ready);
        harness
    }

    pub async fn send_line(&mut self, line: &str) {
        self.write(format!("{line}\n").as_bytes()).await;
    }

    pub async fn send(&mut self, envelope: &Envelope) {
        self.write(&encode_line(envelope)).await;
    }

    /// Write errors are ignored: after a shutdown the worker stops reading.
    async fn write(&mut self, bytes: &[u8]) {
        let input = self.input.as_mut().expect("input already closed");
        let _ = input.write_all(bytes).await;
    }

    pub fn close_input(&mut self) {
        self.input.take();
    }

    pub async fn recv(&mut self) -> Envelope {
        tokio::time::timeout(RECV_TIMEOUT, self.output.read_envelope())
            .await
            .expect("timed out waiting for worker output")
            .unwrap()
            .expect("worker output closed")
    }

    /// Messages up to and including the next terminal one.
    pub async fn recv_until_terminal(&mut self) -> (Vec<Envelope>, Envelope) {
        let mut progress = Vec::new();
        loop {
            let envelope = self.recv().await;
            if envelope.is_terminal() {
                return (progress, envelope);
            }
            progress.push(envelope);
        }
    }

    /// Close input, collect everything still written, and wait for exit.
    pub async fn finish(mut self) -> (Vec<Envelope>, RunSummary) {
        self.input.take();
        let mut rest = Vec::new();
        loop {
            let next = tokio::time::timeout(RECV_TIMEOUT, self.output.read_envelope())
                .await
                .expect("timed out waiting for worker output")
                .unwrap();
            match next {
                Some(envelope) => rest.push(envelope),
                None => break,
            }
        }
        let summary = tokio::time::timeout(RECV_TIMEOUT, self.task)
            .await
            .expect("supervisor did not stop")
            .unwrap();
        (rest, summary)
    }
}

pub fn data(envelope: &Envelope) -> &serde_json::Map<String, Value> {
    envelope.data.as_ref().expect("envelope without data")
}

pub fn fractions(envelopes: &[Envelope]) -> Vec<f64> {
    envelopes
        .iter()
        .filter(|e| e.kind == EnvelopeType::Progress)
        .map(|e| data(e)["progress"].as_f64().unwrap())
        .collect()
}

pub fn is_non_decreasing(values: &[f64]) -> bool {
    values.windows(2).all(|w| w[0] <= w[1])
}

/// Scripted handler behaviors.
pub enum Behavior {
    /// Report the given fractions, then echo the params back.
    Succeed(Vec<f64>),
    Fail(&'static str, &'static str),
    /// Report once, then wait for cancellation.
    WaitForCancel,
    /// Report once, then panic with the message.
    Panic(&'static str),
}

pub struct Scripted(pub Behavior);

#[async_trait]
impl JobHandler for Scripted {
    async fn run(&self, job: &Job, ctx: JobContext<'_>) -> Result<Value, JobError> {
        match &self.0 {
            Behavior::Succeed(fractions) => {
                for (i, fraction) in fractions.iter().enumerate() {
                    ctx.progress.report(*fraction, &format!("Step {}/{}", i + 1, fractions.len()), None);
                }
                Ok(json!({"type": "text", "job": job.id, "params": job.params}))
            }
            Behavior::Fail(kind, message) => Err(JobError::failed(*kind, *message)),
            Behavior::WaitForCancel => {
                ctx.progress.report(0.1, "Waiting", None);
                ctx.cancel.cancelled().await;
                Err(JobError::failed("Cancelled", "job cancelled"))
            }
            Behavior::Panic(message) => {
                ctx.progress.report(0.3, "About to fail", None);
                panic!("{message}");
            }
        }
    }
}

/// Factory serving scripted handlers; unregistered types fail to load.
#[derive(Default)]
pub struct FakeFactory {
    handlers: HashMap<JobType, Arc<dyn JobHandler>>,
}

impl FakeFactory {
    pub fn with(mut self, job_type: JobType, behavior: Behavior) -> Self {
        self.handlers.insert(job_type, Arc::new(Scripted(behavior)));
        self
    }
}

impl HandlerFactory for FakeFactory {
    fn create(&self, job_type: JobType) -> Result<Arc<dyn JobHandler>, JobError> {
        self.handlers
            .get(&job_type)
            .cloned()
            .ok_or_else(|| JobError::failed("LoadFailed", format!("no {job_type} model available")))
    }
}
