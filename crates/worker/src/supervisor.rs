//! The worker's main loop.
//!
//! Reads envelopes from the controller, runs one job at a time through
//! the handler registry, and streams progress and a single terminal
//! envelope (`complete` or `error`) per job back out. Jobs that arrive
//! while another is running are queued in arrival order.
//!
//! Stops on a `shutdown` envelope, on the shutdown token, or at end of
//! input. A shutdown while a job runs cancels that job; queued jobs are
//! then answered with a `Cancelled` error. End of input lets the running
//! job and the queue finish first.

use std::any::Any;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use diffbox_core::error::JobError;
use diffbox_core::handler::{JobContext, JobHandler};
use diffbox_core::types::{Job, JobType};
use futures::FutureExt;
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncRead, AsyncWrite, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::progress::JobProgress;
use crate::protocol::{Envelope, EnvelopeReader, EnvelopeType, EnvelopeWriter, JobRequest, ProtocolError};
use crate::registry::{DefaultHandlerFactory, HandlerFactory, HandlerRegistry};

/// Envelopes read ahead of the supervisor.
const INBOUND_CAPACITY: usize = 64;

const DISCARDED_MESSAGE: &str = "Cancelled: worker shut down before the job started";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Starting,
    Idle,
    Running,
    Draining,
    Stopped,
}

/// Job outcomes over one supervisor run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub completed: usize,
    pub failed: usize,
}

enum Event {
    Signal,
    Message(Option<Envelope>),
}

/// Envelopes from the reader task.
struct Inbound {
    rx: mpsc::Receiver<Envelope>,
    open: bool,
}

impl Inbound {
    fn spawn<R>(input: R) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);
        tokio::spawn(read_loop(EnvelopeReader::new(BufReader::new(input)), tx));
        Self { rx, open: true }
    }

    async fn next(&mut self) -> Option<Envelope> {
        let envelope = self.rx.recv().await;
        if envelope.is_none() {
            self.open = false;
        }
        envelope
    }
}

/// Forward envelopes until end of input or a `shutdown`, skipping lines
/// that fail to parse.
async fn read_loop<R: AsyncBufRead + Unpin>(mut reader: EnvelopeReader<R>, tx: mpsc::Sender<Envelope>) {
    loop {
        match reader.read_envelope().await {
            Ok(Some(envelope)) => {
                let stop = envelope.kind == EnvelopeType::Shutdown;
                if tx.send(envelope).await.is_err() || stop {
                    break;
                }
            }
            Ok(None) => {
                tracing::info!("Input closed");
                break;
            }
            Err(ProtocolError::Malformed(reason)) => {
                tracing::warn!(%reason, "Ignoring malformed input line");
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to read input");
                break;
            }
        }
    }
}

/// Spawn the task that owns the output stream.
///
/// The task ends once every sender is dropped and the queue is flushed.
fn spawn_writer<W>(output: W) -> (mpsc::UnboundedSender<Envelope>, JoinHandle<()>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
    let handle = tokio::spawn(async move {
        let mut writer = EnvelopeWriter::new(output);
        while let Some(envelope) = rx.recv().await {
            if let Err(e) = writer.write_envelope(&envelope).await {
                tracing::error!(error = %e, "Failed to write output, dropping remaining messages");
                break;
            }
        }
    });
    (tx, handle)
}

/// Message of a caught panic; payloads that are not strings are
/// reported generically.
fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}

fn send(outbox: &mpsc::UnboundedSender<Envelope>, envelope: Envelope) {
    if outbox.send(envelope).is_err() {
        tracing::warn!("Output closed, dropping message");
    }
}

pub struct Supervisor<F = DefaultHandlerFactory> {
    registry: HandlerRegistry<F>,
    shutdown: CancellationToken,
    state: SupervisorState,
    stop_requested: bool,
    backlog: VecDeque<JobRequest>,
    summary: RunSummary,
}

impl<F: HandlerFactory> Supervisor<F> {
    /// Cancelling `shutdown` stops the supervisor and any running job.
    pub fn new(registry: HandlerRegistry<F>, shutdown: CancellationToken) -> Self {
        Self {
            registry,
            shutdown,
            state: SupervisorState::Starting,
            stop_requested: false,
            backlog: VecDeque::new(),
            summary: RunSummary::default(),
        }
    }

    fn transition(&mut self, next: SupervisorState) {
        tracing::debug!(from = ?self.state, to = ?next, "Supervisor state change");
        self.state = next;
    }

    /// Serve the controller on `input` and `output` until told to stop.
    pub async fn run<R, W>(mut self, input: R, output: W) -> RunSummary
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outbox, writer) = spawn_writer(output);
        let mut inbound = Inbound::spawn(input);

        send(&outbox, Envelope::ready());
        self.transition(SupervisorState::Idle);
        tracing::info!("Worker ready");

        let shutdown = self.shutdown.clone();
        loop {
            if self.stop_requested || shutdown.is_cancelled() {
                break;
            }
            if let Some(request) = self.backlog.pop_front() {
                self.dispatch(request, &mut inbound, &outbox).await;
                continue;
            }
            if !inbound.open {
                break;
            }

            let event = tokio::select! {
                biased;
                _ = shutdown.cancelled() => Event::Signal,
                envelope = inbound.next() => Event::Message(envelope),
            };
            match event {
                Event::Signal => tracing::info!("Shutdown signal received"),
                Event::Message(Some(envelope)) => self.accept(envelope),
                Event::Message(None) => {}
            }
        }

        self.transition(SupervisorState::Draining);
        while let Some(request) = self.backlog.pop_front() {
            tracing::warn!(job_id = %request.id, "Discarding queued job");
            self.summary.failed += 1;
            send(&outbox, Envelope::error(&request.id, DISCARDED_MESSAGE));
        }

        drop(outbox);
        if let Err(e) = writer.await {
            tracing::error!(error = %e, "Output task failed");
        }

        self.transition(SupervisorState::Stopped);
        tracing::info!(
            completed = self.summary.completed,
            failed = self.summary.failed,
            "Worker stopped",
        );
        self.summary
    }

    /// Handle one inbound envelope outside of job execution.
    fn accept(&mut self, envelope: Envelope) {
        match envelope.kind {
            EnvelopeType::Job => match envelope.job_request() {
                Ok(request) => {
                    tracing::debug!(job_id = %request.id, queued = self.backlog.len(), "Job received");
                    self.backlog.push_back(request);
                }
                Err(e) => tracing::warn!(error = %e, "Dropping job message"),
            },
            EnvelopeType::Shutdown => {
                tracing::info!("Shutdown requested");
                self.stop_requested = true;
            }
            other => tracing::warn!(kind = ?other, "Ignoring unexpected message type"),
        }
    }

    async fn dispatch(
        &mut self,
        request: JobRequest,
        inbound: &mut Inbound,
        outbox: &mpsc::UnboundedSender<Envelope>,
    ) {
        self.transition(SupervisorState::Running);
        let job_id = request.id.clone();
        let started = Instant::now();

        let result = match self.prepare(request) {
            Ok((job, handler)) => self.execute(&job, handler, inbound, outbox).await,
            Err(e) => Err(e),
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        let envelope = match result {
            Ok(output) => {
                self.summary.completed += 1;
                tracing::info!(job_id = %job_id, elapsed_ms, "Job completed");
                Envelope::complete(&job_id, output)
            }
            Err(e) => {
                self.summary.failed += 1;
                tracing::warn!(job_id = %job_id, kind = e.kind(), error = %e, elapsed_ms, "Job failed");
                Envelope::error(&job_id, &e.to_string())
            }
        };
        send(outbox, envelope);
        self.transition(SupervisorState::Idle);
    }

    fn prepare(&mut self, request: JobRequest) -> Result<(Job, Arc<dyn JobHandler>), JobError> {
        let job_type: JobType = request
            .job_type
            .as_deref()
            .ok_or_else(|| JobError::UnknownJobType("missing job type".into()))?
            .parse()?;
        let params = match request.params {
            Value::Object(params) => params,
            _ => return Err(JobError::InvalidParams("params must be a JSON object".into())),
        };
        let handler = self.registry.resolve(job_type)?;

        Ok((
            Job {
                id: request.id,
                job_type,
                params,
            },
            handler,
        ))
    }

    /// Run the handler while still servicing input, so a `shutdown` can
    /// cancel it and new jobs are queued. A handler panic fails the job
    /// with kind `Panic`.
    async fn execute(
        &mut self,
        job: &Job,
        handler: Arc<dyn JobHandler>,
        inbound: &mut Inbound,
        outbox: &mpsc::UnboundedSender<Envelope>,
    ) -> Result<Value, JobError> {
        tracing::info!(job_id = %job.id, job_type = %job.job_type, "Starting job");

        let cancel = self.shutdown.child_token();
        let progress = JobProgress::new(job.id.clone(), outbox.clone());
        let ctx = JobContext {
            progress: &progress,
            cancel: cancel.clone(),
        };
        let run = AssertUnwindSafe(handler.run(job, ctx)).catch_unwind();
        tokio::pin!(run);

        loop {
            tokio::select! {
                outcome = &mut run => {
                    return outcome.unwrap_or_else(|payload| {
                        let message = panic_message(&*payload);
                        tracing::error!(job_id = %job.id, panic = %message, "Handler panicked");
                        Err(JobError::failed("Panic", message))
                    });
                }
                envelope = inbound.next(), if inbound.open => match envelope {
                    Some(envelope) => {
                        let stop = envelope.kind == EnvelopeType::Shutdown;
                        self.accept(envelope);
                        if stop {
                            tracing::info!(job_id = %job.id, "Cancelling running job");
                            cancel.cancel();
                        }
                    }
                    None => tracing::debug!(job_id = %job.id, "Input closed while a job is running"),
                },
            }
        }
    }
}
