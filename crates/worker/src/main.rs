//! `diffbox-worker` -- inference worker process.
//!
//! Speaks line-delimited JSON with its controller on stdin/stdout.
//! Logs go to stderr so stdout carries protocol messages only.
//!
//! Configuration comes from the environment (and `.env`); see
//! [`WorkerConfig::from_env`] for the variables.

use diffbox_core::config::WorkerConfig;
use diffbox_worker::registry::{DefaultHandlerFactory, HandlerRegistry};
use diffbox_worker::supervisor::Supervisor;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_LOG_FILTER: &str = "diffbox_worker=info,diffbox_pipeline=info,diffbox_comfyui=info";

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = match WorkerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "Invalid configuration");
            std::process::exit(1);
        }
    };

    tracing::info!(
        worker_id = %config.worker_id,
        comfyui_url = %config.comfyui_url,
        llm_url = %config.llm_url,
        templates_dir = %config.templates_dir.display(),
        outputs_dir = %config.outputs_dir.display(),
        "Starting diffbox-worker",
    );

    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_signal(shutdown.clone()));

    let registry = HandlerRegistry::new(DefaultHandlerFactory::new(config));
    let summary = Supervisor::new(registry, shutdown)
        .run(tokio::io::stdin(), tokio::io::stdout())
        .await;

    tracing::info!(
        completed = summary.completed,
        failed = summary.failed,
        "Exiting",
    );
    // The stdin reader may still be blocked on a read; exit without
    // waiting for it.
    std::process::exit(0);
}

/// Cancel `token` on SIGINT or SIGTERM.
async fn cancel_on_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("Received SIGINT (Ctrl-C), shutting down"),
        () = terminate => tracing::info!("Received SIGTERM, shutting down"),
    }
    token.cancel();
}
