//! The `kindshift` binary: argument parsing, logging setup, rule loading and
//! the serve loop.

use std::{net::SocketAddr, path::PathBuf, process::ExitCode, sync::Arc};

use clap::Parser;
use kindshift_proxy::{metrics, ProxyMode, ProxyServer, ProxyState};
use kindshift_rules::{RuleTable, RulesError};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::prelude::*;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address the proxy listens on.
    #[arg(short, long, default_value = "0.0.0.0:8443", env = "KINDSHIFT_LISTEN")]
    listen: SocketAddr,

    /// Backend `host:port` every exchange is forwarded to.
    #[arg(short, long, env = "KINDSHIFT_TARGET")]
    target: String,

    /// Path to the YAML rename rule table.
    #[arg(short, long, env = "KINDSHIFT_RULES")]
    rules: PathBuf,

    /// Rewrite direction of this instance: `to-renamed` when the backend
    /// serves the renamed schema, `to-original` for the inverse deployment.
    #[arg(short, long, default_value = "to-renamed", env = "KINDSHIFT_MODE")]
    mode: ProxyMode,

    /// Optional address for the prometheus `/metrics` listener.
    #[arg(long, env = "KINDSHIFT_METRICS_LISTEN")]
    metrics_listen: Option<SocketAddr>,
}

#[derive(Debug, Error)]
enum CliError {
    #[error("failed to load rule table: {0}")]
    Rules(#[from] RulesError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    let args = Args::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(%error, "kindshift exited with error");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<(), CliError> {
    let rules = RuleTable::from_file(&args.rules)?;
    tracing::info!(
        groups = rules.groups.len(),
        webhooks = rules.webhooks.len(),
        "rule table loaded"
    );

    let shutdown = CancellationToken::new();

    if let Some(addr) = args.metrics_listen {
        let token = shutdown.clone();
        tokio::spawn(async move {
            if let Err(error) = metrics::serve(addr, token).await {
                tracing::error!(%error, "metrics listener failed");
            }
        });
    }

    let listener = TcpListener::bind(args.listen).await?;
    tracing::info!(
        listen = %args.listen,
        target = %args.target,
        mode = ?args.mode,
        "kindshift proxy ready"
    );

    let state = ProxyState {
        rules: Arc::new(rules),
        mode: args.mode,
        target: args.target,
    };
    tokio::spawn(shutdown_on_signal(shutdown.clone()));

    ProxyServer::new(state, shutdown).serve(listener).await?;
    Ok(())
}

#[cfg(unix)]
async fn shutdown_on_signal(shutdown: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(error) => {
            tracing::error!(%error, "failed to install SIGTERM handler");
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("received SIGINT, shutting down"),
        _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
    }
    shutdown.cancel();
}

#[cfg(not(unix))]
async fn shutdown_on_signal(shutdown: CancellationToken) {
    if tokio::signal::ctrl_c().await.is_ok() {
        tracing::info!("received interrupt, shutting down");
    }
    shutdown.cancel();
}

fn init_tracing() {
    let json_log = std::env::var("KINDSHIFT_JSON_LOG")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(false);

    if json_log {
        tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().with_thread_ids(true).json())
            .with(tracing_subscriber::EnvFilter::from_default_env())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_thread_ids(true)
                    .with_line_number(true),
            )
            .with(tracing_subscriber::EnvFilter::from_default_env())
            .init();
    }
}
