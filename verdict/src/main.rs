//! Verdict main binary.
//!
//! Wires the components of the incident analysis service:
//! - Backends: metrics (Prometheus-compatible), dashboards
//!   (Grafana-compatible), reasoning model, vector index
//! - Orchestrator: the evidence pipeline and verifier
//! - API: REST + SSE server

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use verdict_api::{ApiConfig, AppState};
use verdict_backends::llm::AnthropicClient;
use verdict_backends::{GrafanaClient, LlmClient, PrometheusClient, RemoteVectorIndex, VectorIndex};
use verdict_core::Config;
use verdict_orchestrator::{Backends, Orchestrator};

/// Verdict CLI arguments
#[derive(Debug, Parser)]
#[clap(name = "verdict", version, about = "Incident root-cause analysis service")]
struct Cli {
    /// Optional JSON configuration overrides file
    #[clap(short, long)]
    config: Option<PathBuf>,

    /// Bind address for the API server
    #[clap(long, env = "VERDICT_BIND_ADDR", default_value = "0.0.0.0:8080")]
    bind_addr: SocketAddr,

    /// Log level (trace, debug, info, warn, error)
    #[clap(long, env = "VERDICT_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Enable JSON logging
    #[clap(long, env = "VERDICT_LOG_JSON")]
    log_json: bool,

    /// Validate configuration and exit
    #[clap(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli)?;

    info!("Starting verdict v{}", env!("CARGO_PKG_VERSION"));

    let config = match &cli.config {
        Some(path) => {
            info!("Loading configuration overrides from {:?}", path);
            Config::from_file(path).context("Failed to load configuration")?
        }
        None => Config::from_env().context("Failed to load configuration from environment")?,
    };
    let config = Arc::new(config);

    if cli.dry_run {
        info!("Dry run mode - configuration validated, exiting");
        return Ok(());
    }

    let backends = build_backends(&config)?;
    let orchestrator = Arc::new(Orchestrator::new(config.clone(), backends));

    let api_config = ApiConfig {
        bind_addr: cli.bind_addr,
        // The transport timeout sits above the run deadline so the
        // pipeline decides timeouts, not the HTTP layer.
        request_timeout_secs: config.run_timeout_secs + 30,
    };
    let state = AppState::new(orchestrator, env!("CARGO_PKG_VERSION"));

    verdict_api::serve(api_config, state, wait_for_shutdown())
        .await
        .context("API server error")?;

    info!("Verdict stopped");
    Ok(())
}

/// Initialize logging based on CLI arguments
fn init_logging(cli: &Cli) -> Result<()> {
    let log_level = cli
        .log_level
        .parse::<tracing::Level>()
        .context("Invalid log level")?;

    if cli.log_json {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_current_span(true),
            )
            .with(
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive(log_level.into()),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_line_number(true),
            )
            .with(
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive(log_level.into()),
            )
            .init();
    }

    info!("Logging initialized at level: {}", log_level);
    Ok(())
}

/// Construct backend clients from configuration. Absent backends leave
/// the corresponding agents in degraded, non-fatal mode.
fn build_backends(config: &Config) -> Result<Backends> {
    let prometheus = Some(Arc::new(
        PrometheusClient::new(&config.metrics_url).context("Invalid metrics backend URL")?,
    ));

    let grafana = Some(Arc::new(
        GrafanaClient::new(&config.dashboard_url, config.dashboard_api_key.clone())
            .context("Invalid dashboard backend URL")?,
    ));

    let llm: Option<Arc<dyn LlmClient>> = match (&config.llm_api_url, &config.llm_api_key) {
        (Some(url), Some(key)) => {
            info!(model = %config.llm_primary_model, "reasoning model configured");
            Some(Arc::new(
                AnthropicClient::new(url, key).context("Invalid model backend URL")?,
            ))
        }
        _ => {
            info!("no reasoning model configured; rule-based paths only");
            None
        }
    };

    let vector: Option<Arc<dyn VectorIndex>> = match &config.vector_index_url {
        Some(url) => Some(Arc::new(
            RemoteVectorIndex::new(url, &config.embedding_model)
                .context("Invalid vector index URL")?,
        )),
        None => {
            info!("no vector index configured; similarity retrieval disabled");
            None
        }
    };

    Ok(Backends {
        llm,
        prometheus,
        grafana,
        vector,
    })
}

/// Wait for shutdown signal (SIGTERM or CTRL+C)
async fn wait_for_shutdown() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install CTRL+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received CTRL+C");
        },
        _ = terminate => {
            info!("Received SIGTERM");
        },
    }
}
