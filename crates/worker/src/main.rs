//! Worker agent binary

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use agent_core::{AgentConfig, ControlPlaneClient};
use worker_agent::{install_shutdown_handler, WorkerAgent};

const CRATES: &[&str] = &["worker_agent", "agent_runner", "task_bundle", "agent_core"];

#[derive(Parser, Debug)]
#[command(name = "worker-agent")]
#[command(version)]
#[command(about = "Registers with the control plane and executes polled tasks")]
struct Cli {
    /// API key used to authenticate with the control plane
    #[arg(long, env = "WORKER_API_KEY", hide_env_values = true)]
    api_key: Option<String>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let Some(api_key) = cli.api_key.filter(|key| !key.trim().is_empty()) else {
        eprintln!("error: an API key is required (--api-key <KEY>)");
        return ExitCode::FAILURE;
    };

    let config = match AgentConfig::from_env(api_key) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    init_tracing(config.debug);

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!("Failed to start async runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(config: AgentConfig) -> anyhow::Result<()> {
    let shutdown = install_shutdown_handler().context("Failed to install signal handlers")?;

    tracing::info!("Control plane at {}", config.api_url);
    let client = Arc::new(ControlPlaneClient::new(&config).context("Failed to build control-plane client")?);

    let agent = WorkerAgent::initialize(config, client).await?;
    agent.run(shutdown).await?;

    tracing::info!("Worker agent stopped");
    Ok(())
}

fn init_tracing(debug: bool) {
    let level = if debug { "debug" } else { "info" };
    let default_filter = CRATES
        .iter()
        .map(|name| format!("{}={}", name, level))
        .collect::<Vec<_>>()
        .join(",");

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
