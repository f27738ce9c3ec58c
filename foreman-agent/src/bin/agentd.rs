//! The Foreman agent daemon.
//!
//! Connects to a master, registers itself, and executes the shell commands
//! it is dispatched until it receives SIGINT or SIGTERM.
#![allow(missing_docs)]
#![allow(clippy::missing_docs_in_private_items)]

use anyhow::Result;
use clap::Parser;
use clap_verbosity_flag::Verbosity;
use foreman_agent::Agent;
use foreman_config::Config;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_log::AsTrace;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
struct Args {
    /// The id to register under; overrides the configuration file.
    #[arg(short, long)]
    id: Option<String>,

    /// The address of the master; overrides the configuration file.
    #[arg(short, long)]
    master: Option<String>,

    #[command(flatten)]
    verbose: Verbosity,
}

async fn run(args: Args, token: CancellationToken) -> Result<()> {
    let config = Config::load()?;
    config.validate()?;

    let id = args.id.unwrap_or_else(|| config.agent().id().to_owned());
    let master = args
        .master
        .unwrap_or_else(|| config.agent().master_address().to_string());

    let agent = Agent::from_address(&id, &master)?
        .with_reconnect_wait(config.agent().reconnect_wait())
        .with_metrics_interval(config.agent().metrics_interval());

    agent.run(token).await
}

/// Resolves when SIGINT or SIGTERM is received.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::SignalKind;
        use tokio::signal::unix::signal;

        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install the SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

pub fn main() -> Result<()> {
    let args = Args::parse();

    match std::env::var("RUST_LOG") {
        Ok(_) => tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .init(),
        Err(_) => tracing_subscriber::fmt()
            .with_max_level(args.verbose.log_level_filter().as_trace())
            .init(),
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        let token = CancellationToken::new();

        let signal_token = token.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("termination signal received; shutting the agent down");
            signal_token.cancel();
        });

        run(args, token).await
    })
}
