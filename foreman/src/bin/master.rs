//! The Foreman master.
//!
//! Accepts task definitions, dispatches their execution to the configured
//! backends, and serves the agent control plane until it receives SIGINT
//! or SIGTERM.
#![allow(missing_docs)]
#![allow(clippy::missing_docs_in_private_items)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use anyhow::Result;
use clap::Parser;
use clap_verbosity_flag::Verbosity;
use foreman_agent::AgentServer;
use foreman_config::Config;
use foreman_engine::TaskService;
use foreman_engine::executor::AgentExecutor;
use foreman_engine::executor::DockerExecutor;
use foreman_engine::executor::KubernetesExecutor;
use foreman_engine::repository::JsonFileTaskRepository;
use foreman_engine::repository::MemoryTaskRepository;
use foreman_engine::repository::TaskRepository;
use foreman_engine::task::DevOpsTask;
use foreman_engine::task::TaskType;
use foreman_engine::task::WorkerKind;
use foreman_engine::task::WorkerSpec;
use foreman_events::EventStream;
use indexmap::IndexMap;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_log::AsTrace;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
struct Args {
    /// The address to serve the agent control plane on; overrides the
    /// configuration file.
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// The Kubernetes namespace jobs are created in; overrides the
    /// configuration file.
    #[arg(short, long)]
    namespace: Option<String>,

    /// The path of the JSON task file; overrides the configuration file.
    /// Tasks are held in memory only when no path is configured.
    #[arg(short, long)]
    data_file: Option<PathBuf>,

    #[command(flatten)]
    verbose: Verbosity,
}

/// A sample task stored when developer mode is enabled.
fn dev_seed_task() -> DevOpsTask {
    DevOpsTask::builder()
        .name("dev-echo")
        .description("developer seed task")
        .task_type(TaskType::Manual)
        .worker(WorkerSpec::Docker {
            image: "busybox".into(),
            command: vec!["sh".into(), "-c".into(), "echo 'hello from foreman'".into()],
            env: IndexMap::new(),
        })
        .build()
}

async fn run(args: Args, token: CancellationToken) -> Result<()> {
    let config = Config::load()?;
    config.validate()?;

    let listen = args.listen.unwrap_or_else(|| config.master().listen());
    let namespace = args
        .namespace
        .unwrap_or_else(|| config.master().namespace().to_owned());
    let data_file = args
        .data_file
        .or_else(|| config.master().data_file().map(Into::into));

    let repository: Arc<dyn TaskRepository> = match data_file {
        Some(path) => {
            info!(path = %path.display(), "using file-backed task storage");
            Arc::new(JsonFileTaskRepository::open(path)?)
        }
        None => Arc::new(MemoryTaskRepository::new()),
    };

    if Config::dev_mode() {
        let seed = dev_seed_task();
        info!(task_id = %seed.id(), "developer mode: seeding sample task");
        repository.create(&seed).await?;
    }

    let events = Arc::new(EventStream::new());
    let agent_server = AgentServer::new(events.clone());

    let mut service = TaskService::new(repository);
    service.register_executor(
        WorkerKind::Agent,
        Arc::new(AgentExecutor::new(agent_server.clone())),
    );

    service.register_executor(
        WorkerKind::Docker,
        Arc::new(DockerExecutor::new(events.clone())?),
    );
    service.register_executor(
        WorkerKind::Kubernetes,
        Arc::new(KubernetesExecutor::new(&namespace, events.clone()).await?),
    );

    info!(%listen, "starting the agent control plane");
    let mut server = agent_server.serve(listen, token.clone());

    tokio::select! {
        _ = token.cancelled() => {
            info!("shutting down");
            server
                .await
                .context("server task failed")?
                .context("error serving the agent control plane")?;
        }
        result = &mut server => {
            result
                .context("server task failed")?
                .context("error serving the agent control plane")?;
            anyhow::bail!("the agent control plane stopped unexpectedly");
        }
    }

    Ok(())
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
            info!("termination signal received");
            signal_token.cancel();
        });

        run(args, token).await
    })
}
