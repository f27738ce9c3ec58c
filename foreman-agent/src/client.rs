//! The long-lived client that runs inside each remote agent.

use std::time::Duration;

use anyhow::Context as _;
use anyhow::Result;
use anyhow::anyhow;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tonic::transport::Endpoint;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::command::CommandRunner;
use crate::command::EVENT_CHANNEL_CAPACITY;
use crate::metrics::MetricsCollector;
use crate::proto::ConnectRequest;
use crate::proto::ExecutionEvent;
use crate::proto::SystemInfo;
use crate::proto::agent_service_client::AgentServiceClient;

/// The version the agent reports when registering.
const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// The default wait between reconnection attempts.
pub const DEFAULT_RECONNECT_WAIT: Duration = Duration::from_secs(5);

/// The default interval between metrics reports.
pub const DEFAULT_METRICS_INTERVAL: Duration = Duration::from_secs(30);

/// Collects the system information reported on registration.
fn collect_system_info() -> SystemInfo {
    SystemInfo {
        hostname: whoami::fallible::hostname().unwrap_or_else(|_| String::from("unknown")),
        os: std::env::consts::OS.to_owned(),
        arch: std::env::consts::ARCH.to_owned(),
    }
}

/// A remote agent.
///
/// The agent dials the master, registers itself, and then executes every
/// command it receives as a local process, reporting lifecycle events and
/// periodic metrics back. Transport failures tear the connection down and
/// the agent retries after a fixed back-off, forever, until its token is
/// canceled.
#[derive(Debug)]
pub struct Agent {
    /// The id the agent registers under.
    id: String,
    /// The endpoint of the master.
    endpoint: Endpoint,
    /// The wait between reconnection attempts.
    reconnect_wait: Duration,
    /// The interval between metrics reports.
    metrics_interval: Duration,
}

impl Agent {
    /// Creates a new agent that will dial the given master endpoint.
    pub fn new(id: impl Into<String>, endpoint: Endpoint) -> Self {
        Self {
            id: id.into(),
            endpoint,
            reconnect_wait: DEFAULT_RECONNECT_WAIT,
            metrics_interval: DEFAULT_METRICS_INTERVAL,
        }
    }

    /// Creates a new agent from the master's address.
    pub fn from_address(id: impl Into<String>, address: impl AsRef<str>) -> Result<Self> {
        let endpoint = Endpoint::from_shared(address.as_ref().to_owned())
            .context("invalid master address")?;
        Ok(Self::new(id, endpoint))
    }

    /// Overrides the wait between reconnection attempts.
    pub fn with_reconnect_wait(mut self, wait: Duration) -> Self {
        self.reconnect_wait = wait;
        self
    }

    /// Overrides the interval between metrics reports.
    pub fn with_metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_interval = interval;
        self
    }

    /// Gets the id of the agent.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Runs the agent until the token is canceled.
    pub async fn run(&self, token: CancellationToken) -> Result<()> {
        loop {
            info!(agent_id = %self.id, endpoint = %self.endpoint.uri(), "connecting to master");

            match self.connect_and_serve(&token).await {
                Ok(()) => return Ok(()),
                Err(e) => warn!("connection to master lost: {e:#}"),
            }

            tokio::select! {
                _ = token.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.reconnect_wait) => {}
            }
        }
    }

    /// Dials the master and serves one connection to completion.
    ///
    /// Returns `Ok(())` only when the token was canceled; every other exit
    /// is an error that triggers a reconnect.
    async fn connect_and_serve(&self, token: &CancellationToken) -> Result<()> {
        let channel = self
            .endpoint
            .connect()
            .await
            .context("failed to connect to master")?;
        let mut client = AgentServiceClient::new(channel);

        let mut commands = client
            .connect(ConnectRequest {
                agent_id: self.id.clone(),
                agent_version: AGENT_VERSION.to_owned(),
                system_info: Some(collect_system_info()),
            })
            .await
            .context("failed to register with master")?
            .into_inner();

        info!(agent_id = %self.id, "registered with master");

        // Events from command runners drain through a bounded local
        // channel; a dedicated task forwards them to the master.
        let (event_sender, event_receiver) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let sender_task = tokio::spawn(send_events(client.clone(), event_receiver));
        let metrics_task = tokio::spawn(report_metrics(
            client,
            self.id.clone(),
            self.metrics_interval,
        ));

        let result = loop {
            tokio::select! {
                _ = token.cancelled() => break Ok(()),
                message = commands.message() => match message {
                    Ok(Some(command)) => {
                        debug!(command_id = %command.command_id, "received command");
                        let runner = CommandRunner::new(event_sender.clone());
                        tokio::spawn(async move { runner.run(command).await });
                    }
                    Ok(None) => break Err(anyhow!("master closed the command stream")),
                    Err(status) => break Err(anyhow!("error receiving command: {status}")),
                },
            }
        };

        metrics_task.abort();
        sender_task.abort();
        result
    }
}

/// Forwards locally-produced events to the master.
///
/// Send failures are logged and the event dropped; the command's terminal
/// state is still owned by the master-side timeout.
async fn send_events(
    mut client: AgentServiceClient<Channel>,
    mut events: mpsc::Receiver<ExecutionEvent>,
) {
    while let Some(event) = events.recv().await {
        debug!(command_id = %event.command_id, event_type = ?event.r#type(), "sending event");
        if let Err(status) = client.send_event(event).await {
            warn!("error sending event: {status}");
        }
    }
}

/// Reports metrics to the master on a fixed interval, best-effort.
async fn report_metrics(
    mut client: AgentServiceClient<Channel>,
    agent_id: String,
    interval: Duration,
) {
    let mut collector = MetricsCollector::new();
    let mut ticker = tokio::time::interval(interval);
    // The first tick fires immediately; skip it so a report only goes out
    // after a full interval of samples.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let update = collector.collect(&agent_id);
        if let Err(status) = client.send_metrics(update).await {
            warn!("error sending metrics: {status}");
        }
    }
}
