//! The master-side gRPC service that agents connect to.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::RwLock;

use chrono::DateTime;
use chrono::Utc;
use foreman_events::EventStream;
use foreman_events::Payload;
use foreman_events::TaskEvent;
use foreman_events::TaskEventType;
use foreman_events::TaskStatus;
use futures_core::Stream;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tonic::Request;
use tonic::Response;
use tonic::Status;
use tracing::debug;
use tracing::info;
use uuid::Uuid;

use crate::JoinHandle;
use crate::proto::Command;
use crate::proto::ConnectRequest;
use crate::proto::EventAck;
use crate::proto::EventType;
use crate::proto::ExecutionEvent;
use crate::proto::MetricsAck;
use crate::proto::MetricsUpdate;
use crate::proto::SystemInfo;
use crate::proto::agent_service_server::AgentService;
use crate::proto::agent_service_server::AgentServiceServer;

/// The capacity of the process-wide queue of unrouted commands.
pub const TASK_QUEUE_CAPACITY: usize = 100;

/// The capacity of each agent's direct command queue.
const DIRECT_QUEUE_CAPACITY: usize = 100;

/// An error dispatching a command to an agent.
#[derive(Error, Debug)]
pub enum DispatchError {
    /// The command was pinned to an agent that is not connected.
    #[error("agent `{0}` is not connected")]
    AgentNotConnected(String),
    /// The target queue is full.
    #[error("the command queue is full")]
    QueueFull,
}

/// One connected agent, as seen by the server.
#[derive(Clone, Debug)]
pub struct ConnectedAgent {
    /// The id the agent registered under.
    pub id: String,
    /// The system information the agent reported.
    pub system_info: Option<SystemInfo>,
    /// Whether the agent's command stream is live.
    pub connected: bool,
    /// The sending half of the agent's direct command queue; the stream
    /// serving the agent holds the receiving half.
    sender: mpsc::Sender<Command>,
}

/// The state shared by all handles to the server.
#[derive(Debug)]
struct Inner {
    /// The registry of connected agents, keyed by agent id.
    agents: RwLock<HashMap<String, ConnectedAgent>>,
    /// The sending half of the shared queue of unrouted commands.
    queue: mpsc::Sender<Command>,
    /// The receiving half of the shared queue. Connected agents take turns
    /// popping from it (competing consumers).
    pending: Mutex<mpsc::Receiver<Command>>,
    /// The stream the server republishes agent events onto.
    events: Arc<EventStream>,
}

/// Removes an agent's registry entry when its command stream is torn down.
///
/// The entry is only removed when it still belongs to this stream: a
/// reconnecting agent replaces its entry, and the stale stream's teardown
/// must not evict the replacement.
struct Deregister {
    /// The shared server state.
    inner: Arc<Inner>,
    /// The id of the agent.
    id: String,
    /// The sender of the direct queue this stream was serving.
    sender: mpsc::Sender<Command>,
}

impl Drop for Deregister {
    fn drop(&mut self) {
        let mut agents = self.inner.agents.write().expect("agent registry lock");
        if let Some(agent) = agents.get(&self.id) {
            if agent.sender.same_channel(&self.sender) {
                agents.remove(&self.id);
                info!(agent_id = %self.id, "agent disconnected");
            }
        }
    }
}

/// The master-side agent control plane.
///
/// Cloning is cheap; clones share the agent registry, the command queues,
/// and the event stream.
#[derive(Clone, Debug)]
pub struct AgentServer {
    /// The shared state.
    inner: Arc<Inner>,
}

impl AgentServer {
    /// Creates a new server publishing agent events onto `events`.
    pub fn new(events: Arc<EventStream>) -> Self {
        let (queue, pending) = mpsc::channel(TASK_QUEUE_CAPACITY);

        Self {
            inner: Arc::new(Inner {
                agents: RwLock::new(HashMap::new()),
                queue,
                pending: Mutex::new(pending),
                events,
            }),
        }
    }

    /// Gets the event stream the server republishes onto.
    pub fn events(&self) -> &Arc<EventStream> {
        &self.inner.events
    }

    /// Lists the currently connected agents.
    pub fn connected_agents(&self) -> Vec<ConnectedAgent> {
        let agents = self.inner.agents.read().expect("agent registry lock");
        agents.values().cloned().collect()
    }

    /// Dispatches a command.
    ///
    /// A command pinned to an agent (non-empty `agent_id`) goes to that
    /// agent's direct queue and fails when the agent is not connected. An
    /// unpinned command is pushed onto the shared queue and is delivered,
    /// FIFO, to whichever connected agent is free, including agents that
    /// connect later.
    pub fn dispatch(&self, command: Command) -> Result<(), DispatchError> {
        debug!(
            command_id = %command.command_id,
            command = %command.command,
            "dispatching command"
        );

        if command.agent_id.is_empty() {
            return self
                .inner
                .queue
                .try_send(command)
                .map_err(|_| DispatchError::QueueFull);
        }

        let sender = {
            let agents = self.inner.agents.read().expect("agent registry lock");
            agents
                .get(&command.agent_id)
                .filter(|agent| agent.connected)
                .map(|agent| agent.sender.clone())
        };

        match sender {
            Some(sender) => sender.try_send(command).map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => DispatchError::QueueFull,
                mpsc::error::TrySendError::Closed(command) => {
                    DispatchError::AgentNotConnected(command.agent_id)
                }
            }),
            None => Err(DispatchError::AgentNotConnected(command.agent_id)),
        }
    }

    /// Starts serving the control plane on the given address.
    ///
    /// The returned handle resolves when the server stops; cancel the token
    /// for a graceful shutdown.
    pub fn serve(&self, addr: SocketAddr, token: CancellationToken) -> JoinHandle {
        let service = AgentServiceServer::new(self.clone());

        tokio::spawn(async move {
            tonic::transport::Server::builder()
                .add_service(service)
                .serve_with_shutdown(addr, async move { token.cancelled().await })
                .await
        })
    }
}

/// Converts a wire event type into the internal task event type.
fn translate_event_type(event_type: EventType) -> TaskEventType {
    match event_type {
        EventType::Started => TaskEventType::TaskStarted,
        EventType::Output => TaskEventType::TaskOutput,
        EventType::Error => TaskEventType::TaskError,
        EventType::Completed => TaskEventType::TaskCompleted,
        EventType::Failed => TaskEventType::TaskFailed,
        _ => TaskEventType::TaskProgress,
    }
}

/// Converts a wire timestamp (unix nanoseconds) into a [`DateTime`],
/// falling back to now for out-of-range values.
fn translate_timestamp(nanos: i64) -> DateTime<Utc> {
    if nanos == 0 {
        Utc::now()
    } else {
        DateTime::from_timestamp_nanos(nanos)
    }
}

/// Builds the internal event republished for a wire event.
fn translate_event(event: ExecutionEvent) -> TaskEvent {
    let event_type = translate_event_type(event.r#type());

    let payload = match event_type {
        TaskEventType::TaskCompleted => Payload::Terminal {
            status: TaskStatus::Succeeded,
            error: None,
        },
        TaskEventType::TaskFailed => Payload::Terminal {
            status: TaskStatus::Failed,
            error: Some(event.payload.clone()),
        },
        TaskEventType::TaskError => Payload::Terminal {
            status: TaskStatus::Error,
            error: Some(event.payload.clone()),
        },
        _ => Payload::Message(event.payload.clone()),
    };

    TaskEvent {
        id: Uuid::new_v4(),
        execution_id: event.command_id,
        timestamp: translate_timestamp(event.timestamp),
        event_type,
        payload,
    }
}

#[tonic::async_trait]
impl AgentService for AgentServer {
    type ConnectStream = Pin<Box<dyn Stream<Item = Result<Command, Status>> + Send>>;

    async fn connect(
        &self,
        request: Request<ConnectRequest>,
    ) -> Result<Response<Self::ConnectStream>, Status> {
        let request = request.into_inner();
        if request.agent_id.is_empty() {
            return Err(Status::invalid_argument("agent_id must be non-empty"));
        }

        let (sender, mut direct) = mpsc::channel(DIRECT_QUEUE_CAPACITY);
        {
            let mut agents = self.inner.agents.write().expect("agent registry lock");
            // A re-registration replaces the prior entry; dropping the old
            // sender tears the stale stream down.
            agents.insert(
                request.agent_id.clone(),
                ConnectedAgent {
                    id: request.agent_id.clone(),
                    system_info: request.system_info.clone(),
                    connected: true,
                    sender: sender.clone(),
                },
            );
        }

        info!(
            agent_id = %request.agent_id,
            version = %request.agent_version,
            system_info = ?request.system_info,
            "agent connected"
        );

        self.inner
            .events
            .publish(TaskEvent::message(
                &request.agent_id,
                TaskEventType::WorkerConnected,
                "Worker connected successfully",
            ))
            .await;

        let guard = Deregister {
            inner: self.inner.clone(),
            id: request.agent_id,
            sender,
        };

        let inner = self.inner.clone();
        let stream = async_stream::stream! {
            // Moved into the stream so the agent deregisters when the
            // client goes away and tonic drops the stream.
            let _guard = guard;

            loop {
                tokio::select! {
                    command = direct.recv() => match command {
                        Some(command) => yield Ok(command),
                        // The registration was replaced by a newer stream.
                        None => break,
                    },
                    command = async {
                        let mut pending = inner.pending.lock().await;
                        pending.recv().await
                    } => match command {
                        Some(command) => yield Ok(command),
                        None => break,
                    },
                }
            }
        };

        Ok(Response::new(Box::pin(stream)))
    }

    async fn send_event(
        &self,
        request: Request<ExecutionEvent>,
    ) -> Result<Response<EventAck>, Status> {
        let event = request.into_inner();
        debug!(
            command_id = %event.command_id,
            event_type = ?event.r#type(),
            payload = %event.payload,
            "received event from agent"
        );

        self.inner.events.publish(translate_event(event)).await;

        Ok(Response::new(EventAck { received: true }))
    }

    async fn send_metrics(
        &self,
        request: Request<MetricsUpdate>,
    ) -> Result<Response<MetricsAck>, Status> {
        let metrics = request.into_inner();
        let system = metrics.system.unwrap_or_default();

        debug!(
            agent_id = %metrics.agent_id,
            cpu = system.cpu_usage,
            memory = system.memory_usage,
            "received metrics from agent"
        );

        self.inner
            .events
            .publish(TaskEvent {
                id: Uuid::new_v4(),
                execution_id: metrics.agent_id,
                timestamp: translate_timestamp(metrics.timestamp),
                event_type: TaskEventType::Metrics,
                payload: Payload::Message(format!(
                    "CPU: {:.2}%, Memory: {:.2}%",
                    system.cpu_usage, system.memory_usage
                )),
            })
            .await;

        Ok(Response::new(MetricsAck { received: true }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_event_types_translate() {
        assert_eq!(
            translate_event_type(EventType::Started),
            TaskEventType::TaskStarted
        );
        assert_eq!(
            translate_event_type(EventType::Output),
            TaskEventType::TaskOutput
        );
        assert_eq!(
            translate_event_type(EventType::Completed),
            TaskEventType::TaskCompleted
        );
        assert_eq!(
            translate_event_type(EventType::Failed),
            TaskEventType::TaskFailed
        );
        assert_eq!(
            translate_event_type(EventType::Error),
            TaskEventType::TaskError
        );
        assert_eq!(
            translate_event_type(EventType::Metrics),
            TaskEventType::TaskProgress
        );
    }

    #[test]
    fn terminal_wire_events_carry_status_records() {
        let event = translate_event(ExecutionEvent {
            command_id: "cmd-1".into(),
            r#type: EventType::Failed as i32,
            payload: "exit status 1".into(),
            timestamp: 0,
        });

        assert_eq!(event.event_type, TaskEventType::TaskFailed);
        assert_eq!(
            event.payload,
            Payload::Terminal {
                status: TaskStatus::Failed,
                error: Some("exit status 1".into()),
            }
        );

        let event = translate_event(ExecutionEvent {
            command_id: "cmd-1".into(),
            r#type: EventType::Output as i32,
            payload: "a line".into(),
            timestamp: 1_700_000_000_000_000_000,
        });
        assert_eq!(event.event_type, TaskEventType::TaskOutput);
        assert_eq!(event.payload, Payload::Message("a line".into()));
    }

    #[tokio::test]
    async fn dispatch_to_an_unknown_agent_fails() {
        let server = AgentServer::new(Arc::new(EventStream::new()));

        let result = server.dispatch(Command {
            command_id: "cmd-1".into(),
            command: "true".into(),
            args: Vec::new(),
            environment: HashMap::new(),
            agent_id: "ghost".into(),
        });

        assert!(matches!(result, Err(DispatchError::AgentNotConnected(_))));
    }

    #[tokio::test]
    async fn unrouted_commands_queue_until_an_agent_connects() {
        let server = AgentServer::new(Arc::new(EventStream::new()));

        // No agent is connected, but unpinned commands are accepted up to
        // the queue capacity.
        server
            .dispatch(Command {
                command_id: "cmd-1".into(),
                command: "true".into(),
                args: Vec::new(),
                environment: HashMap::new(),
                agent_id: String::new(),
            })
            .expect("unrouted dispatch should queue");
    }
}
