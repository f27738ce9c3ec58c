//! The agent executor backend.
//!
//! Translates a task's agent worker into a wire [`Command`] and dispatches
//! it through the master's [`AgentServer`]. The command id doubles as the
//! execution id: the control plane republishes the agent's events onto the
//! shared stream keyed by it, and a watcher mirrors the terminal event into
//! this backend's cached execution record.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use foreman_agent::AgentServer;
use foreman_agent::proto::Command;
use foreman_events::Payload;
use foreman_events::TaskEvent;
use foreman_events::TaskStatus;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::executor::CommandWorkload;
use crate::executor::ExecutionTable;
use crate::executor::Result;
use crate::executor::TaskExecutor;
use crate::task::DevOpsTask;
use crate::task::TaskExecution;

/// The identifier this backend records on its executions.
const EXECUTOR_ID: &str = "agent";

/// An executor backend that runs each task as a command on a remote agent.
#[derive(Debug)]
pub struct AgentExecutor {
    /// The control plane commands are dispatched through.
    server: AgentServer,
    /// The per-execution bookkeeping.
    executions: ExecutionTable,
}

impl AgentExecutor {
    /// Creates a new executor dispatching through the given control plane.
    pub fn new(server: AgentServer) -> Self {
        let events = server.events().clone();
        Self {
            server,
            executions: ExecutionTable::new(events),
        }
    }
}

#[async_trait]
impl TaskExecutor for AgentExecutor {
    async fn execute_task(&self, task: &DevOpsTask) -> Result<String> {
        let workload = CommandWorkload::resolve(task)?;
        let execution_id = Uuid::new_v4().to_string();

        let execution = TaskExecution::builder()
            .id(&execution_id)
            .devops_task_id(task.id())
            .status(TaskStatus::Running)
            .task_executor_id(EXECUTOR_ID)
            .build();
        let token = self.executions.register(execution);

        // Subscribe before dispatching so the watcher observes every event
        // the control plane republishes for this command.
        let events = self.executions.events().subscribe(&execution_id).await;

        let command = Command {
            command_id: execution_id.clone(),
            command: workload.command,
            args: workload.args,
            environment: workload.env.into_iter().collect::<HashMap<_, _>>(),
            agent_id: workload.agent_id.unwrap_or_default(),
        };

        if let Err(e) = self.server.dispatch(command) {
            self.executions
                .finish(&execution_id, TaskStatus::Error, Some(e.to_string()))
                .await;
            return Ok(execution_id);
        }

        tokio::spawn(watch(
            self.executions.clone(),
            execution_id.clone(),
            events,
            token,
            workload.timeout,
        ));

        Ok(execution_id)
    }

    async fn task_status(&self, execution_id: &str) -> Result<TaskStatus> {
        self.executions.status(execution_id)
    }

    async fn cancel_task(&self, execution_id: &str) -> Result<()> {
        self.executions.cancel(execution_id)
    }

    async fn subscribe_to_events(&self, execution_id: &str) -> mpsc::Receiver<TaskEvent> {
        self.executions.events().subscribe(execution_id).await
    }
}

/// Mirrors an execution's own event stream into its cached record and
/// enforces the execution deadline.
///
/// The wire contract has no remote kill, so a local cancellation publishes
/// the terminal event and closes the stream while the remote command may
/// still run to completion; whatever it reports afterwards is dropped by
/// the bus.
async fn watch(
    executions: ExecutionTable,
    execution_id: String,
    mut events: mpsc::Receiver<TaskEvent>,
    token: CancellationToken,
    timeout: Duration,
) {
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                executions
                    .finish(&execution_id, TaskStatus::Canceled, None)
                    .await;
                break;
            }
            _ = &mut deadline => {
                executions
                    .finish(
                        &execution_id,
                        TaskStatus::Failed,
                        Some(format!(
                            "execution deadline of {}s exceeded",
                            timeout.as_secs()
                        )),
                    )
                    .await;
                break;
            }
            event = events.recv() => match event {
                Some(event) => {
                    if let Payload::Terminal { status, error } = &event.payload {
                        debug!(execution_id, ?status, "agent execution reached terminal state");
                        executions.record_terminal(&execution_id, *status, error.clone());
                        break;
                    }
                }
                // The stream closed without a terminal payload observed
                // here; the record was settled elsewhere.
                None => break,
            },
        }
    }
}
