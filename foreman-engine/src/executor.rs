//! Executor backends.
//!
//! Every backend implements [`TaskExecutor`]: it starts a workload for a
//! task asynchronously, caches per-execution state, supports cancellation,
//! and emits [`TaskEvent`](foreman_events::TaskEvent)s, ending in exactly
//! one terminal event per execution, onto the shared
//! [`EventStream`](foreman_events::EventStream).

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use foreman_events::EventStream;
use foreman_events::TaskEvent;
use foreman_events::TaskEventType;
use foreman_events::TaskStatus;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub mod agent;
pub mod docker;
pub mod kubernetes;
mod workload;

pub use agent::AgentExecutor;
pub use docker::DockerExecutor;
pub use kubernetes::KubernetesExecutor;
pub use workload::CommandWorkload;
pub use workload::ContainerWorkload;
pub use workload::DEFAULT_JOB_TIMEOUT;
pub use workload::SyncRequest;

use crate::task::DevOpsTask;

/// An error that may occur when driving an executor backend.
#[derive(Error, Debug)]
pub enum ExecutorError {
    /// The requested execution does not exist.
    #[error("execution `{0}` was not found")]
    NotFound(String),
    /// The task's configuration cannot be turned into a workload.
    #[error("invalid task configuration: {0}")]
    Configuration(String),
    /// An error from the underlying backend API.
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// A [`Result`](std::result::Result) with an [`ExecutorError`].
pub type Result<T> = std::result::Result<T, ExecutorError>;

/// An executor backend.
#[async_trait]
pub trait TaskExecutor: Debug + Send + Sync + 'static {
    /// Starts the task's workload asynchronously and returns the id of the
    /// new execution.
    ///
    /// The execution is registered internally before this method returns,
    /// and exactly one terminal event will eventually be published for the
    /// returned id, including on timeout and backend-failure paths.
    async fn execute_task(&self, task: &DevOpsTask) -> Result<String>;

    /// Gets the cached status of an execution.
    async fn task_status(&self, execution_id: &str) -> Result<TaskStatus>;

    /// Requests cancellation of an execution.
    ///
    /// The workload promptly reaches a terminal state (`Canceled`
    /// preferred; `Failed` is acceptable when the cancellation races with
    /// completion). Canceling an already-finished execution is a no-op.
    async fn cancel_task(&self, execution_id: &str) -> Result<()>;

    /// Subscribes to the events of an execution.
    async fn subscribe_to_events(&self, execution_id: &str) -> mpsc::Receiver<TaskEvent>;
}

/// The per-execution state held by an executor.
#[derive(Debug)]
struct ExecutionState {
    /// The cached execution record.
    execution: crate::task::TaskExecution,
    /// Cancels the execution's background task and the resources it
    /// allocated.
    token: CancellationToken,
}

/// The bookkeeping shared by all executor backends: a concurrent map of
/// execution id to `{execution, cancel}` plus the event stream the backend
/// publishes into.
///
/// Cloning is cheap; clones share the same table.
#[derive(Clone, Debug)]
pub(crate) struct ExecutionTable {
    /// The registered executions.
    executions: Arc<DashMap<String, ExecutionState>>,
    /// The event stream the owning executor publishes into.
    events: Arc<EventStream>,
}

impl ExecutionTable {
    /// Creates a new, empty table publishing into `events`.
    pub(crate) fn new(events: Arc<EventStream>) -> Self {
        Self {
            executions: Arc::new(DashMap::new()),
            events,
        }
    }

    /// Gets the event stream of the table.
    pub(crate) fn events(&self) -> &Arc<EventStream> {
        &self.events
    }

    /// Registers an execution and returns its cancellation token.
    pub(crate) fn register(&self, execution: crate::task::TaskExecution) -> CancellationToken {
        let token = CancellationToken::new();
        self.executions.insert(
            execution.id().to_owned(),
            ExecutionState {
                execution,
                token: token.clone(),
            },
        );
        token
    }

    /// Gets the cached status of an execution.
    pub(crate) fn status(&self, execution_id: &str) -> Result<TaskStatus> {
        self.executions
            .get(execution_id)
            .map(|state| state.execution.status())
            .ok_or_else(|| ExecutorError::NotFound(execution_id.to_owned()))
    }

    /// Cancels an execution's token.
    ///
    /// Canceling an execution that already reached a terminal status is a
    /// no-op; canceling an unknown execution is an error.
    pub(crate) fn cancel(&self, execution_id: &str) -> Result<()> {
        let state = self
            .executions
            .get(execution_id)
            .ok_or_else(|| ExecutorError::NotFound(execution_id.to_owned()))?;

        if state.execution.status().is_terminal() {
            debug!(execution_id, "cancel requested after terminal state; ignoring");
            return Ok(());
        }

        state.token.cancel();
        Ok(())
    }

    /// Publishes a message event for an execution.
    pub(crate) async fn publish_message(
        &self,
        execution_id: &str,
        event_type: TaskEventType,
        message: impl Into<String>,
    ) {
        self.events
            .publish(TaskEvent::message(execution_id, event_type, message))
            .await;
    }

    /// Records a terminal status on the execution record without publishing
    /// an event.
    ///
    /// Used when the terminal event originates elsewhere (e.g., an agent's
    /// event republished by the control plane). Returns whether the record
    /// transitioned (false when it was already terminal).
    pub(crate) fn record_terminal(
        &self,
        execution_id: &str,
        status: TaskStatus,
        error: Option<String>,
    ) -> bool {
        match self.executions.get_mut(execution_id) {
            Some(mut state) if !state.execution.status().is_terminal() => {
                state.execution.finish(status, error);
                true
            }
            _ => false,
        }
    }

    /// Marks an execution as finished and publishes its terminal event.
    ///
    /// The first call for an execution wins; later calls (a cancellation
    /// racing with natural completion, for instance) do nothing.
    pub(crate) async fn finish(
        &self,
        execution_id: &str,
        status: TaskStatus,
        error: Option<String>,
    ) {
        if !self.record_terminal(execution_id, status, error.clone()) {
            return;
        }

        debug!(execution_id, ?status, "execution finished");
        self.events
            .publish(TaskEvent::terminal(execution_id, status, error))
            .await;
    }
}
