//! The Docker executor backend.

use std::sync::Arc;
use std::sync::Mutex;

use anyhow::Context as _;
use async_trait::async_trait;
use bollard::container::LogOutput;
use foreman_docker::Docker;
use foreman_events::EventStream;
use foreman_events::TaskEvent;
use foreman_events::TaskEventType;
use foreman_events::TaskStatus;
use futures::StreamExt as _;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;
use uuid::Uuid;

use crate::executor::ContainerWorkload;
use crate::executor::ExecutionTable;
use crate::executor::Result;
use crate::executor::TaskExecutor;
use crate::task::DevOpsTask;
use crate::task::TaskExecution;

/// The identifier this backend records on its executions.
const EXECUTOR_ID: &str = "docker";

/// The outcome of driving a container to completion.
enum Outcome {
    /// The container exited on its own.
    Exited(std::result::Result<i64, anyhow::Error>),
    /// The execution's deadline elapsed.
    DeadlineElapsed,
    /// The execution was canceled.
    Canceled,
}

/// An executor backend that runs each task as a container on the local
/// Docker daemon.
#[derive(Debug)]
pub struct DockerExecutor {
    /// A handle to the inner Docker client.
    client: Docker,
    /// The per-execution bookkeeping.
    executions: ExecutionTable,
}

impl DockerExecutor {
    /// Attempts to create a new executor connected to the Docker daemon
    /// with the default connection settings.
    pub fn new(events: Arc<EventStream>) -> Result<Self> {
        let client = Docker::with_defaults()
            .context("error connecting to the Docker daemon—is it running?")?;
        Ok(Self::with_client(client, events))
    }

    /// Creates a new executor with the provided Docker client.
    pub fn with_client(client: Docker, events: Arc<EventStream>) -> Self {
        Self {
            client,
            executions: ExecutionTable::new(events),
        }
    }
}

#[async_trait]
impl TaskExecutor for DockerExecutor {
    async fn execute_task(&self, task: &DevOpsTask) -> Result<String> {
        let workload = ContainerWorkload::resolve(task)?;
        let execution_id = Uuid::new_v4().to_string();

        let execution = TaskExecution::builder()
            .id(&execution_id)
            .devops_task_id(task.id())
            .status(TaskStatus::Running)
            .task_executor_id(EXECUTOR_ID)
            .build();
        let token = self.executions.register(execution);

        let client = self.client.clone();
        let executions = self.executions.clone();
        let id = execution_id.clone();
        tokio::spawn(async move {
            run(client, executions, workload, id, token).await;
        });

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

/// Drives one execution from container creation to its terminal event.
async fn run(
    client: Docker,
    executions: ExecutionTable,
    workload: ContainerWorkload,
    execution_id: String,
    token: CancellationToken,
) {
    // The container id is recorded as soon as creation succeeds so that
    // cleanup can remove it on every path, including cancellation and
    // timeout.
    let container_id: Arc<Mutex<Option<String>>> = Arc::default();

    let outcome = tokio::select! {
        _ = token.cancelled() => Outcome::Canceled,
        result = tokio::time::timeout(
            workload.timeout,
            run_container(&client, &executions, &workload, &execution_id, &container_id),
        ) => match result {
            Ok(result) => Outcome::Exited(result),
            Err(_) => Outcome::DeadlineElapsed,
        },
    };

    match outcome {
        Outcome::Exited(Ok(0)) => {
            executions
                .finish(&execution_id, TaskStatus::Succeeded, None)
                .await;
        }
        Outcome::Exited(Ok(code)) => {
            executions
                .finish(
                    &execution_id,
                    TaskStatus::Failed,
                    Some(format!("container exited with status {code}")),
                )
                .await;
        }
        Outcome::Exited(Err(e)) => {
            executions
                .finish(&execution_id, TaskStatus::Failed, Some(format!("{e:#}")))
                .await;
        }
        Outcome::DeadlineElapsed => {
            executions
                .finish(
                    &execution_id,
                    TaskStatus::Failed,
                    Some(format!(
                        "execution deadline of {}s exceeded",
                        workload.timeout.as_secs()
                    )),
                )
                .await;
        }
        Outcome::Canceled => {
            executions
                .finish(&execution_id, TaskStatus::Canceled, None)
                .await;
        }
    }

    // Cleanup runs on a detached task so it survives the per-task timeout
    // and cancellation.
    let container_id = container_id.lock().expect("container id lock").take();
    if let Some(container_id) = container_id {
        tokio::spawn(async move {
            if let Err(e) = client.container_from_id(&container_id).force_remove().await {
                warn!("error removing container `{container_id}`: {e}");
            }
        });
    }
}

/// Creates, starts, and waits on the container, publishing lifecycle events
/// along the way. Returns the container's exit status code.
async fn run_container(
    client: &Docker,
    executions: &ExecutionTable,
    workload: &ContainerWorkload,
    execution_id: &str,
    container_id: &Arc<Mutex<Option<String>>>,
) -> anyhow::Result<i64> {
    // (1) Make sure the image is available, pulling it if necessary.
    if !client
        .image_exists(&workload.image)
        .await
        .context("failed to inspect image")?
    {
        executions
            .publish_message(
                execution_id,
                TaskEventType::TaskProgress,
                format!("Pulling image: {}", workload.image),
            )
            .await;

        client
            .pull_image(&workload.image)
            .await
            .context("failed to pull image")?;
    }

    // (2) Create the container.
    let container = client
        .container_builder()
        .image(&workload.image)
        .command(workload.command.clone())
        .envs(workload.env.clone())
        .try_create(format!("task-{execution_id}"))
        .await
        .context("failed to create container")?;

    container_id
        .lock()
        .expect("container id lock")
        .replace(container.id().to_owned());

    // (3) Synchronize requested files into the container before it starts.
    if let Some(sync) = &workload.sync {
        debug!(execution_id, source = %sync.source, "syncing files into container");
        client
            .sync_to_container(&sync.source, &sync.target, container.id())
            .await
            .context("failed to sync files into container")?;
    }

    // (4) Start it.
    container
        .start()
        .await
        .context("failed to start container")?;

    executions
        .publish_message(
            execution_id,
            TaskEventType::TaskStarted,
            "Container is started",
        )
        .await;

    // (5) Follow the combined log stream, emitting one output event per
    // line.
    let mut logs = container.follow_logs();
    let mut buffer = Vec::new();
    while let Some(chunk) = logs.next().await {
        let chunk = chunk.context("error streaming logs")?;
        let bytes = match chunk {
            LogOutput::StdOut { message } | LogOutput::StdErr { message } => message,
            _ => continue,
        };

        buffer.extend_from_slice(&bytes);
        for line in drain_lines(&mut buffer) {
            executions
                .publish_message(execution_id, TaskEventType::TaskOutput, line)
                .await;
        }
    }

    if !buffer.is_empty() {
        let line = String::from_utf8_lossy(&buffer).into_owned();
        executions
            .publish_message(execution_id, TaskEventType::TaskOutput, line)
            .await;
    }

    // (6) Wait for the container to exit.
    container
        .wait()
        .await
        .context("container wait error")
}

/// Drains the complete lines from a byte buffer, leaving any trailing
/// partial line in place.
fn drain_lines(buffer: &mut Vec<u8>) -> Vec<String> {
    let mut lines = Vec::new();

    while let Some(position) = buffer.iter().position(|b| *b == b'\n') {
        let mut line: Vec<u8> = buffer.drain(..=position).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }

        lines.push(String::from_utf8_lossy(&line).into_owned());
    }

    lines
}
