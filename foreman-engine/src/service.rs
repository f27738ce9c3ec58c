//! The task service: the router between the task catalog and the executor
//! backends.

use std::collections::HashMap;
use std::sync::Arc;

use bon::Builder;
use foreman_events::TaskEvent;
use foreman_events::TaskStatus;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::executor::ExecutorError;
use crate::executor::TaskExecutor;
use crate::repository::RepositoryError;
use crate::repository::TaskFilters;
use crate::repository::TaskRepository;
use crate::task::Approval;
use crate::task::DevOpsTask;
use crate::task::TaskConfig;
use crate::task::TaskExecution;
use crate::task::TaskType;
use crate::task::WorkerKind;

/// An error from the task service.
#[derive(Error, Debug)]
pub enum ServiceError {
    /// An error from task storage.
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    /// No executor is registered for the task's worker kind.
    #[error("no executor registered for `{0}` workers")]
    UnsupportedWorker(WorkerKind),
    /// An error from the executor backend.
    #[error(transparent)]
    Executor(#[from] ExecutorError),
}

/// A [`Result`](std::result::Result) with a [`ServiceError`].
pub type Result<T> = std::result::Result<T, ServiceError>;

/// A partial update to a task.
///
/// Absent fields leave the stored value untouched.
#[derive(Builder, Clone, Debug, Default)]
#[builder(builder_type = Builder)]
pub struct TaskUpdate {
    /// A new name.
    #[builder(into)]
    pub name: Option<String>,
    /// A new description.
    #[builder(into)]
    pub description: Option<String>,
    /// A new configuration.
    pub config: Option<TaskConfig>,
    /// A new task kind.
    pub task_type: Option<TaskType>,
    /// A new set of approvals.
    pub approvals: Option<Vec<Approval>>,
}

/// The task service.
///
/// Holds the task catalog and routes execution, cancellation, status, and
/// subscription requests to the executor registered for the task's worker
/// kind.
#[derive(Debug)]
pub struct TaskService {
    /// The task storage.
    repository: Arc<dyn TaskRepository>,
    /// The registered executor backends, keyed by the worker kind they
    /// serve.
    executors: HashMap<WorkerKind, Arc<dyn TaskExecutor>>,
}

impl TaskService {
    /// Creates a new service over the given repository, with no executors
    /// registered.
    pub fn new(repository: Arc<dyn TaskRepository>) -> Self {
        Self {
            repository,
            executors: HashMap::new(),
        }
    }

    /// Registers an executor backend for a worker kind, replacing any
    /// prior registration for that kind.
    pub fn register_executor(&mut self, kind: WorkerKind, executor: Arc<dyn TaskExecutor>) {
        self.executors.insert(kind, executor);
    }

    /// Gets the executor registered for a worker kind.
    fn executor(&self, kind: WorkerKind) -> Result<&Arc<dyn TaskExecutor>> {
        self.executors
            .get(&kind)
            .ok_or(ServiceError::UnsupportedWorker(kind))
    }

    /// Gets the executor that owns an execution, via the task that recorded
    /// it.
    async fn executor_for_execution(&self, execution_id: &str) -> Result<&Arc<dyn TaskExecutor>> {
        let task = self.repository.get_by_execution_id(execution_id).await?;
        self.executor(task.worker().kind())
    }

    /// Creates a task, generating its id when absent and stamping its
    /// timestamps.
    pub async fn create_task(&self, mut task: DevOpsTask) -> Result<DevOpsTask> {
        if task.id().is_empty() {
            task.set_id(Uuid::new_v4().to_string());
        }
        task.touch();

        self.repository.create(&task).await?;
        Ok(task)
    }

    /// Applies a partial update to a task.
    pub async fn update_task(&self, task_id: &str, updates: TaskUpdate) -> Result<DevOpsTask> {
        let mut task = self.repository.get_by_id(task_id).await?;

        if let Some(name) = updates.name {
            task.set_name(name);
        }
        if let Some(description) = updates.description {
            task.set_description(description);
        }
        if let Some(config) = updates.config {
            task.set_config(config);
        }
        if let Some(task_type) = updates.task_type {
            task.set_task_type(task_type);
        }
        if let Some(approvals) = updates.approvals {
            task.set_approvals(approvals);
        }

        task.touch();
        self.repository.update(&task).await?;
        Ok(task)
    }

    /// Deletes a task.
    pub async fn delete_task(&self, task_id: &str) -> Result<()> {
        self.repository.delete(task_id).await.map_err(Into::into)
    }

    /// Gets a task by id.
    pub async fn get_task(&self, task_id: &str) -> Result<DevOpsTask> {
        self.repository.get_by_id(task_id).await.map_err(Into::into)
    }

    /// Lists the tasks matching the filters.
    pub async fn get_tasks(&self, filters: &TaskFilters) -> Result<Vec<DevOpsTask>> {
        self.repository.get_all(filters).await.map_err(Into::into)
    }

    /// Starts an execution of a task and returns the execution id.
    ///
    /// The executor is chosen by the task's declared worker kind; the new
    /// execution is appended to the task and persisted.
    pub async fn execute_task(&self, task_id: &str) -> Result<String> {
        let mut task = self.repository.get_by_id(task_id).await?;
        let executor = self.executor(task.worker().kind())?;

        let execution_id = executor.execute_task(&task).await?;
        debug!(task_id, execution_id, "execution started");

        task.push_execution(
            TaskExecution::builder()
                .id(&execution_id)
                .devops_task_id(task.id())
                .status(TaskStatus::Running)
                .task_executor_id(task.worker().kind().to_string())
                .build(),
        );
        task.touch();
        self.repository.update(&task).await?;

        Ok(execution_id)
    }

    /// Gets the status of an execution from the executor that owns it.
    pub async fn get_task_status(&self, execution_id: &str) -> Result<TaskStatus> {
        let executor = self.executor_for_execution(execution_id).await?;
        executor.task_status(execution_id).await.map_err(Into::into)
    }

    /// Requests cancellation of an execution.
    pub async fn cancel_task(&self, execution_id: &str) -> Result<()> {
        let executor = self.executor_for_execution(execution_id).await?;
        executor.cancel_task(execution_id).await.map_err(Into::into)
    }

    /// Subscribes to the events of an execution.
    pub async fn subscribe_to_task_events(
        &self,
        execution_id: &str,
    ) -> Result<mpsc::Receiver<TaskEvent>> {
        let executor = self.executor_for_execution(execution_id).await?;
        Ok(executor.subscribe_to_events(execution_id).await)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use foreman_events::EventStream;
    use indexmap::IndexMap;

    use super::*;
    use crate::repository::MemoryTaskRepository;
    use crate::task::WorkerSpec;

    /// An executor that records calls and completes immediately.
    #[derive(Debug)]
    struct StubExecutor {
        /// The event stream subscriptions delegate to.
        events: Arc<EventStream>,
        /// Execution ids handed out, in order.
        executed: Mutex<Vec<String>>,
        /// Execution ids canceled, in order.
        canceled: Mutex<Vec<String>>,
    }

    impl StubExecutor {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                events: Arc::new(EventStream::new()),
                executed: Mutex::new(Vec::new()),
                canceled: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl TaskExecutor for StubExecutor {
        async fn execute_task(&self, task: &DevOpsTask) -> crate::executor::Result<String> {
            let execution_id = format!("exec-{}", task.id());
            self.executed.lock().unwrap().push(execution_id.clone());
            Ok(execution_id)
        }

        async fn task_status(&self, _: &str) -> crate::executor::Result<TaskStatus> {
            Ok(TaskStatus::Succeeded)
        }

        async fn cancel_task(&self, execution_id: &str) -> crate::executor::Result<()> {
            self.canceled.lock().unwrap().push(execution_id.to_owned());
            Ok(())
        }

        async fn subscribe_to_events(&self, execution_id: &str) -> mpsc::Receiver<TaskEvent> {
            self.events.subscribe(execution_id).await
        }
    }

    /// Builds a service with a stub Docker executor.
    fn service_with_stub() -> (TaskService, Arc<StubExecutor>) {
        let mut service = TaskService::new(Arc::new(MemoryTaskRepository::new()));
        let stub = StubExecutor::new();
        service.register_executor(WorkerKind::Docker, stub.clone());
        (service, stub)
    }

    /// Builds a Docker task for tests.
    fn docker_task() -> DevOpsTask {
        DevOpsTask::builder()
            .name("deploy")
            .task_type(TaskType::Manual)
            .worker(WorkerSpec::Docker {
                image: "busybox".into(),
                command: vec!["true".into()],
                env: IndexMap::new(),
            })
            .build()
    }

    #[tokio::test]
    async fn execute_routes_by_worker_kind_and_appends_the_execution() {
        let (service, stub) = service_with_stub();
        let task = service.create_task(docker_task()).await.unwrap();

        let execution_id = service.execute_task(task.id()).await.unwrap();
        assert_eq!(*stub.executed.lock().unwrap(), vec![execution_id.clone()]);

        let stored = service.get_task(task.id()).await.unwrap();
        assert_eq!(stored.executions().len(), 1);
        assert_eq!(stored.executions()[0].id(), execution_id);

        // Status and cancel route through the execution's owner.
        assert_eq!(
            service.get_task_status(&execution_id).await.unwrap(),
            TaskStatus::Succeeded
        );
        service.cancel_task(&execution_id).await.unwrap();
        assert_eq!(*stub.canceled.lock().unwrap(), vec![execution_id]);
    }

    #[tokio::test]
    async fn unregistered_worker_kinds_are_rejected() {
        let service = TaskService::new(Arc::new(MemoryTaskRepository::new()));
        let task = service.create_task(docker_task()).await.unwrap();

        assert!(matches!(
            service.execute_task(task.id()).await,
            Err(ServiceError::UnsupportedWorker(WorkerKind::Docker))
        ));
    }

    #[tokio::test]
    async fn unknown_executions_are_not_found() {
        let (service, _) = service_with_stub();

        assert!(matches!(
            service.get_task_status("exec-404").await,
            Err(ServiceError::Repository(RepositoryError::ExecutionNotFound(_)))
        ));
    }

    #[tokio::test]
    async fn updates_are_partial() {
        let (service, _) = service_with_stub();
        let task = service.create_task(docker_task()).await.unwrap();

        let updated = service
            .update_task(
                task.id(),
                TaskUpdate::builder().description("does the deploy").build(),
            )
            .await
            .unwrap();

        assert_eq!(updated.name(), "deploy");
        assert_eq!(updated.description(), Some("does the deploy"));
        assert!(updated.updated_at() >= task.updated_at());
    }
}
