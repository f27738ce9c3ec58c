//! An in-memory task repository.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::repository::Result;
use crate::repository::RepositoryError;
use crate::repository::TaskFilters;
use crate::repository::TaskRepository;
use crate::task::DevOpsTask;

/// A task repository that holds tasks in memory only.
#[derive(Debug, Default)]
pub struct MemoryTaskRepository {
    /// The stored tasks, keyed by task id.
    tasks: RwLock<HashMap<String, DevOpsTask>>,
}

impl MemoryTaskRepository {
    /// Creates a new, empty repository.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskRepository for MemoryTaskRepository {
    async fn create(&self, task: &DevOpsTask) -> Result<()> {
        let mut tasks = self.tasks.write().await;
        tasks.insert(task.id().to_owned(), task.clone());
        Ok(())
    }

    async fn get_by_id(&self, task_id: &str) -> Result<DevOpsTask> {
        let tasks = self.tasks.read().await;
        tasks
            .get(task_id)
            .cloned()
            .ok_or_else(|| RepositoryError::NotFound(task_id.to_owned()))
    }

    async fn get_all(&self, filters: &TaskFilters) -> Result<Vec<DevOpsTask>> {
        let tasks = self.tasks.read().await;
        Ok(tasks
            .values()
            .filter(|task| filters.matches(task))
            .cloned()
            .collect())
    }

    async fn update(&self, task: &DevOpsTask) -> Result<()> {
        let mut tasks = self.tasks.write().await;
        if !tasks.contains_key(task.id()) {
            return Err(RepositoryError::NotFound(task.id().to_owned()));
        }

        tasks.insert(task.id().to_owned(), task.clone());
        Ok(())
    }

    async fn delete(&self, task_id: &str) -> Result<()> {
        let mut tasks = self.tasks.write().await;
        tasks
            .remove(task_id)
            .map(|_| ())
            .ok_or_else(|| RepositoryError::NotFound(task_id.to_owned()))
    }

    async fn get_by_execution_id(&self, execution_id: &str) -> Result<DevOpsTask> {
        let tasks = self.tasks.read().await;
        tasks
            .values()
            .find(|task| task.execution(execution_id).is_some())
            .cloned()
            .ok_or_else(|| RepositoryError::ExecutionNotFound(execution_id.to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use indexmap::IndexMap;

    use super::*;
    use crate::task::TaskExecution;
    use crate::task::TaskType;
    use crate::task::WorkerSpec;
    use crate::task::Workspace;

    /// Builds a task for tests.
    fn task(name: &str, workspace: &str, task_type: TaskType) -> DevOpsTask {
        DevOpsTask::builder()
            .name(name)
            .task_type(task_type)
            .worker(WorkerSpec::Docker {
                image: "busybox".into(),
                command: vec!["true".into()],
                env: IndexMap::new(),
            })
            .workspace(Workspace::builder().id(workspace).name(workspace).build())
            .subjects(vec!["ci".to_owned()])
            .build()
    }

    #[tokio::test]
    async fn create_get_update_delete() {
        let repository = MemoryTaskRepository::new();
        let mut task = task("deploy", "ws-1", TaskType::Manual);
        repository.create(&task).await.unwrap();

        let fetched = repository.get_by_id(task.id()).await.unwrap();
        assert_eq!(fetched.name(), "deploy");

        task.set_description("deploys the api");
        repository.update(&task).await.unwrap();
        // An unchanged update is idempotent.
        repository.update(&task).await.unwrap();

        let fetched = repository.get_by_id(task.id()).await.unwrap();
        assert_eq!(fetched.description(), Some("deploys the api"));

        repository.delete(task.id()).await.unwrap();
        assert!(matches!(
            repository.get_by_id(task.id()).await,
            Err(RepositoryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn filters_are_conjunctive() {
        let repository = MemoryTaskRepository::new();
        repository
            .create(&task("one", "ws-1", TaskType::Manual))
            .await
            .unwrap();
        repository
            .create(&task("two", "ws-2", TaskType::Scheduled))
            .await
            .unwrap();

        let filters = TaskFilters::builder().workspace_id("ws-1").build();
        let tasks = repository.get_all(&filters).await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].name(), "one");

        let filters = TaskFilters::builder()
            .workspace_id("ws-2")
            .task_type(TaskType::Manual)
            .build();
        assert!(repository.get_all(&filters).await.unwrap().is_empty());

        let filters = TaskFilters::builder().subjects(vec!["ci".to_owned()]).build();
        assert_eq!(repository.get_all(&filters).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn lookup_by_execution_id() {
        let repository = MemoryTaskRepository::new();
        let mut task = task("deploy", "ws-1", TaskType::Manual);
        task.push_execution(
            TaskExecution::builder()
                .id("exec-1")
                .devops_task_id(task.id())
                .build(),
        );
        repository.create(&task).await.unwrap();

        let owner = repository.get_by_execution_id("exec-1").await.unwrap();
        assert_eq!(owner.id(), task.id());

        assert!(matches!(
            repository.get_by_execution_id("exec-404").await,
            Err(RepositoryError::ExecutionNotFound(_))
        ));
    }
}
