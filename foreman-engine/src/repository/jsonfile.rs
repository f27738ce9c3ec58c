//! A task repository persisted to a single JSON file.

use std::collections::HashMap;
use std::io::Write as _;
use std::path::Path;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use crate::repository::Result;
use crate::repository::RepositoryError;
use crate::repository::TaskFilters;
use crate::repository::TaskRepository;
use crate::task::DevOpsTask;

/// A task repository backed by one JSON file.
///
/// The persistence format is a single JSON object mapping task id to task.
/// The whole map is rewritten atomically (a temporary file in the same
/// directory, then a rename) after every mutation.
#[derive(Debug)]
pub struct JsonFileTaskRepository {
    /// The path of the JSON file.
    path: PathBuf,
    /// The in-memory copy of the stored tasks, keyed by task id.
    tasks: RwLock<HashMap<String, DevOpsTask>>,
}

impl JsonFileTaskRepository {
    /// Opens a repository at the given path.
    ///
    /// When the file exists its contents are loaded; otherwise the
    /// repository starts empty and the file is created on the first
    /// mutation.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        let tasks = if path.exists() {
            let contents = std::fs::read(&path)?;
            serde_json::from_slice(&contents)?
        } else {
            HashMap::new()
        };

        Ok(Self {
            path,
            tasks: RwLock::new(tasks),
        })
    }

    /// Gets the path of the JSON file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes the task map to the file atomically.
    fn persist(&self, tasks: &HashMap<String, DevOpsTask>) -> Result<()> {
        let contents = serde_json::to_vec_pretty(tasks)?;

        let directory = self.path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(directory)?;

        let mut file = tempfile::NamedTempFile::new_in(directory)?;
        file.write_all(&contents)?;
        file.persist(&self.path)
            .map_err(|e| RepositoryError::Io(e.error))?;

        debug!(path = %self.path.display(), count = tasks.len(), "persisted tasks");
        Ok(())
    }
}

#[async_trait]
impl TaskRepository for JsonFileTaskRepository {
    async fn create(&self, task: &DevOpsTask) -> Result<()> {
        let mut tasks = self.tasks.write().await;
        tasks.insert(task.id().to_owned(), task.clone());
        self.persist(&tasks)
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
        self.persist(&tasks)
    }

    async fn delete(&self, task_id: &str) -> Result<()> {
        let mut tasks = self.tasks.write().await;
        if tasks.remove(task_id).is_none() {
            return Err(RepositoryError::NotFound(task_id.to_owned()));
        }

        self.persist(&tasks)
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
    use crate::task::TaskType;
    use crate::task::WorkerSpec;

    /// Builds a task for tests.
    fn task(name: &str) -> DevOpsTask {
        DevOpsTask::builder()
            .name(name)
            .task_type(TaskType::Manual)
            .worker(WorkerSpec::Docker {
                image: "busybox".into(),
                command: vec!["true".into()],
                env: IndexMap::new(),
            })
            .build()
    }

    #[tokio::test]
    async fn tasks_survive_a_reopen() {
        let directory = tempfile::tempdir().unwrap();
        let path = directory.path().join("tasks.json");

        let task = task("deploy");
        {
            let repository = JsonFileTaskRepository::open(&path).unwrap();
            repository.create(&task).await.unwrap();
        }

        let reopened = JsonFileTaskRepository::open(&path).unwrap();
        let fetched = reopened.get_by_id(task.id()).await.unwrap();
        assert_eq!(fetched.name(), "deploy");
    }

    #[tokio::test]
    async fn file_holds_a_single_object_keyed_by_task_id() {
        let directory = tempfile::tempdir().unwrap();
        let path = directory.path().join("tasks.json");

        let repository = JsonFileTaskRepository::open(&path).unwrap();
        let task = task("deploy");
        repository.create(&task).await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&contents).unwrap();
        assert!(parsed.as_object().unwrap().contains_key(task.id()));
    }

    #[tokio::test]
    async fn deleting_the_last_task_leaves_an_empty_object() {
        let directory = tempfile::tempdir().unwrap();
        let path = directory.path().join("tasks.json");

        let repository = JsonFileTaskRepository::open(&path).unwrap();
        let task = task("deploy");
        repository.create(&task).await.unwrap();
        repository.delete(task.id()).await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.trim(), "{}");
    }
}
