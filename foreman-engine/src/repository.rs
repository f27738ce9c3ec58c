//! Task storage.

use std::fmt::Debug;

use async_trait::async_trait;
use bon::Builder;
use thiserror::Error;

use crate::task::DevOpsTask;
use crate::task::TaskType;

pub mod jsonfile;
pub mod memory;

pub use jsonfile::JsonFileTaskRepository;
pub use memory::MemoryTaskRepository;

/// An error related to task storage.
#[derive(Error, Debug)]
pub enum RepositoryError {
    /// The requested task does not exist.
    #[error("task `{0}` was not found")]
    NotFound(String),
    /// No task owns the requested execution.
    #[error("no task owns execution `{0}`")]
    ExecutionNotFound(String),
    /// An i/o error from a file-backed repository.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// A serialization error from a file-backed repository.
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

/// A [`Result`](std::result::Result) with a [`RepositoryError`].
pub type Result<T> = std::result::Result<T, RepositoryError>;

/// Filters applied when listing tasks.
///
/// All present filters must match; `subjects` matches when the task carries
/// at least one of the requested subjects.
#[derive(Builder, Clone, Debug, Default)]
#[builder(builder_type = Builder)]
pub struct TaskFilters {
    /// Restricts the listing to tasks in a workspace.
    #[builder(into)]
    pub workspace_id: Option<String>,
    /// Restricts the listing to tasks of a kind.
    pub task_type: Option<TaskType>,
    /// Restricts the listing to tasks carrying any of these subjects.
    #[builder(into, default)]
    pub subjects: Vec<String>,
}

impl TaskFilters {
    /// Returns whether a task matches the filters.
    pub fn matches(&self, task: &DevOpsTask) -> bool {
        if let Some(workspace_id) = &self.workspace_id {
            if task.workspace().map(|w| w.id.as_str()) != Some(workspace_id.as_str()) {
                return false;
            }
        }

        if let Some(task_type) = self.task_type {
            if task.task_type() != task_type {
                return false;
            }
        }

        if !self.subjects.is_empty()
            && !self
                .subjects
                .iter()
                .any(|subject| task.subjects().contains(subject))
        {
            return false;
        }

        true
    }
}

/// Persistence operations for tasks.
#[async_trait]
pub trait TaskRepository: Debug + Send + Sync + 'static {
    /// Stores a new task.
    async fn create(&self, task: &DevOpsTask) -> Result<()>;

    /// Gets a task by id.
    async fn get_by_id(&self, task_id: &str) -> Result<DevOpsTask>;

    /// Lists the tasks matching the filters.
    async fn get_all(&self, filters: &TaskFilters) -> Result<Vec<DevOpsTask>>;

    /// Replaces a stored task.
    ///
    /// Updating with an unchanged payload is idempotent.
    async fn update(&self, task: &DevOpsTask) -> Result<()>;

    /// Deletes a task by id.
    async fn delete(&self, task_id: &str) -> Result<()>;

    /// Gets the task that owns an execution.
    async fn get_by_execution_id(&self, execution_id: &str) -> Result<DevOpsTask>;
}
