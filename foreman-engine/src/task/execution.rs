//! One attempt to run a task.

use bon::Builder;
use chrono::DateTime;
use chrono::Utc;
use foreman_events::TaskStatus;
use serde::Deserialize;
use serde::Serialize;

/// An artifact produced by an execution.
#[derive(Builder, Clone, Debug, Serialize, Deserialize)]
pub struct Artifact {
    /// The name of the artifact.
    #[builder(into)]
    pub name: String,
    /// Where the artifact can be retrieved from.
    #[builder(into)]
    pub uri: String,
}

/// One attempt to run a task.
///
/// Executions are append-only on their task: after creation, only the
/// status, finish time, error, and output are ever mutated.
#[derive(Builder, Clone, Debug, Serialize, Deserialize)]
#[builder(builder_type = Builder)]
pub struct TaskExecution {
    /// The unique id of the execution.
    #[builder(into)]
    id: String,

    /// The id of the task the execution belongs to.
    #[builder(into)]
    devops_task_id: String,

    /// The status of the execution.
    #[builder(default = TaskStatus::Pending)]
    status: TaskStatus,

    /// When the execution started.
    #[builder(default = Utc::now())]
    started_at: DateTime<Utc>,

    /// When the execution finished, if it has.
    #[serde(default)]
    finished_at: Option<DateTime<Utc>>,

    /// The id of the executor backend that ran the execution.
    #[builder(into, default)]
    #[serde(default)]
    task_executor_id: String,

    /// The artifact produced by the execution, if any.
    #[serde(default)]
    output: Option<Artifact>,

    /// The error message, set when the execution did not succeed.
    #[serde(default)]
    error: Option<String>,
}

impl TaskExecution {
    /// Gets the id of the execution.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Gets the id of the task the execution belongs to.
    pub fn devops_task_id(&self) -> &str {
        &self.devops_task_id
    }

    /// Gets the status of the execution.
    pub fn status(&self) -> TaskStatus {
        self.status
    }

    /// Sets the status of the execution.
    pub fn set_status(&mut self, status: TaskStatus) {
        self.status = status;
    }

    /// Gets when the execution started.
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Gets when the execution finished, if it has.
    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    /// Gets the id of the executor backend that ran the execution.
    pub fn task_executor_id(&self) -> &str {
        &self.task_executor_id
    }

    /// Gets the artifact produced by the execution, if any.
    pub fn output(&self) -> Option<&Artifact> {
        self.output.as_ref()
    }

    /// Sets the artifact produced by the execution.
    pub fn set_output(&mut self, output: Artifact) {
        self.output = Some(output);
    }

    /// Gets the error message, if the execution did not succeed.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Marks the execution as finished with the given status.
    pub fn finish(&mut self, status: TaskStatus, error: Option<String>) {
        self.status = status;
        self.finished_at = Some(Utc::now());
        if error.is_some() {
            self.error = error;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finish_records_status_time_and_error() {
        let mut execution = TaskExecution::builder()
            .id("exec-1")
            .devops_task_id("task-1")
            .status(TaskStatus::Running)
            .build();

        assert!(execution.finished_at().is_none());

        execution.finish(TaskStatus::Failed, Some("boom".into()));

        assert_eq!(execution.status(), TaskStatus::Failed);
        assert!(execution.finished_at().is_some());
        assert_eq!(execution.error(), Some("boom"));
    }
}
