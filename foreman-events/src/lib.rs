//! Definition of the events broadcast during task execution.
//!
//! Every execution of a task produces an ordered sequence of [`TaskEvent`]s
//! that ends in exactly one terminal event. The [`EventStream`] fans those
//! events out to any number of subscribers keyed by the execution id.

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use uuid::Uuid;

mod stream;

pub use stream::EventStream;
pub use stream::SUBSCRIBER_CHANNEL_CAPACITY;

/// The status of a task execution.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// The execution has been accepted but has not started yet.
    Pending,
    /// The execution is running.
    Running,
    /// The execution completed successfully.
    Succeeded,
    /// The execution failed.
    Failed,
    /// The execution was canceled by a user.
    Canceled,
    /// The execution ended due to an internal error.
    Error,
}

impl TaskStatus {
    /// Returns whether the status is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Canceled | Self::Error
        )
    }
}

/// The type of a [`TaskEvent`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum TaskEventType {
    /// The workload has started.
    TaskStarted,
    /// A progress message (e.g., an image pull) was reported.
    TaskProgress,
    /// A line of workload output was captured.
    TaskOutput,
    /// The execution completed successfully.
    ///
    /// This event is terminal.
    TaskCompleted,
    /// The execution failed.
    ///
    /// This event is terminal.
    TaskFailed,
    /// The execution was canceled.
    ///
    /// This event is terminal.
    TaskCanceled,
    /// The execution ended due to an internal error.
    ///
    /// This event is terminal.
    TaskError,
    /// A remote agent registered with the master.
    WorkerConnected,
    /// The name of the pod backing a Kubernetes execution became known.
    PodName,
    /// A metrics summary was reported by an agent.
    Metrics,
}

impl TaskEventType {
    /// Returns whether publication of an event of this type closes the
    /// execution's subscriber channels.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::TaskCompleted | Self::TaskFailed | Self::TaskCanceled | Self::TaskError
        )
    }
}

/// The payload carried by a [`TaskEvent`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    /// The `{status, error}` record carried by terminal events.
    Terminal {
        /// The final status of the execution.
        status: TaskStatus,
        /// The error message, if the execution did not succeed.
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// A free-form message: a log line for [`TaskEventType::TaskOutput`], a
    /// progress note, a pod name, or a metrics summary.
    Message(String),
}

impl Payload {
    /// Gets the message text, if the payload is a message.
    pub fn as_message(&self) -> Option<&str> {
        match self {
            Self::Message(message) => Some(message.as_str()),
            Self::Terminal { .. } => None,
        }
    }
}

/// An event observed during the lifecycle of one task execution.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskEvent {
    /// The unique id of the event.
    pub id: Uuid,
    /// The id of the execution the event belongs to.
    pub execution_id: String,
    /// When the event was produced.
    pub timestamp: DateTime<Utc>,
    /// The type of the event.
    pub event_type: TaskEventType,
    /// The payload of the event.
    pub payload: Payload,
}

impl TaskEvent {
    /// Creates a new event carrying a message payload.
    pub fn message(
        execution_id: impl Into<String>,
        event_type: TaskEventType,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            execution_id: execution_id.into(),
            timestamp: Utc::now(),
            event_type,
            payload: Payload::Message(message.into()),
        }
    }

    /// Creates the terminal event for an execution that reached `status`.
    ///
    /// Non-terminal statuses map to a [`TaskEventType::TaskProgress`] event
    /// so that intermediate status changes can be reported with the same
    /// payload shape.
    pub fn terminal(
        execution_id: impl Into<String>,
        status: TaskStatus,
        error: Option<String>,
    ) -> Self {
        let event_type = match status {
            TaskStatus::Succeeded => TaskEventType::TaskCompleted,
            TaskStatus::Failed => TaskEventType::TaskFailed,
            TaskStatus::Canceled => TaskEventType::TaskCanceled,
            TaskStatus::Error => TaskEventType::TaskError,
            TaskStatus::Pending | TaskStatus::Running => TaskEventType::TaskProgress,
        };

        Self {
            id: Uuid::new_v4(),
            execution_id: execution_id.into(),
            timestamp: Utc::now(),
            event_type,
            payload: Payload::Terminal { status, error },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses_map_to_terminal_events() {
        for (status, event_type) in [
            (TaskStatus::Succeeded, TaskEventType::TaskCompleted),
            (TaskStatus::Failed, TaskEventType::TaskFailed),
            (TaskStatus::Canceled, TaskEventType::TaskCanceled),
            (TaskStatus::Error, TaskEventType::TaskError),
        ] {
            let event = TaskEvent::terminal("exec-1", status, None);
            assert_eq!(event.event_type, event_type);
            assert!(event.event_type.is_terminal());
        }

        let event = TaskEvent::terminal("exec-1", TaskStatus::Running, None);
        assert_eq!(event.event_type, TaskEventType::TaskProgress);
        assert!(!event.event_type.is_terminal());
    }

    #[test]
    fn status_serializes_screaming_snake_case() {
        let serialized = serde_json::to_string(&TaskStatus::Succeeded).unwrap();
        assert_eq!(serialized, "\"SUCCEEDED\"");
    }
}
