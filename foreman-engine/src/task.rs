//! Tasks that can be dispatched to executor backends.

use bon::Builder;
use chrono::DateTime;
use chrono::Utc;
use indexmap::IndexMap;
use serde::Deserialize;
use serde::Serialize;
use uuid::Uuid;

pub mod execution;

pub use execution::Artifact;
pub use execution::TaskExecution;

/// The kind of a task, describing how its execution is initiated.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskType {
    /// The task runs on a schedule.
    Scheduled,
    /// The task runs when an external trigger fires.
    Triggered,
    /// The task runs after an approval.
    Approval,
    /// The task runs when a user asks for it.
    Manual,
}

/// The workspace a task belongs to.
#[derive(Builder, Clone, Debug, Serialize, Deserialize)]
pub struct Workspace {
    /// The id of the workspace.
    #[builder(into)]
    pub id: String,
    /// The display name of the workspace.
    #[builder(into)]
    pub name: String,
}

/// One recorded approval of a task.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Approval {
    /// The id of the approval.
    pub id: String,
    /// The id of the approving user.
    pub user_id: String,
    /// Whether the approval was granted.
    pub approved: bool,
    /// When the approval was recorded.
    pub approved_at: Option<DateTime<Utc>>,
}

/// A trigger describing when a task should run.
///
/// Trigger evaluation is performed by an outer scheduler; the engine only
/// carries the definition.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Trigger {
    /// A cron-style schedule.
    Scheduled {
        /// The schedule expression.
        expression: String,
    },
}

/// A single free-form configuration parameter value.
///
/// The reserved keys `Image`, `Command`, `Env`, and `JobTimeout` override
/// the corresponding values declared by the task's worker; `SyncSource` and
/// `SyncTarget` request a file synchronization into the workload before it
/// starts.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Parameter {
    /// A string value.
    String(String),
    /// An integer value (e.g., a timeout in seconds).
    Integer(u64),
    /// A list of strings (e.g., a command).
    List(Vec<String>),
    /// A string-to-string map (e.g., environment variables).
    Map(IndexMap<String, String>),
}

impl Parameter {
    /// Gets the value as a string, if it is one.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(value) => Some(value),
            _ => None,
        }
    }

    /// Gets the value as an integer, if it is one.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::Integer(value) => Some(*value),
            _ => None,
        }
    }

    /// Gets the value as a list of strings, if it is one.
    pub fn as_list(&self) -> Option<&[String]> {
        match self {
            Self::List(value) => Some(value),
            _ => None,
        }
    }

    /// Gets the value as a map, if it is one.
    pub fn as_map(&self) -> Option<&IndexMap<String, String>> {
        match self {
            Self::Map(value) => Some(value),
            _ => None,
        }
    }
}

/// The free-form configuration of a task.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TaskConfig {
    /// The configuration parameters.
    #[serde(default)]
    pub parameters: IndexMap<String, Parameter>,
}

/// The kind of worker a task declares.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkerKind {
    /// A container run by the local Docker daemon.
    Docker,
    /// A job run on a Kubernetes cluster.
    Kubernetes,
    /// A command run by a remote agent.
    Agent,
}

impl std::fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Docker => write!(f, "docker"),
            Self::Kubernetes => write!(f, "kubernetes"),
            Self::Agent => write!(f, "agent"),
        }
    }
}

/// The worker a task declares, determining which executor backend runs it.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum WorkerSpec {
    /// A container run by the local Docker daemon.
    Docker {
        /// The container image.
        image: String,
        /// The full command to run.
        command: Vec<String>,
        /// Environment variables for the container.
        #[serde(default)]
        env: IndexMap<String, String>,
    },
    /// A job run on a Kubernetes cluster.
    Kubernetes {
        /// The namespace to create the job in; the executor's configured
        /// namespace is used when absent.
        #[serde(default)]
        namespace: Option<String>,
        /// The container image.
        image: String,
        /// The full command to run.
        command: Vec<String>,
        /// Environment variables for the container.
        #[serde(default)]
        env: IndexMap<String, String>,
    },
    /// A command run by a remote agent.
    Agent {
        /// The id of the agent the command should be routed to; any
        /// connected agent may pick the command up when absent.
        #[serde(default)]
        agent_id: Option<String>,
        /// The program to run.
        command: String,
        /// The arguments to the program.
        #[serde(default)]
        args: Vec<String>,
        /// Environment variables for the command.
        #[serde(default)]
        env: IndexMap<String, String>,
    },
}

impl WorkerSpec {
    /// Gets the kind of the worker.
    pub fn kind(&self) -> WorkerKind {
        match self {
            Self::Docker { .. } => WorkerKind::Docker,
            Self::Kubernetes { .. } => WorkerKind::Kubernetes,
            Self::Agent { .. } => WorkerKind::Agent,
        }
    }
}

/// A DevOps task definition.
#[derive(Builder, Clone, Debug, Serialize, Deserialize)]
#[builder(builder_type = Builder)]
pub struct DevOpsTask {
    /// The stable id of the task; generated when not provided.
    #[builder(into, default = Uuid::new_v4().to_string())]
    #[serde(default)]
    id: String,

    /// The name of the task.
    #[builder(into)]
    name: String,

    /// An optional description.
    #[builder(into)]
    #[serde(default)]
    description: Option<String>,

    /// The kind of the task.
    task_type: TaskType,

    /// When the task was created.
    #[builder(default = Utc::now())]
    created_at: DateTime<Utc>,

    /// When the task was last updated.
    #[builder(default = Utc::now())]
    updated_at: DateTime<Utc>,

    /// The worker the task declares.
    worker: WorkerSpec,

    /// The free-form configuration of the task.
    #[builder(default)]
    #[serde(default)]
    config: TaskConfig,

    /// The executions of the task, oldest first. Append-only.
    #[builder(default)]
    #[serde(default)]
    executions: Vec<TaskExecution>,

    /// The workspace the task belongs to, if any.
    #[builder(into)]
    #[serde(default)]
    workspace: Option<Workspace>,

    /// The subjects (free-form labels) attached to the task.
    #[builder(into, default)]
    #[serde(default)]
    subjects: Vec<String>,

    /// The approvals recorded for the task.
    #[builder(default)]
    #[serde(default)]
    approvals: Vec<Approval>,

    /// The trigger of the task, if any.
    #[builder(into)]
    #[serde(default)]
    trigger: Option<Trigger>,
}

impl DevOpsTask {
    /// Gets the id of the task.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Overrides the task's id.
    pub fn set_id(&mut self, id: impl Into<String>) {
        self.id = id.into();
    }

    /// Gets the name of the task.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sets the name of the task.
    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// Gets the description of the task (if it exists).
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Sets the description of the task.
    pub fn set_description(&mut self, description: impl Into<String>) {
        self.description = Some(description.into());
    }

    /// Gets the kind of the task.
    pub fn task_type(&self) -> TaskType {
        self.task_type
    }

    /// Sets the kind of the task.
    pub fn set_task_type(&mut self, task_type: TaskType) {
        self.task_type = task_type;
    }

    /// Gets when the task was created.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Gets when the task was last updated.
    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Marks the task as updated now.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Gets the worker the task declares.
    pub fn worker(&self) -> &WorkerSpec {
        &self.worker
    }

    /// Gets the configuration of the task.
    pub fn config(&self) -> &TaskConfig {
        &self.config
    }

    /// Sets the configuration of the task.
    pub fn set_config(&mut self, config: TaskConfig) {
        self.config = config;
    }

    /// Gets a configuration parameter by name.
    pub fn parameter(&self, name: &str) -> Option<&Parameter> {
        self.config.parameters.get(name)
    }

    /// Gets the executions of the task, oldest first.
    pub fn executions(&self) -> &[TaskExecution] {
        &self.executions
    }

    /// Appends an execution to the task.
    ///
    /// The executions list is append-only.
    pub fn push_execution(&mut self, execution: TaskExecution) {
        self.executions.push(execution);
    }

    /// Gets an execution of the task by id.
    pub fn execution(&self, execution_id: &str) -> Option<&TaskExecution> {
        self.executions.iter().find(|e| e.id() == execution_id)
    }

    /// Gets the workspace the task belongs to (if any).
    pub fn workspace(&self) -> Option<&Workspace> {
        self.workspace.as_ref()
    }

    /// Gets the subjects attached to the task.
    pub fn subjects(&self) -> &[String] {
        &self.subjects
    }

    /// Gets the approvals recorded for the task.
    pub fn approvals(&self) -> &[Approval] {
        &self.approvals
    }

    /// Sets the approvals recorded for the task.
    pub fn set_approvals(&mut self, approvals: Vec<Approval>) {
        self.approvals = approvals;
    }

    /// Gets the trigger of the task (if any).
    pub fn trigger(&self) -> Option<&Trigger> {
        self.trigger.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_generates_an_id_when_absent() {
        let task = DevOpsTask::builder()
            .name("deploy")
            .task_type(TaskType::Manual)
            .worker(WorkerSpec::Docker {
                image: "busybox".into(),
                command: vec!["true".into()],
                env: IndexMap::new(),
            })
            .build();

        assert!(!task.id().is_empty());
        assert!(task.executions().is_empty());
    }

    #[test]
    fn worker_kinds_route() {
        let worker = WorkerSpec::Agent {
            agent_id: None,
            command: "pwd".into(),
            args: Vec::new(),
            env: IndexMap::new(),
        };
        assert_eq!(worker.kind(), WorkerKind::Agent);
        assert_eq!(worker.kind().to_string(), "agent");
    }

    #[test]
    fn parameters_round_trip_through_json() {
        let mut parameters = IndexMap::new();
        parameters.insert("Image".to_owned(), Parameter::String("busybox".into()));
        parameters.insert("JobTimeout".to_owned(), Parameter::Integer(60));
        parameters.insert(
            "Command".to_owned(),
            Parameter::List(vec!["sh".into(), "-c".into(), "true".into()]),
        );

        let config = TaskConfig { parameters };
        let serialized = serde_json::to_string(&config).unwrap();
        let deserialized: TaskConfig = serde_json::from_str(&serialized).unwrap();

        assert_eq!(
            deserialized.parameters.get("JobTimeout").and_then(Parameter::as_u64),
            Some(60)
        );
        assert_eq!(
            deserialized.parameters.get("Image").and_then(Parameter::as_str),
            Some("busybox")
        );
    }
}
