//! Resolution of a task definition into a concrete workload.
//!
//! A task declares its workload on its worker; the reserved configuration
//! parameters `Image`, `Command`, `Env`, and `JobTimeout` override the
//! declared values, and `SyncSource`/`SyncTarget` request a file
//! synchronization into the workload before it starts.

use std::time::Duration;

use indexmap::IndexMap;

use crate::executor::ExecutorError;
use crate::executor::Result;
use crate::task::DevOpsTask;
use crate::task::Parameter;
use crate::task::WorkerSpec;

/// The default bound on an execution when the task does not carry a
/// `JobTimeout` parameter.
pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(30);

/// A requested file synchronization into the workload before it starts.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SyncRequest {
    /// The host path to copy from.
    pub source: String,
    /// The path inside the workload to copy to.
    pub target: String,
}

/// Reads the `JobTimeout` parameter, falling back to the default.
fn resolve_timeout(task: &DevOpsTask) -> Duration {
    task.parameter("JobTimeout")
        .and_then(Parameter::as_u64)
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_JOB_TIMEOUT)
}

/// Reads the `SyncSource`/`SyncTarget` parameter pair, if both are present.
fn resolve_sync(task: &DevOpsTask) -> Option<SyncRequest> {
    let source = task.parameter("SyncSource")?.as_str()?.to_owned();
    let target = task.parameter("SyncTarget")?.as_str()?.to_owned();
    Some(SyncRequest { source, target })
}

/// A concrete container workload for the Docker and Kubernetes backends.
#[derive(Clone, Debug)]
pub struct ContainerWorkload {
    /// The container image.
    pub image: String,
    /// The full command to run.
    pub command: Vec<String>,
    /// Environment variables for the container.
    pub env: IndexMap<String, String>,
    /// The namespace declared by a Kubernetes worker, if any.
    pub namespace: Option<String>,
    /// The bound on the execution.
    pub timeout: Duration,
    /// A file synchronization requested before start, if any.
    pub sync: Option<SyncRequest>,
}

impl ContainerWorkload {
    /// Resolves a task with a Docker or Kubernetes worker into a container
    /// workload.
    ///
    /// Fails with a configuration error, before any workload is created,
    /// when the task resolves to an empty image or command, or when its
    /// worker is not a container worker.
    pub fn resolve(task: &DevOpsTask) -> Result<Self> {
        let (mut image, mut command, mut env, namespace) = match task.worker() {
            WorkerSpec::Docker {
                image,
                command,
                env,
            } => (image.clone(), command.clone(), env.clone(), None),
            WorkerSpec::Kubernetes {
                namespace,
                image,
                command,
                env,
            } => (
                image.clone(),
                command.clone(),
                env.clone(),
                namespace.clone(),
            ),
            WorkerSpec::Agent { .. } => {
                return Err(ExecutorError::Configuration(format!(
                    "task `{}` declares an agent worker, not a container worker",
                    task.id()
                )));
            }
        };

        if let Some(value) = task.parameter("Image").and_then(Parameter::as_str) {
            image = value.to_owned();
        }

        if let Some(value) = task.parameter("Command").and_then(Parameter::as_list) {
            command = value.to_vec();
        }

        if let Some(value) = task.parameter("Env").and_then(Parameter::as_map) {
            env.extend(value.iter().map(|(k, v)| (k.clone(), v.clone())));
        }

        if image.is_empty() {
            return Err(ExecutorError::Configuration(format!(
                "task `{}` resolves to an empty image",
                task.id()
            )));
        }

        if command.is_empty() {
            return Err(ExecutorError::Configuration(format!(
                "task `{}` resolves to an empty command",
                task.id()
            )));
        }

        Ok(Self {
            image,
            command,
            env,
            namespace,
            timeout: resolve_timeout(task),
            sync: resolve_sync(task),
        })
    }
}

/// A concrete command workload for the agent backend.
#[derive(Clone, Debug)]
pub struct CommandWorkload {
    /// The id of the agent the command should be routed to, if pinned.
    pub agent_id: Option<String>,
    /// The program to run.
    pub command: String,
    /// The arguments to the program.
    pub args: Vec<String>,
    /// Environment variables for the command.
    pub env: IndexMap<String, String>,
    /// The bound on the execution.
    pub timeout: Duration,
}

impl CommandWorkload {
    /// Resolves a task with an agent worker into a command workload.
    pub fn resolve(task: &DevOpsTask) -> Result<Self> {
        let WorkerSpec::Agent {
            agent_id,
            command,
            args,
            env,
        } = task.worker()
        else {
            return Err(ExecutorError::Configuration(format!(
                "task `{}` does not declare an agent worker",
                task.id()
            )));
        };

        let mut command = command.clone();
        let mut args = args.clone();
        let mut env = env.clone();

        if let Some(value) = task.parameter("Command").and_then(Parameter::as_list) {
            let mut value = value.to_vec();
            if value.is_empty() {
                return Err(ExecutorError::Configuration(format!(
                    "task `{}` resolves to an empty command",
                    task.id()
                )));
            }
            command = value.remove(0);
            args = value;
        }

        if let Some(value) = task.parameter("Env").and_then(Parameter::as_map) {
            env.extend(value.iter().map(|(k, v)| (k.clone(), v.clone())));
        }

        if command.is_empty() {
            return Err(ExecutorError::Configuration(format!(
                "task `{}` resolves to an empty command",
                task.id()
            )));
        }

        Ok(Self {
            agent_id: agent_id.clone(),
            command,
            args,
            env,
            timeout: resolve_timeout(task),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Parameter;
    use crate::task::TaskConfig;
    use crate::task::TaskType;

    /// Builds a Docker task for tests.
    fn docker_task(image: &str, command: Vec<String>) -> DevOpsTask {
        DevOpsTask::builder()
            .name("test")
            .task_type(TaskType::Manual)
            .worker(WorkerSpec::Docker {
                image: image.into(),
                command,
                env: IndexMap::new(),
            })
            .build()
    }

    #[test]
    fn declared_values_resolve() {
        let task = docker_task("busybox", vec!["sh".into(), "-c".into(), "true".into()]);
        let workload = ContainerWorkload::resolve(&task).unwrap();

        assert_eq!(workload.image, "busybox");
        assert_eq!(workload.command.len(), 3);
        assert_eq!(workload.timeout, DEFAULT_JOB_TIMEOUT);
        assert!(workload.sync.is_none());
    }

    #[test]
    fn parameters_override_declared_values() {
        let mut task = docker_task("busybox", vec!["true".into()]);

        let mut parameters = IndexMap::new();
        parameters.insert("Image".to_owned(), Parameter::String("alpine".into()));
        parameters.insert(
            "Command".to_owned(),
            Parameter::List(vec!["echo".into(), "hi".into()]),
        );
        parameters.insert("JobTimeout".to_owned(), Parameter::Integer(120));
        task.set_config(TaskConfig { parameters });

        let workload = ContainerWorkload::resolve(&task).unwrap();
        assert_eq!(workload.image, "alpine");
        assert_eq!(workload.command, vec!["echo".to_owned(), "hi".to_owned()]);
        assert_eq!(workload.timeout, Duration::from_secs(120));
    }

    #[test]
    fn missing_image_is_a_configuration_error() {
        let task = docker_task("", vec!["true".into()]);
        assert!(matches!(
            ContainerWorkload::resolve(&task),
            Err(ExecutorError::Configuration(_))
        ));
    }

    #[test]
    fn missing_command_is_a_configuration_error() {
        let task = docker_task("busybox", Vec::new());
        assert!(matches!(
            ContainerWorkload::resolve(&task),
            Err(ExecutorError::Configuration(_))
        ));
    }

    #[test]
    fn agent_worker_resolves_to_a_command() {
        let task = DevOpsTask::builder()
            .name("remote")
            .task_type(TaskType::Manual)
            .worker(WorkerSpec::Agent {
                agent_id: Some("agent-1".into()),
                command: "ls".into(),
                args: vec!["-la".into()],
                env: IndexMap::new(),
            })
            .build();

        let workload = CommandWorkload::resolve(&task).unwrap();
        assert_eq!(workload.agent_id.as_deref(), Some("agent-1"));
        assert_eq!(workload.command, "ls");
        assert_eq!(workload.args, vec!["-la".to_owned()]);

        assert!(matches!(
            ContainerWorkload::resolve(&task),
            Err(ExecutorError::Configuration(_))
        ));
    }
}
