//! The Kubernetes executor backend.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use anyhow::bail;
use async_trait::async_trait;
use foreman_events::EventStream;
use foreman_events::TaskEvent;
use foreman_events::TaskEventType;
use foreman_events::TaskStatus;
use futures::AsyncBufReadExt as _;
use futures::TryStreamExt as _;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::batch::v1::JobSpec;
use k8s_openapi::api::core::v1::Container;
use k8s_openapi::api::core::v1::EnvVar;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::core::v1::PodSpec;
use k8s_openapi::api::core::v1::PodTemplateSpec;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Api;
use kube::Client;
use kube::api::DeleteParams;
use kube::api::ListParams;
use kube::api::LogParams;
use kube::api::PostParams;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

use crate::executor::ContainerWorkload;
use crate::executor::ExecutionTable;
use crate::executor::Result;
use crate::executor::TaskExecutor;
use crate::task::DevOpsTask;
use crate::task::TaskExecution;

/// The identifier this backend records on its executions.
const EXECUTOR_ID: &str = "kubernetes";

/// The interval between pod and job polls.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// How long to wait for the job's pod to start running.
const POD_RUNNING_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// How long to wait for the job to complete once its pod has run.
const JOB_COMPLETION_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// An executor backend that runs each task as a Kubernetes `Job`.
pub struct KubernetesExecutor {
    /// The Kubernetes API client.
    client: Client,
    /// The namespace jobs are created in when the task does not name one.
    namespace: String,
    /// The per-execution bookkeeping.
    executions: ExecutionTable,
}

impl std::fmt::Debug for KubernetesExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubernetesExecutor")
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

impl KubernetesExecutor {
    /// Attempts to create a new executor.
    ///
    /// The client configuration is inferred: the local kubeconfig is used
    /// when present, falling back to the in-cluster environment. Failure of
    /// both is a configuration error that is fatal to the caller.
    pub async fn new(namespace: impl Into<String>, events: Arc<EventStream>) -> Result<Self> {
        let client = Client::try_default()
            .await
            .context("error building the Kubernetes client from kubeconfig or in-cluster config")?;

        Ok(Self::with_client(client, namespace, events))
    }

    /// Creates a new executor with the provided Kubernetes client.
    pub fn with_client(
        client: Client,
        namespace: impl Into<String>,
        events: Arc<EventStream>,
    ) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            executions: ExecutionTable::new(events),
        }
    }
}

#[async_trait]
impl TaskExecutor for KubernetesExecutor {
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

        let namespace = workload
            .namespace
            .clone()
            .unwrap_or_else(|| self.namespace.clone());
        let client = self.client.clone();
        let executions = self.executions.clone();
        let id = execution_id.clone();
        tokio::spawn(async move {
            run(client, namespace, executions, workload, id, token).await;
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

/// Builds the `Job` object for a workload.
fn build_job(job_name: &str, workload: &ContainerWorkload) -> Job {
    let env = workload
        .env
        .iter()
        .map(|(name, value)| EnvVar {
            name: name.clone(),
            value: Some(value.clone()),
            ..Default::default()
        })
        .collect::<Vec<_>>();

    Job {
        metadata: ObjectMeta {
            name: Some(job_name.to_owned()),
            ..Default::default()
        },
        spec: Some(JobSpec {
            template: PodTemplateSpec {
                metadata: None,
                spec: Some(PodSpec {
                    restart_policy: Some("Never".to_owned()),
                    containers: vec![Container {
                        name: "task".to_owned(),
                        image: Some(workload.image.clone()),
                        command: Some(workload.command.clone()),
                        env: if env.is_empty() { None } else { Some(env) },
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    }
}

/// Drives one execution from job creation to its terminal event.
async fn run(
    client: Client,
    namespace: String,
    executions: ExecutionTable,
    workload: ContainerWorkload,
    execution_id: String,
    token: CancellationToken,
) {
    let job_name = format!("task-{execution_id}");
    let jobs: Api<Job> = Api::namespaced(client.clone(), &namespace);
    let pods: Api<Pod> = Api::namespaced(client, &namespace);

    let outcome = tokio::select! {
        _ = token.cancelled() => Ok(TaskStatus::Canceled),
        result = tokio::time::timeout(
            workload.timeout,
            run_job(&jobs, &pods, &executions, &workload, &job_name, &execution_id),
        ) => match result {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!(
                "execution deadline of {}s exceeded",
                workload.timeout.as_secs()
            )),
        },
    };

    match outcome {
        Ok(status) => executions.finish(&execution_id, status, None).await,
        Err(e) => {
            executions
                .finish(&execution_id, TaskStatus::Failed, Some(format!("{e:#}")))
                .await
        }
    }

    // Delete the job on a detached task with background propagation so the
    // pod is garbage-collected even when the execution was canceled or
    // timed out.
    tokio::spawn(async move {
        if let Err(e) = jobs.delete(&job_name, &DeleteParams::background()).await {
            warn!("error deleting job `{job_name}`: {e}");
        }
    });
}

/// Creates the job, waits for its pod, streams its logs, and waits for
/// completion, publishing lifecycle events along the way.
async fn run_job(
    jobs: &Api<Job>,
    pods: &Api<Pod>,
    executions: &ExecutionTable,
    workload: &ContainerWorkload,
    job_name: &str,
    execution_id: &str,
) -> anyhow::Result<TaskStatus> {
    let job = build_job(job_name, workload);
    jobs.create(&PostParams::default(), &job)
        .await
        .context("failed to create job")?;

    let pod_name = wait_for_pod_running(pods, job_name)
        .await
        .context("failed to wait for pod running")?;

    executions
        .publish_message(execution_id, TaskEventType::PodName, pod_name.clone())
        .await;
    executions
        .publish_message(execution_id, TaskEventType::TaskStarted, "Pod is started")
        .await;

    stream_pod_logs(pods, &pod_name, executions, execution_id)
        .await
        .context("error streaming logs")?;

    wait_for_job_completion(jobs, job_name)
        .await
        .context("failed to wait for job completion")?;

    Ok(TaskStatus::Succeeded)
}

/// Polls the job's pods until one is running and returns its name.
///
/// A pod that reaches a terminal phase before it was ever observed running
/// fails the execution.
async fn wait_for_pod_running(pods: &Api<Pod>, job_name: &str) -> anyhow::Result<String> {
    let params = ListParams::default().labels(&format!("job-name={job_name}"));

    let poll = async {
        let mut interval = tokio::time::interval(POLL_INTERVAL);
        loop {
            interval.tick().await;

            let list = pods.list(&params).await?;
            let Some(pod) = list.items.first() else {
                continue;
            };

            let name = pod.metadata.name.clone().unwrap_or_default();
            match pod.status.as_ref().and_then(|status| status.phase.as_deref()) {
                Some("Running") => return Ok(name),
                Some("Failed") | Some("Succeeded") => {
                    bail!("POD_TERMINATED: pod terminated before running")
                }
                _ => continue,
            }
        }
    };

    tokio::time::timeout(POD_RUNNING_TIMEOUT, poll)
        .await
        .map_err(|_| anyhow::anyhow!("timed out waiting for the pod to start"))?
}

/// Follows the pod's log stream, emitting one output event per line.
async fn stream_pod_logs(
    pods: &Api<Pod>,
    pod_name: &str,
    executions: &ExecutionTable,
    execution_id: &str,
) -> anyhow::Result<()> {
    let params = LogParams {
        follow: true,
        ..Default::default()
    };

    let mut lines = pods.log_stream(pod_name, &params).await?.lines();
    while let Some(line) = lines.try_next().await? {
        executions
            .publish_message(execution_id, TaskEventType::TaskOutput, line)
            .await;
    }

    Ok(())
}

/// Polls the job until it reports success or failure.
async fn wait_for_job_completion(jobs: &Api<Job>, job_name: &str) -> anyhow::Result<()> {
    let poll = async {
        let mut interval = tokio::time::interval(POLL_INTERVAL);
        loop {
            interval.tick().await;

            let job = jobs.get(job_name).await?;
            let Some(status) = job.status else {
                continue;
            };

            if status.succeeded.unwrap_or_default() > 0 {
                return Ok(());
            }

            if status.failed.unwrap_or_default() > 0 {
                bail!("JOB_FAILED: job execution failed");
            }
        }
    };

    tokio::time::timeout(JOB_COMPLETION_TIMEOUT, poll)
        .await
        .map_err(|_| anyhow::anyhow!("timed out waiting for the job to complete"))?
}

#[cfg(test)]
mod tests {
    use indexmap::IndexMap;

    use super::*;

    #[test]
    fn jobs_run_one_container_with_no_restarts() {
        let mut env = IndexMap::new();
        env.insert("KEY".to_owned(), "value".to_owned());

        let workload = ContainerWorkload {
            image: "busybox".to_owned(),
            command: vec!["sh".to_owned(), "-c".to_owned(), "true".to_owned()],
            env,
            namespace: None,
            timeout: Duration::from_secs(30),
            sync: None,
        };

        let job = build_job("task-abc", &workload);
        assert_eq!(job.metadata.name.as_deref(), Some("task-abc"));

        let spec = job.spec.unwrap();
        let pod = spec.template.spec.unwrap();
        assert_eq!(pod.restart_policy.as_deref(), Some("Never"));
        assert_eq!(pod.containers.len(), 1);

        let container = &pod.containers[0];
        assert_eq!(container.image.as_deref(), Some("busybox"));
        assert_eq!(container.command.as_ref().unwrap().len(), 3);
        assert_eq!(container.env.as_ref().unwrap()[0].name, "KEY");
    }
}
