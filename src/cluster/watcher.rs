//! Completion watching and log extraction.

use std::time::Duration;

use futures::StreamExt;
use tracing::{debug, error, info, warn};

use crate::error::ClusterError;
use crate::workload::{Workload, WorkloadKind};

use super::{ClusterApi, TerminalState};

/// Logs of a successfully finished workload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadOutput {
    pub name: String,
    /// Pod the logs were read from, if any pod was found.
    pub pod: Option<String>,
    /// Logs of the workload's output container.
    pub logs: String,
}

/// Logs of one container, collected after a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerLog {
    pub pod: String,
    pub container: String,
    pub logs: String,
}

/// Blocks until the named workload succeeds or fails.
///
/// On success the output container's logs are returned. On failure the logs
/// of every container of every matching pod are logged and
/// `ClusterError::WorkloadFailed` is returned. Failed workloads are never
/// retried.
///
/// # Errors
///
/// - `ClusterError::WorkloadFailed` if the workload reached a failed state
/// - `ClusterError::WatchTimeout` if `timeout` elapsed first
/// - `ClusterError::WatchClosed` if the event stream ended
pub async fn wait_for_completion(
    cluster: &dyn ClusterApi,
    namespace: &str,
    workload: &Workload,
    timeout: Option<Duration>,
) -> Result<WorkloadOutput, ClusterError> {
    let kind = workload.kind();
    let name = workload.name();
    info!(namespace, workload = name, %kind, "Waiting for completion");

    let watch = watch_until_terminal(cluster, namespace, kind, name);
    let terminal = match timeout {
        Some(limit) => tokio::time::timeout(limit, watch)
            .await
            .map_err(|_| ClusterError::WatchTimeout {
                kind,
                name: name.to_string(),
                seconds: limit.as_secs(),
            })??,
        None => watch.await?,
    };

    match terminal {
        TerminalState::Succeeded => {
            info!(namespace, workload = name, %kind, "Completed successfully");
            read_output(cluster, namespace, workload).await
        }
        TerminalState::Failed { reason } => {
            error!(namespace, workload = name, %kind, %reason, "Workload failed");
            collect_failure_logs(cluster, namespace, &workload.pod_selector()).await;
            Err(ClusterError::WorkloadFailed {
                kind,
                name: name.to_string(),
                reason,
            })
        }
    }
}

async fn watch_until_terminal(
    cluster: &dyn ClusterApi,
    namespace: &str,
    kind: WorkloadKind,
    name: &str,
) -> Result<TerminalState, ClusterError> {
    let mut events = cluster.watch_workloads(namespace, kind).await?;

    while let Some(item) = events.next().await {
        let event = match item {
            Ok(event) => event,
            Err(e) => {
                warn!(namespace, workload = name, error = %e, "Watch stream error, continuing");
                continue;
            }
        };

        if event.name != name {
            continue;
        }
        let Some(status) = event.status else {
            debug!(workload = name, "No status yet");
            continue;
        };

        match status.terminal_state() {
            Some(state) => return Ok(state),
            None => debug!(workload = name, ?status, "Still running"),
        }
    }

    Err(ClusterError::WatchClosed {
        kind,
        name: name.to_string(),
    })
}

async fn read_output(
    cluster: &dyn ClusterApi,
    namespace: &str,
    workload: &Workload,
) -> Result<WorkloadOutput, ClusterError> {
    let pods = cluster.list_pods(namespace, &workload.pod_selector()).await?;
    let pod = pods
        .iter()
        .find(|p| p.succeeded())
        .or_else(|| pods.first());

    let Some(pod) = pod else {
        warn!(
            namespace,
            workload = workload.name(),
            "No pods found for finished workload"
        );
        return Ok(WorkloadOutput {
            name: workload.name().to_string(),
            pod: None,
            logs: String::new(),
        });
    };

    let container = workload.output_container();
    let logs = cluster.container_logs(namespace, &pod.name, container).await?;
    debug!(pod = %pod.name, container, bytes = logs.len(), "Read output logs");

    Ok(WorkloadOutput {
        name: workload.name().to_string(),
        pod: Some(pod.name.clone()),
        logs,
    })
}

/// Fetches and logs every init and main container of every pod matching
/// `label_selector`.
///
/// Containers that have not started and containers whose logs cannot be read
/// are skipped; collection never aborts.
pub async fn collect_failure_logs(
    cluster: &dyn ClusterApi,
    namespace: &str,
    label_selector: &str,
) -> Vec<ContainerLog> {
    let pods = match cluster.list_pods(namespace, label_selector).await {
        Ok(pods) => pods,
        Err(e) => {
            error!(namespace, selector = label_selector, error = %e, "Failed to list pods");
            return Vec::new();
        }
    };

    let mut collected = Vec::new();
    for pod in &pods {
        for container in pod.all_containers() {
            match cluster.container_logs(namespace, &pod.name, container).await {
                Ok(logs) => {
                    error!(pod = %pod.name, container, "Container logs:\n{logs}");
                    collected.push(ContainerLog {
                        pod: pod.name.clone(),
                        container: container.to_string(),
                        logs,
                    });
                }
                Err(e) if e.is_not_started() => {
                    warn!(pod = %pod.name, container, "Container not started, skipping");
                }
                Err(e) => {
                    warn!(pod = %pod.name, container, error = %e, "Failed to read logs, skipping");
                }
            }
        }
    }
    collected
}
