//! Kubernetes access layer.
//!
//! Everything the pipeline asks of the cluster goes through [`ClusterApi`]:
//! namespaced creates, a live event stream per workload kind, pod listing by
//! label selector and container log reads. [`KubeCluster`] implements it on
//! top of `kube`; tests substitute an in-memory fake.
//!
//! # Stage flow
//!
//! ```text
//! provisioner (PVCs, ConfigMaps, Secrets) → submitter (Job / PyTorchJob) → watcher
//! ```
//!
//! Creates are idempotent: an "already exists" response is reported as
//! [`ClusterError::AlreadyExists`] and callers treat it as success.

pub mod crd;
pub mod kube_client;
pub mod manifest;
pub mod provisioner;
pub mod submitter;
pub mod watcher;

use async_trait::async_trait;
use futures::stream::BoxStream;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Pod, Secret};

use crate::error::ClusterError;
use crate::workload::WorkloadKind;

pub use crd::{JobCondition, PyTorchJob, PyTorchJobSpec, PyTorchJobStatus, ReplicaSpec};
pub use kube_client::KubeCluster;
pub use provisioner::{
    ensure_judge_config, ensure_sdg_config, ensure_serving_config, ensure_volume_claims,
    AccessMode, ServingEndpoint, VolumeClaim,
};
pub use submitter::{submit, Submission};
pub use watcher::{collect_failure_logs, wait_for_completion, ContainerLog, WorkloadOutput};

/// Stream of workload events for one namespace and kind.
pub type WorkloadEventStream = BoxStream<'static, Result<WorkloadEvent, ClusterError>>;

/// Operations the pipeline needs from a Kubernetes cluster.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn create_persistent_volume_claim(
        &self,
        namespace: &str,
        claim: &PersistentVolumeClaim,
    ) -> Result<(), ClusterError>;

    async fn create_config_map(
        &self,
        namespace: &str,
        config_map: &ConfigMap,
    ) -> Result<(), ClusterError>;

    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<(), ClusterError>;

    async fn create_job(&self, namespace: &str, job: &Job) -> Result<(), ClusterError>;

    async fn create_pytorch_job(
        &self,
        namespace: &str,
        job: &PyTorchJob,
    ) -> Result<(), ClusterError>;

    /// Opens a live event stream over all workloads of `kind` in `namespace`.
    async fn watch_workloads(
        &self,
        namespace: &str,
        kind: WorkloadKind,
    ) -> Result<WorkloadEventStream, ClusterError>;

    async fn list_pods(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<PodSummary>, ClusterError>;

    /// Reads the full log of one container.
    ///
    /// Returns [`ClusterError::ContainerNotStarted`] if the container has
    /// not started yet.
    async fn container_logs(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
    ) -> Result<String, ClusterError>;
}

/// One observation of a workload from the event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadEvent {
    pub name: String,
    /// `None` until the controller has written a status.
    pub status: Option<WorkloadStatus>,
}

/// Status fields the watcher keys off.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkloadStatus {
    Batch {
        active: i32,
        succeeded: i32,
        failed: i32,
        failure_reason: Option<String>,
    },
    Distributed {
        conditions: Vec<JobCondition>,
    },
}

/// Terminal outcome of a workload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalState {
    Succeeded,
    Failed { reason: String },
}

impl WorkloadStatus {
    /// Returns the terminal state if the workload has finished.
    ///
    /// Batch jobs use the succeeded / failed counters. Distributed jobs use
    /// the most recent `Succeeded` or `Failed` condition whose status is not
    /// `"False"`.
    pub fn terminal_state(&self) -> Option<TerminalState> {
        match self {
            WorkloadStatus::Batch {
                succeeded,
                failed,
                failure_reason,
                ..
            } => {
                if *succeeded > 0 {
                    Some(TerminalState::Succeeded)
                } else if *failed > 0 {
                    Some(TerminalState::Failed {
                        reason: failure_reason
                            .clone()
                            .unwrap_or_else(|| format!("{failed} pod(s) failed")),
                    })
                } else {
                    None
                }
            }
            WorkloadStatus::Distributed { conditions } => conditions
                .iter()
                .rev()
                .filter(|c| c.status != "False")
                .find_map(|c| match c.type_.as_str() {
                    "Succeeded" => Some(TerminalState::Succeeded),
                    "Failed" => Some(TerminalState::Failed {
                        reason: c
                            .reason
                            .clone()
                            .or_else(|| c.message.clone())
                            .unwrap_or_else(|| "Failed".to_string()),
                    }),
                    _ => None,
                }),
        }
    }
}

impl From<&Job> for WorkloadEvent {
    fn from(job: &Job) -> Self {
        let status = job.status.as_ref().map(|status| WorkloadStatus::Batch {
            active: status.active.unwrap_or(0),
            succeeded: status.succeeded.unwrap_or(0),
            failed: status.failed.unwrap_or(0),
            failure_reason: status.conditions.as_ref().and_then(|conditions| {
                conditions
                    .iter()
                    .find(|c| c.type_ == "Failed" && c.status == "True")
                    .and_then(|c| c.reason.clone())
            }),
        });

        Self {
            name: job.metadata.name.clone().unwrap_or_default(),
            status,
        }
    }
}

impl From<&PyTorchJob> for WorkloadEvent {
    fn from(job: &PyTorchJob) -> Self {
        let status = job
            .status
            .as_ref()
            .and_then(|status| status.conditions.clone())
            .map(|conditions| WorkloadStatus::Distributed { conditions });

        Self {
            name: job.metadata.name.clone().unwrap_or_default(),
            status,
        }
    }
}

/// The parts of a pod the watcher needs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PodSummary {
    pub name: String,
    /// Pod phase, e.g. `Succeeded` or `Failed`.
    pub phase: Option<String>,
    pub init_containers: Vec<String>,
    pub containers: Vec<String>,
}

impl PodSummary {
    /// Init containers followed by main containers.
    pub fn all_containers(&self) -> impl Iterator<Item = &str> {
        self.init_containers
            .iter()
            .chain(self.containers.iter())
            .map(String::as_str)
    }

    pub fn succeeded(&self) -> bool {
        self.phase.as_deref() == Some("Succeeded")
    }
}

impl From<&Pod> for PodSummary {
    fn from(pod: &Pod) -> Self {
        let spec = pod.spec.as_ref();
        Self {
            name: pod.metadata.name.clone().unwrap_or_default(),
            phase: pod.status.as_ref().and_then(|s| s.phase.clone()),
            init_containers: spec
                .and_then(|s| s.init_containers.as_ref())
                .map(|c| c.iter().map(|c| c.name.clone()).collect())
                .unwrap_or_default(),
            containers: spec
                .map(|s| s.containers.iter().map(|c| c.name.clone()).collect())
                .unwrap_or_default(),
        }
    }
}

/// Recognizes the API server's refusal to stream logs of a container that
/// has not started.
pub fn is_not_started_message(message: &str) -> bool {
    message.contains("waiting to start")
        || message.contains("PodInitializing")
        || message.contains("ContainerCreating")
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::batch::v1::JobStatus;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn conditions(items: &[(&str, &str)]) -> WorkloadStatus {
        WorkloadStatus::Distributed {
            conditions: items
                .iter()
                .map(|(t, s)| JobCondition::new(*t, *s))
                .collect(),
        }
    }

    #[test]
    fn test_batch_terminal_state() {
        let job = Job {
            metadata: ObjectMeta {
                name: Some("sdg".to_string()),
                ..Default::default()
            },
            status: Some(JobStatus {
                succeeded: Some(1),
                ..Default::default()
            }),
            ..Default::default()
        };
        let event = WorkloadEvent::from(&job);
        assert_eq!(event.name, "sdg");
        assert_eq!(
            event.status.and_then(|s| s.terminal_state()),
            Some(TerminalState::Succeeded)
        );

        let running = WorkloadStatus::Batch {
            active: 1,
            succeeded: 0,
            failed: 0,
            failure_reason: None,
        };
        assert_eq!(running.terminal_state(), None);
    }

    #[test]
    fn test_job_without_status() {
        let job = Job {
            metadata: ObjectMeta {
                name: Some("eval-mmlu".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(WorkloadEvent::from(&job).status, None);
    }

    #[test]
    fn test_condition_precedence() {
        let status = conditions(&[("Created", "True"), ("Running", "True"), ("Succeeded", "True")]);
        assert_eq!(status.terminal_state(), Some(TerminalState::Succeeded));

        let status = conditions(&[("Running", "True"), ("Failed", "False")]);
        assert_eq!(status.terminal_state(), None);

        let status = conditions(&[("Succeeded", "False"), ("Failed", "True")]);
        assert!(matches!(
            status.terminal_state(),
            Some(TerminalState::Failed { .. })
        ));
    }

    #[test]
    fn test_failed_condition_reason() {
        let status = WorkloadStatus::Distributed {
            conditions: vec![JobCondition::new("Failed", "True").with_reason("PyTorchJobFailed")],
        };
        assert_eq!(
            status.terminal_state(),
            Some(TerminalState::Failed {
                reason: "PyTorchJobFailed".to_string()
            })
        );
    }

    #[test]
    fn test_not_started_messages() {
        assert!(is_not_started_message(
            "container \"pytorch\" in pod \"train-phase-1-master-0\" is waiting to start: PodInitializing"
        ));
        assert!(!is_not_started_message("pods \"x\" not found"));
    }
}
