//! [`ClusterApi`] implementation backed by the `kube` client.

use std::fmt::Debug;

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Pod, Secret};
use kube::api::{Api, ListParams, LogParams, PostParams};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::ClusterError;
use crate::workload::WorkloadKind;

use super::crd::PyTorchJob;
use super::{is_not_started_message, ClusterApi, PodSummary, WorkloadEvent, WorkloadEventStream};

/// Kubernetes cluster client.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    /// Connects using the in-cluster service account or the local kubeconfig.
    ///
    /// # Errors
    ///
    /// Returns `ClusterError::Connection` if no usable configuration is found.
    pub async fn connect() -> Result<Self, ClusterError> {
        let client = Client::try_default()
            .await
            .map_err(|e| ClusterError::Connection(e.to_string()))?;
        Ok(Self { client })
    }

    async fn create<K>(&self, namespace: &str, kind: &str, object: &K) -> Result<(), ClusterError>
    where
        K: Resource<Scope = kube::core::NamespaceResourceScope>
            + Clone
            + Debug
            + Serialize
            + DeserializeOwned,
        <K as Resource>::DynamicType: Default,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        let name = object.name_any();

        api.create(&PostParams::default(), object)
            .await
            .map(|_| ())
            .map_err(|e| classify_error(kind, &name, e))
    }
}

/// Maps a `kube` error onto the driver's error classes.
fn classify_error(kind: &str, name: &str, err: kube::Error) -> ClusterError {
    match err {
        kube::Error::Api(response) if response.code == 409 => ClusterError::AlreadyExists {
            kind: kind.to_string(),
            name: name.to_string(),
        },
        kube::Error::Api(response) => ClusterError::Api {
            kind: kind.to_string(),
            name: name.to_string(),
            code: response.code,
            message: response.message,
        },
        other => ClusterError::Request(other.to_string()),
    }
}

fn event_stream<K, F>(api: Api<K>, convert: F) -> WorkloadEventStream
where
    K: Resource + Clone + Debug + DeserializeOwned + Send + 'static,
    F: Fn(&K) -> WorkloadEvent + Send + 'static,
{
    watcher(api, watcher::Config::default())
        .default_backoff()
        .map_err(|e| ClusterError::Watch(e.to_string()))
        .try_filter_map(move |event| {
            let observed = match event {
                watcher::Event::Apply(object) | watcher::Event::InitApply(object) => {
                    Some(convert(&object))
                }
                watcher::Event::Delete(_) | watcher::Event::Init | watcher::Event::InitDone => None,
            };
            futures::future::ready(Ok(observed))
        })
        .boxed()
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn create_persistent_volume_claim(
        &self,
        namespace: &str,
        claim: &PersistentVolumeClaim,
    ) -> Result<(), ClusterError> {
        self.create(namespace, "PersistentVolumeClaim", claim).await
    }

    async fn create_config_map(
        &self,
        namespace: &str,
        config_map: &ConfigMap,
    ) -> Result<(), ClusterError> {
        self.create(namespace, "ConfigMap", config_map).await
    }

    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<(), ClusterError> {
        self.create(namespace, "Secret", secret).await
    }

    async fn create_job(&self, namespace: &str, job: &Job) -> Result<(), ClusterError> {
        self.create(namespace, "Job", job).await
    }

    async fn create_pytorch_job(
        &self,
        namespace: &str,
        job: &PyTorchJob,
    ) -> Result<(), ClusterError> {
        self.create(namespace, "PyTorchJob", job).await
    }

    async fn watch_workloads(
        &self,
        namespace: &str,
        kind: WorkloadKind,
    ) -> Result<WorkloadEventStream, ClusterError> {
        let stream = match kind {
            WorkloadKind::BatchJob => {
                let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
                event_stream(api, |job: &Job| WorkloadEvent::from(job))
            }
            WorkloadKind::PyTorchJob => {
                let api: Api<PyTorchJob> = Api::namespaced(self.client.clone(), namespace);
                event_stream(api, |job: &PyTorchJob| WorkloadEvent::from(job))
            }
        };
        Ok(stream)
    }

    async fn list_pods(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<PodSummary>, ClusterError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pods = api
            .list(&ListParams::default().labels(label_selector))
            .await
            .map_err(|e| classify_error("Pod", label_selector, e))?;

        Ok(pods.items.iter().map(PodSummary::from).collect())
    }

    async fn container_logs(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
    ) -> Result<String, ClusterError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = LogParams {
            container: Some(container.to_string()),
            ..Default::default()
        };

        api.logs(pod, &params)
            .await
            .map_err(|e| classify_log_error(pod, container, e))
    }
}

/// Maps a log read failure, recognising containers that have not started.
fn classify_log_error(pod: &str, container: &str, err: kube::Error) -> ClusterError {
    match err {
        kube::Error::Api(response)
            if response.code == 400 && is_not_started_message(&response.message) =>
        {
            ClusterError::ContainerNotStarted {
                pod: pod.to_string(),
                container: container.to_string(),
            }
        }
        other => classify_error("Pod", pod, other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_error(code: u16, message: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: message.to_string(),
            reason: String::new(),
            code,
        })
    }

    #[test]
    fn test_conflict_maps_to_already_exists() {
        let err = classify_error("Job", "sdg", api_error(409, "jobs.batch \"sdg\" already exists"));
        assert!(err.is_conflict());
    }

    #[test]
    fn test_waiting_container_maps_to_not_started() {
        let err = classify_log_error(
            "sdg-abc12",
            "generate-synthetic-data",
            api_error(
                400,
                "container \"generate-synthetic-data\" in pod \"sdg-abc12\" is waiting to start: PodInitializing",
            ),
        );
        assert!(err.is_not_started());
        match err {
            ClusterError::ContainerNotStarted { pod, container } => {
                assert_eq!(pod, "sdg-abc12");
                assert_eq!(container, "generate-synthetic-data");
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let err = classify_log_error("sdg-abc12", "sdg", api_error(400, "bad request"));
        assert!(!err.is_not_started());
        assert!(matches!(err, ClusterError::Api { code: 400, .. }));
    }

    #[test]
    fn test_other_codes_preserved() {
        let err = classify_error("Secret", "kfp-model-server", api_error(403, "forbidden"));
        match err {
            ClusterError::Api { code, kind, .. } => {
                assert_eq!(code, 403);
                assert_eq!(kind, "Secret");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
