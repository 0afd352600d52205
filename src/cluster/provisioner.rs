//! Storage and configuration provisioning.
//!
//! Claims, ConfigMaps and Secrets are created once and reused. Existing
//! objects are never modified or deleted.

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::core::v1::{
    ConfigMap, PersistentVolumeClaim, PersistentVolumeClaimSpec, Secret,
    VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tracing::info;

use crate::error::ClusterError;
use crate::workload::{VolumeRole, JUDGE_SERVING_CONFIG, SDG_SERVING_CONFIG};

use super::submitter::{created_or_existing, Submission};
use super::ClusterApi;

/// Volume access mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// Mounted read-write by a single node.
    ReadWriteOnce,
    /// Mounted read-write by many nodes.
    ReadWriteMany,
}

impl AccessMode {
    pub fn as_str(self) -> &'static str {
        match self {
            AccessMode::ReadWriteOnce => "ReadWriteOnce",
            AccessMode::ReadWriteMany => "ReadWriteMany",
        }
    }
}

/// A persistent volume claim request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeClaim {
    pub name: String,
    pub namespace: String,
    pub access_mode: AccessMode,
    pub size: String,
    pub storage_class: String,
}

impl VolumeClaim {
    /// The claim backing `role`.
    ///
    /// All claims are shared: training replicas on different nodes read the
    /// same data and model volumes.
    pub fn for_role(role: VolumeRole, namespace: &str, storage_class: &str) -> Self {
        Self {
            name: role.claim_name().to_string(),
            namespace: namespace.to_string(),
            access_mode: AccessMode::ReadWriteMany,
            size: role.default_size().to_string(),
            storage_class: storage_class.to_string(),
        }
    }

    pub fn with_access_mode(mut self, mode: AccessMode) -> Self {
        self.access_mode = mode;
        self
    }

    pub fn to_resource(&self) -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: Some(vec![self.access_mode.as_str().to_string()]),
                resources: Some(VolumeResourceRequirements {
                    requests: Some(BTreeMap::from([(
                        "storage".to_string(),
                        Quantity(self.size.clone()),
                    )])),
                    ..Default::default()
                }),
                storage_class_name: Some(self.storage_class.clone()),
                ..Default::default()
            }),
            status: None,
        }
    }
}

/// An OpenAI-compatible serving endpoint.
#[derive(Clone, PartialEq, Eq)]
pub struct ServingEndpoint {
    pub endpoint: String,
    pub model: String,
    pub api_key: String,
}

impl ServingEndpoint {
    pub fn new(
        endpoint: impl Into<String>,
        model: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            model: model.into(),
            api_key: api_key.into(),
        }
    }

    fn config_map(&self, namespace: &str, name: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([
                ("endpoint".to_string(), self.endpoint.clone()),
                ("model".to_string(), self.model.clone()),
            ])),
            ..Default::default()
        }
    }

    fn secret(&self, namespace: &str, name: &str) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            string_data: Some(BTreeMap::from([(
                "api_key".to_string(),
                self.api_key.clone(),
            )])),
            type_: Some("Opaque".to_string()),
            ..Default::default()
        }
    }
}

impl fmt::Debug for ServingEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServingEndpoint")
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

/// Creates the input data, model and output claims.
///
/// # Errors
///
/// Aborts on the first error that is not "already exists".
pub async fn ensure_volume_claims(
    cluster: &dyn ClusterApi,
    namespace: &str,
    storage_class: &str,
) -> Result<Vec<Submission>, ClusterError> {
    let mut outcomes = Vec::with_capacity(VolumeRole::ALL.len());
    for role in VolumeRole::ALL {
        let claim = VolumeClaim::for_role(role, namespace, storage_class);
        info!(
            namespace,
            claim = %claim.name,
            size = %claim.size,
            storage_class,
            "Ensuring volume claim"
        );
        let result = cluster
            .create_persistent_volume_claim(namespace, &claim.to_resource())
            .await;
        outcomes.push(created_or_existing(
            result,
            namespace,
            "PersistentVolumeClaim",
            &claim.name,
        )?);
    }
    Ok(outcomes)
}

/// Creates a ConfigMap (`endpoint`, `model`) and a Secret (`api_key`), both named `name`.
pub async fn ensure_serving_config(
    cluster: &dyn ClusterApi,
    namespace: &str,
    name: &str,
    serving: &ServingEndpoint,
) -> Result<(), ClusterError> {
    let result = cluster
        .create_config_map(namespace, &serving.config_map(namespace, name))
        .await;
    created_or_existing(result, namespace, "ConfigMap", name)?;

    let result = cluster
        .create_secret(namespace, &serving.secret(namespace, name))
        .await;
    created_or_existing(result, namespace, "Secret", name)?;

    Ok(())
}

/// Provisions the SDG serving endpoint configuration.
pub async fn ensure_sdg_config(
    cluster: &dyn ClusterApi,
    namespace: &str,
    serving: &ServingEndpoint,
) -> Result<(), ClusterError> {
    ensure_serving_config(cluster, namespace, SDG_SERVING_CONFIG, serving).await
}

/// Provisions the MT-Bench judge configuration.
pub async fn ensure_judge_config(
    cluster: &dyn ClusterApi,
    namespace: &str,
    judge: &ServingEndpoint,
) -> Result<(), ClusterError> {
    ensure_serving_config(cluster, namespace, JUDGE_SERVING_CONFIG, judge).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_resource() {
        let claim = VolumeClaim::for_role(VolumeRole::InputData, "ilab", "nfs-csi");
        let pvc = claim.to_resource();

        assert_eq!(pvc.metadata.name.as_deref(), Some("sdg-data"));
        let spec = pvc.spec.expect("spec");
        assert_eq!(spec.storage_class_name.as_deref(), Some("nfs-csi"));
        assert_eq!(spec.access_modes, Some(vec!["ReadWriteMany".to_string()]));
        let storage = spec
            .resources
            .and_then(|r| r.requests)
            .and_then(|r| r.get("storage").cloned());
        assert_eq!(storage, Some(Quantity("10Gi".to_string())));
    }

    #[test]
    fn test_access_mode_override() {
        let claim = VolumeClaim::for_role(VolumeRole::Model, "ilab", "standard")
            .with_access_mode(AccessMode::ReadWriteOnce);
        assert_eq!(claim.size, "100Gi");
        assert_eq!(
            claim.to_resource().spec.and_then(|s| s.access_modes),
            Some(vec!["ReadWriteOnce".to_string()])
        );
    }

    #[test]
    fn test_serving_objects() {
        let serving = ServingEndpoint::new("http://vllm:8000/v1", "mistral", "s3cr3t");
        let config_map = serving.config_map("ilab", SDG_SERVING_CONFIG);
        let data = config_map.data.expect("data");
        assert_eq!(data.get("endpoint").map(String::as_str), Some("http://vllm:8000/v1"));
        assert!(!data.values().any(|v| v == "s3cr3t"));

        let secret = serving.secret("ilab", SDG_SERVING_CONFIG);
        assert_eq!(
            secret.string_data.and_then(|d| d.get("api_key").cloned()),
            Some("s3cr3t".to_string())
        );
    }

    #[test]
    fn test_debug_redacts_api_key() {
        let serving = ServingEndpoint::new("http://judge", "prometheus", "top-secret");
        assert!(!format!("{serving:?}").contains("top-secret"));
    }
}
