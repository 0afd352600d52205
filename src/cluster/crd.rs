//! Kubeflow `PyTorchJob` custom resource (`kubeflow.org/v1`).
//!
//! Only the fields the driver writes or reads are modelled.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::PodTemplateSpec;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Replica group key of the coordinator.
pub const MASTER_REPLICA: &str = "Master";

/// Replica group key of the workers.
pub const WORKER_REPLICA: &str = "Worker";

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
    group = "kubeflow.org",
    version = "v1",
    kind = "PyTorchJob",
    plural = "pytorchjobs",
    namespaced,
    status = "PyTorchJobStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct PyTorchJobSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nproc_per_node: Option<String>,
    pub pytorch_replica_specs: BTreeMap<String, ReplicaSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaSpec {
    pub replicas: i32,
    pub restart_policy: String,
    pub template: PodTemplateSpec,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PyTorchJobStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<JobCondition>>,
}

/// A status condition such as `Created`, `Running`, `Succeeded` or `Failed`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct JobCondition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl JobCondition {
    pub fn new(type_: impl Into<String>, status: impl Into<String>) -> Self {
        Self {
            type_: type_.into(),
            status: status.into(),
            reason: None,
            message: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::Resource;

    #[test]
    fn test_resource_identity() {
        assert_eq!(PyTorchJob::group(&()), "kubeflow.org");
        assert_eq!(PyTorchJob::version(&()), "v1");
        assert_eq!(PyTorchJob::plural(&()), "pytorchjobs");
        assert_eq!(PyTorchJob::kind(&()), "PyTorchJob");
    }

    #[test]
    fn test_status_deserializes_condition_type() {
        let status: PyTorchJobStatus = serde_json::from_value(serde_json::json!({
            "conditions": [
                {"type": "Created", "status": "True"},
                {"type": "Failed", "status": "True", "reason": "PyTorchJobFailed"}
            ]
        }))
        .expect("status");

        let conditions = status.conditions.expect("conditions");
        assert_eq!(conditions[1].type_, "Failed");
        assert_eq!(conditions[1].reason.as_deref(), Some("PyTorchJobFailed"));
    }
}
