//! Workload submission.

use tracing::{debug, info};

use crate::error::ClusterError;
use crate::workload::Workload;

use super::manifest::{to_job, to_pytorch_job, to_yaml};
use super::ClusterApi;

/// Outcome of an idempotent create.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    Created,
    /// An object with the same name was already present and was left untouched.
    AlreadyExists,
}

/// Folds the "already exists" response into success.
pub(crate) fn created_or_existing(
    result: Result<(), ClusterError>,
    namespace: &str,
    kind: &str,
    name: &str,
) -> Result<Submission, ClusterError> {
    match result {
        Ok(()) => {
            info!(namespace, kind, name, "Created");
            Ok(Submission::Created)
        }
        Err(e) if e.is_conflict() => {
            info!(namespace, kind, name, "Already exists, reusing");
            Ok(Submission::AlreadyExists)
        }
        Err(e) => Err(e),
    }
}

/// Submits a workload as a Job or PyTorchJob and returns without waiting.
///
/// # Errors
///
/// Any API error other than "already exists".
pub async fn submit(
    cluster: &dyn ClusterApi,
    namespace: &str,
    workload: &Workload,
) -> Result<Submission, ClusterError> {
    let kind = workload.kind().to_string();
    let result = match workload {
        Workload::Batch(descriptor) => {
            let job = to_job(namespace, descriptor);
            if let Ok(yaml) = to_yaml(&job) {
                debug!(workload = %descriptor.name, "Job manifest:\n{yaml}");
            }
            cluster.create_job(namespace, &job).await
        }
        Workload::Distributed(descriptor) => {
            let job = to_pytorch_job(namespace, descriptor);
            if let Ok(yaml) = to_yaml(&job) {
                debug!(workload = %descriptor.name, "PyTorchJob manifest:\n{yaml}");
            }
            cluster.create_pytorch_job(namespace, &job).await
        }
    };

    created_or_existing(result, namespace, &kind, workload.name())
}
