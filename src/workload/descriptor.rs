//! Core descriptor types shared by all pipeline stages.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::DescriptorError;

/// Kind of cluster object a workload is submitted as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkloadKind {
    /// A plain `batch/v1` Job.
    BatchJob,
    /// A Kubeflow `PyTorchJob`.
    PyTorchJob,
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkloadKind::BatchJob => write!(f, "Job"),
            WorkloadKind::PyTorchJob => write!(f, "PyTorchJob"),
        }
    }
}

/// Role of a persistent volume in the pipeline.
///
/// Every role is backed by exactly one claim with a fixed name, so the same
/// claim is reused across stages and across re-invocations of the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VolumeRole {
    /// Taxonomy checkout, generated data and preprocessed data.
    InputData,
    /// Base model weights.
    Model,
    /// Training checkpoints and evaluation results.
    Output,
}

impl VolumeRole {
    /// All roles, in provisioning order.
    pub const ALL: [VolumeRole; 3] = [VolumeRole::InputData, VolumeRole::Model, VolumeRole::Output];

    /// Name of the claim backing this role.
    pub fn claim_name(self) -> &'static str {
        match self {
            VolumeRole::InputData => "sdg-data",
            VolumeRole::Model => "model",
            VolumeRole::Output => "output",
        }
    }

    /// Name of the volume inside pod specs.
    pub fn volume_name(self) -> &'static str {
        match self {
            VolumeRole::InputData => "input-data",
            VolumeRole::Model => "model",
            VolumeRole::Output => "output",
        }
    }

    /// Requested size of the claim.
    pub fn default_size(self) -> &'static str {
        match self {
            VolumeRole::InputData => "10Gi",
            VolumeRole::Model | VolumeRole::Output => "100Gi",
        }
    }
}

/// A volume mounted into a step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeMount {
    pub role: VolumeRole,
    pub mount_path: String,
    pub read_only: bool,
}

impl VolumeMount {
    /// Mounts a volume with write access.
    pub fn read_write(role: VolumeRole, mount_path: impl Into<String>) -> Self {
        Self {
            role,
            mount_path: mount_path.into(),
            read_only: false,
        }
    }

    /// Mounts a volume read-only.
    pub fn read_only(role: VolumeRole, mount_path: impl Into<String>) -> Self {
        Self {
            role,
            mount_path: mount_path.into(),
            read_only: true,
        }
    }
}

/// An environment variable bound into a step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvBinding {
    /// Literal value.
    Value { name: String, value: String },
    /// Value read from a ConfigMap key at pod start.
    ConfigMapKey {
        name: String,
        config_map: String,
        key: String,
    },
    /// Value read from a Secret key at pod start.
    SecretKey {
        name: String,
        secret: String,
        key: String,
    },
}

impl EnvBinding {
    pub fn value(name: impl Into<String>, value: impl Into<String>) -> Self {
        EnvBinding::Value {
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn config_map_key(
        name: impl Into<String>,
        config_map: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        EnvBinding::ConfigMapKey {
            name: name.into(),
            config_map: config_map.into(),
            key: key.into(),
        }
    }

    pub fn secret_key(
        name: impl Into<String>,
        secret: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        EnvBinding::SecretKey {
            name: name.into(),
            secret: secret.into(),
            key: key.into(),
        }
    }

    /// Name of the environment variable.
    pub fn name(&self) -> &str {
        match self {
            EnvBinding::Value { name, .. }
            | EnvBinding::ConfigMapKey { name, .. }
            | EnvBinding::SecretKey { name, .. } => name,
        }
    }
}

/// Compute resources for a step. Requests and limits are always equal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceRequests {
    /// CPU quantity (e.g. "2").
    pub cpu: Option<String>,
    /// Number of `nvidia.com/gpu` devices.
    pub gpus: u32,
}

impl ResourceRequests {
    /// Requests the given number of GPUs and nothing else.
    pub fn gpus(gpus: u32) -> Self {
        Self {
            gpus,
            ..Default::default()
        }
    }

    pub fn with_cpu(mut self, cpu: impl Into<String>) -> Self {
        self.cpu = Some(cpu.into());
        self
    }
}

/// One container run as part of a workload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    /// Container name, unique within the workload.
    pub name: String,
    /// Image reference.
    pub image: String,
    /// Entrypoint override.
    pub command: Vec<String>,
    /// Arguments passed to the command.
    pub args: Vec<String>,
    /// Environment bindings.
    pub env: Vec<EnvBinding>,
    /// Volumes the step needs.
    pub mounts: Vec<VolumeMount>,
    /// Compute resources, if any are required.
    pub resources: Option<ResourceRequests>,
}

impl Step {
    /// Creates a step with no command, arguments, environment or mounts.
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            command: Vec::new(),
            args: Vec::new(),
            env: Vec::new(),
            mounts: Vec::new(),
            resources: None,
        }
    }

    pub fn with_command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = command.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Adds one environment binding.
    pub fn with_env(mut self, binding: EnvBinding) -> Self {
        self.env.push(binding);
        self
    }

    /// Adds one volume mount.
    pub fn with_mount(mut self, mount: VolumeMount) -> Self {
        self.mounts.push(mount);
        self
    }

    pub fn with_resources(mut self, resources: ResourceRequests) -> Self {
        self.resources = Some(resources);
        self
    }

    /// Returns the literal value bound to `name`, if any.
    pub fn env_value(&self, name: &str) -> Option<&str> {
        self.env.iter().find_map(|binding| match binding {
            EnvBinding::Value { name: n, value } if n == name => Some(value.as_str()),
            _ => None,
        })
    }

    /// Returns true if any binding (literal or referenced) sets `name`.
    pub fn binds_env(&self, name: &str) -> bool {
        self.env.iter().any(|binding| binding.name() == name)
    }
}

/// Pod restart policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartPolicy {
    Never,
    OnFailure,
}

impl RestartPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            RestartPolicy::Never => "Never",
            RestartPolicy::OnFailure => "OnFailure",
        }
    }
}

/// A unit of work: steps run in order on one pod.
///
/// All steps but the last run as init containers; the last one is the main
/// container and the one whose logs are returned on success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadDescriptor {
    /// Object name, unique in the namespace for the lifetime of a run.
    pub name: String,
    /// Ordered steps.
    pub steps: Vec<Step>,
    /// Restart policy of the pod.
    pub restart_policy: RestartPolicy,
    /// Volumes required by any step.
    pub volumes: BTreeSet<VolumeRole>,
}

impl WorkloadDescriptor {
    /// Creates a descriptor, deriving the volume set from the step mounts.
    ///
    /// # Errors
    ///
    /// Returns `DescriptorError::EmptyWorkload` if `steps` is empty.
    pub fn new(
        name: impl Into<String>,
        steps: Vec<Step>,
        restart_policy: RestartPolicy,
    ) -> Result<Self, DescriptorError> {
        let name = name.into();
        if steps.is_empty() {
            return Err(DescriptorError::EmptyWorkload(name));
        }

        let volumes = steps
            .iter()
            .flat_map(|step| step.mounts.iter().map(|mount| mount.role))
            .collect();

        Ok(Self {
            name,
            steps,
            restart_policy,
            volumes,
        })
    }

    /// Steps run before the main container.
    pub fn init_steps(&self) -> &[Step] {
        &self.steps[..self.steps.len() - 1]
    }

    /// The main container.
    pub fn output_step(&self) -> &Step {
        &self.steps[self.steps.len() - 1]
    }

    /// Looks up a step by container name.
    pub fn step(&self, name: &str) -> Option<&Step> {
        self.steps.iter().find(|step| step.name == name)
    }
}

/// A distributed training workload with one coordinator and `nnodes - 1` workers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistributedDescriptor {
    pub name: String,
    pub nnodes: u32,
    pub nproc_per_node: u32,
    /// Pod template of the coordinator replica.
    pub coordinator: WorkloadDescriptor,
    /// Pod template shared by all worker replicas.
    pub worker: WorkloadDescriptor,
}

impl DistributedDescriptor {
    pub fn worker_replicas(&self) -> u32 {
        self.nnodes.saturating_sub(1)
    }
}

/// A descriptor ready for submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Workload {
    Batch(WorkloadDescriptor),
    Distributed(DistributedDescriptor),
}

impl Workload {
    pub fn name(&self) -> &str {
        match self {
            Workload::Batch(descriptor) => &descriptor.name,
            Workload::Distributed(descriptor) => &descriptor.name,
        }
    }

    pub fn kind(&self) -> WorkloadKind {
        match self {
            Workload::Batch(_) => WorkloadKind::BatchJob,
            Workload::Distributed(_) => WorkloadKind::PyTorchJob,
        }
    }

    /// Container whose logs are the workload's output.
    pub fn output_container(&self) -> &str {
        match self {
            Workload::Batch(descriptor) => &descriptor.output_step().name,
            Workload::Distributed(descriptor) => &descriptor.coordinator.output_step().name,
        }
    }

    /// Label selector matching every pod of the workload.
    pub fn pod_selector(&self) -> String {
        format!("app={}", self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(name: &str, role: VolumeRole) -> Step {
        Step::new(name, "busybox").with_mount(VolumeMount::read_write(role, "/mnt"))
    }

    #[test]
    fn test_volumes_derived_from_mounts() {
        let descriptor = WorkloadDescriptor::new(
            "demo",
            vec![
                step("a", VolumeRole::InputData),
                step("b", VolumeRole::Output),
                step("c", VolumeRole::InputData),
            ],
            RestartPolicy::Never,
        )
        .expect("descriptor");

        let volumes: Vec<_> = descriptor.volumes.iter().copied().collect();
        assert_eq!(volumes, vec![VolumeRole::InputData, VolumeRole::Output]);
        assert_eq!(descriptor.init_steps().len(), 2);
        assert_eq!(descriptor.output_step().name, "c");
    }

    #[test]
    fn test_empty_workload_rejected() {
        let result = WorkloadDescriptor::new("empty", Vec::new(), RestartPolicy::Never);
        assert!(matches!(result, Err(DescriptorError::EmptyWorkload(name)) if name == "empty"));
    }

    #[test]
    fn test_claim_names_fixed_per_role() {
        assert_eq!(VolumeRole::InputData.claim_name(), "sdg-data");
        assert_eq!(VolumeRole::Model.claim_name(), "model");
        assert_eq!(VolumeRole::Output.claim_name(), "output");
    }

    #[test]
    fn test_env_lookup() {
        let step = Step::new("s", "img")
            .with_env(EnvBinding::value("A", "1"))
            .with_env(EnvBinding::secret_key("B", "secret", "key"));

        assert_eq!(step.env_value("A"), Some("1"));
        assert_eq!(step.env_value("B"), None);
        assert!(step.binds_env("B"));
        assert!(!step.binds_env("C"));
    }

    #[test]
    fn test_workload_kind_display() {
        assert_eq!(WorkloadKind::BatchJob.to_string(), "Job");
        assert_eq!(WorkloadKind::PyTorchJob.to_string(), "PyTorchJob");
    }
}
