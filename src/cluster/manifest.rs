//! Renders workload descriptors into typed Kubernetes objects.

use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    ConfigMapKeySelector, Container, EnvVar, EnvVarSource, PersistentVolumeClaimVolumeSource,
    PodSpec, PodTemplateSpec, ResourceRequirements, SecretKeySelector, Volume,
    VolumeMount as K8sVolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::Serialize;

use crate::error::ClusterError;
use crate::workload::{
    DistributedDescriptor, EnvBinding, ResourceRequests, Step, WorkloadDescriptor,
};

use super::crd::{PyTorchJob, PyTorchJobSpec, ReplicaSpec, MASTER_REPLICA, WORKER_REPLICA};

/// Label every pod of a workload carries, with the workload name as value.
pub const APP_LABEL: &str = "app";

const GPU_RESOURCE: &str = "nvidia.com/gpu";

fn app_labels(name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(APP_LABEL.to_string(), name.to_string())])
}

fn env_var(binding: &EnvBinding) -> EnvVar {
    match binding {
        EnvBinding::Value { name, value } => EnvVar {
            name: name.clone(),
            value: Some(value.clone()),
            ..Default::default()
        },
        EnvBinding::ConfigMapKey {
            name,
            config_map,
            key,
        } => EnvVar {
            name: name.clone(),
            value_from: Some(EnvVarSource {
                config_map_key_ref: Some(ConfigMapKeySelector {
                    name: config_map.clone(),
                    key: key.clone(),
                    optional: None,
                }),
                ..Default::default()
            }),
            ..Default::default()
        },
        EnvBinding::SecretKey { name, secret, key } => EnvVar {
            name: name.clone(),
            value_from: Some(EnvVarSource {
                secret_key_ref: Some(SecretKeySelector {
                    name: secret.clone(),
                    key: key.clone(),
                    optional: None,
                }),
                ..Default::default()
            }),
            ..Default::default()
        },
    }
}

fn resource_requirements(resources: &ResourceRequests) -> ResourceRequirements {
    let mut quantities = BTreeMap::new();
    if let Some(cpu) = &resources.cpu {
        quantities.insert("cpu".to_string(), Quantity(cpu.clone()));
    }
    if resources.gpus > 0 {
        quantities.insert(GPU_RESOURCE.to_string(), Quantity(resources.gpus.to_string()));
    }

    ResourceRequirements {
        limits: Some(quantities.clone()),
        requests: Some(quantities),
        ..Default::default()
    }
}

fn container(step: &Step) -> Container {
    let non_empty = |values: &[String]| (!values.is_empty()).then(|| values.to_vec());

    Container {
        name: step.name.clone(),
        image: Some(step.image.clone()),
        command: non_empty(&step.command),
        args: non_empty(&step.args),
        env: (!step.env.is_empty()).then(|| step.env.iter().map(env_var).collect()),
        volume_mounts: (!step.mounts.is_empty()).then(|| {
            step.mounts
                .iter()
                .map(|mount| K8sVolumeMount {
                    name: mount.role.volume_name().to_string(),
                    mount_path: mount.mount_path.clone(),
                    read_only: mount.read_only.then_some(true),
                    ..Default::default()
                })
                .collect()
        }),
        resources: step.resources.as_ref().map(resource_requirements),
        ..Default::default()
    }
}

fn pod_template(
    descriptor: &WorkloadDescriptor,
    annotations: Option<BTreeMap<String, String>>,
) -> PodTemplateSpec {
    let init_containers: Vec<Container> = descriptor.init_steps().iter().map(container).collect();
    let volumes = descriptor
        .volumes
        .iter()
        .map(|role| Volume {
            name: role.volume_name().to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: role.claim_name().to_string(),
                read_only: None,
            }),
            ..Default::default()
        })
        .collect::<Vec<_>>();

    PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(app_labels(&descriptor.name)),
            annotations,
            ..Default::default()
        }),
        spec: Some(PodSpec {
            init_containers: (!init_containers.is_empty()).then_some(init_containers),
            containers: vec![container(descriptor.output_step())],
            restart_policy: Some(descriptor.restart_policy.as_str().to_string()),
            volumes: (!volumes.is_empty()).then_some(volumes),
            ..Default::default()
        }),
    }
}

/// Renders a batch descriptor as a `batch/v1` Job that is never retried.
pub fn to_job(namespace: &str, descriptor: &WorkloadDescriptor) -> Job {
    Job {
        metadata: ObjectMeta {
            name: Some(descriptor.name.clone()),
            namespace: Some(namespace.to_string()),
            labels: Some(app_labels(&descriptor.name)),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(0),
            template: pod_template(descriptor, None),
            ..Default::default()
        }),
        status: None,
    }
}

/// Renders a distributed descriptor as a `PyTorchJob`.
///
/// The worker replica group is left out entirely for single-node runs.
pub fn to_pytorch_job(namespace: &str, descriptor: &DistributedDescriptor) -> PyTorchJob {
    let annotations = || {
        Some(BTreeMap::from([(
            "sidecar.istio.io/inject".to_string(),
            "false".to_string(),
        )]))
    };

    let mut replicas = BTreeMap::new();
    replicas.insert(
        MASTER_REPLICA.to_string(),
        ReplicaSpec {
            replicas: 1,
            restart_policy: descriptor.coordinator.restart_policy.as_str().to_string(),
            template: pod_template(&descriptor.coordinator, annotations()),
        },
    );

    let workers = descriptor.worker_replicas();
    if workers > 0 {
        replicas.insert(
            WORKER_REPLICA.to_string(),
            ReplicaSpec {
                replicas: i32::try_from(workers).unwrap_or(i32::MAX),
                restart_policy: descriptor.worker.restart_policy.as_str().to_string(),
                template: pod_template(&descriptor.worker, annotations()),
            },
        );
    }

    let mut job = PyTorchJob::new(
        &descriptor.name,
        PyTorchJobSpec {
            nproc_per_node: Some(descriptor.nproc_per_node.to_string()),
            pytorch_replica_specs: replicas,
        },
    );
    job.metadata.namespace = Some(namespace.to_string());
    job.metadata.labels = Some(app_labels(&descriptor.name));
    job
}

/// Serializes an object to YAML for debug logging.
pub fn to_yaml<T: Serialize>(object: &T) -> Result<String, ClusterError> {
    Ok(serde_yaml::to_string(object)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workload::{
        build_evaluation_workload, build_sdg_workload, build_training_workload, EvaluationKind,
        EvaluationSpec, SdgSpec, StageImages, TrainingPhase, TrainingSpec,
    };

    #[test]
    fn test_sdg_job_shape() {
        let spec = SdgSpec::new("https://example.com/taxonomy.git").with_branch("main");
        let descriptor = build_sdg_workload(&spec, &StageImages::default()).expect("sdg");
        let job = to_job("ilab", &descriptor);

        assert_eq!(job.metadata.name.as_deref(), Some("sdg"));
        assert_eq!(job.metadata.namespace.as_deref(), Some("ilab"));

        let spec = job.spec.expect("spec");
        assert_eq!(spec.backoff_limit, Some(0));

        let labels = spec.template.metadata.and_then(|m| m.labels).expect("labels");
        assert_eq!(labels.get(APP_LABEL).map(String::as_str), Some("sdg"));

        let pod = spec.template.spec.expect("pod spec");
        assert_eq!(pod.restart_policy.as_deref(), Some("Never"));
        assert_eq!(pod.init_containers.as_ref().map(Vec::len), Some(4));
        assert_eq!(pod.containers[0].name, "copy-model-to-output");

        let claims: Vec<_> = pod
            .volumes
            .expect("volumes")
            .into_iter()
            .filter_map(|v| v.persistent_volume_claim.map(|c| c.claim_name))
            .collect();
        assert_eq!(claims, vec!["sdg-data", "model", "output"]);
    }

    #[test]
    fn test_config_map_and_secret_env_rendering() {
        let spec = SdgSpec::new("https://example.com/taxonomy.git").with_pr(9);
        let descriptor = build_sdg_workload(&spec, &StageImages::default()).expect("sdg");
        let job = to_job("default", &descriptor);
        let pod = job.spec.and_then(|s| s.template.spec).expect("pod spec");

        let generate = pod
            .init_containers
            .expect("init containers")
            .into_iter()
            .find(|c| c.name == "generate-synthetic-data")
            .expect("generate container");
        let env = generate.env.expect("env");
        let endpoint = env
            .iter()
            .find(|e| e.name == "SDG_ENDPOINT")
            .and_then(|e| e.value_from.as_ref())
            .and_then(|v| v.config_map_key_ref.as_ref())
            .expect("config map ref");
        assert_eq!(endpoint.name, "kfp-model-server");
        assert_eq!(endpoint.key, "endpoint");

        let api_key = env
            .into_iter()
            .find(|e| e.name == "SDG_API_KEY")
            .expect("api key env");

        assert!(api_key.value.is_none());
        let secret = api_key
            .value_from
            .and_then(|v| v.secret_key_ref)
            .expect("secret ref");
        assert_eq!(secret.name, "kfp-model-server");
        assert_eq!(secret.key, "api_key");
    }

    #[test]
    fn test_eval_gpu_request() {
        let spec = EvaluationSpec::new(EvaluationKind::Mmlu, "/output/model/hf_format");
        let descriptor = build_evaluation_workload(&spec, &StageImages::default()).expect("eval");
        let pod = to_job("default", &descriptor)
            .spec
            .and_then(|s| s.template.spec)
            .expect("pod spec");

        let run = &pod.init_containers.expect("init")[0];
        let resources = run.resources.as_ref().expect("resources");
        let limits = resources.limits.as_ref().expect("limits");
        assert_eq!(limits.get(GPU_RESOURCE), Some(&Quantity("1".to_string())));
        assert_eq!(resources.requests, resources.limits);
    }

    #[test]
    fn test_pytorch_job_replicas() {
        let spec = TrainingSpec::new(TrainingPhase::First).with_nodes(3, 2);
        let descriptor = build_training_workload(&spec, &StageImages::default()).expect("train");
        let job = to_pytorch_job("ilab", &descriptor);

        assert_eq!(job.metadata.name.as_deref(), Some("train-phase-1"));
        assert_eq!(job.spec.nproc_per_node.as_deref(), Some("2"));

        let master = &job.spec.pytorch_replica_specs[MASTER_REPLICA];
        assert_eq!(master.replicas, 1);
        assert_eq!(master.restart_policy, "OnFailure");
        let annotations = master
            .template
            .metadata
            .as_ref()
            .and_then(|m| m.annotations.as_ref())
            .expect("annotations");
        assert_eq!(
            annotations.get("sidecar.istio.io/inject").map(String::as_str),
            Some("false")
        );

        let worker = &job.spec.pytorch_replica_specs[WORKER_REPLICA];
        assert_eq!(worker.replicas, 2);
        let container = &worker.template.spec.as_ref().expect("pod").containers[0];
        assert_eq!(container.name, "pytorch");
    }

    #[test]
    fn test_single_node_omits_worker_group() {
        let spec = TrainingSpec::new(TrainingPhase::First).with_nodes(1, 1);
        let descriptor = build_training_workload(&spec, &StageImages::default()).expect("train");
        let job = to_pytorch_job("ilab", &descriptor);

        assert!(job.spec.pytorch_replica_specs.contains_key(MASTER_REPLICA));
        assert!(!job.spec.pytorch_replica_specs.contains_key(WORKER_REPLICA));
    }

    #[test]
    fn test_yaml_rendering() {
        let spec = TrainingSpec::new(TrainingPhase::Second).with_nodes(2, 1);
        let descriptor = build_training_workload(&spec, &StageImages::default()).expect("train");
        let yaml = to_yaml(&to_pytorch_job("ilab", &descriptor)).expect("yaml");

        assert!(yaml.contains("kind: PyTorchJob"));
        assert!(yaml.contains("pytorchReplicaSpecs"));
        assert!(yaml.contains("train-phase-2"));
    }
}
