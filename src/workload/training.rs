//! Distributed training workload.
//!
//! Training runs as a PyTorchJob: one coordinator ("Master") and `nnodes - 1`
//! workers, each with `nproc_per_node` processes and as many GPUs. Only the
//! coordinator writes checkpoints to the output volume; workers write theirs
//! to scratch space.

use std::fmt;
use std::str::FromStr;

use crate::error::DescriptorError;

use super::descriptor::{
    DistributedDescriptor, EnvBinding, ResourceRequests, RestartPolicy, Step, VolumeMount,
    VolumeRole, WorkloadDescriptor,
};
use super::StageImages;

/// Path of the base model inside the training pods.
pub const DEFAULT_MODEL_PATH: &str = "/input_model/model";

/// Preprocessed data produced by SDG, as seen from the training pods.
pub const TRAINING_DATA_PATH: &str = "/input_data/processed_data/data.jsonl";

const INPUT_DATA_MOUNT: &str = "/input_data";
const INPUT_MODEL_MOUNT: &str = "/input_model";
const OUTPUT_MOUNT: &str = "/output";

const TRAIN_SCRIPT: &str = r#"set -e
mkdir -p "$CKPT_OUTPUT_DIR" "$DATA_OUTPUT_DIR"
echo "Running on $NNODES nodes with $NPROC_PER_NODE processes per node"
python3.11 -u run.py \
  --nnodes "$NNODES" \
  --nproc_per_node "$NPROC_PER_NODE" \
  --model_path "$MODEL_PATH" \
  --data_path "$DATA_PATH" \
  --ckpt_output_dir "$CKPT_OUTPUT_DIR" \
  --data_output_dir "$DATA_OUTPUT_DIR"
"#;

/// Training phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TrainingPhase {
    /// Knowledge training from the base model.
    #[default]
    First,
    /// Skills training from the best phase-1 checkpoint.
    Second,
}

impl TrainingPhase {
    /// PyTorchJob name for this phase.
    pub fn workload_name(self) -> &'static str {
        match self {
            TrainingPhase::First => "train-phase-1",
            TrainingPhase::Second => "train-phase-2",
        }
    }

    /// Directory the coordinator writes checkpoints into.
    pub fn checkpoint_dir(self) -> &'static str {
        match self {
            TrainingPhase::First => "/output/model",
            TrainingPhase::Second => "/output/phase_2/model",
        }
    }

    /// Directory the coordinator writes processed training data into.
    pub fn data_output_dir(self) -> &'static str {
        match self {
            TrainingPhase::First => "/output/data",
            TrainingPhase::Second => "/output/phase_2/data",
        }
    }

    /// Folder holding one Hugging Face checkpoint per saved sample count.
    pub fn models_folder(self) -> String {
        format!("{}/hf_format", self.checkpoint_dir())
    }

    pub fn number(self) -> u8 {
        match self {
            TrainingPhase::First => 1,
            TrainingPhase::Second => 2,
        }
    }
}

impl fmt::Display for TrainingPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "phase {}", self.number())
    }
}

impl FromStr for TrainingPhase {
    type Err = DescriptorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "1" | "first" => Ok(TrainingPhase::First),
            "2" | "second" => Ok(TrainingPhase::Second),
            other => Err(DescriptorError::InvalidValue {
                key: "training-phase".to_string(),
                message: format!("expected 1 or 2, got '{other}'"),
            }),
        }
    }
}

/// Inputs of a training stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrainingSpec {
    pub phase: TrainingPhase,
    /// Model to start from, as a path inside the training pods.
    pub model_path: String,
    pub nnodes: u32,
    pub nproc_per_node: u32,
}

impl TrainingSpec {
    pub fn new(phase: TrainingPhase) -> Self {
        Self {
            phase,
            model_path: DEFAULT_MODEL_PATH.to_string(),
            nnodes: 2,
            nproc_per_node: 1,
        }
    }

    pub fn with_model_path(mut self, path: impl Into<String>) -> Self {
        self.model_path = path.into();
        self
    }

    pub fn with_nodes(mut self, nnodes: u32, nproc_per_node: u32) -> Self {
        self.nnodes = nnodes;
        self.nproc_per_node = nproc_per_node;
        self
    }
}

fn replica_step(
    spec: &TrainingSpec,
    image: &str,
    checkpoint_dir: &str,
    data_output_dir: &str,
    output: VolumeMount,
) -> Step {
    Step::new("pytorch", image)
        .with_command(["/bin/bash", "-c", "--"])
        .with_args([TRAIN_SCRIPT])
        .with_env(EnvBinding::value("NNODES", spec.nnodes.to_string()))
        .with_env(EnvBinding::value(
            "NPROC_PER_NODE",
            spec.nproc_per_node.to_string(),
        ))
        .with_env(EnvBinding::value("MODEL_PATH", spec.model_path.clone()))
        .with_env(EnvBinding::value("DATA_PATH", TRAINING_DATA_PATH))
        .with_env(EnvBinding::value("CKPT_OUTPUT_DIR", checkpoint_dir))
        .with_env(EnvBinding::value("DATA_OUTPUT_DIR", data_output_dir))
        .with_mount(VolumeMount::read_only(VolumeRole::InputData, INPUT_DATA_MOUNT))
        .with_mount(VolumeMount::read_only(VolumeRole::Model, INPUT_MODEL_MOUNT))
        .with_mount(output)
        .with_resources(ResourceRequests::gpus(spec.nproc_per_node).with_cpu("2"))
}

/// Builds the PyTorchJob descriptor for one training phase.
///
/// # Errors
///
/// Returns an error if `nnodes` or `nproc_per_node` is zero.
pub fn build_training_workload(
    spec: &TrainingSpec,
    images: &StageImages,
) -> Result<DistributedDescriptor, DescriptorError> {
    if spec.nnodes == 0 {
        return Err(DescriptorError::InvalidNodeCount(spec.nnodes));
    }
    if spec.nproc_per_node == 0 {
        return Err(DescriptorError::InvalidProcessCount(spec.nproc_per_node));
    }

    let name = spec.phase.workload_name();

    let coordinator = WorkloadDescriptor::new(
        name,
        vec![replica_step(
            spec,
            &images.training,
            spec.phase.checkpoint_dir(),
            spec.phase.data_output_dir(),
            VolumeMount::read_write(VolumeRole::Output, OUTPUT_MOUNT),
        )],
        RestartPolicy::OnFailure,
    )?;

    // Workers still read the output volume: phase 2 starts from a checkpoint stored there.
    let worker = WorkloadDescriptor::new(
        name,
        vec![replica_step(
            spec,
            &images.training,
            "/tmp/model",
            "/tmp/data",
            VolumeMount::read_only(VolumeRole::Output, OUTPUT_MOUNT),
        )],
        RestartPolicy::OnFailure,
    )?;

    Ok(DistributedDescriptor {
        name: name.to_string(),
        nnodes: spec.nnodes,
        nproc_per_node: spec.nproc_per_node,
        coordinator,
        worker,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_parsing() {
        assert_eq!("1".parse::<TrainingPhase>().unwrap(), TrainingPhase::First);
        assert_eq!("second".parse::<TrainingPhase>().unwrap(), TrainingPhase::Second);
        assert!(matches!(
            "3".parse::<TrainingPhase>(),
            Err(DescriptorError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_phase_paths() {
        assert_eq!(TrainingPhase::First.models_folder(), "/output/model/hf_format");
        assert_eq!(
            TrainingPhase::Second.models_folder(),
            "/output/phase_2/model/hf_format"
        );
        assert_eq!(TrainingPhase::Second.workload_name(), "train-phase-2");
    }

    #[test]
    fn test_replica_layout() {
        let spec = TrainingSpec::new(TrainingPhase::First).with_nodes(3, 4);
        let job = build_training_workload(&spec, &StageImages::default()).expect("job");

        assert_eq!(job.name, "train-phase-1");
        assert_eq!(job.worker_replicas(), 2);

        let master = job.coordinator.output_step();
        assert_eq!(master.env_value("NNODES"), Some("3"));
        assert_eq!(master.env_value("NPROC_PER_NODE"), Some("4"));
        assert_eq!(master.env_value("MODEL_PATH"), Some(DEFAULT_MODEL_PATH));
        assert_eq!(master.env_value("CKPT_OUTPUT_DIR"), Some("/output/model"));
        assert_eq!(master.resources.as_ref().map(|r| r.gpus), Some(4));
        assert_eq!(job.coordinator.restart_policy, RestartPolicy::OnFailure);

        let worker = job.worker.output_step();
        assert_eq!(worker.env_value("CKPT_OUTPUT_DIR"), Some("/tmp/model"));
        let output = worker
            .mounts
            .iter()
            .find(|m| m.role == VolumeRole::Output)
            .expect("output mount");
        assert!(output.read_only);
    }

    #[test]
    fn test_single_node_has_no_workers() {
        let spec = TrainingSpec::new(TrainingPhase::First).with_nodes(1, 1);
        let job = build_training_workload(&spec, &StageImages::default()).expect("job");
        assert_eq!(job.worker_replicas(), 0);
    }

    #[test]
    fn test_second_phase_model_path() {
        let spec = TrainingSpec::new(TrainingPhase::Second)
            .with_model_path("/output/model/hf_format/samples_128");
        let job = build_training_workload(&spec, &StageImages::default()).expect("job");

        let master = job.coordinator.output_step();
        assert_eq!(
            master.env_value("MODEL_PATH"),
            Some("/output/model/hf_format/samples_128")
        );
        assert_eq!(master.env_value("CKPT_OUTPUT_DIR"), Some("/output/phase_2/model"));
    }

    #[test]
    fn test_zero_counts_rejected() {
        let spec = TrainingSpec::new(TrainingPhase::First).with_nodes(0, 1);
        assert!(matches!(
            build_training_workload(&spec, &StageImages::default()),
            Err(DescriptorError::InvalidNodeCount(0))
        ));

        let spec = TrainingSpec::new(TrainingPhase::First).with_nodes(1, 0);
        assert!(matches!(
            build_training_workload(&spec, &StageImages::default()),
            Err(DescriptorError::InvalidProcessCount(0))
        ));
    }
}
