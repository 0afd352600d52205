//! Workload descriptors for each pipeline stage.
//!
//! Descriptors are plain in-memory values built by pure functions. They are
//! rendered into Kubernetes objects by [`crate::cluster::manifest`] and never
//! go through string templating.
//!
//! - [`sdg`]: taxonomy fetch, synthetic data generation, model import, preprocessing
//! - [`training`]: distributed PyTorchJob with a coordinator and worker replicas
//! - [`evaluation`]: MMLU or MT-Bench scoring of trained checkpoints

pub mod descriptor;
pub mod evaluation;
pub mod sdg;
pub mod training;

pub use descriptor::{
    DistributedDescriptor, EnvBinding, ResourceRequests, RestartPolicy, Step, VolumeMount,
    VolumeRole, Workload, WorkloadDescriptor, WorkloadKind,
};
pub use evaluation::{
    build_evaluation_workload, EvaluationKind, EvaluationSpec, MmluSettings, MtBenchSettings,
};
pub use sdg::{build_sdg_workload, SdgSpec, TaxonomyRef, TaxonomySource};
pub use training::{build_training_workload, TrainingPhase, TrainingSpec};

/// Name of the ConfigMap and Secret holding the SDG serving endpoint.
pub const SDG_SERVING_CONFIG: &str = "kfp-model-server";

/// Name of the ConfigMap and Secret holding the MT-Bench judge endpoint.
pub const JUDGE_SERVING_CONFIG: &str = "judge-server";

pub const DEFAULT_TOOLBOX_IMAGE: &str = "registry.access.redhat.com/ubi9/toolbox:latest";
pub const DEFAULT_PYTHON_IMAGE: &str = "registry.access.redhat.com/ubi9/python-311:latest";
pub const DEFAULT_SDG_IMAGE: &str = "quay.io/tcoufal/ilab-sdg:latest";
pub const DEFAULT_TRAINING_IMAGE: &str = "quay.io/michaelclifford/test-train:latest";
pub const DEFAULT_EVAL_IMAGE: &str = "quay.io/sallyom/instructlab-ocp:eval";

/// Container images used by the pipeline stages.
///
/// The images are opaque collaborators: the driver only cares that each one
/// provides the command it is asked to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageImages {
    /// Image with git and a POSIX shell.
    pub toolbox: String,
    /// Python image used for model import.
    pub python: String,
    /// Image running synthetic data generation.
    pub sdg: String,
    /// Image running data preprocessing and training.
    pub training: String,
    /// Image running evaluation.
    pub eval: String,
}

impl Default for StageImages {
    fn default() -> Self {
        Self {
            toolbox: DEFAULT_TOOLBOX_IMAGE.to_string(),
            python: DEFAULT_PYTHON_IMAGE.to_string(),
            sdg: DEFAULT_SDG_IMAGE.to_string(),
            training: DEFAULT_TRAINING_IMAGE.to_string(),
            eval: DEFAULT_EVAL_IMAGE.to_string(),
        }
    }
}
