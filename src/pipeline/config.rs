//! Pipeline configuration.
//!
//! `PipelineConfig` holds every input that stays fixed for a run: where to
//! run, which taxonomy to train on, which serving endpoints to use and how
//! to size training. Per-run mutable state lives in
//! [`RunContext`](super::context::RunContext).

use std::time::Duration;

use thiserror::Error;

use crate::cluster::ServingEndpoint;
use crate::workload::sdg::{DEFAULT_BASE_MODEL, DEFAULT_REPO_URL};
use crate::workload::{EvaluationKind, MmluSettings, MtBenchSettings, StageImages, TrainingPhase};

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A parameter required by the requested stage was not supplied.
    #[error("Missing required parameter: {0}")]
    MissingParameter(String),

    /// Two parameters that exclude each other were both supplied.
    #[error("Conflicting parameters: {0}")]
    ConflictingParameters(String),

    /// A parameter has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Configuration for the pipeline orchestrator.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    // Cluster settings
    /// Namespace every object is created in.
    pub namespace: String,
    /// Storage class of the persistent volume claims.
    pub storage_class: String,
    /// Maximum time to wait for a single workload. `None` waits forever.
    pub watch_timeout: Option<Duration>,
    /// Container images of the stages.
    pub images: StageImages,

    // SDG settings
    /// Taxonomy git repository.
    pub taxonomy_repo_url: String,
    /// Taxonomy branch. Exclusive with `taxonomy_repo_pr`.
    pub taxonomy_repo_branch: Option<String>,
    /// Taxonomy pull request number. `0` means unset.
    pub taxonomy_repo_pr: Option<u32>,
    /// Hugging Face repository of the base model.
    pub base_model: String,
    pub num_instructions_to_generate: u32,
    /// Serving endpoint the generator queries.
    pub sdg_serving: Option<ServingEndpoint>,

    // Training settings
    pub nproc_per_node: u32,
    pub nnodes: u32,
    /// Phase run by the single-stage `train` command.
    pub training_phase: TrainingPhase,
    /// Explicit model path, overriding the selected or default model.
    pub model_to_train: Option<String>,
    /// Continue with phase-2 training and MT-Bench after phase-1 selection.
    pub run_second_phase: bool,

    // Evaluation settings
    /// Benchmark run by the single-stage `evaluation` command.
    pub eval_kind: EvaluationKind,
    pub mmlu: MmluSettings,
    pub mt_bench: MtBenchSettings,
    /// Judge model endpoint for MT-Bench.
    pub judge_serving: Option<ServingEndpoint>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            storage_class: "standard".to_string(),
            watch_timeout: None,
            images: StageImages::default(),

            taxonomy_repo_url: DEFAULT_REPO_URL.to_string(),
            taxonomy_repo_branch: None,
            taxonomy_repo_pr: None,
            base_model: DEFAULT_BASE_MODEL.to_string(),
            num_instructions_to_generate: 2,
            sdg_serving: None,

            nproc_per_node: 1,
            nnodes: 2,
            training_phase: TrainingPhase::First,
            model_to_train: None,
            run_second_phase: false,

            eval_kind: EvaluationKind::Mmlu,
            mmlu: MmluSettings::default(),
            mt_bench: MtBenchSettings::default(),
            judge_serving: None,
        }
    }
}

impl PipelineConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates settings shared by every stage.
    ///
    /// Stage-specific requirements are checked by [`Self::require_sdg`] when
    /// the stage is about to run.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` describing the first invalid setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.namespace.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "namespace cannot be empty".to_string(),
            ));
        }

        if self.storage_class.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "storage_class cannot be empty".to_string(),
            ));
        }

        if self.taxonomy_repo_url.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "taxonomy_repo_url cannot be empty".to_string(),
            ));
        }

        if self.taxonomy_branch().is_some() && self.taxonomy_pr().is_some() {
            return Err(ConfigError::ConflictingParameters(
                "taxonomy-repo-branch and taxonomy-repo-pr cannot both be set".to_string(),
            ));
        }

        if self.nnodes == 0 {
            return Err(ConfigError::InvalidValue {
                key: "nnodes".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        if self.nproc_per_node == 0 {
            return Err(ConfigError::InvalidValue {
                key: "nproc-per-node".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        if self.num_instructions_to_generate == 0 {
            return Err(ConfigError::InvalidValue {
                key: "num-instructions-to-generate".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        if self.watch_timeout.is_some_and(|t| t.is_zero()) {
            return Err(ConfigError::InvalidValue {
                key: "watch-timeout-secs".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }

        Ok(())
    }

    /// Checks the SDG inputs and returns the serving endpoint.
    ///
    /// # Errors
    ///
    /// `ConfigError::MissingParameter` if no taxonomy branch or pull request,
    /// or no SDG serving endpoint, was supplied.
    pub fn require_sdg(&self) -> Result<&ServingEndpoint, ConfigError> {
        if self.taxonomy_branch().is_none() && self.taxonomy_pr().is_none() {
            return Err(ConfigError::MissingParameter(
                "taxonomy-repo-branch or taxonomy-repo-pr".to_string(),
            ));
        }

        self.sdg_serving.as_ref().ok_or_else(|| {
            ConfigError::MissingParameter(
                "sdg-serving-endpoint, sdg-serving-model and sdg-serving-api-key".to_string(),
            )
        })
    }

    /// Branch, with blank values treated as unset.
    pub fn taxonomy_branch(&self) -> Option<&str> {
        self.taxonomy_repo_branch
            .as_deref()
            .map(str::trim)
            .filter(|b| !b.is_empty())
    }

    /// Pull request number, with `0` treated as unset.
    pub fn taxonomy_pr(&self) -> Option<u32> {
        self.taxonomy_repo_pr.filter(|&pr| pr > 0)
    }

    /// Builder method to set the namespace.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Builder method to set the storage class.
    pub fn with_storage_class(mut self, storage_class: impl Into<String>) -> Self {
        self.storage_class = storage_class.into();
        self
    }

    /// Builder method to set the watch timeout.
    pub fn with_watch_timeout(mut self, timeout: Duration) -> Self {
        self.watch_timeout = Some(timeout);
        self
    }

    pub fn with_images(mut self, images: StageImages) -> Self {
        self.images = images;
        self
    }

    pub fn with_taxonomy_repo_url(mut self, url: impl Into<String>) -> Self {
        self.taxonomy_repo_url = url.into();
        self
    }

    pub fn with_taxonomy_branch(mut self, branch: impl Into<String>) -> Self {
        self.taxonomy_repo_branch = Some(branch.into());
        self
    }

    pub fn with_taxonomy_pr(mut self, pr: u32) -> Self {
        self.taxonomy_repo_pr = Some(pr);
        self
    }

    /// Builder method to set the SDG serving endpoint.
    pub fn with_sdg_serving(mut self, serving: ServingEndpoint) -> Self {
        self.sdg_serving = Some(serving);
        self
    }

    /// Builder method to set the node layout of training.
    pub fn with_nodes(mut self, nnodes: u32, nproc_per_node: u32) -> Self {
        self.nnodes = nnodes;
        self.nproc_per_node = nproc_per_node;
        self
    }

    pub fn with_training_phase(mut self, phase: TrainingPhase) -> Self {
        self.training_phase = phase;
        self
    }

    pub fn with_model_to_train(mut self, path: impl Into<String>) -> Self {
        self.model_to_train = Some(path.into());
        self
    }

    pub fn with_second_phase(mut self, enabled: bool) -> Self {
        self.run_second_phase = enabled;
        self
    }

    pub fn with_eval_kind(mut self, kind: EvaluationKind) -> Self {
        self.eval_kind = kind;
        self
    }

    /// Builder method to set the MT-Bench judge endpoint.
    pub fn with_judge_serving(mut self, serving: ServingEndpoint) -> Self {
        self.judge_serving = Some(serving);
        self
    }
}
