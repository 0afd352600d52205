//! Synthetic data generation workload.
//!
//! The SDG job runs its steps as a chain of init containers on a single pod:
//!
//! ```text
//! fetch-taxonomy-data → generate-synthetic-data → import-base-model → preprocess-data
//!     → copy-model-to-output (main container)
//! ```
//!
//! Parameters reach the containers as environment bindings; the shell scripts
//! below are constants and never have values formatted into them.

use crate::error::DescriptorError;

use super::descriptor::{
    EnvBinding, RestartPolicy, Step, VolumeMount, VolumeRole, WorkloadDescriptor,
};
use super::{StageImages, SDG_SERVING_CONFIG};

/// Name of the SDG job.
pub const SDG_WORKLOAD_NAME: &str = "sdg";

/// Default taxonomy repository.
pub const DEFAULT_REPO_URL: &str = "https://github.com/instructlab/taxonomy.git";

/// Default base model imported from Hugging Face.
pub const DEFAULT_BASE_MODEL: &str = "ibm-granite/granite-7b-base";

/// Where the input data volume is mounted during SDG.
pub const DATA_MOUNT: &str = "/data";

/// Where the model volume is mounted during SDG.
pub const MODEL_MOUNT: &str = "/model";

/// Where the output volume is mounted.
pub const OUTPUT_MOUNT: &str = "/output";

const FETCH_TAXONOMY_SCRIPT: &str = r#"set -e
rm -rf /data/taxonomy
git clone "$TAXONOMY_REPO_URL" /data/taxonomy
cd /data/taxonomy
if [ -n "$TAXONOMY_REPO_BRANCH" ]; then
  git fetch origin "$TAXONOMY_REPO_BRANCH"
  git checkout "$TAXONOMY_REPO_BRANCH"
elif [ -n "$TAXONOMY_REPO_PR" ]; then
  git fetch origin "pull/$TAXONOMY_REPO_PR/head:pr-$TAXONOMY_REPO_PR"
  git checkout "pr-$TAXONOMY_REPO_PR"
fi
"#;

const IMPORT_MODEL_SCRIPT: &str = r#"set -e
pip install --quiet --user huggingface_hub
python3 - <<'EOF'
import os
from huggingface_hub import snapshot_download
snapshot_download(repo_id=os.environ["BASE_MODEL"], cache_dir="/tmp", local_dir="/model/model")
EOF
"#;

const PREPROCESS_SCRIPT: &str = r#"set -e
mkdir -p /data/processed_data
python3 -u -m instructlab.training.data_process \
  --data_path "$(ls /data/generated/*_train_msgs*.jsonl | head -n 1)" \
  --data_output_path /data/processed_data \
  --max_seq_len "$MAX_SEQ_LEN" \
  --model_name_or_path /model/model
"#;

const COPY_MODEL_SCRIPT: &str = "set -e\nmkdir -p /output\ncp -r /model/model /output/base_model\n";

/// Which revision of the taxonomy repository to fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaxonomyRef {
    Branch(String),
    PullRequest(u32),
}

/// A taxonomy repository plus exactly one revision selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaxonomySource {
    pub url: String,
    pub reference: TaxonomyRef,
}

impl TaxonomySource {
    /// Builds a source from the raw branch / pull request options.
    ///
    /// A pull request number of `0` counts as absent.
    ///
    /// # Errors
    ///
    /// - `DescriptorError::MissingTaxonomyRef` if neither is given
    /// - `DescriptorError::ConflictingTaxonomyRef` if both are given
    /// - `DescriptorError::EmptyRepoUrl` if the URL is blank
    pub fn new(
        url: impl Into<String>,
        branch: Option<&str>,
        pr: Option<u32>,
    ) -> Result<Self, DescriptorError> {
        let url = url.into();
        if url.trim().is_empty() {
            return Err(DescriptorError::EmptyRepoUrl);
        }

        let branch = branch.map(str::trim).filter(|b| !b.is_empty());
        let pr = pr.filter(|&n| n > 0);

        let reference = match (branch, pr) {
            (Some(branch), None) => TaxonomyRef::Branch(branch.to_string()),
            (None, Some(pr)) => TaxonomyRef::PullRequest(pr),
            (Some(branch), Some(pr)) => {
                return Err(DescriptorError::ConflictingTaxonomyRef {
                    branch: branch.to_string(),
                    pr,
                })
            }
            (None, None) => return Err(DescriptorError::MissingTaxonomyRef),
        };

        Ok(Self { url, reference })
    }

    /// Environment bindings consumed by the fetch script.
    fn fetch_env(&self) -> Vec<EnvBinding> {
        let revision = match &self.reference {
            TaxonomyRef::Branch(branch) => EnvBinding::value("TAXONOMY_REPO_BRANCH", branch.clone()),
            TaxonomyRef::PullRequest(pr) => EnvBinding::value("TAXONOMY_REPO_PR", pr.to_string()),
        };
        vec![EnvBinding::value("TAXONOMY_REPO_URL", self.url.clone()), revision]
    }
}

/// Inputs of the SDG stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdgSpec {
    pub repo_url: String,
    pub repo_branch: Option<String>,
    pub repo_pr: Option<u32>,
    /// Hugging Face repository of the base model.
    pub base_model: String,
    pub num_instructions_to_generate: u32,
    /// Maximum sequence length used while preprocessing.
    pub max_seq_len: u32,
}

impl SdgSpec {
    pub fn new(repo_url: impl Into<String>) -> Self {
        Self {
            repo_url: repo_url.into(),
            repo_branch: None,
            repo_pr: None,
            base_model: DEFAULT_BASE_MODEL.to_string(),
            num_instructions_to_generate: 2,
            max_seq_len: 4096,
        }
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.repo_branch = Some(branch.into());
        self
    }

    pub fn with_pr(mut self, pr: u32) -> Self {
        self.repo_pr = Some(pr);
        self
    }

    pub fn with_base_model(mut self, model: impl Into<String>) -> Self {
        self.base_model = model.into();
        self
    }

    pub fn with_num_instructions(mut self, count: u32) -> Self {
        self.num_instructions_to_generate = count;
        self
    }

    /// Validates the taxonomy options.
    pub fn taxonomy(&self) -> Result<TaxonomySource, DescriptorError> {
        TaxonomySource::new(
            self.repo_url.clone(),
            self.repo_branch.as_deref(),
            self.repo_pr,
        )
    }
}

/// Builds the SDG job descriptor.
///
/// # Errors
///
/// Fails before producing anything if the taxonomy source lacks a branch or
/// pull request, or names both.
pub fn build_sdg_workload(
    spec: &SdgSpec,
    images: &StageImages,
) -> Result<WorkloadDescriptor, DescriptorError> {
    let taxonomy = spec.taxonomy()?;

    let fetch = taxonomy.fetch_env().into_iter().fold(
        Step::new("fetch-taxonomy-data", &images.toolbox)
            .with_command(["/bin/sh", "-c"])
            .with_args([FETCH_TAXONOMY_SCRIPT])
            .with_mount(VolumeMount::read_write(VolumeRole::InputData, DATA_MOUNT)),
        Step::with_env,
    );

    let generate = Step::new("generate-synthetic-data", &images.sdg)
        .with_command(["ilab", "data", "generate"])
        .with_args([
            "--taxonomy-path".to_string(),
            format!("{DATA_MOUNT}/taxonomy"),
            "--output-dir".to_string(),
            format!("{DATA_MOUNT}/generated"),
            "--num-instructions".to_string(),
            spec.num_instructions_to_generate.to_string(),
            "--endpoint-url".to_string(),
            "$(SDG_ENDPOINT)".to_string(),
            "--model".to_string(),
            "$(SDG_MODEL)".to_string(),
            "--api-key".to_string(),
            "$(SDG_API_KEY)".to_string(),
        ])
        .with_env(EnvBinding::config_map_key("SDG_ENDPOINT", SDG_SERVING_CONFIG, "endpoint"))
        .with_env(EnvBinding::config_map_key("SDG_MODEL", SDG_SERVING_CONFIG, "model"))
        .with_env(EnvBinding::secret_key("SDG_API_KEY", SDG_SERVING_CONFIG, "api_key"))
        .with_mount(VolumeMount::read_write(VolumeRole::InputData, DATA_MOUNT));

    let import_model = Step::new("import-base-model", &images.python)
        .with_command(["/bin/sh", "-c"])
        .with_args([IMPORT_MODEL_SCRIPT])
        .with_env(EnvBinding::value("BASE_MODEL", spec.base_model.clone()))
        .with_mount(VolumeMount::read_write(VolumeRole::Model, MODEL_MOUNT));

    let preprocess = Step::new("preprocess-data", &images.training)
        .with_command(["/bin/sh", "-c"])
        .with_args([PREPROCESS_SCRIPT])
        .with_env(EnvBinding::value("MAX_SEQ_LEN", spec.max_seq_len.to_string()))
        .with_mount(VolumeMount::read_write(VolumeRole::InputData, DATA_MOUNT))
        .with_mount(VolumeMount::read_only(VolumeRole::Model, MODEL_MOUNT));

    let copy_model = Step::new("copy-model-to-output", &images.toolbox)
        .with_command(["/bin/sh", "-c"])
        .with_args([COPY_MODEL_SCRIPT])
        .with_mount(VolumeMount::read_only(VolumeRole::Model, MODEL_MOUNT))
        .with_mount(VolumeMount::read_write(VolumeRole::Output, OUTPUT_MOUNT));

    WorkloadDescriptor::new(
        SDG_WORKLOAD_NAME,
        vec![fetch, generate, import_model, preprocess, copy_model],
        RestartPolicy::Never,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fetch_steps(descriptor: &WorkloadDescriptor) -> Vec<&Step> {
        descriptor
            .steps
            .iter()
            .filter(|s| s.binds_env("TAXONOMY_REPO_URL"))
            .collect()
    }

    #[test]
    fn test_branch_source() {
        let spec = SdgSpec::new("https://example.com/taxonomy.git").with_branch("main");
        let descriptor = build_sdg_workload(&spec, &StageImages::default()).expect("sdg");

        let fetch = fetch_steps(&descriptor);
        assert_eq!(fetch.len(), 1);
        assert_eq!(
            fetch[0].env_value("TAXONOMY_REPO_URL"),
            Some("https://example.com/taxonomy.git")
        );
        assert_eq!(fetch[0].env_value("TAXONOMY_REPO_BRANCH"), Some("main"));
        assert!(!fetch[0].binds_env("TAXONOMY_REPO_PR"));
    }

    #[test]
    fn test_pull_request_source() {
        let spec = SdgSpec::new(DEFAULT_REPO_URL).with_pr(42);
        let descriptor = build_sdg_workload(&spec, &StageImages::default()).expect("sdg");

        let fetch = fetch_steps(&descriptor);
        assert_eq!(fetch.len(), 1);
        assert_eq!(fetch[0].env_value("TAXONOMY_REPO_PR"), Some("42"));
        assert!(!fetch[0].binds_env("TAXONOMY_REPO_BRANCH"));
    }

    #[test]
    fn test_values_never_formatted_into_script() {
        let spec = SdgSpec::new("https://example.com/x.git; rm -rf /").with_branch("main");
        let descriptor = build_sdg_workload(&spec, &StageImages::default()).expect("sdg");

        let fetch = fetch_steps(&descriptor)[0];
        assert!(fetch.args.iter().all(|a| !a.contains("example.com")));
    }

    #[test]
    fn test_missing_reference_fails_fast() {
        let spec = SdgSpec::new(DEFAULT_REPO_URL);
        let result = build_sdg_workload(&spec, &StageImages::default());
        assert!(matches!(result, Err(DescriptorError::MissingTaxonomyRef)));

        // PR 0 means "no PR"
        let spec = SdgSpec::new(DEFAULT_REPO_URL).with_pr(0);
        let result = build_sdg_workload(&spec, &StageImages::default());
        assert!(matches!(result, Err(DescriptorError::MissingTaxonomyRef)));
    }

    #[test]
    fn test_both_references_rejected() {
        let result = TaxonomySource::new(DEFAULT_REPO_URL, Some("main"), Some(7));
        assert!(matches!(
            result,
            Err(DescriptorError::ConflictingTaxonomyRef { pr: 7, .. })
        ));
    }

    #[test]
    fn test_blank_branch_counts_as_absent() {
        let source = TaxonomySource::new(DEFAULT_REPO_URL, Some("  "), Some(3)).expect("source");
        assert_eq!(source.reference, TaxonomyRef::PullRequest(3));
    }

    #[test]
    fn test_step_order_and_finalize() {
        let spec = SdgSpec::new(DEFAULT_REPO_URL).with_branch("main");
        let descriptor = build_sdg_workload(&spec, &StageImages::default()).expect("sdg");

        let names: Vec<_> = descriptor.steps.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "fetch-taxonomy-data",
                "generate-synthetic-data",
                "import-base-model",
                "preprocess-data",
                "copy-model-to-output",
            ]
        );
        assert_eq!(descriptor.output_step().name, "copy-model-to-output");
        assert_eq!(descriptor.name, SDG_WORKLOAD_NAME);
        assert_eq!(descriptor.volumes.len(), 3);
    }

    #[test]
    fn test_generation_reads_serving_config() {
        let spec = SdgSpec::new(DEFAULT_REPO_URL)
            .with_branch("main")
            .with_num_instructions(10);
        let descriptor = build_sdg_workload(&spec, &StageImages::default()).expect("sdg");
        let generate = descriptor.step("generate-synthetic-data").expect("step");

        assert!(generate.env.contains(&EnvBinding::config_map_key(
            "SDG_ENDPOINT",
            SDG_SERVING_CONFIG,
            "endpoint"
        )));
        assert!(generate.env.contains(&EnvBinding::secret_key(
            "SDG_API_KEY",
            SDG_SERVING_CONFIG,
            "api_key"
        )));
        assert!(generate.args.windows(2).any(|w| w[0] == "--num-instructions" && w[1] == "10"));
    }
}
