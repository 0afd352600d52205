//! Evaluation workload.
//!
//! One evaluation step scores every checkpoint under a models folder and
//! writes a JSON array of records to a results file on the output volume.
//! The main container prints that file so the driver can read the scores
//! back from the pod logs.

use std::fmt;
use std::str::FromStr;

use crate::error::DescriptorError;

use super::descriptor::{
    EnvBinding, ResourceRequests, RestartPolicy, Step, VolumeMount, VolumeRole,
    WorkloadDescriptor,
};
use super::{StageImages, JUDGE_SERVING_CONFIG};

/// Default MMLU task subset.
pub const DEFAULT_MMLU_TASKS: &str = "mmlu_anatomy,mmlu_astronomy";

const OUTPUT_MOUNT: &str = "/output";

const MMLU_SCRIPT: &str = r#"set -e
python3 -u -m instructlab.eval.mmlu \
  --models-folder "$MODELS_FOLDER" \
  --tasks "$MMLU_TASKS_LIST" \
  --model-dtype "$MODEL_DTYPE" \
  --few-shots "$FEW_SHOTS" \
  --batch-size "$BATCH_SIZE" \
  --output "$RESULTS_PATH"
"#;

const MT_BENCH_SCRIPT: &str = r#"set -e
python3 -u -m instructlab.eval.mt_bench \
  --models-folder "$MODELS_FOLDER" \
  --judge-endpoint "$JUDGE_ENDPOINT" \
  --judge-model "$JUDGE_NAME" \
  --max-workers "$MAX_WORKERS" \
  --merge-system-user-message "$MERGE_SYSTEM_USER_MESSAGE" \
  --output "$RESULTS_PATH"
"#;

/// Which benchmark an evaluation stage runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum EvaluationKind {
    /// Knowledge benchmark, scored by `average_score`.
    #[default]
    Mmlu,
    /// Skills benchmark scored by a judge model, reported as `overall_score`.
    MtBench,
}

impl EvaluationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EvaluationKind::Mmlu => "mmlu",
            EvaluationKind::MtBench => "mt-bench",
        }
    }

    /// Job name for this evaluation.
    pub fn workload_name(self) -> &'static str {
        match self {
            EvaluationKind::Mmlu => "eval-mmlu",
            EvaluationKind::MtBench => "eval-mt-bench",
        }
    }

    /// File the evaluation step writes its JSON results to.
    pub fn results_path(self) -> &'static str {
        match self {
            EvaluationKind::Mmlu => "/output/mmlu-results.txt",
            EvaluationKind::MtBench => "/output/mt-bench-results.txt",
        }
    }
}

impl fmt::Display for EvaluationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EvaluationKind {
    type Err = DescriptorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mmlu" => Ok(EvaluationKind::Mmlu),
            "mt-bench" | "mt_bench" => Ok(EvaluationKind::MtBench),
            other => Err(DescriptorError::InvalidValue {
                key: "eval-type".to_string(),
                message: format!("expected 'mmlu' or 'mt-bench', got '{other}'"),
            }),
        }
    }
}

/// MMLU parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MmluSettings {
    /// Comma separated task names.
    pub tasks: String,
    pub model_dtype: String,
    pub few_shots: u32,
    pub batch_size: u32,
}

impl Default for MmluSettings {
    fn default() -> Self {
        Self {
            tasks: DEFAULT_MMLU_TASKS.to_string(),
            model_dtype: "bfloat16".to_string(),
            few_shots: 5,
            batch_size: 8,
        }
    }
}

/// MT-Bench parameters. The judge endpoint itself comes from the
/// `judge-server` ConfigMap and Secret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MtBenchSettings {
    /// Worker count, or `auto` to size from the available CPUs.
    pub max_workers: String,
    pub merge_system_user_message: bool,
}

impl Default for MtBenchSettings {
    fn default() -> Self {
        Self {
            max_workers: "auto".to_string(),
            merge_system_user_message: false,
        }
    }
}

/// Inputs of an evaluation stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvaluationSpec {
    pub kind: EvaluationKind,
    /// Folder holding one checkpoint directory per candidate model.
    pub models_folder: String,
    pub mmlu: MmluSettings,
    pub mt_bench: MtBenchSettings,
}

impl EvaluationSpec {
    pub fn new(kind: EvaluationKind, models_folder: impl Into<String>) -> Self {
        Self {
            kind,
            models_folder: models_folder.into(),
            mmlu: MmluSettings::default(),
            mt_bench: MtBenchSettings::default(),
        }
    }

    fn eval_step(&self, image: &str) -> Step {
        let step = Step::new(format!("run-{}", self.kind.as_str()), image)
            .with_command(["/bin/sh", "-c"])
            .with_env(EnvBinding::value("MODELS_FOLDER", self.models_folder.clone()))
            .with_env(EnvBinding::value("RESULTS_PATH", self.kind.results_path()))
            .with_mount(VolumeMount::read_write(VolumeRole::Output, OUTPUT_MOUNT))
            .with_resources(ResourceRequests::gpus(1));

        match self.kind {
            EvaluationKind::Mmlu => step
                .with_args([MMLU_SCRIPT])
                .with_env(EnvBinding::value("MMLU_TASKS_LIST", self.mmlu.tasks.clone()))
                .with_env(EnvBinding::value("MODEL_DTYPE", self.mmlu.model_dtype.clone()))
                .with_env(EnvBinding::value("FEW_SHOTS", self.mmlu.few_shots.to_string()))
                .with_env(EnvBinding::value("BATCH_SIZE", self.mmlu.batch_size.to_string())),
            EvaluationKind::MtBench => step
                .with_args([MT_BENCH_SCRIPT])
                .with_env(EnvBinding::value(
                    "MAX_WORKERS",
                    self.mt_bench.max_workers.clone(),
                ))
                .with_env(EnvBinding::value(
                    "MERGE_SYSTEM_USER_MESSAGE",
                    self.mt_bench.merge_system_user_message.to_string(),
                ))
                .with_env(EnvBinding::config_map_key(
                    "JUDGE_ENDPOINT",
                    JUDGE_SERVING_CONFIG,
                    "endpoint",
                ))
                .with_env(EnvBinding::config_map_key(
                    "JUDGE_NAME",
                    JUDGE_SERVING_CONFIG,
                    "model",
                ))
                .with_env(EnvBinding::secret_key(
                    "JUDGE_API_KEY",
                    JUDGE_SERVING_CONFIG,
                    "api_key",
                )),
        }
    }
}

/// Builds the evaluation job descriptor.
pub fn build_evaluation_workload(
    spec: &EvaluationSpec,
    images: &StageImages,
) -> Result<WorkloadDescriptor, DescriptorError> {
    let emit = Step::new("emit-results", &images.toolbox)
        .with_command(["/bin/cat"])
        .with_args([spec.kind.results_path()])
        .with_mount(VolumeMount::read_only(VolumeRole::Output, OUTPUT_MOUNT));

    WorkloadDescriptor::new(
        spec.kind.workload_name(),
        vec![spec.eval_step(&images.eval), emit],
        RestartPolicy::Never,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_parsing() {
        assert_eq!("mmlu".parse::<EvaluationKind>().unwrap(), EvaluationKind::Mmlu);
        assert_eq!("MT-Bench".parse::<EvaluationKind>().unwrap(), EvaluationKind::MtBench);
        assert_eq!("mt_bench".parse::<EvaluationKind>().unwrap(), EvaluationKind::MtBench);
        assert!(matches!(
            "hellaswag".parse::<EvaluationKind>(),
            Err(DescriptorError::InvalidValue { key, .. }) if key == "eval-type"
        ));
    }

    #[test]
    fn test_mmlu_workload() {
        let spec = EvaluationSpec::new(EvaluationKind::Mmlu, "/output/model/hf_format");
        let descriptor = build_evaluation_workload(&spec, &StageImages::default()).expect("eval");

        assert_eq!(descriptor.name, "eval-mmlu");
        assert_eq!(descriptor.steps.len(), 2);

        let run = &descriptor.init_steps()[0];
        assert_eq!(run.name, "run-mmlu");
        assert_eq!(run.env_value("MMLU_TASKS_LIST"), Some(DEFAULT_MMLU_TASKS));
        assert_eq!(run.env_value("FEW_SHOTS"), Some("5"));
        assert_eq!(run.env_value("RESULTS_PATH"), Some("/output/mmlu-results.txt"));
        assert_eq!(run.resources.as_ref().map(|r| r.gpus), Some(1));

        let emit = descriptor.output_step();
        assert_eq!(emit.name, "emit-results");
        assert_eq!(emit.args, vec!["/output/mmlu-results.txt".to_string()]);
    }

    #[test]
    fn test_mt_bench_reads_judge_config() {
        let spec = EvaluationSpec::new(EvaluationKind::MtBench, "/output/phase_2/model/hf_format");
        let descriptor = build_evaluation_workload(&spec, &StageImages::default()).expect("eval");

        let run = descriptor.step("run-mt-bench").expect("step");
        assert_eq!(run.env_value("MAX_WORKERS"), Some("auto"));
        assert!(run.binds_env("JUDGE_ENDPOINT"));
        assert!(run.env.contains(&EnvBinding::secret_key(
            "JUDGE_API_KEY",
            JUDGE_SERVING_CONFIG,
            "api_key"
        )));
        assert!(!run.binds_env("MMLU_TASKS_LIST"));
        assert_eq!(descriptor.name, "eval-mt-bench");
    }
}
