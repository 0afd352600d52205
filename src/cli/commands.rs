//! CLI command definitions for ilab-standalone.
//!
//! Without a subcommand the whole pipeline runs. The `sdg`, `train` and
//! `evaluation` subcommands run a single stage with the same options.

use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser};
use tracing::info;

use crate::cluster::{KubeCluster, ServingEndpoint};
use crate::pipeline::{ConfigError, PipelineConfig, PipelineOrchestrator};
use crate::workload::sdg::{DEFAULT_BASE_MODEL, DEFAULT_REPO_URL};
use crate::workload::{
    EvaluationKind, StageImages, TrainingPhase, DEFAULT_EVAL_IMAGE, DEFAULT_PYTHON_IMAGE,
    DEFAULT_SDG_IMAGE, DEFAULT_TOOLBOX_IMAGE, DEFAULT_TRAINING_IMAGE,
};

/// Standalone driver for the InstructLab pipeline on Kubernetes.
#[derive(Parser, Debug)]
#[command(name = "ilab-standalone")]
#[command(about = "Run InstructLab SDG, training and evaluation on a Kubernetes cluster")]
#[command(version)]
#[command(
    long_about = "ilab-standalone creates the volumes, configuration, Jobs and PyTorchJobs of the InstructLab pipeline and waits for each to finish.\n\nWithout a subcommand it runs SDG, phase-1 training, MMLU evaluation and best-model selection, optionally followed by phase-2 training and MT-Bench.\n\nExample usage:\n  ilab-standalone --namespace ilab --taxonomy-repo-branch main \\\n    --sdg-serving-endpoint http://vllm:8000/v1 --sdg-serving-model mixtral --sdg-serving-api-key $KEY"
)]
pub struct Cli {
    /// Stage to run on its own. Runs the full pipeline when omitted.
    #[command(subcommand)]
    pub command: Option<Commands>,

    #[command(flatten)]
    pub pipeline: PipelineArgs,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Single-stage subcommands.
#[derive(clap::Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Commands {
    /// Provision volumes and serving configuration, then run synthetic data generation.
    Sdg,

    /// Run one training phase (see --training-phase).
    Train,

    /// Evaluate the checkpoints of a training phase and report the best model.
    #[command(alias = "eval")]
    Evaluation,
}

/// Options shared by every command.
#[derive(Args, Debug, Clone)]
pub struct PipelineArgs {
    /// Namespace to create every object in.
    #[arg(long, env = "ILAB_NAMESPACE", default_value = "default", global = true)]
    pub namespace: String,

    /// Taxonomy git repository.
    #[arg(long, default_value = DEFAULT_REPO_URL, global = true)]
    pub taxonomy_repo_url: String,

    /// Taxonomy branch to train on. Exclusive with a non-zero --taxonomy-repo-pr.
    #[arg(long, global = true)]
    pub taxonomy_repo_branch: Option<String>,

    /// Taxonomy pull request number to train on. 0 means none.
    #[arg(long, global = true)]
    pub taxonomy_repo_pr: Option<u32>,

    /// Storage class of the persistent volume claims.
    #[arg(long, default_value = "standard", global = true)]
    pub storage_class: String,

    /// OpenAI-compatible endpoint used for synthetic data generation.
    #[arg(long, global = true)]
    pub sdg_serving_endpoint: Option<String>,

    /// Model served at the SDG endpoint.
    #[arg(long, global = true)]
    pub sdg_serving_model: Option<String>,

    /// API key of the SDG endpoint.
    #[arg(long, env = "SDG_SERVING_API_KEY", hide_env_values = true, global = true)]
    pub sdg_serving_api_key: Option<String>,

    /// Hugging Face repository of the base model.
    #[arg(long, default_value = DEFAULT_BASE_MODEL, global = true)]
    pub base_model: String,

    /// Number of instructions to generate per taxonomy leaf.
    #[arg(long, default_value = "2", global = true)]
    pub num_instructions_to_generate: u32,

    /// Processes (and GPUs) per training node.
    #[arg(long, default_value = "1", global = true)]
    pub nproc_per_node: u32,

    /// Number of training nodes, including the coordinator.
    #[arg(long, default_value = "2", global = true)]
    pub nnodes: u32,

    /// Evaluation to run (mmlu, mt-bench).
    #[arg(long, default_value = "mmlu", global = true)]
    pub eval_type: EvaluationKind,

    /// Training phase to run or evaluate (1, 2).
    #[arg(long, default_value = "1", global = true)]
    pub training_phase: TrainingPhase,

    /// Model path to train from, overriding the default or selected model.
    #[arg(long, global = true)]
    pub model_to_train: Option<String>,

    /// Judge model endpoint for MT-Bench.
    #[arg(long, global = true)]
    pub judge_serving_endpoint: Option<String>,

    /// Judge model name.
    #[arg(long, global = true)]
    pub judge_serving_model: Option<String>,

    /// API key of the judge endpoint.
    #[arg(long, env = "JUDGE_SERVING_API_KEY", hide_env_values = true, global = true)]
    pub judge_serving_api_key: Option<String>,

    /// Give up on a workload after this many seconds. Waits forever by default.
    #[arg(long, global = true)]
    pub watch_timeout_secs: Option<u64>,

    /// Continue with phase-2 training and MT-Bench after phase-1 selection.
    #[arg(long, global = true)]
    pub with_second_phase: bool,

    /// Image with git and a shell, used for fetch and copy steps.
    #[arg(long, env = "ILAB_TOOLBOX_IMAGE", default_value = DEFAULT_TOOLBOX_IMAGE, global = true)]
    pub toolbox_image: String,

    /// Python image used to import the base model.
    #[arg(long, env = "ILAB_PYTHON_IMAGE", default_value = DEFAULT_PYTHON_IMAGE, global = true)]
    pub python_image: String,

    /// Synthetic data generation image.
    #[arg(long, env = "ILAB_SDG_IMAGE", default_value = DEFAULT_SDG_IMAGE, global = true)]
    pub sdg_image: String,

    /// Preprocessing and training image.
    #[arg(long, env = "ILAB_TRAINING_IMAGE", default_value = DEFAULT_TRAINING_IMAGE, global = true)]
    pub training_image: String,

    /// Evaluation image.
    #[arg(long, env = "ILAB_EVAL_IMAGE", default_value = DEFAULT_EVAL_IMAGE, global = true)]
    pub eval_image: String,
}

/// Builds an endpoint from its three options, which must be given together.
fn serving_endpoint(
    label: &str,
    endpoint: Option<&String>,
    model: Option<&String>,
    api_key: Option<&String>,
) -> Result<Option<ServingEndpoint>, ConfigError> {
    match (endpoint, model, api_key) {
        (None, None, None) => Ok(None),
        (Some(endpoint), Some(model), Some(api_key)) => {
            Ok(Some(ServingEndpoint::new(endpoint, model, api_key)))
        }
        _ => Err(ConfigError::MissingParameter(format!(
            "{label}-serving-endpoint, {label}-serving-model and {label}-serving-api-key must be given together"
        ))),
    }
}

impl PipelineArgs {
    fn images(&self) -> StageImages {
        StageImages {
            toolbox: self.toolbox_image.clone(),
            python: self.python_image.clone(),
            sdg: self.sdg_image.clone(),
            training: self.training_image.clone(),
            eval: self.eval_image.clone(),
        }
    }

    /// Converts the arguments into a validated configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` for partial serving settings or invalid values.
    pub fn to_config(&self) -> Result<PipelineConfig, ConfigError> {
        let config = PipelineConfig {
            namespace: self.namespace.clone(),
            storage_class: self.storage_class.clone(),
            watch_timeout: self.watch_timeout_secs.map(Duration::from_secs),
            taxonomy_repo_url: self.taxonomy_repo_url.clone(),
            taxonomy_repo_branch: self.taxonomy_repo_branch.clone(),
            taxonomy_repo_pr: self.taxonomy_repo_pr,
            base_model: self.base_model.clone(),
            num_instructions_to_generate: self.num_instructions_to_generate,
            sdg_serving: serving_endpoint(
                "sdg",
                self.sdg_serving_endpoint.as_ref(),
                self.sdg_serving_model.as_ref(),
                self.sdg_serving_api_key.as_ref(),
            )?,
            nproc_per_node: self.nproc_per_node,
            nnodes: self.nnodes,
            training_phase: self.training_phase,
            model_to_train: self.model_to_train.clone(),
            run_second_phase: self.with_second_phase,
            eval_kind: self.eval_type,
            judge_serving: serving_endpoint(
                "judge",
                self.judge_serving_endpoint.as_ref(),
                self.judge_serving_model.as_ref(),
                self.judge_serving_api_key.as_ref(),
            )?,
            ..PipelineConfig::default()
        }
        .with_images(self.images());

        config.validate()?;
        Ok(config)
    }
}

/// Parse CLI arguments and return the Cli struct.
///
/// Use this when you need access to CLI args before running (e.g., for log level).
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let config = cli.pipeline.to_config()?;
    let cluster = KubeCluster::connect().await?;
    let orchestrator = PipelineOrchestrator::new(config, Arc::new(cluster))?;

    match cli.command {
        None => {
            let ctx = orchestrator.run_full().await?;
            println!("Completed stages: {}", ctx.completed_stages().join(" -> "));
            if let (Some(model), Some(score)) = (&ctx.selected_model, ctx.selected_score) {
                println!("Best model: {model} (score {score:.4})");
            }
        }
        Some(Commands::Sdg) => {
            let mut ctx = orchestrator.new_context();
            let result = orchestrator.run_sdg(&mut ctx).await?;
            info!(bytes = result.logs.len(), "SDG finished");
            println!("{}", result.logs);
        }
        Some(Commands::Train) => {
            let mut ctx = orchestrator.new_context();
            let phase = orchestrator.config().training_phase;
            let result = orchestrator.run_training(&mut ctx, phase).await?;
            info!(%phase, bytes = result.logs.len(), "Training finished");
            println!("Checkpoints written to {}", phase.models_folder());
        }
        Some(Commands::Evaluation) => {
            let mut ctx = orchestrator.new_context();
            let kind = orchestrator.config().eval_kind;
            let result = orchestrator.run_evaluation(&mut ctx, kind).await?;
            for record in &result.scores {
                println!("{}: {:.4}", record.model, record.average_score);
            }
            let best = orchestrator.select_best_model(&mut ctx)?;
            println!("Best model: {} (score {:.4})", best.model, best.average_score);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parses() {
        // Verify CLI definition is valid
        Cli::command().debug_assert();
    }

    #[test]
    fn test_defaults() {
        let cli = Cli::try_parse_from(["ilab-standalone"]).expect("should parse");

        assert!(cli.command.is_none());
        assert_eq!(cli.log_level, "info");
        let args = &cli.pipeline;
        assert_eq!(args.taxonomy_repo_url, DEFAULT_REPO_URL);
        assert_eq!(args.storage_class, "standard");
        assert_eq!(args.nproc_per_node, 1);
        assert_eq!(args.nnodes, 2);
        assert_eq!(args.eval_type, EvaluationKind::Mmlu);
        assert_eq!(args.training_phase, TrainingPhase::First);
        assert_eq!(args.num_instructions_to_generate, 2);
        assert!(!args.with_second_phase);
        assert_eq!(args.training_image, DEFAULT_TRAINING_IMAGE);
    }

    #[test]
    fn test_image_overrides() {
        let cli = Cli::try_parse_from([
            "ilab-standalone",
            "train",
            "--training-image",
            "registry.example.com/ilab/train:1.2",
            "--eval-image",
            "registry.example.com/ilab/eval:1.2",
        ])
        .expect("should parse");

        let config = cli.pipeline.to_config().expect("config");
        assert_eq!(config.images.training, "registry.example.com/ilab/train:1.2");
        assert_eq!(config.images.eval, "registry.example.com/ilab/eval:1.2");
        assert_eq!(config.images.sdg, StageImages::default().sdg);
    }

    #[test]
    fn test_subcommand_with_global_options() {
        let cli = Cli::try_parse_from([
            "ilab-standalone",
            "evaluation",
            "--eval-type",
            "mt-bench",
            "--training-phase",
            "2",
            "--namespace",
            "ilab",
        ])
        .expect("should parse");

        assert_eq!(cli.command, Some(Commands::Evaluation));
        assert_eq!(cli.pipeline.eval_type, EvaluationKind::MtBench);
        assert_eq!(cli.pipeline.training_phase, TrainingPhase::Second);
        assert_eq!(cli.pipeline.namespace, "ilab");
    }

    #[test]
    fn test_branch_and_pr_conflict() {
        let cli = Cli::try_parse_from([
            "ilab-standalone",
            "sdg",
            "--taxonomy-repo-branch",
            "main",
            "--taxonomy-repo-pr",
            "3",
        ])
        .expect("should parse");

        assert!(matches!(
            cli.pipeline.to_config(),
            Err(ConfigError::ConflictingParameters(_))
        ));
    }

    #[test]
    fn test_zero_pr_with_branch_is_accepted() {
        let cli = Cli::try_parse_from([
            "ilab-standalone",
            "sdg",
            "--taxonomy-repo-branch",
            "main",
            "--taxonomy-repo-pr",
            "0",
        ])
        .expect("should parse");

        let config = cli.pipeline.to_config().expect("config");
        assert_eq!(config.taxonomy_branch(), Some("main"));
        assert_eq!(config.taxonomy_pr(), None);
    }

    #[test]
    fn test_invalid_eval_type() {
        let result = Cli::try_parse_from(["ilab-standalone", "--eval-type", "hellaswag"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_to_config() {
        let cli = Cli::try_parse_from([
            "ilab-standalone",
            "--taxonomy-repo-pr",
            "17",
            "--sdg-serving-endpoint",
            "http://vllm:8000/v1",
            "--sdg-serving-model",
            "mixtral",
            "--sdg-serving-api-key",
            "secret",
            "--watch-timeout-secs",
            "3600",
            "--with-second-phase",
        ])
        .expect("should parse");

        let config = cli.pipeline.to_config().expect("config");
        assert_eq!(config.taxonomy_pr(), Some(17));
        assert_eq!(config.watch_timeout, Some(Duration::from_secs(3600)));
        assert!(config.run_second_phase);
        let serving = config.require_sdg().expect("serving");
        assert_eq!(serving.model, "mixtral");
        assert!(config.judge_serving.is_none());
    }

    #[test]
    fn test_partial_serving_rejected() {
        let cli = Cli::try_parse_from([
            "ilab-standalone",
            "--judge-serving-endpoint",
            "http://judge:8000/v1",
        ])
        .expect("should parse");

        assert!(matches!(
            cli.pipeline.to_config(),
            Err(ConfigError::MissingParameter(_))
        ));
    }
}
