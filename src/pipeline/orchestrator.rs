//! Pipeline orchestrator.
//!
//! Runs the stages in order and threads each stage's output into the next:
//!
//! ```text
//! Sdg → Train(phase 1) → Evaluate(MMLU) → SelectBestModel
//!     → [Train(phase 2) → Evaluate(MT-Bench) → SelectBestModel] → Done
//! ```
//!
//! The bracketed part only runs when `run_second_phase` is set. Every stage is
//! gated on the success of the previous one; the first error aborts the run.
//! Objects already created in the cluster are left in place.

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::{info, warn};

use crate::cluster::{
    ensure_judge_config, ensure_sdg_config, ensure_volume_claims, submit, wait_for_completion,
    ClusterApi, WorkloadOutput,
};
use crate::error::{ClusterError, DescriptorError, ScoreError};
use crate::workload::training::DEFAULT_MODEL_PATH;
use crate::workload::{
    build_evaluation_workload, build_sdg_workload, build_training_workload, EvaluationKind,
    EvaluationSpec, SdgSpec, TrainingPhase, TrainingSpec, Workload,
};

use super::config::{ConfigError, PipelineConfig};
use super::context::{RunContext, Stage};
use super::scores::{parse_scores, select_best, ScoreRecord, StageResult};

/// Errors that can occur while running the pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Workload descriptor could not be built.
    #[error("Descriptor error: {0}")]
    Descriptor(#[from] DescriptorError),

    /// Cluster operation failed.
    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    /// Evaluation output could not be used.
    #[error("Score error: {0}")]
    Scores(#[from] ScoreError),
}

/// Drives pipeline stages against a cluster.
pub struct PipelineOrchestrator {
    config: PipelineConfig,
    cluster: Arc<dyn ClusterApi>,
}

impl PipelineOrchestrator {
    /// Creates an orchestrator after validating `config`.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::Config` if the configuration is invalid.
    pub fn new(config: PipelineConfig, cluster: Arc<dyn ClusterApi>) -> Result<Self, PipelineError> {
        config.validate()?;
        Ok(Self { config, cluster })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// A fresh context for single-stage commands, positioned at the
    /// configured training phase.
    pub fn new_context(&self) -> RunContext {
        let mut ctx = RunContext::new(&self.config.namespace);
        ctx.phase = self.config.training_phase;
        ctx
    }

    fn namespace(&self) -> &str {
        &self.config.namespace
    }

    async fn run_workload(&self, workload: &Workload) -> Result<WorkloadOutput, ClusterError> {
        let cluster = self.cluster.as_ref();
        submit(cluster, self.namespace(), workload).await?;
        wait_for_completion(cluster, self.namespace(), workload, self.config.watch_timeout).await
    }

    fn sdg_spec(&self) -> SdgSpec {
        let spec = SdgSpec::new(self.config.taxonomy_repo_url.clone())
            .with_base_model(self.config.base_model.clone())
            .with_num_instructions(self.config.num_instructions_to_generate);
        SdgSpec {
            repo_branch: self.config.taxonomy_repo_branch.clone(),
            repo_pr: self.config.taxonomy_repo_pr,
            ..spec
        }
    }

    /// Provisions storage and serving configuration, then runs SDG.
    ///
    /// # Errors
    ///
    /// Missing SDG inputs are reported before anything is created.
    pub async fn run_sdg(&self, ctx: &mut RunContext) -> Result<StageResult, PipelineError> {
        let started_at = Utc::now();
        let serving = self.config.require_sdg()?;
        let descriptor = build_sdg_workload(&self.sdg_spec(), &self.config.images)?;

        info!(namespace = self.namespace(), stage = %Stage::Sdg, "Starting stage");
        let cluster = self.cluster.as_ref();
        ensure_volume_claims(cluster, self.namespace(), &self.config.storage_class).await?;
        ensure_sdg_config(cluster, self.namespace(), serving).await?;

        let output = self.run_workload(&Workload::Batch(descriptor)).await?;
        ctx.record(Stage::Sdg, started_at);

        Ok(StageResult {
            stage: Stage::Sdg.to_string(),
            logs: output.logs,
            scores: Vec::new(),
        })
    }

    /// Resolves the model a training phase starts from.
    ///
    /// Phase 1 starts from `model_to_train` or the imported base model.
    /// Phase 2 starts from the model selected after phase 1, falling back to
    /// `model_to_train`.
    fn training_input(&self, ctx: &RunContext, phase: TrainingPhase) -> Result<String, ConfigError> {
        match phase {
            TrainingPhase::First => Ok(self
                .config
                .model_to_train
                .clone()
                .unwrap_or_else(|| DEFAULT_MODEL_PATH.to_string())),
            TrainingPhase::Second => ctx
                .selected_model
                .clone()
                .or_else(|| self.config.model_to_train.clone())
                .ok_or_else(|| ConfigError::MissingParameter("model-to-train".to_string())),
        }
    }

    /// Runs one training phase as a PyTorchJob.
    pub async fn run_training(
        &self,
        ctx: &mut RunContext,
        phase: TrainingPhase,
    ) -> Result<StageResult, PipelineError> {
        let started_at = Utc::now();
        let stage = Stage::Train(phase);
        let model_path = self.training_input(ctx, phase)?;
        let spec = TrainingSpec::new(phase)
            .with_model_path(model_path.clone())
            .with_nodes(self.config.nnodes, self.config.nproc_per_node);
        let descriptor = build_training_workload(&spec, &self.config.images)?;

        info!(
            namespace = self.namespace(),
            stage = %stage,
            model = %model_path,
            nnodes = self.config.nnodes,
            nproc_per_node = self.config.nproc_per_node,
            "Starting stage"
        );
        ensure_volume_claims(
            self.cluster.as_ref(),
            self.namespace(),
            &self.config.storage_class,
        )
        .await?;

        let output = self.run_workload(&Workload::Distributed(descriptor)).await?;
        ctx.phase = phase;
        ctx.record(stage, started_at);

        Ok(StageResult {
            stage: stage.to_string(),
            logs: output.logs,
            scores: Vec::new(),
        })
    }

    /// Evaluates the checkpoints of the context's current phase.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::Scores` if the evaluation output cannot be
    /// parsed; the context is left unchanged in that case.
    pub async fn run_evaluation(
        &self,
        ctx: &mut RunContext,
        kind: EvaluationKind,
    ) -> Result<StageResult, PipelineError> {
        let started_at = Utc::now();
        let stage = Stage::Evaluate(kind);
        let spec = EvaluationSpec {
            mmlu: self.config.mmlu.clone(),
            mt_bench: self.config.mt_bench.clone(),
            ..EvaluationSpec::new(kind, ctx.phase.models_folder())
        };
        let descriptor = build_evaluation_workload(&spec, &self.config.images)?;

        info!(
            namespace = self.namespace(),
            stage = %stage,
            models_folder = %spec.models_folder,
            "Starting stage"
        );
        if kind == EvaluationKind::MtBench {
            match &self.config.judge_serving {
                Some(judge) => {
                    ensure_judge_config(self.cluster.as_ref(), self.namespace(), judge).await?
                }
                None => warn!(
                    namespace = self.namespace(),
                    "No judge endpoint configured, expecting an existing judge-server ConfigMap and Secret"
                ),
            }
        }

        let output = self.run_workload(&Workload::Batch(descriptor)).await?;
        let scores = parse_scores(&output.logs)?;
        info!(stage = %stage, candidates = scores.len(), "Parsed evaluation scores");

        ctx.last_scores = scores.clone();
        ctx.record(stage, started_at);

        Ok(StageResult {
            stage: stage.to_string(),
            logs: output.logs,
            scores,
        })
    }

    /// Selects the best model from the last evaluation and records it as the
    /// next training input.
    pub fn select_best_model(&self, ctx: &mut RunContext) -> Result<ScoreRecord, PipelineError> {
        let started_at = Utc::now();
        let best = select_best(&ctx.last_scores)
            .cloned()
            .ok_or(ScoreError::Empty)?;

        info!(model = %best.model, score = best.average_score, "Selected best model");
        ctx.selected_model = Some(best.model.clone());
        ctx.selected_score = Some(best.average_score);
        ctx.record(Stage::SelectBestModel, started_at);
        Ok(best)
    }

    /// Transition function of the state machine.
    pub fn next_stage(&self, current: Stage, ctx: &RunContext) -> Stage {
        match current {
            Stage::Sdg => Stage::Train(TrainingPhase::First),
            Stage::Train(TrainingPhase::First) => Stage::Evaluate(EvaluationKind::Mmlu),
            Stage::Train(TrainingPhase::Second) => Stage::Evaluate(EvaluationKind::MtBench),
            Stage::Evaluate(_) => Stage::SelectBestModel,
            Stage::SelectBestModel
                if self.config.run_second_phase && ctx.phase == TrainingPhase::First =>
            {
                Stage::Train(TrainingPhase::Second)
            }
            Stage::SelectBestModel | Stage::Done => Stage::Done,
        }
    }

    /// Runs the whole pipeline and returns the final context.
    ///
    /// # Errors
    ///
    /// The first stage failure aborts the run. Missing SDG inputs are
    /// reported before any cluster call.
    pub async fn run_full(&self) -> Result<RunContext, PipelineError> {
        self.config.require_sdg()?;

        let mut ctx = RunContext::new(self.namespace());
        let mut stage = Stage::Sdg;
        info!(
            namespace = self.namespace(),
            second_phase = self.config.run_second_phase,
            "Starting full pipeline run"
        );

        loop {
            match stage {
                Stage::Sdg => {
                    self.run_sdg(&mut ctx).await?;
                }
                Stage::Train(phase) => {
                    self.run_training(&mut ctx, phase).await?;
                }
                Stage::Evaluate(kind) => {
                    self.run_evaluation(&mut ctx, kind).await?;
                }
                Stage::SelectBestModel => {
                    self.select_best_model(&mut ctx)?;
                }
                Stage::Done => break,
            }
            stage = self.next_stage(stage, &ctx);
        }

        info!(
            model = ctx.selected_model.as_deref().unwrap_or("<none>"),
            score = ctx.selected_score.unwrap_or_default(),
            stages = ctx.history.len(),
            "Pipeline finished"
        );
        Ok(ctx)
    }
}
