//! Pipeline orchestration.
//!
//! # Architecture
//!
//! - **Config**: immutable inputs of a run ([`PipelineConfig`])
//! - **Context**: state carried between stages ([`RunContext`])
//! - **Scores**: evaluation output parsing and best-model selection
//! - **Orchestrator**: the stage state machine ([`PipelineOrchestrator`])
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use ilab_standalone::cluster::{KubeCluster, ServingEndpoint};
//! use ilab_standalone::pipeline::{PipelineConfig, PipelineOrchestrator};
//!
//! let config = PipelineConfig::new()
//!     .with_namespace("ilab")
//!     .with_taxonomy_branch("main")
//!     .with_sdg_serving(ServingEndpoint::new("http://vllm:8000/v1", "mixtral", api_key));
//!
//! let cluster = Arc::new(KubeCluster::connect().await?);
//! let orchestrator = PipelineOrchestrator::new(config, cluster)?;
//! let ctx = orchestrator.run_full().await?;
//!
//! println!("Best model: {:?} ({:?})", ctx.selected_model, ctx.selected_score);
//! ```

pub mod config;
pub mod context;
pub mod orchestrator;
pub mod scores;

pub use config::{ConfigError, PipelineConfig};
pub use context::{RunContext, Stage, StageRecord};
pub use orchestrator::{PipelineError, PipelineOrchestrator};
pub use scores::{parse_scores, select_best, ScoreRecord, StageResult};
