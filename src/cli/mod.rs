//! Command-line interface for ilab-standalone.
//!
//! Provides the full pipeline run and the single-stage `sdg`, `train` and
//! `evaluation` commands.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands, PipelineArgs};
