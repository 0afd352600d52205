//! Mutable per-run state threaded through the stages.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::workload::{EvaluationKind, TrainingPhase};

use super::scores::ScoreRecord;

/// A state of the pipeline state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Sdg,
    Train(TrainingPhase),
    Evaluate(EvaluationKind),
    SelectBestModel,
    Done,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Sdg => write!(f, "sdg"),
            Stage::Train(phase) => write!(f, "train ({phase})"),
            Stage::Evaluate(kind) => write!(f, "evaluate ({kind})"),
            Stage::SelectBestModel => write!(f, "select best model"),
            Stage::Done => write!(f, "done"),
        }
    }
}

/// A completed stage.
#[derive(Debug, Clone, Serialize)]
pub struct StageRecord {
    pub stage: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// State carried from one stage to the next.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub namespace: String,
    /// Phase of the most recent or upcoming training stage.
    pub phase: TrainingPhase,
    /// Model chosen by the last selection, as a path inside the pods.
    pub selected_model: Option<String>,
    pub selected_score: Option<f64>,
    /// Scores parsed from the last evaluation.
    pub last_scores: Vec<ScoreRecord>,
    pub history: Vec<StageRecord>,
}

impl RunContext {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            phase: TrainingPhase::First,
            selected_model: None,
            selected_score: None,
            last_scores: Vec::new(),
            history: Vec::new(),
        }
    }

    /// Records a finished stage.
    pub fn record(&mut self, stage: Stage, started_at: DateTime<Utc>) {
        self.history.push(StageRecord {
            stage: stage.to_string(),
            started_at,
            finished_at: Utc::now(),
        });
    }

    /// Names of the completed stages, in order.
    pub fn completed_stages(&self) -> Vec<&str> {
        self.history.iter().map(|r| r.stage.as_str()).collect()
    }
}
