//! Error types for pipeline driver operations.
//!
//! Defines error types for the subsystems the driver talks to:
//! - Workload descriptor construction
//! - Kubernetes API calls, watches and log retrieval
//! - Evaluation score parsing

use thiserror::Error;

use crate::workload::WorkloadKind;

/// Errors that can occur while building workload descriptors.
#[derive(Debug, Error)]
pub enum DescriptorError {
    #[error("Taxonomy source needs either a branch or a pull request number")]
    MissingTaxonomyRef,

    #[error("Taxonomy branch '{branch}' and pull request #{pr} are mutually exclusive")]
    ConflictingTaxonomyRef { branch: String, pr: u32 },

    #[error("Taxonomy repository URL cannot be empty")]
    EmptyRepoUrl,

    #[error("Workload '{0}' has no steps")]
    EmptyWorkload(String),

    #[error("Node count must be at least 1, got {0}")]
    InvalidNodeCount(u32),

    #[error("Processes per node must be at least 1, got {0}")]
    InvalidProcessCount(u32),

    #[error("Invalid value for '{key}': {message}")]
    InvalidValue { key: String, message: String },
}

/// Errors that can occur during cluster operations.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("{kind} '{name}' already exists")]
    AlreadyExists { kind: String, name: String },

    #[error("Container '{container}' in pod '{pod}' has not started yet")]
    ContainerNotStarted { pod: String, container: String },

    #[error("Kubernetes API error ({code}) on {kind} '{name}': {message}")]
    Api {
        kind: String,
        name: String,
        code: u16,
        message: String,
    },

    #[error("Kubernetes request failed: {0}")]
    Request(String),

    #[error("Failed to connect to cluster: {0}")]
    Connection(String),

    #[error("Watch error: {0}")]
    Watch(String),

    #[error("Watch stream for {kind} '{name}' closed before a terminal state")]
    WatchClosed { kind: WorkloadKind, name: String },

    #[error("Timed out after {seconds} seconds waiting for {kind} '{name}'")]
    WatchTimeout {
        kind: WorkloadKind,
        name: String,
        seconds: u64,
    },

    #[error("{kind} '{name}' failed: {reason}")]
    WorkloadFailed {
        kind: WorkloadKind,
        name: String,
        reason: String,
    },

    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl ClusterError {
    /// Returns true for the benign "object already exists" response.
    pub fn is_conflict(&self) -> bool {
        matches!(self, ClusterError::AlreadyExists { .. })
    }

    /// Returns true when a log read was refused because the container is not running yet.
    pub fn is_not_started(&self) -> bool {
        matches!(self, ClusterError::ContainerNotStarted { .. })
    }
}

/// Errors that can occur while parsing evaluation output.
#[derive(Debug, Error)]
pub enum ScoreError {
    #[error("Malformed evaluation output: {reason}")]
    Malformed { reason: String },

    #[error("Evaluation output contained no scores")]
    Empty,
}
