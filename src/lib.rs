//! ilab-standalone: drives the InstructLab pipeline on Kubernetes.
//!
//! This library builds workload descriptors for synthetic data generation,
//! distributed training and evaluation, submits them to a cluster, waits
//! for them to finish and threads the best model from one stage into the
//! next.

// Core modules
pub mod cli;
pub mod cluster;
pub mod error;
pub mod pipeline;
pub mod workload;

// Re-export commonly used error types
pub use error::{ClusterError, DescriptorError, ScoreError};
