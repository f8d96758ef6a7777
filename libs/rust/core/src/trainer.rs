//! Boundary interface to the local training capability.
//!
//! The model representation and its optimization math live outside this
//! system. An agent only needs the two operations below: consume a global
//! vector and return an updated one with an example count, or score a
//! vector against the local dataset.

use anyhow::Result;
use async_trait::async_trait;

use crate::params::ParameterVector;

#[derive(Debug, Clone)]
pub struct FitOutput {
    pub vector: ParameterVector,
    /// Number of local examples trained on; the aggregation weight.
    /// Must be at least 1 for the result to count.
    pub example_count: u64,
    pub loss: f64,
}

#[derive(Debug, Clone)]
pub struct EvalOutput {
    pub example_count: u64,
    pub loss: f64,
    /// Fraction of correctly classified examples, in [0, 1].
    pub accuracy: f64,
}

#[async_trait]
pub trait LocalTrainer: Send + Sync {
    /// Run local optimization starting from `global` and return the
    /// updated parameters.
    async fn fit(&self, global: &ParameterVector) -> Result<FitOutput>;

    /// Score `global` against the local holdout data.
    async fn evaluate(&self, global: &ParameterVector) -> Result<EvalOutput>;
}
