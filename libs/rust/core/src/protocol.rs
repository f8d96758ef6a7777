//! Wire contract between coordinator and node agents.
//!
//! Messages travel as JSON over bus subjects; the protocol is message
//! oriented and transport agnostic beyond that. Subjects are versioned
//! under a configurable prefix so grids can share a bus.

use serde::{Deserialize, Serialize};

use crate::params::ParameterVector;

/// Coordinator -> agents: start local training for `round`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundBroadcast {
    pub round: u64,
    pub vector: ParameterVector,
}

/// Agent -> coordinator: locally trained update for `round`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitResult {
    pub node_id: String,
    pub round: u64,
    pub vector: ParameterVector,
    pub example_count: u64,
    pub loss: f64,
}

/// Coordinator -> agents: evaluate the freshly aggregated vector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluateRequest {
    pub round: u64,
    pub vector: ParameterVector,
}

/// Agent -> coordinator: evaluation outcome for `round`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluateResult {
    pub node_id: String,
    pub round: u64,
    pub example_count: u64,
    pub loss: f64,
    pub accuracy: f64,
}

/// Agent -> coordinator: membership announcement, repeated as keepalive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Register {
    pub node_id: String,
}

/// Either direction: the sender is leaving the session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Disconnect {
    pub node_id: String,
}

pub mod subjects {
    pub const DEFAULT_PREFIX: &str = "fedgrid.v1";

    pub fn round_fit(prefix: &str) -> String {
        format!("{prefix}.round.fit")
    }

    pub fn round_evaluate(prefix: &str) -> String {
        format!("{prefix}.round.evaluate")
    }

    pub fn result_fit(prefix: &str) -> String {
        format!("{prefix}.result.fit")
    }

    pub fn result_evaluate(prefix: &str) -> String {
        format!("{prefix}.result.evaluate")
    }

    pub fn node_hello(prefix: &str) -> String {
        format!("{prefix}.node.hello")
    }

    pub fn node_disconnect(prefix: &str) -> String {
        format!("{prefix}.node.disconnect")
    }
}
