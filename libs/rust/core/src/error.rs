use thiserror::Error;

/// Error taxonomy for the federation protocol.
///
/// Only `Config` and `Audit` are fatal to a process; everything else is
/// recovered locally (dropped contribution, aborted round, or agent retry).
#[derive(Debug, Error)]
pub enum FedError {
    #[error("parameter shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("no usable results received this round")]
    InsufficientResults,

    #[error("stale round result: current round {current}, got {got}")]
    StaleRound { current: u64, got: u64 },

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("audit log failure: {0}")]
    Audit(String),
}

impl FedError {
    pub fn transport(err: impl std::fmt::Display) -> Self {
        FedError::Transport(err.to_string())
    }
}

impl From<std::io::Error> for FedError {
    fn from(err: std::io::Error) -> Self {
        FedError::Audit(err.to_string())
    }
}

impl From<csv::Error> for FedError {
    fn from(err: csv::Error) -> Self {
        FedError::Audit(err.to_string())
    }
}
