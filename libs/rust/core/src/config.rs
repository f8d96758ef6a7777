//! Runtime configuration shared by the coordinator and node agents.
//!
//! Values resolve in layers: built-in defaults, then an optional YAML file
//! named by `FEDGRID_CONFIG_FILE`, then `FEDGRID_`-prefixed environment
//! variables. Validation failures here are the only fatal startup errors.

use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::aggregation::AggregationStrategy;
use crate::error::FedError;
use crate::protocol::subjects;

#[derive(Debug, Clone, Deserialize)]
pub struct FedConfig {
    /// Bus address the coordinator and agents meet on.
    pub server_address: String,
    pub subject_prefix: String,
    /// Total rounds for the session.
    pub rounds: u64,
    pub min_fit_clients: usize,
    pub min_evaluate_clients: usize,
    /// Registered nodes required before the first round starts.
    pub min_available_clients: usize,
    /// `weighted-mean` or `coordinate-median`.
    pub aggregation_strategy: String,
    pub privacy_sigma: f64,
    pub round_deadline_secs: u64,
    pub retry_backoff_secs: u64,
    pub hello_interval_secs: u64,
    /// Nodes silent longer than this are swept from the registry.
    pub stale_after_secs: u64,
    pub audit_log_path: String,
    /// Comma-separated per-layer flat lengths of the session's parameter
    /// vector, e.g. `"64,16,128,8,16,2"`. The round-one global vector is
    /// zero-initialized with this shape.
    pub layer_sizes: String,
}

impl FedConfig {
    pub fn load() -> Result<Self, FedError> {
        let mut builder = config::Config::builder()
            .set_default("server_address", "127.0.0.1:4222")
            .map_err(config_err)?
            .set_default("subject_prefix", subjects::DEFAULT_PREFIX)
            .map_err(config_err)?
            .set_default("rounds", 5i64)
            .map_err(config_err)?
            .set_default("min_fit_clients", 2i64)
            .map_err(config_err)?
            .set_default("min_evaluate_clients", 2i64)
            .map_err(config_err)?
            .set_default("min_available_clients", 2i64)
            .map_err(config_err)?
            .set_default("aggregation_strategy", "weighted-mean")
            .map_err(config_err)?
            .set_default("privacy_sigma", 0.01f64)
            .map_err(config_err)?
            .set_default("round_deadline_secs", 30i64)
            .map_err(config_err)?
            .set_default("retry_backoff_secs", 5i64)
            .map_err(config_err)?
            .set_default("hello_interval_secs", 15i64)
            .map_err(config_err)?
            .set_default("stale_after_secs", 60i64)
            .map_err(config_err)?
            .set_default("audit_log_path", "logs/audit_log.csv")
            .map_err(config_err)?
            // reference classifier: three dense layers, weights then biases
            .set_default("layer_sizes", "64,16,128,8,16,2")
            .map_err(config_err)?;
        if let Ok(file) = std::env::var("FEDGRID_CONFIG_FILE") {
            builder = builder.add_source(config::File::with_name(&file).required(false));
        }
        builder = builder.add_source(config::Environment::with_prefix("FEDGRID").separator("__"));
        let cfg: FedConfig = builder
            .build()
            .map_err(config_err)?
            .try_deserialize()
            .map_err(config_err)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), FedError> {
        if self.rounds == 0 {
            return Err(FedError::Config("rounds must be at least 1".into()));
        }
        if self.min_fit_clients == 0 || self.min_evaluate_clients == 0 {
            return Err(FedError::Config(
                "quorum sizes must be at least 1".into(),
            ));
        }
        if self.min_fit_clients > self.min_available_clients {
            return Err(FedError::Config(format!(
                "min_fit_clients ({}) exceeds min_available_clients ({})",
                self.min_fit_clients, self.min_available_clients
            )));
        }
        if self.min_evaluate_clients > self.min_available_clients {
            return Err(FedError::Config(format!(
                "min_evaluate_clients ({}) exceeds min_available_clients ({})",
                self.min_evaluate_clients, self.min_available_clients
            )));
        }
        if self.round_deadline_secs == 0
            || self.retry_backoff_secs == 0
            || self.hello_interval_secs == 0
            || self.stale_after_secs == 0
        {
            return Err(FedError::Config(
                "deadline, backoff, hello, and stale intervals must be non-zero".into(),
            ));
        }
        self.layer_shape()?;
        self.strategy()?;
        Ok(())
    }

    pub fn strategy(&self) -> Result<AggregationStrategy, FedError> {
        AggregationStrategy::from_str(&self.aggregation_strategy)
    }

    /// Parsed `layer_sizes`, validated non-empty with no zero-length layer.
    pub fn layer_shape(&self) -> Result<Vec<usize>, FedError> {
        let shape: Vec<usize> = self
            .layer_sizes
            .split(',')
            .map(|s| {
                s.trim().parse::<usize>().map_err(|_| {
                    FedError::Config(format!("bad layer size '{}' in layer_sizes", s.trim()))
                })
            })
            .collect::<Result<_, _>>()?;
        if shape.is_empty() || shape.contains(&0) {
            return Err(FedError::Config(
                "layer_sizes must name at least one non-empty layer".into(),
            ));
        }
        Ok(shape)
    }

    pub fn round_deadline(&self) -> Duration {
        Duration::from_secs(self.round_deadline_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_secs(self.retry_backoff_secs)
    }

    pub fn hello_interval(&self) -> Duration {
        Duration::from_secs(self.hello_interval_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

fn config_err(err: config::ConfigError) -> FedError {
    FedError::Config(err.to_string())
}
