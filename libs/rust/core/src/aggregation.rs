//! Aggregation strategies combining per-node updates into one global vector.
//!
//! Weighted mean is the efficient baseline; a single adversarial outlier can
//! dominate it. The coordinate-wise median ignores weights and keeps every
//! coordinate within the honest contributors' range as long as strictly
//! fewer than half of the contributors are adversarial at that coordinate.

use std::str::FromStr;

use tracing::warn;

use crate::error::FedError;
use crate::params::ParameterVector;

/// One node's contribution to a round: its updated vector plus the example
/// count used as the aggregation weight.
#[derive(Debug, Clone)]
pub struct Contribution {
    pub node_id: String,
    pub vector: ParameterVector,
    pub weight: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregationStrategy {
    WeightedMean,
    CoordinateMedian,
}

impl FromStr for AggregationStrategy {
    type Err = FedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "weighted-mean" => Ok(AggregationStrategy::WeightedMean),
            "coordinate-median" => Ok(AggregationStrategy::CoordinateMedian),
            other => Err(FedError::Config(format!(
                "unknown aggregation strategy '{other}'"
            ))),
        }
    }
}

impl AggregationStrategy {
    /// Combine contributions into the next global vector.
    ///
    /// Contributions whose shape disagrees with the first-seen shape are
    /// excluded with a warning; the round proceeds on the rest. Fails only
    /// when nothing usable remains. Result does not depend on input order.
    pub fn aggregate(&self, contributions: &[Contribution]) -> Result<ParameterVector, FedError> {
        let mut usable: Vec<&Contribution> = Vec::with_capacity(contributions.len());
        let mut reference: Option<Vec<usize>> = None;
        for c in contributions {
            match &reference {
                None => {
                    reference = Some(c.vector.shape());
                    usable.push(c);
                }
                Some(shape) => match c.vector.check_shape(shape) {
                    Ok(()) => usable.push(c),
                    Err(err) => {
                        warn!(node_id = %c.node_id, error = %err, "contribution excluded from aggregation");
                    }
                },
            }
        }
        if usable.is_empty() {
            return Err(FedError::InsufficientResults);
        }
        let aggregated = match self {
            AggregationStrategy::WeightedMean => weighted_mean(&usable),
            AggregationStrategy::CoordinateMedian => coordinate_median(&usable),
        };
        Ok(aggregated)
    }
}

fn weighted_mean(contributions: &[&Contribution]) -> ParameterVector {
    let total_weight: f64 = contributions.iter().map(|c| c.weight as f64).sum();
    let layer_sizes: Vec<usize> = contributions[0].vector.shape();
    let mut layers: Vec<Vec<f32>> = Vec::with_capacity(layer_sizes.len());
    for (layer_idx, size) in layer_sizes.iter().enumerate() {
        // accumulate in f64 to keep many small weighted terms stable
        let mut acc = vec![0.0f64; *size];
        for c in contributions {
            let w = c.weight as f64;
            for (i, v) in c.vector.layers()[layer_idx].iter().enumerate() {
                acc[i] += *v as f64 * w;
            }
        }
        layers.push(acc.into_iter().map(|v| (v / total_weight) as f32).collect());
    }
    ParameterVector::new(layers)
}

fn coordinate_median(contributions: &[&Contribution]) -> ParameterVector {
    let layer_sizes: Vec<usize> = contributions[0].vector.shape();
    let mut layers: Vec<Vec<f32>> = Vec::with_capacity(layer_sizes.len());
    let mut column: Vec<f32> = Vec::with_capacity(contributions.len());
    for (layer_idx, size) in layer_sizes.iter().enumerate() {
        let mut out = Vec::with_capacity(*size);
        for i in 0..*size {
            column.clear();
            column.extend(contributions.iter().map(|c| c.vector.layers()[layer_idx][i]));
            column.sort_by(f32::total_cmp);
            let mid = column.len() / 2;
            let median = if column.len() % 2 == 0 {
                (column[mid - 1] + column[mid]) / 2.0
            } else {
                column[mid]
            };
            out.push(median);
        }
        layers.push(out);
    }
    ParameterVector::new(layers)
}
