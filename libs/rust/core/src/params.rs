//! Layered model parameters exchanged between coordinator and nodes.

use serde::{Deserialize, Serialize};

use crate::error::FedError;

/// Ordered collection of flat per-layer weight arrays.
///
/// The shape (number of layers and per-layer length) is fixed once at
/// session start; every vector exchanged afterwards must match it. A vector
/// is never mutated in place — each round produces a new one that supersedes
/// the previous global copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterVector {
    layers: Vec<Vec<f32>>,
}

impl ParameterVector {
    pub fn new(layers: Vec<Vec<f32>>) -> Self {
        Self { layers }
    }

    /// All-zero vector with the given per-layer lengths.
    pub fn zeros(layer_sizes: &[usize]) -> Self {
        Self {
            layers: layer_sizes.iter().map(|&n| vec![0.0f32; n]).collect(),
        }
    }

    pub fn layers(&self) -> &[Vec<f32>] {
        &self.layers
    }

    pub fn shape(&self) -> Vec<usize> {
        self.layers.iter().map(Vec::len).collect()
    }

    pub fn check_shape(&self, expected: &[usize]) -> Result<(), FedError> {
        let got = self.shape();
        if got != expected {
            return Err(FedError::ShapeMismatch {
                expected: expected.to_vec(),
                got,
            });
        }
        Ok(())
    }
}
