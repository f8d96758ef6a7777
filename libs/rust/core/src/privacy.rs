//! Weight obfuscation applied to outgoing fit results.
//!
//! Additive zero-mean Gaussian noise only. This is deliberate information
//! loss, not a calibrated differential-privacy mechanism: there is no
//! sensitivity clipping and no accounting across rounds.

use rand::thread_rng;
use rand_distr::{Distribution, Normal};

use crate::params::ParameterVector;

/// Perturb every coordinate independently with N(0, sigma^2).
///
/// `sigma <= 0` disables the transform and returns the vector unchanged.
/// Evaluation traffic must never pass through here; only fit payloads are
/// obfuscated before leaving a node.
pub fn obfuscate(vector: &ParameterVector, sigma: f64) -> ParameterVector {
    if sigma <= 0.0 {
        return vector.clone();
    }
    let normal = match Normal::new(0.0f32, sigma as f32) {
        Ok(n) => n,
        Err(_) => return vector.clone(),
    };
    let mut rng = thread_rng();
    let layers = vector
        .layers()
        .iter()
        .map(|layer| layer.iter().map(|v| v + normal.sample(&mut rng)).collect())
        .collect();
    ParameterVector::new(layers)
}
