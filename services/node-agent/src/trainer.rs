//! Deterministic stand-in for the real local training process.
//!
//! The actual model lives outside this system; the agent only needs
//! something that honors the `LocalTrainer` contract so the grid can run
//! end to end. Each node pulls the received vector toward a node-specific
//! target, which makes convergence across rounds observable without any
//! real dataset on disk.

use anyhow::Result;
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use fedgrid_core::{EvalOutput, FitOutput, LocalTrainer, ParameterVector};

const LEARNING_RATE: f32 = 0.5;

pub struct SyntheticTrainer {
    seed: u64,
    example_count: u64,
}

impl SyntheticTrainer {
    pub fn new(node_id: &str) -> Self {
        // stable per-node seed so reconnects train the same "dataset"
        let seed = node_id
            .bytes()
            .fold(0xcbf29ce484222325u64, |h, b| {
                (h ^ b as u64).wrapping_mul(0x100000001b3)
            });
        let mut rng = StdRng::seed_from_u64(seed);
        let example_count = rng.gen_range(64..512);
        Self {
            seed,
            example_count,
        }
    }

    fn target_for(&self, shape: &[usize]) -> Vec<Vec<f32>> {
        let mut rng = StdRng::seed_from_u64(self.seed);
        shape
            .iter()
            .map(|&n| (0..n).map(|_| rng.gen_range(-1.0..1.0)).collect())
            .collect()
    }

    fn distance(current: &ParameterVector, target: &[Vec<f32>]) -> f64 {
        let mut sum = 0.0f64;
        let mut count = 0usize;
        for (layer, target_layer) in current.layers().iter().zip(target) {
            for (v, t) in layer.iter().zip(target_layer) {
                let d = (*v - *t) as f64;
                sum += d * d;
                count += 1;
            }
        }
        if count == 0 {
            0.0
        } else {
            sum / count as f64
        }
    }
}

#[async_trait]
impl LocalTrainer for SyntheticTrainer {
    async fn fit(&self, global: &ParameterVector) -> Result<FitOutput> {
        let target = self.target_for(&global.shape());
        let layers = global
            .layers()
            .iter()
            .zip(&target)
            .map(|(layer, target_layer)| {
                layer
                    .iter()
                    .zip(target_layer)
                    .map(|(v, t)| v + LEARNING_RATE * (t - v))
                    .collect()
            })
            .collect();
        let updated = ParameterVector::new(layers);
        let loss = Self::distance(&updated, &target);
        Ok(FitOutput {
            vector: updated,
            example_count: self.example_count,
            loss,
        })
    }

    async fn evaluate(&self, global: &ParameterVector) -> Result<EvalOutput> {
        let target = self.target_for(&global.shape());
        let loss = Self::distance(global, &target);
        Ok(EvalOutput {
            example_count: self.example_count,
            loss,
            accuracy: 1.0 / (1.0 + loss),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fit_preserves_shape_and_moves_toward_target() {
        let trainer = SyntheticTrainer::new("node-1");
        let global = ParameterVector::zeros(&[8, 4]);
        let first = trainer.fit(&global).await.unwrap();
        assert_eq!(first.vector.shape(), global.shape());
        assert!(first.example_count >= 1);
        let second = trainer.fit(&first.vector).await.unwrap();
        assert!(second.loss <= first.loss, "repeated fit must not diverge");
    }

    #[tokio::test]
    async fn evaluate_reports_bounded_accuracy() {
        let trainer = SyntheticTrainer::new("node-2");
        let out = trainer
            .evaluate(&ParameterVector::zeros(&[8]))
            .await
            .unwrap();
        assert!((0.0..=1.0).contains(&out.accuracy));
    }

    #[tokio::test]
    async fn same_node_id_trains_identically() {
        let a = SyntheticTrainer::new("twin");
        let b = SyntheticTrainer::new("twin");
        let global = ParameterVector::zeros(&[4]);
        let out_a = a.fit(&global).await.unwrap();
        let out_b = b.fit(&global).await.unwrap();
        assert_eq!(out_a.vector, out_b.vector);
    }
}
