//! Coordinator round state machine.
//!
//! One engine drives the whole session:
//! `Idle -> AwaitingFit -> Aggregating -> AwaitingEvaluate -> Logging ->
//! (next round | Terminated)`. The global vector, the round counter, and
//! the per-round result buffers are the only coordinator-wide mutable
//! state, all behind a single mutex. Quorum waiters park on a `Notify`
//! and are woken by submissions and by shutdown; submissions never block
//! on waiters.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::aggregation::{AggregationStrategy, Contribution};
use crate::error::FedError;
use crate::params::ParameterVector;
use crate::protocol::{EvaluateResult, FitResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundPhase {
    Idle,
    AwaitingFit,
    Aggregating,
    AwaitingEvaluate,
    Logging,
    Terminated,
}

/// Outcome of handing a node result to the engine. Everything except
/// `Accepted` leaves the quorum count untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    Accepted,
    StaleRound,
    Duplicate,
    ShapeMismatch,
    InvalidWeight,
}

#[derive(Debug, Clone)]
pub struct RoundSummary {
    pub round: u64,
    /// Unweighted mean of the received accuracies. Fit aggregation weights
    /// by example count; evaluation intentionally trusts every node
    /// equally. Do not "fix" the asymmetry.
    pub mean_accuracy: f64,
    pub evaluators: usize,
}

struct Inner {
    phase: RoundPhase,
    round: u64,
    global: ParameterVector,
    fit: HashMap<String, Contribution>,
    evaluations: HashMap<String, EvaluateResult>,
    shutdown: bool,
}

pub struct RoundEngine {
    strategy: AggregationStrategy,
    total_rounds: u64,
    session_shape: Vec<usize>,
    inner: Mutex<Inner>,
    progress: Notify,
}

impl RoundEngine {
    /// `starting_round` is 1 for a fresh session, or `last_round + 1` when
    /// resuming from the audit log.
    pub fn new(
        strategy: AggregationStrategy,
        initial: ParameterVector,
        total_rounds: u64,
        starting_round: u64,
    ) -> Self {
        let phase = if starting_round > total_rounds {
            RoundPhase::Terminated
        } else {
            RoundPhase::Idle
        };
        Self {
            strategy,
            total_rounds,
            session_shape: initial.shape(),
            inner: Mutex::new(Inner {
                phase,
                round: starting_round,
                global: initial,
                fit: HashMap::new(),
                evaluations: HashMap::new(),
                shutdown: false,
            }),
            progress: Notify::new(),
        }
    }

    pub fn phase(&self) -> RoundPhase {
        self.inner.lock().phase
    }

    pub fn current_round(&self) -> u64 {
        self.inner.lock().round
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.lock().shutdown
    }

    /// Snapshot of the authoritative global vector.
    pub fn global_vector(&self) -> ParameterVector {
        self.inner.lock().global.clone()
    }

    /// Node ids that contributed a usable fit result this round.
    pub fn fit_contributors(&self) -> Vec<String> {
        self.inner.lock().fit.keys().cloned().collect()
    }

    /// Open the next round: clear buffers and hand back what to broadcast.
    /// Returns `None` once the session is terminated or shut down.
    pub fn begin_round(&self) -> Option<(u64, ParameterVector)> {
        let mut inner = self.inner.lock();
        if inner.shutdown || inner.phase == RoundPhase::Terminated {
            return None;
        }
        inner.phase = RoundPhase::AwaitingFit;
        inner.fit.clear();
        inner.evaluations.clear();
        Some((inner.round, inner.global.clone()))
    }

    /// Record one node's fit result. First result per node wins; a
    /// reconnecting node therefore contributes exactly once per round.
    pub fn submit_fit(&self, result: FitResult) -> Submission {
        let mut inner = self.inner.lock();
        if inner.phase != RoundPhase::AwaitingFit || result.round != inner.round {
            let err = FedError::StaleRound {
                current: inner.round,
                got: result.round,
            };
            debug!(node_id = %result.node_id, error = %err, "fit result discarded");
            return Submission::StaleRound;
        }
        if result.example_count == 0 {
            warn!(node_id = %result.node_id, "fit result with zero examples rejected");
            return Submission::InvalidWeight;
        }
        if let Err(err) = result.vector.check_shape(&self.session_shape) {
            warn!(node_id = %result.node_id, error = %err, "fit result rejected");
            return Submission::ShapeMismatch;
        }
        if inner.fit.contains_key(&result.node_id) {
            debug!(node_id = %result.node_id, round = result.round, "duplicate fit result ignored");
            return Submission::Duplicate;
        }
        debug!(
            node_id = %result.node_id,
            round = result.round,
            examples = result.example_count,
            loss = result.loss,
            "fit result accepted"
        );
        inner.fit.insert(
            result.node_id.clone(),
            Contribution {
                node_id: result.node_id,
                vector: result.vector,
                weight: result.example_count,
            },
        );
        drop(inner);
        self.progress.notify_waiters();
        Submission::Accepted
    }

    /// Record one node's evaluation result.
    pub fn submit_evaluate(&self, result: EvaluateResult) -> Submission {
        let mut inner = self.inner.lock();
        if inner.phase != RoundPhase::AwaitingEvaluate || result.round != inner.round {
            let err = FedError::StaleRound {
                current: inner.round,
                got: result.round,
            };
            debug!(node_id = %result.node_id, error = %err, "evaluation result discarded");
            return Submission::StaleRound;
        }
        if !(0.0..=1.0).contains(&result.accuracy) {
            warn!(
                node_id = %result.node_id,
                accuracy = result.accuracy,
                "evaluation with out-of-range accuracy rejected"
            );
            return Submission::InvalidWeight;
        }
        if inner.evaluations.contains_key(&result.node_id) {
            debug!(node_id = %result.node_id, "duplicate evaluation ignored");
            return Submission::Duplicate;
        }
        debug!(
            node_id = %result.node_id,
            round = result.round,
            accuracy = result.accuracy,
            "evaluation result accepted"
        );
        inner.evaluations.insert(result.node_id.clone(), result);
        drop(inner);
        self.progress.notify_waiters();
        Submission::Accepted
    }

    /// Block until `min` fit results arrived, the deadline elapsed, or
    /// shutdown. Returns the count at wake-up time.
    pub async fn await_fit_quorum(&self, min: usize, deadline: Duration) -> usize {
        self.await_quorum(min, deadline, |inner| inner.fit.len()).await
    }

    pub async fn await_evaluate_quorum(&self, min: usize, deadline: Duration) -> usize {
        self.await_quorum(min, deadline, |inner| inner.evaluations.len())
            .await
    }

    async fn await_quorum(
        &self,
        min: usize,
        deadline: Duration,
        count: impl Fn(&Inner) -> usize,
    ) -> usize {
        let deadline = Instant::now() + deadline;
        loop {
            // register the waiter before checking, so a submission between
            // the check and the await cannot be missed
            let notified = self.progress.notified();
            {
                let inner = self.inner.lock();
                let n = count(&inner);
                if inner.shutdown || n >= min {
                    return n;
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                let inner = self.inner.lock();
                return count(&inner);
            }
        }
    }

    /// Combine this round's fit results into the next global vector.
    /// With zero usable results the round is aborted by the caller and the
    /// vector stays untouched.
    pub fn aggregate(&self) -> Result<ParameterVector, FedError> {
        let mut inner = self.inner.lock();
        inner.phase = RoundPhase::Aggregating;
        let contributions: Vec<Contribution> = inner.fit.values().cloned().collect();
        if contributions.is_empty() {
            return Err(FedError::InsufficientResults);
        }
        let next = self.strategy.aggregate(&contributions)?;
        info!(
            round = inner.round,
            contributors = contributions.len(),
            "aggregated global vector"
        );
        inner.global = next.clone();
        inner.fit.clear();
        inner.phase = RoundPhase::AwaitingEvaluate;
        Ok(next)
    }

    /// Close the evaluation phase. `None` means nothing usable arrived and
    /// no round record must be produced.
    pub fn complete_evaluation(&self) -> Option<RoundSummary> {
        let mut inner = self.inner.lock();
        inner.phase = RoundPhase::Logging;
        if inner.evaluations.is_empty() {
            return None;
        }
        let n = inner.evaluations.len();
        let mean_accuracy =
            inner.evaluations.values().map(|e| e.accuracy).sum::<f64>() / n as f64;
        let summary = RoundSummary {
            round: inner.round,
            mean_accuracy,
            evaluators: n,
        };
        inner.evaluations.clear();
        Some(summary)
    }

    /// Advance to the next round, or terminate after the final one.
    /// Returns the new phase.
    pub fn advance_round(&self) -> RoundPhase {
        let mut inner = self.inner.lock();
        if inner.round < self.total_rounds {
            inner.round += 1;
            inner.phase = RoundPhase::Idle;
        } else {
            inner.phase = RoundPhase::Terminated;
            info!(rounds = self.total_rounds, "session complete");
        }
        inner.phase
    }

    /// Abort the in-flight round: buffers cleared, round number kept, so
    /// the audit sequence stays gap-free when the round is retried.
    pub fn abort_round(&self) {
        let mut inner = self.inner.lock();
        warn!(round = inner.round, "round aborted");
        inner.fit.clear();
        inner.evaluations.clear();
        if inner.phase != RoundPhase::Terminated {
            inner.phase = RoundPhase::Idle;
        }
    }

    /// Cancel any in-progress wait immediately. No record is produced for
    /// the partial round.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock();
        inner.shutdown = true;
        inner.phase = RoundPhase::Terminated;
        inner.fit.clear();
        inner.evaluations.clear();
        drop(inner);
        self.progress.notify_waiters();
        info!("round engine shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn fit(node: &str, round: u64, value: f32, examples: u64) -> FitResult {
        FitResult {
            node_id: node.into(),
            round,
            vector: ParameterVector::new(vec![vec![value, value]]),
            example_count: examples,
            loss: 0.1,
        }
    }

    fn evaluation(node: &str, round: u64, accuracy: f64) -> EvaluateResult {
        EvaluateResult {
            node_id: node.into(),
            round,
            example_count: 100,
            loss: 0.2,
            accuracy,
        }
    }

    fn engine(strategy: AggregationStrategy, rounds: u64) -> RoundEngine {
        RoundEngine::new(strategy, ParameterVector::zeros(&[2]), rounds, 1)
    }

    #[tokio::test]
    async fn quorum_unblocks_when_results_arrive() {
        let engine = Arc::new(engine(AggregationStrategy::WeightedMean, 1));
        let (round, _) = engine.begin_round().unwrap();
        let waiter = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.await_fit_quorum(2, Duration::from_secs(5)).await })
        };
        assert_eq!(engine.submit_fit(fit("n1", round, 1.0, 10)), Submission::Accepted);
        assert_eq!(engine.submit_fit(fit("n2", round, 2.0, 10)), Submission::Accepted);
        assert_eq!(waiter.await.unwrap(), 2);
    }

    #[tokio::test]
    async fn deadline_returns_partial_count() {
        let engine = engine(AggregationStrategy::WeightedMean, 1);
        let (round, _) = engine.begin_round().unwrap();
        assert_eq!(engine.submit_fit(fit("n1", round, 1.0, 10)), Submission::Accepted);
        let n = engine.await_fit_quorum(3, Duration::from_millis(20)).await;
        assert_eq!(n, 1);
    }

    #[tokio::test]
    async fn shutdown_unblocks_waiters() {
        let engine = Arc::new(engine(AggregationStrategy::WeightedMean, 1));
        engine.begin_round().unwrap();
        let waiter = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.await_fit_quorum(2, Duration::from_secs(30)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        engine.shutdown();
        assert_eq!(waiter.await.unwrap(), 0);
        assert!(engine.begin_round().is_none());
    }

    #[test]
    fn stale_round_results_are_discarded() {
        let engine = engine(AggregationStrategy::WeightedMean, 2);
        let (round, _) = engine.begin_round().unwrap();
        assert_eq!(
            engine.submit_fit(fit("n1", round + 1, 1.0, 10)),
            Submission::StaleRound
        );
        assert_eq!(engine.fit_contributors().len(), 0);
    }

    #[test]
    fn duplicate_node_contributes_once() {
        let engine = engine(AggregationStrategy::WeightedMean, 1);
        let (round, _) = engine.begin_round().unwrap();
        assert_eq!(engine.submit_fit(fit("n1", round, 1.0, 10)), Submission::Accepted);
        // reconnecting node re-sends; the first result stands
        assert_eq!(engine.submit_fit(fit("n1", round, 9.0, 10)), Submission::Duplicate);
        assert_eq!(engine.fit_contributors(), vec!["n1".to_string()]);
        let out = engine.aggregate().unwrap();
        assert!((out.layers()[0][0] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn wrong_shape_and_zero_weight_are_rejected() {
        let engine = engine(AggregationStrategy::WeightedMean, 1);
        let (round, _) = engine.begin_round().unwrap();
        let bad_shape = FitResult {
            node_id: "odd".into(),
            round,
            vector: ParameterVector::new(vec![vec![1.0]]),
            example_count: 10,
            loss: 0.1,
        };
        assert_eq!(engine.submit_fit(bad_shape), Submission::ShapeMismatch);
        assert_eq!(engine.submit_fit(fit("empty", round, 1.0, 0)), Submission::InvalidWeight);
        assert!(engine.fit_contributors().is_empty());
    }

    #[test]
    fn zero_results_aborts_and_round_number_survives() {
        let engine = engine(AggregationStrategy::WeightedMean, 3);
        let before = engine.global_vector();
        let (round, _) = engine.begin_round().unwrap();
        assert!(matches!(
            engine.aggregate(),
            Err(FedError::InsufficientResults)
        ));
        engine.abort_round();
        assert_eq!(engine.global_vector(), before);
        let (retry_round, _) = engine.begin_round().unwrap();
        assert_eq!(retry_round, round);
    }

    #[test]
    fn full_round_produces_summary_and_advances() {
        let engine = engine(AggregationStrategy::WeightedMean, 2);
        let (round, _) = engine.begin_round().unwrap();
        engine.submit_fit(fit("n1", round, 1.0, 10));
        engine.submit_fit(fit("n2", round, 3.0, 10));
        let next = engine.aggregate().unwrap();
        assert!((next.layers()[0][0] - 2.0).abs() < 1e-6);
        engine.submit_evaluate(evaluation("n1", round, 0.8));
        engine.submit_evaluate(evaluation("n2", round, 0.6));
        let summary = engine.complete_evaluation().unwrap();
        assert_eq!(summary.round, round);
        assert_eq!(summary.evaluators, 2);
        assert!((summary.mean_accuracy - 0.7).abs() < 1e-9);
        assert_eq!(engine.advance_round(), RoundPhase::Idle);
        assert_eq!(engine.current_round(), round + 1);
    }

    #[test]
    fn terminates_after_final_round() {
        let engine = engine(AggregationStrategy::CoordinateMedian, 1);
        let (round, _) = engine.begin_round().unwrap();
        engine.submit_fit(fit("n1", round, 1.0, 10));
        engine.aggregate().unwrap();
        engine.submit_evaluate(evaluation("n1", round, 0.9));
        engine.complete_evaluation().unwrap();
        assert_eq!(engine.advance_round(), RoundPhase::Terminated);
        assert!(engine.begin_round().is_none());
    }

    #[test]
    fn resume_past_final_round_is_terminated() {
        let engine = RoundEngine::new(
            AggregationStrategy::WeightedMean,
            ParameterVector::zeros(&[2]),
            3,
            4,
        );
        assert_eq!(engine.phase(), RoundPhase::Terminated);
        assert!(engine.begin_round().is_none());
    }
}
