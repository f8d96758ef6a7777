//! Multi-round flows driven against the engine directly, standing in for
//! the bus: submissions arrive the way ingest tasks would deliver them.

use std::path::PathBuf;

use fedgrid_core::{
    AggregationStrategy, AuditLog, EvaluateResult, FitResult, ParameterVector, RoundEngine,
    RoundPhase, Submission,
};

fn temp_log_path(tag: &str) -> PathBuf {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    std::env::temp_dir().join(format!("fedgrid-flow-{tag}-{nanos}.csv"))
}

fn fit(node: &str, round: u64, layers: Vec<Vec<f32>>, examples: u64) -> FitResult {
    FitResult {
        node_id: node.into(),
        round,
        vector: ParameterVector::new(layers),
        example_count: examples,
        loss: 0.3,
    }
}

fn evaluation(node: &str, round: u64, accuracy: f64) -> EvaluateResult {
    EvaluateResult {
        node_id: node.into(),
        round,
        example_count: 128,
        loss: 0.4,
        accuracy,
    }
}

#[test]
fn three_honest_nodes_agree_under_both_strategies() {
    let update = vec![vec![0.25, -0.75], vec![1.5]];
    for strategy in [
        AggregationStrategy::WeightedMean,
        AggregationStrategy::CoordinateMedian,
    ] {
        let engine = RoundEngine::new(strategy, ParameterVector::zeros(&[2, 1]), 1, 1);
        let (round, _) = engine.begin_round().unwrap();
        for node in ["alpha", "beta", "gamma"] {
            assert_eq!(
                engine.submit_fit(fit(node, round, update.clone(), 100)),
                Submission::Accepted
            );
        }
        let aggregated = engine.aggregate().unwrap();
        assert_eq!(aggregated.layers(), &update[..]);

        for (node, acc) in [("alpha", 0.9), ("beta", 0.8), ("gamma", 0.7)] {
            engine.submit_evaluate(evaluation(node, round, acc));
        }
        let summary = engine.complete_evaluation().unwrap();
        assert!((summary.mean_accuracy - 0.8).abs() < 1e-9);
    }
}

#[test]
fn poisoned_node_skews_mean_but_not_median() {
    let honest = vec![vec![0.5, 0.5]];
    let poisoned = vec![vec![1e6, -1e6]];
    let mut outputs = Vec::new();
    for strategy in [
        AggregationStrategy::WeightedMean,
        AggregationStrategy::CoordinateMedian,
    ] {
        let engine = RoundEngine::new(strategy, ParameterVector::zeros(&[2]), 1, 1);
        let (round, _) = engine.begin_round().unwrap();
        engine.submit_fit(fit("honest-1", round, honest.clone(), 50));
        engine.submit_fit(fit("honest-2", round, honest.clone(), 50));
        engine.submit_fit(fit("attacker", round, poisoned.clone(), 50));
        outputs.push(engine.aggregate().unwrap());
    }
    let mean = &outputs[0];
    let median = &outputs[1];
    assert!(mean.layers()[0][0].abs() > 1000.0, "mean should be skewed");
    assert!(
        (median.layers()[0][0] - 0.5).abs() < 1e-6,
        "median should hold with the honest pair"
    );
}

#[test]
fn five_rounds_survive_a_node_dropping_out() {
    let path = temp_log_path("dropout");
    let audit = AuditLog::open(&path);
    let engine = RoundEngine::new(
        AggregationStrategy::WeightedMean,
        ParameterVector::zeros(&[2]),
        5,
        1,
    );
    let update = vec![vec![0.1, 0.1]];
    let mut deserter_contributions = 0;

    loop {
        let Some((round, _)) = engine.begin_round() else {
            break;
        };
        // "gamma" goes silent after round 2 and never rejoins
        let roster: &[&str] = if round <= 2 {
            &["alpha", "beta", "gamma"]
        } else {
            &["alpha", "beta"]
        };
        for node in roster {
            engine.submit_fit(fit(node, round, update.clone(), 10));
        }
        if engine.fit_contributors().contains(&"gamma".to_string()) {
            deserter_contributions += 1;
        }
        engine.aggregate().unwrap();
        for node in roster {
            engine.submit_evaluate(evaluation(node, round, 0.5 + round as f64 / 100.0));
        }
        let summary = engine.complete_evaluation().unwrap();
        audit.append(summary.round, summary.mean_accuracy).unwrap();
        engine.advance_round();
    }

    let records = audit.read().unwrap();
    assert_eq!(records.len(), 5, "every round must be recorded");
    let rounds: Vec<u64> = records.iter().map(|r| r.round).collect();
    assert_eq!(rounds, vec![1, 2, 3, 4, 5], "strictly increasing, no gaps");
    assert_eq!(deserter_contributions, 2);
    std::fs::remove_file(&path).unwrap();
}

#[test]
fn aborted_round_leaves_no_record_and_no_gap() {
    let path = temp_log_path("abort");
    let audit = AuditLog::open(&path);
    let engine = RoundEngine::new(
        AggregationStrategy::CoordinateMedian,
        ParameterVector::zeros(&[1]),
        2,
        1,
    );

    // first attempt of round 1: nobody answers
    let (round, _) = engine.begin_round().unwrap();
    assert_eq!(round, 1);
    assert!(engine.aggregate().is_err());
    engine.abort_round();

    // retry carries the same round number, so the audit stays gap-free
    let (retry, _) = engine.begin_round().unwrap();
    assert_eq!(retry, 1);
    engine.submit_fit(fit("alpha", retry, vec![vec![2.0]], 10));
    engine.aggregate().unwrap();
    engine.submit_evaluate(evaluation("alpha", retry, 0.6));
    let summary = engine.complete_evaluation().unwrap();
    audit.append(summary.round, summary.mean_accuracy).unwrap();
    engine.advance_round();

    let records = audit.read().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].round, 1);
    std::fs::remove_file(&path).unwrap();
}

#[test]
fn resumed_session_continues_round_numbering() {
    let path = temp_log_path("resume");
    let audit = AuditLog::open(&path);
    audit.append(1, 0.55).unwrap();
    audit.append(2, 0.61).unwrap();

    let next_round = audit.last_round().unwrap().map(|r| r + 1).unwrap_or(1);
    let engine = RoundEngine::new(
        AggregationStrategy::WeightedMean,
        ParameterVector::zeros(&[1]),
        3,
        next_round,
    );
    let (round, _) = engine.begin_round().unwrap();
    assert_eq!(round, 3);
    engine.submit_fit(fit("alpha", round, vec![vec![1.0]], 10));
    engine.aggregate().unwrap();
    engine.submit_evaluate(evaluation("alpha", round, 0.7));
    let summary = engine.complete_evaluation().unwrap();
    audit.append(summary.round, summary.mean_accuracy).unwrap();
    assert_eq!(engine.advance_round(), RoundPhase::Terminated);

    let rounds: Vec<u64> = audit.read().unwrap().iter().map(|r| r.round).collect();
    assert_eq!(rounds, vec![1, 2, 3]);
    std::fs::remove_file(&path).unwrap();
}
