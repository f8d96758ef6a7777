//! Round-driving control loop and bus ingest tasks.
//!
//! Ingest tasks feed the engine from result subjects; the driver owns the
//! broadcast/aggregate/log sequence. The engine's quorum waits are against
//! a shared counter, so a slow node never blocks another node's session.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_nats::Client;
use tokio::sync::watch;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use fedgrid_core::{
    subjects, AuditLog, Disconnect, EvaluateRequest, EvaluateResult, FedConfig, FitResult,
    NodeRegistry, Register, RoundBroadcast, RoundEngine, RoundPhase,
};

/// Pause before retrying an aborted round, so an empty grid does not spin.
const ABORT_RETRY_PAUSE: Duration = Duration::from_secs(2);

pub fn spawn_ingest_tasks(
    client: &Client,
    cfg: &FedConfig,
    engine: Arc<RoundEngine>,
    registry: Arc<NodeRegistry>,
) {
    let prefix = cfg.subject_prefix.clone();

    {
        let client = client.clone();
        let engine = engine.clone();
        let registry = registry.clone();
        let subject = subjects::result_fit(&prefix);
        tokio::spawn(async move {
            let mut sub = match client.subscribe(subject).await {
                Ok(s) => s,
                Err(err) => {
                    warn!(error = %err, "fit result subscription failed");
                    return;
                }
            };
            while let Some(msg) = sub.next().await {
                match serde_json::from_slice::<FitResult>(&msg.payload) {
                    Ok(result) => {
                        registry.mark_seen(&result.node_id);
                        engine.submit_fit(result);
                    }
                    Err(err) => warn!(error = %err, "malformed fit result dropped"),
                }
            }
        });
    }

    {
        let client = client.clone();
        let engine = engine.clone();
        let registry = registry.clone();
        let subject = subjects::result_evaluate(&prefix);
        tokio::spawn(async move {
            let mut sub = match client.subscribe(subject).await {
                Ok(s) => s,
                Err(err) => {
                    warn!(error = %err, "evaluate result subscription failed");
                    return;
                }
            };
            while let Some(msg) = sub.next().await {
                match serde_json::from_slice::<EvaluateResult>(&msg.payload) {
                    Ok(result) => {
                        registry.mark_seen(&result.node_id);
                        engine.submit_evaluate(result);
                    }
                    Err(err) => warn!(error = %err, "malformed evaluate result dropped"),
                }
            }
        });
    }

    {
        let client = client.clone();
        let registry = registry.clone();
        let subject = subjects::node_hello(&prefix);
        tokio::spawn(async move {
            let mut sub = match client.subscribe(subject).await {
                Ok(s) => s,
                Err(err) => {
                    warn!(error = %err, "hello subscription failed");
                    return;
                }
            };
            while let Some(msg) = sub.next().await {
                match serde_json::from_slice::<Register>(&msg.payload) {
                    Ok(hello) => registry.register(&hello.node_id),
                    Err(err) => warn!(error = %err, "malformed hello dropped"),
                }
            }
        });
    }

    {
        let client = client.clone();
        let registry = registry.clone();
        let subject = subjects::node_disconnect(&prefix);
        tokio::spawn(async move {
            let mut sub = match client.subscribe(subject).await {
                Ok(s) => s,
                Err(err) => {
                    warn!(error = %err, "disconnect subscription failed");
                    return;
                }
            };
            while let Some(msg) = sub.next().await {
                match serde_json::from_slice::<Disconnect>(&msg.payload) {
                    Ok(bye) => registry.remove(&bye.node_id),
                    Err(err) => warn!(error = %err, "malformed disconnect dropped"),
                }
            }
        });
    }

    {
        let registry = registry.clone();
        let stale_after = cfg.stale_after();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(stale_after);
            loop {
                tick.tick().await;
                for node_id in registry.sweep(stale_after) {
                    warn!(node_id = %node_id, "node timed out of registry");
                }
            }
        });
    }
}

/// Block until enough nodes registered to start the session.
async fn wait_for_available(
    registry: &NodeRegistry,
    min_available: usize,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    let mut tick = tokio::time::interval(Duration::from_millis(500));
    loop {
        if *shutdown.borrow() {
            return false;
        }
        let available = registry.len();
        if available >= min_available {
            info!(available, "minimum availability reached");
            return true;
        }
        debug!(available, min_available, "waiting for nodes to register");
        tokio::select! {
            _ = tick.tick() => {}
            _ = shutdown.changed() => {}
        }
    }
}

pub async fn run_session(
    client: Client,
    cfg: FedConfig,
    engine: Arc<RoundEngine>,
    registry: Arc<NodeRegistry>,
    audit: Arc<AuditLog>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    if !wait_for_available(&registry, cfg.min_available_clients, &mut shutdown).await {
        return Ok(());
    }

    while let Some((round, vector)) = engine.begin_round() {
        info!(round, nodes = registry.len(), "broadcasting round");
        let broadcast = RoundBroadcast { round, vector };
        client
            .publish(
                subjects::round_fit(&cfg.subject_prefix),
                serde_json::to_vec(&broadcast)?.into(),
            )
            .await?;

        let fit_count = engine
            .await_fit_quorum(cfg.min_fit_clients, cfg.round_deadline())
            .await;
        if engine.is_shutdown() {
            break;
        }

        // nodes that stayed registered but never answered are this round's
        // failures; the round proceeds without them
        let contributors = engine.fit_contributors();
        for node_id in registry.node_ids() {
            if !contributors.contains(&node_id) {
                warn!(round, node_id = %node_id, "no fit result before deadline");
            }
        }

        let aggregated = match engine.aggregate() {
            Ok(vector) => vector,
            Err(err) => {
                warn!(round, fit_count, error = %err, "aborting round attempt");
                engine.abort_round();
                tokio::select! {
                    _ = tokio::time::sleep(ABORT_RETRY_PAUSE) => {}
                    _ = shutdown.changed() => {}
                }
                continue;
            }
        };
        info!(round, fit_count, "fit phase complete");

        let request = EvaluateRequest {
            round,
            vector: aggregated,
        };
        client
            .publish(
                subjects::round_evaluate(&cfg.subject_prefix),
                serde_json::to_vec(&request)?.into(),
            )
            .await?;

        let eval_count = engine
            .await_evaluate_quorum(cfg.min_evaluate_clients, cfg.round_deadline())
            .await;
        if engine.is_shutdown() {
            break;
        }

        match engine.complete_evaluation() {
            Some(summary) => {
                audit.append(summary.round, summary.mean_accuracy)?;
                info!(
                    round = summary.round,
                    accuracy = summary.mean_accuracy,
                    evaluators = summary.evaluators,
                    "round complete"
                );
                if engine.advance_round() == RoundPhase::Terminated {
                    break;
                }
            }
            None => {
                warn!(round, eval_count, "no evaluations received, retrying round");
                engine.abort_round();
                tokio::select! {
                    _ = tokio::time::sleep(ABORT_RETRY_PAUSE) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
    }
    Ok(())
}
