use std::sync::Arc;

use anyhow::Result;
use tokio::sync::watch;
use tracing::{error, info};

use fedgrid_core::{AuditLog, FedConfig, NodeRegistry, ParameterVector, RoundEngine};

mod rounds;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cfg = FedConfig::load()?;
    info!(
        target: "coordinator",
        rounds = cfg.rounds,
        strategy = %cfg.aggregation_strategy,
        server_address = %cfg.server_address,
        "starting coordinator"
    );

    let audit = Arc::new(AuditLog::open(&cfg.audit_log_path));
    let starting_round = match audit.last_round()? {
        Some(last) => {
            info!(target: "coordinator", last_round = last, "resuming from audit log");
            last + 1
        }
        None => 1,
    };
    if starting_round > cfg.rounds {
        info!(target: "coordinator", "all configured rounds already recorded, nothing to do");
        return Ok(());
    }

    let engine = Arc::new(RoundEngine::new(
        cfg.strategy()?,
        ParameterVector::zeros(&cfg.layer_shape()?),
        cfg.rounds,
        starting_round,
    ));
    let registry = Arc::new(NodeRegistry::new());

    let client = async_nats::connect(&cfg.server_address).await?;
    info!(target: "coordinator", "connected to bus");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    rounds::spawn_ingest_tasks(&client, &cfg, engine.clone(), registry.clone());

    let mut driver = tokio::spawn(rounds::run_session(
        client.clone(),
        cfg.clone(),
        engine.clone(),
        registry.clone(),
        audit.clone(),
        shutdown_rx,
    ));

    tokio::select! {
        res = &mut driver => report_driver_exit(res),
        _ = tokio::signal::ctrl_c() => {
            info!(target: "coordinator", "shutdown signal received");
            let _ = shutdown_tx.send(true);
            engine.shutdown();
            report_driver_exit(driver.await);
        }
    }

    // appends are fsynced individually; nothing left to flush beyond the bus
    client.flush().await?;
    info!(target: "coordinator", "coordinator stopped");
    Ok(())
}

fn report_driver_exit(res: Result<Result<()>, tokio::task::JoinError>) {
    match res {
        Ok(Ok(())) => info!(target: "coordinator", "session driver finished"),
        Ok(Err(err)) => error!(target: "coordinator", error = %err, "session driver failed"),
        Err(err) => error!(target: "coordinator", error = %err, "session driver panicked"),
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}
