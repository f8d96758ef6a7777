use std::sync::Arc;

use anyhow::Result;
use tokio::sync::watch;
use tracing::info;

use fedgrid_core::{AgentConfig, FedConfig, NodeAgent};

mod trainer;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cfg = FedConfig::load()?;
    let node_id = std::env::var("FEDGRID_NODE_ID")
        .unwrap_or_else(|_| format!("node-{}", uuid::Uuid::new_v4().simple()));
    info!(
        target: "node-agent",
        node_id = %node_id,
        server_address = %cfg.server_address,
        "starting node agent"
    );

    let agent = NodeAgent::new(
        AgentConfig {
            node_id: node_id.clone(),
            subject_prefix: cfg.subject_prefix.clone(),
            privacy_sigma: cfg.privacy_sigma,
            retry_backoff: cfg.retry_backoff(),
            hello_interval: cfg.hello_interval(),
        },
        Arc::new(trainer::SyntheticTrainer::new(&node_id)),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server_address = cfg.server_address.clone();
    let session = tokio::spawn(async move { agent.run(&server_address, shutdown_rx).await });

    tokio::signal::ctrl_c().await?;
    info!(target: "node-agent", node_id = %node_id, "shutdown signal received");
    let _ = shutdown_tx.send(true);
    // let the session say goodbye before the process exits
    session.await?;
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}
