//! Node agent: one participant's session lifecycle against the bus.
//!
//! The agent cycles `Disconnected -> Connecting -> Active -> Disconnected`
//! forever. Transport failures are never fatal: the loop sleeps a fixed
//! backoff and reconnects. The only way out is the shutdown channel, which
//! supervises the otherwise terminal-state-free retry loop. Nothing is
//! buffered across a disconnect, so a rejoining node never replays results
//! from before the drop.

use std::sync::Arc;
use std::time::Duration;

use async_nats::Client;
use tokio::sync::watch;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use crate::error::FedError;
use crate::privacy;
use crate::protocol::{
    subjects, Disconnect, EvaluateRequest, EvaluateResult, FitResult, Register, RoundBroadcast,
};
use crate::trainer::LocalTrainer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Active,
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub node_id: String,
    pub subject_prefix: String,
    /// Standard deviation of the Gaussian weight obfuscation applied to
    /// outgoing fit results. Evaluation results are sent un-noised.
    pub privacy_sigma: f64,
    /// Fixed pause between reconnect attempts.
    pub retry_backoff: Duration,
    /// Keepalive cadence for membership hellos.
    pub hello_interval: Duration,
}

pub struct NodeAgent {
    cfg: AgentConfig,
    trainer: Arc<dyn LocalTrainer>,
}

impl NodeAgent {
    pub fn new(cfg: AgentConfig, trainer: Arc<dyn LocalTrainer>) -> Self {
        Self { cfg, trainer }
    }

    /// Blocks for the process lifetime: connect, serve rounds, reconnect on
    /// any transport failure. Returns only when `shutdown` flips.
    pub async fn run(&self, server_address: &str, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            debug!(node_id = %self.cfg.node_id, state = ?SessionState::Connecting, server_address, "connecting");
            match async_nats::connect(server_address).await {
                Ok(client) => {
                    info!(node_id = %self.cfg.node_id, state = ?SessionState::Active, "session established");
                    match self.session(&client, &mut shutdown).await {
                        Ok(()) => {
                            // clean exit: shutdown was requested mid-session
                            break;
                        }
                        Err(err) => {
                            warn!(
                                node_id = %self.cfg.node_id,
                                state = ?SessionState::Disconnected,
                                error = %err,
                                "session lost, will rejoin"
                            );
                        }
                    }
                }
                Err(err) => {
                    warn!(
                        node_id = %self.cfg.node_id,
                        error = %err,
                        "connect failed, will retry"
                    );
                }
            }
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.cfg.retry_backoff) => {}
                _ = shutdown.changed() => {}
            }
        }
        info!(node_id = %self.cfg.node_id, "node agent stopped");
    }

    /// One connected session: announce membership, then serve fit and
    /// evaluate requests until the transport drops or shutdown is asked.
    async fn session(
        &self,
        client: &Client,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), FedError> {
        let prefix = &self.cfg.subject_prefix;
        let mut fit_sub = client
            .subscribe(subjects::round_fit(prefix))
            .await
            .map_err(FedError::transport)?;
        let mut eval_sub = client
            .subscribe(subjects::round_evaluate(prefix))
            .await
            .map_err(FedError::transport)?;
        let mut hello = tokio::time::interval(self.cfg.hello_interval);
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    self.send_disconnect(client).await;
                    return Ok(());
                }
                _ = hello.tick() => {
                    self.send_hello(client).await?;
                }
                msg = fit_sub.next() => match msg {
                    Some(msg) => self.handle_fit(client, &msg.payload).await?,
                    None => return Err(FedError::Transport("fit broadcast stream closed".into())),
                },
                msg = eval_sub.next() => match msg {
                    Some(msg) => self.handle_evaluate(client, &msg.payload).await?,
                    None => return Err(FedError::Transport("evaluate stream closed".into())),
                },
            }
        }
    }

    async fn handle_fit(&self, client: &Client, payload: &[u8]) -> Result<(), FedError> {
        let broadcast: RoundBroadcast = match serde_json::from_slice(payload) {
            Ok(b) => b,
            Err(err) => {
                warn!(node_id = %self.cfg.node_id, error = %err, "malformed round broadcast ignored");
                return Ok(());
            }
        };
        info!(node_id = %self.cfg.node_id, round = broadcast.round, "fit round received");
        let output = match self.trainer.fit(&broadcast.vector).await {
            Ok(o) => o,
            Err(err) => {
                warn!(node_id = %self.cfg.node_id, round = broadcast.round, error = %err, "local training failed, round skipped");
                return Ok(());
            }
        };
        // the one and only place updates are obfuscated before leaving
        let noised = privacy::obfuscate(&output.vector, self.cfg.privacy_sigma);
        let result = FitResult {
            node_id: self.cfg.node_id.clone(),
            round: broadcast.round,
            vector: noised,
            example_count: output.example_count,
            loss: output.loss,
        };
        self.publish(client, subjects::result_fit(&self.cfg.subject_prefix), &result)
            .await
    }

    async fn handle_evaluate(&self, client: &Client, payload: &[u8]) -> Result<(), FedError> {
        let request: EvaluateRequest = match serde_json::from_slice(payload) {
            Ok(r) => r,
            Err(err) => {
                warn!(node_id = %self.cfg.node_id, error = %err, "malformed evaluate request ignored");
                return Ok(());
            }
        };
        let output = match self.trainer.evaluate(&request.vector).await {
            Ok(o) => o,
            Err(err) => {
                warn!(node_id = %self.cfg.node_id, round = request.round, error = %err, "local evaluation failed, round skipped");
                return Ok(());
            }
        };
        info!(
            node_id = %self.cfg.node_id,
            round = request.round,
            accuracy = output.accuracy,
            "evaluation complete"
        );
        let result = EvaluateResult {
            node_id: self.cfg.node_id.clone(),
            round: request.round,
            example_count: output.example_count,
            loss: output.loss,
            accuracy: output.accuracy,
        };
        self.publish(
            client,
            subjects::result_evaluate(&self.cfg.subject_prefix),
            &result,
        )
        .await
    }

    async fn send_hello(&self, client: &Client) -> Result<(), FedError> {
        let hello = Register {
            node_id: self.cfg.node_id.clone(),
        };
        self.publish(client, subjects::node_hello(&self.cfg.subject_prefix), &hello)
            .await
    }

    /// Best-effort goodbye; the registry also times silent nodes out.
    async fn send_disconnect(&self, client: &Client) {
        let msg = Disconnect {
            node_id: self.cfg.node_id.clone(),
        };
        let _ = self
            .publish(client, subjects::node_disconnect(&self.cfg.subject_prefix), &msg)
            .await;
        let _ = client.flush().await;
    }

    async fn publish<T: serde::Serialize>(
        &self,
        client: &Client,
        subject: String,
        message: &T,
    ) -> Result<(), FedError> {
        let bytes = serde_json::to_vec(message).map_err(FedError::transport)?;
        client
            .publish(subject, bytes.into())
            .await
            .map_err(FedError::transport)
    }
}
