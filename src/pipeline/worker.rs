//! Scheduled recovery worker
//!
//! Background task that runs a recovery pass on every tick, plus on demand
//! through its control channel, and then drops idle tenant locks. It stops
//! on `Shutdown` or when the process shutdown signal fires.

use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

use super::recovery::RecoveryEngine;
use super::DeliveryOutcome;
use crate::domain::InvoiceId;
use crate::infra::{Result, ShutdownSignal};

/// Message types for recovery worker control
#[derive(Debug)]
pub enum RecoveryWorkerMessage {
    /// Run a full pass now instead of waiting for the next tick
    RunNow,
    /// Manually retry one invoice and report the outcome
    RetryInvoice {
        invoice_id: InvoiceId,
        reply: oneshot::Sender<Result<DeliveryOutcome>>,
    },
    /// Shutdown the worker
    Shutdown,
}

pub struct RecoveryWorker {
    engine: RecoveryEngine,
    shutdown: Option<ShutdownSignal>,
    control_tx: mpsc::Sender<RecoveryWorkerMessage>,
    control_rx: mpsc::Receiver<RecoveryWorkerMessage>,
}

impl RecoveryWorker {
    pub fn new(engine: RecoveryEngine) -> Self {
        let (control_tx, control_rx) = mpsc::channel(16);
        Self {
            engine,
            shutdown: None,
            control_tx,
            control_rx,
        }
    }

    /// Stop when the process-wide shutdown signal fires.
    pub fn with_shutdown(mut self, signal: ShutdownSignal) -> Self {
        self.shutdown = Some(signal);
        self
    }

    /// Get a sender handle for controlling the worker
    pub fn control_handle(&self) -> mpsc::Sender<RecoveryWorkerMessage> {
        self.control_tx.clone()
    }

    /// Run the worker until shutdown
    pub async fn run(mut self) {
        let config = self.engine.config().clone();
        info!(
            interval_secs = config.interval.as_secs(),
            cooldown_secs = config.cooldown.as_secs(),
            batch_size = config.batch_size,
            concurrency = config.concurrency,
            max_retries = ?config.max_retries,
            retry_rejected = config.retry_rejected,
            "Starting recovery worker"
        );

        let mut ticker = interval(config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let shutdown = self.shutdown.clone();

        loop {
            tokio::select! {
                _ = wait_for_shutdown(shutdown.as_ref()) => {
                    info!("Recovery worker stopping on shutdown signal");
                    break;
                }
                _ = ticker.tick() => {
                    self.run_pass().await;
                }
                msg = self.control_rx.recv() => {
                    match msg {
                        Some(RecoveryWorkerMessage::RunNow) => {
                            info!("Running recovery pass on request");
                            self.run_pass().await;
                        }
                        Some(RecoveryWorkerMessage::RetryInvoice { invoice_id, reply }) => {
                            let outcome = self.engine.retry_invoice(&invoice_id).await;
                            // The requester may have gone away.
                            let _ = reply.send(outcome);
                        }
                        Some(RecoveryWorkerMessage::Shutdown) | None => {
                            info!("Recovery worker shutting down");
                            break;
                        }
                    }
                }
            }
        }
    }

    async fn run_pass(&self) {
        if let Err(e) = self.engine.run_once().await {
            error!(error = %e, category = e.category(), "Recovery pass failed");
        }
        let pruned = self.engine.pipeline().locks().prune();
        if pruned > 0 {
            debug!(pruned, "Dropped idle tenant locks");
        }
    }
}

async fn wait_for_shutdown(signal: Option<&ShutdownSignal>) {
    match signal {
        Some(signal) => signal.wait().await,
        None => std::future::pending().await,
    }
}

/// Spawn the recovery worker as a background task
pub fn spawn_recovery_worker(
    engine: RecoveryEngine,
    shutdown: Option<ShutdownSignal>,
) -> (
    tokio::task::JoinHandle<()>,
    mpsc::Sender<RecoveryWorkerMessage>,
) {
    let mut worker = RecoveryWorker::new(engine);
    if let Some(signal) = shutdown {
        worker = worker.with_shutdown(signal);
    }
    let control_handle = worker.control_handle();
    let handle = tokio::spawn(worker.run());
    (handle, control_handle)
}
