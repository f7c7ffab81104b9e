//! Graceful shutdown for the ledger service
//!
//! On SIGTERM or Ctrl+C the recovery worker stops scheduling passes and the
//! process waits for deliveries already talking to the authority, so no
//! record is left `submitted` by the service's own exit.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tokio::sync::{watch, Notify};
use tracing::{info, warn};

/// Cloneable view of the shutdown state
#[derive(Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn is_shutdown(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once shutdown has started, immediately if it already has.
    pub async fn wait(&self) {
        let mut rx = self.rx.clone();
        // Sender dropped: the coordinator is gone, which is shutdown too.
        let _ = rx.wait_for(|stopping| *stopping).await;
    }
}

/// Counts deliveries between signing and recording the authority's answer
#[derive(Default)]
pub struct DeliveryTracker {
    in_flight: AtomicU64,
    started: AtomicU64,
    drained: Notify,
}

impl DeliveryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self) -> DeliveryGuard<'_> {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        self.started.fetch_add(1, Ordering::Relaxed);
        DeliveryGuard { tracker: self }
    }

    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Deliveries begun since startup
    pub fn started(&self) -> u64 {
        self.started.load(Ordering::Relaxed)
    }

    /// Wait until nothing is in flight. Returns false if `timeout` ran out
    /// first.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let drained = async {
            loop {
                let notified = self.drained.notified();
                if self.in_flight() == 0 {
                    return;
                }
                notified.await;
            }
        };
        match tokio::time::timeout(timeout, drained).await {
            Ok(()) => true,
            Err(_) => {
                warn!(in_flight = self.in_flight(), "Deliveries still running at drain timeout");
                false
            }
        }
    }
}

/// Marks one delivery in flight until dropped
pub struct DeliveryGuard<'a> {
    tracker: &'a DeliveryTracker,
}

impl Drop for DeliveryGuard<'_> {
    fn drop(&mut self) {
        if self.tracker.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.tracker.drained.notify_waiters();
        }
    }
}

pub struct ShutdownCoordinator {
    tx: watch::Sender<bool>,
    tracker: Arc<DeliveryTracker>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            tx: watch::Sender::new(false),
            tracker: Arc::new(DeliveryTracker::new()),
        }
    }

    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }

    pub fn tracker(&self) -> Arc<DeliveryTracker> {
        self.tracker.clone()
    }

    /// Flip the signal. Idempotent.
    pub fn shutdown(&self) {
        if !self.tx.send_replace(true) {
            info!("Shutdown started");
        }
    }

    /// Flip the signal, then wait up to `drain_timeout` for in-flight
    /// deliveries.
    pub async fn graceful_shutdown(&self, drain_timeout: Duration) -> bool {
        self.shutdown();
        let in_flight = self.tracker.in_flight();
        if in_flight > 0 {
            info!(in_flight, "Waiting for in-flight deliveries");
        }
        let drained = self.tracker.drain(drain_timeout).await;
        info!(
            drained,
            deliveries = self.tracker.started(),
            "Shutdown complete"
        );
        drained
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolves on Ctrl+C or, on unix, SIGTERM
pub async fn shutdown_signal() {
    let interrupt = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Ctrl+C handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => info!(signal = "SIGINT", "Stop requested"),
        _ = terminate => info!(signal = "SIGTERM", "Stop requested"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn late_waiters_see_an_earlier_shutdown() {
        let coordinator = ShutdownCoordinator::new();
        let signal = coordinator.signal();
        assert!(!signal.is_shutdown());

        coordinator.shutdown();
        coordinator.shutdown();
        assert!(signal.is_shutdown());
        tokio::time::timeout(Duration::from_secs(1), signal.wait())
            .await
            .unwrap();
    }

    #[test]
    fn guards_track_in_flight_deliveries() {
        let tracker = DeliveryTracker::new();
        {
            let _first = tracker.begin();
            let _second = tracker.begin();
            assert_eq!(tracker.in_flight(), 2);
        }
        assert_eq!(tracker.in_flight(), 0);
        assert_eq!(tracker.started(), 2);
    }

    #[tokio::test]
    async fn graceful_shutdown_waits_for_a_running_delivery() {
        let coordinator = ShutdownCoordinator::new();
        let tracker = coordinator.tracker();
        let (started_tx, started_rx) = tokio::sync::oneshot::channel();

        let delivery = tokio::spawn(async move {
            let _guard = tracker.begin();
            let _ = started_tx.send(());
            tokio::time::sleep(Duration::from_millis(50)).await;
        });
        started_rx.await.unwrap();

        assert!(coordinator.graceful_shutdown(Duration::from_secs(5)).await);
        assert_eq!(coordinator.tracker().in_flight(), 0);
        delivery.await.unwrap();
    }

    #[tokio::test]
    async fn drain_gives_up_at_the_timeout() {
        let tracker = DeliveryTracker::new();
        let _stuck = tracker.begin();
        assert!(!tracker.drain(Duration::from_millis(20)).await);
    }
}
