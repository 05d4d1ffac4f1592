//! Stream heartbeat monitoring.
//!
//! Brokers emit periodic heartbeats on their streaming connections.
//! A missed heartbeat degrades the connection; recovery within the
//! grace window restores it, and grace expiry forces a reconnect.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Configuration for heartbeat supervision.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Expected maximum gap between broker heartbeats.
    pub interval: Duration,
    /// Extra time a degraded connection gets to recover before it is
    /// torn down.
    pub grace_window: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            grace_window: Duration::from_secs(15),
        }
    }
}

/// Events emitted by the heartbeat monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatEvent {
    /// Send a client-side keepalive, for brokers that require one.
    SendKeepalive,
    /// Heartbeat interval missed; connection should degrade.
    Degraded,
    /// Heartbeat returned within the grace window.
    Recovered,
    /// Grace window expired; connection must be torn down.
    Expired,
}

/// Shared record of the last observed heartbeat.
#[derive(Debug)]
pub struct HeartbeatState {
    last_heartbeat: RwLock<Instant>,
}

impl Default for HeartbeatState {
    fn default() -> Self {
        Self::new()
    }
}

impl HeartbeatState {
    /// New state, treating "now" as the last heartbeat.
    #[must_use]
    pub fn new() -> Self {
        Self {
            last_heartbeat: RwLock::new(Instant::now()),
        }
    }

    /// Record a heartbeat (any inbound stream message counts).
    pub fn record(&self) {
        *self.last_heartbeat.write() = Instant::now();
    }

    /// Time since the last recorded heartbeat.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.last_heartbeat.read().elapsed()
    }

    /// Reset for a fresh connection.
    pub fn reset(&self) {
        self.record();
    }

    #[cfg(test)]
    pub(crate) fn backdate(&self, by: Duration) {
        if let Some(past) = Instant::now().checked_sub(by) {
            *self.last_heartbeat.write() = past;
        }
    }
}

/// Monitors heartbeat freshness for one connection and reports
/// degradation/recovery/expiry to the supervisor.
pub struct HeartbeatMonitor {
    config: HeartbeatConfig,
    state: Arc<HeartbeatState>,
    event_tx: mpsc::Sender<HeartbeatEvent>,
    cancel: CancellationToken,
}

impl HeartbeatMonitor {
    /// Create a monitor over shared heartbeat state.
    #[must_use]
    pub const fn new(
        config: HeartbeatConfig,
        state: Arc<HeartbeatState>,
        event_tx: mpsc::Sender<HeartbeatEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            state,
            event_tx,
            cancel,
        }
    }

    /// Run until cancelled or the grace window expires.
    pub async fn run(self) {
        // Check at a fraction of the interval so degradation is
        // noticed promptly.
        let tick = (self.config.interval / 4).max(Duration::from_millis(10));
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut degraded = false;

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    tracing::debug!("heartbeat monitor cancelled");
                    break;
                }
                _ = interval.tick() => {
                    let elapsed = self.state.elapsed();

                    if elapsed > self.config.interval + self.config.grace_window {
                        tracing::warn!(
                            elapsed_secs = elapsed.as_secs(),
                            "heartbeat grace window expired"
                        );
                        let _ = self.event_tx.send(HeartbeatEvent::Expired).await;
                        break;
                    }

                    if elapsed > self.config.interval {
                        if !degraded {
                            degraded = true;
                            tracing::warn!(
                                elapsed_secs = elapsed.as_secs(),
                                "heartbeat missed, degrading connection"
                            );
                            if self.event_tx.send(HeartbeatEvent::Degraded).await.is_err() {
                                break;
                            }
                        }
                    } else if degraded {
                        degraded = false;
                        tracing::info!("heartbeat recovered within grace window");
                        if self.event_tx.send(HeartbeatEvent::Recovered).await.is_err() {
                            break;
                        }
                    } else if self.event_tx.send(HeartbeatEvent::SendKeepalive).await.is_err() {
                        break;
                    }
                }
            }
        }
    }
}
