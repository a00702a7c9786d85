use crate::connectors::ConnectorRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

/// Drives the periodic ping round.
///
/// Each tick pings every outgoing connector in turn and then sweeps expired
/// announcements. A slow round delays the next tick instead of overlapping
/// with it.
pub struct HeartbeatScheduler {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl HeartbeatScheduler {
    pub fn start(connectors: Arc<ConnectorRegistry>, period: Duration) -> Self {
        let (shutdown, mut stop_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut timer = interval(period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick fires immediately; connectors registered at
            // startup get pinged on the next one.
            timer.tick().await;
            tracing::info!("HeartbeatScheduler: running every {:?}", period);
            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        connectors.ping_outgoing_connectors(false).await;
                        let expired = connectors.context().registry().purge_expired();
                        if !expired.is_empty() {
                            tracing::debug!("HeartbeatScheduler: purged {} expired announcement(s)", expired.len());
                        }
                    }
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::info!("HeartbeatScheduler: stopped");
        });
        Self { shutdown, task }
    }

    /// Stops after the current round, if one is running.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            tracing::warn!("HeartbeatScheduler: task ended abnormally: {}", e);
        }
    }
}
