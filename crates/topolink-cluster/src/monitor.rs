use topolink_core::ConnectorConfig;

/// Failure bookkeeping for one outgoing connector.
///
/// Tracks consecutive ping failures so that a flapping or dead peer produces
/// one warning per run of identical failures rather than one per heartbeat,
/// and so that the connector can back off once the run gets long.
#[derive(Debug, Clone)]
pub struct PingMonitor {
    consecutive_failures: u32,
    last_failure: Option<String>,
    threshold: u32,
    interval_secs: u64,
    stable_factor: u32,
}

impl PingMonitor {
    pub fn new(interval_secs: u64, threshold: u32, stable_factor: u32) -> Self {
        Self {
            consecutive_failures: 0,
            last_failure: None,
            threshold: threshold.max(1),
            interval_secs,
            stable_factor,
        }
    }

    pub fn from_config(config: &ConnectorConfig) -> Self {
        Self::new(
            config.heartbeat_interval_secs,
            config.failure_backoff_threshold,
            config.backoff_stable_factor,
        )
    }

    /// Records a successful ping. Ends any failure run.
    pub fn record_success(&mut self, endpoint: &str) {
        if self.consecutive_failures > 0 {
            tracing::info!(
                "ping: {} reachable again after {} failed attempt(s)",
                endpoint,
                self.consecutive_failures
            );
        }
        self.consecutive_failures = 0;
        self.last_failure = None;
    }

    /// Records a failed ping. The first failure of a run, or a failure whose
    /// reason differs from the previous one, is logged at `warn`; repeats
    /// drop to `debug`.
    pub fn record_failure(&mut self, endpoint: &str, reason: &str) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if self.last_failure.as_deref() == Some(reason) {
            tracing::debug!(
                "ping: {} still failing ({} consecutive): {}",
                endpoint,
                self.consecutive_failures,
                reason
            );
        } else {
            tracing::warn!("ping: {} failed: {}", endpoint, reason);
            self.last_failure = Some(reason.to_string());
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn is_failing(&self) -> bool {
        self.consecutive_failures > 0
    }

    /// Seconds to hold off pinging after the current failure run.
    ///
    /// Zero below the threshold, then one more interval per failure, capped
    /// at `stable_factor` intervals.
    pub fn failure_backoff_secs(&self) -> u64 {
        if self.consecutive_failures < self.threshold {
            return 0;
        }
        let steps = u64::from(self.consecutive_failures - self.threshold + 1);
        let cap = u64::from(self.stable_factor.max(1));
        steps.min(cap) * self.interval_secs
    }
}
