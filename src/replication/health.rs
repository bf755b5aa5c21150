//! MySQL Health Probe
//!
//! Pings the local MySQL instance on a fixed interval. A configurable number
//! of consecutive failures marks the node degraded, which the election
//! machine consults before campaigning; a single success clears the flag.
//! The probe also refreshes the node's replication position marker.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::replication::ReplicationController;
use crate::timer::fixed_ticker;

/// Periodic local-MySQL liveness probe
pub struct HealthProbe {
    controller: Arc<ReplicationController>,
    interval: Duration,
    max_failures: u32,
}

impl HealthProbe {
    pub fn new(controller: Arc<ReplicationController>, interval: Duration, max_failures: u32) -> Self {
        Self {
            controller,
            interval,
            max_failures: max_failures.max(1),
        }
    }

    /// Run the probe loop until shutdown
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = fixed_ticker(self.interval);
        let mut failures = 0u32;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }

            failures = self.probe_once(failures).await;
        }
        tracing::debug!("Health probe stopped");
    }

    /// One probe round; returns the updated consecutive-failure count
    async fn probe_once(&self, failures: u32) -> u32 {
        let executor = self.controller.executor();
        let machine = self.controller.machine();

        match executor.ping().await {
            Ok(()) => {
                machine.set_degraded(false).await;

                match executor.current_position().await {
                    Ok(position) => {
                        machine.set_position(position.clone()).await;
                        self.controller.set_position(position).await;
                    }
                    Err(e) => {
                        tracing::debug!("Position refresh failed: {}", e);
                    }
                }
                0
            }
            Err(e) => {
                let failures = failures.saturating_add(1);
                tracing::warn!(
                    "MySQL ping failed ({}/{}): {}",
                    failures,
                    self.max_failures,
                    e
                );
                if failures >= self.max_failures {
                    machine.set_degraded(true).await;
                }
                failures
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::protocol::BinlogPosition;
    use crate::replication::controller::tests::fixture;

    #[tokio::test]
    async fn test_degraded_after_consecutive_failures() {
        let f = fixture().await;
        let probe = HealthProbe::new(
            Arc::clone(&f.controller),
            Duration::from_millis(10),
            3,
        );

        f.executor.mock_set_healthy(false);

        let mut failures = 0;
        failures = probe.probe_once(failures).await;
        failures = probe.probe_once(failures).await;
        assert!(!f.machine.is_degraded().await);

        failures = probe.probe_once(failures).await;
        assert_eq!(failures, 3);
        assert!(f.machine.is_degraded().await);

        // A single success clears the verdict and the counter
        f.executor.mock_set_healthy(true);
        let failures = probe.probe_once(failures).await;
        assert_eq!(failures, 0);
        assert!(!f.machine.is_degraded().await);
    }

    #[tokio::test]
    async fn test_probe_refreshes_position() {
        let f = fixture().await;
        let probe = HealthProbe::new(
            Arc::clone(&f.controller),
            Duration::from_millis(10),
            3,
        );

        f.executor
            .mock_set_position(Some(BinlogPosition::new("mysql-bin.000011", 77)));
        probe.probe_once(0).await;

        assert_eq!(
            f.machine.position().await,
            Some(BinlogPosition::new("mysql-bin.000011", 77))
        );
        assert_eq!(
            f.controller.replication_state().await.position,
            Some(BinlogPosition::new("mysql-bin.000011", 77))
        );
    }
}
