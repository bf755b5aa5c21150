//! Binlog Purge
//!
//! Bounds binlog disk growth on the leader without breaking replication
//! streams: on a fixed interval, remove segments strictly older than the
//! minimum position still required by any known, healthy follower. A round
//! with no position information is a no-op, not an error.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::network::protocol::BinlogPosition;
use crate::replication::ReplicationController;
use crate::timer::fixed_ticker;

/// Periodic binlog purge loop
pub struct BinlogPurger {
    controller: Arc<ReplicationController>,
    interval: Duration,
    disabled: bool,
}

impl BinlogPurger {
    pub fn new(controller: Arc<ReplicationController>, interval: Duration, disabled: bool) -> Self {
        Self {
            controller,
            interval,
            disabled,
        }
    }

    /// Run the purge loop until shutdown
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        if self.disabled {
            tracing::info!("Binlog purge disabled");
            return;
        }

        let mut ticker = fixed_ticker(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }

            if let Err(e) = self.purge_once().await {
                tracing::warn!("Binlog purge round failed: {}", e);
            }
        }
        tracing::debug!("Binlog purge loop stopped");
    }

    /// One purge round. Only the leader purges; followers hold their logs.
    async fn purge_once(&self) -> crate::Result<()> {
        let machine = self.controller.machine();
        if !machine.is_leader().await {
            return Ok(());
        }

        let floor = match self.purge_floor().await {
            Some(floor) => floor,
            None => {
                tracing::debug!("No follower position information yet, skipping purge");
                return Ok(());
            }
        };

        self.controller.executor().purge_binlogs_to(&floor).await?;
        self.controller.set_purge_cursor(floor).await;
        Ok(())
    }

    /// The minimum position still required by a healthy follower. `None`
    /// when any healthy follower has not reported a position yet, or there
    /// are no followers to protect.
    async fn purge_floor(&self) -> Option<BinlogPosition> {
        let positions = self
            .controller
            .membership()
            .healthy_follower_positions()
            .await;
        if positions.is_empty() {
            return None;
        }

        let mut floor: Option<BinlogPosition> = None;
        for position in positions {
            // A follower with no reported position blocks purging entirely
            let position = position?;
            floor = match floor {
                Some(current) if current <= position => Some(current),
                _ => Some(position),
            };
        }
        floor
    }
}
