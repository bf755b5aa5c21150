//! MySQL Admin Executor
//!
//! Thin administrative surface over the local MySQL instance: liveness ping,
//! replication position queries, and binlog purge. Replication role changes
//! themselves are performed by the operator-supplied leader-start/stop
//! commands, not by this executor.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use sqlx::mysql::MySqlPoolOptions;
use sqlx::{MySqlPool, Row};

use crate::config::DatabaseConfig;
use crate::network::protocol::BinlogPosition;
use crate::error::{Error, Result};

/// Administrative MySQL connection
pub struct MySqlAdmin {
    pool: Option<MySqlPool>,
    /// Mock state for tests
    is_mock: bool,
    mock_healthy: AtomicBool,
    mock_position: std::sync::RwLock<Option<BinlogPosition>>,
}

impl MySqlAdmin {
    /// Connect a pool to the configured server
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let url = format!(
            "mysql://{}:{}@{}:{}",
            config.user, config.password, config.host, config.port
        );

        let pool = MySqlPoolOptions::new()
            .max_connections(config.pool_size)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .connect(&url)
            .await?;

        Ok(Self {
            pool: Some(pool),
            is_mock: false,
            mock_healthy: AtomicBool::new(true),
            mock_position: std::sync::RwLock::new(None),
        })
    }

    /// Create a mock executor for testing
    pub fn new_mock() -> Self {
        Self {
            pool: None,
            is_mock: true,
            mock_healthy: AtomicBool::new(true),
            mock_position: std::sync::RwLock::new(None),
        }
    }

    /// Flip the mock health verdict (tests only)
    pub fn mock_set_healthy(&self, healthy: bool) {
        self.mock_healthy.store(healthy, Ordering::SeqCst);
    }

    /// Set the mock replication position (tests only)
    pub fn mock_set_position(&self, position: Option<BinlogPosition>) {
        *self.mock_position.write().unwrap() = position;
    }

    fn pool(&self) -> Result<&MySqlPool> {
        self.pool
            .as_ref()
            .ok_or_else(|| Error::Internal("No database pool".into()))
    }

    /// Liveness probe
    pub async fn ping(&self) -> Result<()> {
        if self.is_mock {
            return if self.mock_healthy.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(Error::Internal("mock ping failure".into()))
            };
        }

        sqlx::query("SELECT 1").execute(self.pool()?).await?;
        Ok(())
    }

    /// This server's own binlog write position
    pub async fn master_position(&self) -> Result<Option<BinlogPosition>> {
        if self.is_mock {
            return Ok(self.mock_position.read().unwrap().clone());
        }

        let row = sqlx::query("SHOW MASTER STATUS")
            .fetch_optional(self.pool()?)
            .await?;

        match row {
            Some(row) => {
                let file: String = row.try_get("File")?;
                let offset: u64 = row.try_get("Position")?;
                Ok(Some(BinlogPosition::new(file, offset)))
            }
            None => Ok(None),
        }
    }

    /// The source position this replica has applied, if replicating
    pub async fn replica_position(&self) -> Result<Option<BinlogPosition>> {
        if self.is_mock {
            return Ok(self.mock_position.read().unwrap().clone());
        }

        let row = sqlx::query("SHOW SLAVE STATUS")
            .fetch_optional(self.pool()?)
            .await?;

        match row {
            Some(row) => {
                let file: String = row.try_get("Relay_Master_Log_File")?;
                let offset: u64 = row.try_get("Exec_Master_Log_Pos")?;
                if file.is_empty() {
                    return Ok(None);
                }
                Ok(Some(BinlogPosition::new(file, offset)))
            }
            None => Ok(None),
        }
    }

    /// The node's replication position marker: applied source position when
    /// replicating, own binlog position otherwise
    pub async fn current_position(&self) -> Result<Option<BinlogPosition>> {
        if let Some(position) = self.replica_position().await? {
            return Ok(Some(position));
        }
        self.master_position().await
    }

    /// Remove binlog files strictly older than `position.file`.
    ///
    /// PURGE BINARY LOGS does not accept bind parameters, so the file name is
    /// validated before being spliced into the statement.
    pub async fn purge_binlogs_to(&self, position: &BinlogPosition) -> Result<()> {
        if !is_valid_binlog_file(&position.file) {
            return Err(Error::State(format!(
                "Refusing to purge to malformed binlog file name {:?}",
                position.file
            )));
        }

        if self.is_mock {
            return Ok(());
        }

        let statement = format!("PURGE BINARY LOGS TO '{}'", position.file);
        sqlx::query(&statement).execute(self.pool()?).await?;
        tracing::info!("Purged binlogs up to {}", position.file);
        Ok(())
    }
}

/// Binlog file names are `<basename>.<index>` with a restricted character set
fn is_valid_binlog_file(file: &str) -> bool {
    !file.is_empty()
        && file
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binlog_file_validation() {
        assert!(is_valid_binlog_file("mysql-bin.000042"));
        assert!(is_valid_binlog_file("relay_log.000001"));
        assert!(!is_valid_binlog_file(""));
        assert!(!is_valid_binlog_file("mysql-bin.000001'; DROP TABLE t"));
        assert!(!is_valid_binlog_file("bad name"));
    }

    #[tokio::test]
    async fn test_mock_ping_toggles() {
        let admin = MySqlAdmin::new_mock();
        assert!(admin.ping().await.is_ok());

        admin.mock_set_healthy(false);
        assert!(admin.ping().await.is_err());

        admin.mock_set_healthy(true);
        assert!(admin.ping().await.is_ok());
    }

    #[tokio::test]
    async fn test_mock_position() {
        let admin = MySqlAdmin::new_mock();
        assert!(admin.current_position().await.unwrap().is_none());

        admin.mock_set_position(Some(BinlogPosition::new("mysql-bin.000003", 120)));
        assert_eq!(
            admin.current_position().await.unwrap(),
            Some(BinlogPosition::new("mysql-bin.000003", 120))
        );
    }

    #[tokio::test]
    async fn test_mock_purge_still_validates() {
        let admin = MySqlAdmin::new_mock();
        let good = BinlogPosition::new("mysql-bin.000002", 0);
        assert!(admin.purge_binlogs_to(&good).await.is_ok());

        let bad = BinlogPosition::new("mysql-bin.000002'; --", 0);
        assert!(admin.purge_binlogs_to(&bad).await.is_err());
    }
}
