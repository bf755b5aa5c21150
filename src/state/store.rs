//! Metadata Store
//!
//! Durable election metadata backed by SQLite: current term, last granted
//! vote, and the cluster configuration. Writes happen synchronously before a
//! vote is granted or a term is incremented, so a crash-then-restart can
//! never grant two votes in the same term. A failed write surfaces as
//! `Error::Persist`, which halts the node's election participation.

use std::path::PathBuf;
use rusqlite::{params, Connection};
use tokio::sync::Mutex;

use crate::error::{Error, Result};

/// Persisted metadata store
pub struct MetaStore {
    conn: Mutex<Connection>,
}

impl MetaStore {
    /// Create or open the metadata database under `data_dir`
    pub fn open(data_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&data_dir)?;

        let db_path = data_dir.join("meta.db");
        let conn = Connection::open(&db_path).map_err(persist_err)?;

        conn.execute_batch(
            r#"
            PRAGMA synchronous = FULL;

            CREATE TABLE IF NOT EXISTS election_meta (
                key TEXT PRIMARY KEY,
                value_int INTEGER,
                value_text TEXT,
                updated_at TEXT DEFAULT CURRENT_TIMESTAMP
            );
            "#,
        )
        .map_err(persist_err)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Get the persisted term (0 when the node has never voted or led)
    pub async fn current_term(&self) -> Result<u64> {
        let conn = self.conn.lock().await;
        let result: std::result::Result<i64, _> = conn.query_row(
            "SELECT value_int FROM election_meta WHERE key = 'current_term'",
            [],
            |row| row.get(0),
        );

        match result {
            Ok(term) => Ok(term as u64),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(0),
            Err(e) => Err(persist_err(e)),
        }
    }

    /// Persist the current term
    pub async fn set_current_term(&self, term: u64) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO election_meta (key, value_int) VALUES ('current_term', ?1)
            ON CONFLICT(key) DO UPDATE SET value_int = ?1, updated_at = CURRENT_TIMESTAMP
            "#,
            params![term as i64],
        )
        .map_err(persist_err)?;
        Ok(())
    }

    /// Get the last granted vote as (term, candidate address)
    pub async fn vote(&self) -> Result<Option<(u64, String)>> {
        let conn = self.conn.lock().await;
        let result: std::result::Result<(i64, String), _> = conn.query_row(
            "SELECT value_int, value_text FROM election_meta WHERE key = 'vote'",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        );

        match result {
            Ok((term, candidate)) => Ok(Some((term as u64, candidate))),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(persist_err(e)),
        }
    }

    /// Persist a granted vote. Must complete before the response is sent.
    pub async fn save_vote(&self, term: u64, candidate: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO election_meta (key, value_int, value_text) VALUES ('vote', ?1, ?2)
            ON CONFLICT(key) DO UPDATE SET
                value_int = ?1, value_text = ?2, updated_at = CURRENT_TIMESTAMP
            "#,
            params![term as i64, candidate],
        )
        .map_err(persist_err)?;
        Ok(())
    }

    /// Get the persisted cluster configuration as (version, member addresses)
    pub async fn configuration(&self) -> Result<Option<(u64, Vec<String>)>> {
        let conn = self.conn.lock().await;
        let result: std::result::Result<(i64, String), _> = conn.query_row(
            "SELECT value_int, value_text FROM election_meta WHERE key = 'configuration'",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        );

        match result {
            Ok((version, members_json)) => {
                let members: Vec<String> = serde_json::from_str(&members_json)
                    .map_err(|e| Error::Persist(format!("Corrupt configuration record: {}", e)))?;
                Ok(Some((version as u64, members)))
            }
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(persist_err(e)),
        }
    }

    /// Persist the cluster configuration
    pub async fn save_configuration(&self, version: u64, members: &[String]) -> Result<()> {
        let members_json = serde_json::to_string(members)
            .map_err(|e| Error::Persist(format!("Failed to encode configuration: {}", e)))?;

        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO election_meta (key, value_int, value_text) VALUES ('configuration', ?1, ?2)
            ON CONFLICT(key) DO UPDATE SET
                value_int = ?1, value_text = ?2, updated_at = CURRENT_TIMESTAMP
            "#,
            params![version as i64, members_json],
        )
        .map_err(persist_err)?;
        Ok(())
    }
}

fn persist_err(e: rusqlite::Error) -> Error {
    Error::Persist(format!("SQLite error: {}", e))
}
