//! Relational store shared by every node of every group.
//!
//! All cross-process state lives in four tables:
//!
//! - `nodes`: registry of members, their properties and first-observation flag
//! - `heartbeats`: last liveness timestamp per member, written only by its owner
//! - `coordinator_lock`: at most one row per group naming the coordinator
//! - `membership_events`: pending notifications, keyed by target node
//!
//! Every mutation is either idempotent or conditioned on the value previously
//! read (compare-and-swap), so no statement holds a database lock across more
//! than one short transaction. Timestamps are UTC milliseconds.

mod events;
mod lock;
mod registry;

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

use crate::config::StoreConfig;
use crate::error::Result;

pub use lock::CoordinatorLock;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS nodes (
        group_id TEXT NOT NULL,
        node_id TEXT NOT NULL,
        properties TEXT NOT NULL DEFAULT '{}',
        is_new_node INTEGER NOT NULL DEFAULT 1,
        PRIMARY KEY (group_id, node_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS heartbeats (
        group_id TEXT NOT NULL,
        node_id TEXT NOT NULL,
        last_heartbeat INTEGER NOT NULL,
        PRIMARY KEY (group_id, node_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS coordinator_lock (
        group_id TEXT PRIMARY KEY,
        coordinator_node_id TEXT NOT NULL,
        last_updated INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS membership_events (
        sequence INTEGER PRIMARY KEY AUTOINCREMENT,
        target_node_id TEXT NOT NULL,
        target_group_id TEXT NOT NULL,
        event_type TEXT NOT NULL,
        subject_node_id TEXT NOT NULL,
        subject_properties TEXT
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS membership_events_by_target
        ON membership_events (target_group_id, target_node_id, sequence)
    "#,
];

/// Handle to the shared store. Cheap to clone; clones share one pool.
#[derive(Debug, Clone)]
pub struct RdbmsStore {
    pool: SqlitePool,
}

impl RdbmsStore {
    /// Open (creating if needed) the database and make sure the schema exists.
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&config.database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(config.busy_timeout_ms));

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.initialize().await?;

        tracing::info!(
            database_url = %config.database_url,
            max_connections = config.max_connections,
            "Connected to coordination store"
        );
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create the coordination tables if they are missing. Idempotent.
    pub async fn initialize(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
