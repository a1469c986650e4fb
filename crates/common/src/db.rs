//! SQLite persistence for the federation node's tables (§6 "Persisted state").

use crate::Result;
use parking_lot::Mutex;
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Database wrapper shared by every component that persists rows.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Expose the underlying connection for subsystems that own bespoke SQL
    /// (lease allocation, priority-pool selection) against the shared store.
    pub fn connection(&self) -> Arc<Mutex<Connection>> {
        self.conn.clone()
    }

    /// Open or create the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;

        info!("Opened database at {:?}", path.as_ref());
        Ok(db)
    }

    /// Open an in-memory database (tests and `CI_MODE`).
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            -- Worker inventory (C7). Natural key (ip, mining_pool_uid).
            CREATE TABLE IF NOT EXISTS workers (
                id TEXT PRIMARY KEY,
                ip TEXT NOT NULL,
                mining_pool_uid TEXT NOT NULL,
                spec TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'tbd',
                last_tested_at INTEGER,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_workers_natural_key ON workers(ip, mining_pool_uid);
            CREATE INDEX IF NOT EXISTS idx_workers_status ON workers(status);
            CREATE INDEX IF NOT EXISTS idx_workers_country ON workers(json_extract(spec, '$.country_code'));
            CREATE INDEX IF NOT EXISTS idx_workers_pool ON workers(mining_pool_uid);

            -- Mining pool registry + scores (C9).
            CREATE TABLE IF NOT EXISTS mining_pools (
                mining_pool_uid TEXT PRIMARY KEY,
                url TEXT NOT NULL,
                ip TEXT,
                last_known_worker_pool_size INTEGER NOT NULL DEFAULT 0,
                last_scored_at INTEGER,
                score TEXT NOT NULL DEFAULT '{"stability":0,"size":0,"performance":0,"geo":0,"composite":0}',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            -- WireGuard peer-slot leases (C4). A row exists iff the slot is leased (§3 invariant).
            CREATE TABLE IF NOT EXISTS worker_wireguard_configs (
                id INTEGER PRIMARY KEY,
                expires_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_wg_leases_expires ON worker_wireguard_configs(expires_at);

            -- SOCKS5 credential pool (C5).
            CREATE TABLE IF NOT EXISTS worker_socks5_configs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                username TEXT NOT NULL UNIQUE,
                ip_address TEXT NOT NULL,
                port INTEGER NOT NULL,
                password TEXT NOT NULL,
                available INTEGER NOT NULL DEFAULT 1,
                expires_at INTEGER NOT NULL DEFAULT 0,
                updated_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_socks5_available ON worker_socks5_configs(available, id);
            CREATE INDEX IF NOT EXISTS idx_socks5_expires ON worker_socks5_configs(expires_at);

            -- Challenge/response probes (§3 `ChallengeSolution`).
            CREATE TABLE IF NOT EXISTS challenge_response (
                challenge TEXT PRIMARY KEY,
                solution TEXT NOT NULL,
                tag TEXT,
                created_at INTEGER NOT NULL
            );

            -- Request tickets are in-memory per §3; this table exists only so a restarted
            -- process can observe tickets that outlived it during a graceful-shutdown race.
            -- It is swept on the same TTL as the in-memory cache and is never relied upon
            -- as the source of truth.
            CREATE TABLE IF NOT EXISTS request_tickets (
                request_id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );

            -- Generic key-value store for scheduler bookkeeping (last-run timestamps, etc).
            CREATE TABLE IF NOT EXISTS kv_store (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );
            "#,
        )?;

        debug!("database schema initialized");
        Ok(())
    }

    // ========================================================================
    // Key-value store
    // ========================================================================

    pub fn kv_set(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock();
        let now = chrono::Utc::now().timestamp();
        conn.execute(
            "INSERT INTO kv_store (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            rusqlite::params![key, value, now],
        )?;
        Ok(())
    }

    pub fn kv_get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let value = conn
            .query_row(
                "SELECT value FROM kv_store WHERE key = ?1",
                rusqlite::params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }
}

use rusqlite::OptionalExtension;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kv_roundtrip() {
        let db = Database::open_memory().unwrap();
        assert_eq!(db.kv_get("missing").unwrap(), None);
        db.kv_set("last_score_run", "12345").unwrap();
        assert_eq!(db.kv_get("last_score_run").unwrap(), Some("12345".to_string()));
        db.kv_set("last_score_run", "67890").unwrap();
        assert_eq!(db.kv_get("last_score_run").unwrap(), Some("67890".to_string()));
    }

    #[test]
    fn schema_bootstraps_without_error() {
        let db = Database::open_memory().unwrap();
        let conn = db.connection();
        let conn = conn.lock();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='workers'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
    }
}
