//! SOCKS5 credential lease store (C5, §4.5).
//!
//! Rows ordered by `id ASC`. The first `priority_slots` rows form the
//! **priority pool** (shared, never marked unavailable); the remainder is the
//! **standard pool** (exclusive leases serialized by the `get_socks5_config`
//! named lock).

use rand::seq::SliceRandom;
use rusqlite::OptionalExtension;
use std::path::PathBuf;
use tpn_common::{Database, Error, NamedLockRegistry, Result, Socks5Credential};
use tracing::{info, warn};

use super::driver::DanteDriver;

const LOCK_NAME: &str = "get_socks5_config";

/// A provisioned SOCKS5 endpoint handed back to a lease caller.
#[derive(Debug, Clone, PartialEq)]
pub struct Socks5Lease {
    pub sock: Socks5Credential,
}

pub struct Socks5LeaseStore {
    db: Database,
    locks: NamedLockRegistry,
    password_dir: PathBuf,
}

impl Socks5LeaseStore {
    pub fn new(db: Database, locks: NamedLockRegistry, password_dir: PathBuf) -> Self {
        Self { db, locks, password_dir }
    }

    fn used_marker_path(&self, username: &str) -> PathBuf {
        self.password_dir.join(format!("{username}.password.used"))
    }

    /// `get_socks5_config` (§4.5).
    pub async fn get_socks5_config(
        &self,
        expires_at: i64,
        priority: bool,
        priority_slots: u32,
        driver: Option<&DanteDriver>,
    ) -> Result<Socks5Lease> {
        if priority {
            return self.get_priority(expires_at, priority_slots);
        }

        let first = self
            .locks
            .with_lock(LOCK_NAME, None, || {
                let r = self.try_lease_standard(expires_at, priority_slots);
                async move { r }
            })
            .await?;

        if let Some(sock) = first {
            self.write_used_marker(&sock).await?;
            return Ok(Socks5Lease { sock });
        }

        self.cleanup_expired_dante_socks5_configs(driver).await?;

        let second = self
            .locks
            .with_lock(LOCK_NAME, None, || {
                let r = self.try_lease_standard(expires_at, priority_slots);
                async move { r }
            })
            .await?;

        match second {
            Some(sock) => {
                self.write_used_marker(&sock).await?;
                Ok(Socks5Lease { sock })
            }
            None => {
                let soonest = self.soonest_expiry(priority_slots)?;
                Err(Error::LeasePoolExhausted {
                    diagnostic: match soonest {
                        Some(at) => format!("no standard SOCKS5 credentials free, soonest expiring at {at}"),
                        None => "no standard SOCKS5 credentials free".to_string(),
                    },
                })
            }
        }
    }

    /// Priority path: no mutex, row may be shared across concurrent callers
    /// (§8 scenario 3). `available` is never touched.
    fn get_priority(&self, expires_at: i64, priority_slots: u32) -> Result<Socks5Lease> {
        let conn = self.db.connection();
        let conn = conn.lock();

        let mut stmt = conn.prepare(
            "SELECT id, ip_address, port, username, password, available, expires_at, updated_at
             FROM worker_socks5_configs WHERE available = 1 ORDER BY id ASC LIMIT ?1",
        )?;
        let rows: Vec<Socks5Credential> = stmt
            .query_map(rusqlite::params![priority_slots], row_to_credential)?
            .collect::<std::result::Result<_, _>>()?;
        drop(stmt);

        let Some(chosen) = rows.choose(&mut rand::thread_rng()).cloned() else {
            return Err(Error::LeasePoolExhausted {
                diagnostic: "no priority SOCKS5 credentials configured".to_string(),
            });
        };

        let now = chrono::Utc::now().timestamp();
        conn.execute(
            "UPDATE worker_socks5_configs SET expires_at = ?1, updated_at = ?2 WHERE id = ?3",
            rusqlite::params![expires_at, now, chosen.id],
        )?;

        Ok(Socks5Lease {
            sock: Socks5Credential { expires_at, ..chosen },
        })
    }

    fn try_lease_standard(&self, expires_at: i64, priority_slots: u32) -> Result<Option<Socks5Credential>> {
        let conn = self.db.connection();
        let conn = conn.lock();

        let picked: Option<Socks5Credential> = conn
            .query_row(
                "SELECT id, ip_address, port, username, password, available, expires_at, updated_at
                 FROM worker_socks5_configs
                 WHERE available = 1
                 ORDER BY id ASC LIMIT 1 OFFSET ?1",
                rusqlite::params![priority_slots],
                row_to_credential,
            )
            .optional()?;

        let Some(row) = picked else {
            return Ok(None);
        };

        let now = chrono::Utc::now().timestamp();
        conn.execute(
            "UPDATE worker_socks5_configs SET available = 0, expires_at = ?1, updated_at = ?2 WHERE id = ?3",
            rusqlite::params![expires_at, now, row.id],
        )?;

        Ok(Some(Socks5Credential {
            available: false,
            expires_at,
            updated_at: now,
            ..row
        }))
    }

    async fn write_used_marker(&self, sock: &Socks5Credential) -> Result<()> {
        tokio::fs::create_dir_all(&self.password_dir).await?;
        tokio::fs::write(self.used_marker_path(&sock.username), sock.expires_at.to_string()).await?;
        Ok(())
    }

    fn soonest_expiry(&self, priority_slots: u32) -> Result<Option<i64>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let expiry = conn
            .query_row(
                "SELECT MIN(expires_at) FROM worker_socks5_configs
                 WHERE id NOT IN (SELECT id FROM worker_socks5_configs ORDER BY id ASC LIMIT ?1)",
                rusqlite::params![priority_slots],
                |row| row.get(0),
            )
            .optional()?
            .flatten();
        Ok(expiry)
    }

    /// `write_socks` (§4.5): dedupe by `username`, upsert, delete rows whose
    /// username isn't in the incoming set (empty input deletes everything).
    pub fn write_socks(&self, socks: &[Socks5Credential]) -> Result<()> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let now = chrono::Utc::now().timestamp();

        let mut seen = std::collections::HashSet::new();
        let mut deduped = Vec::new();
        for sock in socks {
            if seen.insert(sock.username.clone()) {
                deduped.push(sock);
            }
        }

        for sock in &deduped {
            conn.execute(
                "INSERT INTO worker_socks5_configs (username, ip_address, port, password, available, expires_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(username) DO UPDATE SET password = excluded.password, updated_at = excluded.updated_at",
                rusqlite::params![sock.username, sock.ip_address, sock.port, sock.password, sock.available, sock.expires_at, now],
            )?;
        }

        if deduped.is_empty() {
            conn.execute("DELETE FROM worker_socks5_configs", [])?;
        } else {
            let placeholders = deduped.iter().map(|_| "?").collect::<Vec<_>>().join(",");
            let sql = format!("DELETE FROM worker_socks5_configs WHERE username NOT IN ({placeholders})");
            let params: Vec<&dyn rusqlite::ToSql> = deduped.iter().map(|s| &s.username as &dyn rusqlite::ToSql).collect();
            conn.execute(&sql, params.as_slice())?;
        }

        Ok(())
    }

    /// `cleanup_expired_dante_socks5_configs` (§4.5): regenerate each expired
    /// credential's password; drop rows whose regeneration fails.
    pub async fn cleanup_expired_dante_socks5_configs(&self, driver: Option<&DanteDriver>) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        let expired: Vec<Socks5Credential> = {
            let conn = self.db.connection();
            let conn = conn.lock();
            let mut stmt = conn.prepare(
                "SELECT id, ip_address, port, username, password, available, expires_at, updated_at
                 FROM worker_socks5_configs WHERE expires_at > 0 AND expires_at <= ?1",
            )?;
            let rows = stmt.query_map(rusqlite::params![now], row_to_credential)?;
            rows.collect::<std::result::Result<_, _>>()?
        };

        if expired.is_empty() {
            return Ok(());
        }

        for cred in &expired {
            let regenerated = match driver {
                Some(driver) => driver.regenerate_dante_socks5_config(&cred.username).await,
                None => Ok(cred.password.clone()),
            };

            let conn = self.db.connection();
            let conn = conn.lock();
            match regenerated {
                Ok(new_password) => {
                    conn.execute(
                        "UPDATE worker_socks5_configs SET available = 1, expires_at = 0, password = ?1, updated_at = ?2
                         WHERE id = ?3",
                        rusqlite::params![new_password, chrono::Utc::now().timestamp(), cred.id],
                    )?;
                }
                Err(e) => {
                    warn!(username = %cred.username, error = %e, "dante regeneration failed, dropping credential");
                    conn.execute("DELETE FROM worker_socks5_configs WHERE id = ?1", rusqlite::params![cred.id])?;
                }
            }
        }

        info!(count = expired.len(), "cleaned up expired socks5 credentials");
        Ok(())
    }

    /// `count_available_socks` (§4.5): `|available rows with id > skip_slots|`.
    pub fn count_available_socks(&self, skip_slots: u32) -> Result<u32> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM worker_socks5_configs
             WHERE available = 1 AND id NOT IN (SELECT id FROM worker_socks5_configs ORDER BY id ASC LIMIT ?1)",
            rusqlite::params![skip_slots],
            |row| row.get(0),
        )?;
        Ok(count as u32)
    }
}

fn row_to_credential(row: &rusqlite::Row) -> rusqlite::Result<Socks5Credential> {
    Ok(Socks5Credential {
        id: row.get(0)?,
        ip_address: row.get(1)?,
        port: row.get(2)?,
        username: row.get(3)?,
        password: row.get(4)?,
        available: row.get(5)?,
        expires_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> Socks5LeaseStore {
        Socks5LeaseStore::new(
            Database::open_memory().unwrap(),
            NamedLockRegistry::new(),
            std::env::temp_dir().join("tpn-socks5-test"),
        )
    }

    fn sample(username: &str) -> Socks5Credential {
        Socks5Credential {
            id: 0,
            ip_address: "203.0.113.9".to_string(),
            port: 1080,
            username: username.to_string(),
            password: "initial".to_string(),
            available: true,
            expires_at: 0,
            updated_at: 0,
        }
    }

    #[tokio::test]
    async fn write_socks_upserts_and_deletes_missing() {
        let store = store();
        store.write_socks(&[sample("alice"), sample("bob")]).unwrap();
        assert_eq!(store.count_available_socks(0).unwrap(), 2);

        store.write_socks(&[sample("alice")]).unwrap();
        assert_eq!(store.count_available_socks(0).unwrap(), 1);
    }

    #[tokio::test]
    async fn write_socks_dedupes_by_username() {
        let store = store();
        let mut a = sample("carol");
        a.password = "first".to_string();
        let mut b = sample("carol");
        b.password = "second".to_string();
        store.write_socks(&[a, b]).unwrap();
        assert_eq!(store.count_available_socks(0).unwrap(), 1);
    }

    #[tokio::test]
    async fn write_socks_empty_input_deletes_all() {
        let store = store();
        store.write_socks(&[sample("dave")]).unwrap();
        store.write_socks(&[]).unwrap();
        assert_eq!(store.count_available_socks(0).unwrap(), 0);
    }

    #[tokio::test]
    async fn standard_lease_marks_unavailable_and_is_exclusive() {
        let store = store();
        store.write_socks(&[sample("erin"), sample("frank")]).unwrap();

        let first = store.get_socks5_config(chrono::Utc::now().timestamp() + 60, false, 0, None).await.unwrap();
        let second = store.get_socks5_config(chrono::Utc::now().timestamp() + 60, false, 0, None).await.unwrap();
        assert_ne!(first.sock.username, second.sock.username);
        assert_eq!(store.count_available_socks(0).unwrap(), 0);
    }

    #[tokio::test]
    async fn priority_lease_never_flips_available() {
        let store = store();
        store.write_socks(&[sample("gina"), sample("hank")]).unwrap();

        for _ in 0..10 {
            let lease = store.get_socks5_config(chrono::Utc::now().timestamp() + 60, true, 2, None).await.unwrap();
            assert!(["gina", "hank"].contains(&lease.sock.username.as_str()));
        }
        assert_eq!(store.count_available_socks(0).unwrap(), 2);
    }

    #[tokio::test]
    async fn standard_exhaustion_without_cleanup_errors() {
        let store = store();
        store.write_socks(&[sample("iris")]).unwrap();
        store.get_socks5_config(chrono::Utc::now().timestamp() + 60, false, 0, None).await.unwrap();
        let err = store.get_socks5_config(chrono::Utc::now().timestamp() + 60, false, 0, None).await;
        assert!(matches!(err, Err(Error::LeasePoolExhausted { .. })));
    }

    #[tokio::test]
    async fn count_available_socks_skips_priority_slots() {
        let store = store();
        store.write_socks(&[sample("j"), sample("k"), sample("l")]).unwrap();
        assert_eq!(store.count_available_socks(1).unwrap(), 2);
    }
}
