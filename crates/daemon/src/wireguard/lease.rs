//! WireGuard peer-id lease allocator (C4, §4.4).

use rusqlite::OptionalExtension;
use tpn_common::{Database, Error, NamedLockRegistry, Result};
use tracing::{info, warn};

use super::driver::WireGuardDriver;

/// `[start_id..end_id]` request range (§4.4). Priority requests use
/// `[1..priority_slots]`, standard use `[priority_slots+1..peer_count]`,
/// falling back to the full range if `priority_slots >= peer_count`.
#[derive(Debug, Clone, Copy)]
pub struct LeaseRange {
    pub start_id: u32,
    pub end_id: u32,
}

impl LeaseRange {
    pub fn full(peer_count: u32) -> Self {
        Self { start_id: 1, end_id: peer_count }
    }

    pub fn priority(priority_slots: u32) -> Self {
        Self { start_id: 1, end_id: priority_slots }
    }

    pub fn standard(priority_slots: u32, peer_count: u32) -> Self {
        if priority_slots >= peer_count {
            Self::full(peer_count)
        } else {
            Self { start_id: priority_slots + 1, end_id: peer_count }
        }
    }
}

/// Owns the `worker_wireguard_configs` table: a row exists iff its `peer_id`
/// is leased (§3 `WireGuardLease` invariant).
pub struct WireGuardLeaseStore {
    db: Database,
    locks: NamedLockRegistry,
    restart_on_cleanup_if_idle: bool,
    refresh_instead_of_delete: bool,
}

const LOCK_NAME: &str = "register_wireguard_lease";

impl WireGuardLeaseStore {
    pub fn new(db: Database, locks: NamedLockRegistry, refresh_instead_of_delete: bool) -> Self {
        Self {
            db,
            locks,
            restart_on_cleanup_if_idle: true,
            refresh_instead_of_delete,
        }
    }

    /// Pick the smallest unleased id in `range`, insert its row, and return it.
    /// `None` means the range is exactly full.
    fn try_allocate(&self, range: LeaseRange, expires_at: i64) -> Result<Option<u32>> {
        let conn = self.db.connection();
        let conn = conn.lock();

        // Single set-difference query: generate the candidate id sequence and
        // anti-join against the lease table, rather than probing each id in turn.
        let picked: Option<u32> = conn
            .query_row(
                r#"
                WITH RECURSIVE ids(id) AS (
                    SELECT ?1
                    UNION ALL
                    SELECT id + 1 FROM ids WHERE id < ?2
                )
                SELECT ids.id FROM ids
                LEFT JOIN worker_wireguard_configs w ON w.id = ids.id
                WHERE w.id IS NULL
                ORDER BY ids.id
                LIMIT 1
                "#,
                rusqlite::params![range.start_id, range.end_id],
                |row| row.get(0),
            )
            .optional()?;

        let Some(id) = picked else {
            return Ok(None);
        };

        let now = chrono::Utc::now().timestamp();
        conn.execute(
            "INSERT INTO worker_wireguard_configs (id, expires_at, updated_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![id, expires_at, now],
        )?;
        Ok(Some(id))
    }

    /// `register_wireguard_lease` (§4.4 steps 1-4). Does not itself wait for
    /// `wireguard_server_ready` — callers in the pipeline (C11) own that wait
    /// since only they know the grace window policy for the calling mode.
    pub async fn register_wireguard_lease(&self, range: LeaseRange, expires_at: i64) -> Result<u32> {
        let first = self
            .locks
            .with_lock(LOCK_NAME, None, || {
                let r = self.try_allocate(range, expires_at);
                async move { r }
            })
            .await?;

        if let Some(id) = first {
            return Ok(id);
        }

        // Outside the lock, per §4.4 step 2: cleanup then retry once.
        self.cleanup_expired_wireguard_configs(None).await?;

        let second = self
            .locks
            .with_lock(LOCK_NAME, None, || {
                let r = self.try_allocate(range, expires_at);
                async move { r }
            })
            .await?;

        second.ok_or_else(|| {
            let soonest = self.soonest_expiry(range).unwrap_or(None);
            Error::LeasePoolExhausted {
                diagnostic: match soonest {
                    Some(at) => format!(
                        "no WireGuard peer ids free in [{}..{}], soonest expiry at {}",
                        range.start_id, range.end_id, at
                    ),
                    None => format!("no WireGuard peer ids free in [{}..{}]", range.start_id, range.end_id),
                },
            }
        })
    }

    fn soonest_expiry(&self, range: LeaseRange) -> Result<Option<i64>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let expiry = conn
            .query_row(
                "SELECT MIN(expires_at) FROM worker_wireguard_configs WHERE id BETWEEN ?1 AND ?2",
                rusqlite::params![range.start_id, range.end_id],
                |row| row.get(0),
            )
            .optional()?
            .flatten();
        Ok(expiry)
    }

    /// `cleanup_expired_wireguard_configs` (§4.4). In delete mode, restarts the
    /// container only if no open leases remain (a restart would disrupt them).
    /// In refresh mode, rotates keys in place and never restarts.
    pub async fn cleanup_expired_wireguard_configs(&self, driver: Option<&WireGuardDriver>) -> Result<Vec<u32>> {
        let now = chrono::Utc::now().timestamp();
        let expired_ids: Vec<u32> = {
            let conn = self.db.connection();
            let conn = conn.lock();
            let mut stmt = conn.prepare("SELECT id FROM worker_wireguard_configs WHERE expires_at < ?1")?;
            let rows = stmt.query_map(rusqlite::params![now], |row| row.get(0))?;
            rows.collect::<std::result::Result<_, _>>()?
        };

        if expired_ids.is_empty() {
            return Ok(expired_ids);
        }

        if self.refresh_instead_of_delete {
            if let Some(driver) = driver {
                driver.replace_wireguard_configs(Some(expired_ids.clone())).await?;
            }
        } else if let Some(driver) = driver {
            driver.delete_wireguard_configs(&expired_ids).await?;

            let conn = self.db.connection();
            let open = {
                let conn = conn.lock();
                let count: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM worker_wireguard_configs WHERE expires_at >= ?1",
                    rusqlite::params![now],
                    |row| row.get(0),
                )?;
                count
            };
            if open == 0 && self.restart_on_cleanup_if_idle {
                driver.restart_wg_container().await?;
            }
        }

        let conn = self.db.connection();
        let conn = conn.lock();
        conn.execute(
            "DELETE FROM worker_wireguard_configs WHERE expires_at < ?1",
            rusqlite::params![now],
        )?;

        info!(count = expired_ids.len(), "cleaned up expired wireguard leases");
        Ok(expired_ids)
    }

    /// `check_open_leases` (§4.4): count of currently leased (non-expired) slots.
    pub fn check_open_leases(&self) -> Result<u32> {
        let now = chrono::Utc::now().timestamp();
        let conn = self.db.connection();
        let conn = conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM worker_wireguard_configs WHERE expires_at >= ?1",
            rusqlite::params![now],
            |row| row.get(0),
        )?;
        Ok(count as u32)
    }

    /// `mark_config_as_free` (§4.4): explicit early release, used by the
    /// feedback-URL cancellation path (§4.10).
    pub fn mark_config_as_free(&self, peer_id: u32) -> Result<()> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let removed = conn.execute(
            "DELETE FROM worker_wireguard_configs WHERE id = ?1",
            rusqlite::params![peer_id],
        )?;
        if removed == 0 {
            warn!(peer_id, "mark_config_as_free called on an id that was not leased");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tpn_common::Database;

    fn store(refresh: bool) -> WireGuardLeaseStore {
        WireGuardLeaseStore::new(Database::open_memory().unwrap(), NamedLockRegistry::new(), refresh)
    }

    #[tokio::test]
    async fn allocates_smallest_free_id() {
        let s = store(false);
        let range = LeaseRange::full(4);
        let a = s.register_wireguard_lease(range, chrono::Utc::now().timestamp() + 60).await.unwrap();
        let b = s.register_wireguard_lease(range, chrono::Utc::now().timestamp() + 60).await.unwrap();
        assert_eq!(a, 1);
        assert_eq!(b, 2);
    }

    #[tokio::test]
    async fn mark_config_as_free_frees_the_slot_for_reuse() {
        let s = store(false);
        let range = LeaseRange::full(2);
        let a = s.register_wireguard_lease(range, chrono::Utc::now().timestamp() + 60).await.unwrap();
        s.mark_config_as_free(a).unwrap();
        let reused = s.register_wireguard_lease(range, chrono::Utc::now().timestamp() + 60).await.unwrap();
        assert_eq!(reused, a);
    }

    #[tokio::test]
    async fn exhaustion_without_expired_rows_errors_with_diagnostic() {
        let s = store(false);
        let range = LeaseRange::full(1);
        s.register_wireguard_lease(range, chrono::Utc::now().timestamp() + 60).await.unwrap();
        let err = s.register_wireguard_lease(range, chrono::Utc::now().timestamp() + 60).await;
        assert!(matches!(err, Err(Error::LeasePoolExhausted { .. })));
    }

    #[tokio::test]
    async fn expired_rows_are_retried_and_reclaimed_without_a_driver() {
        let s = store(false);
        let range = LeaseRange::full(1);
        let expired_at = chrono::Utc::now().timestamp() - 5;
        s.register_wireguard_lease(range, expired_at).await.unwrap();
        let reclaimed = s.register_wireguard_lease(range, chrono::Utc::now().timestamp() + 60).await.unwrap();
        assert_eq!(reclaimed, 1);
    }

    #[test]
    fn priority_and_standard_ranges_partition_the_pool() {
        let priority = LeaseRange::priority(5);
        let standard = LeaseRange::standard(5, 254);
        assert_eq!((priority.start_id, priority.end_id), (1, 5));
        assert_eq!((standard.start_id, standard.end_id), (6, 254));
    }

    #[test]
    fn standard_range_falls_back_to_full_when_priority_covers_everything() {
        let standard = LeaseRange::standard(10, 8);
        assert_eq!((standard.start_id, standard.end_id), (1, 8));
    }
}
