//! Worker inventory (C7, §4.7).
//!
//! Each row's natural key is `(ip, mining_pool_uid)` (§3). The full [`Worker`]
//! is stored as a JSON blob alongside indexed scalar columns so the query
//! surface (`get_workers`) can filter without deserializing every row.

use rusqlite::OptionalExtension;
use tpn_common::{ConnectionType, Database, Result, Worker, WorkerStatus};
use tracing::debug;

/// Filter/options for [`WorkerInventory::get_workers`] (§4.7).
#[derive(Debug, Clone, Default)]
pub struct WorkerQuery {
    pub country_code: Option<String>,
    pub status: Option<WorkerStatus>,
    pub mining_pool_uid: Option<String>,
    pub connection_type: Option<ConnectionType>,
    pub randomize: bool,
    pub limit: Option<u32>,
}

pub struct WorkerInventory {
    db: Database,
}

impl WorkerInventory {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// `get_workers` (§4.7).
    pub fn get_workers(&self, query: &WorkerQuery) -> Result<Vec<Worker>> {
        let conn = self.db.connection();
        let conn = conn.lock();

        let mut sql = String::from("SELECT spec FROM workers WHERE 1=1");
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(country) = &query.country_code {
            sql.push_str(" AND json_extract(spec, '$.country_code') = ?");
            params.push(Box::new(country.clone()));
        }
        if let Some(status) = query.status {
            sql.push_str(" AND status = ?");
            params.push(Box::new(status_str(status).to_string()));
        }
        if let Some(uid) = &query.mining_pool_uid {
            sql.push_str(" AND mining_pool_uid = ?");
            params.push(Box::new(uid.clone()));
        }
        if let Some(conn_type) = query.connection_type {
            sql.push_str(" AND json_extract(spec, '$.connection_type') = ?");
            params.push(Box::new(connection_type_str(conn_type).to_string()));
        }

        if query.randomize {
            sql.push_str(" ORDER BY RANDOM()");
        } else {
            sql.push_str(" ORDER BY updated_at DESC");
        }
        if let Some(limit) = query.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let mut stmt = conn.prepare(&sql)?;
        let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();
        let rows = stmt.query_map(param_refs.as_slice(), |row| {
            let raw: String = row.get(0)?;
            Ok(raw)
        })?;

        let mut out = Vec::new();
        for raw in rows {
            let raw = raw?;
            out.push(serde_json::from_str(&raw).map_err(tpn_common::Error::from)?);
        }
        Ok(out)
    }

    /// `write_workers` (§4.7): upsert each by natural key `(ip,
    /// mining_pool_uid)`, then soft-delete by absence — any existing row for
    /// this `mining_pool_uid` whose ip wasn't in the incoming set is dropped,
    /// since a broadcast is the pool's full worker list (§3 `Worker`
    /// lifecycle: "soft-deleted by absence-after-sweep on a full
    /// re-broadcast"). An empty `workers` slice therefore clears the pool's
    /// rows entirely, mirroring `write_socks`'s empty-input behavior.
    /// `mining_pool_ip` is accepted to match the teacher's
    /// broadcast-source-tagging idiom but is not part of the `Worker` record
    /// itself — it is recorded against the owning `MiningPool` row by the
    /// caller (scorer/pipeline), not here.
    pub fn write_workers(&self, workers: &[Worker], mining_pool_uid: &str, _mining_pool_ip: Option<std::net::IpAddr>) -> Result<()> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let now = chrono::Utc::now().timestamp();

        for worker in workers {
            let id = format!("{}:{}", worker.ip, mining_pool_uid);
            let spec = serde_json::to_string(worker)?;
            conn.execute(
                "INSERT INTO workers (id, ip, mining_pool_uid, spec, status, last_tested_at, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
                 ON CONFLICT(ip, mining_pool_uid) DO UPDATE SET
                    spec = excluded.spec, status = excluded.status,
                    last_tested_at = excluded.last_tested_at, updated_at = excluded.updated_at",
                rusqlite::params![
                    id,
                    worker.ip.to_string(),
                    mining_pool_uid,
                    spec,
                    status_str(worker.status),
                    worker.last_tested_at,
                    now,
                ],
            )?;
        }

        if workers.is_empty() {
            conn.execute("DELETE FROM workers WHERE mining_pool_uid = ?1", rusqlite::params![mining_pool_uid])?;
        } else {
            let placeholders = workers.iter().map(|_| "?").collect::<Vec<_>>().join(",");
            let sql = format!(
                "DELETE FROM workers WHERE mining_pool_uid = ? AND ip NOT IN ({placeholders})"
            );
            let mut params: Vec<&dyn rusqlite::ToSql> = vec![&mining_pool_uid];
            let ip_strings: Vec<String> = workers.iter().map(|w| w.ip.to_string()).collect();
            for ip in &ip_strings {
                params.push(ip);
            }
            conn.execute(&sql, params.as_slice())?;
        }

        debug!(count = workers.len(), mining_pool_uid, "wrote worker broadcast");
        Ok(())
    }

    /// `write_worker_performance` (§4.8 step 4): persist scorer results
    /// (status, `last_tested_at`, refreshed geodata) onto existing rows.
    pub fn write_worker_performance(&self, workers: &[Worker]) -> Result<()> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let now = chrono::Utc::now().timestamp();

        for worker in workers {
            let spec = serde_json::to_string(worker)?;
            conn.execute(
                "UPDATE workers SET spec = ?1, status = ?2, last_tested_at = ?3, updated_at = ?4
                 WHERE ip = ?5 AND mining_pool_uid = ?6",
                rusqlite::params![
                    spec,
                    status_str(worker.status),
                    worker.last_tested_at,
                    now,
                    worker.ip.to_string(),
                    worker.mining_pool_uid,
                ],
            )?;
        }
        Ok(())
    }

    /// Look up a single worker by natural key, used by the pipeline to
    /// validate a self-registering worker's claimed identity.
    pub fn get_worker(&self, ip: std::net::Ipv4Addr, mining_pool_uid: &str) -> Result<Option<Worker>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let raw: Option<String> = conn
            .query_row(
                "SELECT spec FROM workers WHERE ip = ?1 AND mining_pool_uid = ?2",
                rusqlite::params![ip.to_string(), mining_pool_uid],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(|raw| serde_json::from_str(&raw).map_err(tpn_common::Error::from)).transpose()
    }
}

fn status_str(status: WorkerStatus) -> &'static str {
    match status {
        WorkerStatus::Tbd => "tbd",
        WorkerStatus::Up => "up",
        WorkerStatus::Down => "down",
    }
}

fn connection_type_str(t: ConnectionType) -> &'static str {
    match t {
        ConnectionType::Datacenter => "datacenter",
        ConnectionType::Residential => "residential",
        ConnectionType::Unknown => "unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(ip: &str) -> Worker {
        Worker {
            ip: ip.parse().unwrap(),
            public_port: 3000,
            country_code: Some("US".to_string()),
            connection_type: ConnectionType::Datacenter,
            mining_pool_url: "http://pool.example".to_string(),
            mining_pool_uid: "internal".to_string(),
            payment_address_evm: None,
            payment_address_bittensor: None,
            status: WorkerStatus::Up,
            last_tested_at: None,
            wireguard_config: None,
            socks5_config: None,
            datacenter: Some(true),
            version: None,
        }
    }

    #[test]
    fn write_then_query_by_status_and_country() {
        let inventory = WorkerInventory::new(Database::open_memory().unwrap());
        inventory.write_workers(&[sample("198.51.100.7")], "internal", None).unwrap();

        let found = inventory
            .get_workers(&WorkerQuery {
                country_code: Some("US".to_string()),
                status: Some(WorkerStatus::Up),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].ip.to_string(), "198.51.100.7");
    }

    #[test]
    fn write_workers_upserts_by_natural_key() {
        let inventory = WorkerInventory::new(Database::open_memory().unwrap());
        inventory.write_workers(&[sample("198.51.100.7")], "internal", None).unwrap();

        let mut updated = sample("198.51.100.7");
        updated.status = WorkerStatus::Down;
        inventory.write_workers(&[updated], "internal", None).unwrap();

        let found = inventory.get_worker("198.51.100.7".parse().unwrap(), "internal").unwrap().unwrap();
        assert_eq!(found.status, WorkerStatus::Down);

        let all = inventory.get_workers(&WorkerQuery::default()).unwrap();
        assert_eq!(all.len(), 1, "upsert must not create a duplicate row");
    }

    #[test]
    fn full_rebroadcast_soft_deletes_workers_missing_from_the_new_list() {
        let inventory = WorkerInventory::new(Database::open_memory().unwrap());
        inventory
            .write_workers(&[sample("198.51.100.1"), sample("198.51.100.2")], "poolA", None)
            .unwrap();
        assert_eq!(inventory.get_workers(&WorkerQuery { mining_pool_uid: Some("poolA".to_string()), ..Default::default() }).unwrap().len(), 2);

        inventory.write_workers(&[sample("198.51.100.1")], "poolA", None).unwrap();
        let remaining = inventory.get_workers(&WorkerQuery { mining_pool_uid: Some("poolA".to_string()), ..Default::default() }).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].ip.to_string(), "198.51.100.1");
    }

    #[test]
    fn full_rebroadcast_does_not_touch_other_pools() {
        let inventory = WorkerInventory::new(Database::open_memory().unwrap());
        inventory.write_workers(&[sample("198.51.100.9")], "poolB", None).unwrap();
        inventory.write_workers(&[sample("198.51.100.1")], "poolA", None).unwrap();

        let pool_b = inventory.get_workers(&WorkerQuery { mining_pool_uid: Some("poolB".to_string()), ..Default::default() }).unwrap();
        assert_eq!(pool_b.len(), 1, "rebroadcasting poolA must not sweep poolB's rows");
    }

    #[test]
    fn limit_caps_result_count() {
        let inventory = WorkerInventory::new(Database::open_memory().unwrap());
        inventory
            .write_workers(&[sample("198.51.100.1"), sample("198.51.100.2"), sample("198.51.100.3")], "internal", None)
            .unwrap();
        let found = inventory.get_workers(&WorkerQuery { limit: Some(2), ..Default::default() }).unwrap();
        assert_eq!(found.len(), 2);
    }
}
