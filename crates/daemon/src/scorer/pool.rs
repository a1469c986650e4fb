//! Mining-pool scorer (C9, §4.9).

use async_trait::async_trait;
use futures::future::join_all;
use rusqlite::OptionalExtension;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use tpn_common::{Database, MiningPool, MiningPoolScore, NamedLockRegistry, Result};
use tracing::info;

use crate::neuron::NeuronClient;
use crate::workers::{WorkerInventory, WorkerQuery};

const LOCK_NAME: &str = "score_mining_pools";

/// Per-pool facts gathered before sub-scoring (§4.9).
struct PoolFacts {
    pool: MiningPool,
    worker_count: u64,
    countries: std::collections::HashSet<String>,
    avg_latency_ms: f64,
    success_rate: f64,
}

/// Probes a mining pool's identity endpoint and returns observed latency +
/// success, used to build [`PoolFacts`]. A seam so tests don't need a real
/// network round-trip (§9 Design Notes: typed driver over subprocess/HTTP).
#[async_trait]
pub trait PoolProbe: Send + Sync {
    async fn probe(&self, pool: &MiningPool) -> Option<std::time::Duration>;
}

pub struct HttpPoolProbe {
    client: reqwest::Client,
}

impl HttpPoolProbe {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(5))
                .build()
                .expect("reqwest client"),
        }
    }
}

impl Default for HttpPoolProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PoolProbe for HttpPoolProbe {
    async fn probe(&self, pool: &MiningPool) -> Option<std::time::Duration> {
        let started = std::time::Instant::now();
        self.client.get(&pool.url).send().await.ok()?;
        Some(started.elapsed())
    }
}

/// `size_score` (§4.9): monotonic in worker count, saturating at 100 workers.
fn size_score(worker_count: u64) -> f64 {
    (worker_count as f64 / 100.0).min(1.0)
}

/// `geo_score` (§4.9): geographic diversity of the pool's worker countries,
/// saturating at 10 distinct countries.
fn geo_score(distinct_countries: usize) -> f64 {
    (distinct_countries as f64 / 10.0).min(1.0)
}

/// `performance_score` (§4.9): observed latency and success rate. Latency
/// degrades linearly from 1.0 at 0ms to 0.0 at 2000ms, weighted against the
/// observed success rate.
fn performance_score(avg_latency_ms: f64, success_rate: f64) -> f64 {
    let latency_component = (1.0 - (avg_latency_ms / 2000.0)).clamp(0.0, 1.0);
    (latency_component * 0.5 + success_rate * 0.5).clamp(0.0, 1.0)
}

/// `stability_score` (§4.9): EMA of `up` status over recent cycles.
fn stability_score(previous_ema: f64, was_reachable: bool, alpha: f64) -> f64 {
    let sample = if was_reachable { 1.0 } else { 0.0 };
    previous_ema * (1.0 - alpha) + sample * alpha
}

/// `compute_composite_score` (§4.9): an externally-owned policy per the Open
/// Question in §9/SPEC_FULL.md — no reference weighting vector was supplied,
/// so this implementation uses an equal-weighted average, recorded as the
/// Open Question resolution in DESIGN.md.
pub fn compute_composite_score(sub: &MiningPoolScore) -> f64 {
    (sub.stability + sub.size + sub.performance + sub.geo) / 4.0
}

pub struct MiningPoolScorer {
    db: Database,
    locks: NamedLockRegistry,
    inventory: Arc<WorkerInventory>,
    neuron: Arc<dyn NeuronClient>,
    probe: Arc<dyn PoolProbe>,
    ema_alpha: f64,
}

impl MiningPoolScorer {
    pub fn new(db: Database, locks: NamedLockRegistry, inventory: Arc<WorkerInventory>, neuron: Arc<dyn NeuronClient>, probe: Arc<dyn PoolProbe>) -> Self {
        Self { db, locks, inventory, neuron, probe, ema_alpha: 0.3 }
    }

    /// `GET /api/stats/pools` and `GET /validator/score/audit/:pool_uid` (§6)
    /// read the same rows this scorer writes; exposed for the web surface.
    pub fn list_pools(&self) -> Result<Vec<MiningPool>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let mut stmt = conn.prepare(
            "SELECT mining_pool_uid, url, ip, last_known_worker_pool_size, last_scored_at, score FROM mining_pools",
        )?;
        let rows = stmt.query_map([], |row| {
            let score_json: String = row.get(5)?;
            let ip: Option<String> = row.get(2)?;
            Ok(MiningPool {
                mining_pool_uid: row.get(0)?,
                url: row.get(1)?,
                ip: ip.and_then(|s| s.parse().ok()),
                last_known_worker_pool_size: row.get::<_, i64>(3)? as u64,
                last_scored_at: row.get(4)?,
                score: serde_json::from_str(&score_json).unwrap_or_default(),
            })
        })?;
        Ok(rows.collect::<std::result::Result<_, _>>()?)
    }

    /// Single-pool lookup backing `GET /validator/score/audit/:pool_uid` (§6).
    pub fn get_pool(&self, mining_pool_uid: &str) -> Result<Option<MiningPool>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let row: Option<(String, String, Option<String>, i64, Option<i64>, String)> = conn
            .query_row(
                "SELECT mining_pool_uid, url, ip, last_known_worker_pool_size, last_scored_at, score FROM mining_pools WHERE mining_pool_uid = ?1",
                rusqlite::params![mining_pool_uid],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?, row.get(5)?)),
            )
            .optional()?;

        let Some((mining_pool_uid, url, ip, last_known_worker_pool_size, last_scored_at, score_json)) = row else {
            return Ok(None);
        };
        Ok(Some(MiningPool {
            mining_pool_uid,
            url,
            ip: ip.and_then(|s| s.parse().ok()),
            last_known_worker_pool_size: last_known_worker_pool_size as u64,
            last_scored_at,
            score: serde_json::from_str(&score_json).unwrap_or_default(),
        }))
    }

    /// `POST /validator/broadcast/mining_pool` (§6): a pool registering or
    /// re-announcing itself. Insert with a zeroed score if unseen; otherwise
    /// only refresh `url`/`ip`, leaving the scored fields to the next tick.
    pub fn upsert_pool(&self, mining_pool_uid: &str, url: &str, ip: Option<IpAddr>) -> Result<()> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let now = chrono::Utc::now().timestamp();
        let default_score = serde_json::to_string(&MiningPoolScore::default())?;
        conn.execute(
            "INSERT INTO mining_pools (mining_pool_uid, url, ip, last_known_worker_pool_size, last_scored_at, score, created_at, updated_at)
             VALUES (?1, ?2, ?3, 0, NULL, ?4, ?5, ?5)
             ON CONFLICT(mining_pool_uid) DO UPDATE SET url = excluded.url, ip = excluded.ip, updated_at = excluded.updated_at",
            rusqlite::params![mining_pool_uid, url, ip.map(|ip| ip.to_string()), default_score, now],
        )?;
        Ok(())
    }

    fn persist_score(&self, pool: &MiningPool) -> Result<()> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let score_json = serde_json::to_string(&pool.score)?;
        conn.execute(
            "UPDATE mining_pools SET score = ?1, last_scored_at = ?2, last_known_worker_pool_size = ?3, updated_at = ?2 WHERE mining_pool_uid = ?4",
            rusqlite::params![score_json, chrono::Utc::now().timestamp(), pool.last_known_worker_pool_size as i64, pool.mining_pool_uid],
        )?;
        Ok(())
    }

    /// `score_mining_pools` (§4.9). Serialized; returns `Ok(None)` if a
    /// previous run is still in progress.
    pub async fn score_mining_pools(&self) -> Result<Option<Vec<MiningPool>>> {
        let Some(_guard) = self.locks.try_acquire(LOCK_NAME) else {
            info!("score_mining_pools already running, skipping this tick");
            return Ok(None);
        };

        let known_ips: HashMap<String, IpAddr> = self.neuron.miner_uid_to_ip().await?;
        let pools = self.list_pools()?;

        let facts = join_all(pools.into_iter().filter_map(|pool| {
            let expected_ip = known_ips.get(&pool.mining_pool_uid).copied();
            match (pool.ip, expected_ip) {
                (Some(actual), Some(expected)) if actual == expected => Some(pool),
                _ => None,
            }
        }).map(|pool| async move {
            let workers = self.inventory.get_workers(&WorkerQuery {
                mining_pool_uid: Some(pool.mining_pool_uid.clone()),
                ..Default::default()
            }).unwrap_or_default();

            let countries: std::collections::HashSet<String> = workers.iter().filter_map(|w| w.country_code.clone()).collect();
            let worker_count = workers.len() as u64;

            let latency = self.probe.probe(&pool).await;
            let (avg_latency_ms, success_rate) = match latency {
                Some(d) => (d.as_millis() as f64, 1.0),
                None => (2000.0, 0.0),
            };

            PoolFacts { pool, worker_count, countries, avg_latency_ms, success_rate }
        }))
        .await;

        let mut scored = Vec::with_capacity(facts.len());
        for fact in facts {
            let mut pool = fact.pool;
            let was_reachable = fact.success_rate > 0.0;
            let sub = MiningPoolScore {
                stability: stability_score(pool.score.stability, was_reachable, self.ema_alpha),
                size: size_score(fact.worker_count),
                performance: performance_score(fact.avg_latency_ms, fact.success_rate),
                geo: geo_score(fact.countries.len()),
                composite: 0.0,
            };
            let composite = compute_composite_score(&sub);
            pool.score = MiningPoolScore { composite, ..sub };
            pool.last_known_worker_pool_size = fact.worker_count;
            self.persist_score(&pool)?;
            scored.push(pool);
        }

        info!(count = scored.len(), "scored mining pools");
        Ok(Some(scored))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_score_saturates_at_100_workers() {
        assert_eq!(size_score(100), 1.0);
        assert_eq!(size_score(200), 1.0);
        assert_eq!(size_score(50), 0.5);
    }

    #[test]
    fn geo_score_saturates_at_10_countries() {
        assert_eq!(geo_score(10), 1.0);
        assert_eq!(geo_score(20), 1.0);
        assert_eq!(geo_score(5), 0.5);
    }

    #[test]
    fn performance_score_rewards_low_latency_and_success() {
        assert_eq!(performance_score(0.0, 1.0), 1.0);
        assert!(performance_score(2000.0, 0.0) < 0.01);
    }

    #[test]
    fn stability_ema_moves_toward_new_sample() {
        let updated = stability_score(0.5, true, 0.3);
        assert!(updated > 0.5);
        let updated_down = stability_score(0.5, false, 0.3);
        assert!(updated_down < 0.5);
    }

    #[test]
    fn composite_is_equal_weighted_average() {
        let sub = MiningPoolScore { stability: 1.0, size: 1.0, performance: 0.0, geo: 0.0, composite: 0.0 };
        assert_eq!(compute_composite_score(&sub), 0.5);
    }
}
