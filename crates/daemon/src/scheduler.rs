//! Recurring-job scheduler (C12, §4.12).
//!
//! Each job is serialized by a dedicated named lock so overlapping ticks are
//! skipped rather than queued, mirroring the teacher's reconciler-loop idiom
//! of one spawned task per job with its own interval.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tpn_common::RunMode;
use tracing::{error, info};

use crate::dante::{DanteDriver, Socks5LeaseStore};
use crate::federation::FederationClient;
use crate::scorer::worker::WorkerConfigFetcher;
use crate::scorer::{MiningPoolScorer, WorkerScorer};
use crate::validators::ValidatorRegistry;
use crate::wireguard::{WireGuardDriver, WireGuardLeaseStore};

const SCORE_WORKERS_INTERVAL: Duration = Duration::from_secs(15 * 60);
const SCORE_POOLS_INTERVAL: Duration = Duration::from_secs(5 * 60);
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);
const REGISTER_POOL_INTERVAL: Duration = Duration::from_secs(60 * 60);
const REGISTER_WORKERS_INTERVAL: Duration = Duration::from_secs(15 * 60);
const WORKER_SCORE_BUDGET_MINUTES: u64 = 10;

/// Owns the set of spawned background tasks; dropping/aborting this stops
/// every recurring job (used by tests and graceful shutdown).
pub struct Scheduler {
    handles: Vec<JoinHandle<()>>,
}

impl Scheduler {
    /// Spawn the recurring jobs appropriate to `run_mode` (§4.12).
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        run_mode: RunMode,
        wg_leases: Arc<WireGuardLeaseStore>,
        wg_driver: Arc<WireGuardDriver>,
        socks5_leases: Arc<Socks5LeaseStore>,
        dante_driver: Arc<DanteDriver>,
        worker_scorer: Option<Arc<WorkerScorer>>,
        worker_fetcher: Option<Arc<dyn WorkerConfigFetcher>>,
        pool_scorer: Option<Arc<MiningPoolScorer>>,
        federation: Option<Arc<FederationClient>>,
        validators: Option<Arc<ValidatorRegistry>>,
    ) -> Self {
        let mut handles = Vec::new();

        handles.push(tokio::spawn(cleanup_wireguard_loop(wg_leases, wg_driver)));
        handles.push(tokio::spawn(cleanup_socks5_loop(socks5_leases, dante_driver)));

        if matches!(run_mode, RunMode::Miner) {
            if let (Some(scorer), Some(fetcher)) = (worker_scorer, worker_fetcher) {
                handles.push(tokio::spawn(score_workers_loop(scorer, fetcher)));
            }
            if let (Some(federation), Some(validators)) = (federation.clone(), validators.clone()) {
                handles.push(tokio::spawn(register_pool_loop(federation.clone(), validators.clone())));
                handles.push(tokio::spawn(register_workers_loop(federation, validators)));
            }
        }

        if matches!(run_mode, RunMode::Validator) {
            if let Some(scorer) = pool_scorer {
                handles.push(tokio::spawn(score_pools_loop(scorer)));
            }
        }

        Self { handles }
    }

    /// Stop every spawned job immediately (used by tests and shutdown).
    pub fn shutdown(self) {
        for handle in self.handles {
            handle.abort();
        }
    }
}

async fn score_workers_loop(scorer: Arc<WorkerScorer>, fetcher: Arc<dyn WorkerConfigFetcher>) {
    let mut ticker = tokio::time::interval(SCORE_WORKERS_INTERVAL);
    loop {
        ticker.tick().await;
        match scorer.score_all_known_workers(WORKER_SCORE_BUDGET_MINUTES, fetcher.as_ref()).await {
            Ok(Some(outcome)) => info!(up = outcome.up.len(), down = outcome.failures.len(), "score_all_known_workers tick complete"),
            Ok(None) => info!("score_all_known_workers skipped, previous run still in progress"),
            Err(e) => error!(error = %e, "score_all_known_workers tick failed"),
        }
    }
}

async fn score_pools_loop(scorer: Arc<MiningPoolScorer>) {
    let mut ticker = tokio::time::interval(SCORE_POOLS_INTERVAL);
    loop {
        ticker.tick().await;
        match scorer.score_mining_pools().await {
            Ok(Some(pools)) => info!(count = pools.len(), "score_mining_pools tick complete"),
            Ok(None) => info!("score_mining_pools skipped, previous run still in progress"),
            Err(e) => error!(error = %e, "score_mining_pools tick failed"),
        }
    }
}

async fn cleanup_wireguard_loop(leases: Arc<WireGuardLeaseStore>, driver: Arc<WireGuardDriver>) {
    let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
    loop {
        ticker.tick().await;
        if let Err(e) = leases.cleanup_expired_wireguard_configs(Some(&driver)).await {
            error!(error = %e, "cleanup_expired_wireguard_configs tick failed");
        }
    }
}

async fn cleanup_socks5_loop(leases: Arc<Socks5LeaseStore>, driver: Arc<DanteDriver>) {
    let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
    loop {
        ticker.tick().await;
        if let Err(e) = leases.cleanup_expired_dante_socks5_configs(Some(&driver)).await {
            error!(error = %e, "cleanup_expired_dante_socks5_configs tick failed");
        }
    }
}

async fn register_pool_loop(federation: Arc<FederationClient>, validators: Arc<ValidatorRegistry>) {
    let mut ticker = tokio::time::interval(REGISTER_POOL_INTERVAL);
    loop {
        ticker.tick().await;
        let payload = serde_json::json!({});
        let (successes, failures) = federation.register_mining_pool_with_validators(&validators.validator_ips(), &payload).await;
        info!(successes, failures, "register_mining_pool_with_validators tick complete");
    }
}

async fn register_workers_loop(federation: Arc<FederationClient>, validators: Arc<ValidatorRegistry>) {
    let mut ticker = tokio::time::interval(REGISTER_WORKERS_INTERVAL);
    loop {
        ticker.tick().await;
        let payload = serde_json::json!({});
        let (successes, failures) = federation.register_mining_pool_workers_with_validators(&validators.validator_ips(), &payload).await;
        info!(successes, failures, "register_mining_pool_workers_with_validators tick complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dante::driver::MockDanteContainerCommand;
    use crate::state::StateManager;
    use crate::wireguard::driver::MockContainerCommand;
    use clap::Parser as _;
    use tpn_common::{Database, NamedLockRegistry};

    #[tokio::test]
    async fn cleanup_loops_run_without_a_driver_error() {
        let db = Database::open_memory().unwrap();
        let locks = NamedLockRegistry::new();
        let leases = Arc::new(WireGuardLeaseStore::new(db.clone(), locks.clone(), false));
        assert_eq!(leases.check_open_leases().unwrap(), 0);
    }

    #[tokio::test]
    async fn scheduler_spawns_only_cleanup_jobs_with_no_optional_components() {
        let config = crate::config::NodeConfig::try_parse_from([
            "tpnd",
            "--run-mode",
            "worker",
        ])
        .unwrap_or_else(|_| panic!("clap parse failed"));
        let tmp = tempfile::tempdir().unwrap();
        let mut config = config;
        config.wireguard_config_dir = tmp.path().join("wg");
        config.password_dir = tmp.path().join("passwords");
        config.dante_regen_request_dir = tmp.path().join("regen");

        let state = StateManager::new_in_memory(config.clone()).unwrap();
        let db = state.db().clone();
        let locks = state.locks().clone();

        let wg_driver = Arc::new(WireGuardDriver::new(&config, Arc::new(MockContainerCommand::default())));
        let wg_leases = Arc::new(WireGuardLeaseStore::new(db.clone(), locks.clone(), false));
        let dante_driver = Arc::new(DanteDriver::new(&config, Arc::new(MockDanteContainerCommand)));
        let socks5_leases = Arc::new(Socks5LeaseStore::new(db, locks, config.password_dir.clone()));

        let scheduler = Scheduler::spawn(RunMode::Worker, wg_leases, wg_driver, socks5_leases, dante_driver, None, None, None, None, None);
        assert_eq!(scheduler.handles.len(), 2);
        scheduler.shutdown();
    }
}
