//! Request pipeline per role (C11, §4.11).
//!
//! Owns the two top-level provisioning entry points (`get_valid_wireguard_config`,
//! `get_valid_socks5_config`) and the role dispatch (`run_mode`,
//! `add_configs_to_workers`) that chooses between in-process provisioning,
//! direct federation fetch, and through-pool fetch.

use std::sync::Arc;
use std::time::Duration;
use tpn_common::{RunMode, Worker};
use tracing::{info, warn};

use crate::dante::{DanteDriver, Socks5LeaseStore};
use crate::federation::{FederationClient, VpnRequestParams};
use crate::state::StateManager;
use crate::wireguard::{LeaseRange, WireGuardDriver, WireGuardLeaseStore};
use crate::workers::WorkerInventory;

const WG_READY_GRACE_MS: u64 = 10_000;
const WG_READY_POLL_MS: u64 = 200;
const WG_READ_RETRIES: u32 = 2;
const WG_READ_COOLDOWN: Duration = Duration::from_secs(5);
const DANTE_READY_GRACE_MS: u64 = 10_000;

/// Outcome of a provisioning call that may be cancelled by a feedback-URL race.
#[derive(Debug, Clone)]
pub enum Provisioned<T> {
    Ready(T),
    Cancelled,
}

/// `get_valid_wireguard_config` success payload (§4.11).
#[derive(Debug, Clone)]
pub struct WireguardProvision {
    pub wireguard_config: String,
    pub peer_id: u32,
    pub peer_slots: u32,
    pub expires_at: i64,
}

/// Coordinates C2/C4 for a single WireGuard provisioning request, and C3/C5
/// for a single SOCKS5 request, applying the per-role policy around them.
pub struct RequestPipeline {
    state: StateManager,
    wg_driver: Arc<WireGuardDriver>,
    wg_leases: Arc<WireGuardLeaseStore>,
    dante_driver: Arc<DanteDriver>,
    socks5_leases: Arc<Socks5LeaseStore>,
    federation: Arc<FederationClient>,
    inventory: Arc<WorkerInventory>,
    http: reqwest::Client,
}

impl RequestPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        state: StateManager,
        wg_driver: Arc<WireGuardDriver>,
        wg_leases: Arc<WireGuardLeaseStore>,
        dante_driver: Arc<DanteDriver>,
        socks5_leases: Arc<Socks5LeaseStore>,
        federation: Arc<FederationClient>,
        inventory: Arc<WorkerInventory>,
    ) -> Self {
        Self {
            state,
            wg_driver,
            wg_leases,
            dante_driver,
            socks5_leases,
            federation,
            inventory,
            http: reqwest::Client::builder().timeout(Duration::from_secs(10)).build().expect("reqwest client"),
        }
    }

    /// `run_mode` (§4.11): the node's role, as configured.
    pub fn run_mode(&self) -> RunMode {
        self.state.config().run_mode
    }

    /// `get_valid_wireguard_config` (§4.11).
    pub async fn get_valid_wireguard_config(
        &self,
        priority: bool,
        lease_seconds: i64,
        feedback_url: Option<String>,
    ) -> tpn_common::Result<Provisioned<WireguardProvision>> {
        let priority_slots = self.state.config().priority_slots;
        let peer_count = self.state.config().wireguard_peer_count;
        let peer_slots = self.wg_driver.count_wireguard_configs();

        let range = if priority {
            LeaseRange::priority(priority_slots)
        } else {
            LeaseRange::standard(priority_slots, peer_count)
        };

        let expires_at = chrono::Utc::now().timestamp() + lease_seconds;
        let peer_id = self.wg_leases.register_wireguard_lease(range, expires_at).await?;

        if !self.wg_driver.wireguard_server_ready(peer_id, WG_READY_GRACE_MS, WG_READY_POLL_MS).await {
            warn!(peer_id, "wireguard server not ready within grace window");
        }

        let mut attempt = 0;
        let wireguard_config = loop {
            match self.wg_driver.read_client_config(peer_id).await {
                Ok(text) => break text,
                Err(e) if attempt < WG_READ_RETRIES => {
                    attempt += 1;
                    warn!(peer_id, attempt, error = %e, "peer conf not yet readable, retrying");
                    tokio::time::sleep(WG_READ_COOLDOWN).await;
                }
                Err(e) => return Err(e),
            }
        };

        if let Some(feedback_url) = feedback_url {
            if self.federation.poll_feedback_is_complete(&feedback_url).await {
                self.wg_leases.mark_config_as_free(peer_id)?;
                return Ok(Provisioned::Cancelled);
            }
        }

        Ok(Provisioned::Ready(WireguardProvision {
            wireguard_config,
            peer_id,
            peer_slots,
            expires_at,
        }))
    }

    /// `get_valid_socks5_config` (§4.3 entry point, wired in via C11): ensure
    /// the Dante daemon is ready and its lease store initialised from disk;
    /// for non-priority exhaustion, restart and reload once; then delegate to
    /// [`Socks5LeaseStore::get_socks5_config`].
    pub async fn get_valid_socks5_config(&self, lease_seconds: i64, priority: bool) -> tpn_common::Result<crate::dante::lease::Socks5Lease> {
        if !self.dante_driver.dante_server_ready(DANTE_READY_GRACE_MS).await {
            warn!("dante server not ready within grace window");
        }

        if !self.dante_driver.is_initialised() {
            let loaded = self.dante_driver.load_socks5_from_disk().await?;
            self.socks5_leases.write_socks(&loaded)?;
            self.dante_driver.mark_initialised();
        }

        let priority_slots = self.state.config().priority_slots;
        let expires_at = chrono::Utc::now().timestamp() + lease_seconds;

        if !priority && self.socks5_leases.count_available_socks(priority_slots)? == 0 {
            self.dante_driver.restart_dante_container().await?;
            let loaded = self.dante_driver.load_socks5_from_disk().await?;
            self.socks5_leases.write_socks(&loaded)?;
            self.dante_driver.mark_initialised();
        }

        self.socks5_leases
            .get_socks5_config(expires_at, priority, priority_slots, Some(&self.dante_driver))
            .await
    }

    /// `add_configs_to_workers` (§4.11): fills in `{wireguard_config,
    /// socks5_config}` for each worker, choosing the role-appropriate path —
    /// in-process provisioning for a worker checking itself, direct federation
    /// fetch for a miner, through-pool fetch for a validator.
    pub async fn add_configs_to_workers(&self, mut workers: Vec<Worker>) -> Vec<Worker> {
        for worker in &mut workers {
            match self.run_mode() {
                RunMode::Worker => {
                    if let Ok(Provisioned::Ready(wg)) = self.get_valid_wireguard_config(false, 300, None).await {
                        worker.wireguard_config = Some(wg.wireguard_config);
                    }
                    if let Ok(sock) = self.get_valid_socks5_config(300, false).await {
                        worker.socks5_config = Some(format_socks5(&sock.sock));
                    }
                }
                RunMode::Miner => {
                    worker.wireguard_config = self.fetch_worker_config(worker, "wireguard").await;
                    worker.socks5_config = self.fetch_worker_config(worker, "socks5").await;
                }
                RunMode::Validator => {
                    worker.wireguard_config = self.fetch_through_pool(worker, "wireguard").await;
                    worker.socks5_config = self.fetch_through_pool(worker, "socks5").await;
                }
            }
        }
        workers
    }

    async fn fetch_worker_config(&self, worker: &Worker, kind: &str) -> Option<String> {
        let url = format!("http://{}:{}/vpn?type={kind}&format=text", worker.ip, worker.public_port);
        self.http.get(&url).send().await.ok()?.text().await.ok()
    }

    async fn fetch_through_pool(&self, worker: &Worker, kind: &str) -> Option<String> {
        let url = format!("{}/vpn?type={kind}&format=text&miner_ip={}", worker.mining_pool_url, worker.ip);
        self.http.get(&url).send().await.ok()?.text().await.ok()
    }

    pub fn inventory(&self) -> &WorkerInventory {
        &self.inventory
    }
}

fn format_socks5(sock: &tpn_common::Socks5Credential) -> String {
    format!("socks5://{}:{}@{}:{}", sock.username, sock.password, sock.ip_address, sock.port)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dante::driver::MockDanteContainerCommand;
    use crate::wireguard::driver::MockContainerCommand;
    use tpn_common::{Database, NamedLockRegistry};

    fn test_pipeline(tmp: &std::path::Path) -> RequestPipeline {
        let config = crate::config::NodeConfig {
            run_mode: RunMode::Worker,
            store_path: None,
            config_file: None,
            bind_addr: "0.0.0.0:3000".to_string(),
            server_public_host: Some("127.0.0.1".to_string()),
            server_public_port: 3000,
            server_public_protocol: "http".to_string(),
            wireguard_serverport: 51820,
            wireguard_peer_count: 4,
            wireguard_config_dir: tmp.join("wg"),
            beta_refresh_lease_instead_of_delete: false,
            dante_port: 1080,
            password_dir: tmp.join("passwords"),
            dante_regen_request_dir: tmp.join("regen"),
            user_count: 16,
            priority_slots: 1,
            mining_pool_url: None,
            mining_pool_rewards: None,
            mining_pool_website_url: None,
            mining_pool_uid: "internal".to_string(),
            admin_api_key: None,
            ci_mode: true,
            ci_mock_worker_responses: true,
            ci_mock_mining_pool_responses: true,
            ci_mock_wg_container: true,
            ci_mock_dante_container: true,
            geoip_mmdb_path: None,
            postgres_host: None,
            postgres_user: None,
            postgres_password: None,
            maxmind_license_key: None,
            ip2location_download_token: None,
        };

        let db = Database::open_memory().unwrap();
        let locks = NamedLockRegistry::new();
        let state = StateManager::new_in_memory(config.clone()).unwrap();

        let wg_driver = Arc::new(WireGuardDriver::new(&config, Arc::new(MockContainerCommand::default())));
        let wg_leases = Arc::new(WireGuardLeaseStore::new(db.clone(), locks.clone(), false));
        let dante_driver = Arc::new(DanteDriver::new(&config, Arc::new(MockDanteContainerCommand)));
        let socks5_leases = Arc::new(Socks5LeaseStore::new(db.clone(), locks.clone(), config.password_dir.clone()));
        let federation = Arc::new(FederationClient::new("http://127.0.0.1:3000".to_string()));
        let inventory = Arc::new(WorkerInventory::new(db));

        RequestPipeline::new(state, wg_driver, wg_leases, dante_driver, socks5_leases, federation, inventory)
    }

    #[tokio::test]
    async fn get_valid_wireguard_config_allocates_the_smallest_free_peer() {
        let tmp = tempfile::tempdir().unwrap();
        tokio::fs::create_dir_all(tmp.path().join("wg/peer1")).await.unwrap();
        tokio::fs::write(tmp.path().join("wg/peer1/peer1.conf"), "[Interface]\nPrivateKey = x\nAddress = 10.8.0.1/24\n\n[Peer]\nPublicKey = y\nPresharedKey = z\nEndpoint = 1.2.3.4:51820\nAllowedIPs = 10.8.0.1/32\n").await.unwrap();
        tokio::fs::write(tmp.path().join("wg/.wg_ready"), "").await.unwrap();

        let pipeline = test_pipeline(tmp.path());
        let result = pipeline.get_valid_wireguard_config(false, 60, None).await.unwrap();
        match result {
            Provisioned::Ready(wg) => {
                assert_eq!(wg.peer_id, 1);
                assert!(wg.wireguard_config.contains("PrivateKey"));
            }
            Provisioned::Cancelled => panic!("expected Ready"),
        }
    }

    #[tokio::test]
    async fn get_valid_socks5_config_loads_from_disk_on_first_call() {
        let tmp = tempfile::tempdir().unwrap();
        tokio::fs::create_dir_all(tmp.path().join("passwords")).await.unwrap();
        tokio::fs::write(tmp.path().join("passwords/alice.password"), "secret").await.unwrap();
        // Satisfy the dante_server_ready TCP probe so the call doesn't block
        // for the full grace window.
        let _listener = tokio::net::TcpListener::bind("127.0.0.1:1080").await.unwrap();

        let pipeline = test_pipeline(tmp.path());
        let lease = pipeline.get_valid_socks5_config(60, true).await.unwrap();
        assert_eq!(lease.sock.username, "alice");
    }
}
