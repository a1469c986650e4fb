//! Wires the engine components (`tpn-daemon`) into one cheaply-cloneable
//! [`AppState`], mirroring the teacher's `WebServer::new` construction idiom
//! but without any of the VM/appliance machinery it used to assemble.

use std::sync::Arc;

use tpn_common::{ChallengeSolution, NamedLockRegistry, NodeIdentity};
use tpn_daemon::dante::{DanteDriver, MockDanteContainerCommand, SubprocessDanteContainerCommand, Socks5LeaseStore};
use tpn_daemon::federation::FederationClient;
use tpn_daemon::neuron::PushedNeuronClient;
use tpn_daemon::pipeline::RequestPipeline;
use tpn_daemon::scorer::pool::HttpPoolProbe;
use tpn_daemon::scorer::worker::{HttpWorkerConfigFetcher, LocalVersion, MockConnectivityProbe, SubprocessConnectivityProbe, WorkerConfigFetcher};
use tpn_daemon::scorer::{MiningPoolScorer, WorkerScorer};
use tpn_daemon::validators::ValidatorRegistry;
use tpn_daemon::wireguard::{MockContainerCommand, SubprocessContainerCommand, WireGuardDriver, WireGuardLeaseStore};
use tpn_daemon::workers::WorkerInventory;
use tpn_daemon::{NodeConfig, StateManager};

/// Branch/commit-hash identity surfaced in `GET /` (§6), sourced from the
/// build environment rather than guessed at runtime.
#[derive(Clone)]
pub struct BuildIdentity {
    pub branch: String,
    pub hash: String,
}

impl BuildIdentity {
    fn from_env() -> Self {
        Self {
            branch: std::env::var("TPN_GIT_BRANCH").unwrap_or_else(|_| "unknown".to_string()),
            hash: std::env::var("TPN_GIT_HASH").unwrap_or_else(|_| "unknown".to_string()),
        }
    }
}

/// Shared handle passed to every axum handler via `State<AppState>`.
#[derive(Clone)]
pub struct AppState {
    pub state: StateManager,
    pub pipeline: Arc<RequestPipeline>,
    pub inventory: Arc<WorkerInventory>,
    pub federation: Arc<FederationClient>,
    pub validators: Arc<ValidatorRegistry>,
    pub neuron: Arc<PushedNeuronClient>,
    pub pool_scorer: Arc<MiningPoolScorer>,
    pub worker_scorer: Option<Arc<WorkerScorer>>,
    pub worker_fetcher: Option<Arc<dyn WorkerConfigFetcher>>,
    pub challenge_store: Arc<tpn_daemon::challenge::ChallengeStore>,
    pub wg_driver: Arc<WireGuardDriver>,
    pub wg_leases: Arc<WireGuardLeaseStore>,
    pub dante_driver: Arc<DanteDriver>,
    pub socks5_leases: Arc<Socks5LeaseStore>,
    pub identity: BuildIdentity,
}

impl AppState {
    /// Build every component for `config`, choosing real subprocess/netns
    /// drivers or their mocks according to the `CI_MOCK_*` flags (§6
    /// env-var table, plus `CI_MOCK_DANTE_CONTAINER` which mirrors
    /// `CI_MOCK_WG_CONTAINER` for the SOCKS5 container independently).
    pub async fn build(config: NodeConfig) -> anyhow::Result<Self> {
        let state = StateManager::new(config.clone()).await?;
        let db = state.db().clone();
        let locks = state.locks().clone();

        let wg_driver = Arc::new(WireGuardDriver::new(
            &config,
            if config.ci_mock_wg_container {
                Arc::new(MockContainerCommand::default())
            } else {
                Arc::new(SubprocessContainerCommand {
                    interface: "wg0".to_string(),
                    restart_command: vec!["wg-quick".to_string(), "up".to_string(), "wg0".to_string()],
                })
            },
        ));
        let wg_leases = Arc::new(WireGuardLeaseStore::new(db.clone(), locks.clone(), config.beta_refresh_lease_instead_of_delete));

        let dante_driver = Arc::new(DanteDriver::new(
            &config,
            if config.ci_mock_dante_container {
                Arc::new(MockDanteContainerCommand)
            } else {
                Arc::new(SubprocessDanteContainerCommand { restart_command: vec!["service".to_string(), "danted".to_string(), "restart".to_string()] })
            },
        ));
        let socks5_leases = Arc::new(Socks5LeaseStore::new(db.clone(), locks.clone(), config.password_dir.clone()));

        let federation = Arc::new(FederationClient::new(config.feedback_url_base()));
        let inventory = Arc::new(WorkerInventory::new(db.clone()));

        let pipeline = Arc::new(RequestPipeline::new(
            state.clone(),
            wg_driver.clone(),
            wg_leases.clone(),
            dante_driver.clone(),
            socks5_leases.clone(),
            federation.clone(),
            inventory.clone(),
        ));

        let validators = Arc::new(ValidatorRegistry::new());
        let neuron = Arc::new(PushedNeuronClient::default());

        let pool_scorer = Arc::new(MiningPoolScorer::new(
            db.clone(),
            locks.clone(),
            inventory.clone(),
            neuron.clone() as Arc<dyn tpn_daemon::neuron::NeuronClient>,
            Arc::new(HttpPoolProbe::new()),
        ));

        let (worker_scorer, worker_fetcher): (Option<Arc<WorkerScorer>>, Option<Arc<dyn WorkerConfigFetcher>>) =
            if matches!(config.run_mode, tpn_common::RunMode::Miner) {
                let fetcher: Arc<dyn WorkerConfigFetcher> = Arc::new(HttpWorkerConfigFetcher::new());
                let probe: Arc<dyn tpn_daemon::scorer::worker::ConnectivityProbe> = if config.ci_mock_worker_responses {
                    Arc::new(MockConnectivityProbe::default())
                } else {
                    Arc::new(SubprocessConnectivityProbe::default())
                };
                let scorer = Arc::new(WorkerScorer::new(
                    inventory.clone(),
                    locks.clone(),
                    Arc::new(tpn_common::GeoResolver::open(config.geoip_mmdb_path.clone())),
                    probe,
                    LocalVersion { version: tpn_common::VERSION.to_string(), last_commit_at: 0 },
                    config.mining_pool_url.clone().unwrap_or_default(),
                    None,
                    false,
                ));
                (Some(scorer), Some(fetcher))
            } else {
                (None, None)
            };

        let challenge_store = Arc::new(tpn_daemon::challenge::ChallengeStore::new(db));

        Ok(Self {
            state,
            pipeline,
            inventory,
            federation,
            validators,
            neuron,
            pool_scorer,
            worker_scorer,
            worker_fetcher,
            challenge_store,
            wg_driver,
            wg_leases,
            dante_driver,
            socks5_leases,
            identity: BuildIdentity::from_env(),
        })
    }

    pub fn config(&self) -> &NodeConfig {
        self.state.config()
    }

    /// `GET /` payload (§6).
    pub fn node_identity(&self) -> NodeIdentity {
        let config = self.config();
        NodeIdentity {
            branch: self.identity.branch.clone(),
            version: tpn_common::VERSION.to_string(),
            hash: self.identity.hash.clone(),
            server_public_protocol: config.server_public_protocol.clone(),
            server_public_host: config.public_host(),
            server_public_port: config.server_public_port,
            mining_pool_url: config.mining_pool_url.clone(),
            mining_pool_rewards: config.mining_pool_rewards.clone(),
            mining_pool_website_url: config.mining_pool_website_url.clone(),
        }
    }

    /// Locks shared with every long-lived component (used only by tests that
    /// need to construct an additional component against the same store).
    pub fn locks(&self) -> &NamedLockRegistry {
        self.state.locks()
    }
}

#[allow(dead_code)]
fn _ensure_challenge_solution_type_used(_: &ChallengeSolution) {}
