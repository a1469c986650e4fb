//! Node configuration (§6 "Environment variables").
//!
//! Env-var-first via `clap`'s `env` feature, matching the recognised-variable
//! table in §6 almost one-to-one. A TOML file remains supported as an
//! optional override layer for anything not supplied by the environment,
//! preserving the teacher's `DaemonConfig::load`/`save` file-read idiom.

use clap::Parser;
use std::path::PathBuf;
use tpn_common::RunMode;
use tracing::warn;

fn parse_run_mode(s: &str) -> Result<RunMode, String> {
    match s {
        "worker" => Ok(RunMode::Worker),
        "miner" => Ok(RunMode::Miner),
        "validator" => Ok(RunMode::Validator),
        other => Err(format!("unknown RUN_MODE {other:?}, expected worker|miner|validator")),
    }
}

/// Node configuration, parsed from CLI flags / environment variables (§6).
#[derive(Parser, Debug, Clone)]
#[command(name = "tpnd")]
#[command(about = "TPN federation node — worker, mining pool, or validator coordination core")]
#[command(version)]
pub struct NodeConfig {
    /// Node role (`RUN_MODE`).
    #[arg(long = "run-mode", env = "RUN_MODE", value_parser = parse_run_mode)]
    pub run_mode: RunMode,

    /// Directory the sqlite database, geoip database, and kv state live under.
    #[arg(long, env = "TPN_STORE_PATH")]
    pub store_path: Option<PathBuf>,

    /// Optional TOML config file providing defaults for anything not set above.
    #[arg(long, env = "TPN_CONFIG_FILE")]
    pub config_file: Option<PathBuf>,

    /// Bind address for the HTTP surface (§6).
    #[arg(long, env = "TPN_BIND_ADDR", default_value = "0.0.0.0:3000")]
    pub bind_addr: String,

    #[arg(long, env = "SERVER_PUBLIC_HOST")]
    pub server_public_host: Option<String>,

    #[arg(long, env = "SERVER_PUBLIC_PORT", default_value_t = 3000)]
    pub server_public_port: u16,

    #[arg(long, env = "SERVER_PUBLIC_PROTOCOL", default_value = "https")]
    pub server_public_protocol: String,

    #[arg(long, env = "WIREGUARD_SERVERPORT", default_value_t = 51820)]
    pub wireguard_serverport: u16,

    #[arg(long, env = "WIREGUARD_PEER_COUNT", default_value_t = 254)]
    pub wireguard_peer_count: u32,

    /// Not in the §6 env-var table: the teacher's pattern of keeping
    /// filesystem roots configurable rather than hardcoded. Defaults to the
    /// path §6's "Persisted state" section names.
    #[arg(long, env = "WIREGUARD_CONFIG_DIR", default_value = "/config")]
    pub wireguard_config_dir: PathBuf,

    #[arg(long, env = "BETA_REFRESH_LEASE_INSTEAD_OF_DELETE", default_value_t = false)]
    pub beta_refresh_lease_instead_of_delete: bool,

    #[arg(long, env = "DANTE_PORT", default_value_t = 1080)]
    pub dante_port: u16,

    #[arg(long, env = "PASSWORD_DIR", default_value = "/passwords")]
    pub password_dir: PathBuf,

    #[arg(long, env = "DANTE_REGEN_REQUEST_DIR", default_value = "/dante_regen_requests")]
    pub dante_regen_request_dir: PathBuf,

    #[arg(long, env = "USER_COUNT", default_value_t = 1024)]
    pub user_count: u32,

    #[arg(long, env = "PRIORITY_SLOTS", default_value_t = 5)]
    pub priority_slots: u32,

    #[arg(long, env = "MINING_POOL_URL")]
    pub mining_pool_url: Option<String>,

    #[arg(long, env = "MINING_POOL_REWARDS")]
    pub mining_pool_rewards: Option<String>,

    #[arg(long, env = "MINING_POOL_WEBSITE_URL")]
    pub mining_pool_website_url: Option<String>,

    #[arg(long, env = "MINING_POOL_UID", default_value = "internal")]
    pub mining_pool_uid: String,

    #[arg(long, env = "ADMIN_API_KEY")]
    pub admin_api_key: Option<String>,

    #[arg(long, env = "CI_MODE", default_value_t = false)]
    pub ci_mode: bool,

    #[arg(long, env = "CI_MOCK_WORKER_RESPONSES", default_value_t = false)]
    pub ci_mock_worker_responses: bool,

    #[arg(long, env = "CI_MOCK_MINING_POOL_RESPONSES", default_value_t = false)]
    pub ci_mock_mining_pool_responses: bool,

    #[arg(long, env = "CI_MOCK_WG_CONTAINER", default_value_t = false)]
    pub ci_mock_wg_container: bool,

    /// Not in §6's table: the Dante analogue of `CI_MOCK_WG_CONTAINER`, so
    /// the SOCKS5 container can be mocked independently of WireGuard.
    #[arg(long, env = "CI_MOCK_DANTE_CONTAINER", default_value_t = false)]
    pub ci_mock_dante_container: bool,

    #[arg(long, env = "GEOIP_MMDB_PATH")]
    pub geoip_mmdb_path: Option<PathBuf>,

    /// Recognised but unused by this core (§1 non-goal: concrete DB schema/DDL
    /// ownership stays external; the core persists to its own embedded SQLite
    /// store, see DESIGN.md). Accepted purely so operators see them acknowledged.
    #[arg(long, env = "POSTGRES_HOST")]
    pub postgres_host: Option<String>,
    #[arg(long, env = "POSTGRES_USER")]
    pub postgres_user: Option<String>,
    #[arg(long, env = "POSTGRES_PASSWORD")]
    pub postgres_password: Option<String>,

    /// Recognised but unused: GeoIP database refresh is out of scope (§1);
    /// the resolver reads a pre-placed file at `geoip_mmdb_path`.
    #[arg(long, env = "MAXMIND_LICENSE_KEY")]
    pub maxmind_license_key: Option<String>,
    #[arg(long, env = "IP2LOCATION_DOWNLOAD_TOKEN")]
    pub ip2location_download_token: Option<String>,
}

impl NodeConfig {
    /// Parse CLI/env, then layer in a TOML file for any field that still holds
    /// its clap default and the file supplies a value.
    pub fn load() -> anyhow::Result<Self> {
        let mut config = Self::parse();

        if let Some(path) = config.config_file.clone() {
            if path.exists() {
                let overrides: FileOverrides = toml::from_str(&std::fs::read_to_string(&path)?)?;
                overrides.apply(&mut config);
            } else {
                warn!("config file {:?} does not exist, continuing with CLI/env values only", path);
            }
        }

        Ok(config)
    }

    pub fn store_path(&self) -> PathBuf {
        self.store_path
            .clone()
            .unwrap_or_else(tpn_common::default_store_path)
    }

    pub fn db_path(&self) -> PathBuf {
        self.store_path().join("state.db")
    }

    pub fn public_host(&self) -> String {
        self.server_public_host
            .clone()
            .unwrap_or_else(|| "127.0.0.1".to_string())
    }

    pub fn feedback_url_base(&self) -> String {
        format!(
            "{}://{}:{}",
            self.server_public_protocol,
            self.public_host(),
            self.server_public_port
        )
    }
}

/// A sparse subset of [`NodeConfig`] read from an optional TOML file. Only
/// fields an operator is likely to prefer keeping out of the environment
/// (long-lived, rarely-rotated settings) are represented here.
#[derive(Debug, Default, serde::Deserialize)]
struct FileOverrides {
    server_public_host: Option<String>,
    mining_pool_url: Option<String>,
    mining_pool_rewards: Option<String>,
    mining_pool_website_url: Option<String>,
    admin_api_key: Option<String>,
    geoip_mmdb_path: Option<PathBuf>,
}

impl FileOverrides {
    fn apply(self, config: &mut NodeConfig) {
        if config.server_public_host.is_none() {
            config.server_public_host = self.server_public_host;
        }
        if config.mining_pool_url.is_none() {
            config.mining_pool_url = self.mining_pool_url;
        }
        if config.mining_pool_rewards.is_none() {
            config.mining_pool_rewards = self.mining_pool_rewards;
        }
        if config.mining_pool_website_url.is_none() {
            config.mining_pool_website_url = self.mining_pool_website_url;
        }
        if config.admin_api_key.is_none() {
            config.admin_api_key = self.admin_api_key;
        }
        if config.geoip_mmdb_path.is_none() {
            config.geoip_mmdb_path = self.geoip_mmdb_path;
        }
    }
}
