//! Shared data-model types for the federation node (§3).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// `status` field of a [`Worker`] row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Tbd,
    Up,
    Down,
}

impl Default for WorkerStatus {
    fn default() -> Self {
        WorkerStatus::Tbd
    }
}

/// `connection_type` field of a [`Worker`] row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    Datacenter,
    Residential,
    Unknown,
}

impl Default for ConnectionType {
    fn default() -> Self {
        ConnectionType::Unknown
    }
}

/// The node role selected by `RUN_MODE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Worker,
    Miner,
    Validator,
}

/// Which WireGuard peer-id range, or SOCKS5 pool, a lease request draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeasePriority {
    Priority,
    Standard,
}

/// A leaf node exposing WireGuard + SOCKS5 tunnels (§3 `Worker`).
///
/// Natural key is `(ip, mining_pool_uid)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Worker {
    pub ip: std::net::Ipv4Addr,
    pub public_port: u16,
    pub country_code: Option<String>,
    pub connection_type: ConnectionType,
    pub mining_pool_url: String,
    pub mining_pool_uid: String,
    pub payment_address_evm: Option<String>,
    pub payment_address_bittensor: Option<String>,
    pub status: WorkerStatus,
    pub last_tested_at: Option<i64>,
    pub wireguard_config: Option<String>,
    pub socks5_config: Option<String>,
    pub datacenter: Option<bool>,
    pub version: Option<String>,
}

impl Worker {
    pub fn natural_key(&self) -> (std::net::Ipv4Addr, String) {
        (self.ip, self.mining_pool_uid.clone())
    }
}

/// A federation-visible mining pool (§3 `MiningPool`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MiningPool {
    pub mining_pool_uid: String,
    pub url: String,
    pub ip: Option<std::net::IpAddr>,
    pub last_known_worker_pool_size: u64,
    pub last_scored_at: Option<i64>,
    pub score: MiningPoolScore,
}

/// Per-pool sub-scores plus the composite (§4.9).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MiningPoolScore {
    pub stability: f64,
    pub size: f64,
    pub performance: f64,
    pub geo: f64,
    pub composite: f64,
}

/// A leased WireGuard peer slot (§3 `WireGuardLease`).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WireGuardLease {
    pub peer_id: u32,
    pub expires_at: i64,
}

/// A SOCKS5 credential row (§3 `SOCKS5Credential`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Socks5Credential {
    pub id: i64,
    pub ip_address: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub available: bool,
    pub expires_at: i64,
    pub updated_at: i64,
}

/// A challenge/response pair used for cross-node authenticity probes (§3 `ChallengeSolution`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChallengeSolution {
    pub challenge: uuid::Uuid,
    pub solution: uuid::Uuid,
    pub tag: Option<String>,
    pub created_at: i64,
}

/// An entry of the validator registry (§3 `ValidatorDescriptor`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidatorDescriptor {
    pub uid: Option<u64>,
    pub ip: std::net::IpAddr,
}

impl ValidatorDescriptor {
    /// Testnet fallback entries have no `uid` and are excluded from `validator_count`
    /// but retained for `is_validator` (§4.6).
    pub fn is_mainnet(&self) -> bool {
        self.uid.is_some()
    }
}

/// Status of an in-flight, in-memory `RequestTicket` (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    Pending,
    Complete,
}

/// Result of resolving an IP to geographic/connection metadata (C13).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoData {
    pub country_code: Option<String>,
    pub connection_type: ConnectionType,
    pub datacenter: bool,
}

impl Default for GeoData {
    fn default() -> Self {
        Self {
            country_code: None,
            connection_type: ConnectionType::Unknown,
            datacenter: false,
        }
    }
}

/// `GET /` node-identity payload (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub branch: String,
    pub version: String,
    pub hash: String,
    #[serde(rename = "SERVER_PUBLIC_PROTOCOL")]
    pub server_public_protocol: String,
    #[serde(rename = "SERVER_PUBLIC_HOST")]
    pub server_public_host: String,
    #[serde(rename = "SERVER_PUBLIC_PORT")]
    pub server_public_port: u16,
    #[serde(rename = "MINING_POOL_URL", skip_serializing_if = "Option::is_none")]
    pub mining_pool_url: Option<String>,
    #[serde(rename = "MINING_POOL_REWARDS", skip_serializing_if = "Option::is_none")]
    pub mining_pool_rewards: Option<String>,
    #[serde(rename = "MINING_POOL_WEBSITE_URL", skip_serializing_if = "Option::is_none")]
    pub mining_pool_website_url: Option<String>,
}

/// Free-form label map, retained for broadcast payloads that carry opaque annotations.
pub type LabelMap = HashMap<String, String>;
