//! Federation client (C10, §4.10).
//!
//! Chunked parallel fan-out with first-success semantics, request-id
//! idempotency via feedback URLs, and the validator/pool registration
//! round-trips.

use futures::stream::{FuturesUnordered, StreamExt};
use rand::seq::SliceRandom;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use tpn_common::{MiningPool, Worker};
use tracing::warn;
use uuid::Uuid;

use crate::state::StateManager;
use crate::workers::{WorkerInventory, WorkerQuery};

const IDENTITY_TIMEOUT: Duration = Duration::from_secs(5);
const FEEDBACK_TIMEOUT: Duration = Duration::from_secs(10);
const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(30);
const BROADCAST_TIMEOUT: Duration = Duration::from_secs(60);

const MINER_CHUNK_SIZE: usize = 10;
const VALIDATOR_CHUNK_SIZE: usize = 3;
const MINER_FANOUT_LIMIT: u32 = 50;

/// Parameters for a `GET /vpn` request to a downstream node (§6).
#[derive(Debug, Clone)]
pub struct VpnRequestParams {
    pub geo: Option<String>,
    pub kind: &'static str, // "wireguard" | "socks5"
    pub format: &'static str,
    pub lease_seconds: u64,
    pub priority: bool,
}

/// Outcome of a successful fan-out round.
#[derive(Debug, Clone)]
pub struct ProvisionResult {
    pub config: String,
    pub source_ip: IpAddr,
}

pub struct FederationClient {
    http: reqwest::Client,
    feedback_url_base: String,
}

impl FederationClient {
    pub fn new(feedback_url_base: String) -> Self {
        Self {
            http: reqwest::Client::builder().build().expect("reqwest client"),
            feedback_url_base,
        }
    }

    fn feedback_url(&self, request_id: &str) -> String {
        format!("{}/api/status/request/{}", self.feedback_url_base, request_id)
    }

    fn vpn_url(ip: IpAddr, port: u16, params: &VpnRequestParams, request_id: &str, feedback_url: &str) -> String {
        let mut url = format!("http://{ip}:{port}/vpn?type={}&format={}&lease_seconds={}&priority={}&request_id={}&feedback_url={}",
            params.kind, params.format, params.lease_seconds, params.priority, request_id, urlencode(feedback_url));
        if let Some(geo) = &params.geo {
            url.push_str(&format!("&geo={geo}"));
        }
        url
    }

    async fn try_one(&self, ip: IpAddr, url: String) -> Option<(String, IpAddr)> {
        let resp = self.http.get(&url).timeout(FEEDBACK_TIMEOUT).send().await.ok()?;
        if !resp.status().is_success() {
            return None;
        }
        let text = resp.text().await.ok()?;
        if text.trim().is_empty() {
            return None;
        }
        Some((text, ip))
    }

    /// Chunked parallel fan-out with first-success semantics (§4.10).
    /// Remaining chunk members are dropped (not explicitly cancelled — their
    /// requests complete server-side and are reconciled via the feedback URL).
    async fn fan_out(&self, targets: Vec<(IpAddr, String)>, chunk_size: usize) -> Option<(String, IpAddr)> {
        for chunk in targets.chunks(chunk_size) {
            let mut inflight: FuturesUnordered<_> = chunk.iter().map(|(ip, url)| self.try_one(*ip, url.clone())).collect();
            while let Some(result) = inflight.next().await {
                if let Some(success) = result {
                    return Some(success);
                }
            }
        }
        None
    }

    /// `get_worker_config_as_miner` (§4.10): fans out to the miner's own
    /// registered workers (`pool_uid`), honoring the caller's allow/deny lists.
    pub async fn get_worker_config_as_miner(
        &self,
        inventory: &WorkerInventory,
        state: &StateManager,
        pool_uid: &str,
        params: VpnRequestParams,
        whitelist: &[Ipv4Addr],
        blacklist: &[Ipv4Addr],
    ) -> tpn_common::Result<Option<ProvisionResult>> {
        let mut workers = inventory.get_workers(&WorkerQuery {
            country_code: params.geo.clone(),
            status: Some(tpn_common::WorkerStatus::Up),
            mining_pool_uid: Some(pool_uid.to_string()),
            limit: Some(MINER_FANOUT_LIMIT),
            ..Default::default()
        })?;

        if !whitelist.is_empty() {
            workers.retain(|w| whitelist.contains(&w.ip));
        }
        workers.retain(|w| !blacklist.contains(&w.ip));
        workers.shuffle(&mut rand::thread_rng());

        let request_id = Uuid::new_v4().to_string();
        let feedback_url = self.feedback_url(&request_id);
        state.ticket_begin(&request_id, 60);

        let targets: Vec<(IpAddr, String)> = workers
            .iter()
            .map(|w| (IpAddr::V4(w.ip), Self::vpn_url(IpAddr::V4(w.ip), w.public_port, &params, &request_id, &feedback_url)))
            .collect();

        let result = self.fan_out(targets, MINER_CHUNK_SIZE).await;
        if result.is_some() {
            state.ticket_complete(&request_id);
        }
        Ok(result.map(|(config, source_ip)| ProvisionResult { config, source_ip }))
    }

    /// `get_worker_config_as_validator` (§4.10): same pattern, chunk size 3,
    /// fanning out to mining pools which proxy to a worker internally.
    pub async fn get_worker_config_as_validator(
        &self,
        pools: &[MiningPool],
        state: &StateManager,
        params: VpnRequestParams,
    ) -> tpn_common::Result<Option<ProvisionResult>> {
        let mut candidates: Vec<&MiningPool> = pools.iter().filter(|p| p.ip.is_some()).collect();
        candidates.shuffle(&mut rand::thread_rng());

        let request_id = Uuid::new_v4().to_string();
        let feedback_url = self.feedback_url(&request_id);
        state.ticket_begin(&request_id, 60);

        let targets: Vec<(IpAddr, String)> = candidates
            .iter()
            .map(|p| (p.ip.unwrap(), Self::vpn_url(p.ip.unwrap(), 3000, &params, &request_id, &feedback_url)))
            .collect();

        let result = self.fan_out(targets, VALIDATOR_CHUNK_SIZE).await;
        if result.is_some() {
            state.ticket_complete(&request_id);
        }
        Ok(result.map(|(config, source_ip)| ProvisionResult { config, source_ip }))
    }

    /// A node's `GET /` identity probe, used to learn the preferred
    /// protocol/host/port before `POST`-ing a registration payload (§4.10).
    async fn fetch_identity_base_url(&self, ip: IpAddr, port: u16) -> Option<String> {
        let url = format!("http://{ip}:{port}/");
        let resp = self.http.get(&url).timeout(IDENTITY_TIMEOUT).send().await.ok()?;
        let identity: tpn_common::NodeIdentity = resp.json().await.ok()?;
        Some(format!(
            "{}://{}:{}",
            identity.server_public_protocol, identity.server_public_host, identity.server_public_port
        ))
    }

    /// `register_mining_pool_with_validators` (§4.10): `allSettled` fan-out,
    /// one `GET /` then `POST /validator/broadcast/mining_pool` per validator.
    pub async fn register_mining_pool_with_validators(&self, validator_ips: &[IpAddr], payload: &serde_json::Value) -> (usize, usize) {
        self.broadcast_all(validator_ips, "/validator/broadcast/mining_pool", payload).await
    }

    /// `register_mining_pool_workers_with_validators` (§4.10).
    pub async fn register_mining_pool_workers_with_validators(&self, validator_ips: &[IpAddr], payload: &serde_json::Value) -> (usize, usize) {
        self.broadcast_all(validator_ips, "/validator/broadcast/workers", payload).await
    }

    async fn broadcast_all(&self, validator_ips: &[IpAddr], path: &str, payload: &serde_json::Value) -> (usize, usize) {
        let mut inflight: FuturesUnordered<_> = validator_ips
            .iter()
            .map(|ip| async move {
                let Some(base) = self.fetch_identity_base_url(*ip, 3000).await else {
                    return false;
                };
                let url = format!("{base}{path}");
                match tokio::time::timeout(REGISTRATION_TIMEOUT, self.http.post(&url).json(payload).send()).await {
                    Ok(Ok(resp)) => resp.status().is_success(),
                    _ => false,
                }
            })
            .collect();

        let (mut successes, mut failures) = (0, 0);
        while let Some(ok) = inflight.next().await {
            if ok {
                successes += 1;
            } else {
                failures += 1;
            }
        }
        (successes, failures)
    }

    /// A mining pool broadcasting its full worker list to a validator (§6
    /// `POST /validator/broadcast/workers`), same `allSettled` shape as
    /// `register_mining_pool_with_validators` but with a pre-built payload.
    pub async fn broadcast_workers_to_validators(&self, validator_ips: &[IpAddr], workers: &[Worker], mining_pool_uid: &str) -> (usize, usize) {
        let payload = serde_json::json!({ "workers": workers, "mining_pool_uid": mining_pool_uid });
        match tokio::time::timeout(BROADCAST_TIMEOUT, self.broadcast_all(validator_ips, "/validator/broadcast/workers", &payload)).await {
            Ok(result) => result,
            Err(_) => {
                warn!("worker broadcast to validators timed out");
                (0, validator_ips.len())
            }
        }
    }

    /// Worker-side feedback honor (§4.11 step 5, §4.10 "Worker-side feedback
    /// honor"): poll `feedback_url`; `true` means another racer already won.
    pub async fn poll_feedback_is_complete(&self, feedback_url: &str) -> bool {
        let Ok(resp) = self.http.get(feedback_url).timeout(FEEDBACK_TIMEOUT).send().await else {
            return false;
        };
        let Ok(body) = resp.json::<serde_json::Value>().await else {
            return false;
        };
        body.get("status").and_then(|v| v.as_str()) == Some("complete")
    }
}

fn urlencode(s: &str) -> String {
    urlencoding_percent_encode(s)
}

/// Minimal percent-encoding for query-string embedding, avoiding a dedicated
/// `urlencoding` dependency for this one call site.
fn urlencoding_percent_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => out.push(b as char),
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urlencode_escapes_reserved_characters() {
        assert_eq!(urlencode("http://a.example/api"), "http%3A%2F%2Fa.example%2Fapi");
    }

    #[test]
    fn vpn_url_carries_the_feedback_url_encoded() {
        let params = VpnRequestParams { geo: Some("US".to_string()), kind: "wireguard", format: "json", lease_seconds: 300, priority: false };
        let url = FederationClient::vpn_url("198.51.100.7".parse().unwrap(), 3000, &params, "abc", "http://pool.example/api/status/request/abc");
        assert!(url.contains("geo=US"));
        assert!(url.contains("request_id=abc"));
        assert!(url.contains("feedback_url=http%3A%2F%2Fpool.example"));
    }
}
