//! WG container driver (C2, §4.2): readiness probing, atomic key rotation
//! with rollback, and container lifecycle.

use async_trait::async_trait;
use parking_lot::Mutex;
use socket2::{Domain, Socket, Type};
use std::net::{SocketAddr, UdpSocket as StdUdpSocket};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::time::sleep;
use tpn_common::{Error, Result};
use tracing::{debug, info, warn};

use super::config::ClientConfig;
use crate::config::NodeConfig;

/// Abstracts "how we talk to the WireGuard container" so tests can substitute
/// a mock (§9 Design Notes: "Subprocess-per-op container control → typed driver").
#[async_trait]
pub trait ContainerCommand: Send + Sync {
    /// Run a `wg` subcommand against the live interface, e.g.
    /// `["set", "wg0", "peer", <pubkey>, "remove"]`.
    async fn exec_wg(&self, args: &[&str]) -> Result<String>;

    /// Restart the WireGuard container/service.
    async fn restart(&self) -> Result<()>;
}

/// Shells out to the real `wg` CLI and a configurable restart command.
/// Grounded in the teacher's subprocess-driver idiom (`tokio::process::Command`
/// spawn + status/stdout inspection).
pub struct SubprocessContainerCommand {
    pub interface: String,
    pub restart_command: Vec<String>,
}

#[async_trait]
impl ContainerCommand for SubprocessContainerCommand {
    async fn exec_wg(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("wg")
            .args(args)
            .output()
            .await
            .map_err(|e| Error::WireGuard(format!("failed to spawn wg {args:?}: {e}")))?;

        if !output.status.success() {
            return Err(Error::WireGuard(format!(
                "wg {args:?} exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn restart(&self) -> Result<()> {
        let Some((program, rest)) = self.restart_command.split_first() else {
            return Err(Error::WireGuard("no restart_command configured".to_string()));
        };
        let status = Command::new(program)
            .args(rest)
            .status()
            .await
            .map_err(|e| Error::WireGuard(format!("failed to spawn restart command: {e}")))?;
        if !status.success() {
            return Err(Error::WireGuard(format!("restart command exited with {status}")));
        }
        Ok(())
    }
}

/// Always-succeeds stand-in used under `CI_MOCK_WG_CONTAINER` so end-to-end
/// tests can exercise the lease engine without a real WireGuard interface.
#[derive(Default)]
pub struct MockContainerCommand {
    pub fail_peer_add: Mutex<bool>,
}

#[async_trait]
impl ContainerCommand for MockContainerCommand {
    async fn exec_wg(&self, args: &[&str]) -> Result<String> {
        if *self.fail_peer_add.lock() && args.contains(&"add") {
            return Err(Error::WireGuard("mock: wg set peer add failed".to_string()));
        }
        Ok(String::new())
    }

    async fn restart(&self) -> Result<()> {
        Ok(())
    }
}

/// A pair of keys plus the preshared key backing one peer (§4.2 step 1/2).
#[derive(Debug, Clone, PartialEq)]
pub struct WgKeyTriple {
    pub private_key: String,
    pub public_key: String,
    pub preshared_key: String,
}

/// Generate a fresh keypair + preshared key by shelling out to `wg genkey`/`wg
/// pubkey`/`wg genpsk`, matching the spec's "Generate new keys via the daemon"
/// (§4.2 step 2) rather than re-implementing X25519 key clamping in-process.
pub async fn generate_keys() -> Result<WgKeyTriple> {
    let private_key = run_wg_text(&["genkey"]).await?;
    let public_key = run_wg_pipe(&["pubkey"], &private_key).await?;
    let preshared_key = run_wg_text(&["genpsk"]).await?;
    Ok(WgKeyTriple {
        private_key,
        public_key,
        preshared_key,
    })
}

/// Derive the public key a private key pairs with, used to recover the
/// *client's own* public key from a `ClientConfig` — which only stores the
/// private key — before evicting that peer from the running interface.
async fn derive_public_key(private_key: &str) -> Result<String> {
    run_wg_pipe(&["pubkey"], private_key).await
}

async fn run_wg_text(args: &[&str]) -> Result<String> {
    let output = Command::new("wg")
        .args(args)
        .output()
        .await
        .map_err(|e| Error::WireGuard(format!("wg {args:?} failed to spawn: {e}")))?;
    if !output.status.success() {
        return Err(Error::WireGuard(format!("wg {args:?} failed")));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

async fn run_wg_pipe(args: &[&str], stdin: &str) -> Result<String> {
    use tokio::io::AsyncWriteExt;
    use std::process::Stdio;

    let mut child = Command::new("wg")
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()
        .map_err(|e| Error::WireGuard(format!("wg {args:?} failed to spawn: {e}")))?;

    child
        .stdin
        .take()
        .expect("stdin piped")
        .write_all(stdin.as_bytes())
        .await?;

    let output = child.wait_with_output().await?;
    if !output.status.success() {
        return Err(Error::WireGuard(format!("wg {args:?} failed")));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Result of [`WireGuardDriver::replace_wireguard_config`] (§4.2).
#[derive(Debug, Clone)]
pub struct ReplaceOutcome {
    pub peer_id: u32,
    pub success: bool,
    pub new_keys: Option<WgKeyTriple>,
}

struct CountCache {
    counted_at: Instant,
    count: u32,
}

/// Drives the live WireGuard interface and its on-disk config tree.
pub struct WireGuardDriver {
    config_dir: PathBuf,
    peer_count: u32,
    server_port: u16,
    public_host: String,
    container: std::sync::Arc<dyn ContainerCommand>,
    count_cache: Mutex<Option<CountCache>>,
}

impl WireGuardDriver {
    pub fn new(node_config: &NodeConfig, container: std::sync::Arc<dyn ContainerCommand>) -> Self {
        Self {
            config_dir: node_config.wireguard_config_dir.clone(),
            peer_count: node_config.wireguard_peer_count,
            server_port: node_config.wireguard_serverport,
            public_host: node_config.public_host(),
            container,
            count_cache: Mutex::new(None),
        }
    }

    fn peer_dir(&self, peer_id: u32) -> PathBuf {
        self.config_dir.join(format!("peer{peer_id}"))
    }

    fn client_conf_path(&self, peer_id: u32) -> PathBuf {
        self.peer_dir(peer_id).join(format!("peer{peer_id}.conf"))
    }

    fn server_conf_path(&self) -> PathBuf {
        self.config_dir.join("wg_confs").join("wg0.conf")
    }

    fn ready_marker_path(&self) -> PathBuf {
        self.config_dir.join(".wg_ready")
    }

    /// `wireguard_server_ready` (§4.2): polls until the config dir, readiness
    /// marker, and the specific peer conf all exist, or the grace window elapses.
    pub async fn wireguard_server_ready(&self, peer_id: u32, grace_window_ms: u64, poll_ms: u64) -> bool {
        let deadline = Instant::now() + Duration::from_millis(grace_window_ms);
        loop {
            if self.config_dir.exists()
                && self.ready_marker_path().exists()
                && self.client_conf_path(peer_id).exists()
            {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            sleep(Duration::from_millis(poll_ms)).await;
        }
    }

    /// Reads a freshly-provisioned peer's client conf text (§4.11 step 4: the
    /// pipeline retries this up to twice with a 5s cooldown while the
    /// container is still materializing the file).
    pub async fn read_client_config(&self, peer_id: u32) -> Result<String> {
        tokio::fs::read_to_string(self.client_conf_path(peer_id))
            .await
            .map_err(|e| Error::WireGuard(format!("peer{peer_id}.conf unreadable: {e}")))
    }

    /// `check_if_wg_reachable` (§4.2): UDP reachability probe.
    pub fn check_if_wg_reachable(&self) -> bool {
        let target: SocketAddr = match format!("{}:{}", self.public_host, self.server_port).parse() {
            Ok(addr) => addr,
            Err(_) => return false,
        };

        let socket = match Socket::new(Domain::for_address(target), Type::DGRAM, None) {
            Ok(s) => s,
            Err(_) => return false,
        };
        let std_socket: StdUdpSocket = socket.into();
        std_socket.connect(target).is_ok() && std_socket.send(b"\0").is_ok()
    }

    /// `count_wireguard_configs` (§4.2): counts `peerK/peerK.conf` files,
    /// cached 10s.
    pub fn count_wireguard_configs(&self) -> u32 {
        if let Some(cached) = self.count_cache.lock().as_ref() {
            if cached.counted_at.elapsed() < Duration::from_secs(10) {
                return cached.count;
            }
        }

        let count = (1..=self.peer_count)
            .filter(|id| self.client_conf_path(*id).exists())
            .count() as u32;

        *self.count_cache.lock() = Some(CountCache {
            counted_at: Instant::now(),
            count,
        });
        count
    }

    /// `replace_wireguard_config` (§4.2): atomic key rotation with rollback.
    pub async fn replace_wireguard_config(&self, peer_id: u32) -> Result<ReplaceOutcome> {
        let client_path = self.client_conf_path(peer_id);
        let server_path = self.server_conf_path();

        let old_client_text = tokio::fs::read_to_string(&client_path).await.ok();
        let old_server_text = tokio::fs::read_to_string(&server_path).await.ok();
        let old_config = old_client_text.as_deref().and_then(|t| ClientConfig::parse(t).ok());

        match self.rotate(peer_id, &client_path, &server_path, old_config.as_ref()).await {
            Ok(new_keys) => Ok(ReplaceOutcome {
                peer_id,
                success: true,
                new_keys: Some(new_keys),
            }),
            Err(e) => {
                warn!("rotation for peer {peer_id} failed, rolling back: {e}");
                self.rollback(peer_id, &client_path, &server_path, old_client_text, old_server_text, old_config)
                    .await;
                Ok(ReplaceOutcome {
                    peer_id,
                    success: false,
                    new_keys: None,
                })
            }
        }
    }

    async fn rotate(
        &self,
        peer_id: u32,
        client_path: &Path,
        server_path: &Path,
        old_config: Option<&ClientConfig>,
    ) -> Result<WgKeyTriple> {
        let new_keys = generate_keys().await?;

        let allowed_ip = old_config
            .map(|c| c.allowed_ips.clone())
            .unwrap_or_else(|| format!("10.8.0.{peer_id}/32"));

        let new_client = ClientConfig {
            private_key: new_keys.private_key.clone(),
            address: old_config
                .map(|c| c.address.clone())
                .unwrap_or_else(|| format!("10.8.0.{peer_id}/24")),
            dns: old_config.and_then(|c| c.dns.clone()),
            server_public_key: old_config
                .map(|c| c.server_public_key.clone())
                .unwrap_or_default(),
            preshared_key: new_keys.preshared_key.clone(),
            endpoint: old_config
                .map(|c| c.endpoint.clone())
                .unwrap_or_else(|| format!("{}:{}", self.public_host, self.server_port)),
            allowed_ips: allowed_ip.clone(),
        };

        if let Some(parent) = client_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(client_path, new_client.serialize()).await?;

        // The interface's `[Peer]` table is keyed by the *client's* public key,
        // not `old.server_public_key` (that's the server's own key, as seen
        // from inside the client conf's `[Peer]` stanza) — derive it from the
        // outgoing private key before evicting the stale entry (§4.2 step 4).
        if let Some(old) = old_config {
            let old_client_pubkey = derive_public_key(&old.private_key).await?;
            self.container
                .exec_wg(&["set", "wg0", "peer", &old_client_pubkey, "remove"])
                .await?;
        }
        self.container
            .exec_wg(&[
                "set",
                "wg0",
                "peer",
                &new_keys.public_key,
                "preshared-key",
                "/dev/stdin",
                "allowed-ips",
                &allowed_ip,
            ])
            .await?;

        if let Some(parent) = server_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut server_text = tokio::fs::read_to_string(server_path).await.unwrap_or_default();
        server_text.push_str(&format!(
            "\n[Peer]\nPublicKey = {}\nPresharedKey = {}\nAllowedIPs = {}\n",
            new_keys.public_key, new_keys.preshared_key, allowed_ip
        ));
        tokio::fs::write(server_path, server_text).await?;

        debug!("rotated keys for peer {peer_id}");
        Ok(new_keys)
    }

    async fn rollback(
        &self,
        peer_id: u32,
        client_path: &Path,
        server_path: &Path,
        old_client_text: Option<String>,
        old_server_text: Option<String>,
        old_config: Option<ClientConfig>,
    ) {
        if let Some(text) = old_client_text {
            let _ = tokio::fs::write(client_path, text).await;
        }
        if let Some(text) = old_server_text {
            let _ = tokio::fs::write(server_path, text).await;
        }
        if let Some(old) = old_config {
            // Re-add the peer `rotate` evicted, again keyed by the client's
            // own public key rather than `old.server_public_key`.
            match derive_public_key(&old.private_key).await {
                Ok(old_client_pubkey) => {
                    let _ = self
                        .container
                        .exec_wg(&[
                            "set",
                            "wg0",
                            "peer",
                            &old_client_pubkey,
                            "preshared-key",
                            "/dev/stdin",
                            "allowed-ips",
                            &old.allowed_ips,
                        ])
                        .await;
                }
                Err(e) => warn!("rollback for peer {peer_id} could not re-derive old client pubkey: {e}"),
            }
        }
        info!("rollback complete for peer {peer_id}");
    }

    /// `replace_wireguard_configs` (§4.2): sequential, never parallel —
    /// rotation mutates the single shared interface.
    pub async fn replace_wireguard_configs(&self, peer_ids: Option<Vec<u32>>) -> Result<Vec<ReplaceOutcome>> {
        let ids = match peer_ids {
            Some(ids) => ids,
            None => (1..=self.peer_count).collect(),
        };

        let mut outcomes = Vec::with_capacity(ids.len());
        for id in ids {
            outcomes.push(self.replace_wireguard_config(id).await?);
        }
        Ok(outcomes)
    }

    /// `delete_wireguard_configs` (§4.2).
    pub async fn delete_wireguard_configs(&self, ids: &[u32]) -> Result<()> {
        for &id in ids {
            let path = self.client_conf_path(id);
            if path.exists() {
                tokio::fs::remove_file(&path).await?;
            }
        }
        Ok(())
    }

    /// `restart_wg_container` (§4.2).
    pub async fn restart_wg_container(&self) -> Result<()> {
        self.container.restart().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_driver(dir: &Path) -> WireGuardDriver {
        WireGuardDriver {
            config_dir: dir.to_path_buf(),
            peer_count: 8,
            server_port: 51820,
            public_host: "vpn.example.com".to_string(),
            container: std::sync::Arc::new(MockContainerCommand::default()),
            count_cache: Mutex::new(None),
        }
    }

    #[tokio::test]
    async fn readiness_waits_for_marker_and_conf() {
        let tmp = tempfile::tempdir().unwrap();
        let driver = test_driver(tmp.path());

        let ready_before = driver.wireguard_server_ready(1, 30, 10).await;
        assert!(!ready_before);

        tokio::fs::write(tmp.path().join(".wg_ready"), b"").await.unwrap();
        tokio::fs::create_dir_all(tmp.path().join("peer1")).await.unwrap();
        tokio::fs::write(tmp.path().join("peer1/peer1.conf"), b"x").await.unwrap();

        let ready_after = driver.wireguard_server_ready(1, 200, 10).await;
        assert!(ready_after);
    }

    #[tokio::test]
    async fn count_wireguard_configs_counts_existing_files() {
        let tmp = tempfile::tempdir().unwrap();
        let driver = test_driver(tmp.path());
        for id in [1u32, 3, 5] {
            let dir = tmp.path().join(format!("peer{id}"));
            tokio::fs::create_dir_all(&dir).await.unwrap();
            tokio::fs::write(dir.join(format!("peer{id}.conf")), b"x").await.unwrap();
        }
        assert_eq!(driver.count_wireguard_configs(), 3);
    }

    #[tokio::test]
    async fn rollback_restores_byte_identical_client_conf_on_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let driver = WireGuardDriver {
            config_dir: tmp.path().to_path_buf(),
            peer_count: 8,
            server_port: 51820,
            public_host: "vpn.example.com".to_string(),
            container: std::sync::Arc::new(MockContainerCommand {
                fail_peer_add: Mutex::new(true),
            }),
            count_cache: Mutex::new(None),
        };

        let original = ClientConfig {
            private_key: "orig-priv".to_string(),
            address: "10.8.0.5/24".to_string(),
            dns: None,
            server_public_key: "orig-server-pub".to_string(),
            preshared_key: "orig-psk".to_string(),
            endpoint: "vpn.example.com:51820".to_string(),
            allowed_ips: "10.8.0.5/32".to_string(),
        };
        tokio::fs::create_dir_all(tmp.path().join("peer5")).await.unwrap();
        tokio::fs::write(driver.client_conf_path(5), original.serialize()).await.unwrap();

        let outcome = driver.replace_wireguard_config(5).await.unwrap();
        assert!(!outcome.success);

        let after = tokio::fs::read_to_string(driver.client_conf_path(5)).await.unwrap();
        assert_eq!(after, original.serialize());
    }
}
