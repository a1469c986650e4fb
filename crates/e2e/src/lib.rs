//! Shared harness for `tpnd`'s black-box end-to-end scenarios (§8).
//!
//! Each `tests/*.rs` file owns one scenario family and drives a real
//! `tpnd` instance over HTTP, mirroring the teacher's "spawn the server,
//! then drive it" e2e idiom but against an in-process `axum::serve`
//! listener instead of a subprocess — there's no browser surface here to
//! justify paying for one.

use std::net::SocketAddr;
use std::path::PathBuf;

use tpn_common::RunMode;
use tpn_daemon::NodeConfig;
use tpn_web::AppState;

/// A running node plus the address clients should hit and the tempdir
/// backing its store (dropped, and the node torn down, when this goes
/// out of scope).
pub struct TestNode {
    pub base_url: String,
    pub addr: SocketAddr,
    pub state: AppState,
    _tmp: tempfile::TempDir,
}

/// Every tunable an individual scenario might want to override, defaulted
/// to values that make the node immediately usable without a real `wg`
/// binary, Dante daemon, or MaxMind database on the test host.
pub struct NodeParams {
    pub run_mode: RunMode,
    pub wireguard_peer_count: u32,
    pub priority_slots: u32,
    pub beta_refresh_lease_instead_of_delete: bool,
    pub mining_pool_uid: String,
    pub admin_api_key: Option<String>,
}

impl Default for NodeParams {
    fn default() -> Self {
        Self {
            run_mode: RunMode::Worker,
            wireguard_peer_count: 4,
            priority_slots: 1,
            beta_refresh_lease_instead_of_delete: false,
            mining_pool_uid: "internal".to_string(),
            admin_api_key: Some("secret".to_string()),
        }
    }
}

fn test_config(tmp: &std::path::Path, params: &NodeParams) -> NodeConfig {
    NodeConfig {
        run_mode: params.run_mode,
        store_path: Some(tmp.to_path_buf()),
        config_file: None,
        bind_addr: "127.0.0.1:0".to_string(),
        server_public_host: Some("127.0.0.1".to_string()),
        server_public_port: 0, // patched to the bound port once the listener exists
        server_public_protocol: "http".to_string(),
        wireguard_serverport: 51820,
        wireguard_peer_count: params.wireguard_peer_count,
        wireguard_config_dir: tmp.join("wg"),
        beta_refresh_lease_instead_of_delete: params.beta_refresh_lease_instead_of_delete,
        dante_port: 1080,
        password_dir: tmp.join("passwords"),
        dante_regen_request_dir: tmp.join("regen"),
        user_count: 16,
        priority_slots: params.priority_slots,
        mining_pool_url: None,
        mining_pool_rewards: None,
        mining_pool_website_url: None,
        mining_pool_uid: params.mining_pool_uid.clone(),
        admin_api_key: params.admin_api_key.clone(),
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
    }
}

/// Boots a real `tpnd` node bound to an ephemeral loopback port and serves
/// it on a background task for the lifetime of the returned [`TestNode`].
pub async fn spawn_node(params: NodeParams) -> TestNode {
    let tmp = tempfile::tempdir().expect("tempdir");

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind ephemeral port");
    let addr = listener.local_addr().expect("local_addr");

    let mut config = test_config(tmp.path(), &params);
    config.server_public_port = addr.port();

    let state = AppState::build(config).await.expect("AppState::build");
    let app = tpn_web::server::test_app(state.clone()).into_make_service_with_connect_info::<SocketAddr>();

    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("axum::serve");
    });

    TestNode {
        base_url: format!("http://{addr}"),
        addr,
        state,
        _tmp: tmp,
    }
}

/// Writes a minimal syntactically-valid client conf for `peer_id` under the
/// node's `wireguard_config_dir`, plus the `.wg_ready` marker, so
/// `wireguard_server_ready` and `read_client_config` succeed without a real
/// WireGuard interface.
pub async fn seed_wireguard_peer(wireguard_config_dir: &PathBuf, peer_id: u32) {
    let peer_dir = wireguard_config_dir.join(format!("peer{peer_id}"));
    tokio::fs::create_dir_all(&peer_dir).await.expect("create peer dir");
    tokio::fs::write(
        peer_dir.join(format!("peer{peer_id}.conf")),
        format!(
            "[Interface]\nPrivateKey = priv-{peer_id}\nAddress = 10.8.0.{peer_id}/24\n\n\
             [Peer]\nPublicKey = server-pub\nPresharedKey = psk-{peer_id}\nEndpoint = 127.0.0.1:51820\nAllowedIPs = 10.8.0.{peer_id}/32\n"
        ),
    )
    .await
    .expect("write peer conf");
    tokio::fs::write(wireguard_config_dir.join(".wg_ready"), b"").await.expect("write ready marker");
}

/// Writes a SOCKS5 password file under the node's `password_dir` so
/// [`tpn_daemon::dante::DanteDriver::load_socks5_from_disk`] has something to
/// load on first use.
pub async fn seed_socks5_password(password_dir: &PathBuf, username: &str, password: &str) {
    tokio::fs::create_dir_all(password_dir).await.expect("create password dir");
    tokio::fs::write(password_dir.join(format!("{username}.password")), password).await.expect("write password file");
}
