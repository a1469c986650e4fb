//! §8 scenario 5: a failed peer-add during key rotation must roll back the
//! client conf, server conf, and lease row to their exact prior state.

use tpn_daemon::wireguard::{ClientConfig, LeaseRange, MockContainerCommand, WireGuardDriver, WireGuardLeaseStore};
use tpn_e2e::{spawn_node, NodeParams};

#[tokio::test]
async fn failed_rotation_restores_every_piece_of_prior_state() {
    let node = spawn_node(NodeParams { wireguard_peer_count: 8, ..Default::default() }).await;
    let config_dir = node.state.config().wireguard_config_dir.clone();

    let failing_container = std::sync::Arc::new(MockContainerCommand {
        fail_peer_add: parking_lot::Mutex::new(true),
    });
    let driver = WireGuardDriver::new(node.state.config(), failing_container);

    let original = ClientConfig {
        private_key: "orig-priv".to_string(),
        address: "10.8.0.5/24".to_string(),
        dns: None,
        server_public_key: "orig-server-pub".to_string(),
        preshared_key: "orig-psk".to_string(),
        endpoint: "vpn.example.com:51820".to_string(),
        allowed_ips: "10.8.0.5/32".to_string(),
    };
    let client_path = config_dir.join("peer5").join("peer5.conf");
    tokio::fs::create_dir_all(client_path.parent().unwrap()).await.unwrap();
    tokio::fs::write(&client_path, original.serialize()).await.unwrap();

    let server_path = config_dir.join("wg_confs").join("wg0.conf");
    tokio::fs::create_dir_all(server_path.parent().unwrap()).await.unwrap();
    let original_server_conf = "[Interface]\nPrivateKey = server-priv\nListenPort = 51820\n";
    tokio::fs::write(&server_path, original_server_conf).await.unwrap();

    let leases = WireGuardLeaseStore::new(node.state.state.db().clone(), node.state.state.locks().clone(), false);
    let expires_at = chrono::Utc::now().timestamp() + 300;
    let leased_id = leases.register_wireguard_lease(LeaseRange::full(8), expires_at).await.unwrap();
    assert_eq!(leased_id, 1, "peer 5's conf pre-exists on disk but its lease row is independent of allocation order");

    let outcome = driver.replace_wireguard_config(5).await.unwrap();
    assert!(!outcome.success, "rotation must report failure when the container rejects the peer add");

    let client_after = tokio::fs::read_to_string(&client_path).await.unwrap();
    assert_eq!(client_after, original.serialize(), "client conf must be byte-identical to its pre-rotation contents");

    let server_after = tokio::fs::read_to_string(&server_path).await.unwrap();
    assert_eq!(server_after, original_server_conf, "server conf must be untouched since the new peer stanza was never durably appended");

    assert_eq!(leases.check_open_leases().unwrap(), 1, "the unrelated lease row must survive a rollback on a different peer");
}
