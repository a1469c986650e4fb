//! §8 scenario 4: a feedback URL that already reports "complete" cancels a
//! provisioning call and frees the lease it had just taken.

use tpn_daemon::pipeline::Provisioned;
use tpn_e2e::{seed_wireguard_peer, spawn_node, NodeParams};

#[tokio::test]
async fn a_request_that_lost_the_race_is_cancelled_and_its_lease_freed() {
    let node = spawn_node(NodeParams::default()).await;
    seed_wireguard_peer(&node.state.config().wireguard_config_dir, 1).await;

    let request_id = uuid::Uuid::new_v4().to_string();
    let feedback_url = format!("{}/api/status/request/{request_id}", node.base_url);

    // Simulate a sibling racer having already won: mint the ticket and mark
    // it complete before this call even starts its own lease.
    node.state.state.ticket_begin(&request_id, 60);
    node.state.state.ticket_complete(&request_id);

    let result = node
        .state
        .pipeline
        .get_valid_wireguard_config(false, 60, Some(feedback_url))
        .await
        .unwrap();

    assert!(matches!(result, Provisioned::Cancelled), "a completed ticket must cancel the caller's own provisioning");
    assert_eq!(node.state.wg_leases.check_open_leases().unwrap(), 0, "the lease taken before the feedback check must be released");
}

#[tokio::test]
async fn a_request_with_a_still_pending_ticket_is_provisioned_normally() {
    let node = spawn_node(NodeParams::default()).await;
    seed_wireguard_peer(&node.state.config().wireguard_config_dir, 1).await;

    let request_id = uuid::Uuid::new_v4().to_string();
    let feedback_url = format!("{}/api/status/request/{request_id}", node.base_url);
    node.state.state.ticket_begin(&request_id, 60);

    let result = node
        .state
        .pipeline
        .get_valid_wireguard_config(false, 60, Some(feedback_url))
        .await
        .unwrap();

    match result {
        Provisioned::Ready(wg) => assert_eq!(wg.peer_id, 1),
        Provisioned::Cancelled => panic!("a pending ticket must not cancel provisioning"),
    }
}
