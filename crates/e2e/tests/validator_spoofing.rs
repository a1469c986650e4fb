//! §8 scenario 6: `/worker/feedback` must trust the transport-level remote
//! address, never a client-supplied header, when deciding validator origin.

use tpn_e2e::{spawn_node, NodeParams};

#[tokio::test]
async fn feedback_with_a_forged_forwarded_for_header_is_still_rejected() {
    let node = spawn_node(NodeParams::default()).await;
    let client = reqwest::Client::new();

    let body = serde_json::json!({ "workers": [] });
    let response = client
        .post(format!("{}/worker/feedback", node.base_url))
        .header("X-Forwarded-For", "198.51.100.1") // a known fallback validator ip, forged
        .json(&body)
        .send()
        .await
        .unwrap();

    assert_eq!(
        response.status(),
        reqwest::StatusCode::FORBIDDEN,
        "the real connection originates from loopback, not the claimed validator address"
    );
}

#[tokio::test]
async fn feedback_from_a_registered_validator_source_is_accepted() {
    let node = spawn_node(NodeParams::default()).await;
    // The test client always connects over loopback, so register it as the
    // node's own validator set to exercise the accept path end to end.
    node.state.validators.update(vec![tpn_common::ValidatorDescriptor {
        uid: Some(1),
        ip: "127.0.0.1".parse().unwrap(),
    }]);

    let client = reqwest::Client::new();
    let body = serde_json::json!({ "workers": [] });
    let response = client.post(format!("{}/worker/feedback", node.base_url)).json(&body).send().await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
}
