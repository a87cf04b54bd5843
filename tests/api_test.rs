//! HTTP API against a single-custodian test node

use std::net::SocketAddr;
use std::sync::Arc;

use serde_json::{json, Value};
use vbank_bridge::api;
use vbank_bridge::runtime::BridgeRuntime;
use vbank_bridge::testing::{secret_key, NodeBuilder, TestNode};
use vbank_bridge::types::{Asset, OutboundParams, OutboundRequest, TxKind};

fn withdrawal(home_tx_hash: String) -> OutboundRequest {
    OutboundRequest {
        home_tx_hash,
        params: OutboundParams::Withdraw {
            to: "0x00000000000000000000000000000000000000c3".to_string(),
            amount: 42,
            asset: Asset::Native { decimals: 18 },
        },
        fee_rate: None,
    }
}

async fn serve(node: &TestNode) -> SocketAddr {
    let runtime = Arc::new(BridgeRuntime::new(vec![node.runtime.clone()]));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, api::router(runtime)).await;
    });
    addr
}

#[tokio::test]
async fn test_health_and_status() {
    let node = NodeBuilder::account(secret_key(1)).build().unwrap();
    let addr = serve(&node).await;
    let client = reqwest::Client::new();

    let health = client.get(format!("http://{}/health", addr)).send().await.unwrap();
    assert!(health.status().is_success());
    assert_eq!(health.text().await.unwrap(), "OK");

    let status: Value = client
        .get(format!("http://{}/status", addr))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["status"], "ok");
    assert_eq!(status["chains"][0]["name"], "test");
    assert_eq!(status["chains"][0]["family"], node.runtime.ctx.family.name());
    assert_eq!(status["chains"][0]["queue_depth"], 0);

    let metrics = client.get(format!("http://{}/metrics", addr)).send().await.unwrap();
    assert!(metrics.status().is_success());
}

#[tokio::test]
async fn test_outbound_hook_opens_session() {
    let node = NodeBuilder::account(secret_key(1))
        .tuning(|t| t.send_order_slot_secs = 0)
        .build()
        .unwrap();
    node.home.add_home_tx(&"cd".repeat(32), TxKind::Withdraw);
    let addr = serve(&node).await;
    let client = reqwest::Client::new();

    let request = withdrawal("0x".to_string() + &"cd".repeat(32));
    let response = client
        .post(format!("http://{}/chains/test/outbound", addr))
        .json(&request)
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());
    let session: Value = response.json().await.unwrap();
    assert_eq!(session["home_tx_hash"], "cd".repeat(32));
    assert_eq!(session["required"], 1);
    // A lone custodian has quorum with its own signature
    assert!(session["broadcast_tx_hash"].is_string());
    assert_eq!(node.chain.broadcasts().len(), 1);

    let unknown = client
        .post(format!("http://{}/chains/nope/outbound", addr))
        .json(&request)
        .send()
        .await
        .unwrap();
    assert_eq!(unknown.status(), reqwest::StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_outbound_hook_rejects_unissued_home_tx() {
    let node = NodeBuilder::account(secret_key(1))
        .tuning(|t| t.send_order_slot_secs = 0)
        .build()
        .unwrap();
    let addr = serve(&node).await;

    let response = reqwest::Client::new()
        .post(format!("http://{}/chains/test/outbound", addr))
        .json(&withdrawal("ef".repeat(32)))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    assert!(node.chain.broadcasts().is_empty());
    assert!(node
        .runtime
        .coordinator
        .session(&"ef".repeat(32))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_mark_deleted_unknown_record() {
    let node = NodeBuilder::account(secret_key(1)).build().unwrap();
    let addr = serve(&node).await;

    let response = reqwest::Client::new()
        .post(format!("http://{}/chains/test/mark-deleted", addr))
        .json(&json!({ "external_tx_hash": "0xdead", "deletion_height": 5 }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
}
