// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Peer forwarding between nodes.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{TestNode, eventually, test_config, workflow};
use drizzle_node::config::parse_peers;
use drizzle_node::launcher::MockLauncher;
use drizzle_node::peer::FORWARDED_HEADER;
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn two_step() -> drizzle_dsl::Workflow {
    workflow(json!({
        "name": "remote",
        "spec": [
            {"name": "start", "function": "A", "outputs": ["end"], "role": "start"},
            {"name": "end", "function": "B", "role": "end"}
        ]
    }))
}

#[tokio::test]
async fn test_static_middleware_forwards_cold_function() {
    let peer = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/invoke"))
        .and(header(FORWARDED_HEADER, "true"))
        .and(body_partial_json(json!({
            "workflowName": "remote",
            "flowName": "end",
            "upstreamFlowName": "start",
            "parameters": {"a": 1, "A": "A"}
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true, "message": "", "result": {"B": "remote"}, "time": "1ms"
        })))
        .expect(1)
        .mount(&peer)
        .await;

    let launcher = Arc::new(MockLauncher::new());
    let mut config = test_config();
    config.static_middleware = true;
    config.peers = parse_peers(&format!("{}=B:1", peer.uri())).unwrap();
    let node = TestNode::start(config, launcher.clone(), vec![two_step()]).await;

    // A is warm locally, B only exists on the peer.
    node.runtime.scheduler().refresh("A", 1).await;
    assert!(
        node.runtime
            .scheduler()
            .get("A")
            .unwrap()
            .function_cold_start_done(Duration::from_secs(5))
            .await
    );

    let result = node.walk("remote", json!({"a": 1})).await;
    assert_eq!(result, json!({"end": {"B": "remote"}}));
    assert_eq!(launcher.launched(), 1);
    assert_eq!(node.running("B").await, 0);

    node.shutdown().await;
}

#[tokio::test]
async fn test_peer_forward_after_cold_start_timeout() {
    let peer = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/invoke"))
        .and(body_partial_json(json!({"flowName": "start"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true, "message": "", "result": {"A": "remote"}, "time": "1ms"
        })))
        .mount(&peer)
        .await;
    Mock::given(method("POST"))
        .and(path("/invoke"))
        .and(body_partial_json(json!({"flowName": "end"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true, "message": "", "result": {"B": "remote"}, "time": "1ms"
        })))
        .mount(&peer)
        .await;

    // Workers take far longer to boot than requests are willing to wait.
    let launcher = Arc::new(MockLauncher::new().with_startup_delay(Duration::from_secs(2)));
    let mut config = test_config();
    config.lsds_wait = Duration::from_millis(50);
    config.peers = parse_peers(&format!("{}=A:1,B:1", peer.uri())).unwrap();
    let node = TestNode::start(config, launcher.clone(), vec![two_step()]).await;

    let result = node.walk("remote", json!({})).await;
    assert_eq!(result, json!({"end": {"B": "remote"}}));

    // The cold starts were still requested locally.
    assert!(eventually(Duration::from_secs(2), || launcher.launched() == 2).await);

    node.shutdown().await;
}

#[tokio::test]
async fn test_forwarded_request_runs_locally() {
    let peer = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&peer)
        .await;

    let mut config = test_config();
    config.static_middleware = true;
    config.peers = parse_peers(&format!("{}=B:3", peer.uri())).unwrap();
    let node = TestNode::start(config, Arc::new(MockLauncher::new()), vec![two_step()]).await;

    let response = node
        .client
        .post(format!("http://{}/invoke", node.addr))
        .header(FORWARDED_HEADER, "true")
        .json(&json!({
            "workflowName": "remote",
            "flowName": "end",
            "upstreamFlowName": "start",
            "parameters": {"x": 1}
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: drizzle_protocol::WorkflowResponse = response.json().await.unwrap();
    assert_eq!(body.result, json!({"x": 1, "B": "B"}));

    node.shutdown().await;
}

#[tokio::test]
async fn test_no_peer_for_cold_function() {
    let peer = MockServer::start().await;
    let mut config = test_config();
    config.static_middleware = true;
    config.peers = parse_peers(&format!("{}=Z:1", peer.uri())).unwrap();
    let node = TestNode::start(config, Arc::new(MockLauncher::new()), vec![two_step()]).await;

    let (status, response) = node
        .invoke(json!({"workflowName": "remote", "parameters": {}}))
        .await;
    assert_eq!(status, 503);
    assert!(response.message.contains("no valid peer target"));

    node.shutdown().await;
}

#[tokio::test]
async fn test_peer_failure_is_reported() {
    let peer = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/invoke"))
        .respond_with(ResponseTemplate::new(503).set_body_json(json!({
            "success": false, "message": "no instance for function A", "result": null, "time": "1ms"
        })))
        .mount(&peer)
        .await;

    let mut config = test_config();
    config.static_middleware = true;
    config.peers = parse_peers(&format!("{}=A:1", peer.uri())).unwrap();
    let node = TestNode::start(config, Arc::new(MockLauncher::new()), vec![two_step()]).await;

    let (status, response) = node
        .invoke(json!({"workflowName": "remote", "parameters": {}}))
        .await;
    assert_eq!(status, 502);
    assert!(response.message.contains("no instance for function A"));

    node.shutdown().await;
}
