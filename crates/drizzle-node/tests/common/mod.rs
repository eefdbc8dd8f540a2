// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for drizzle-node integration tests.
//!
//! Starts a full node (HTTP server, schedule board, metrics pipeline) on an
//! ephemeral port with workflows registered in memory.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use drizzle_dsl::Workflow;
use drizzle_node::config::{Config, PeerReplicas};
use drizzle_node::control_plane::LocalControlPlane;
use drizzle_node::events::qps::QpsSamplerConfig;
use drizzle_node::launcher::WorkerLauncher;
use drizzle_node::runtime::NodeRuntime;
use drizzle_protocol::WorkflowResponse;
use serde_json::{Value, json};

/// Node settings used by every test unless overridden.
pub fn test_config() -> Config {
    Config {
        listen: "127.0.0.1:0".parse().unwrap(),
        node_id: "test-node".into(),
        ttl: Duration::from_secs(20),
        lsds_wait: Duration::from_secs(3),
        qps_middleware: false,
        static_middleware: false,
        prestart: false,
        peers: PeerReplicas::new(),
        workflows_dir: "./does-not-exist".into(),
        code_dir: "./code".into(),
        namespace: "default".into(),
        max_replicas: None,
        isolation: false,
        worker_program: None,
        peer_timeout: Duration::from_secs(5),
    }
}

pub fn workflow(value: Value) -> Workflow {
    serde_json::from_value(value).unwrap()
}

/// `start(A) -> next(B) -> end(C)`
pub fn pipeline() -> Workflow {
    workflow(json!({
        "name": "pipeline",
        "spec": [
            {"name": "start", "function": "A", "outputs": ["next"], "role": "start"},
            {"name": "next", "function": "B", "outputs": ["end"], "role": "mid"},
            {"name": "end", "function": "C", "role": "end"}
        ]
    }))
}

/// `start(A)` feeding both `left(B)` and `right(C)`.
pub fn fan_out() -> Workflow {
    workflow(json!({
        "name": "fan",
        "spec": [
            {"name": "start", "function": "A", "outputs": ["left", "right"], "role": "start"},
            {"name": "left", "function": "B", "role": "end"},
            {"name": "right", "function": "C", "role": "end"}
        ]
    }))
}

/// `start(A)` switching on `$.a > 3` to `big(B)` or `small(C)`.
pub fn switch() -> Workflow {
    workflow(json!({
        "name": "switch",
        "spec": [
            {
                "name": "start", "function": "A", "role": "start", "statement": "switch",
                "conditions": [{
                    "name": "root", "type": "int", "operator": "gt",
                    "target": "$.a", "comparison": 3,
                    "destination": {
                        "isTrue": {"flows": ["big"]},
                        "isFalse": {"flows": ["small"]}
                    }
                }]
            },
            {"name": "big", "function": "B", "role": "end"},
            {"name": "small", "function": "C", "role": "end"}
        ]
    }))
}

/// A running node plus an HTTP client pointed at it.
pub struct TestNode {
    pub runtime: NodeRuntime,
    pub client: reqwest::Client,
    pub addr: SocketAddr,
}

impl TestNode {
    /// Start a node with `launcher` serving `workflows`.
    pub async fn start(
        config: Config,
        launcher: Arc<dyn WorkerLauncher>,
        workflows: Vec<Workflow>,
    ) -> Self {
        Self::start_with_sampler(config, launcher, workflows, QpsSamplerConfig::default()).await
    }

    pub async fn start_with_sampler(
        config: Config,
        launcher: Arc<dyn WorkerLauncher>,
        workflows: Vec<Workflow>,
        sampler: QpsSamplerConfig,
    ) -> Self {
        let control_plane = LocalControlPlane::new().with_peers(config.peers.clone());
        for workflow in workflows {
            control_plane.register(workflow).unwrap();
        }

        let runtime = NodeRuntime::builder()
            .config(config)
            .launcher(launcher)
            .control_plane(Arc::new(control_plane))
            .qps_sampler(sampler)
            .build()
            .unwrap()
            .start()
            .await
            .unwrap();
        let addr = runtime.local_addr();

        Self {
            runtime,
            client: reqwest::Client::new(),
            addr,
        }
    }

    /// POST an invoke body; returns the status code and the decoded response.
    pub async fn invoke(&self, body: Value) -> (u16, WorkflowResponse) {
        let response = self
            .client
            .post(format!("http://{}/invoke", self.addr))
            .json(&body)
            .send()
            .await
            .unwrap();
        let status = response.status().as_u16();
        (status, response.json().await.unwrap())
    }

    /// Walk `workflow` with `parameters` and return the result, panicking on failure.
    pub async fn walk(&self, workflow: &str, parameters: Value) -> Value {
        let (status, response) = self
            .invoke(json!({"workflowName": workflow, "parameters": parameters}))
            .await;
        assert_eq!(status, 200, "request failed: {}", response.message);
        assert!(response.success);
        response.result
    }

    /// Running instances of `function` as reported by `GET /stats`.
    pub async fn running(&self, function: &str) -> usize {
        let stats: std::collections::BTreeMap<String, usize> = self
            .client
            .get(format!("http://{}/stats", self.addr))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        stats.get(function).copied().unwrap_or(0)
    }

    /// Poll `GET /stats` until the count of `function` satisfies `accept`.
    pub async fn wait_running(
        &self,
        function: &str,
        timeout: Duration,
        accept: impl Fn(usize) -> bool,
    ) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if accept(self.running(function).await) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    pub async fn shutdown(self) {
        self.runtime.shutdown().await.unwrap();
    }
}

/// Poll `check` every 20ms until it holds or `timeout` passes.
pub async fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
