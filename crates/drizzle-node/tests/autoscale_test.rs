// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Scaling driven by the QPS and TTL signals.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use common::{TestNode, test_config, workflow};
use drizzle_node::events::qps::QpsSamplerConfig;
use drizzle_node::launcher::MockLauncher;
use serde_json::json;

fn single() -> drizzle_dsl::Workflow {
    workflow(json!({
        "name": "single",
        "spec": [
            {"name": "start", "function": "A", "outputs": ["end"], "role": "start"},
            {"name": "end", "function": "A", "role": "end"}
        ]
    }))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_qps_scales_up_then_down() {
    let launcher = Arc::new(MockLauncher::slow(Duration::from_millis(10)));
    let mut config = test_config();
    config.qps_middleware = true;
    let node = Arc::new(
        TestNode::start_with_sampler(
            config,
            launcher.clone(),
            vec![single()],
            QpsSamplerConfig {
                period: Duration::from_millis(300),
                window: 1,
            },
        )
        .await,
    );

    // Warm up, then keep roughly 100 flow runs per sample period going.
    node.walk("single", json!({})).await;
    let loaded = Arc::new(AtomicBool::new(true));
    let load = {
        let node = node.clone();
        let loaded = loaded.clone();
        tokio::spawn(async move {
            while loaded.load(Ordering::SeqCst) {
                let batch: Vec<_> = (0..10)
                    .map(|_| {
                        let node = node.clone();
                        tokio::spawn(async move { node.walk("single", json!({})).await })
                    })
                    .collect();
                for request in batch {
                    request.await.unwrap();
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
    };

    let scaled_up = node
        .wait_running("A", Duration::from_secs(5), |n| n >= 2)
        .await;
    loaded.store(false, Ordering::SeqCst);
    load.await.unwrap();
    assert!(scaled_up, "QPS never raised the replica count");
    assert!(launcher.launched() >= 2);

    // No traffic: the next sample asks for zero.
    assert!(
        node.wait_running("A", Duration::from_secs(5), |n| n == 0).await,
        "replicas were never released"
    );

    let node = Arc::try_unwrap(node).ok().unwrap();
    node.shutdown().await;
}

#[tokio::test]
async fn test_steady_traffic_keeps_instance_alive() {
    let launcher = Arc::new(MockLauncher::new());
    let mut config = test_config();
    config.ttl = Duration::from_millis(600);
    let node = TestNode::start(config, launcher.clone(), vec![single()]).await;

    // Each request lands inside the TTL of the previous one.
    for _ in 0..8 {
        node.walk("single", json!({"tick": true})).await;
        assert_eq!(node.running("A").await, 1);
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    assert_eq!(launcher.launched(), 1);

    // Once traffic stops the instance expires.
    assert!(
        node.wait_running("A", Duration::from_secs(3), |n| n == 0).await,
        "idle instance was never released"
    );

    // A later request cold-starts a fresh one.
    node.walk("single", json!({})).await;
    assert_eq!(launcher.launched(), 2);

    node.shutdown().await;
}

#[tokio::test]
async fn test_replica_cap_limits_scaling() {
    let launcher = Arc::new(MockLauncher::new());
    let mut config = test_config();
    config.max_replicas = Some(2);
    let node = TestNode::start(config, launcher.clone(), vec![single()]).await;

    node.runtime.scheduler().refresh("A", 5).await;
    assert!(node.wait_running("A", Duration::from_secs(5), |n| n == 2).await);
    assert_eq!(launcher.launched(), 2);

    node.walk("single", json!({})).await;
    assert_eq!(launcher.launched(), 2);

    node.shutdown().await;
}
