// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Forwarding flows to peer nodes.
//!
//! A peer is addressed by its id, which is the `host:port` it listens on.
//! The forwarded request names the flow to run, so the peer executes just
//! that flow and never forwards it again.

use std::sync::Arc;
use std::time::Duration;

use drizzle_protocol::{WorkflowRequest, WorkflowResponse};
use serde_json::Value;
use tracing::{debug, info};

use crate::config::PeerReplicas;
use crate::control_plane::ControlPlane;
use crate::error::{Error, Result};
use crate::span::Span;

/// Header marking a request as already forwarded once.
pub const FORWARDED_HEADER: &str = "x-drizzle-forwarded";

/// W3C trace context header propagated to peers.
pub const TRACEPARENT_HEADER: &str = "traceparent";

pub const DEFAULT_PEER_TIMEOUT: Duration = Duration::from_secs(30);

/// Chooses the peer a function is forwarded to.
pub trait PeerPolicy: Send + Sync {
    fn pick(&self, function_name: &str, self_id: &str, peers: &PeerReplicas) -> Option<String>;
}

/// Peer with the most replicas of the function; lowest id wins ties.
#[derive(Debug, Clone, Copy, Default)]
pub struct MostReplicas;

impl PeerPolicy for MostReplicas {
    fn pick(&self, function_name: &str, self_id: &str, peers: &PeerReplicas) -> Option<String> {
        peers
            .iter()
            .filter(|(id, _)| id.as_str() != self_id)
            .filter_map(|(id, functions)| {
                let count = *functions.get(function_name)?;
                (count > 0).then_some((count, id))
            })
            .max_by(|a, b| a.0.cmp(&b.0).then_with(|| b.1.cmp(a.1)))
            .map(|(_, id)| id.clone())
    }
}

fn invoke_url(peer: &str) -> String {
    let base = peer.trim_end_matches('/');
    if base.starts_with("http://") || base.starts_with("https://") {
        format!("{base}/invoke")
    } else {
        format!("http://{base}/invoke")
    }
}

/// HTTP client for running flows on peers.
pub struct PeerForwarder {
    client: reqwest::Client,
    control_plane: Arc<dyn ControlPlane>,
    policy: Arc<dyn PeerPolicy>,
    node_id: String,
}

impl PeerForwarder {
    pub fn new(
        control_plane: Arc<dyn ControlPlane>,
        node_id: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::PeerRequest(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            control_plane,
            policy: Arc::new(MostReplicas),
            node_id: node_id.into(),
        })
    }

    pub fn with_policy(mut self, policy: Arc<dyn PeerPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Peer that would receive `span`'s function, if any.
    pub async fn target(&self, span: &Span) -> Result<String> {
        let peers = self
            .control_plane
            .get_peer_replicas(&span.workflow_name)
            .await?;
        self.policy
            .pick(&span.function_name, &self.node_id, &peers)
            .ok_or_else(|| Error::NoValidTarget(span.function_name.clone()))
    }

    /// Run `span`'s flow on a peer and return its result.
    pub async fn forward(&self, span: &Span, params: Value) -> Result<Value> {
        let peer = self.target(span).await?;
        let url = invoke_url(&peer);
        let body = WorkflowRequest {
            workflow_name: span.workflow_name.clone(),
            flow_name: span.flow_name.clone(),
            upstream_flow_name: span.upstream_flow_name.clone(),
            parameters: params,
        };

        info!(
            function = %span.function_name,
            flow = %span.flow_name,
            peer = %peer,
            "Forwarding flow to peer"
        );

        let mut request = self
            .client
            .post(&url)
            .header(FORWARDED_HEADER, "true")
            .json(&body);
        if let Some(trace_parent) = &span.trace_parent {
            request = request.header(TRACEPARENT_HEADER, trace_parent);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::PeerRequest(format!("{peer}: {e}")))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| Error::PeerRequest(format!("{peer}: failed to read response body: {e}")))?;

        let reply: WorkflowResponse = serde_json::from_str(&text)
            .map_err(|_| Error::PeerRequest(format!("{peer}: HTTP {status}: {text}")))?;
        if !reply.success {
            return Err(Error::PeerRequest(format!("{peer}: {}", reply.message)));
        }

        debug!(peer = %peer, time = %reply.time, "Peer answered");
        Ok(reply.result)
    }
}
