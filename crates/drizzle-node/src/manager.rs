// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Request entry point: resolves the workflow and hands it to the engine.

use std::sync::Arc;

use drizzle_protocol::{WorkflowRequest, WorkflowResponse};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{Instrument, info, warn};

use crate::control_plane::ControlPlane;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::span::Span;

/// A packaged response plus the error behind it, if any.
#[derive(Debug)]
pub struct InvokeOutcome {
    pub response: WorkflowResponse,
    pub error: Option<Error>,
}

pub struct Manager {
    control_plane: Arc<dyn ControlPlane>,
    engine: Engine,
}

impl Manager {
    pub fn new(control_plane: Arc<dyn ControlPlane>, engine: Engine) -> Self {
        Self {
            control_plane,
            engine,
        }
    }

    /// Serve one request.
    ///
    /// An empty `flow_name` walks the whole workflow; otherwise only that
    /// flow runs, which is the form peers send each other.
    pub async fn invoke(
        &self,
        request: WorkflowRequest,
        forwarded: bool,
        trace_parent: Option<String>,
    ) -> Result<Value> {
        let workflow = self.control_plane.get_workflow(&request.workflow_name).await?;
        let root = Span::root(workflow.name.clone(), forwarded, trace_parent);
        root.start();

        let result = if request.flow_name.is_empty() {
            self.engine
                .walk(&root, request.parameters, workflow)
                .instrument(root.root_span().clone())
                .await
        } else {
            self.engine
                .run_flow(
                    &root,
                    &request.flow_name,
                    &request.upstream_flow_name,
                    request.parameters,
                    workflow,
                )
                .instrument(root.root_span().clone())
                .await
        };

        root.finish();
        result
    }

    /// Serve one request and package the outcome with its wall time.
    pub async fn invoke_response(
        &self,
        request: WorkflowRequest,
        forwarded: bool,
        trace_parent: Option<String>,
    ) -> InvokeOutcome {
        let started = Instant::now();
        let workflow = request.workflow_name.clone();
        let flow = request.flow_name.clone();

        match self.invoke(request, forwarded, trace_parent).await {
            Ok(result) => {
                let elapsed = started.elapsed();
                info!(
                    workflow = %workflow,
                    flow = %flow,
                    forwarded,
                    elapsed_us = elapsed.as_micros() as u64,
                    "Request served"
                );
                InvokeOutcome {
                    response: WorkflowResponse::success(result, elapsed),
                    error: None,
                }
            }
            Err(e) => {
                let elapsed = started.elapsed();
                warn!(workflow = %workflow, flow = %flow, forwarded, error = %e, "Request failed");
                InvokeOutcome {
                    response: WorkflowResponse::failure(e.to_string(), elapsed),
                    error: Some(e),
                }
            }
        }
    }
}
