// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-invocation context.
//!
//! A [`Span`] carries the names the engine, middleware and scheduler need to
//! place one flow execution, plus a `tracing` span so every log line emitted
//! while running the flow is attributed to it. Child spans are derived as the
//! DAG is walked; they keep a handle on the root span of the request.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info_span};

/// Execution context of one flow within one request.
#[derive(Debug, Clone)]
pub struct Span {
    pub workflow_name: String,
    pub flow_name: String,
    pub function_name: String,
    pub upstream_flow_name: String,
    /// Set when the request came from a peer; such spans are never forwarded again.
    pub forwarded: bool,
    /// W3C `traceparent` received with the request, if any.
    pub trace_parent: Option<String>,
    root: tracing::Span,
    current: tracing::Span,
    started: Arc<OnceLock<Instant>>,
    finished: Arc<OnceLock<Duration>>,
}

impl Span {
    /// Root span of a request for `workflow_name`.
    pub fn root(workflow_name: impl Into<String>, forwarded: bool, trace_parent: Option<String>) -> Self {
        let workflow_name = workflow_name.into();
        let root = info_span!(
            "workflow",
            workflow = %workflow_name,
            forwarded,
            traceparent = trace_parent.as_deref().unwrap_or(""),
        );
        Self {
            workflow_name,
            flow_name: String::new(),
            function_name: String::new(),
            upstream_flow_name: String::new(),
            forwarded,
            trace_parent,
            current: root.clone(),
            root,
            started: Arc::new(OnceLock::new()),
            finished: Arc::new(OnceLock::new()),
        }
    }

    /// Span of `flow_name`, run downstream of this span's flow.
    pub fn child(&self, flow_name: impl Into<String>) -> Self {
        let flow_name = flow_name.into();
        let current = info_span!(
            parent: &self.current,
            "flow",
            workflow = %self.workflow_name,
            flow = %flow_name,
            upstream = %self.flow_name,
        );
        Self {
            workflow_name: self.workflow_name.clone(),
            upstream_flow_name: self.flow_name.clone(),
            flow_name,
            function_name: String::new(),
            forwarded: self.forwarded,
            trace_parent: self.trace_parent.clone(),
            root: self.root.clone(),
            current,
            started: Arc::new(OnceLock::new()),
            finished: Arc::new(OnceLock::new()),
        }
    }

    /// The `tracing` span of this flow.
    pub fn tracing_span(&self) -> &tracing::Span {
        &self.current
    }

    /// The `tracing` span of the whole request.
    pub fn root_span(&self) -> &tracing::Span {
        &self.root
    }

    /// Mark the start. Later calls are ignored.
    pub fn start(&self) {
        if self.started.set(Instant::now()).is_ok() {
            self.current.in_scope(|| {
                debug!(function = %self.function_name, "Span started");
            });
        }
    }

    /// Mark the end. Ignored before `start` and after the first call.
    pub fn finish(&self) {
        let Some(started) = self.started.get() else {
            return;
        };
        let elapsed = started.elapsed();
        if self.finished.set(elapsed).is_ok() {
            self.current.in_scope(|| {
                debug!(
                    function = %self.function_name,
                    elapsed_us = elapsed.as_micros() as u64,
                    "Span finished"
                );
            });
        }
    }

    /// Duration recorded by `finish`.
    pub fn elapsed(&self) -> Option<Duration> {
        self.finished.get().copied()
    }
}
