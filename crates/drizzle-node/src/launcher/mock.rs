// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock launcher for testing.
//!
//! Runs each worker as a tokio task speaking the real frame protocol over
//! in-memory duplex pipes, so instances behave as they would with a process
//! without forking anything.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::{Value, json};
use tracing::debug;

use super::traits::*;
use crate::error::{Error, Result};

/// Pipe buffer size of mock workers.
const DUPLEX_CAPACITY: usize = 64 * 1024;

/// Function body run by mock workers: `(function name, params) -> result`.
pub type MockHandler =
    Arc<dyn Fn(String, Value) -> BoxFuture<'static, std::result::Result<Value, String>> + Send + Sync>;

/// Result of the echo worker: the params with `{function: function}` added.
///
/// Non-object params are wrapped as `{"params": ..}` first.
pub fn echo(function: &str, params: Value) -> Value {
    let mut result = match params {
        Value::Object(map) => Value::Object(map),
        other => json!({ "params": other }),
    };
    if let Some(map) = result.as_object_mut() {
        map.insert(function.to_string(), Value::String(function.to_string()));
    }
    result
}

/// Launcher whose workers are in-process tasks.
pub struct MockLauncher {
    handler: MockHandler,
    /// Time between launch and the ready frame.
    pub startup_delay: Duration,
    fail_launch: AtomicBool,
    launched: AtomicUsize,
}

impl Default for MockLauncher {
    fn default() -> Self {
        Self::new()
    }
}

impl MockLauncher {
    /// Create a mock launcher whose workers echo their params.
    pub fn new() -> Self {
        Self::with_handler(Arc::new(|function, params| {
            async move { Ok(echo(&function, params)) }.boxed()
        }))
    }

    /// Create a mock launcher running `handler` for every request.
    pub fn with_handler(handler: MockHandler) -> Self {
        Self {
            handler,
            startup_delay: Duration::ZERO,
            fail_launch: AtomicBool::new(false),
            launched: AtomicUsize::new(0),
        }
    }

    /// Create an echo launcher whose workers hold every request for `delay`.
    pub fn slow(delay: Duration) -> Self {
        Self::with_handler(Arc::new(move |function, params| {
            async move {
                tokio::time::sleep(delay).await;
                Ok(echo(&function, params))
            }
            .boxed()
        }))
    }

    pub fn with_startup_delay(mut self, delay: Duration) -> Self {
        self.startup_delay = delay;
        self
    }

    /// Make subsequent launches fail (or succeed again).
    pub fn set_fail_launch(&self, fail: bool) {
        self.fail_launch.store(fail, Ordering::SeqCst);
    }

    /// Number of workers launched so far.
    pub fn launched(&self) -> usize {
        self.launched.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WorkerLauncher for MockLauncher {
    fn launcher_type(&self) -> &'static str {
        "mock"
    }

    async fn launch(&self, spec: &LaunchSpec) -> Result<WorkerHandle> {
        if self.fail_launch.load(Ordering::SeqCst) {
            return Err(Error::Launch(format!(
                "mock launch refused for {}",
                spec.function_name
            )));
        }
        self.launched.fetch_add(1, Ordering::SeqCst);

        let (node_requests, worker_requests) = tokio::io::duplex(DUPLEX_CAPACITY);
        let (worker_responses, node_responses) = tokio::io::duplex(DUPLEX_CAPACITY);

        let handler = self.handler.clone();
        let function = spec.function_name.clone();
        let delay = self.startup_delay;
        let instance_id = spec.instance_id.clone();

        let task = tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let served = drizzle_protocol::worker::serve(
                worker_requests,
                worker_responses,
                move |params| handler(function.clone(), params),
            )
            .await;
            debug!(instance_id = %instance_id, ?served, "Mock worker finished");
        });

        let abort = task.abort_handle();
        let exited = async move {
            let _ = task.await;
        }
        .boxed();

        Ok(WorkerHandle {
            pid: None,
            requests: Box::new(node_requests),
            responses: Box::new(node_responses),
            exited,
            kill: Box::new(move || abort.abort()),
        })
    }
}
