// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Launcher trait definitions.

use std::fmt;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::Result;

/// What to launch.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Instance ID (UUID)
    pub instance_id: String,
    /// Function the worker serves
    pub function_name: String,
}

/// Stops a worker. Calling it more than once must be harmless.
pub type Killer = Box<dyn Fn() + Send + Sync>;

/// A launched worker and its pipes.
pub struct WorkerHandle {
    /// OS process id, when the worker is a process.
    pub pid: Option<u32>,
    /// Node -> worker request stream (fd 3 on the worker side).
    pub requests: Box<dyn AsyncWrite + Send + Unpin>,
    /// Worker -> node response stream (fd 4 on the worker side).
    pub responses: Box<dyn AsyncRead + Send + Unpin>,
    /// Resolves once the worker has exited.
    pub exited: BoxFuture<'static, ()>,
    /// Kills the worker.
    pub kill: Killer,
}

impl fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerHandle").field("pid", &self.pid).finish_non_exhaustive()
    }
}

/// Trait for worker launchers.
///
/// Different implementations spawn OS processes or in-process tasks.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    /// Launcher type identifier (e.g., "process", "mock")
    fn launcher_type(&self) -> &'static str;

    /// Start a worker for `spec.function_name`.
    async fn launch(&self, spec: &LaunchSpec) -> Result<WorkerHandle>;
}
