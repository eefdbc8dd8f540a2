// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for drizzle-node.
//!
//! [`NodeRuntime`] wires the scheduler, event pipeline, middleware chain and
//! HTTP server together and owns their background tasks.
//!
//! ```rust,ignore
//! use drizzle_node::config::Config;
//! use drizzle_node::runtime::NodeRuntime;
//!
//! let runtime = NodeRuntime::builder()
//!     .config(config)
//!     .build()?
//!     .start()
//!     .await?;
//!
//! // ... serve ...
//!
//! runtime.shutdown().await?;
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::Config;
use crate::control_plane::{ControlPlane, LocalControlPlane};
use crate::engine::Engine;
use crate::events::qps::QpsSamplerConfig;
use crate::events::{EventSink, MetricsAggregator, QpsRecorder, QpsSampler, ScheduleBoard};
use crate::launcher::{ProcessLauncher, ProcessLauncherConfig, WorkerLauncher};
use crate::manager::Manager;
use crate::middleware::{Middleware, MiddlewareChain};
use crate::peer::PeerForwarder;
use crate::scheduler::{AllowAll, CreatePolicy, FunctionScheduler, ReplicaCap, SchedulerSync};
use crate::server::{AppState, run_server};

/// Builder for creating a [`NodeRuntime`].
#[derive(Default)]
pub struct NodeRuntimeBuilder {
    config: Option<Config>,
    launcher: Option<Arc<dyn WorkerLauncher>>,
    control_plane: Option<Arc<dyn ControlPlane>>,
    policy: Option<Arc<dyn CreatePolicy>>,
    qps_sampler: QpsSamplerConfig,
}

impl NodeRuntimeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the node configuration (required).
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Set the worker launcher.
    ///
    /// Default: a process launcher running `worker_program`, or this
    /// executable as `init -n <function>`.
    pub fn launcher(mut self, launcher: Arc<dyn WorkerLauncher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    /// Set the control plane.
    ///
    /// Default: workflows loaded from `workflows_dir`, peers from `peers`.
    pub fn control_plane(mut self, control_plane: Arc<dyn ControlPlane>) -> Self {
        self.control_plane = Some(control_plane);
        self
    }

    /// Set the instance creation policy.
    ///
    /// Default: capped by `max_replicas` when set, otherwise unlimited.
    pub fn policy(mut self, policy: Arc<dyn CreatePolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Set the QPS sampler period and window.
    pub fn qps_sampler(mut self, config: QpsSamplerConfig) -> Self {
        self.qps_sampler = config;
        self
    }

    /// Build the runtime configuration.
    pub fn build(self) -> Result<NodeRuntimeConfig> {
        let config = self
            .config
            .ok_or_else(|| anyhow::anyhow!("config is required"))?;

        let launcher = match self.launcher {
            Some(launcher) => launcher,
            None => {
                let launcher_config = match &config.worker_program {
                    Some(program) => ProcessLauncherConfig::program(program),
                    None => ProcessLauncherConfig::current_exe()?,
                }
                .with_isolation(config.isolation)
                .with_env("DRIZZLE_CODE_DIR", config.code_dir.to_string_lossy())
                .with_env("DRIZZLE_NAMESPACE", config.namespace.clone());
                Arc::new(ProcessLauncher::new(launcher_config)) as Arc<dyn WorkerLauncher>
            }
        };

        let control_plane = match self.control_plane {
            Some(control_plane) => control_plane,
            None => {
                let local = LocalControlPlane::new().with_peers(config.peers.clone());
                let loaded = local.load_dir(&config.workflows_dir)?;
                info!(dir = %config.workflows_dir.display(), loaded, "Workflows loaded");
                Arc::new(local) as Arc<dyn ControlPlane>
            }
        };

        let policy = self.policy.unwrap_or_else(|| match config.max_replicas {
            Some(cap) => Arc::new(ReplicaCap(cap)),
            None => Arc::new(AllowAll),
        });

        Ok(NodeRuntimeConfig {
            config,
            launcher,
            control_plane,
            policy,
            qps_sampler: self.qps_sampler,
        })
    }
}

/// Configuration for a [`NodeRuntime`].
pub struct NodeRuntimeConfig {
    config: Config,
    launcher: Arc<dyn WorkerLauncher>,
    control_plane: Arc<dyn ControlPlane>,
    policy: Arc<dyn CreatePolicy>,
    qps_sampler: QpsSamplerConfig,
}

impl NodeRuntimeConfig {
    /// Bind the listener and spawn every background task.
    pub async fn start(self) -> Result<NodeRuntime> {
        let config = self.config;
        let (sink, receivers) = EventSink::channel();

        let (scheduler, trigger) = FunctionScheduler::new(
            self.launcher.clone(),
            self.policy,
            config.ttl,
            sink.clone(),
        );
        let scheduler = Arc::new(scheduler);
        let recorder = Arc::new(QpsRecorder::new());

        let forwarder = PeerForwarder::new(
            self.control_plane.clone(),
            config.node_id.clone(),
            config.peer_timeout,
        )?;
        let mut chain = MiddlewareChain::new(
            scheduler.clone(),
            sink.clone(),
            recorder.clone(),
            config.lsds_wait,
        )
        .with_forwarder(Arc::new(forwarder));
        if config.static_middleware {
            chain = chain.with(Middleware::Static);
        }
        if !config.peers.is_empty() {
            chain = chain.with(Middleware::PeerForward);
        }
        if config.qps_middleware {
            chain = chain.with(Middleware::QpsRecord);
        }
        let middlewares = chain.middlewares().to_vec();

        let engine = Engine::new(Arc::new(chain), scheduler.clone(), sink.clone())
            .with_prestart(config.prestart);
        let manager = Arc::new(Manager::new(self.control_plane.clone(), engine));

        // Schedule board
        let board = ScheduleBoard::new(scheduler.clone(), receivers.schedule);
        let board_shutdown = board.shutdown_handle();
        let board_handle = tokio::spawn(board.run());

        // Metrics aggregator
        let aggregator = MetricsAggregator::new(sink.clone(), receivers.metrics);
        let aggregator_shutdown = aggregator.shutdown_handle();
        let aggregator_handle = tokio::spawn(aggregator.run());

        // QPS sampler
        let sampler = QpsSampler::new(recorder, sink, self.qps_sampler);
        let sampler_shutdown = sampler.shutdown_handle();
        let sampler_handle = tokio::spawn(sampler.run());

        // Control-plane sync
        let sync = SchedulerSync::new(
            scheduler.clone(),
            self.control_plane,
            config.node_id.clone(),
            trigger,
        );
        let sync_shutdown = sync.shutdown_handle();
        let sync_handle = tokio::spawn(sync.run());

        // HTTP server
        let listener = TcpListener::bind(config.listen).await?;
        let local_addr = listener.local_addr()?;
        let (server_shutdown_tx, server_shutdown_rx) = watch::channel(false);
        let state = AppState {
            manager: manager.clone(),
            scheduler: scheduler.clone(),
        };
        let server_handle = tokio::spawn(run_server(listener, state, server_shutdown_rx));

        info!(
            addr = %local_addr,
            node_id = %config.node_id,
            launcher = self.launcher.launcher_type(),
            ?middlewares,
            prestart = config.prestart,
            "NodeRuntime started"
        );

        Ok(NodeRuntime {
            server_handle,
            board_handle,
            aggregator_handle,
            sampler_handle,
            sync_handle,
            server_shutdown_tx,
            board_shutdown,
            aggregator_shutdown,
            sampler_shutdown,
            sync_shutdown,
            scheduler,
            manager,
            local_addr,
        })
    }
}

/// A running node.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct NodeRuntime {
    server_handle: JoinHandle<Result<()>>,
    board_handle: JoinHandle<()>,
    aggregator_handle: JoinHandle<()>,
    sampler_handle: JoinHandle<()>,
    sync_handle: JoinHandle<()>,
    server_shutdown_tx: watch::Sender<bool>,
    board_shutdown: Arc<Notify>,
    aggregator_shutdown: Arc<Notify>,
    sampler_shutdown: Arc<Notify>,
    sync_shutdown: Arc<Notify>,
    scheduler: Arc<FunctionScheduler>,
    manager: Arc<Manager>,
    local_addr: SocketAddr,
}

impl NodeRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> NodeRuntimeBuilder {
        NodeRuntimeBuilder::new()
    }

    /// Address the HTTP server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn scheduler(&self) -> &Arc<FunctionScheduler> {
        &self.scheduler
    }

    pub fn manager(&self) -> &Arc<Manager> {
        &self.manager
    }

    /// Check if every task is still running.
    pub fn is_running(&self) -> bool {
        !self.server_handle.is_finished()
            && !self.board_handle.is_finished()
            && !self.aggregator_handle.is_finished()
            && !self.sampler_handle.is_finished()
            && !self.sync_handle.is_finished()
    }

    /// Drain the server, stop the workers, then release every instance.
    ///
    /// In-flight requests may still cold-start functions while the server
    /// drains, so instances are released only once it has stopped.
    pub async fn shutdown(self) -> Result<()> {
        info!("NodeRuntime shutting down...");

        let _ = self.server_shutdown_tx.send(true);
        let served = match self.server_handle.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                error!("NodeRuntime server error during shutdown: {}", e);
                Err(e)
            }
            Err(e) => {
                error!("NodeRuntime server task panicked: {}", e);
                Err(anyhow::anyhow!("server task panicked: {}", e))
            }
        };

        self.board_shutdown.notify_one();
        self.aggregator_shutdown.notify_one();
        self.sampler_shutdown.notify_one();
        self.sync_shutdown.notify_one();

        if let Err(e) = self.board_handle.await {
            error!("Schedule board task panicked: {}", e);
        }
        if let Err(e) = self.aggregator_handle.await {
            error!("Metrics aggregator task panicked: {}", e);
        }
        if let Err(e) = self.sampler_handle.await {
            error!("QPS sampler task panicked: {}", e);
        }
        if let Err(e) = self.sync_handle.await {
            error!("Scheduler sync task panicked: {}", e);
        }

        self.scheduler.shutdown().await;

        if served.is_ok() {
            info!("NodeRuntime shutdown complete");
        }
        served
    }
}
