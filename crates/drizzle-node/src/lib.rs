// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Drizzle Node - per-node serverless function scheduler
//!
//! A node receives workflow invocations over HTTP, walks the workflow DAG and
//! runs every flow's function on a local worker process. Workers are started
//! on demand, reused while warm and released once idle. When a function
//! cannot run locally the flow is forwarded to a peer node.
//!
//! # Architecture
//!
//! ```text
//!   POST /invoke
//!        │
//!        ▼
//!  ┌──────────┐   ┌──────────┐   ┌─────────────────┐   ┌─────────────────┐
//!  │ Manager  │──▶│  Engine  │──▶│ MiddlewareChain │──▶│FunctionScheduler│
//!  └──────────┘   └──────────┘   └───────┬─────────┘   └────────┬────────┘
//!                                        │ forward              │ pick lowest score
//!                                        ▼                      ▼
//!                                  ┌──────────┐          ┌─────────────┐
//!                                  │   Peer   │          │ InstanceSet │──▶ worker (fd 3/4)
//!                                  └──────────┘          └──────┬──────┘
//!                                                               │ TTL expiry
//!  QPS sampler ─┐                                               ▼
//!               ├─▶ metrics aggregator ─▶ schedule board ─▶ refresh(fn, target)
//!  TTL manager ─┘                             ▲
//!  cold start / prestart ─────────────────────┘
//! ```
//!
//! # Instance State Machine
//!
//! ```text
//!   Init ──first frame──▶ Running ──release / exit──▶ Terminating ──reaped──▶ Terminated
//!     └──────────────exit before ready────────────────────▲
//! ```
//!
//! # Modules
//!
//! - [`config`]: CLI and environment configuration
//! - [`error`]: node error type
//! - [`launcher`]: worker launchers (processes, in-process mocks)
//! - [`instance`]: one worker and its request correlation
//! - [`instance_set`]: per-function pools and scaling
//! - [`ttl`]: idle-instance expiry
//! - [`scheduler`]: registry of pools, create policies, control-plane sync
//! - [`events`]: QPS sampling, metrics aggregation, schedule decisions
//! - [`middleware`]: cold start, peer forwarding, QPS recording
//! - [`engine`]: DAG interpreter
//! - [`manager`]: request entry point
//! - [`server`]: HTTP surface
//! - [`runtime`]: embeddable runtime
//! - [`bootstrap`]: the worker-side `init` command

pub mod bootstrap;
pub mod code_store;
pub mod config;
pub mod control_plane;
pub mod engine;
pub mod error;
pub mod events;
pub mod instance;
pub mod instance_set;
pub mod launcher;
pub mod manager;
pub mod middleware;
pub mod peer;
pub mod runtime;
pub mod scheduler;
pub mod server;
pub mod span;
pub mod ttl;

pub use error::{Error, Result};
pub use runtime::NodeRuntime;
