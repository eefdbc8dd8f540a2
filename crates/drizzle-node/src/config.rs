// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for drizzle-node.
//!
//! Every flag can also be set through a `DRIZZLE_*` environment variable;
//! `main` loads a `.env` file first so both sources work the same way.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

/// Replica counts reported per peer: `peer id -> function -> count`.
pub type PeerReplicas = HashMap<String, HashMap<String, usize>>;

/// Command line of the `drizzle-node` binary.
#[derive(Parser, Debug)]
#[command(name = "drizzle-node", version, about = "Per-node function scheduler")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve workflow invocations over HTTP.
    Serve(ServeArgs),
    /// Bootstrap a worker process: unpack the function code and exec its runtime.
    Init(InitArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Address to listen on.
    #[arg(long, env = "DRIZZLE_LISTEN", default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    /// Identifier of this node among its peers (defaults to the listen address).
    #[arg(long, env = "DRIZZLE_NODE_ID")]
    pub node_id: Option<String>,

    /// Idle time after which an instance is released.
    #[arg(long, env = "DRIZZLE_TTL", default_value = "20s", value_parser = parse_duration)]
    pub ttl: Duration,

    /// How long a request waits for a cold start before going elsewhere.
    #[arg(long, env = "DRIZZLE_LSDS_WAIT", default_value = "3s", value_parser = parse_duration)]
    pub lsds_wait: Duration,

    /// Count requests per function and scale on QPS.
    #[arg(long, env = "DRIZZLE_QPS_MIDDLEWARE")]
    pub qps_middleware: bool,

    /// Forward to a peer whenever no local instance is running.
    #[arg(long, env = "DRIZZLE_STATIC_MIDDLEWARE")]
    pub static_middleware: bool,

    /// Warm downstream functions while the current flow runs.
    #[arg(long, env = "DRIZZLE_PRESTART")]
    pub prestart: bool,

    /// Static peer view, `id=fn:count,fn:count;id=fn:count`.
    #[arg(long, env = "DRIZZLE_PEERS", value_parser = parse_peers)]
    pub peers: Option<PeerReplicas>,

    /// Directory holding `*.json` workflow definitions.
    #[arg(long, env = "DRIZZLE_WORKFLOWS_DIR", default_value = "./workflows")]
    pub workflows_dir: PathBuf,

    /// Root of the function code store.
    #[arg(long, env = "DRIZZLE_CODE_DIR", default_value = "./code")]
    pub code_dir: PathBuf,

    /// Code store namespace.
    #[arg(long, env = "DRIZZLE_NAMESPACE", default_value = "default")]
    pub namespace: String,

    /// Maximum instances per function.
    #[arg(long, env = "DRIZZLE_MAX_REPLICAS")]
    pub max_replicas: Option<usize>,

    /// Do not move workers into new namespaces.
    #[arg(long, env = "DRIZZLE_NO_ISOLATION")]
    pub no_isolation: bool,

    /// Program started for each worker (defaults to this executable, run as `init`).
    #[arg(long, env = "DRIZZLE_WORKER_PROGRAM")]
    pub worker_program: Option<PathBuf>,

    /// Timeout for requests forwarded to peers.
    #[arg(long, env = "DRIZZLE_PEER_TIMEOUT", default_value = "30s", value_parser = parse_duration)]
    pub peer_timeout: Duration,
}

#[derive(Args, Debug, Clone)]
pub struct InitArgs {
    /// Function to bootstrap.
    #[arg(short = 'n', long = "name")]
    pub function_name: String,

    /// Root of the function code store.
    #[arg(long, env = "DRIZZLE_CODE_DIR", default_value = "./code")]
    pub code_dir: PathBuf,

    /// Code store namespace.
    #[arg(long, env = "DRIZZLE_NAMESPACE", default_value = "default")]
    pub namespace: String,

    /// Runtime command; `{code_dir}` is replaced with the unpacked code directory.
    #[arg(long, env = "DRIZZLE_RUNTIME", default_value = "python3 {code_dir}/index.py")]
    pub runtime: String,

    /// Directory under `/tmp` the code is unpacked into.
    #[arg(long, env = "DRIZZLE_TMP_PREFIX", default_value = "drizzle")]
    pub tmp_prefix: String,
}

/// Resolved settings of a serving node.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub node_id: String,
    pub ttl: Duration,
    pub lsds_wait: Duration,
    pub qps_middleware: bool,
    pub static_middleware: bool,
    pub prestart: bool,
    pub peers: PeerReplicas,
    pub workflows_dir: PathBuf,
    pub code_dir: PathBuf,
    pub namespace: String,
    pub max_replicas: Option<usize>,
    pub isolation: bool,
    pub worker_program: Option<PathBuf>,
    pub peer_timeout: Duration,
}

impl From<ServeArgs> for Config {
    fn from(args: ServeArgs) -> Self {
        Self {
            node_id: args.node_id.unwrap_or_else(|| args.listen.to_string()),
            listen: args.listen,
            ttl: args.ttl,
            lsds_wait: args.lsds_wait,
            qps_middleware: args.qps_middleware,
            static_middleware: args.static_middleware,
            prestart: args.prestart,
            peers: args.peers.unwrap_or_default(),
            workflows_dir: args.workflows_dir,
            code_dir: args.code_dir,
            namespace: args.namespace,
            max_replicas: args.max_replicas,
            isolation: !args.no_isolation,
            worker_program: args.worker_program,
            peer_timeout: args.peer_timeout,
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A duration could not be parsed.
    #[error("invalid duration: {0}")]
    InvalidDuration(String),
    /// The peer list could not be parsed.
    #[error("invalid peer list: {0}")]
    InvalidPeers(String),
}

/// Parse `250ms`, `3s`, `5m` or `1h`. A bare number is taken as seconds.
pub fn parse_duration(s: &str) -> Result<Duration, ConfigError> {
    let s = s.trim();
    let invalid = || ConfigError::InvalidDuration(s.to_string());

    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);
    let value: u64 = digits.parse().map_err(|_| invalid())?;

    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "" | "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 3600)),
        _ => Err(invalid()),
    }
}

/// Parse a static peer view such as `10.0.0.2:8080=A:2,B:1;10.0.0.3:8080=A:1`.
pub fn parse_peers(s: &str) -> Result<PeerReplicas, ConfigError> {
    let invalid = |part: &str| ConfigError::InvalidPeers(part.to_string());
    let mut peers = PeerReplicas::new();

    for entry in s.split(';').map(str::trim).filter(|e| !e.is_empty()) {
        let (peer, functions) = entry.split_once('=').ok_or_else(|| invalid(entry))?;
        let peer = peer.trim();
        if peer.is_empty() {
            return Err(invalid(entry));
        }

        let counts = peers.entry(peer.to_string()).or_default();
        for item in functions.split(',').map(str::trim).filter(|i| !i.is_empty()) {
            let (function, count) = item.split_once(':').ok_or_else(|| invalid(item))?;
            let count = count.trim().parse::<usize>().map_err(|_| invalid(item))?;
            counts.insert(function.trim().to_string(), count);
        }
    }
    Ok(peers)
}
