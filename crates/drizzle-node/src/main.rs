// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Drizzle Node
//!
//! - `drizzle-node serve`: run the node (HTTP, scheduler, autoscaling)
//! - `drizzle-node init -n <function>`: worker bootstrap, exec'd by the node

use clap::Parser;
use tracing::{info, warn};

use drizzle_node::bootstrap;
use drizzle_node::code_store::FsCodeStore;
use drizzle_node::config::{Cli, Command, Config, InitArgs};
use drizzle_node::runtime::NodeRuntime;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging; stdout may belong to a worker runtime
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "drizzle_node=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => serve(args.into()).await,
        Command::Init(args) => init(args).await,
    }
}

async fn serve(config: Config) -> anyhow::Result<()> {
    info!(
        listen = %config.listen,
        node_id = %config.node_id,
        workflows_dir = %config.workflows_dir.display(),
        isolation = config.isolation,
        "Starting drizzle node"
    );

    let runtime = NodeRuntime::builder()
        .config(config)
        .build()?
        .start()
        .await?;

    info!(addr = %runtime.local_addr(), "Node ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    runtime.shutdown().await?;

    info!("Drizzle node shut down");
    Ok(())
}

async fn init(args: InitArgs) -> anyhow::Result<()> {
    let store = FsCodeStore::new(&args.code_dir);
    let command = bootstrap::prepare(&args, &store).await?;
    Err(bootstrap::exec(command).into())
}
