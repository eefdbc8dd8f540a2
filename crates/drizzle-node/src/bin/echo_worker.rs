// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Reference worker speaking the pipe protocol.
//!
//! Answers every request with its params plus `{<function>: <function>}`.
//! Started by the node with the request pipe on fd 3 and the response pipe
//! on fd 4:
//!
//!   drizzle-node serve --worker-program target/debug/drizzle-echo-worker --no-isolation

use std::time::Duration;

use clap::Parser;
use drizzle_node::config::parse_duration;
use drizzle_node::launcher::mock::echo;
use drizzle_protocol::worker;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "drizzle-echo-worker", about = "Echo worker for drizzle nodes")]
struct Args {
    /// Function this worker serves.
    #[arg(short = 'n', long = "name", env = "DRIZZLE_FUNCTION")]
    function_name: String,

    /// Time spent on every request.
    #[arg(long, default_value = "0ms", value_parser = parse_duration)]
    delay: Duration,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "drizzle_echo_worker=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    info!(function = %args.function_name, pid = std::process::id(), "Echo worker started");

    // SAFETY: the node hands fds 3 and 4 to this process and nothing else opens them.
    let (requests, responses) = unsafe { worker::inherited_pipes()? };

    let function = args.function_name.clone();
    let delay = args.delay;
    worker::serve(requests, responses, move |params| {
        let function = function.clone();
        async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            Ok(echo(&function, params))
        }
    })
    .await?;

    info!(function = %args.function_name, "Request pipe closed, exiting");
    Ok(())
}
