// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::path::PathBuf;
use std::process;

use anyhow::Context;
use pp_network::config::DEFAULT_LISTEN_ADDR;
use pp_network::{Network, NetworkConfig};
use pp_ore::cli::{self, CliConfig};
use pp_ore::tracing::TracingCliArgs;
use tokio::net::TcpListener;
use tracing::info;

/// Network coordinator for PlayPen.
#[derive(clap::Parser)]
#[clap(name = "playpen-networkd")]
struct Args {
    /// The path of the JSON configuration file.
    #[clap(long, env = "CONFIG", value_name = "PATH")]
    config: PathBuf,
    /// The address on which to listen for connections. Overrides the
    /// configuration file.
    #[clap(long, env = "LISTEN_ADDR", value_name = "HOST:PORT")]
    listen_addr: Option<String>,

    // === Tracing options. ===
    #[clap(flatten)]
    tracing: TracingCliArgs,
}

#[tokio::main]
async fn main() {
    let args = cli::parse_args(CliConfig {
        env_prefix: Some("PLAYPEN_NETWORK_"),
        enable_version_flag: true,
    });
    if let Err(err) = run(args).await {
        eprintln!("playpen-networkd: fatal: {:#}", err);
        process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), anyhow::Error> {
    args.tracing.configure_tracing("playpen-networkd")?;

    let config = NetworkConfig::load(&args.config)?;
    let listen_addr = args
        .listen_addr
        .or_else(|| config.listen_addr.clone())
        .unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string());

    let network = Network::new(&config).context("initializing network coordinator")?;
    info!(identity = %network.identity(), "starting network coordinator");

    let listener = TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("binding {listen_addr}"))?;
    pp_network::server::serve(network, listener).await
}
