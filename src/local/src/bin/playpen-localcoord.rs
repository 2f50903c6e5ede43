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
use std::sync::Arc;

use anyhow::Context;
use pp_local::executor::InstallExecutor;
use pp_local::process::ChildSupervisor;
use pp_local::{LocalConfig, Node};
use pp_ore::cli::{self, CliConfig, KeyValueArg};
use pp_ore::tracing::TracingCliArgs;
use tracing::info;

/// Local coordinator for PlayPen.
#[derive(clap::Parser)]
#[clap(name = "playpen-localcoord")]
struct Args {
    /// The path of the JSON configuration file.
    #[clap(long, env = "CONFIG", value_name = "PATH")]
    config: PathBuf,
    /// The address of the network coordinator. Overrides the configuration
    /// file.
    #[clap(long, env = "NETWORK_ADDR", value_name = "HOST:PORT")]
    network_addr: Option<String>,
    /// A declared resource amount. Overrides the configuration file. May be
    /// specified multiple times.
    #[clap(long = "resource", value_name = "NAME=AMOUNT")]
    resources: Vec<KeyValueArg<String, i64>>,

    // === Tracing options. ===
    #[clap(flatten)]
    tracing: TracingCliArgs,
}

#[tokio::main]
async fn main() {
    let args = cli::parse_args(CliConfig {
        env_prefix: Some("PLAYPEN_LOCAL_"),
        enable_version_flag: true,
    });
    if let Err(err) = run(args).await {
        eprintln!("playpen-localcoord: fatal: {:#}", err);
        process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), anyhow::Error> {
    args.tracing.configure_tracing("playpen-localcoord")?;

    let mut config = LocalConfig::load(&args.config)?;
    if let Some(network_addr) = args.network_addr {
        config.network_addr = network_addr;
    }
    for KeyValueArg { key, value } in args.resources {
        config.resources.insert(key, value);
    }
    let supervisor = ChildSupervisor::new(config.console_replay_lines);
    let node = Node::new(config, Arc::new(InstallExecutor), Arc::new(supervisor))
        .context("initializing local coordinator")?;
    info!(
        identity = %node.identity(),
        network_addr = %node.config().network_addr,
        "starting local coordinator",
    );
    node.run().await
}
