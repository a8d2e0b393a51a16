// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use bridge_config::Config;
use bridge_watcher::config::WatcherConfig;
use bridge_watcher::node::run_watcher_node;
use clap::Parser;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[clap(rename_all = "kebab-case")]
#[clap(name = env!("CARGO_BIN_NAME"))]
#[clap(version = env!("CARGO_PKG_VERSION"))]
struct Args {
    #[clap(long)]
    pub config_path: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = WatcherConfig::load(&args.config_path)?;
    let registry = prometheus::Registry::new();

    let cancel = CancellationToken::new();
    let handle = run_watcher_node(config, registry, cancel.clone()).await?;

    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl-C, shutting down");
    cancel.cancel();
    handle
        .await
        .map_err(|e| anyhow::anyhow!("Task join error: {}", e))
}
