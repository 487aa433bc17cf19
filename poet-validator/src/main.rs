// Copyright (c) Hetu Project
// SPDX-License-Identifier: Apache-2.0

//! PoET Validator - Main entry point
//!
//! Runs one validator over a local chain:
//! - PoET mode draws wait timers from the simulator enclave
//! - Dev mode claims a block every `devmode_block_interval_ms`

use clap::Parser;
use poet_validator::{Args, Node, NodeConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = NodeConfig::load(&args)?;
    init_tracing(&config.log_level);

    info!("╔════════════════════════════════════════════════════════════╗");
    info!("║                PoET Validator Node Starting                ║");
    info!("╠════════════════════════════════════════════════════════════╣");
    info!("║  Mode:          {:^42} ║", format!("{:?}", config.mode));
    info!("║  Poll interval: {:^42} ║", format!("{} ms", config.poll_interval_ms));
    if let Some(max_blocks) = config.max_blocks {
        info!("║  Max blocks:    {:^42} ║", max_blocks);
    }
    info!("╚════════════════════════════════════════════════════════════╝");

    let node = Node::build(config).await?;
    let handle = node.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
            handle.shutdown().await;
        }
    });

    let stats = node.run().await;
    info!(
        published = stats.blocks_published,
        committed = stats.blocks_committed,
        failed = stats.blocks_failed,
        "Validator stopped"
    );
    Ok(())
}
