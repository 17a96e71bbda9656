//! persistio soak test
//!
//! Runs several simulated nodes against one in-memory backend and reports
//! conflicts, cache behavior and lineage health.

mod account;
mod workload;

use anyhow::{Context, Result, bail};
use clap::Parser;
use persistio_common::Config;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use workload::SoakOptions;

#[derive(Parser, Debug)]
#[command(name = "persistio-soak")]
#[command(about = "Multi-node soak test for the persistio engine")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, env = "PERSISTIO_CONFIG")]
    config: Option<PathBuf>,

    /// Simulated nodes sharing one backend
    #[arg(long, default_value = "3")]
    nodes: usize,

    /// Accounts created before the run
    #[arg(long, default_value = "64")]
    accounts: usize,

    /// Operations per node
    #[arg(long, default_value = "5000")]
    operations: usize,

    /// Remote quotes read through proxies
    #[arg(long, default_value = "8")]
    quotes: usize,

    /// Seed for a reproducible run
    #[arg(long)]
    seed: Option<u64>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| args.log_level.clone().into());
    let registry = tracing_subscriber::registry().with(filter);
    if args.json_logs {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    let config = Config::load(args.config.as_deref()).context("failed to load configuration")?;
    info!(
        "Starting soak: {} nodes, {} accounts, {} operations per node",
        args.nodes, args.accounts, args.operations
    );

    let options = SoakOptions {
        nodes: args.nodes,
        accounts: args.accounts,
        operations: args.operations,
        quotes: args.quotes,
        seed: args.seed,
    };
    let report = workload::run(&config, &options)?;

    for node in &report.nodes {
        info!(
            "{}: {} deposits, {} persists, {} conflicts, {} failures, hit ratio {:.2}",
            node.node, node.deposits, node.persists, node.conflicts, node.failures, node.cache_hit_ratio
        );
    }
    println!("{}", serde_json::to_string_pretty(&report)?);

    if !report.is_healthy() {
        bail!("{} records exceeded the same-node run cap", report.cap_violations);
    }
    Ok(())
}
