// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Rucket Authors

//! `pgmap`: computes PG layouts and primaries from a cluster state dump.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use rucket_pgmap::{
    generate_pool_pgs, recheck_primaries, stage_results, ClusterState, GlobalConfig,
    GreedyOptimizer, LogFormat, PoolId, PoolPgResult, PoolStats,
};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Computes PG layouts and primaries from a cluster state dump.
#[derive(Parser)]
#[command(name = "pgmap")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Cluster configuration file (TOML).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Command to execute.
    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Generate PG layouts and the transactions persisting them.
    Generate(GenerateArgs),
    /// Recompute PG primaries.
    Recheck(StateArgs),
}

/// Cluster state input.
#[derive(Args)]
struct StateArgs {
    /// Cluster state dump (JSON).
    #[arg(short, long)]
    state: PathBuf,
}

/// Arguments for the generate command.
#[derive(Args)]
struct GenerateArgs {
    #[command(flatten)]
    state: StateArgs,

    /// Only generate this pool.
    #[arg(short, long)]
    pool: Option<PoolId>,
}

#[derive(Serialize)]
struct PoolSummary {
    pool_id: PoolId,
    stats: PoolStats,
}

#[derive(Serialize)]
struct GenerateOutput {
    pools: Vec<PoolSummary>,
    #[serde(flatten)]
    staged: rucket_pgmap::StagedUpdate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    init_logging(&config);

    match cli.command {
        Commands::Generate(args) => run_generate(&config, args).await,
        Commands::Recheck(args) => run_recheck(&config, &args),
    }
}

async fn run_generate(config: &GlobalConfig, args: GenerateArgs) -> Result<()> {
    let state = load_state(&args.state.state)?;
    let pool_ids: Vec<PoolId> = match args.pool {
        Some(pool_id) => vec![pool_id],
        None => state.pools.keys().copied().collect(),
    };

    let optimizer = GreedyOptimizer::new();
    let mut results: Vec<PoolPgResult> = Vec::with_capacity(pool_ids.len());
    for pool_id in pool_ids {
        let result = generate_pool_pgs(&state, config, pool_id, &optimizer)
            .await
            .with_context(|| format!("Failed to generate PGs for pool {pool_id}"))?;
        results.extend(result);
    }

    let staged = stage_results(&state, config, &results).context("Failed to stage transactions")?;
    info!(pools = results.len(), requests = staged.requests.len(), "PG generation complete");

    let pools = results.iter().map(|r| PoolSummary { pool_id: r.pool_id, stats: r.stats }).collect();
    print_json(&GenerateOutput { pools, staged })
}

fn run_recheck(config: &GlobalConfig, args: &StateArgs) -> Result<()> {
    let state = load_state(&args.state)?;
    let updated = recheck_primaries(
        &state.pools,
        &config.levels(),
        &state.config_pgs,
        &state.up_osds,
        &state.osd_tree,
    );
    print_json(&updated)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("Failed to encode output")?;
    println!("{json}");
    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<GlobalConfig> {
    match path {
        Some(path) => GlobalConfig::from_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display())),
        None => Ok(GlobalConfig::default()),
    }
}

fn load_state(path: &Path) -> Result<ClusterState> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read cluster state from {}", path.display()))?;
    serde_json::from_str(&content).context("Failed to parse cluster state")
}

fn init_logging(config: &GlobalConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));

    // Logs go to stderr; stdout carries the JSON result.
    let fmt_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    match config.logging.format {
        LogFormat::Json => {
            tracing_subscriber::registry().with(filter).with(fmt_layer.json()).init();
        }
        LogFormat::Pretty => {
            tracing_subscriber::registry().with(filter).with(fmt_layer).init();
        }
    }
}
