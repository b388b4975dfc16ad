use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use vaultsync::cache::ReadCache;
use vaultsync::catalog::Catalog;
use vaultsync::chain::ReadProvider;
use vaultsync::chain::rpc::RpcClient;
use vaultsync::config::{self, Config};
use vaultsync::server;
use vaultsync::tx::Preflight;

#[derive(Parser, Debug)]
#[command(name = "vaultsync", about = "On-chain state synchronization and cache-consistency engine")]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "config.yaml", global = true)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, default_value_t = false, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the sync engine and the HTTP surface
    Run,
    /// Print the chain head and whether each action's preconditions hold
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    if cli.json_logs {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().compact())
            .init();
    }

    info!("vaultsync v{}", env!("CARGO_PKG_VERSION"));

    let config = config::Config::load(&cli.config)?;
    info!(
        chain = %config.chain.name,
        chain_id = config.chain.chain_id,
        entities = config.entities.len(),
        events = config.events.len(),
        actions = config.actions.len(),
        "configuration loaded"
    );

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => server::run(config).await,
        Command::Check => check(config).await,
    }
}

async fn check(config: Config) -> anyhow::Result<()> {
    let rpc = Arc::new(RpcClient::new(&config.chain, &config.transactions)?);
    let head = rpc
        .block_number()
        .await
        .with_context(|| format!("connecting to {}", config.chain.rpc_url))?;
    println!("{} (chain {}): head block {head}", config.chain.name, config.chain.chain_id);

    let cache = ReadCache::new(&config.cache);
    let catalog = Arc::new(Catalog::from_config(&config.entities, config.chain.account.clone())?);
    let preflight = Preflight::new(cache, catalog.loader(rpc));

    let mut blocked = 0;
    for action in &config.actions {
        let results = preflight.run(&action.preflight).await;
        let ok = results.iter().all(|r| r.passed);
        if !ok {
            blocked += 1;
        }
        println!("\n{}: {}", action.slot, if ok { "can proceed" } else { "blocked" });
        for r in results {
            let mark = if r.passed { "ok  " } else { "FAIL" };
            println!("  [{mark}] {} ({})", r.description, r.detail);
        }
    }

    if blocked > 0 {
        anyhow::bail!("{blocked} action(s) blocked by preconditions");
    }
    Ok(())
}
