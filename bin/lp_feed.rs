//! # LP Feed CLI
//!
//! Command-line front end for the LP Feed SDK: price lookups, wallet positions and RPC
//! endpoint administration against the configured providers.
//!
//! ## Usage
//!
//! ```bash
//! cargo run --bin lp_feed -- price SOL So11111111111111111111111111111111111111112
//! cargo run --bin lp_feed -- positions <wallet>
//! cargo run --bin lp_feed -- endpoints
//! cargo run --bin lp_feed -- cleanup --max-age-hours 24
//! ```
//!
//! Configuration comes from `Config.toml` (optional) and `SDK_*` environment variables.

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;
use lp_feed_sdk::{
    position_cache::PositionCache,
    price_feeds::{PriceAggregator, QuoteSource},
    rpc_pool::{CircuitBreakerStateName, RpcPool},
    settings::Settings,
};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "lp_feed")]
#[command(about = "Resilient price and position lookups for wallet dashboards", long_about = None)]
struct Cli {
    /// Alternate config file (default: Config.toml in the working directory)
    #[arg(short, long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Resolve USD prices (addresses and/or symbols) through the batch path
    Price {
        #[arg(required = true)]
        identifiers: Vec<String>,

        /// Fall back to the static known-price table for unresolved identifiers
        #[arg(short, long)]
        known: bool,
    },
    /// Show the best available positions for a wallet (cache, then known data)
    Positions { wallet: String },
    /// Probe every RPC endpoint and print its health
    Endpoints,
    /// Add an endpoint at the lowest priority, then probe the pool
    AddEndpoint { url: String },
    /// Remove an endpoint, then probe the pool
    RemoveEndpoint { url: String },
    /// Delete position snapshots older than the given age
    Cleanup {
        #[arg(long, default_value = "24")]
        max_age_hours: u64,
    },
    /// Print position cache statistics
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    env_logger::init();

    let cli = Cli::parse();
    let settings = match &cli.config {
        Some(path) => Settings::from_file(path)?,
        None => Settings::new()?,
    };

    #[cfg(feature = "observability")]
    {
        metrics_exporter_prometheus::PrometheusBuilder::new().install()?;
        lp_feed_sdk::metrics::describe_metrics();
    }

    match cli.command {
        Command::Price { identifiers, known } => run_price(&settings, identifiers, known).await?,
        Command::Positions { wallet } => run_positions(&settings, &wallet).await?,
        Command::Endpoints => {
            let pool = RpcPool::new(&settings)?;
            print_endpoints(&pool).await;
        }
        Command::AddEndpoint { url } => {
            let pool = RpcPool::new(&settings)?;
            pool.add_endpoint(&url)?;
            println!("{} {}", "added".green(), url);
            print_endpoints(&pool).await;
        }
        Command::RemoveEndpoint { url } => {
            let pool = RpcPool::new(&settings)?;
            if pool.remove_endpoint(&url) {
                println!("{} {}", "removed".green(), url);
            } else {
                println!("{} {} is not configured", "skipped".yellow(), url);
            }
            print_endpoints(&pool).await;
        }
        Command::Cleanup { max_age_hours } => {
            let cache = PositionCache::from_settings(&settings.position_cache).await?;
            let removed = cache
                .cleanup_older_than(Duration::from_secs(max_age_hours * 3600))
                .await;
            println!("Removed {} snapshots older than {}h", removed, max_age_hours);
        }
        Command::Stats => {
            let cache = PositionCache::from_settings(&settings.position_cache).await?;
            println!("{}", serde_json::to_string_pretty(&cache.stats())?);
        }
    }

    Ok(())
}

async fn run_price(settings: &Settings, identifiers: Vec<String>, known: bool) -> Result<()> {
    let aggregator = PriceAggregator::from_settings(&settings.price_feeds)?;
    let prices = aggregator.get_batch_prices(&identifiers).await;

    println!("{}", "=".repeat(80));
    for identifier in &identifiers {
        match prices.get(identifier.trim()) {
            Some(price) => println!("  {:<46} ${:.6}", identifier, price),
            None if known => match aggregator.get_price_or_known(identifier).await {
                Some(quote) => {
                    let tag = match quote.source {
                        QuoteSource::Known => "known".yellow(),
                        QuoteSource::Cache => "cache".normal(),
                        QuoteSource::Source(name) => name.normal(),
                    };
                    println!("  {:<46} ${:.6} ({})", identifier, quote.price, tag);
                }
                None => println!("  {:<46} {}", identifier, "unknown".red()),
            },
            None => println!("  {:<46} {}", identifier, "unknown".red()),
        }
    }
    println!("{}", "=".repeat(80));
    println!("{}", serde_json::to_string_pretty(&aggregator.cache_stats())?);
    Ok(())
}

async fn run_positions(settings: &Settings, wallet: &str) -> Result<()> {
    let cache = PositionCache::from_settings(&settings.position_cache).await?;
    let snapshot = cache.get_positions(wallet, None).await;

    println!(
        "Wallet {} ({} positions, provenance {}, {}s old)",
        snapshot.wallet,
        snapshot.positions.len(),
        snapshot.provenance.as_str().bold(),
        snapshot.age().num_seconds()
    );
    for position in &snapshot.positions {
        println!(
            "  {} {} {}/{} {:.4} / {:.4}",
            position.protocol, position.pool_address, position.token_a, position.token_b, position.amount_a, position.amount_b
        );
    }
    Ok(())
}

async fn print_endpoints(pool: &RpcPool) {
    match pool.get_healthy_connection().await {
        Ok(conn) => println!("Selected endpoint: {}", conn.url.green()),
        Err(e) => println!("{}", e.to_string().red()),
    }

    for stats in pool.endpoint_stats() {
        let state = match stats.circuit_state {
            CircuitBreakerStateName::Closed => "closed".green(),
            CircuitBreakerStateName::HalfOpen => "half-open".yellow(),
            CircuitBreakerStateName::Open => "open".red(),
        };
        let latency = stats
            .last_response_ms
            .map(|ms| format!("{}ms", ms))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {:<48} {:<10} failures={} latency={}",
            stats.url, state, stats.consecutive_failures, latency
        );
    }

    let (success_rate, open) = pool.resilience_stats();
    println!("Success rate {:.1}%, open circuits {}", success_rate * 100.0, open);
}
