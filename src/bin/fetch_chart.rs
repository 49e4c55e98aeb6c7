//! Fetch bars for a list of symbols through a connection pool.
//!
//! Usage: CHARTFEED_TOKEN=... fetch_chart [--resolution 1D] [--bars 100] SYMBOL...

use std::env;

use chartfeed_sdk::{ChartRequest, ConnectionPool, LifecycleConfig, LifecycleManager, PoolConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let token = env::var("CHARTFEED_TOKEN").unwrap_or_else(|_| "unauthorized_user_token".to_string());

    let mut resolution = "1D".to_string();
    let mut bars_count: u32 = 100;
    let mut symbols = Vec::new();
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--resolution" => resolution = args.next().ok_or("--resolution needs a value")?,
            "--bars" => bars_count = args.next().ok_or("--bars needs a value")?.parse()?,
            _ => symbols.push(arg),
        }
    }
    if symbols.is_empty() {
        symbols.push("NASDAQ:AAPL".to_string());
    }

    let config = PoolConfig::from_env();
    info!(
        "Pool: {} connections x {} requests",
        config.max_connections, config.requests_per_connection
    );
    let manager = LifecycleManager::new(ConnectionPool::new(config), LifecycleConfig::default());
    manager.acquire(&token).await?;

    let requests = symbols
        .iter()
        .map(|symbol| ChartRequest::new(symbol.as_str(), resolution.as_str(), bars_count))
        .collect();
    let results = manager.pool().fetch_batch(&token, requests).await;

    println!("=== {} symbols @ {} ===\n", results.len(), resolution);
    for outcome in &results {
        match &outcome.result {
            Ok(data) => {
                let last = data.bars.last();
                println!(
                    "✓ {:<20} {:>5} bars  last close {}  ({})",
                    outcome.symbol,
                    data.bars.len(),
                    last.map(|b| b.close.to_string()).unwrap_or_default(),
                    data.metadata.description.as_deref().unwrap_or("-")
                );
            }
            Err(e) => println!("✗ {:<20} {}", outcome.symbol, e),
        }
    }

    let stats = manager.pool().stats();
    println!(
        "\npersistent: {} ({} open)",
        stats.persistent_mode, stats.persistent_connection_count
    );

    manager.release().await;
    manager.force_cleanup().await;
    Ok(())
}
