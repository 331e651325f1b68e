//! Example binary demonstrating the `astra_stargate_sdk` library.
//!
//! Lists the Astra databases of the organization behind
//! `ASTRA_DB_APPLICATION_TOKEN`, then, when `STARGATE_NODES` is set, lists
//! the Stargate namespaces and shows the load balancer state.
//!
//! ## Usage
//!
//! 1. Create a `.env` file with your configuration
//! 2. Run: `cargo run` (set `RUST_LOG=debug` for request traces)

#![allow(clippy::print_stdout)] // Allow println! in the binary example

use astra_stargate_sdk::{
    AstraDevopsClient, AstraDevopsConfig, DatabaseFilter, StargateClient, StargateConfig,
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match AstraDevopsConfig::from_env() {
        Ok(cfg) => {
            println!("Astra DevOps API: {}", cfg.devops_url);
            let devops = AstraDevopsClient::new(cfg)?;
            let databases = devops.list_databases(&DatabaseFilter::default()).await?;
            println!("{} database(s):", databases.len());
            for db in &databases {
                println!(
                    "  {}  {:<12}  {}",
                    db.id,
                    db.status,
                    db.info.name.as_deref().unwrap_or("-")
                );
            }
        }
        Err(e) => println!("Skipping Astra: {e}"),
    }

    if std::env::var_os("STARGATE_NODES").is_none() {
        println!("\nSTARGATE_NODES not set, skipping Stargate.");
        return Ok(());
    }
    let cfg = StargateConfig::from_env()?;

    let stargate = StargateClient::new(&cfg)?;
    println!("\nStargate namespaces:");
    for ns in stargate.list_namespaces().await? {
        println!("  {}", ns.name);
    }

    println!("\nNodes ({} policy):", cfg.policy);
    for node in stargate.node_snapshot() {
        println!(
            "  {}  weight={:.2}  used={}  available={}",
            node.id, node.current_weight, node.usage_count, node.available
        );
    }

    Ok(())
}
