//! Connect to an `Alchemy_TP` GATT sensor and print its notifications.
//!
//! Run with: cargo run --example gatt_monitor [config.toml]
//!
//! The last connected address is kept in `biosensor-link.json` so the next
//! run reconnects without scanning.

use biosensor_link::{FileAddressCache, LinkConfig, LinkEvent, LinkManager, LinkStatus, Result};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("biosensor_link=debug".parse().unwrap()),
        )
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => LinkConfig::from_toml_str(&std::fs::read_to_string(path)?)?,
        None => LinkConfig::gatt_sensor(),
    };

    println!("Looking for {}...", config.target.exact_name);
    println!("Press Ctrl+C to stop\n");

    let cache = FileAddressCache::new("biosensor-link.json");
    let link = LinkManager::with_default_adapter(config, cache).await?;

    let _handle = link.on_event(|event| match event {
        LinkEvent::ConnectionStateChange { status } => println!("[state] {}", status),
        LinkEvent::Error { error } => println!("[error] {}", error),
        LinkEvent::DataReceived(data) => {
            if let Ok(json) = serde_json::to_string(data) {
                println!("[data] {}", json);
            }
        }
    });

    link.connect();

    let mut status_interval = tokio::time::interval(Duration::from_secs(15));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = status_interval.tick() => {
                let snapshot = link.snapshot();
                println!(
                    "[status] {} connected={} session={} retries={}",
                    snapshot.state,
                    snapshot.status.connected,
                    snapshot.status.has_session,
                    snapshot.retry.attempt
                );
            }
        }
    }

    println!("\nShutting down...");
    link.shutdown().await?;
    println!("{}", LinkStatus::Disconnected);

    Ok(())
}
