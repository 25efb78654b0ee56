//! Supervise an `Alchemy` EEG headset whose ThinkGear stream is bridged to TCP.
//!
//! Bridge the headset's serial channel to a local port first, e.g. with
//! `socat TCP-LISTEN:5555,reuseaddr /dev/rfcomm0`, then run:
//!
//! cargo run --example headset_monitor -- 20:68:9D:4C:0E:11 127.0.0.1:5555

use async_trait::async_trait;
use biosensor_link::platform::headset::{SensorStream, StreamOpener, ThinkGearTransport};
use biosensor_link::{
    DataPayload, DeviceIdentity, FileAddressCache, LinkConfig, LinkEvent, LinkManager, Result,
    SensorReading,
};
use std::io;

/// Opens the bridged stream of a single bonded headset.
struct TcpBridge {
    address: String,
    endpoint: String,
}

#[async_trait]
impl StreamOpener for TcpBridge {
    fn bonded_devices(&self) -> Vec<DeviceIdentity> {
        vec![DeviceIdentity::named("Alchemy", self.address.clone())]
    }

    async fn open(&self, address: &str) -> io::Result<SensorStream> {
        if !address.eq_ignore_ascii_case(&self.address) {
            return Err(io::Error::new(io::ErrorKind::NotFound, "unknown headset"));
        }
        let stream = tokio::net::TcpStream::connect(&self.endpoint).await?;
        Ok(Box::new(stream))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("biosensor_link=info".parse().unwrap()),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let address = args.next().unwrap_or_else(|| "20:68:9D:4C:0E:11".to_string());
    let endpoint = args.next().unwrap_or_else(|| "127.0.0.1:5555".to_string());

    println!("Supervising headset {} via {}", address, endpoint);
    println!("Press Ctrl+C to stop\n");

    let bridge = TcpBridge { address, endpoint };
    let link = LinkManager::new(
        LinkConfig::eeg_headset(),
        FileAddressCache::new("biosensor-link.json"),
        |queue| ThinkGearTransport::new(bridge, queue),
    )?;

    let _handle = link.on_event(|event| match event {
        LinkEvent::ConnectionStateChange { status } => println!("[state] {}", status),
        LinkEvent::Error { error } => println!("[error] {}", error),
        LinkEvent::DataReceived(DataPayload::Reading(SensorReading::Signal { signal, value })) => {
            println!("{:?}: {}", signal, value)
        }
        LinkEvent::DataReceived(DataPayload::Reading(SensorReading::BandPower(power))) => {
            println!(
                "delta={} theta={} alpha={}/{} beta={}/{} gamma={}/{}",
                power.delta,
                power.theta,
                power.low_alpha,
                power.high_alpha,
                power.low_beta,
                power.high_beta,
                power.low_gamma,
                power.mid_gamma
            );
        }
        LinkEvent::DataReceived(DataPayload::Text { data }) => println!("{}", data),
    });

    link.connect();
    let _ = tokio::signal::ctrl_c().await;

    println!("\nShutting down...");
    link.shutdown().await
}
