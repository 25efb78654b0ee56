// Allow unusual byte groupings for UUIDs which have standard format
#![allow(clippy::unusual_byte_groupings)]

//! # biosensor-link
//!
//! Keeps one reliable Bluetooth link between a host application and a
//! single paired biosensor peripheral.
//!
//! Two device families are supported:
//!
//! - **GATT sensors** (`Alchemy_TP`): the library scans, matches the
//!   advertisement, connects, resolves the `FFE0`/`FFE1` notification path
//!   and enables notifications itself.
//! - **EEG headsets** (`Alchemy`): the device performs its own handshake and
//!   streams ThinkGear packets; the library supervises liveness and
//!   reconnection.
//!
//! ## Features
//!
//! - **Address Caching**: Reconnect straight to the last connected device
//! - **Bonded Lookup**: Prefer devices already paired with the host
//! - **Timed Discovery**: Scan with a timeout when nothing is known
//! - **Exponential Backoff**: Capped, bounded reconnection attempts
//! - **Stale Event Isolation**: Late callbacks from torn-down sessions are ignored
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use biosensor_link::{FileAddressCache, LinkConfig, LinkEvent, LinkManager, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let cache = FileAddressCache::new("link-cache.json");
//!     let link = LinkManager::with_default_adapter(LinkConfig::gatt_sensor(), cache).await?;
//!
//!     let mut events = link.subscribe();
//!     link.connect();
//!
//!     while let Ok(event) = events.recv().await {
//!         if let LinkEvent::DataReceived(data) = event {
//!             println!("{:?}", data);
//!         }
//!     }
//!
//!     link.shutdown().await
//! }
//! ```
//!
//! ## Platform Notes
//!
//! ### macOS
//! Requires Bluetooth permission. Add `NSBluetoothAlwaysUsageDescription`
//! to your Info.plist for bundled apps.
//!
//! ### Linux
//! Requires BlueZ. User may need to be in the `bluetooth` group.
//!
//! ### Windows
//! Requires Windows 10 or later with Bluetooth LE support.

// Public modules
pub mod ble;
pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod link_manager;
pub mod platform;
pub mod protocol;
pub mod retry;
pub mod supervisor;
pub mod timer;
pub mod transport;

#[cfg(test)]
mod testing;

// Re-exports for convenience
pub use cache::{AddressCache, FileAddressCache, MemoryAddressCache, LAST_DEVICE_ADDRESS_KEY};
pub use config::{GattTarget, LinkConfig, RetryConfig, TargetSpec};
pub use error::{Error, Result};
pub use events::{
    BandPower, BroadcastSink, DataPayload, EventSink, LinkEvent, LinkStatus, SensorReading,
    SignalKind,
};
pub use link_manager::{CallbackHandle, LinkManager};
pub use supervisor::{ConnectionSupervisor, LinkSnapshot};
pub use transport::{Event, EventQueue, SessionEvent, Transport};

// Re-export commonly used types from submodules
pub use ble::connection::{ConnectionState, ConnectionStatus, SessionId};
pub use ble::matcher::{matches, DeviceIdentity};
pub use platform::{BtleplugTransport, StreamOpener, ThinkGearTransport};
pub use retry::RetryState;
pub use timer::{TimerId, Timers, TokioTimers};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_exports() {
        // Verify that key types are exported
        let _ = std::any::TypeId::of::<LinkManager>();
        let _ = std::any::TypeId::of::<ConnectionSupervisor>();
        let _ = std::any::TypeId::of::<Error>();
        let _ = std::any::TypeId::of::<LinkEvent>();
        let _ = std::any::TypeId::of::<LinkConfig>();
        let _ = std::any::TypeId::of::<DeviceIdentity>();
    }
}
