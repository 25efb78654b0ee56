//! Platform transports.
//!
//! - [`gatt`]: GATT peripherals through a btleplug adapter
//! - [`headset`]: ThinkGear headsets through a [`headset::StreamOpener`]

pub mod gatt;
pub mod headset;

pub use gatt::{default_adapter, BtleplugTransport};
pub use headset::{SensorStream, StreamOpener, ThinkGearTransport};
