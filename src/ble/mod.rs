//! BLE link building blocks.
//!
//! This module provides the pieces the supervisor drives: target matching,
//! timed scanning, connection with a timeout, and GATT service resolution.

pub mod characteristics;
pub mod connection;
pub mod matcher;
pub mod scanner;
pub mod uuids;

pub use characteristics::{GattCharacteristic, GattService, ResolvedTarget, ServiceResolver};
pub use connection::{ConnectionState, ConnectionStatus, Connector, Session, SessionId};
pub use matcher::{find_bonded, match_advertisement, matches, DeviceIdentity, MatchReason};
pub use scanner::Scanner;
pub use uuids::*;
