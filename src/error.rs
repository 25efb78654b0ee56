//! Error types for the biosensor-link crate.

use thiserror::Error;

/// The main error type for this crate.
#[derive(Error, Debug)]
pub enum Error {
    /// Bluetooth-related error from the underlying BLE library.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// Bluetooth is not available or is disabled on this system.
    #[error("Bluetooth not available or disabled")]
    BluetoothUnavailable,

    /// A permission required for scanning or connecting has not been granted.
    #[error("Missing Bluetooth permission: {permission}")]
    PermissionDenied {
        /// The permission that is missing.
        permission: String,
    },

    /// Failed to establish a connection to the peripheral.
    #[error("Connection failed: {reason}")]
    ConnectionFailed {
        /// Description of why the connection failed.
        reason: String,
    },

    /// The address could not be resolved to a remote device.
    #[error("Invalid device address: {address}")]
    InvalidAddress {
        /// The rejected address.
        address: String,
    },

    /// Service not found on the device.
    #[error("Service not found: {uuid}")]
    ServiceNotFound {
        /// The UUID of the service that was not found.
        uuid: String,
    },

    /// Characteristic not found on the device.
    #[error("Characteristic not found: {uuid}")]
    CharacteristicNotFound {
        /// The UUID of the characteristic that was not found.
        uuid: String,
    },

    /// The notification-enable descriptor was not found on the characteristic.
    #[error("Descriptor not found: {uuid}")]
    DescriptorNotFound {
        /// The UUID of the descriptor that was not found.
        uuid: String,
    },

    /// Writing the notification-enable descriptor failed.
    #[error("Descriptor write failed: {reason}")]
    DescriptorWriteFailed {
        /// The reason reported by the transport.
        reason: String,
    },

    /// Checksum failed for a sensor stream packet.
    #[error("Checksum mismatch: expected {expected:#04x}, got {actual:#04x}")]
    ChecksumMismatch {
        /// The checksum computed over the payload.
        expected: u8,
        /// The checksum carried by the packet.
        actual: u8,
    },

    /// Invalid data was received from the peripheral.
    #[error("Invalid data received: {context}")]
    InvalidData {
        /// Description of what was invalid about the data.
        context: String,
    },

    /// The requested operation is not supported by this transport.
    #[error("Operation not supported: {operation}")]
    NotSupported {
        /// Description of the unsupported operation.
        operation: String,
    },

    /// An invalid parameter was provided.
    #[error("Invalid parameter: {name} = {value}")]
    InvalidParameter {
        /// The name of the parameter.
        name: String,
        /// The invalid value that was provided.
        value: String,
    },

    /// Configuration could not be parsed.
    #[error("Invalid configuration: {0}")]
    Config(#[from] toml::de::Error),

    /// Reading or writing persisted state failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Persisted state could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The link task is no longer running.
    #[error("Link task stopped")]
    LinkStopped,
}

impl Error {
    /// Convert a btleplug error, lifting a permission refusal into
    /// [`Error::PermissionDenied`].
    pub fn bluetooth(error: btleplug::Error) -> Self {
        match error {
            btleplug::Error::PermissionDenied => Error::PermissionDenied {
                permission: "bluetooth".to_string(),
            },
            other => Error::Bluetooth(other),
        }
    }

    /// Whether the host itself cannot do Bluetooth right now (adapter off,
    /// permission missing). Retrying cannot fix these.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Error::BluetoothUnavailable
                | Error::PermissionDenied { .. }
                | Error::Bluetooth(btleplug::Error::PermissionDenied)
        )
    }
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
