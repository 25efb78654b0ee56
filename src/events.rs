//! Events delivered to the application.
//!
//! The supervisor reports everything through an [`EventSink`]: connection
//! state changes, human-readable errors, and sensor data.

use serde::Serialize;
use tokio::sync::broadcast;

/// Connection status reported to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LinkStatus {
    /// A connection attempt is in progress.
    Connecting,
    /// The peripheral is connected.
    Connected,
    /// The peripheral is not connected.
    Disconnected,
}

impl std::fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connecting => write!(f, "CONNECTING"),
            Self::Connected => write!(f, "CONNECTED"),
            Self::Disconnected => write!(f, "DISCONNECTED"),
        }
    }
}

/// Kind of a single-valued headset signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalKind {
    /// eSense attention level (0-100).
    Attention,
    /// eSense meditation level (0-100).
    Meditation,
    /// Signal quality (0 = good, 200 = no contact).
    PoorSignal,
}

/// EEG band powers reported by the headset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BandPower {
    /// Delta band (0.5 - 2.75Hz).
    pub delta: u32,
    /// Theta band (3.5 - 6.75Hz).
    pub theta: u32,
    /// Low alpha band (7.5 - 9.25Hz).
    pub low_alpha: u32,
    /// High alpha band (10 - 11.75Hz).
    pub high_alpha: u32,
    /// Low beta band (13 - 16.75Hz).
    pub low_beta: u32,
    /// High beta band (18 - 29.75Hz).
    pub high_beta: u32,
    /// Low gamma band (31 - 39.75Hz).
    pub low_gamma: u32,
    /// Mid gamma band (41 - 49.75Hz).
    pub mid_gamma: u32,
}

/// A structured reading from a vendor-SDK device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum SensorReading {
    /// A single-valued signal.
    Signal {
        /// Which signal.
        signal: SignalKind,
        /// The reported value.
        value: i32,
    },
    /// A full band-power set.
    BandPower(BandPower),
}

/// Payload of a data event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum DataPayload {
    /// Characteristic bytes decoded as text (GATT family).
    Text {
        /// The decoded text.
        data: String,
    },
    /// Structured reading (vendor-SDK family).
    Reading(SensorReading),
}

/// Event emitted by the supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "payload", rename_all = "camelCase")]
pub enum LinkEvent {
    /// The connection status changed.
    #[serde(rename = "onConnectionStateChange")]
    ConnectionStateChange {
        /// The new status.
        status: LinkStatus,
    },
    /// Something went wrong. Never fatal for the caller.
    #[serde(rename = "onError")]
    Error {
        /// Human-readable description.
        error: String,
    },
    /// Data arrived from the peripheral.
    #[serde(rename = "onDataReceived")]
    DataReceived(DataPayload),
}

impl LinkEvent {
    /// Shorthand for a state change event.
    pub fn status(status: LinkStatus) -> Self {
        Self::ConnectionStateChange { status }
    }

    /// Shorthand for an error event.
    pub fn error(error: impl Into<String>) -> Self {
        Self::Error {
            error: error.into(),
        }
    }
}

/// Receiver of supervisor events.
///
/// How events reach a UI layer is up to the implementation.
pub trait EventSink: Send {
    /// Deliver one event. Must not block.
    fn emit(&self, event: LinkEvent);
}

impl<F> EventSink for F
where
    F: Fn(LinkEvent) + Send,
{
    fn emit(&self, event: LinkEvent) {
        self(event)
    }
}

/// Sink that fans events out over a broadcast channel.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<LinkEvent>,
}

impl BroadcastSink {
    /// Create a sink with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to events.
    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.tx.subscribe()
    }
}

impl EventSink for BroadcastSink {
    fn emit(&self, event: LinkEvent) {
        // No subscribers is not an error.
        let _ = self.tx.send(event);
    }
}
