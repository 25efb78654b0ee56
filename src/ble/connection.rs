//! BLE connection management.
//!
//! Connection state, session identity, and the [`Connector`] that opens a
//! transport connection under a timeout.

use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info};

use crate::ble::matcher::DeviceIdentity;
use crate::error::Result;
use crate::timer::{TimerId, Timers};
use crate::transport::Transport;

/// Lifecycle state of the supervised link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// Nothing in progress.
    #[default]
    Idle,
    /// Looking for the target peripheral.
    Scanning,
    /// Waiting for the transport to connect.
    Connecting,
    /// The transport reported the connection.
    Connected,
    /// Discovering services and enabling notifications.
    ResolvingServices,
    /// Data is flowing.
    Ready,
    /// The link dropped or an attempt failed; a retry may be pending.
    Disconnected,
    /// A precondition failed; waiting for an explicit `connect()`.
    Error,
}

impl ConnectionState {
    /// Check if the transport link is up.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected | Self::ResolvingServices | Self::Ready)
    }

    /// Check if an attempt is in progress.
    pub fn is_transitioning(&self) -> bool {
        matches!(
            self,
            Self::Scanning | Self::Connecting | Self::Connected | Self::ResolvingServices
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Scanning => write!(f, "Scanning"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::ResolvingServices => write!(f, "ResolvingServices"),
            Self::Ready => write!(f, "Ready"),
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Error => write!(f, "Error"),
        }
    }
}

/// Snapshot returned by `status()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    /// The transport link is up.
    pub connected: bool,
    /// A session handle exists.
    pub has_session: bool,
}

/// Identity of one connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "session#{}", self.0)
    }
}

/// The live connection handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// Unique id; events carrying another id are stale.
    pub id: SessionId,
    /// The device being connected.
    pub device: DeviceIdentity,
    /// Whether the address came from the address cache.
    pub via_cache: bool,
}

/// Opens transport connections with a timeout.
///
/// The session slot itself belongs to the supervisor and is passed in.
#[derive(Debug)]
pub struct Connector {
    timeout: Duration,
    timer: Option<TimerId>,
    next_session: u64,
}

impl Connector {
    /// Create a connector with the given connection timeout.
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            timer: None,
            next_session: 0,
        }
    }

    /// Release any previous session, then start connecting to `device`.
    ///
    /// On success the new session is stored in `slot` and the timeout is
    /// armed. On failure `slot` is left empty.
    pub fn connect_to(
        &mut self,
        slot: &mut Option<Session>,
        device: DeviceIdentity,
        via_cache: bool,
        transport: &mut dyn Transport,
        timers: &mut dyn Timers,
    ) -> Result<SessionId> {
        self.release(slot, transport, timers);

        self.next_session += 1;
        let id = SessionId(self.next_session);

        info!("Connecting to {} ({})", device, id);
        transport.connect(id, &device)?;

        self.timer = Some(timers.schedule(self.timeout));
        *slot = Some(Session {
            id,
            device,
            via_cache,
        });

        Ok(id)
    }

    /// The transport reported an outcome; the timeout is moot.
    pub fn settle(&mut self, timers: &mut dyn Timers) {
        if let Some(timer) = self.timer.take() {
            timers.cancel(timer);
        }
    }

    /// Claim a timer expiry. Returns `true` if it is the live connect timeout.
    pub fn take_timeout(&mut self, id: TimerId) -> bool {
        if self.timer == Some(id) {
            self.timer = None;
            true
        } else {
            false
        }
    }

    /// Cancel the timeout and close the session in `slot`, if any.
    pub fn release(
        &mut self,
        slot: &mut Option<Session>,
        transport: &mut dyn Transport,
        timers: &mut dyn Timers,
    ) {
        self.settle(timers);
        if let Some(session) = slot.take() {
            debug!("Releasing {} ({})", session.id, session.device);
            transport.close(session.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_state() {
        assert!(!ConnectionState::Idle.is_connected());
        assert!(ConnectionState::Ready.is_connected());
        assert!(ConnectionState::ResolvingServices.is_connected());
        assert!(!ConnectionState::Connecting.is_connected());

        assert!(ConnectionState::Scanning.is_transitioning());
        assert!(ConnectionState::Connecting.is_transitioning());
        assert!(!ConnectionState::Ready.is_transitioning());
        assert!(!ConnectionState::Disconnected.is_transitioning());
    }

    #[test]
    fn test_connection_state_display() {
        assert_eq!(format!("{}", ConnectionState::Ready), "Ready");
        assert_eq!(
            format!("{}", ConnectionState::ResolvingServices),
            "ResolvingServices"
        );
    }

    #[test]
    fn test_status_serializes_camel_case() {
        let status = ConnectionStatus {
            connected: true,
            has_session: true,
        };
        let json = serde_json::to_value(status).unwrap();
        assert_eq!(json, serde_json::json!({"connected": true, "hasSession": true}));
    }
}
