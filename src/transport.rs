//! Transport seam and the event queue.
//!
//! A [`Transport`] is the platform side of a link. Every method issues a
//! request and returns immediately; completions are posted later to the
//! [`EventQueue`] as [`Event`]s tagged with the [`SessionId`] they belong to.

use tokio::sync::{mpsc, oneshot};
use tracing::trace;
use uuid::Uuid;

use crate::ble::characteristics::{GattService, ResolvedTarget};
use crate::ble::connection::SessionId;
use crate::ble::matcher::DeviceIdentity;
use crate::error::{Error, Result};
use crate::events::SensorReading;
use crate::timer::TimerId;

/// Something that happened on the platform side, or a timer expiry.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// An advertisement was observed while scanning.
    Advertisement(DeviceIdentity),
    /// The platform could not start or continue scanning.
    ScanFailed {
        /// The scan this failure belongs to, as passed to
        /// [`Transport::start_scan`].
        scan: TimerId,
        /// Description of the failure.
        reason: String,
        /// `true` when the host cannot scan at all (adapter off,
        /// permission missing), so retrying is pointless.
        precondition: bool,
    },
    /// An event belonging to one connection session.
    Session {
        /// Which session produced the event.
        session: SessionId,
        /// What happened.
        event: SessionEvent,
    },
    /// A timer expired.
    Timer(TimerId),
}

/// Events scoped to a single session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The transport reports the peripheral connected.
    Connected,
    /// The connection attempt was rejected.
    ConnectFailed {
        /// Description of the failure.
        reason: String,
        /// `false` when retrying cannot help (e.g. the device is not paired).
        retry: bool,
    },
    /// The link dropped.
    Disconnected {
        /// Description, if the transport gave one.
        reason: Option<String>,
    },
    /// Service discovery completed.
    ServicesDiscovered(std::result::Result<Vec<GattService>, String>),
    /// The notification-enable descriptor write completed.
    DescriptorWritten(std::result::Result<(), String>),
    /// A characteristic notification arrived.
    Notification {
        /// Characteristic that notified.
        characteristic: Uuid,
        /// Raw value.
        value: Vec<u8>,
    },
    /// A structured reading arrived from a vendor-SDK device.
    Reading(SensorReading),
}

/// Commands from the application handle.
#[derive(Debug)]
pub(crate) enum Command {
    Connect,
    Disconnect,
    Shutdown(Option<oneshot::Sender<()>>),
}

/// Everything the link task consumes.
#[derive(Debug)]
pub(crate) enum Input {
    Command(Command),
    Event(Event),
}

/// Producer side of the link task's single event queue.
///
/// Cheap to clone; every transport callback and timer posts through one.
#[derive(Debug, Clone)]
pub struct EventQueue {
    tx: mpsc::UnboundedSender<Input>,
}

impl EventQueue {
    pub(crate) fn channel() -> (Self, mpsc::UnboundedReceiver<Input>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Post an event. Events posted after the link task stopped are dropped.
    pub fn post(&self, event: Event) {
        if self.tx.send(Input::Event(event)).is_err() {
            trace!("Link task gone, dropping event");
        }
    }

    /// Post an event for a session.
    pub fn post_session(&self, session: SessionId, event: SessionEvent) {
        self.post(Event::Session { session, event });
    }

    pub(crate) fn command(&self, command: Command) -> Result<()> {
        self.tx
            .send(Input::Command(command))
            .map_err(|_| Error::LinkStopped)
    }
}

/// Platform side of a supervised link.
///
/// The GATT methods have default implementations reporting
/// [`Error::NotSupported`]; transports whose device resolves its own
/// services (vendor SDK objects) do not override them.
pub trait Transport: Send {
    /// Check adapter state and permissions.
    fn check_ready(&self) -> Result<()>;

    /// Begin scanning. Advertisements are posted as [`Event::Advertisement`].
    ///
    /// `scan` identifies this scan; a later failure is reported as
    /// [`Event::ScanFailed`] carrying it.
    fn start_scan(&mut self, scan: TimerId) -> Result<()>;

    /// Stop scanning. Must be idempotent.
    fn stop_scan(&mut self);

    /// Devices already bonded with this host.
    fn bonded_devices(&self) -> Vec<DeviceIdentity>;

    /// Resolve a cached address to a device. Fails if the address is unusable.
    fn remote_device(&self, address: &str) -> Result<DeviceIdentity>;

    /// Start connecting. The outcome arrives as a [`SessionEvent`].
    fn connect(&mut self, session: SessionId, device: &DeviceIdentity) -> Result<()>;

    /// Disconnect and release the session. Later events for it are stale.
    fn close(&mut self, session: SessionId);

    /// Start service discovery; completes with [`SessionEvent::ServicesDiscovered`].
    fn discover_services(&mut self, _session: SessionId) -> Result<()> {
        Err(Error::NotSupported {
            operation: "service discovery".to_string(),
        })
    }

    /// Enable local delivery of notifications for the resolved characteristic.
    fn enable_notifications(&mut self, _session: SessionId, _target: &ResolvedTarget) -> Result<()> {
        Err(Error::NotSupported {
            operation: "notifications".to_string(),
        })
    }

    /// Write the descriptor; completes with [`SessionEvent::DescriptorWritten`].
    fn write_descriptor(
        &mut self,
        _session: SessionId,
        _target: &ResolvedTarget,
        _value: &[u8],
    ) -> Result<()> {
        Err(Error::NotSupported {
            operation: "descriptor write".to_string(),
        })
    }
}
