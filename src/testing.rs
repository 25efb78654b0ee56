//! In-memory fakes shared by the unit tests.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::ble::characteristics::ResolvedTarget;
use crate::ble::connection::SessionId;
use crate::ble::matcher::DeviceIdentity;
use crate::cache::AddressCache;
use crate::error::{Error, Result};
use crate::events::{EventSink, LinkEvent};
use crate::timer::{TimerId, Timers};
use crate::transport::Transport;

/// A request the supervisor made of the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    StartScan,
    StopScan,
    Connect(SessionId, String),
    Close(SessionId),
    DiscoverServices(SessionId),
    EnableNotifications(SessionId),
    WriteDescriptor(SessionId, Vec<u8>),
}

#[derive(Debug, Default)]
pub struct TransportState {
    pub calls: Vec<Call>,
    pub not_ready: bool,
    pub scan_fails: bool,
    pub scan_denied: bool,
    pub last_scan: Option<TimerId>,
    pub connect_fails: bool,
    pub connect_denied: bool,
    pub reject_addresses: bool,
    pub bonded: Vec<DeviceIdentity>,
}

/// Transport that records requests and completes nothing by itself.
#[derive(Debug, Clone, Default)]
pub struct FakeTransport {
    pub state: Arc<Mutex<TransportState>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    fn record(&self, call: Call) {
        self.state.lock().calls.push(call);
    }
}

impl Transport for FakeTransport {
    fn check_ready(&self) -> Result<()> {
        if self.state.lock().not_ready {
            Err(Error::BluetoothUnavailable)
        } else {
            Ok(())
        }
    }

    fn start_scan(&mut self, scan: TimerId) -> Result<()> {
        {
            let state = self.state.lock();
            if state.scan_denied {
                return Err(Error::PermissionDenied {
                    permission: "location".to_string(),
                });
            }
            if state.scan_fails {
                return Err(Error::NotSupported {
                    operation: "scan".to_string(),
                });
            }
        }
        self.state.lock().last_scan = Some(scan);
        self.record(Call::StartScan);
        Ok(())
    }

    fn stop_scan(&mut self) {
        self.record(Call::StopScan);
    }

    fn bonded_devices(&self) -> Vec<DeviceIdentity> {
        self.state.lock().bonded.clone()
    }

    fn remote_device(&self, address: &str) -> Result<DeviceIdentity> {
        if self.state.lock().reject_addresses {
            return Err(Error::InvalidAddress {
                address: address.to_string(),
            });
        }
        Ok(DeviceIdentity::from_address(address))
    }

    fn connect(&mut self, session: SessionId, device: &DeviceIdentity) -> Result<()> {
        if self.state.lock().connect_denied {
            return Err(Error::PermissionDenied {
                permission: "bluetooth connect".to_string(),
            });
        }
        if self.state.lock().connect_fails {
            return Err(Error::ConnectionFailed {
                reason: "radio busy".to_string(),
            });
        }
        self.record(Call::Connect(session, device.address.clone()));
        Ok(())
    }

    fn close(&mut self, session: SessionId) {
        self.record(Call::Close(session));
    }

    fn discover_services(&mut self, session: SessionId) -> Result<()> {
        self.record(Call::DiscoverServices(session));
        Ok(())
    }

    fn enable_notifications(&mut self, session: SessionId, _target: &ResolvedTarget) -> Result<()> {
        self.record(Call::EnableNotifications(session));
        Ok(())
    }

    fn write_descriptor(
        &mut self,
        session: SessionId,
        _target: &ResolvedTarget,
        value: &[u8],
    ) -> Result<()> {
        self.record(Call::WriteDescriptor(session, value.to_vec()));
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct TimerState {
    next: u64,
    pub pending: BTreeMap<TimerId, Duration>,
    pub scheduled: Vec<(TimerId, Duration)>,
}

/// Timers that only fire when a test fires them.
#[derive(Debug, Clone, Default)]
pub struct FakeTimers {
    pub state: Arc<Mutex<TimerState>>,
}

impl FakeTimers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self) -> Vec<(TimerId, Duration)> {
        self.state
            .lock()
            .pending
            .iter()
            .map(|(id, d)| (*id, *d))
            .collect()
    }

    /// The pending timer with the given delay, if exactly one exists.
    pub fn pending_with(&self, delay: Duration) -> Option<TimerId> {
        let matching: Vec<_> = self
            .pending()
            .into_iter()
            .filter(|(_, d)| *d == delay)
            .collect();
        match matching.as_slice() {
            [(id, _)] => Some(*id),
            _ => None,
        }
    }

    /// Remove a timer from the pending set, as if it had fired.
    pub fn fire(&self, id: TimerId) -> TimerId {
        self.state.lock().pending.remove(&id);
        id
    }
}

impl Timers for FakeTimers {
    fn schedule(&mut self, delay: Duration) -> TimerId {
        let mut state = self.state.lock();
        state.next += 1;
        let id = TimerId(state.next);
        state.pending.insert(id, delay);
        state.scheduled.push((id, delay));
        id
    }

    fn cancel(&mut self, id: TimerId) {
        self.state.lock().pending.remove(&id);
    }
}

/// Sink that keeps every event.
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    pub events: Arc<Mutex<Vec<LinkEvent>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> Vec<LinkEvent> {
        std::mem::take(&mut *self.events.lock())
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: LinkEvent) {
        self.events.lock().push(event);
    }
}

/// Address cache whose contents and writes stay visible to the test.
#[derive(Debug, Clone, Default)]
pub struct SharedCache {
    pub address: Arc<Mutex<Option<String>>>,
    pub writes: Arc<Mutex<Vec<String>>>,
}

impl SharedCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_address(address: &str) -> Self {
        let cache = Self::default();
        *cache.address.lock() = Some(address.to_string());
        cache
    }

    pub fn current(&self) -> Option<String> {
        self.address.lock().clone()
    }

    pub fn writes(&self) -> Vec<String> {
        self.writes.lock().clone()
    }
}

impl AddressCache for SharedCache {
    fn load(&self) -> Option<String> {
        self.address.lock().clone().filter(|a| !a.is_empty())
    }

    fn save(&mut self, address: &str) -> Result<()> {
        *self.address.lock() = Some(address.to_string());
        self.writes.lock().push(address.to_string());
        Ok(())
    }

    fn clear(&mut self) -> Result<()> {
        *self.address.lock() = None;
        Ok(())
    }
}
