//! The connection supervisor.
//!
//! [`ConnectionSupervisor`] is the single owner of the link's mutable state:
//! the current [`ConnectionState`], the live [`Session`], and the scan,
//! connect and retry timers. Everything that happens on the platform side
//! reaches it as an [`Event`] through [`ConnectionSupervisor::handle`], so it
//! needs no locking. Its only side effects are transport requests, timer
//! scheduling, address cache writes and [`LinkEvent`] emissions.

use tracing::{debug, info, trace, warn};

use crate::ble::characteristics::ServiceResolver;
use crate::ble::connection::{ConnectionState, ConnectionStatus, Connector, Session, SessionId};
use crate::ble::matcher::{find_bonded, DeviceIdentity};
use crate::ble::scanner::Scanner;
use crate::ble::uuids::matches_short;
use crate::cache::AddressCache;
use crate::config::{LinkConfig, TargetSpec};
use crate::error::{Error, Result};
use crate::events::{DataPayload, EventSink, LinkEvent, LinkStatus};
use crate::retry::{RetryOutcome, RetryScheduler, RetryState};
use crate::timer::{TimerId, Timers};
use crate::transport::{Event, SessionEvent, Transport};

/// Point-in-time view of the supervisor, published by the link task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkSnapshot {
    /// Current lifecycle state.
    pub state: ConnectionState,
    /// Connected / has-session flags.
    pub status: ConnectionStatus,
    /// Retry bookkeeping.
    pub retry: RetryState,
}

/// State machine supervising one peripheral link.
pub struct ConnectionSupervisor {
    target: TargetSpec,
    state: ConnectionState,
    session: Option<Session>,
    scanner: Scanner,
    connector: Connector,
    resolver: Option<ServiceResolver>,
    retry: RetryScheduler,
    transport: Box<dyn Transport>,
    timers: Box<dyn Timers>,
    cache: Box<dyn AddressCache>,
    sink: Box<dyn EventSink>,
}

impl ConnectionSupervisor {
    /// Create an idle supervisor.
    pub fn new(
        config: LinkConfig,
        transport: Box<dyn Transport>,
        timers: Box<dyn Timers>,
        cache: Box<dyn AddressCache>,
        sink: Box<dyn EventSink>,
    ) -> Self {
        let resolver = config.target.gatt.map(ServiceResolver::new);
        Self {
            target: config.target,
            state: ConnectionState::Idle,
            session: None,
            scanner: Scanner::new(config.scan_timeout),
            connector: Connector::new(config.connect_timeout),
            resolver,
            retry: RetryScheduler::new(config.retry),
            transport,
            timers,
            cache,
            sink,
        }
    }

    /// Start connecting to the target.
    ///
    /// Re-emits `CONNECTED` when already ready and leaves an attempt that is
    /// in progress alone. Otherwise starts a fresh attempt with a fresh retry
    /// budget. Failures are reported as events, never returned.
    pub fn connect(&mut self) {
        if self.state == ConnectionState::Ready {
            debug!("Already connected, re-emitting state");
            self.emit_status(LinkStatus::Connected);
            return;
        }

        if self.state.is_transitioning() {
            debug!("Connection attempt already in progress ({})", self.state);
            return;
        }

        self.retry.reset(self.timers.as_mut());
        self.begin_attempt();
    }

    /// Tear everything down and go idle.
    ///
    /// Releases the session, cancels every timer and resets the retry budget.
    pub fn disconnect(&mut self) {
        info!("Disconnecting");
        self.teardown();
        self.retry.reset(self.timers.as_mut());
        self.set_state(ConnectionState::Idle);
        self.emit_status(LinkStatus::Disconnected);
    }

    /// Connection flags for the current state.
    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus {
            connected: self.state.is_connected(),
            has_session: self.session.is_some(),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Current retry bookkeeping.
    pub fn retry_state(&self) -> RetryState {
        self.retry.state()
    }

    /// Id of the live session, if any.
    pub fn session_id(&self) -> Option<SessionId> {
        self.session.as_ref().map(|s| s.id)
    }

    /// Everything observers need in one value.
    pub fn snapshot(&self) -> LinkSnapshot {
        LinkSnapshot {
            state: self.state,
            status: self.status(),
            retry: self.retry.state(),
        }
    }

    /// Process one queued event.
    pub fn handle(&mut self, event: Event) {
        match event {
            Event::Advertisement(device) => self.on_advertisement(device),
            Event::ScanFailed {
                scan,
                reason,
                precondition,
            } => self.on_scan_failed(scan, reason, precondition),
            Event::Timer(id) => self.on_timer(id),
            Event::Session { session, event } => {
                if self.session_id() != Some(session) {
                    debug!("Dropping {:?} from stale {}", event, session);
                    return;
                }
                self.on_session_event(session, event);
            }
        }
    }

    fn begin_attempt(&mut self) {
        if let Err(e) = self.transport.check_ready() {
            warn!("Cannot connect: {}", e);
            self.emit_error(e.to_string());
            self.set_state(ConnectionState::Error);
            return;
        }

        self.emit_status(LinkStatus::Connecting);

        if self.connect_cached() {
            return;
        }
        self.discover();
    }

    /// Try the cached address. Returns `false` if there is none or it was
    /// rejected, in which case the cache has been cleared. A precondition
    /// failure is reported here and leaves the cache alone.
    fn connect_cached(&mut self) -> bool {
        let Some(address) = self.cache.load() else {
            return false;
        };

        info!("Connecting to cached address {}", address);
        let attempt = self
            .transport
            .remote_device(&address)
            .and_then(|device| self.connect_to(device, true));

        match attempt {
            Ok(()) => true,
            Err(e) if e.is_precondition() => {
                self.precondition_lost(e.to_string());
                true
            }
            Err(e) => {
                warn!("Cached address {} failed: {}", address, e);
                self.forget_cached_address();
                false
            }
        }
    }

    /// Bonded listing first, then a timed scan.
    fn discover(&mut self) {
        let bonded = self.transport.bonded_devices();
        if let Some((device, reason)) = find_bonded(&bonded, &self.target) {
            info!("Found bonded device {} ({:?})", device, reason);
            if let Err(e) = self.connect_to(device.clone(), false) {
                self.attempt_failed(e);
            }
            return;
        }

        self.set_state(ConnectionState::Scanning);
        if let Err(e) = self
            .scanner
            .start(self.transport.as_mut(), self.timers.as_mut())
        {
            if e.is_precondition() {
                self.precondition_lost(format!("Failed to start scan: {}", e));
                return;
            }
            let message = match e {
                Error::NotSupported { .. } => {
                    format!("No paired device named {} found", self.target.exact_name)
                }
                e => format!("Failed to start scan: {}", e),
            };
            self.discovery_failed(message);
        }
    }

    fn connect_to(&mut self, device: DeviceIdentity, via_cache: bool) -> Result<()> {
        self.scanner
            .stop(self.transport.as_mut(), self.timers.as_mut());
        self.set_state(ConnectionState::Connecting);
        self.connector.connect_to(
            &mut self.session,
            device,
            via_cache,
            self.transport.as_mut(),
            self.timers.as_mut(),
        )?;
        Ok(())
    }

    fn on_advertisement(&mut self, device: DeviceIdentity) {
        if self.state != ConnectionState::Scanning {
            trace!("Ignoring advertisement from {} in {}", device, self.state);
            return;
        }

        if let Some(reason) = self.scanner.observe(&device, &self.target) {
            info!("Found target {} ({:?})", device, reason);
            if let Err(e) = self.connect_to(device, false) {
                self.attempt_failed(e);
            }
        }
    }

    fn on_scan_failed(&mut self, scan: TimerId, reason: String, precondition: bool) {
        if !self.scanner.is_current(scan) {
            debug!("Ignoring failure of stale scan {}: {}", scan, reason);
            return;
        }
        if precondition {
            self.precondition_lost(format!("Scan failed: {}", reason));
            return;
        }
        self.discovery_failed(format!("Scan failed: {}", reason));
    }

    fn on_timer(&mut self, id: TimerId) {
        if self.scanner.take_timeout(id) {
            self.discovery_failed("No matching device found before scan timeout".to_string());
        } else if self.connector.take_timeout(id) {
            self.connection_failed("Connection timed out".to_string());
        } else if self.retry.take_fired(id) {
            info!("Retrying connection (attempt {})", self.retry.state().attempt);
            self.begin_attempt();
        } else {
            debug!("Ignoring stale {}", id);
        }
    }

    fn on_session_event(&mut self, session: SessionId, event: SessionEvent) {
        match event {
            SessionEvent::Connected => self.on_connected(session),
            SessionEvent::ConnectFailed { reason, retry } => {
                self.on_connect_failed(reason, retry)
            }
            SessionEvent::Disconnected { reason } => self.on_disconnected(reason),
            SessionEvent::ServicesDiscovered(result) => {
                if self.state != ConnectionState::ResolvingServices {
                    debug!("Ignoring service discovery result in {}", self.state);
                    return;
                }
                let outcome = match self.resolver.as_mut() {
                    Some(resolver) => resolver.on_services(session, result, self.transport.as_mut()),
                    None => Ok(()),
                };
                if let Err(e) = outcome {
                    self.resolution_failed(e);
                }
            }
            SessionEvent::DescriptorWritten(result) => {
                if self.state != ConnectionState::ResolvingServices {
                    debug!("Ignoring descriptor write result in {}", self.state);
                    return;
                }
                let Some(resolver) = self.resolver.as_mut() else {
                    return;
                };
                match resolver.on_descriptor_written(result) {
                    Ok(_) => {
                        info!("Link ready ({})", session);
                        self.set_state(ConnectionState::Ready);
                    }
                    Err(e) => self.resolution_failed(e),
                }
            }
            SessionEvent::Notification {
                characteristic,
                value,
            } => {
                if !self.state.is_connected() {
                    trace!("Ignoring notification in {}", self.state);
                    return;
                }
                if let Some(gatt) = &self.target.gatt {
                    if !matches_short(&characteristic, gatt.characteristic) {
                        trace!("Ignoring notification from {}", characteristic);
                        return;
                    }
                }
                let data = String::from_utf8_lossy(&value).into_owned();
                self.sink
                    .emit(LinkEvent::DataReceived(DataPayload::Text { data }));
            }
            SessionEvent::Reading(reading) => {
                if !self.state.is_connected() {
                    trace!("Ignoring reading in {}", self.state);
                    return;
                }
                self.sink
                    .emit(LinkEvent::DataReceived(DataPayload::Reading(reading)));
            }
        }
    }

    fn on_connected(&mut self, session: SessionId) {
        if self.state != ConnectionState::Connecting {
            debug!("Ignoring duplicate connected event in {}", self.state);
            return;
        }

        self.connector.settle(self.timers.as_mut());
        self.set_state(ConnectionState::Connected);

        if let Some(current) = &self.session {
            if let Err(e) = self.cache.save(&current.device.address) {
                warn!("Failed to cache address {}: {}", current.device.address, e);
            }
        }
        self.retry.reset(self.timers.as_mut());
        self.emit_status(LinkStatus::Connected);

        if self.resolver.is_none() {
            info!("Link ready ({})", session);
            self.set_state(ConnectionState::Ready);
            return;
        }

        self.set_state(ConnectionState::ResolvingServices);
        let outcome = match self.resolver.as_mut() {
            Some(resolver) => resolver.begin(session, self.transport.as_mut()),
            None => Ok(()),
        };
        if let Err(e) = outcome {
            self.resolution_failed(e);
        }
    }

    fn on_connect_failed(&mut self, reason: String, retry: bool) {
        let via_cache = self.session.as_ref().is_some_and(|s| s.via_cache);

        if !retry {
            warn!("Connection rejected, not retrying: {}", reason);
            self.teardown();
            self.emit_error(reason);
            self.set_state(ConnectionState::Error);
            self.emit_status(LinkStatus::Disconnected);
            return;
        }

        if via_cache && self.state == ConnectionState::Connecting {
            warn!("Cached device rejected the connection: {}", reason);
            self.teardown();
            self.forget_cached_address();
            self.discover();
            return;
        }

        self.connection_failed(reason);
    }

    fn on_disconnected(&mut self, reason: Option<String>) {
        let reason = reason.unwrap_or_else(|| "Device disconnected".to_string());

        if self.state != ConnectionState::Ready {
            self.connection_failed(reason);
            return;
        }

        info!("Unexpected disconnect: {}", reason);
        self.teardown();
        self.set_state(ConnectionState::Disconnected);
        self.emit_status(LinkStatus::Disconnected);
        self.schedule_retry();
    }

    fn discovery_failed(&mut self, message: String) {
        warn!("{}", message);
        self.scanner
            .stop(self.transport.as_mut(), self.timers.as_mut());
        self.emit_error(message);
        self.set_state(ConnectionState::Idle);
        self.schedule_retry();
    }

    fn connection_failed(&mut self, reason: String) {
        warn!("Connection failed: {}", reason);
        self.teardown();
        self.emit_error(reason);
        self.set_state(ConnectionState::Disconnected);
        self.emit_status(LinkStatus::Disconnected);
        self.schedule_retry();
    }

    fn attempt_failed(&mut self, error: Error) {
        if error.is_precondition() {
            self.precondition_lost(error.to_string());
        } else {
            self.connection_failed(error.to_string());
        }
    }

    /// Bluetooth became unusable mid-attempt. Reported once and never
    /// retried; the caller has to `connect()` again after remediation.
    fn precondition_lost(&mut self, message: String) {
        warn!("Cannot continue: {}", message);
        self.teardown();
        self.emit_error(message);
        self.set_state(ConnectionState::Error);
        self.emit_status(LinkStatus::Disconnected);
    }

    fn resolution_failed(&mut self, error: Error) {
        warn!("Service resolution failed (non-fatal): {}", error);
        self.connection_failed(error.to_string());
    }

    fn schedule_retry(&mut self) {
        match self.retry.schedule(self.timers.as_mut()) {
            RetryOutcome::Scheduled { attempt, delay } => {
                debug!("Retry {} in {:?}", attempt, delay);
            }
            RetryOutcome::AlreadyPending => {}
            RetryOutcome::Exhausted => {
                let attempts = self.retry.state().max_attempts;
                self.emit_error(format!(
                    "Giving up after {} reconnection attempts",
                    attempts
                ));
                self.set_state(ConnectionState::Idle);
            }
        }
    }

    fn teardown(&mut self) {
        self.scanner
            .stop(self.transport.as_mut(), self.timers.as_mut());
        self.connector.release(
            &mut self.session,
            self.transport.as_mut(),
            self.timers.as_mut(),
        );
        if let Some(resolver) = self.resolver.as_mut() {
            resolver.reset();
        }
    }

    fn forget_cached_address(&mut self) {
        if let Err(e) = self.cache.clear() {
            warn!("Failed to clear cached address: {}", e);
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            debug!("State: {} -> {}", self.state, state);
            self.state = state;
        }
    }

    fn emit_status(&self, status: LinkStatus) {
        self.sink.emit(LinkEvent::status(status));
    }

    fn emit_error(&self, error: String) {
        self.sink.emit(LinkEvent::error(error));
    }
}

impl std::fmt::Debug for ConnectionSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSupervisor")
            .field("target", &self.target)
            .field("state", &self.state)
            .field("session", &self.session)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}
