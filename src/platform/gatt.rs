//! GATT transport backed by btleplug.
//!
//! Every [`Transport`] request spawns a short tokio task against the
//! adapter or peripheral and posts the outcome to the [`EventQueue`]. An
//! adapter event pump runs for the lifetime of the transport, forwarding
//! advertisements while scanning and reporting link loss.
//!
//! Devices are keyed by their Bluetooth address where the platform exposes
//! one (BlueZ, WinRT, Android) and by the platform peripheral id otherwise
//! (CoreBluetooth reports an all-zero address). A cached key that the adapter
//! has not seen since start-up is looked up with a short scan before the
//! attempt is reported as failed.

use btleplug::api::{
    BDAddr, Central, CentralEvent, CentralState, Characteristic, Manager as _, Peripheral as _,
    ScanFilter,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::stream::StreamExt;
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::fmt::Display;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::ble::characteristics::{GattCharacteristic, GattService, ResolvedTarget};
use crate::ble::connection::SessionId;
use crate::ble::matcher::DeviceIdentity;
use crate::ble::uuids::{matches_short, CCCD_SHORT, ENABLE_NOTIFICATION_VALUE};
use crate::error::{Error, Result};
use crate::timer::TimerId;
use crate::transport::{Event, EventQueue, SessionEvent, Transport};

/// How long a connect attempt scans for a cached device the adapter has not
/// seen yet.
pub const LOOKUP_WINDOW: Duration = Duration::from_secs(5);

/// Get the first Bluetooth adapter of the system.
///
/// # Errors
///
/// Returns an error if Bluetooth is not available.
pub async fn default_adapter() -> Result<Adapter> {
    let manager = Manager::new().await.map_err(|e| match Error::bluetooth(e) {
        denied @ Error::PermissionDenied { .. } => denied,
        _ => Error::BluetoothUnavailable,
    })?;

    let adapters = manager.adapters().await.map_err(Error::bluetooth)?;

    let adapter = adapters
        .into_iter()
        .next()
        .ok_or(Error::BluetoothUnavailable)?;

    info!(
        "Using Bluetooth adapter: {:?}",
        adapter.adapter_info().await.ok()
    );

    Ok(adapter)
}

/// State shared between the transport and its tasks.
#[derive(Debug)]
struct Shared {
    powered: RwLock<bool>,
    permission_denied: RwLock<bool>,
    scanning: RwLock<bool>,
    peripherals: RwLock<HashMap<SessionId, Peripheral>>,
}

/// [`Transport`] for GATT peripherals reachable through a btleplug adapter.
pub struct BtleplugTransport {
    adapter: Adapter,
    queue: EventQueue,
    shared: Arc<Shared>,
    pump: JoinHandle<()>,
    tasks: HashMap<SessionId, Vec<JoinHandle<()>>>,
}

impl BtleplugTransport {
    /// Create a transport on `adapter` posting to `queue`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(adapter: Adapter, queue: EventQueue) -> Self {
        let shared = Arc::new(Shared {
            powered: RwLock::new(true),
            permission_denied: RwLock::new(false),
            scanning: RwLock::new(false),
            peripherals: RwLock::new(HashMap::new()),
        });

        let pump = tokio::spawn(Self::pump_events(
            adapter.clone(),
            queue.clone(),
            shared.clone(),
        ));

        Self {
            adapter,
            queue,
            shared,
            pump,
            tasks: HashMap::new(),
        }
    }

    /// Get the underlying adapter.
    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    async fn pump_events(adapter: Adapter, queue: EventQueue, shared: Arc<Shared>) {
        let mut events = match adapter.events().await {
            Ok(events) => events,
            Err(e) => {
                error!("Failed to get adapter events: {}", e);
                if matches!(e, btleplug::Error::PermissionDenied) {
                    *shared.permission_denied.write() = true;
                }
                return;
            }
        };

        while let Some(event) = events.next().await {
            match event {
                CentralEvent::DeviceDiscovered(id)
                | CentralEvent::DeviceUpdated(id)
                | CentralEvent::ServicesAdvertisement { id, .. } => {
                    if *shared.scanning.read() {
                        Self::forward_advertisement(&adapter, &queue, &id).await;
                    }
                }
                CentralEvent::DeviceDisconnected(id) => {
                    let session = shared
                        .peripherals
                        .read()
                        .iter()
                        .find(|(_, p)| p.id() == id)
                        .map(|(session, _)| *session);
                    if let Some(session) = session {
                        debug!("Peripheral of {} disconnected", session);
                        queue.post_session(session, SessionEvent::Disconnected { reason: None });
                    }
                }
                CentralEvent::StateUpdate(state) => {
                    debug!("Adapter state: {:?}", state);
                    *shared.powered.write() = matches!(state, CentralState::PoweredOn);
                }
                _ => {}
            }
        }

        debug!("Adapter event stream ended");
    }

    async fn forward_advertisement(adapter: &Adapter, queue: &EventQueue, id: &PeripheralId) {
        let peripheral = match adapter.peripheral(id).await {
            Ok(p) => p,
            Err(e) => {
                trace!("Failed to get peripheral: {}", e);
                return;
            }
        };

        let properties = match peripheral.properties().await {
            Ok(Some(p)) => p,
            _ => return,
        };

        queue.post(Event::Advertisement(DeviceIdentity {
            name: properties.local_name,
            address: device_key(properties.address, id),
            advertised_services: properties.services.into_iter().collect(),
        }));
    }

    fn peripheral(&self, session: SessionId) -> Result<Peripheral> {
        self.shared
            .peripherals
            .read()
            .get(&session)
            .cloned()
            .ok_or_else(|| Error::ConnectionFailed {
                reason: format!("{} has no connected peripheral", session),
            })
    }

    fn track(&mut self, session: SessionId, task: JoinHandle<()>) {
        let tasks = self.tasks.entry(session).or_default();
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }
}

/// Stable key of a peripheral: its address, or the platform id where the
/// platform hides addresses.
fn device_key(address: BDAddr, id: &impl Display) -> String {
    if address == BDAddr::default() {
        id.to_string()
    } else {
        address.to_string()
    }
}

/// Normalize a cached key. Accepts a Bluetooth address or a CoreBluetooth
/// peripheral UUID.
fn parse_key(text: &str) -> Result<String> {
    if let Ok(address) = BDAddr::from_str(text) {
        return Ok(address.to_string());
    }
    if let Ok(id) = Uuid::parse_str(text) {
        return Ok(id.to_string());
    }
    Err(Error::InvalidAddress {
        address: text.to_string(),
    })
}

fn same_key(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

/// Find the peripheral for `key`, scanning briefly if the adapter does not
/// know it yet.
async fn locate(
    adapter: &Adapter,
    key: &str,
) -> std::result::Result<Option<Peripheral>, btleplug::Error> {
    let known = adapter
        .peripherals()
        .await?
        .into_iter()
        .find(|p| same_key(&device_key(p.address(), &p.id()), key));
    if known.is_some() {
        return Ok(known);
    }

    debug!("{} not known yet, scanning for up to {:?}", key, LOOKUP_WINDOW);
    let mut events = adapter.events().await?;
    adapter.start_scan(ScanFilter::default()).await?;

    let search = async {
        while let Some(event) = events.next().await {
            if let CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) = event {
                let Ok(peripheral) = adapter.peripheral(&id).await else {
                    continue;
                };
                if same_key(&device_key(peripheral.address(), &id), key) {
                    return Some(peripheral);
                }
            }
        }
        None
    };
    let found = tokio::time::timeout(LOOKUP_WINDOW, search)
        .await
        .ok()
        .flatten();

    if let Err(e) = adapter.stop_scan().await {
        debug!("Failed to stop lookup scan: {}", e);
    }
    Ok(found)
}

/// Report a failed connect. Permission refusals are not retried.
fn post_connect_failed(queue: &EventQueue, shared: &Shared, session: SessionId, e: btleplug::Error) {
    let error = Error::bluetooth(e);
    let precondition = error.is_precondition();
    if precondition {
        *shared.permission_denied.write() = true;
    }
    queue.post_session(
        session,
        SessionEvent::ConnectFailed {
            reason: error.to_string(),
            retry: !precondition,
        },
    );
}

fn to_services(peripheral: &Peripheral) -> Vec<GattService> {
    let mut services: Vec<GattService> = peripheral
        .services()
        .into_iter()
        .map(|service| GattService {
            uuid: service.uuid,
            characteristics: service
                .characteristics
                .into_iter()
                .map(|c| GattCharacteristic {
                    uuid: c.uuid,
                    descriptors: c.descriptors.into_iter().map(|d| d.uuid).collect(),
                })
                .collect(),
        })
        .collect();
    services.sort_by_key(|s| s.uuid);
    services
}

fn find_characteristic(peripheral: &Peripheral, target: &ResolvedTarget) -> Option<Characteristic> {
    let characteristics: BTreeSet<Characteristic> = peripheral.characteristics();
    characteristics
        .into_iter()
        .find(|c| c.service_uuid == target.service && c.uuid == target.characteristic)
}

async fn write_enable_descriptor(
    peripheral: &Peripheral,
    target: &ResolvedTarget,
    value: &[u8],
) -> std::result::Result<(), String> {
    let characteristic = find_characteristic(peripheral, target)
        .ok_or_else(|| format!("characteristic {} vanished", target.characteristic))?;

    if matches_short(&target.descriptor, CCCD_SHORT) && value == ENABLE_NOTIFICATION_VALUE {
        // The platform owns the CCCD; subscribing writes it.
        return peripheral
            .subscribe(&characteristic)
            .await
            .map_err(|e| e.to_string());
    }

    let descriptor = characteristic
        .descriptors
        .iter()
        .find(|d| d.uuid == target.descriptor)
        .ok_or_else(|| format!("descriptor {} vanished", target.descriptor))?;

    peripheral
        .write_descriptor(descriptor, value)
        .await
        .map_err(|e| e.to_string())
}

impl Transport for BtleplugTransport {
    fn check_ready(&self) -> Result<()> {
        // Reported once; the next attempt finds out afresh.
        if std::mem::take(&mut *self.shared.permission_denied.write()) {
            return Err(Error::PermissionDenied {
                permission: "bluetooth".to_string(),
            });
        }
        if *self.shared.powered.read() {
            Ok(())
        } else {
            Err(Error::BluetoothUnavailable)
        }
    }

    fn start_scan(&mut self, scan: TimerId) -> Result<()> {
        if self.pump.is_finished() {
            return Err(Error::BluetoothUnavailable);
        }

        *self.shared.scanning.write() = true;

        let adapter = self.adapter.clone();
        let queue = self.queue.clone();
        tokio::spawn(async move {
            if let Err(e) = adapter.start_scan(ScanFilter::default()).await {
                warn!("Failed to start scan: {}", e);
                let error = Error::bluetooth(e);
                queue.post(Event::ScanFailed {
                    scan,
                    precondition: error.is_precondition(),
                    reason: error.to_string(),
                });
            }
        });
        Ok(())
    }

    fn stop_scan(&mut self) {
        if !std::mem::replace(&mut *self.shared.scanning.write(), false) {
            return;
        }

        let adapter = self.adapter.clone();
        tokio::spawn(async move {
            if let Err(e) = adapter.stop_scan().await {
                debug!("Failed to stop scan: {}", e);
            }
        });
    }

    fn bonded_devices(&self) -> Vec<DeviceIdentity> {
        // btleplug does not expose the bond list.
        Vec::new()
    }

    fn remote_device(&self, address: &str) -> Result<DeviceIdentity> {
        Ok(DeviceIdentity::from_address(parse_key(address)?))
    }

    fn connect(&mut self, session: SessionId, device: &DeviceIdentity) -> Result<()> {
        let key = parse_key(&device.address)?;

        let adapter = self.adapter.clone();
        let queue = self.queue.clone();
        let shared = self.shared.clone();

        let task = tokio::spawn(async move {
            let peripheral = match locate(&adapter, &key).await {
                Ok(Some(p)) => p,
                Ok(None) => {
                    queue.post_session(
                        session,
                        SessionEvent::ConnectFailed {
                            reason: format!("Device {} not found", key),
                            retry: true,
                        },
                    );
                    return;
                }
                Err(e) => {
                    post_connect_failed(&queue, &shared, session, e);
                    return;
                }
            };

            match peripheral.connect().await {
                Ok(()) => {
                    info!("Successfully connected to {}", key);
                    shared.peripherals.write().insert(session, peripheral);
                    queue.post_session(session, SessionEvent::Connected);
                }
                Err(e) => {
                    warn!("Connection to {} failed: {}", key, e);
                    post_connect_failed(&queue, &shared, session, e);
                }
            }
        });

        self.track(session, task);
        Ok(())
    }

    fn close(&mut self, session: SessionId) {
        for task in self.tasks.remove(&session).unwrap_or_default() {
            task.abort();
        }

        let Some(peripheral) = self.shared.peripherals.write().remove(&session) else {
            return;
        };

        tokio::spawn(async move {
            if let Err(e) = peripheral.disconnect().await {
                debug!("Failed to disconnect: {}", e);
            }
        });
    }

    fn discover_services(&mut self, session: SessionId) -> Result<()> {
        let peripheral = self.peripheral(session)?;
        let queue = self.queue.clone();

        let task = tokio::spawn(async move {
            let result = match peripheral.discover_services().await {
                Ok(()) => Ok(to_services(&peripheral)),
                Err(e) => Err(e.to_string()),
            };
            queue.post_session(session, SessionEvent::ServicesDiscovered(result));
        });

        self.track(session, task);
        Ok(())
    }

    fn enable_notifications(&mut self, session: SessionId, target: &ResolvedTarget) -> Result<()> {
        let peripheral = self.peripheral(session)?;
        let queue = self.queue.clone();
        let characteristic = target.characteristic;

        let task = tokio::spawn(async move {
            let mut notifications = match peripheral.notifications().await {
                Ok(stream) => stream,
                Err(e) => {
                    error!("Failed to get notifications stream: {}", e);
                    queue.post_session(
                        session,
                        SessionEvent::Disconnected {
                            reason: Some(format!("notification stream unavailable: {}", e)),
                        },
                    );
                    return;
                }
            };

            debug!("Listening for notifications from {}", characteristic);
            while let Some(notification) = notifications.next().await {
                queue.post_session(
                    session,
                    SessionEvent::Notification {
                        characteristic: notification.uuid,
                        value: notification.value,
                    },
                );
            }
            debug!("Notification stream of {} ended", session);
        });

        self.track(session, task);
        Ok(())
    }

    fn write_descriptor(
        &mut self,
        session: SessionId,
        target: &ResolvedTarget,
        value: &[u8],
    ) -> Result<()> {
        let peripheral = self.peripheral(session)?;
        let queue = self.queue.clone();
        let target = *target;
        let value = value.to_vec();

        let task = tokio::spawn(async move {
            let result = write_enable_descriptor(&peripheral, &target, &value).await;
            queue.post_session(session, SessionEvent::DescriptorWritten(result));
        });

        self.track(session, task);
        Ok(())
    }
}

impl Drop for BtleplugTransport {
    fn drop(&mut self) {
        self.pump.abort();
        for task in self.tasks.drain().flat_map(|(_, tasks)| tasks) {
            task.abort();
        }
    }
}
