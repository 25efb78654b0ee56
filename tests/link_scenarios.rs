//! End-to-end link scenarios through `LinkManager` with a scripted transport.

use biosensor_link::ble::characteristics::{GattCharacteristic, GattService, ResolvedTarget};
use biosensor_link::ble::uuids::{CCCD_UUID, SENSOR_CHARACTERISTIC_UUID, SENSOR_SERVICE_UUID};
use biosensor_link::{
    AddressCache, ConnectionState, DataPayload, DeviceIdentity, Event, EventQueue,
    FileAddressCache, LinkConfig, LinkEvent, LinkManager, LinkStatus, MemoryAddressCache,
    Result, SensorReading, SessionEvent, SessionId, SignalKind, TimerId, Transport,
};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

const ADDRESS: &str = "C8:FD:19:00:00:01";

#[derive(Debug, Default)]
struct Script {
    advertisements: Vec<DeviceIdentity>,
    bonded: Vec<DeviceIdentity>,
    refuse_connect: bool,
    services: Vec<GattService>,
    on_connected: Vec<SessionEvent>,
    on_descriptor: Vec<SessionEvent>,
    connects: Vec<String>,
}

/// Transport that completes every request immediately from a script.
struct ScriptedTransport {
    queue: EventQueue,
    script: Arc<Mutex<Script>>,
}

impl Transport for ScriptedTransport {
    fn check_ready(&self) -> Result<()> {
        Ok(())
    }

    fn start_scan(&mut self, _scan: TimerId) -> Result<()> {
        for device in self.script.lock().advertisements.clone() {
            self.queue.post(Event::Advertisement(device));
        }
        Ok(())
    }

    fn stop_scan(&mut self) {}

    fn bonded_devices(&self) -> Vec<DeviceIdentity> {
        self.script.lock().bonded.clone()
    }

    fn remote_device(&self, address: &str) -> Result<DeviceIdentity> {
        Ok(DeviceIdentity::from_address(address))
    }

    fn connect(&mut self, session: SessionId, device: &DeviceIdentity) -> Result<()> {
        let mut script = self.script.lock();
        script.connects.push(device.address.clone());
        if script.refuse_connect {
            self.queue.post_session(
                session,
                SessionEvent::ConnectFailed {
                    reason: "gatt status 133".to_string(),
                    retry: true,
                },
            );
            return Ok(());
        }
        self.queue.post_session(session, SessionEvent::Connected);
        for event in script.on_connected.clone() {
            self.queue.post_session(session, event);
        }
        Ok(())
    }

    fn close(&mut self, _session: SessionId) {}

    fn discover_services(&mut self, session: SessionId) -> Result<()> {
        let services = self.script.lock().services.clone();
        self.queue
            .post_session(session, SessionEvent::ServicesDiscovered(Ok(services)));
        Ok(())
    }

    fn enable_notifications(&mut self, _session: SessionId, _target: &ResolvedTarget) -> Result<()> {
        Ok(())
    }

    fn write_descriptor(
        &mut self,
        session: SessionId,
        _target: &ResolvedTarget,
        _value: &[u8],
    ) -> Result<()> {
        self.queue
            .post_session(session, SessionEvent::DescriptorWritten(Ok(())));
        for event in self.script.lock().on_descriptor.clone() {
            self.queue.post_session(session, event);
        }
        Ok(())
    }
}

fn sensor_services() -> Vec<GattService> {
    vec![GattService {
        uuid: SENSOR_SERVICE_UUID,
        characteristics: vec![GattCharacteristic {
            uuid: SENSOR_CHARACTERISTIC_UUID,
            descriptors: vec![CCCD_UUID],
        }],
    }]
}

fn start<C: AddressCache + 'static>(
    config: LinkConfig,
    cache: C,
    script: Script,
) -> (LinkManager, Arc<Mutex<Script>>) {
    let script = Arc::new(Mutex::new(script));
    let shared = script.clone();
    let manager = LinkManager::new(config, cache, move |queue| ScriptedTransport {
        queue,
        script: shared,
    })
    .unwrap();
    (manager, script)
}

async fn next(events: &mut broadcast::Receiver<LinkEvent>) -> LinkEvent {
    tokio::time::timeout(Duration::from_secs(60), events.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event channel closed")
}

async fn wait_for_state(manager: &LinkManager, state: ConnectionState) {
    manager
        .watch()
        .wait_for(|s| s.state == state)
        .await
        .expect("link task stopped");
}

#[tokio::test]
async fn gatt_sensor_scans_connects_and_streams() {
    let dir = tempfile::tempdir().unwrap();
    let cache_path = dir.path().join("cache.json");

    let script = Script {
        advertisements: vec![
            DeviceIdentity::named("Speaker", "00:11:22:33:44:55"),
            DeviceIdentity::named("Alchemy_TP", ADDRESS).with_service(SENSOR_SERVICE_UUID),
        ],
        services: sensor_services(),
        on_descriptor: vec![SessionEvent::Notification {
            characteristic: SENSOR_CHARACTERISTIC_UUID,
            value: b"36.8".to_vec(),
        }],
        ..Default::default()
    };
    let (manager, script) = start(
        LinkConfig::gatt_sensor(),
        FileAddressCache::new(&cache_path),
        script,
    );
    let mut events = manager.subscribe();

    manager.connect();
    assert_eq!(next(&mut events).await, LinkEvent::status(LinkStatus::Connecting));
    assert_eq!(next(&mut events).await, LinkEvent::status(LinkStatus::Connected));
    assert_eq!(
        next(&mut events).await,
        LinkEvent::DataReceived(DataPayload::Text {
            data: "36.8".to_string()
        })
    );

    wait_for_state(&manager, ConnectionState::Ready).await;
    assert!(manager.status().connected);
    assert!(manager.status().has_session);
    assert_eq!(script.lock().connects, vec![ADDRESS.to_string()]);
    assert_eq!(
        FileAddressCache::new(&cache_path).load().as_deref(),
        Some(ADDRESS)
    );

    // Already ready: re-emits CONNECTED and does nothing else.
    manager.connect();
    assert_eq!(next(&mut events).await, LinkEvent::status(LinkStatus::Connected));
    assert_eq!(script.lock().connects.len(), 1);

    manager.shutdown().await.unwrap();
    assert_eq!(
        next(&mut events).await,
        LinkEvent::status(LinkStatus::Disconnected)
    );
    assert!(!manager.status().has_session);
}

#[tokio::test]
async fn headset_connects_from_bonded_listing() {
    let attention = SensorReading::Signal {
        signal: SignalKind::Attention,
        value: 57,
    };
    let script = Script {
        bonded: vec![DeviceIdentity::named("Alchemy", ADDRESS)],
        on_connected: vec![SessionEvent::Reading(attention)],
        ..Default::default()
    };
    let (manager, _script) = start(LinkConfig::eeg_headset(), MemoryAddressCache::new(), script);

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let _handle = manager.on_event(move |event| {
        let _ = tx.send(event.clone());
    });

    manager.connect();
    let mut seen = Vec::new();
    while seen.len() < 3 {
        seen.push(rx.recv().await.unwrap());
    }
    assert_eq!(
        seen,
        vec![
            LinkEvent::status(LinkStatus::Connecting),
            LinkEvent::status(LinkStatus::Connected),
            LinkEvent::DataReceived(DataPayload::Reading(attention)),
        ]
    );
    assert_eq!(manager.state(), ConnectionState::Ready);
}

#[tokio::test(start_paused = true)]
async fn refused_connections_back_off_then_disconnect_cancels() {
    let script = Script {
        bonded: vec![DeviceIdentity::named("Alchemy", ADDRESS)],
        refuse_connect: true,
        ..Default::default()
    };
    let (manager, script) = start(LinkConfig::eeg_headset(), MemoryAddressCache::new(), script);
    let mut events = manager.subscribe();

    manager.connect();
    assert_eq!(next(&mut events).await, LinkEvent::status(LinkStatus::Connecting));
    assert!(matches!(next(&mut events).await, LinkEvent::Error { .. }));
    assert_eq!(
        next(&mut events).await,
        LinkEvent::status(LinkStatus::Disconnected)
    );

    let failed_at = tokio::time::Instant::now();
    assert_eq!(next(&mut events).await, LinkEvent::status(LinkStatus::Connecting));
    assert!(failed_at.elapsed() >= Duration::from_millis(2000));
    assert!(matches!(next(&mut events).await, LinkEvent::Error { .. }));
    assert_eq!(
        next(&mut events).await,
        LinkEvent::status(LinkStatus::Disconnected)
    );

    // Second retry waits for the doubled delay.
    let failed_at = tokio::time::Instant::now();
    assert_eq!(next(&mut events).await, LinkEvent::status(LinkStatus::Connecting));
    assert!(failed_at.elapsed() >= Duration::from_millis(4000));
    assert!(matches!(next(&mut events).await, LinkEvent::Error { .. }));
    assert_eq!(
        next(&mut events).await,
        LinkEvent::status(LinkStatus::Disconnected)
    );

    manager.disconnect();
    assert_eq!(
        next(&mut events).await,
        LinkEvent::status(LinkStatus::Disconnected)
    );
    wait_for_state(&manager, ConnectionState::Idle).await;
    let attempts = script.lock().connects.len();
    assert_eq!(attempts, 3);

    // No retry fires after an explicit disconnect.
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(script.lock().connects.len(), attempts);
    assert!(events.try_recv().is_err());
    assert_eq!(manager.snapshot().retry.attempt, 0);
}
