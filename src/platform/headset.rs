//! Transport for the EEG headset family.
//!
//! The headset performs its own connection handshake and then streams
//! ThinkGear packets. How the byte stream is obtained (RFCOMM socket,
//! serial port, vendor bridge) is left to a [`StreamOpener`]; this
//! transport only opens it, parses it and reports liveness.

use async_trait::async_trait;
use btleplug::api::BDAddr;
use std::collections::HashMap;
use std::io;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::ble::connection::SessionId;
use crate::ble::matcher::DeviceIdentity;
use crate::error::{Error, Result};
use crate::protocol::thinkgear::PacketParser;
use crate::timer::TimerId;
use crate::transport::{EventQueue, SessionEvent, Transport};

/// Default time without any bytes before the link is considered lost.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(5);

const READ_BUFFER_SIZE: usize = 512;

/// Byte stream delivered by a [`StreamOpener`].
pub type SensorStream = Box<dyn AsyncRead + Send + Unpin>;

/// Capability that reaches a bonded headset.
///
/// `open` fails with [`io::ErrorKind::PermissionDenied`] when the device is
/// known but not paired; that failure is not retried.
#[async_trait]
pub trait StreamOpener: Send + Sync + 'static {
    /// Devices bonded with this host.
    fn bonded_devices(&self) -> Vec<DeviceIdentity>;

    /// Open the data stream of the device at `address`.
    async fn open(&self, address: &str) -> io::Result<SensorStream>;
}

/// [`Transport`] supervising a ThinkGear headset.
pub struct ThinkGearTransport<O> {
    opener: Arc<O>,
    queue: EventQueue,
    idle_timeout: Duration,
    sessions: HashMap<SessionId, JoinHandle<()>>,
}

impl<O: StreamOpener> ThinkGearTransport<O> {
    /// Create a transport using `opener`, posting to `queue`.
    pub fn new(opener: O, queue: EventQueue) -> Self {
        Self {
            opener: Arc::new(opener),
            queue,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            sessions: HashMap::new(),
        }
    }

    /// Set how long the stream may stay silent before reporting a disconnect.
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }
}

async fn run_session(
    mut stream: SensorStream,
    session: SessionId,
    queue: EventQueue,
    idle_timeout: Duration,
) {
    let mut parser = PacketParser::new();
    let mut buffer = [0u8; READ_BUFFER_SIZE];

    let reason = loop {
        match tokio::time::timeout(idle_timeout, stream.read(&mut buffer)).await {
            Ok(Ok(0)) => break "stream closed".to_string(),
            Ok(Ok(n)) => {
                for reading in parser.feed_readings(&buffer[..n]) {
                    queue.post_session(session, SessionEvent::Reading(reading));
                }
            }
            Ok(Err(e)) => break format!("read failed: {}", e),
            Err(_) => break format!("no data for {:?}", idle_timeout),
        }
    };

    if parser.rejected() > 0 {
        debug!("{} dropped {} packets", session, parser.rejected());
    }
    info!("Headset link lost: {}", reason);
    queue.post_session(
        session,
        SessionEvent::Disconnected {
            reason: Some(reason),
        },
    );
}

impl<O: StreamOpener> Transport for ThinkGearTransport<O> {
    fn check_ready(&self) -> Result<()> {
        Ok(())
    }

    fn start_scan(&mut self, _scan: TimerId) -> Result<()> {
        Err(Error::NotSupported {
            operation: "scanning for headsets".to_string(),
        })
    }

    fn stop_scan(&mut self) {}

    fn bonded_devices(&self) -> Vec<DeviceIdentity> {
        self.opener.bonded_devices()
    }

    fn remote_device(&self, address: &str) -> Result<DeviceIdentity> {
        BDAddr::from_str(address).map_err(|_| Error::InvalidAddress {
            address: address.to_string(),
        })?;
        Ok(DeviceIdentity::from_address(address))
    }

    fn connect(&mut self, session: SessionId, device: &DeviceIdentity) -> Result<()> {
        let opener = self.opener.clone();
        let queue = self.queue.clone();
        let idle_timeout = self.idle_timeout;
        let address = device.address.clone();

        let task = tokio::spawn(async move {
            match opener.open(&address).await {
                Ok(stream) => {
                    info!("Headset stream open at {}", address);
                    queue.post_session(session, SessionEvent::Connected);
                    run_session(stream, session, queue, idle_timeout).await;
                }
                Err(e) => {
                    warn!("Failed to open headset stream at {}: {}", address, e);
                    let retry = e.kind() != io::ErrorKind::PermissionDenied;
                    let reason = if retry {
                        e.to_string()
                    } else {
                        format!("Device {} is not paired", address)
                    };
                    queue.post_session(session, SessionEvent::ConnectFailed { reason, retry });
                }
            }
        });

        if let Some(previous) = self.sessions.insert(session, task) {
            previous.abort();
        }
        Ok(())
    }

    fn close(&mut self, session: SessionId) {
        if let Some(task) = self.sessions.remove(&session) {
            debug!("Closing headset {}", session);
            task.abort();
        }
    }
}

impl<O> Drop for ThinkGearTransport<O> {
    fn drop(&mut self) {
        for (_, task) in self.sessions.drain() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{SensorReading, SignalKind};
    use crate::protocol::thinkgear::encode_packet;
    use crate::transport::{Event, Input};
    use parking_lot::Mutex;
    use tokio::io::{AsyncWriteExt, DuplexStream};
    use tokio::sync::mpsc::UnboundedReceiver;

    const ADDRESS: &str = "20:68:9D:4C:0E:11";

    #[derive(Default)]
    struct DuplexOpener {
        stream: Mutex<Option<DuplexStream>>,
        error: Option<io::ErrorKind>,
    }

    #[async_trait]
    impl StreamOpener for DuplexOpener {
        fn bonded_devices(&self) -> Vec<DeviceIdentity> {
            vec![DeviceIdentity::named("Alchemy", ADDRESS)]
        }

        async fn open(&self, _address: &str) -> io::Result<SensorStream> {
            if let Some(kind) = self.error {
                return Err(io::Error::new(kind, "open failed"));
            }
            match self.stream.lock().take() {
                Some(stream) => Ok(Box::new(stream)),
                None => Err(io::Error::new(io::ErrorKind::NotFound, "no stream")),
            }
        }
    }

    async fn next_session_event(rx: &mut UnboundedReceiver<Input>) -> SessionEvent {
        match rx.recv().await {
            Some(Input::Event(Event::Session { event, .. })) => event,
            other => panic!("unexpected input: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stream_readings_and_close() {
        let (client, mut device) = tokio::io::duplex(256);
        let opener = DuplexOpener {
            stream: Mutex::new(Some(client)),
            error: None,
        };
        let (queue, mut rx) = EventQueue::channel();
        let mut transport = ThinkGearTransport::new(opener, queue);

        let session = SessionId(1);
        transport
            .connect(session, &DeviceIdentity::from_address(ADDRESS))
            .unwrap();
        assert_eq!(next_session_event(&mut rx).await, SessionEvent::Connected);

        let packet = encode_packet(&[0x04, 0x32, 0x05, 0x60]).unwrap();
        device.write_all(&packet).await.unwrap();

        assert_eq!(
            next_session_event(&mut rx).await,
            SessionEvent::Reading(SensorReading::Signal {
                signal: SignalKind::Attention,
                value: 0x32
            })
        );
        assert_eq!(
            next_session_event(&mut rx).await,
            SessionEvent::Reading(SensorReading::Signal {
                signal: SignalKind::Meditation,
                value: 0x60
            })
        );

        drop(device);
        assert!(matches!(
            next_session_event(&mut rx).await,
            SessionEvent::Disconnected { reason: Some(_) }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_stream_reports_disconnect() {
        let (client, _device) = tokio::io::duplex(64);
        let opener = DuplexOpener {
            stream: Mutex::new(Some(client)),
            error: None,
        };
        let (queue, mut rx) = EventQueue::channel();
        let mut transport =
            ThinkGearTransport::new(opener, queue).with_idle_timeout(Duration::from_secs(2));

        transport
            .connect(SessionId(1), &DeviceIdentity::from_address(ADDRESS))
            .unwrap();
        assert_eq!(next_session_event(&mut rx).await, SessionEvent::Connected);

        match next_session_event(&mut rx).await {
            SessionEvent::Disconnected { reason: Some(reason) } => {
                assert!(reason.contains("no data"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unpaired_device_is_not_retried() {
        let opener = DuplexOpener {
            stream: Mutex::new(None),
            error: Some(io::ErrorKind::PermissionDenied),
        };
        let (queue, mut rx) = EventQueue::channel();
        let mut transport = ThinkGearTransport::new(opener, queue);

        transport
            .connect(SessionId(3), &DeviceIdentity::from_address(ADDRESS))
            .unwrap();
        match next_session_event(&mut rx).await {
            SessionEvent::ConnectFailed { reason, retry } => {
                assert!(!retry);
                assert!(reason.contains("not paired"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_scan_unsupported_and_address_validation() {
        let (queue, _rx) = EventQueue::channel();
        let mut transport = ThinkGearTransport::new(DuplexOpener::default(), queue);

        assert!(matches!(
            transport.start_scan(TimerId(1)),
            Err(Error::NotSupported { .. })
        ));
        assert!(transport.remote_device(ADDRESS).is_ok());
        assert!(matches!(
            transport.remote_device("not-an-address"),
            Err(Error::InvalidAddress { .. })
        ));
        assert_eq!(transport.bonded_devices().len(), 1);
    }
}
