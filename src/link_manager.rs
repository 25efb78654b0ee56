//! Runtime handle for a supervised link.
//!
//! [`LinkManager`] owns the task that drains the event queue into the
//! [`ConnectionSupervisor`]. Commands are queued alongside platform events,
//! status is published through a `watch` channel so reading it never blocks,
//! and [`LinkEvent`]s fan out over a broadcast channel.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::ble::connection::{ConnectionState, ConnectionStatus};
use crate::cache::AddressCache;
use crate::config::LinkConfig;
use crate::error::{Error, Result};
use crate::events::{BroadcastSink, LinkEvent};
use crate::platform::gatt::{default_adapter, BtleplugTransport};
use crate::supervisor::{ConnectionSupervisor, LinkSnapshot};
use crate::timer::TokioTimers;
use crate::transport::{Command, EventQueue, Input, Transport};

/// Capacity of the event broadcast channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Handle for a registered callback.
///
/// When dropped, the callback is automatically unregistered.
pub struct CallbackHandle {
    id: u64,
    unregister_fn: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl CallbackHandle {
    pub(crate) fn new(id: u64, unregister_fn: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            id,
            unregister_fn: Some(Box::new(unregister_fn)),
        }
    }

    /// Unregister this callback.
    pub fn unregister(mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }

    /// Get the callback ID.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for CallbackHandle {
    fn drop(&mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }
}

impl std::fmt::Debug for CallbackHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackHandle").field("id", &self.id).finish()
    }
}

/// Handle to one supervised peripheral link.
///
/// Dropping the manager stops its task.
pub struct LinkManager {
    queue: EventQueue,
    events: BroadcastSink,
    snapshot: watch::Receiver<LinkSnapshot>,
    task: Mutex<Option<JoinHandle<()>>>,
    callback_counter: AtomicU64,
}

impl LinkManager {
    /// Start a link task.
    ///
    /// `make_transport` receives the queue the transport must post its
    /// events to. Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new<T, C, F>(config: LinkConfig, cache: C, make_transport: F) -> Result<Self>
    where
        T: Transport + 'static,
        C: AddressCache + 'static,
        F: FnOnce(EventQueue) -> T,
    {
        config.validate()?;

        let (queue, rx) = EventQueue::channel();
        let transport = make_transport(queue.clone());
        let timers = TokioTimers::new(queue.clone());
        let events = BroadcastSink::new(EVENT_CHANNEL_CAPACITY);

        info!("Starting link for {}", config.target.exact_name);
        let supervisor = ConnectionSupervisor::new(
            config,
            Box::new(transport),
            Box::new(timers),
            Box::new(cache),
            Box::new(events.clone()),
        );

        let (snapshot_tx, snapshot) = watch::channel(supervisor.snapshot());
        let task = tokio::spawn(Self::run(supervisor, rx, snapshot_tx));

        Ok(Self {
            queue,
            events,
            snapshot,
            task: Mutex::new(Some(task)),
            callback_counter: AtomicU64::new(0),
        })
    }

    /// Start a GATT link on the system's first Bluetooth adapter.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available or the configuration
    /// is invalid.
    pub async fn with_default_adapter<C>(config: LinkConfig, cache: C) -> Result<Self>
    where
        C: AddressCache + 'static,
    {
        let adapter = default_adapter().await?;
        Self::new(config, cache, |queue| BtleplugTransport::new(adapter, queue))
    }

    async fn run(
        mut supervisor: ConnectionSupervisor,
        mut rx: tokio::sync::mpsc::UnboundedReceiver<Input>,
        snapshot_tx: watch::Sender<LinkSnapshot>,
    ) {
        while let Some(input) = rx.recv().await {
            match input {
                Input::Command(Command::Connect) => supervisor.connect(),
                Input::Command(Command::Disconnect) => supervisor.disconnect(),
                Input::Command(Command::Shutdown(ack)) => {
                    supervisor.disconnect();
                    snapshot_tx.send_replace(supervisor.snapshot());
                    if let Some(ack) = ack {
                        let _ = ack.send(());
                    }
                    break;
                }
                Input::Event(event) => supervisor.handle(event),
            }
            snapshot_tx.send_replace(supervisor.snapshot());
        }

        debug!("Link task ended");
    }

    /// Ask the link to connect. Outcomes arrive as events.
    pub fn connect(&self) {
        if let Err(e) = self.queue.command(Command::Connect) {
            warn!("Ignoring connect request: {}", e);
        }
    }

    /// Ask the link to disconnect and stop retrying.
    pub fn disconnect(&self) {
        if let Err(e) = self.queue.command(Command::Disconnect) {
            warn!("Ignoring disconnect request: {}", e);
        }
    }

    /// Connection flags as of the last processed event.
    pub fn status(&self) -> ConnectionStatus {
        self.snapshot.borrow().status
    }

    /// Lifecycle state as of the last processed event.
    pub fn state(&self) -> ConnectionState {
        self.snapshot.borrow().state
    }

    /// Full snapshot as of the last processed event.
    pub fn snapshot(&self) -> LinkSnapshot {
        *self.snapshot.borrow()
    }

    /// Watch snapshots as they change.
    pub fn watch(&self) -> watch::Receiver<LinkSnapshot> {
        self.snapshot.clone()
    }

    /// Subscribe to link events.
    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.events.subscribe()
    }

    /// Register a callback for link events.
    ///
    /// Returns a handle that unregisters the callback when dropped.
    pub fn on_event<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(&LinkEvent) + Send + Sync + 'static,
    {
        let callback_id = self.callback_counter.fetch_add(1, Ordering::SeqCst);
        let mut rx = self.events.subscribe();

        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => callback(&event),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("Event callback lagged, {} events dropped", missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        CallbackHandle::new(callback_id, move || {
            handle.abort();
        })
    }

    /// Disconnect and stop the link task.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LinkStopped`] if the task had already stopped.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down link");

        let (ack_tx, ack_rx) = oneshot::channel();
        self.queue.command(Command::Shutdown(Some(ack_tx)))?;
        ack_rx.await.map_err(|_| Error::LinkStopped)?;

        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        Ok(())
    }

    /// Whether the link task is still running.
    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }
}

impl Drop for LinkManager {
    fn drop(&mut self) {
        let _ = self.queue.command(Command::Shutdown(None));
    }
}

impl std::fmt::Debug for LinkManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkManager")
            .field("snapshot", &*self.snapshot.borrow())
            .finish_non_exhaustive()
    }
}
