//! The device pool and its supervisor.
//!
//! [`ModbusClient`] owns the registry of devices keyed by canonical device
//! id, fans batch operations out onto the runtime, and runs the heartbeat
//! scheduler that probes every registered device and drives recovery when a
//! probe fails. Failed devices marked persistent are retried indefinitely
//! with a fixed backoff; everything else is evicted after one failed
//! recovery attempt. All lifecycle transitions are published on the
//! client's event bus.
//!
//! The client is cheap to clone; clones share one pool.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::{Mutex, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::DeviceConfig;
use crate::device::{device_for_kind, ModbusDevice};
use crate::error::{ModbusError, ModbusResult};
use crate::event::{DeviceEvent, DeviceEventKind, EventBus, EventListener};

/// Delay between recovery attempts for persistent devices.
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(10);

/// How long shutdown waits for outstanding supervision tasks before
/// aborting them.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Supervised pool of Modbus devices.
#[derive(Clone)]
pub struct ModbusClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    /// Registry: canonical device id to device. Insert/remove are atomic
    /// under the lock; heartbeat ticks iterate a snapshot so removal
    /// during iteration is tolerated.
    devices: RwLock<HashMap<String, Arc<dyn ModbusDevice>>>,
    /// Ids marked for indefinite reconnection. A member that is not
    /// registered is inert.
    persistent: RwLock<HashSet<String>>,
    events: EventBus,
    /// Ids with a recovery loop in flight. Concurrent ping failures for
    /// the same device collapse into the handler that is already running.
    recovering: Mutex<HashSet<String>>,
    /// Supervision tasks: per-device pings and their failure handlers.
    tasks: Mutex<JoinSet<()>>,
    heartbeat: StdMutex<Option<HeartbeatHandle>>,
    shutdown: CancellationToken,
    retry_backoff: Duration,
}

struct HeartbeatHandle {
    task: JoinHandle<()>,
    token: CancellationToken,
}

impl Default for ModbusClient {
    fn default() -> Self {
        Self::new()
    }
}

impl ModbusClient {
    pub fn new() -> Self {
        Self::with_retry_backoff(DEFAULT_RETRY_BACKOFF)
    }

    /// Pool with a custom persistent-recovery backoff.
    pub fn with_retry_backoff(retry_backoff: Duration) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                devices: RwLock::new(HashMap::new()),
                persistent: RwLock::new(HashSet::new()),
                events: EventBus::new(),
                recovering: Mutex::new(HashSet::new()),
                tasks: Mutex::new(JoinSet::new()),
                heartbeat: StdMutex::new(None),
                shutdown: CancellationToken::new(),
                retry_backoff,
            }),
        }
    }

    /// Register a lifecycle event listener.
    pub fn subscribe(&self, listener: EventListener) {
        self.inner.events.subscribe(listener);
    }

    /// Connect the device described by `config`, or return the already
    /// registered device for the same id.
    ///
    /// A registered-but-disconnected device is refreshed instead of
    /// replaced, so repeated calls never grow the registry (and the
    /// `Connected` event fires once per registration).
    pub async fn connect_device(&self, config: DeviceConfig) -> ModbusResult<Arc<dyn ModbusDevice>> {
        let device_id = config.device_id();

        if let Some(existing) = self.inner.devices.read().await.get(&device_id).cloned() {
            if existing.is_connected() {
                debug!("device already connected, returning existing: {}", device_id);
                return Ok(existing);
            }
            info!("device registered but disconnected, refreshing: {}", device_id);
            existing.refresh().await?;
            return Ok(existing);
        }

        let device = device_for_kind(config.kind());
        device.connect(&config).await?;

        let incumbent = {
            let mut devices = self.inner.devices.write().await;
            match devices.entry(device_id) {
                Entry::Occupied(entry) => Some(entry.get().clone()),
                Entry::Vacant(slot) => {
                    slot.insert(device.clone());
                    None
                }
            }
        };

        if let Some(incumbent) = incumbent {
            // Lost a connect race; keep the incumbent.
            if let Err(e) = device.disconnect().await {
                warn!("closing duplicate connection for {}: {}", incumbent.device_id(), e);
            }
            return Ok(incumbent);
        }

        self.inner.events.publish(DeviceEvent::new(DeviceEventKind::Connected, &device));
        Ok(device)
    }

    /// Remove a device from the registry and persistent set, then close it.
    /// Unknown ids are a no-op.
    pub async fn disconnect_device(&self, device_id: &str) -> ModbusResult<()> {
        let device = self.inner.devices.write().await.remove(device_id);
        self.inner.persistent.write().await.remove(device_id);

        let Some(device) = device else { return Ok(()) };
        let result = device.disconnect().await;
        self.inner.events.publish(DeviceEvent::new(DeviceEventKind::Disconnected, &device));
        result
    }

    /// Connect many devices concurrently. Individual failures are logged
    /// and do not abort the rest.
    pub async fn batch_connect(&self, configs: Vec<DeviceConfig>) {
        let mut batch = JoinSet::new();
        for config in configs {
            let client = self.clone();
            batch.spawn(async move {
                let device_id = config.device_id();
                if let Err(e) = client.connect_device(config).await {
                    error!("batch connect failed for {}: {}", device_id, e);
                }
            });
        }
        while batch.join_next().await.is_some() {}
    }

    /// Disconnect many devices concurrently. Individual failures are
    /// logged and do not abort the rest.
    pub async fn batch_disconnect(&self, device_ids: Vec<String>) {
        let mut batch = JoinSet::new();
        for device_id in device_ids {
            let client = self.clone();
            batch.spawn(async move {
                if let Err(e) = client.disconnect_device(&device_id).await {
                    error!("batch disconnect failed for {}: {}", device_id, e);
                }
            });
        }
        while batch.join_next().await.is_some() {}
    }

    /// Look up a registered device.
    pub async fn get_device(&self, device_id: &str) -> Option<Arc<dyn ModbusDevice>> {
        self.inner.devices.read().await.get(device_id).cloned()
    }

    /// Snapshot of the registry.
    pub async fn connected_devices(&self) -> HashMap<String, Arc<dyn ModbusDevice>> {
        self.inner.devices.read().await.clone()
    }

    /// Mark a registered device for indefinite reconnection. Unregistered
    /// ids are ignored.
    pub async fn mark_persistent(&self, device_id: &str) {
        if self.inner.devices.read().await.contains_key(device_id) {
            self.inner.persistent.write().await.insert(device_id.to_string());
            info!("device marked persistent: {}", device_id);
        }
    }

    /// Clear the persistent mark.
    pub async fn unmark_persistent(&self, device_id: &str) {
        self.inner.persistent.write().await.remove(device_id);
        info!("device unmarked persistent: {}", device_id);
    }

    /// Send a prebuilt frame to a registered device.
    pub async fn send_raw_to(&self, device_id: &str, frame: &[u8]) -> ModbusResult<Vec<u8>> {
        let device = self
            .get_device(device_id)
            .await
            .ok_or_else(|| ModbusError::not_connected(device_id))?;
        device.send_raw(frame).await
    }

    /// Build and send a request to a registered device.
    pub async fn send_to(
        &self,
        device_id: &str,
        slave: u8,
        function: u8,
        address: u16,
        quantity: u16,
    ) -> ModbusResult<Vec<u8>> {
        let device = self
            .get_device(device_id)
            .await
            .ok_or_else(|| ModbusError::not_connected(device_id))?;
        device.send(slave, function, address, quantity).await
    }

    /// Start the periodic heartbeat. Idempotent while a scheduler is
    /// already running.
    ///
    /// Every `period` the scheduler snapshots the registry and spawns one
    /// independent ping task per heartbeat-enabled device, so a hung device
    /// cannot delay probes of its siblings.
    pub fn start_heartbeat(&self, period: Duration) {
        let mut guard = self.inner.heartbeat.lock().unwrap();
        if guard.is_some() {
            debug!("heartbeat already running");
            return;
        }

        let token = self.inner.shutdown.child_token();
        let tick_token = token.clone();
        let inner = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first interval tick fires immediately; consume it so the
            // first probe happens one full period after start.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = tick_token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(inner) = inner.upgrade() else { break };
                ClientInner::heartbeat_tick(&inner, &tick_token).await;
            }
        });

        *guard = Some(HeartbeatHandle { task, token });
        info!("heartbeat started, interval {:?}", period);
    }

    /// Stop the heartbeat scheduler. In-flight pings finish on their own;
    /// their failure handlers observe the cancellation and stand down.
    pub fn stop_heartbeat(&self) {
        let handle = self.inner.heartbeat.lock().unwrap().take();
        if let Some(HeartbeatHandle { task, token }) = handle {
            token.cancel();
            task.abort();
            info!("heartbeat stopped");
        }
    }

    /// Orderly shutdown: stop the heartbeat, disconnect every registered
    /// device, then give supervision tasks a bounded grace period before
    /// aborting the stragglers.
    pub async fn shutdown(&self) {
        info!("shutting down device pool");
        self.stop_heartbeat();

        let device_ids: Vec<String> = self.inner.devices.read().await.keys().cloned().collect();
        self.batch_disconnect(device_ids).await;

        self.inner.shutdown.cancel();
        let mut tasks = self.inner.tasks.lock().await;
        let drained = timeout(SHUTDOWN_GRACE, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("supervision tasks outlived the grace period, aborting them");
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }
    }
}

impl ClientInner {
    /// One scheduler tick: reap finished supervision tasks and dispatch a
    /// ping per heartbeat-enabled device.
    async fn heartbeat_tick(self_arc: &Arc<Self>, token: &CancellationToken) {
        let snapshot = self_arc.devices.read().await.clone();
        let mut tasks = self_arc.tasks.lock().await;
        while tasks.try_join_next().is_some() {}

        for (device_id, device) in snapshot {
            if token.is_cancelled() {
                break;
            }
            if !device.heartbeat_enabled() {
                continue;
            }
            let inner = Arc::clone(self_arc);
            let token = token.clone();
            tasks.spawn(async move {
                if token.is_cancelled() {
                    return;
                }
                if let Err(e) = device.clone().ping().await {
                    warn!("heartbeat lost for {}: {}", device_id, e);
                    inner.handle_device_failure(device_id, device, token).await;
                }
            });
        }
    }

    /// Recovery loop for a device whose ping failed.
    ///
    /// One handler runs per device id at a time; ping failures arriving
    /// while it runs are dropped. The loop runs while the device stays
    /// registered: refresh and publish `Recovered` on success; on failure
    /// evict non-persistent devices and keep retrying persistent ones
    /// after the backoff. Cancellation of the scheduler or pool shutdown
    /// ends the loop immediately.
    async fn handle_device_failure(
        &self,
        device_id: String,
        device: Arc<dyn ModbusDevice>,
        token: CancellationToken,
    ) {
        if !self.recovering.lock().await.insert(device_id.clone()) {
            debug!("recovery already in progress: {}", device_id);
            return;
        }
        self.events.publish(DeviceEvent::new(DeviceEventKind::PingFailed, &device));

        loop {
            if token.is_cancelled() {
                break;
            }
            if !self.devices.read().await.contains_key(&device_id) {
                debug!("skipping recovery, device no longer registered: {}", device_id);
                break;
            }
            let is_persistent = self.persistent.read().await.contains(&device_id);

            info!("attempting to recover device: {}", device_id);
            match device.refresh().await {
                Ok(()) => {
                    info!("device recovered: {}", device_id);
                    self.events.publish(DeviceEvent::new(DeviceEventKind::Recovered, &device));
                    break;
                }
                Err(e) => {
                    warn!("recovery failed for {}: {}", device_id, e);
                    if !is_persistent {
                        // A concurrent disconnect may have removed it
                        // already; Removed is published only by whoever
                        // actually took the entry out.
                        if self.devices.write().await.remove(&device_id).is_some() {
                            warn!("removing non-persistent device: {}", device_id);
                            self.persistent.write().await.remove(&device_id);
                            self.events.publish(DeviceEvent::new(DeviceEventKind::Removed, &device));
                        }
                        break;
                    }
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(self.retry_backoff) => {}
                    }
                }
            }
        }

        self.recovering.lock().await.remove(&device_id);
    }
}
