//! Supervised Modbus devices.
//!
//! A device binds one open [`Transport`] to one framing variant and owns
//! the mutual-exclusion token that serializes every request on that wire.
//! Two concrete implementations exist: [`TcpModbusDevice`] for Modbus TCP
//! and RTU-over-TCP, and [`SerialModbusDevice`] for RS-232/485 lines. Both
//! share the same request pipeline:
//!
//! 1. acquire the device mutex,
//! 2. write the request frame,
//! 3. read the response according to the framing variant,
//! 4. on a non-timeout failure, refresh the connection and retry once.
//!
//! The single-shot refresh-and-retry hides transient socket breakage from
//! callers; anything that also fails the retry propagates. Persistent
//! reconnection across heartbeat failures is the pool's job, not the
//! device's.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::sync::Mutex;

use crate::codec::{self, Framing, MbapHeader, MBAP_HEADER_LEN};
use crate::config::{DeviceConfig, DeviceKind, DEFAULT_TIMEOUT_MS};
use crate::error::{ModbusError, ModbusResult};
use crate::transport::{self, Transport};

/// Connection lifecycle state of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
    /// Transport teardown in progress.
    Closing,
}

impl ConnectionState {
    fn as_u8(self) -> u8 {
        match self {
            ConnectionState::Disconnected => 0,
            ConnectionState::Connected => 1,
            ConnectionState::Closing => 2,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionState::Connected,
            2 => ConnectionState::Closing,
            _ => ConnectionState::Disconnected,
        }
    }
}

/// Future returned by a [`HeartbeatStrategy`] invocation.
pub type HeartbeatFuture = Pin<Box<dyn Future<Output = ModbusResult<()>> + Send>>;

/// Caller-supplied liveness probe executed by [`ModbusDevice::ping`].
///
/// The probe receives the device handle for the duration of the callback
/// and must go through the device's public request operations, which keeps
/// it serialized with regular traffic on the same wire.
pub type HeartbeatStrategy = Arc<dyn Fn(Arc<dyn ModbusDevice>) -> HeartbeatFuture + Send + Sync>;

/// In-flight response future returned by the async request variants.
pub type PendingResponse = Pin<Box<dyn Future<Output = ModbusResult<Vec<u8>>> + Send>>;

/// Slave probed by the default heartbeat.
const DEFAULT_HEARTBEAT_SLAVE: u8 = 1;

/// One supervised Modbus connection.
#[async_trait]
pub trait ModbusDevice: Send + Sync {
    /// Open the transport described by `config`.
    ///
    /// Fails with `UnsupportedKind` when the config kind is outside this
    /// device's supported set; succeeds silently when already connected.
    async fn connect(&self, config: &DeviceConfig) -> ModbusResult<()>;

    /// Close the transport. Continues past intermediate close errors and
    /// reports the first; calling again on a closed device is a no-op.
    async fn disconnect(&self) -> ModbusResult<()>;

    /// Tear down and reopen the transport from the stored config.
    async fn refresh(&self) -> ModbusResult<()>;

    /// Non-blocking connection check.
    fn is_connected(&self) -> bool;

    /// Current lifecycle state.
    fn state(&self) -> ConnectionState;

    /// Write a prebuilt request frame and return the raw response frame.
    async fn send_raw(&self, frame: &[u8]) -> ModbusResult<Vec<u8>>;

    /// Build a request for this device's framing and send it.
    ///
    /// Covers the common 4-field request layout (`function | address |
    /// quantity`); the response is returned unparsed, including Modbus
    /// exception responses.
    async fn send(&self, slave: u8, function: u8, address: u16, quantity: u16) -> ModbusResult<Vec<u8>>;

    /// Run the heartbeat probe: the configured strategy if any, otherwise
    /// a read of 1 holding register at address 0 of slave 1.
    async fn ping(self: Arc<Self>) -> ModbusResult<()>;

    /// Canonical device id; empty until the first connect.
    fn device_id(&self) -> String;

    /// Current connect/read deadline.
    fn timeout(&self) -> Duration;

    /// Change the deadline; applies from the next request on.
    fn set_timeout(&self, timeout: Duration);

    /// Whether the pool's heartbeat scheduler probes this device.
    fn heartbeat_enabled(&self) -> bool;

    /// Flip heartbeat participation; cheap and non-blocking.
    fn set_heartbeat_enabled(&self, enabled: bool);

    /// Current heartbeat strategy override, if any.
    fn heartbeat_strategy(&self) -> Option<HeartbeatStrategy>;

    /// Install or clear the heartbeat strategy override.
    fn set_heartbeat_strategy(&self, strategy: Option<HeartbeatStrategy>);

    /// Config kinds this device implementation can service.
    fn supported_kinds(&self) -> &'static [DeviceKind];
}

/// Async request variants on shared device handles.
///
/// The returned futures are backed by a task spawned onto the runtime, so
/// the request makes progress without the caller polling and the handle is
/// never completed synchronously.
pub trait ModbusDeviceExt {
    /// Async variant of [`ModbusDevice::send_raw`].
    fn send_raw_async(&self, frame: Vec<u8>) -> PendingResponse;

    /// Async variant of [`ModbusDevice::send`].
    fn send_async(&self, slave: u8, function: u8, address: u16, quantity: u16) -> PendingResponse;
}

impl<D: ModbusDevice + ?Sized + 'static> ModbusDeviceExt for Arc<D> {
    fn send_raw_async(&self, frame: Vec<u8>) -> PendingResponse {
        let device = Arc::clone(self);
        let handle = tokio::spawn(async move { device.send_raw(&frame).await });
        Box::pin(async move {
            handle
                .await
                .map_err(|e| ModbusError::io(format!("async request task failed: {}", e)))?
        })
    }

    fn send_async(&self, slave: u8, function: u8, address: u16, quantity: u16) -> PendingResponse {
        let device = Arc::clone(self);
        let handle = tokio::spawn(async move { device.send(slave, function, address, quantity).await });
        Box::pin(async move {
            handle
                .await
                .map_err(|e| ModbusError::io(format!("async request task failed: {}", e)))?
        })
    }
}

/// Identity and framing recorded at connect time.
#[derive(Default)]
struct DeviceMeta {
    device_id: String,
    framing: Option<Framing>,
}

/// Transport and config guarded by the device mutex.
#[derive(Default)]
struct IoState {
    transport: Option<Box<dyn Transport>>,
    config: Option<DeviceConfig>,
}

/// State and request pipeline shared by both device implementations.
struct DeviceCore {
    supported: &'static [DeviceKind],
    /// The device mutex: held for the full duration of every operation
    /// that touches the transport, so requests never interleave on the
    /// wire and responses pair with their own requests.
    io: Mutex<IoState>,
    state: AtomicU8,
    meta: RwLock<DeviceMeta>,
    timeout_ms: AtomicU64,
    heartbeat_enabled: AtomicBool,
    strategy: RwLock<Option<HeartbeatStrategy>>,
}

impl DeviceCore {
    fn new(supported: &'static [DeviceKind]) -> Self {
        Self {
            supported,
            io: Mutex::new(IoState::default()),
            state: AtomicU8::new(ConnectionState::Disconnected.as_u8()),
            meta: RwLock::new(DeviceMeta::default()),
            timeout_ms: AtomicU64::new(DEFAULT_TIMEOUT_MS),
            heartbeat_enabled: AtomicBool::new(true),
            strategy: RwLock::new(None),
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn device_id(&self) -> String {
        self.meta.read().unwrap().device_id.clone()
    }

    fn framing(&self) -> Option<Framing> {
        self.meta.read().unwrap().framing
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.load(Ordering::Relaxed))
    }

    fn check_supported(&self, kind: DeviceKind) -> ModbusResult<()> {
        if self.supported.contains(&kind) {
            return Ok(());
        }
        let supported = self
            .supported
            .iter()
            .map(|k| k.prefix())
            .collect::<Vec<_>>()
            .join(", ");
        Err(ModbusError::unsupported_kind(kind.to_string(), supported))
    }

    async fn connect(&self, config: &DeviceConfig) -> ModbusResult<()> {
        self.check_supported(config.kind())?;
        config.validate()?;

        let mut io = self.io.lock().await;
        if io.transport.is_some() {
            debug!("device already connected: {}", self.device_id());
            return Ok(());
        }

        let transport = transport::open(config).await?;
        {
            let mut meta = self.meta.write().unwrap();
            meta.device_id = config.device_id();
            meta.framing = Some(config.kind().framing());
        }
        self.timeout_ms.store(config.timeout.as_millis() as u64, Ordering::Relaxed);
        io.config = Some(config.clone());
        io.transport = Some(transport);
        self.set_state(ConnectionState::Connected);
        info!("device connected: {}", self.device_id());
        Ok(())
    }

    async fn disconnect(&self) -> ModbusResult<()> {
        let mut io = self.io.lock().await;
        let Some(mut transport) = io.transport.take() else {
            self.set_state(ConnectionState::Disconnected);
            return Ok(());
        };
        self.set_state(ConnectionState::Closing);
        let result = transport.close().await;
        self.set_state(ConnectionState::Disconnected);
        info!("device disconnected: {}", self.device_id());
        result
    }

    async fn refresh(&self) -> ModbusResult<()> {
        let mut io = self.io.lock().await;
        self.reconnect_locked(&mut io).await
    }

    /// Close whatever transport is present and reopen from the stored
    /// config. Caller must hold the io lock.
    async fn reconnect_locked(&self, io: &mut IoState) -> ModbusResult<()> {
        let mut config = io
            .config
            .clone()
            .ok_or_else(|| ModbusError::not_connected(self.device_id()))?;

        if let Some(mut transport) = io.transport.take() {
            self.set_state(ConnectionState::Closing);
            if let Err(e) = transport.close().await {
                warn!("closing stale transport for {}: {}", self.device_id(), e);
            }
        }
        self.set_state(ConnectionState::Disconnected);

        // Pick up a timeout changed via set_timeout since the last open.
        config.timeout = self.timeout();
        let transport = transport::open(&config).await?;
        io.config = Some(config);
        io.transport = Some(transport);
        self.set_state(ConnectionState::Connected);
        info!("device connection refreshed: {}", self.device_id());
        Ok(())
    }

    async fn send_raw(&self, frame: &[u8]) -> ModbusResult<Vec<u8>> {
        let mut io = self.io.lock().await;
        let framing = self
            .framing()
            .ok_or_else(|| ModbusError::not_connected(self.device_id()))?;
        let deadline = self.timeout();

        let transport = io
            .transport
            .as_mut()
            .ok_or_else(|| ModbusError::not_connected(self.device_id()))?;

        debug!("{} -> {}", self.device_id(), hex::encode(frame));
        match Self::exchange(transport.as_mut(), framing, frame, deadline).await {
            Ok(response) => {
                debug!("{} <- {}", self.device_id(), hex::encode(&response));
                Ok(response)
            }
            // A quiet peer is not a broken connection; surface it as-is.
            Err(err @ ModbusError::Timeout { .. }) => Err(err),
            Err(first) => {
                warn!(
                    "request on {} failed ({}), refreshing connection and retrying",
                    self.device_id(),
                    first
                );
                self.reconnect_locked(&mut io).await?;
                let transport = io
                    .transport
                    .as_mut()
                    .ok_or_else(|| ModbusError::not_connected(self.device_id()))?;
                let response = Self::exchange(transport.as_mut(), framing, frame, deadline).await?;
                debug!("{} <- {}", self.device_id(), hex::encode(&response));
                Ok(response)
            }
        }
    }

    /// One write/read round trip on an open transport.
    async fn exchange(
        transport: &mut (dyn Transport + '_),
        framing: Framing,
        frame: &[u8],
        deadline: Duration,
    ) -> ModbusResult<Vec<u8>> {
        transport.write_all(frame).await?;
        match framing {
            Framing::Mbap => {
                let header_bytes = transport.read_exact(MBAP_HEADER_LEN, deadline).await?;
                let mut fixed = [0u8; MBAP_HEADER_LEN];
                fixed.copy_from_slice(&header_bytes);
                let header = MbapHeader::parse(&fixed)?;
                let mut response = header_bytes;
                if header.remaining() > 0 {
                    let rest = transport.read_exact(header.remaining(), deadline).await?;
                    response.extend_from_slice(&rest);
                }
                Ok(response)
            }
            Framing::Rtu => {
                let response = transport.read_until_idle(deadline).await?;
                codec::validate_crc(&response)?;
                Ok(response)
            }
        }
    }

    async fn send(&self, slave: u8, function: u8, address: u16, quantity: u16) -> ModbusResult<Vec<u8>> {
        let framing = self
            .framing()
            .ok_or_else(|| ModbusError::not_connected(self.device_id()))?;
        let frame = codec::build_request(framing, slave, function, address, quantity);
        self.send_raw(&frame).await
    }

    async fn ping(&self, device: Arc<dyn ModbusDevice>) -> ModbusResult<()> {
        let strategy = self.strategy.read().unwrap().clone();
        match strategy {
            Some(probe) => probe(device).await,
            None => self
                .send(DEFAULT_HEARTBEAT_SLAVE, 0x03, 0x0000, 0x0001)
                .await
                .map(|_| ()),
        }
    }
}

macro_rules! delegate_device_impl {
    ($ty:ty) => {
        #[async_trait]
        impl ModbusDevice for $ty {
            async fn connect(&self, config: &DeviceConfig) -> ModbusResult<()> {
                self.core.connect(config).await
            }

            async fn disconnect(&self) -> ModbusResult<()> {
                self.core.disconnect().await
            }

            async fn refresh(&self) -> ModbusResult<()> {
                self.core.refresh().await
            }

            fn is_connected(&self) -> bool {
                self.core.state() == ConnectionState::Connected
            }

            fn state(&self) -> ConnectionState {
                self.core.state()
            }

            async fn send_raw(&self, frame: &[u8]) -> ModbusResult<Vec<u8>> {
                self.core.send_raw(frame).await
            }

            async fn send(&self, slave: u8, function: u8, address: u16, quantity: u16) -> ModbusResult<Vec<u8>> {
                self.core.send(slave, function, address, quantity).await
            }

            async fn ping(self: Arc<Self>) -> ModbusResult<()> {
                let device: Arc<dyn ModbusDevice> = self.clone();
                self.core.ping(device).await
            }

            fn device_id(&self) -> String {
                self.core.device_id()
            }

            fn timeout(&self) -> Duration {
                self.core.timeout()
            }

            fn set_timeout(&self, timeout: Duration) {
                self.core
                    .timeout_ms
                    .store(timeout.as_millis() as u64, Ordering::Relaxed);
            }

            fn heartbeat_enabled(&self) -> bool {
                self.core.heartbeat_enabled.load(Ordering::Relaxed)
            }

            fn set_heartbeat_enabled(&self, enabled: bool) {
                self.core.heartbeat_enabled.store(enabled, Ordering::Relaxed);
            }

            fn heartbeat_strategy(&self) -> Option<HeartbeatStrategy> {
                self.core.strategy.read().unwrap().clone()
            }

            fn set_heartbeat_strategy(&self, strategy: Option<HeartbeatStrategy>) {
                *self.core.strategy.write().unwrap() = strategy;
            }

            fn supported_kinds(&self) -> &'static [DeviceKind] {
                self.core.supported
            }
        }
    };
}

/// Modbus device reached over a TCP socket.
///
/// Services the `Tcp` kind (MBAP framing) and the `TcpRtu` kind (RTU
/// framing tunneled through the socket).
pub struct TcpModbusDevice {
    core: DeviceCore,
}

impl TcpModbusDevice {
    pub fn new() -> Self {
        Self { core: DeviceCore::new(&[DeviceKind::Tcp, DeviceKind::TcpRtu]) }
    }
}

impl Default for TcpModbusDevice {
    fn default() -> Self {
        Self::new()
    }
}

delegate_device_impl!(TcpModbusDevice);

/// Modbus RTU device on a serial line.
pub struct SerialModbusDevice {
    core: DeviceCore,
}

impl SerialModbusDevice {
    pub fn new() -> Self {
        Self { core: DeviceCore::new(&[DeviceKind::Rtu]) }
    }
}

impl Default for SerialModbusDevice {
    fn default() -> Self {
        Self::new()
    }
}

delegate_device_impl!(SerialModbusDevice);

/// Build the device implementation matching a config kind.
pub(crate) fn device_for_kind(kind: DeviceKind) -> Arc<dyn ModbusDevice> {
    match kind {
        DeviceKind::Tcp | DeviceKind::TcpRtu => Arc::new(TcpModbusDevice::new()),
        DeviceKind::Rtu => Arc::new(SerialModbusDevice::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Accept one connection and answer `count` FC 0x03 requests, echoing
    /// the transaction and unit id of each request.
    async fn serve_holding_register(listener: TcpListener, count: usize) {
        let (mut socket, _) = listener.accept().await.unwrap();
        for _ in 0..count {
            let mut request = [0u8; 12];
            if socket.read_exact(&mut request).await.is_err() {
                return;
            }
            let response = [
                request[0], request[1], 0x00, 0x00, 0x00, 0x05, request[6], 0x03, 0x02, 0x00, 0x2A,
            ];
            socket.write_all(&response).await.unwrap();
        }
    }

    #[tokio::test]
    async fn rejects_unsupported_kind() {
        let device = TcpModbusDevice::new();
        let err = device.connect(&DeviceConfig::rtu("/dev/ttyUSB0", 9600)).await.unwrap_err();
        assert!(matches!(err, ModbusError::UnsupportedKind { .. }));

        let serial = SerialModbusDevice::new();
        let err = serial.connect(&DeviceConfig::tcp("127.0.0.1", 502)).await.unwrap_err();
        assert!(matches!(err, ModbusError::UnsupportedKind { .. }));
    }

    #[tokio::test]
    async fn send_requires_connection() {
        let device = TcpModbusDevice::new();
        assert!(!device.is_connected());
        let err = device.send_raw(&[0x00; 12]).await.unwrap_err();
        assert!(matches!(err, ModbusError::NotConnected { .. }));
        let err = device.send(1, 3, 0, 1).await.unwrap_err();
        assert!(matches!(err, ModbusError::NotConnected { .. }));
    }

    #[tokio::test]
    async fn connect_send_disconnect_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(serve_holding_register(listener, 1));

        let device = TcpModbusDevice::new();
        let config = DeviceConfig::tcp("127.0.0.1", port);
        device.connect(&config).await.unwrap();
        assert!(device.is_connected());
        assert_eq!(device.device_id(), format!("TCP:127.0.0.1:{}", port));

        // Connecting again is a no-op, not an error.
        device.connect(&config).await.unwrap();

        let response = device.send(1, 0x03, 0, 1).await.unwrap();
        assert_eq!(response.len(), 11);
        assert_eq!(&response[7..], &[0x03, 0x02, 0x00, 0x2A]);
        // MBAP protocol id is always zero.
        assert_eq!(&response[2..4], &[0x00, 0x00]);

        device.disconnect().await.unwrap();
        assert!(!device.is_connected());
        assert_eq!(device.state(), ConnectionState::Disconnected);
        // Second disconnect is a no-op.
        device.disconnect().await.unwrap();

        server.await.unwrap();
    }

    #[tokio::test]
    async fn retries_once_after_broken_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            // First connection dies immediately; the device's transparent
            // refresh lands on the second, which serves the request.
            let (socket, _) = listener.accept().await.unwrap();
            drop(socket);
            serve_holding_register(listener, 1).await;
        });

        let device = TcpModbusDevice::new();
        device.connect(&DeviceConfig::tcp("127.0.0.1", port)).await.unwrap();
        let response = device.send(1, 0x03, 0, 1).await.unwrap();
        assert_eq!(response.len(), 11);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn timeout_surfaces_without_retry() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        // Accept and then stay silent.
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(2)).await;
            drop(socket);
        });

        let device = TcpModbusDevice::new();
        let config = DeviceConfig::tcp("127.0.0.1", port).with_timeout(Duration::from_millis(50));
        device.connect(&config).await.unwrap();

        let started = std::time::Instant::now();
        let err = device.send(1, 0x03, 0, 1).await.unwrap_err();
        assert!(matches!(err, ModbusError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_millis(500));
        server.abort();
    }

    #[tokio::test]
    async fn heartbeat_toggles_and_strategy() {
        let device = Arc::new(TcpModbusDevice::new());
        assert!(device.heartbeat_enabled());
        device.set_heartbeat_enabled(false);
        assert!(!device.heartbeat_enabled());

        assert!(device.heartbeat_strategy().is_none());
        let strategy: HeartbeatStrategy =
            Arc::new(|_device: Arc<dyn ModbusDevice>| -> HeartbeatFuture { Box::pin(async { Ok(()) }) });
        device.set_heartbeat_strategy(Some(strategy));
        assert!(device.heartbeat_strategy().is_some());

        // With the always-ok strategy installed, ping succeeds even though
        // the device has no transport.
        device.clone().ping().await.unwrap();

        device.set_heartbeat_strategy(None);
        let err = device.clone().ping().await.unwrap_err();
        assert!(matches!(err, ModbusError::NotConnected { .. }));
    }

    #[tokio::test]
    async fn timeout_is_adjustable_per_device() {
        let device = TcpModbusDevice::new();
        assert_eq!(device.timeout(), Duration::from_millis(DEFAULT_TIMEOUT_MS));
        device.set_timeout(Duration::from_millis(250));
        assert_eq!(device.timeout(), Duration::from_millis(250));
    }

    #[tokio::test]
    async fn async_variant_resolves_in_background() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(serve_holding_register(listener, 1));

        let device: Arc<dyn ModbusDevice> = Arc::new(TcpModbusDevice::new());
        device.connect(&DeviceConfig::tcp("127.0.0.1", port)).await.unwrap();

        let pending = device.send_async(1, 0x03, 0, 1);
        let response = tokio::time::timeout(Duration::from_secs(5), pending).await.unwrap().unwrap();
        assert_eq!(response.len(), 11);
        server.await.unwrap();
    }
}
