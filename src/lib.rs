//! # modpool — supervised Modbus master connection pool
//!
//! A client-side Modbus library that manages a pool of devices reachable
//! over TCP sockets or RS-232/485 serial lines. It frames and parses
//! Modbus TCP (MBAP) and RTU requests, serializes concurrent access per
//! device, and supervises every connection with heartbeat probing,
//! failure-driven reconnection and indefinite retry for devices marked
//! persistent.
//!
//! ## Features
//!
//! - **Connection pool**: one registry of heterogeneous devices keyed by a
//!   canonical device id, with batch connect/disconnect fan-out
//! - **Both framings**: Modbus TCP, Modbus RTU over serial, and RTU
//!   tunneled through TCP
//! - **Supervision**: periodic heartbeat, transparent refresh-and-retry on
//!   transient I/O errors, persistent-device auto-reconnect
//! - **Lifecycle events**: connected / disconnected / ping-failed /
//!   recovered / removed, delivered to any number of listeners
//! - **Uniform API**: every request is available inline (`send`) and as a
//!   spawned background future (`send_async`)
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use modpool::{DeviceConfig, ModbusClient, ModbusDevice, ModbusResult};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> ModbusResult<()> {
//!     let client = ModbusClient::new();
//!
//!     // Connect a Modbus TCP device and read one holding register.
//!     let device = client
//!         .connect_device(DeviceConfig::tcp("192.168.1.50", 502))
//!         .await?;
//!     let response = device.send(1, 0x03, 0, 1).await?;
//!     println!("raw response: {:02X?}", response);
//!
//!     // Keep it alive forever and let the pool watch over it.
//!     client.mark_persistent(&device.device_id()).await;
//!     client.start_heartbeat(Duration::from_secs(5));
//!
//!     client.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │                ModbusClient                 │
//! │   registry · heartbeat · failure handling   │
//! └──────────────────────┬──────────────────────┘
//!                        │
//!          ┌─────────────┴─────────────┐
//! ┌────────┴────────┐         ┌────────┴────────┐
//! │ TcpModbusDevice │         │SerialModbusDevice│
//! │  (MBAP / RTU)   │         │      (RTU)       │
//! └────────┬────────┘         └────────┬────────┘
//!          │                           │
//! ┌────────┴────────┐         ┌────────┴────────┐
//! │  TcpTransport   │         │ SerialTransport │
//! └─────────────────┘         └─────────────────┘
//! ```
//!
//! Responses are returned as raw frames, including Modbus exception
//! responses; callers that care can test `response[fc_offset] & 0x80`.

/// Error types and result alias.
pub mod error;

/// Device descriptors: kinds, endpoints, timeouts.
pub mod config;

/// Frame construction, CRC-16 and the transaction id counter.
pub mod codec;

/// Byte-stream transports: TCP socket and serial port.
pub mod transport;

/// Device trait, TCP and serial implementations, heartbeat strategies.
pub mod device;

/// Lifecycle events and the listener bus.
pub mod event;

/// The device pool and supervisor.
pub mod client;

pub use client::{ModbusClient, DEFAULT_RETRY_BACKOFF};
pub use codec::{Framing, ModbusFunction};
pub use config::{
    DeviceConfig, DeviceKind, Endpoint, SerialDataBits, SerialParity, SerialStopBits,
    DEFAULT_TIMEOUT_MS,
};
pub use device::{
    ConnectionState, HeartbeatFuture, HeartbeatStrategy, ModbusDevice, ModbusDeviceExt,
    PendingResponse, SerialModbusDevice, TcpModbusDevice,
};
pub use error::{ModbusError, ModbusResult};
pub use event::{DeviceEvent, DeviceEventKind, EventBus, EventListener};
pub use transport::{SerialTransport, TcpTransport, Transport};

/// Maximum Modbus TCP frame size (MBAP header + PDU).
pub const MAX_TCP_FRAME_SIZE: usize = 260;

/// Maximum Modbus RTU frame size.
pub const MAX_RTU_FRAME_SIZE: usize = 256;

/// Modbus TCP default port.
pub const DEFAULT_TCP_PORT: u16 = 502;

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
