//! Byte-stream transports for Modbus devices.
//!
//! A [`Transport`] is a thin abstraction over one bidirectional stream:
//! write a request frame, read a response with a deadline, close. Two
//! implementations exist, a TCP socket and a serial port; the framing layer
//! above decides whether to read an exact MBAP-declared length or to drain
//! until the line goes idle.

use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use log::debug;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};
use tokio_serial::{SerialPortBuilderExt, SerialStream};

use crate::config::{DeviceConfig, Endpoint};
use crate::error::{ModbusError, ModbusResult};

/// Pause between polls while draining an RTU response.
const IDLE_POLL: Duration = Duration::from_millis(10);

/// Read chunk size for the RTU drain loop.
const DRAIN_CHUNK: usize = 256;

/// One open bidirectional byte stream.
///
/// Deadlines are passed per call rather than stored on the stream, so a
/// device-level timeout change takes effect on the next request without
/// reopening the connection.
#[async_trait]
pub trait Transport: Send {
    /// Write the whole buffer or fail.
    async fn write_all(&mut self, bytes: &[u8]) -> ModbusResult<()>;

    /// Read exactly `n` bytes within `deadline`. A peer close before `n`
    /// bytes arrive is an I/O error, not a short result.
    async fn read_exact(&mut self, n: usize, deadline: Duration) -> ModbusResult<Vec<u8>>;

    /// Read at least one byte within `deadline`, then keep draining while
    /// data keeps arriving, polling every ~10 ms. The whole operation,
    /// first read included, is bounded by `2 * deadline`.
    async fn read_until_idle(&mut self, deadline: Duration) -> ModbusResult<Vec<u8>>;

    /// Release the underlying handles. Idempotent; continues past
    /// intermediate errors and reports the first one.
    async fn close(&mut self) -> ModbusResult<()>;
}

/// Open the transport matching a device config, bounded by its timeout.
pub(crate) async fn open(config: &DeviceConfig) -> ModbusResult<Box<dyn Transport>> {
    match &config.endpoint {
        Endpoint::Tcp { ip, port } | Endpoint::TcpRtu { ip, port } => {
            Ok(Box::new(TcpTransport::open(ip, *port, config.timeout).await?))
        }
        Endpoint::Serial { port, baud, data_bits, stop_bits, parity } => Ok(Box::new(
            SerialTransport::open(port, *baud, (*data_bits).into(), (*stop_bits).into(), (*parity).into())?,
        )),
    }
}

async fn read_exact_from<S>(stream: &mut S, n: usize, deadline: Duration) -> ModbusResult<Vec<u8>>
where
    S: AsyncRead + Unpin + Send,
{
    let mut buf = vec![0u8; n];
    match timeout(deadline, stream.read_exact(&mut buf)).await {
        Err(_) => Err(ModbusError::timeout("read response", deadline.as_millis() as u64)),
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(ModbusError::io("connection closed while reading response"))
        }
        Ok(Err(e)) => Err(e.into()),
        Ok(Ok(_)) => Ok(buf),
    }
}

async fn drain_until_idle<S>(stream: &mut S, deadline: Duration) -> ModbusResult<Vec<u8>>
where
    S: AsyncRead + Unpin + Send,
{
    let mut buf = BytesMut::with_capacity(DRAIN_CHUNK);
    let mut chunk = [0u8; DRAIN_CHUNK];

    // The whole drain, first read included, fits within twice the deadline.
    let hard_stop = Instant::now() + deadline * 2;

    // The first read blocks up to the full deadline; silence is a timeout.
    let n = match timeout(deadline, stream.read(&mut chunk)).await {
        Err(_) => return Err(ModbusError::timeout("read response", deadline.as_millis() as u64)),
        Ok(Ok(0)) => return Err(ModbusError::io("connection closed while waiting for response")),
        Ok(Ok(n)) => n,
        Ok(Err(e)) => return Err(e.into()),
    };
    buf.extend_from_slice(&chunk[..n]);

    // Responses may arrive fragmented; keep collecting until the line stays
    // quiet for one poll interval or the total deadline runs out.
    while Instant::now() < hard_stop {
        match timeout(IDLE_POLL, stream.read(&mut chunk)).await {
            Err(_) => break,
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => buf.extend_from_slice(&chunk[..n]),
            Ok(Err(e)) => return Err(e.into()),
        }
    }
    Ok(buf.to_vec())
}

/// TCP socket transport, used by the `Tcp` and `TcpRtu` device kinds.
pub struct TcpTransport {
    stream: TcpStream,
    peer: String,
}

impl TcpTransport {
    /// Connect to `ip:port` within `deadline`.
    pub async fn open(ip: &str, port: u16, deadline: Duration) -> ModbusResult<Self> {
        let peer = format!("{}:{}", ip, port);
        let stream = match timeout(deadline, TcpStream::connect(peer.as_str())).await {
            Err(_) => {
                return Err(ModbusError::timeout(
                    format!("connect to {}", peer),
                    deadline.as_millis() as u64,
                ))
            }
            Ok(Err(e)) => return Err(ModbusError::io(format!("connect to {}: {}", peer, e))),
            Ok(Ok(stream)) => stream,
        };
        stream.set_nodelay(true).ok();
        debug!("TCP transport open: {}", peer);
        Ok(Self { stream, peer })
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn write_all(&mut self, bytes: &[u8]) -> ModbusResult<()> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn read_exact(&mut self, n: usize, deadline: Duration) -> ModbusResult<Vec<u8>> {
        read_exact_from(&mut self.stream, n, deadline).await
    }

    async fn read_until_idle(&mut self, deadline: Duration) -> ModbusResult<Vec<u8>> {
        drain_until_idle(&mut self.stream, deadline).await
    }

    async fn close(&mut self) -> ModbusResult<()> {
        debug!("TCP transport close: {}", self.peer);
        match self.stream.shutdown().await {
            Ok(()) => Ok(()),
            // A peer that is already gone is not an error worth reporting.
            Err(e) if e.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Serial port transport for Modbus RTU.
pub struct SerialTransport {
    port: SerialStream,
    name: String,
}

impl SerialTransport {
    /// Open `name` with the given line parameters.
    pub fn open(
        name: &str,
        baud: u32,
        data_bits: tokio_serial::DataBits,
        stop_bits: tokio_serial::StopBits,
        parity: tokio_serial::Parity,
    ) -> ModbusResult<Self> {
        let port = tokio_serial::new(name, baud)
            .data_bits(data_bits)
            .stop_bits(stop_bits)
            .parity(parity)
            .open_native_async()
            .map_err(|e| ModbusError::io(format!("open serial port {}: {}", name, e)))?;
        debug!("serial transport open: {} @ {} baud", name, baud);
        Ok(Self { port, name: name.to_string() })
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn write_all(&mut self, bytes: &[u8]) -> ModbusResult<()> {
        self.port.write_all(bytes).await?;
        self.port.flush().await?;
        Ok(())
    }

    async fn read_exact(&mut self, n: usize, deadline: Duration) -> ModbusResult<Vec<u8>> {
        read_exact_from(&mut self.port, n, deadline).await
    }

    async fn read_until_idle(&mut self, deadline: Duration) -> ModbusResult<Vec<u8>> {
        drain_until_idle(&mut self.port, deadline).await
    }

    async fn close(&mut self) -> ModbusResult<()> {
        debug!("serial transport close: {}", self.name);
        // The port handle is released on drop; flushing is the only step
        // that can fail here.
        match self.port.flush().await {
            Ok(()) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
