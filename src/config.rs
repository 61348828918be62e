//! Device descriptors.
//!
//! A [`DeviceConfig`] fully identifies and parameterizes one Modbus device:
//! how to reach it (TCP socket or serial line), which framing it speaks, and
//! the deadline applied to connect and per-request reads. Two configs with
//! the same [`device_id`](DeviceConfig::device_id) address the same logical
//! device and are deduplicated by the pool.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::Framing;
use crate::error::{ModbusError, ModbusResult};

/// Default connect/request timeout in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 3000;

/// How a device is reached and framed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceKind {
    /// Modbus TCP: socket transport, MBAP framing.
    Tcp,
    /// Modbus RTU: serial transport, CRC framing.
    Rtu,
    /// RTU framing tunneled over a TCP socket (no MBAP header).
    TcpRtu,
}

impl DeviceKind {
    /// The response framing this kind uses on the wire.
    pub fn framing(&self) -> Framing {
        match self {
            DeviceKind::Tcp => Framing::Mbap,
            DeviceKind::Rtu | DeviceKind::TcpRtu => Framing::Rtu,
        }
    }

    /// Canonical id prefix for this kind.
    pub fn prefix(&self) -> &'static str {
        match self {
            DeviceKind::Tcp => "TCP",
            DeviceKind::Rtu => "RTU",
            DeviceKind::TcpRtu => "TCP_RTU",
        }
    }
}

impl std::fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.prefix())
    }
}

/// Number of data bits on a serial line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SerialDataBits {
    Five,
    Six,
    Seven,
    Eight,
}

/// Number of stop bits on a serial line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SerialStopBits {
    One,
    Two,
}

/// Parity scheme on a serial line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SerialParity {
    None,
    Odd,
    Even,
}

impl From<SerialDataBits> for tokio_serial::DataBits {
    fn from(bits: SerialDataBits) -> Self {
        match bits {
            SerialDataBits::Five => tokio_serial::DataBits::Five,
            SerialDataBits::Six => tokio_serial::DataBits::Six,
            SerialDataBits::Seven => tokio_serial::DataBits::Seven,
            SerialDataBits::Eight => tokio_serial::DataBits::Eight,
        }
    }
}

impl From<SerialStopBits> for tokio_serial::StopBits {
    fn from(bits: SerialStopBits) -> Self {
        match bits {
            SerialStopBits::One => tokio_serial::StopBits::One,
            SerialStopBits::Two => tokio_serial::StopBits::Two,
        }
    }
}

impl From<SerialParity> for tokio_serial::Parity {
    fn from(parity: SerialParity) -> Self {
        match parity {
            SerialParity::None => tokio_serial::Parity::None,
            SerialParity::Odd => tokio_serial::Parity::Odd,
            SerialParity::Even => tokio_serial::Parity::Even,
        }
    }
}

/// Transport endpoint, discriminated by device kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Endpoint {
    /// Modbus TCP endpoint.
    Tcp { ip: String, port: u16 },
    /// Serial line endpoint.
    Serial {
        port: String,
        baud: u32,
        data_bits: SerialDataBits,
        stop_bits: SerialStopBits,
        parity: SerialParity,
    },
    /// RTU-over-TCP endpoint.
    TcpRtu { ip: String, port: u16 },
}

/// Immutable descriptor of one Modbus device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Where and how to reach the device.
    pub endpoint: Endpoint,
    /// Deadline for connect and for each response read.
    pub timeout: Duration,
}

impl DeviceConfig {
    /// Modbus TCP config with the default timeout.
    pub fn tcp<S: Into<String>>(ip: S, port: u16) -> Self {
        Self {
            endpoint: Endpoint::Tcp { ip: ip.into(), port },
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
        }
    }

    /// Modbus RTU config with 8N1 line settings and the default timeout.
    pub fn rtu<S: Into<String>>(port: S, baud: u32) -> Self {
        Self {
            endpoint: Endpoint::Serial {
                port: port.into(),
                baud,
                data_bits: SerialDataBits::Eight,
                stop_bits: SerialStopBits::One,
                parity: SerialParity::None,
            },
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
        }
    }

    /// RTU-over-TCP config with the default timeout.
    pub fn tcp_rtu<S: Into<String>>(ip: S, port: u16) -> Self {
        Self {
            endpoint: Endpoint::TcpRtu { ip: ip.into(), port },
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
        }
    }

    /// Replace the timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Replace the serial line parameters. No-op for TCP endpoints.
    pub fn with_line_settings(
        mut self,
        data_bits: SerialDataBits,
        stop_bits: SerialStopBits,
        parity: SerialParity,
    ) -> Self {
        if let Endpoint::Serial {
            data_bits: ref mut d,
            stop_bits: ref mut s,
            parity: ref mut p,
            ..
        } = self.endpoint
        {
            *d = data_bits;
            *s = stop_bits;
            *p = parity;
        }
        self
    }

    /// Parse a config from its JSON representation.
    pub fn from_json(json: &str) -> ModbusResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// The device kind implied by the endpoint.
    pub fn kind(&self) -> DeviceKind {
        match self.endpoint {
            Endpoint::Tcp { .. } => DeviceKind::Tcp,
            Endpoint::Serial { .. } => DeviceKind::Rtu,
            Endpoint::TcpRtu { .. } => DeviceKind::TcpRtu,
        }
    }

    /// Canonical registry key for this device.
    ///
    /// `"TCP:<ip>:<port>"`, `"RTU:<port>"` or `"TCP_RTU:<ip>:<port>"`. Two
    /// configs with equal ids address the same logical device.
    pub fn device_id(&self) -> String {
        match &self.endpoint {
            Endpoint::Tcp { ip, port } => format!("TCP:{}:{}", ip, port),
            Endpoint::Serial { port, .. } => format!("RTU:{}", port),
            Endpoint::TcpRtu { ip, port } => format!("TCP_RTU:{}:{}", ip, port),
        }
    }

    /// Check the config for fields the transports cannot work with.
    pub fn validate(&self) -> ModbusResult<()> {
        if self.timeout < Duration::from_millis(1) {
            return Err(ModbusError::config("timeout must be at least 1ms"));
        }
        match &self.endpoint {
            Endpoint::Tcp { ip, .. } | Endpoint::TcpRtu { ip, .. } => {
                if ip.is_empty() {
                    return Err(ModbusError::config("TCP endpoint requires a host"));
                }
            }
            Endpoint::Serial { port, baud, .. } => {
                if port.is_empty() {
                    return Err(ModbusError::config("serial endpoint requires a port name"));
                }
                if *baud == 0 {
                    return Err(ModbusError::config("baud rate must be non-zero"));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_id_grammar() {
        assert_eq!(DeviceConfig::tcp("192.168.1.10", 502).device_id(), "TCP:192.168.1.10:502");
        assert_eq!(DeviceConfig::rtu("/dev/ttyUSB0", 9600).device_id(), "RTU:/dev/ttyUSB0");
        assert_eq!(DeviceConfig::tcp_rtu("10.0.0.5", 502).device_id(), "TCP_RTU:10.0.0.5:502");
    }

    #[test]
    fn same_endpoint_same_id() {
        let a = DeviceConfig::tcp("127.0.0.1", 5502);
        let b = DeviceConfig::tcp("127.0.0.1", 5502).with_timeout(Duration::from_secs(1));
        assert_eq!(a.device_id(), b.device_id());

        // A hostname alias is a distinct id even if it resolves to the same
        // address; the pool treats them as two devices.
        let c = DeviceConfig::tcp("localhost", 5502);
        assert_ne!(a.device_id(), c.device_id());
    }

    #[test]
    fn kind_and_framing() {
        assert_eq!(DeviceConfig::tcp("h", 502).kind(), DeviceKind::Tcp);
        assert_eq!(DeviceConfig::rtu("p", 9600).kind(), DeviceKind::Rtu);
        assert_eq!(DeviceConfig::tcp_rtu("h", 502).kind(), DeviceKind::TcpRtu);

        assert_eq!(DeviceKind::Tcp.framing(), Framing::Mbap);
        assert_eq!(DeviceKind::Rtu.framing(), Framing::Rtu);
        assert_eq!(DeviceKind::TcpRtu.framing(), Framing::Rtu);
    }

    #[test]
    fn validation() {
        assert!(DeviceConfig::tcp("10.0.0.1", 502).validate().is_ok());
        assert!(DeviceConfig::tcp("", 502).validate().is_err());
        assert!(DeviceConfig::rtu("", 9600).validate().is_err());
        assert!(DeviceConfig::rtu("/dev/ttyS0", 0).validate().is_err());

        let zero = DeviceConfig::tcp("10.0.0.1", 502).with_timeout(Duration::ZERO);
        assert!(matches!(zero.validate(), Err(ModbusError::Config { .. })));
    }

    #[test]
    fn json_round_trip() {
        let config = DeviceConfig::rtu("/dev/ttyUSB1", 19200).with_line_settings(
            SerialDataBits::Seven,
            SerialStopBits::Two,
            SerialParity::Even,
        );
        let json = serde_json::to_string(&config).unwrap();
        let parsed = DeviceConfig::from_json(&json).unwrap();
        assert_eq!(parsed, config);

        assert!(DeviceConfig::from_json("{\"endpoint\":null}").is_err());
    }
}
