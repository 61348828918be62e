//! Error handling for the modpool library.
//!
//! Every fallible operation in the crate returns [`ModbusResult`]. The
//! variants of [`ModbusError`] map one-to-one onto the failure classes a
//! caller can meaningfully react to: deadline expiry, broken transports,
//! malformed frames, state violations and bad configuration.
//!
//! Errors carry a human-readable message that includes the device id where
//! one is known, so a supervisor log line is enough to identify the
//! offending connection.

use thiserror::Error;

/// Result type alias used throughout the crate.
pub type ModbusResult<T> = Result<T, ModbusError>;

/// All error conditions surfaced by the library.
#[derive(Error, Debug, Clone)]
pub enum ModbusError {
    /// I/O failure on a transport (socket or serial port): broken pipe,
    /// short read, port unavailable, OS error.
    #[error("I/O error: {message}")]
    Io { message: String },

    /// A deadline elapsed while connecting or waiting for a response.
    #[error("timeout after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Malformed frame: bad MBAP header, oversized declared length, or a
    /// frame that cannot be parsed at all.
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// RTU CRC trailer did not match the computed checksum.
    #[error("CRC mismatch: expected {expected:04X}, got {actual:04X}")]
    CrcMismatch { expected: u16, actual: u16 },

    /// The operation requires a connected device.
    #[error("device not connected: {device_id}")]
    NotConnected { device_id: String },

    /// The device implementation cannot service the requested config kind.
    #[error("unsupported device kind {requested} (supported: {supported})")]
    UnsupportedKind { requested: String, supported: String },

    /// Missing or invalid fields in a [`DeviceConfig`](crate::DeviceConfig).
    #[error("configuration error: {message}")]
    Config { message: String },
}

impl ModbusError {
    /// New I/O error from any displayable source.
    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io { message: message.into() }
    }

    /// New timeout error naming the operation that missed its deadline.
    pub fn timeout<S: Into<String>>(operation: S, timeout_ms: u64) -> Self {
        Self::Timeout { operation: operation.into(), timeout_ms }
    }

    /// New protocol error.
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol { message: message.into() }
    }

    /// New CRC mismatch error.
    pub fn crc_mismatch(expected: u16, actual: u16) -> Self {
        Self::CrcMismatch { expected, actual }
    }

    /// New not-connected error for the given device.
    pub fn not_connected<S: Into<String>>(device_id: S) -> Self {
        Self::NotConnected { device_id: device_id.into() }
    }

    /// New unsupported-kind error.
    pub fn unsupported_kind<S: Into<String>, T: Into<String>>(requested: S, supported: T) -> Self {
        Self::UnsupportedKind { requested: requested.into(), supported: supported.into() }
    }

    /// New configuration error.
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config { message: message.into() }
    }

    /// Whether retrying the failed operation could plausibly succeed.
    ///
    /// Transport-level failures are transient by nature; protocol and
    /// configuration failures are not.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Io { .. } | Self::Timeout { .. } | Self::NotConnected { .. })
    }

    /// Whether the error originated below the Modbus application layer.
    pub fn is_transport_error(&self) -> bool {
        matches!(self, Self::Io { .. } | Self::Timeout { .. })
    }

    /// Whether the error is a Modbus framing violation.
    pub fn is_protocol_error(&self) -> bool {
        matches!(self, Self::Protocol { .. } | Self::CrcMismatch { .. })
    }
}

impl From<std::io::Error> for ModbusError {
    fn from(err: std::io::Error) -> Self {
        Self::io(err.to_string())
    }
}

/// A bare elapsed error carries no operation context; callers that know the
/// deadline should build the timeout with [`ModbusError::timeout`] instead.
impl From<tokio::time::error::Elapsed> for ModbusError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::timeout("operation", 0)
    }
}

impl From<tokio_serial::Error> for ModbusError {
    fn from(err: tokio_serial::Error) -> Self {
        Self::io(format!("serial port: {}", err))
    }
}

impl From<serde_json::Error> for ModbusError {
    fn from(err: serde_json::Error) -> Self {
        Self::config(format!("JSON: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        let err = ModbusError::timeout("read response", 3000);
        assert!(err.is_recoverable());
        assert!(err.is_transport_error());
        assert!(!err.is_protocol_error());

        let err = ModbusError::crc_mismatch(0x0BC4, 0xFFFF);
        assert!(!err.is_recoverable());
        assert!(err.is_protocol_error());

        let err = ModbusError::config("timeout must be at least 1ms");
        assert!(!err.is_recoverable());
        assert!(!err.is_transport_error());
    }

    #[test]
    fn display_carries_context() {
        let err = ModbusError::not_connected("TCP:10.0.0.7:502");
        assert!(err.to_string().contains("TCP:10.0.0.7:502"));

        let err = ModbusError::timeout("connect", 1500);
        let msg = err.to_string();
        assert!(msg.contains("1500ms"));
        assert!(msg.contains("connect"));
    }

    #[test]
    fn io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe gone");
        let err: ModbusError = io.into();
        assert!(matches!(err, ModbusError::Io { .. }));
        assert!(err.to_string().contains("pipe gone"));
    }
}
