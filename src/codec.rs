//! Modbus frame construction and parsing.
//!
//! Pure functions shared by every device: MBAP-wrapped TCP frames, RTU
//! frames with a CRC-16 trailer, and the process-wide transaction id
//! counter. The codec builds requests and validates response envelopes; it
//! deliberately does not interpret the PDU payload, so Modbus exception
//! responses (function code with the high bit set) pass through to the
//! caller untouched.

use std::sync::atomic::{AtomicU16, Ordering};

use crc::{Crc, CRC_16_MODBUS};

use crate::error::{ModbusError, ModbusResult};
use crate::MAX_TCP_FRAME_SIZE;

/// Size of the MBAP header (transaction id, protocol id, length, unit id).
pub const MBAP_HEADER_LEN: usize = 7;

/// CRC calculator for RTU framing (poly 0xA001 reflected, init 0xFFFF).
const CRC_MODBUS: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Process-wide Modbus TCP transaction id counter.
///
/// Allocation is a single wait-free `fetch_add`; the counter wraps modulo
/// 2^16, so concurrently issued ids stay unique until 65 536 issuances
/// separate them.
static TRANSACTION_ID: AtomicU16 = AtomicU16::new(0);

/// Draw the next transaction id.
pub fn next_transaction_id() -> u16 {
    TRANSACTION_ID.fetch_add(1, Ordering::Relaxed)
}

/// Response framing variant spoken on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Framing {
    /// 7-byte MBAP header followed by the PDU (Modbus TCP).
    Mbap,
    /// Slave id + PDU + CRC-16, delimited by line silence (Modbus RTU).
    Rtu,
}

/// Compute the Modbus CRC-16 of `data`.
pub fn crc16(data: &[u8]) -> u16 {
    CRC_MODBUS.checksum(data)
}

/// Check the trailing little-endian CRC of a complete RTU frame.
pub fn validate_crc(frame: &[u8]) -> ModbusResult<()> {
    if frame.len() < 4 {
        return Err(ModbusError::protocol(format!(
            "RTU frame too short for CRC: {} bytes",
            frame.len()
        )));
    }
    let split = frame.len() - 2;
    let expected = crc16(&frame[..split]);
    let actual = u16::from_le_bytes([frame[split], frame[split + 1]]);
    if expected != actual {
        return Err(ModbusError::crc_mismatch(expected, actual));
    }
    Ok(())
}

/// Build a Modbus TCP request frame for the common 4-field request layout
/// (`FC | address | quantity`, function codes 0x01–0x06).
///
/// The transaction id is drawn from the shared counter; the protocol id is
/// always zero and the declared length is 6 (unit id + 5-byte PDU).
pub fn build_tcp_frame(slave: u8, function: u8, address: u16, quantity: u16) -> Vec<u8> {
    let tid = next_transaction_id();
    let mut frame = Vec::with_capacity(12);
    frame.extend_from_slice(&tid.to_be_bytes());
    frame.extend_from_slice(&0u16.to_be_bytes());
    frame.extend_from_slice(&6u16.to_be_bytes());
    frame.push(slave);
    frame.push(function);
    frame.extend_from_slice(&address.to_be_bytes());
    frame.extend_from_slice(&quantity.to_be_bytes());
    frame
}

/// Build a Modbus RTU request frame for the common 4-field request layout,
/// CRC appended low byte first.
pub fn build_rtu_frame(slave: u8, function: u8, address: u16, quantity: u16) -> Vec<u8> {
    let mut frame = Vec::with_capacity(8);
    frame.push(slave);
    frame.push(function);
    frame.extend_from_slice(&address.to_be_bytes());
    frame.extend_from_slice(&quantity.to_be_bytes());
    let crc = crc16(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

/// Build a request in whichever framing the connection speaks.
pub fn build_request(framing: Framing, slave: u8, function: u8, address: u16, quantity: u16) -> Vec<u8> {
    match framing {
        Framing::Mbap => build_tcp_frame(slave, function, address, quantity),
        Framing::Rtu => build_rtu_frame(slave, function, address, quantity),
    }
}

/// Parsed MBAP header of a Modbus TCP response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    pub transaction_id: u16,
    pub protocol_id: u16,
    /// Byte count following the length field (unit id + PDU).
    pub length: u16,
    pub unit_id: u8,
}

impl MbapHeader {
    /// Parse and validate the 7 header bytes of a response.
    ///
    /// Rejects a non-zero protocol id and a declared length of zero or
    /// beyond the TCP frame cap.
    pub fn parse(bytes: &[u8; MBAP_HEADER_LEN]) -> ModbusResult<Self> {
        let header = Self {
            transaction_id: u16::from_be_bytes([bytes[0], bytes[1]]),
            protocol_id: u16::from_be_bytes([bytes[2], bytes[3]]),
            length: u16::from_be_bytes([bytes[4], bytes[5]]),
            unit_id: bytes[6],
        };
        if header.protocol_id != 0 {
            return Err(ModbusError::protocol(format!(
                "unexpected MBAP protocol id {:#06X}",
                header.protocol_id
            )));
        }
        if header.length == 0 || header.length as usize > MAX_TCP_FRAME_SIZE {
            return Err(ModbusError::protocol(format!(
                "MBAP length {} outside 1..={}",
                header.length, MAX_TCP_FRAME_SIZE
            )));
        }
        Ok(header)
    }

    /// Bytes still to read after the header (the PDU, unit id excluded).
    pub fn remaining(&self) -> usize {
        self.length as usize - 1
    }
}

/// The read-class Modbus function codes the parameterized request layout
/// covers. `send` accepts any raw function code; this enum exists for
/// callers who prefer names over numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ModbusFunction {
    /// Read Coils (0x01)
    ReadCoils = 0x01,
    /// Read Discrete Inputs (0x02)
    ReadDiscreteInputs = 0x02,
    /// Read Holding Registers (0x03)
    ReadHoldingRegisters = 0x03,
    /// Read Input Registers (0x04)
    ReadInputRegisters = 0x04,
}

impl ModbusFunction {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(ModbusFunction::ReadCoils),
            0x02 => Some(ModbusFunction::ReadDiscreteInputs),
            0x03 => Some(ModbusFunction::ReadHoldingRegisters),
            0x04 => Some(ModbusFunction::ReadInputRegisters),
            _ => None,
        }
    }

    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// Helpers for picking apart raw response frames.
///
/// Devices hand responses back unparsed; these functions strip the framing
/// envelope and decode the common register/bit payloads for callers that
/// want values instead of bytes.
pub mod pdu {
    use super::*;

    /// Slice the PDU (function code onward) out of a raw response frame.
    ///
    /// For MBAP frames this is everything past the 7-byte header; for RTU
    /// frames everything between the slave id and the CRC trailer.
    pub fn from_response(framing: Framing, response: &[u8]) -> ModbusResult<&[u8]> {
        match framing {
            Framing::Mbap => {
                if response.len() <= MBAP_HEADER_LEN {
                    return Err(ModbusError::protocol(format!(
                        "MBAP response too short: {} bytes",
                        response.len()
                    )));
                }
                Ok(&response[MBAP_HEADER_LEN..])
            }
            Framing::Rtu => {
                if response.len() < 4 {
                    return Err(ModbusError::protocol(format!(
                        "RTU response too short: {} bytes",
                        response.len()
                    )));
                }
                Ok(&response[1..response.len() - 2])
            }
        }
    }

    /// Whether a PDU is a Modbus exception response, and its code.
    pub fn exception_code(pdu: &[u8]) -> Option<u8> {
        if pdu.len() >= 2 && pdu[0] & 0x80 != 0 {
            Some(pdu[1])
        } else {
            None
        }
    }

    /// Decode a read-registers response PDU (`FC | byte count | data`)
    /// into register values.
    pub fn registers(pdu: &[u8]) -> ModbusResult<Vec<u16>> {
        if let Some(code) = exception_code(pdu) {
            return Err(ModbusError::protocol(format!(
                "exception response: function {:#04X}, code {:#04X}",
                pdu[0] & 0x7F,
                code
            )));
        }
        if pdu.len() < 2 {
            return Err(ModbusError::protocol("register response PDU too short"));
        }
        let byte_count = pdu[1] as usize;
        if byte_count % 2 != 0 || pdu.len() < 2 + byte_count {
            return Err(ModbusError::protocol(format!(
                "register response byte count {} inconsistent with PDU length {}",
                byte_count,
                pdu.len()
            )));
        }
        Ok(pdu[2..2 + byte_count]
            .chunks(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect())
    }

    /// Decode a read-bits response PDU into `count` booleans, LSB first.
    pub fn bits(pdu: &[u8], count: usize) -> ModbusResult<Vec<bool>> {
        if let Some(code) = exception_code(pdu) {
            return Err(ModbusError::protocol(format!(
                "exception response: function {:#04X}, code {:#04X}",
                pdu[0] & 0x7F,
                code
            )));
        }
        if pdu.len() < 2 {
            return Err(ModbusError::protocol("bit response PDU too short"));
        }
        let byte_count = pdu[1] as usize;
        if pdu.len() < 2 + byte_count || byte_count * 8 < count {
            return Err(ModbusError::protocol(format!(
                "bit response byte count {} too small for {} bits",
                byte_count, count
            )));
        }
        let data = &pdu[2..2 + byte_count];
        Ok((0..count).map(|i| data[i / 8] & (1 << (i % 8)) != 0).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc_known_vectors() {
        // Wire frames end with the low CRC byte first: 01 03 00 00 00 02
        // travels as ... C4 0B.
        assert_eq!(crc16(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x02]), 0x0BC4);
        assert_eq!(crc16(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x01]), 0x0A84);
        assert_eq!(crc16(&[0x01, 0x03, 0x02, 0x00, 0x01]), 0x8479);
    }

    #[test]
    fn crc_corner_cases() {
        // All-zero payload still has a well-defined checksum.
        let zeros = [0u8; 6];
        let crc = crc16(&zeros);
        let mut frame = zeros.to_vec();
        frame.extend_from_slice(&crc.to_le_bytes());
        assert!(validate_crc(&frame).is_ok());

        // Trailing 0x00 and high-bit-heavy payloads.
        for payload in [&[0x11u8, 0x22, 0x00][..], &[0x80, 0x00, 0x80, 0x00][..]] {
            let mut frame = payload.to_vec();
            frame.extend_from_slice(&crc16(payload).to_le_bytes());
            assert!(validate_crc(&frame).is_ok());
        }
    }

    #[test]
    fn crc_mismatch_detected() {
        let mut frame = build_rtu_frame(1, 3, 0, 1);
        let n = frame.len();
        frame[n - 1] ^= 0xFF;
        assert!(matches!(validate_crc(&frame), Err(ModbusError::CrcMismatch { .. })));

        assert!(validate_crc(&[0x01, 0x03]).is_err());
    }

    #[test]
    fn rtu_frame_layout() {
        let frame = build_rtu_frame(0x01, 0x03, 0x0000, 0x0001);
        assert_eq!(frame, vec![0x01, 0x03, 0x00, 0x00, 0x00, 0x01, 0x84, 0x0A]);
        assert!(validate_crc(&frame).is_ok());
    }

    #[test]
    fn tcp_frame_layout() {
        let frame = build_tcp_frame(0x11, 0x04, 0x1234, 0x0002);
        assert_eq!(frame.len(), 12);
        // Protocol id and length fields.
        assert_eq!(&frame[2..6], &[0x00, 0x00, 0x00, 0x06]);
        assert_eq!(frame[6], 0x11);
        assert_eq!(&frame[7..12], &[0x04, 0x12, 0x34, 0x00, 0x02]);

        // Transaction ids advance monotonically; sibling tests may draw a
        // few ids of their own in between.
        let next = build_tcp_frame(0x11, 0x04, 0x1234, 0x0002);
        let a = u16::from_be_bytes([frame[0], frame[1]]);
        let b = u16::from_be_bytes([next[0], next[1]]);
        let delta = b.wrapping_sub(a);
        assert!((1..64).contains(&delta), "unexpected id delta {}", delta);
    }

    #[test]
    fn transaction_id_wraps_after_full_cycle() {
        let first = next_transaction_id();
        for _ in 0..65_535 {
            next_transaction_id();
        }
        // 65,536 issuances bring the counter back to where it started,
        // give or take ids drawn concurrently by sibling tests.
        let wrapped = next_transaction_id();
        assert!(wrapped.wrapping_sub(first) < 64);
    }

    #[test]
    fn transaction_ids_unique_across_threads() {
        let handles: Vec<_> = (0..4)
            .map(|_| std::thread::spawn(|| (0..1024).map(|_| next_transaction_id()).collect::<Vec<u16>>()))
            .collect();
        let mut seen = std::collections::HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "transaction id {} issued twice", id);
            }
        }
    }

    #[test]
    fn mbap_header_validation() {
        let header = MbapHeader::parse(&[0x00, 0x2A, 0x00, 0x00, 0x00, 0x05, 0x01]).unwrap();
        assert_eq!(header.transaction_id, 0x2A);
        assert_eq!(header.protocol_id, 0);
        assert_eq!(header.length, 5);
        assert_eq!(header.unit_id, 1);
        assert_eq!(header.remaining(), 4);

        // Non-zero protocol id.
        assert!(MbapHeader::parse(&[0x00, 0x01, 0x00, 0x01, 0x00, 0x05, 0x01]).is_err());
        // Length zero and length beyond the cap.
        assert!(MbapHeader::parse(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x01]).is_err());
        assert!(MbapHeader::parse(&[0x00, 0x01, 0x00, 0x00, 0x01, 0x05, 0x01]).is_err());
    }

    #[test]
    fn request_dispatch_by_framing() {
        let rtu = build_request(Framing::Rtu, 1, 3, 0, 1);
        assert_eq!(rtu.len(), 8);
        let tcp = build_request(Framing::Mbap, 1, 3, 0, 1);
        assert_eq!(tcp.len(), 12);
    }

    #[test]
    fn function_code_round_trip() {
        assert_eq!(ModbusFunction::from_u8(0x03), Some(ModbusFunction::ReadHoldingRegisters));
        assert_eq!(ModbusFunction::ReadHoldingRegisters.to_u8(), 0x03);
        assert_eq!(ModbusFunction::from_u8(0x10), None);
    }

    #[test]
    fn pdu_extraction_per_framing() {
        let mbap = [0x00, 0x01, 0x00, 0x00, 0x00, 0x05, 0x01, 0x03, 0x02, 0x00, 0x2A];
        assert_eq!(pdu::from_response(Framing::Mbap, &mbap).unwrap(), &[0x03, 0x02, 0x00, 0x2A]);

        let rtu = [0x01, 0x03, 0x02, 0x00, 0x01, 0x79, 0x84];
        assert_eq!(pdu::from_response(Framing::Rtu, &rtu).unwrap(), &[0x03, 0x02, 0x00, 0x01]);

        assert!(pdu::from_response(Framing::Mbap, &[0x00; 7]).is_err());
        assert!(pdu::from_response(Framing::Rtu, &[0x01, 0x03]).is_err());
    }

    #[test]
    fn pdu_register_decoding() {
        let registers = pdu::registers(&[0x03, 0x04, 0x12, 0x34, 0x56, 0x78]).unwrap();
        assert_eq!(registers, vec![0x1234, 0x5678]);

        // Exception responses decode to an error, never to values.
        assert!(pdu::registers(&[0x83, 0x02]).is_err());
        assert_eq!(pdu::exception_code(&[0x83, 0x02]), Some(0x02));
        assert_eq!(pdu::exception_code(&[0x03, 0x02, 0x00, 0x01]), None);

        // Odd byte counts and truncated payloads are protocol errors.
        assert!(pdu::registers(&[0x03, 0x03, 0x00, 0x01, 0x02]).is_err());
        assert!(pdu::registers(&[0x03, 0x04, 0x00, 0x01]).is_err());
    }

    #[test]
    fn pdu_bit_decoding() {
        let bits = pdu::bits(&[0x01, 0x01, 0b0000_0101], 3).unwrap();
        assert_eq!(bits, vec![true, false, true]);
        assert!(pdu::bits(&[0x01, 0x01, 0x00], 9).is_err());
    }
}
