//! Modbus RTU framing and the serial register bus.
//!
//! Request/response framing for function 0x03 (read holding registers) with
//! CRC-16/MODBUS appended little-endian. [`SerialRtuBus`] drives a serial
//! port; the [`RegisterBus`] trait is the seam that lets the client run
//! against mock buses in tests.

use std::io::Read;
use std::io::Write;
use std::time::Duration;

use crc::{Crc, CRC_16_MODBUS};
use serialport::{ClearBuffer, DataBits, Parity, SerialPort, StopBits};
use thiserror::Error;
use tracing::trace;

/// Modbus function code for reading holding registers.
pub const FUNCTION_READ_HOLDING: u8 = 0x03;

/// Set on the echoed function code when the device reports an exception.
const EXCEPTION_FLAG: u8 = 0x80;

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Errors raised by the register transport.
///
/// These never cross the [`crate::hs6602::Hs6602`] client boundary during
/// fix reads; the client absorbs them into absent fields after its retry
/// budget is spent.
#[derive(Error, Debug)]
pub enum TransportError {
    /// Serial port could not be opened or configured.
    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Read/write failure on the open port.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// No (complete) response within the port timeout.
    #[error("response timed out")]
    Timeout,

    /// Response CRC did not match the frame contents.
    #[error("CRC mismatch: computed {computed:#06x}, received {received:#06x}")]
    Crc { computed: u16, received: u16 },

    /// Device answered with a Modbus exception frame.
    #[error("device exception: code {0:#04x}")]
    Exception(u8),

    /// Response frame was malformed or echoed the wrong slave/function.
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
}

pub type TransportResult<T> = Result<T, TransportError>;

/// Read access to a device's holding-register space.
pub trait RegisterBus: Send {
    /// Read `count` consecutive 16-bit registers starting at `start`.
    fn read_registers(&mut self, start: u16, count: u16) -> TransportResult<Vec<u16>>;
}

/// CRC-16/MODBUS over a frame prefix.
pub fn compute_crc(data: &[u8]) -> u16 {
    CRC16.checksum(data)
}

/// Build a read-holding-registers request frame.
pub fn build_read_request(slave: u8, start: u16, count: u16) -> [u8; 8] {
    let mut frame = [0u8; 8];
    frame[0] = slave;
    frame[1] = FUNCTION_READ_HOLDING;
    frame[2..4].copy_from_slice(&start.to_be_bytes());
    frame[4..6].copy_from_slice(&count.to_be_bytes());
    let crc = compute_crc(&frame[..6]);
    frame[6..8].copy_from_slice(&crc.to_le_bytes());
    frame
}

/// Parse a complete response frame for a `count`-register read.
///
/// Validates the CRC first (a corrupted frame must not be interpreted as an
/// exception), then the slave echo, function code and byte count. Register
/// values use big-endian byte order within the payload.
pub fn parse_read_response(slave: u8, count: u16, frame: &[u8]) -> TransportResult<Vec<u16>> {
    if frame.len() < 5 {
        return Err(TransportError::UnexpectedResponse(format!(
            "frame too short: {} bytes",
            frame.len()
        )));
    }

    let data_end = frame.len() - 2;
    let received = u16::from_le_bytes([frame[data_end], frame[data_end + 1]]);
    let computed = compute_crc(&frame[..data_end]);
    if computed != received {
        return Err(TransportError::Crc { computed, received });
    }

    if frame[0] != slave {
        return Err(TransportError::UnexpectedResponse(format!(
            "slave echo {} (expected {})",
            frame[0], slave
        )));
    }

    if frame[1] == (FUNCTION_READ_HOLDING | EXCEPTION_FLAG) {
        return Err(TransportError::Exception(frame[2]));
    }
    if frame[1] != FUNCTION_READ_HOLDING {
        return Err(TransportError::UnexpectedResponse(format!(
            "function echo {:#04x}",
            frame[1]
        )));
    }

    let byte_count = frame[2] as usize;
    if byte_count != count as usize * 2 || frame.len() != 5 + byte_count {
        return Err(TransportError::UnexpectedResponse(format!(
            "byte count {} for {} requested registers",
            byte_count, count
        )));
    }

    Ok(frame[3..3 + byte_count]
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect())
}

/// Modbus RTU master over a serial port.
pub struct SerialRtuBus {
    port: Box<dyn SerialPort>,
    slave: u8,
}

impl SerialRtuBus {
    /// Open `path` at `baud` (8N1) with the given per-read timeout.
    pub fn open(path: &str, baud: u32, slave: u8, timeout: Duration) -> TransportResult<Self> {
        let port = serialport::new(path, baud)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .timeout(timeout)
            .open()?;
        Ok(Self { port, slave })
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> TransportResult<()> {
        self.port.read_exact(buf).map_err(|err| {
            if err.kind() == std::io::ErrorKind::TimedOut {
                TransportError::Timeout
            } else {
                TransportError::Io(err)
            }
        })
    }
}

impl RegisterBus for SerialRtuBus {
    fn read_registers(&mut self, start: u16, count: u16) -> TransportResult<Vec<u16>> {
        // Stale bytes from an aborted transaction would desynchronize
        // framing, so the input buffer is cleared before each request.
        self.port.clear(ClearBuffer::Input)?;

        let request = build_read_request(self.slave, start, count);
        trace!(start = %format_args!("{start:#06x}"), count, "RTU request");
        self.port.write_all(&request)?;
        self.port.flush()?;

        let mut header = [0u8; 3];
        self.read_exact(&mut header)?;

        let mut frame = header.to_vec();
        let remaining = if header[1] & EXCEPTION_FLAG != 0 {
            2 // CRC of the exception frame; the code is already in header[2]
        } else {
            header[2] as usize + 2
        };
        let mut rest = vec![0u8; remaining];
        self.read_exact(&mut rest)?;
        frame.extend_from_slice(&rest);

        parse_read_response(self.slave, count, &frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response_frame(slave: u8, values: &[u16]) -> Vec<u8> {
        let mut frame = vec![slave, FUNCTION_READ_HOLDING, (values.len() * 2) as u8];
        for value in values {
            frame.extend_from_slice(&value.to_be_bytes());
        }
        let crc = compute_crc(&frame);
        frame.extend_from_slice(&crc.to_le_bytes());
        frame
    }

    #[test]
    fn request_frame_matches_reference() {
        // Canonical example: slave 1, register 0, count 1.
        let frame = build_read_request(1, 0x0000, 1);
        assert_eq!(frame, [0x01, 0x03, 0x00, 0x00, 0x00, 0x01, 0x84, 0x0A]);
    }

    #[test]
    fn request_frame_encodes_address_and_count() {
        let frame = build_read_request(0x11, 0x006B, 3);
        assert_eq!(&frame[..6], &[0x11, 0x03, 0x00, 0x6B, 0x00, 0x03]);
        let crc = compute_crc(&frame[..6]);
        assert_eq!(&frame[6..], &crc.to_le_bytes());
    }

    #[test]
    fn parse_single_register() {
        let frame = response_frame(1, &[0x0010]);
        let values = parse_read_response(1, 1, &frame).unwrap();
        assert_eq!(values, vec![0x0010]);
    }

    #[test]
    fn parse_multi_register_big_endian() {
        let frame = response_frame(1, &[0x41EA, 0x6666]);
        let values = parse_read_response(1, 2, &frame).unwrap();
        assert_eq!(values, vec![0x41EA, 0x6666]);
    }

    #[test]
    fn parse_rejects_corrupted_crc() {
        let mut frame = response_frame(1, &[0x1234]);
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;
        assert!(matches!(
            parse_read_response(1, 1, &frame),
            Err(TransportError::Crc { .. })
        ));
    }

    #[test]
    fn parse_rejects_wrong_slave_echo() {
        let frame = response_frame(2, &[0x1234]);
        assert!(matches!(
            parse_read_response(1, 1, &frame),
            Err(TransportError::UnexpectedResponse(_))
        ));
    }

    #[test]
    fn parse_surfaces_device_exception() {
        let mut frame = vec![0x01, 0x83, 0x02];
        let crc = compute_crc(&frame);
        frame.extend_from_slice(&crc.to_le_bytes());
        assert!(matches!(
            parse_read_response(1, 1, &frame),
            Err(TransportError::Exception(0x02))
        ));
    }

    #[test]
    fn parse_rejects_byte_count_mismatch() {
        let frame = response_frame(1, &[0x1234]);
        assert!(matches!(
            parse_read_response(1, 2, &frame),
            Err(TransportError::UnexpectedResponse(_))
        ));
    }

    #[test]
    fn parse_rejects_short_frame() {
        assert!(matches!(
            parse_read_response(1, 1, &[0x01, 0x03]),
            Err(TransportError::UnexpectedResponse(_))
        ));
    }
}
