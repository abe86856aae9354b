//! # TinyBMS Frame Codec
//!
//! This module builds and parses the MODBUS-like frames spoken by the TinyBMS
//! module over its serial link and validates them with the standard MODBUS
//! CRC-16.
//!
//! ## Wire shapes
//!
//! | Role          | Layout                                              |
//! |---------------|-----------------------------------------------------|
//! | Read request  | `AA 03 ADDR_LSB ADDR_MSB 00 RL CRC_LSB CRC_MSB`     |
//! | Read reply    | `AA 03 PL DATA.. CRC_LSB CRC_MSB` with `PL = 2*RL`  |
//! | Write request | `AA 10 ADDR_LSB ADDR_MSB 00 RL PL DATA.. CRC..`     |
//! | Write reply   | `AA 10 ADDR_LSB ADDR_MSB 00 RL CRC_LSB CRC_MSB`     |
//! | Error reply   | `AA 00 <origCmd> <errCode> CRC_LSB CRC_MSB`         |
//!
//! The wire is little-endian throughout: register addresses, 16-bit data
//! words, and the CRC trailer all serialize low byte first. The protocol
//! manual claims "MSB first" for data words; the firmware does not. Trust
//! the firmware.

use crate::constants::{
    TINYBMS_CMD_ERROR, TINYBMS_CMD_READ, TINYBMS_CMD_WRITE, TINYBMS_MAX_READ_REGISTERS,
    TINYBMS_MAX_WRITE_REGISTERS, TINYBMS_SYNC_BYTE,
};
use crate::error::{DecodeError, Error};
use bytes::{BufMut, BytesMut};
use crc::{Crc, CRC_16_MODBUS};
use nom::multi::count;
use nom::number::complete::le_u16;

/// CRC-16/MODBUS (polynomial 0xA001 reflected, seed 0xFFFF), computed over
/// every byte from the 0xAA sync up to but excluding the two CRC bytes.
const MODBUS_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Computes the frame CRC over `bytes`.
pub fn crc16(bytes: &[u8]) -> u16 {
    MODBUS_CRC.checksum(bytes)
}

/// Represents the different shapes a well-formed TinyBMS reply can take.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ReplyType {
    /// A block-read reply carrying register words.
    Read,
    /// The echo reply acknowledging a block write.
    WriteEcho,
}

/// A parsed TinyBMS reply frame.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct ReplyFrame {
    pub reply_type: ReplyType,
    /// Echoed command byte (0x03 or 0x10).
    pub cmd: u8,
    /// Register words from a read reply, reassembled little-endian.
    pub payload: Vec<u16>,
    /// Start address echoed by a write reply.
    pub address: u16,
    /// Register count echoed by a write reply.
    pub register_count: u8,
}

/// Builds a block-read request frame.
///
/// `count` must be between 1 and 127 registers.
pub fn encode_read(address: u16, register_count: u8) -> Result<Vec<u8>, Error> {
    if register_count == 0 || register_count as usize > TINYBMS_MAX_READ_REGISTERS {
        return Err(Error::InvalidArg(format!(
            "read count {register_count} outside 1..={TINYBMS_MAX_READ_REGISTERS}"
        )));
    }

    let mut buf = BytesMut::with_capacity(8);
    buf.put_u8(TINYBMS_SYNC_BYTE);
    buf.put_u8(TINYBMS_CMD_READ);
    buf.put_u16_le(address);
    buf.put_u8(0x00);
    buf.put_u8(register_count);
    let crc = crc16(&buf);
    buf.put_u16_le(crc);
    Ok(buf.to_vec())
}

/// Builds a block-write request frame carrying `words` starting at `address`.
///
/// At most 100 registers can be written in one request.
pub fn encode_write(address: u16, words: &[u16]) -> Result<Vec<u8>, Error> {
    if words.is_empty() || words.len() > TINYBMS_MAX_WRITE_REGISTERS {
        return Err(Error::InvalidArg(format!(
            "write count {} outside 1..={TINYBMS_MAX_WRITE_REGISTERS}",
            words.len()
        )));
    }

    let mut buf = BytesMut::with_capacity(9 + 2 * words.len());
    buf.put_u8(TINYBMS_SYNC_BYTE);
    buf.put_u8(TINYBMS_CMD_WRITE);
    buf.put_u16_le(address);
    buf.put_u8(0x00);
    buf.put_u8(words.len() as u8);
    buf.put_u8((words.len() * 2) as u8);
    for word in words {
        buf.put_u16_le(*word);
    }
    let crc = crc16(&buf);
    buf.put_u16_le(crc);
    Ok(buf.to_vec())
}

/// Returns the total byte count of the reply frame started in `buf`, or
/// `None` while too few header bytes have arrived to tell.
///
/// The reply shape is fixed by the command we sent; only the error reply
/// (command byte 0x00) and the read reply's payload-length byte vary the
/// total. Used by the transport to read exactly one frame.
pub fn expected_reply_len(expected_cmd: u8, buf: &[u8]) -> Option<usize> {
    if buf.len() < 2 {
        return None;
    }
    if buf[1] == TINYBMS_CMD_ERROR {
        return Some(6);
    }
    match expected_cmd {
        TINYBMS_CMD_READ => {
            if buf.len() < 3 {
                None
            } else {
                Some(5 + buf[2] as usize)
            }
        }
        TINYBMS_CMD_WRITE => Some(8),
        _ => Some(6),
    }
}

/// Parses a complete reply frame from `buf`.
///
/// Validation order matters: the sync byte and the length prefix are judged
/// first because they shape the frame, then the CRC over everything else,
/// and only then the command echo. A corrupted command byte therefore
/// surfaces as `BadCrc`, not `BadCmd`.
pub fn parse_reply(buf: &[u8], expected_cmd: u8) -> Result<ReplyFrame, DecodeError> {
    match try_parse_reply(buf, expected_cmd)? {
        Some((frame, consumed)) => {
            if consumed != buf.len() {
                return Err(DecodeError::BadLength(format!(
                    "{} trailing bytes after frame",
                    buf.len() - consumed
                )));
            }
            Ok(frame)
        }
        None => Err(DecodeError::BadLength(format!(
            "incomplete frame: {} bytes",
            buf.len()
        ))),
    }
}

/// Incremental variant of [`parse_reply`]: returns `Ok(None)` while the full
/// expected byte count has not yet arrived, and the consumed length once a
/// frame parses.
pub fn try_parse_reply(
    buf: &[u8],
    expected_cmd: u8,
) -> Result<Option<(ReplyFrame, usize)>, DecodeError> {
    if buf.is_empty() {
        return Ok(None);
    }
    if buf[0] != TINYBMS_SYNC_BYTE {
        return Err(DecodeError::BadSync(buf[0]));
    }

    let total = match expected_reply_len(expected_cmd, buf) {
        Some(n) => n,
        None => return Ok(None),
    };
    if buf.len() < total {
        return Ok(None);
    }

    let body = &buf[..total - 2];
    let expected_crc = u16::from_le_bytes([buf[total - 2], buf[total - 1]]);
    let calculated = crc16(body);
    if expected_crc != calculated {
        return Err(DecodeError::BadCrc {
            expected: expected_crc,
            calculated,
        });
    }

    if buf[1] == TINYBMS_CMD_ERROR {
        return Err(DecodeError::DeviceError(buf[3]));
    }
    if buf[1] != expected_cmd {
        return Err(DecodeError::BadCmd {
            expected: expected_cmd,
            actual: buf[1],
        });
    }

    let frame = match expected_cmd {
        TINYBMS_CMD_READ => {
            let payload_len = buf[2] as usize;
            if payload_len % 2 != 0 {
                return Err(DecodeError::BadLength(format!(
                    "odd payload length {payload_len}"
                )));
            }
            let words = parse_payload_words(&buf[3..3 + payload_len], payload_len / 2)?;
            ReplyFrame {
                reply_type: ReplyType::Read,
                cmd: buf[1],
                payload: words,
                address: 0,
                register_count: (payload_len / 2) as u8,
            }
        }
        TINYBMS_CMD_WRITE => ReplyFrame {
            reply_type: ReplyType::WriteEcho,
            cmd: buf[1],
            payload: Vec::new(),
            address: u16::from_le_bytes([buf[2], buf[3]]),
            register_count: buf[5],
        },
        other => {
            return Err(DecodeError::BadCmd {
                expected: other,
                actual: buf[1],
            })
        }
    };
    Ok(Some((frame, total)))
}

/// Reassembles the little-endian register words of a read-reply payload.
fn parse_payload_words(payload: &[u8], n: usize) -> Result<Vec<u16>, DecodeError> {
    let (_, words) = count(le_u16::<_, nom::error::Error<&[u8]>>, n)(payload)
        .map_err(|_| DecodeError::BadLength(format!("payload shorter than {n} words")))?;
    Ok(words)
}
