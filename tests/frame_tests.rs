//! Unit tests for the TinyBMS frame codec: request building, reply parsing,
//! and CRC-16 verification.

use tinybms_rs::error::DecodeError;
use tinybms_rs::tinybms::frame::{
    crc16, encode_read, encode_write, expected_reply_len, parse_reply, try_parse_reply, ReplyType,
};

fn with_crc(mut body: Vec<u8>) -> Vec<u8> {
    let crc = crc16(&body);
    body.extend_from_slice(&crc.to_le_bytes());
    body
}

/// Read request for address 0x0024, one register: header little-endian,
/// CRC-16/MODBUS trailer low byte first.
#[test]
fn test_encode_read_reference_vector() {
    let frame = encode_read(0x0024, 1).unwrap();
    assert_eq!(&frame[..6], &[0xAA, 0x03, 0x24, 0x00, 0x00, 0x01]);
    assert_eq!(frame, vec![0xAA, 0x03, 0x24, 0x00, 0x00, 0x01, 0x97, 0x21]);
}

/// The CRC-16/MODBUS check value (0x4B37 over "123456789") pins the
/// polynomial and seed.
#[test]
fn test_crc_reference_value() {
    assert_eq!(crc16(b"123456789"), 0x4B37);
    assert_eq!(crc16(&[0xAA, 0x03, 0x24, 0x00, 0x00, 0x01]), 0x2197);
}

/// Addresses and data words serialize low byte first.
#[test]
fn test_encode_read_is_little_endian() {
    let frame = encode_read(0x1234, 2).unwrap();
    assert_eq!(&frame[2..4], &[0x34, 0x12]);
    assert_eq!(frame[5], 2);
}

#[test]
fn test_encode_read_count_limits() {
    assert!(encode_read(0, 0).is_err());
    assert!(encode_read(0, 127).is_ok());
    // Count is a u8, so > 127 is the only representable overflow band.
    assert!(encode_read(0, 128).is_err());
}

#[test]
fn test_encode_write_layout() {
    let frame = encode_write(0x012C, &[0x0010, 0xBEEF]).unwrap();
    // AA 10 2C 01 00 RL=2 PL=4 10 00 EF BE CRC CRC
    assert_eq!(
        &frame[..11],
        &[0xAA, 0x10, 0x2C, 0x01, 0x00, 0x02, 0x04, 0x10, 0x00, 0xEF, 0xBE]
    );
    assert_eq!(frame.len(), 13);
    let crc = crc16(&frame[..11]);
    assert_eq!(frame[11], (crc & 0xFF) as u8);
    assert_eq!(frame[12], (crc >> 8) as u8);
}

#[test]
fn test_encode_write_word_limit() {
    assert!(encode_write(0, &[0u16; 100]).is_ok());
    assert!(encode_write(0, &[0u16; 101]).is_err());
    assert!(encode_write(0, &[]).is_err());
}

/// Tests the documented reply vector: payload word 0x1234 from bytes 34 12.
#[test]
fn test_parse_read_reply_reference_vector() {
    let frame = with_crc(vec![0xAA, 0x03, 0x02, 0x34, 0x12]);
    let reply = parse_reply(&frame, 0x03).unwrap();
    assert_eq!(reply.reply_type, ReplyType::Read);
    assert_eq!(reply.cmd, 0x03);
    assert_eq!(reply.payload, vec![0x1234]);
}

#[test]
fn test_parse_write_echo() {
    let frame = with_crc(vec![0xAA, 0x10, 0x2C, 0x01, 0x00, 0x02]);
    let reply = parse_reply(&frame, 0x10).unwrap();
    assert_eq!(reply.reply_type, ReplyType::WriteEcho);
    assert_eq!(reply.address, 0x012C);
    assert_eq!(reply.register_count, 2);
}

#[test]
fn test_parse_error_reply() {
    let frame = with_crc(vec![0xAA, 0x00, 0x03, 0x05]);
    match parse_reply(&frame, 0x03) {
        Err(DecodeError::DeviceError(0x05)) => {}
        other => panic!("expected DeviceError(0x05), got {other:?}"),
    }
}

#[test]
fn test_parse_rejects_bad_sync() {
    let frame = with_crc(vec![0xAB, 0x03, 0x02, 0x34, 0x12]);
    match parse_reply(&frame, 0x03) {
        Err(DecodeError::BadSync(0xAB)) => {}
        other => panic!("expected BadSync, got {other:?}"),
    }
}

/// Corrupting any payload byte surfaces as a CRC failure, not a structural
/// one: the CRC is judged before the command echo.
#[test]
fn test_corruption_yields_bad_crc() {
    let good = with_crc(vec![0xAA, 0x03, 0x04, 0x11, 0x22, 0x33, 0x44]);
    // Skip sync (0), length prefix (2), and the CRC trailer.
    for index in [1usize, 3, 4, 5, 6] {
        let mut bad = good.clone();
        bad[index] ^= 0x01;
        match parse_reply(&bad, 0x03) {
            Err(DecodeError::BadCrc { .. }) => {}
            other => panic!("byte {index}: expected BadCrc, got {other:?}"),
        }
    }
}

#[test]
fn test_parse_rejects_trailing_bytes() {
    let mut frame = with_crc(vec![0xAA, 0x03, 0x02, 0x34, 0x12]);
    frame.push(0x00);
    match parse_reply(&frame, 0x03) {
        Err(DecodeError::BadLength(_)) => {}
        other => panic!("expected BadLength, got {other:?}"),
    }
}

/// A truncated buffer is `Ok(None)` incrementally and `BadLength` when
/// parsed as complete.
#[test]
fn test_incremental_parse_waits_for_full_frame() {
    let frame = with_crc(vec![0xAA, 0x03, 0x02, 0x34, 0x12]);
    for end in 0..frame.len() {
        assert_eq!(try_parse_reply(&frame[..end], 0x03).unwrap(), None);
    }
    let (reply, consumed) = try_parse_reply(&frame, 0x03).unwrap().unwrap();
    assert_eq!(consumed, frame.len());
    assert_eq!(reply.payload, vec![0x1234]);

    assert!(matches!(
        parse_reply(&frame[..4], 0x03),
        Err(DecodeError::BadLength(_))
    ));
}

#[test]
fn test_expected_reply_len() {
    assert_eq!(expected_reply_len(0x03, &[0xAA]), None);
    assert_eq!(expected_reply_len(0x03, &[0xAA, 0x03]), None);
    assert_eq!(expected_reply_len(0x03, &[0xAA, 0x03, 0x06]), Some(11));
    assert_eq!(expected_reply_len(0x10, &[0xAA, 0x10]), Some(8));
    assert_eq!(expected_reply_len(0x03, &[0xAA, 0x00]), Some(6));
}

#[test]
fn test_wrong_echo_with_valid_crc_is_bad_cmd() {
    // A frame that is fully valid as a write echo but arrives while a read
    // is outstanding: the total length is judged by the expected command.
    let frame = with_crc(vec![0xAA, 0x10, 0x02, 0x34, 0x12]);
    match parse_reply(&frame, 0x03) {
        Err(DecodeError::BadCmd {
            expected: 0x03,
            actual: 0x10,
        }) => {}
        other => panic!("expected BadCmd, got {other:?}"),
    }
}
