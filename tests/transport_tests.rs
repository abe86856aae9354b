//! Integration tests for the serial transport against the mock port:
//! request/reply exchange, resynchronisation, timeout, and RX draining.

use std::sync::Arc;
use std::time::Duration;
use tinybms_rs::error::{DecodeError, Error};
use tinybms_rs::tinybms::frame::{crc16, encode_read};
use tinybms_rs::tinybms::serial::{SerialConfig, TinyBmsTransport};
use tinybms_rs::tinybms::serial_mock::MockSerialPort;

fn test_config() -> SerialConfig {
    SerialConfig {
        port: "mock".to_string(),
        baudrate: 115_200,
        reply_timeout: Duration::from_millis(200),
    }
}

fn transport(port: MockSerialPort) -> TinyBmsTransport<MockSerialPort> {
    TinyBmsTransport::with_port(port, test_config())
}

#[tokio::test]
async fn test_exchange_round_trip() {
    let port = MockSerialPort::new();
    port.queue_read_reply(&[0x1234, 0x5678]);
    let transport = transport(port.clone());

    let request = encode_read(0, 2).unwrap();
    let reply = transport.exchange(&request, 0x03).await.unwrap();
    assert_eq!(reply.payload, vec![0x1234, 0x5678]);
    // The request reached the wire unmodified.
    assert_eq!(port.get_tx_data(), request);

    let stats = transport.stats();
    assert_eq!(stats.requests_sent, 1);
    assert_eq!(stats.replies_received, 1);
    assert_eq!(stats.timeouts, 0);
}

/// Garbage before the sync byte is discarded and counted.
#[tokio::test]
async fn test_resync_discards_leading_garbage() {
    let port = MockSerialPort::new();
    port.queue_rx_data(&[0x00, 0xFF, 0x55]);
    port.queue_read_reply(&[0xBEEF]);
    let transport = transport(port);

    let request = encode_read(0, 1).unwrap();
    let reply = transport.exchange(&request, 0x03).await.unwrap();
    assert_eq!(reply.payload, vec![0xBEEF]);
    assert_eq!(transport.stats().resync_bytes_discarded, 3);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_when_no_reply() {
    let transport = transport(MockSerialPort::new());
    let request = encode_read(0, 1).unwrap();
    match transport.exchange(&request, 0x03).await {
        Err(Error::Timeout(200)) => {}
        other => panic!("expected Timeout, got {other:?}"),
    }
    assert_eq!(transport.stats().timeouts, 1);
}

#[tokio::test]
async fn test_corrupt_reply_is_decode_error() {
    let port = MockSerialPort::new();
    let mut frame = vec![0xAA, 0x03, 0x02, 0x34, 0x12];
    let crc = crc16(&frame) ^ 0x0001;
    frame.extend_from_slice(&crc.to_le_bytes());
    port.queue_rx_data(&frame);
    let transport = transport(port);

    let request = encode_read(0, 1).unwrap();
    match transport.exchange(&request, 0x03).await {
        Err(Error::Decode(DecodeError::BadCrc { .. })) => {}
        other => panic!("expected BadCrc, got {other:?}"),
    }
    assert_eq!(transport.stats().decode_errors, 1);
}

#[tokio::test]
async fn test_device_error_reply_surfaces_code() {
    let port = MockSerialPort::new();
    port.queue_error_reply(0x03, 0x02);
    let transport = transport(port);

    let request = encode_read(300, 1).unwrap();
    match transport.exchange(&request, 0x03).await {
        Err(Error::Decode(DecodeError::DeviceError(0x02))) => {}
        other => panic!("expected DeviceError, got {other:?}"),
    }
}

/// Concurrent callers serialise on the port; both exchanges complete.
#[tokio::test]
async fn test_exchanges_are_mutually_exclusive() {
    let port = MockSerialPort::new();
    port.queue_read_reply(&[0x0001]);
    let transport = Arc::new(transport(port.clone()));

    let a = {
        let t = transport.clone();
        tokio::spawn(async move { t.exchange(&encode_read(0, 1).unwrap(), 0x03).await })
    };
    let b = {
        let t = transport.clone();
        tokio::spawn(async move { t.exchange(&encode_read(1, 1).unwrap(), 0x03).await })
    };
    // The queued reply satisfies whichever exchange holds the port; the
    // other waits its turn for the second reply.
    tokio::time::sleep(Duration::from_millis(50)).await;
    port.queue_read_reply(&[0x0002]);

    let mut words: Vec<u16> = Vec::new();
    words.extend(a.await.unwrap().unwrap().payload);
    words.extend(b.await.unwrap().unwrap().payload);
    words.sort_unstable();
    assert_eq!(words, vec![0x0001, 0x0002]);
    assert_eq!(transport.stats().replies_received, 2);
}
