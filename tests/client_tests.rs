//! Integration tests for the BMS client: block reads, write verification,
//! and the poll cycle against the mock port.

use std::sync::Arc;
use std::time::Duration;
use tinybms_rs::error::{DecodeError, Error};
use tinybms_rs::model::live_data::OnlineStatus;
use tinybms_rs::model::store::{ConnectionStatus, LiveDataStore};
use tinybms_rs::tinybms::client::{PollConfig, TinyBmsClient};
use tinybms_rs::tinybms::registers::RegisterValue;
use tinybms_rs::tinybms::serial::{SerialConfig, TinyBmsTransport};
use tinybms_rs::tinybms::serial_mock::MockSerialPort;

fn test_client(port: MockSerialPort) -> (TinyBmsClient<MockSerialPort>, LiveDataStore) {
    let config = SerialConfig {
        port: "mock".to_string(),
        baudrate: 115_200,
        reply_timeout: Duration::from_millis(100),
    };
    let transport = Arc::new(TinyBmsTransport::with_port(port, config));
    let store = LiveDataStore::new(5);
    let poll = PollConfig {
        cycle: Duration::from_millis(10),
        settings_every: 2,
        retries: 2,
        retry_backoff: Duration::from_millis(1),
        failure_threshold: 5,
    };
    (TinyBmsClient::new(transport, store.clone(), poll), store)
}

/// Raw words for a plausible live block (registers 0..56).
fn live_block_words() -> Vec<u16> {
    let mut words = vec![0u16; 56];
    for (i, w) in words.iter_mut().take(16).enumerate() {
        *w = 33000 + (i as u16) * 10; // 3300.0 mV .. 3315.0 mV
    }
    let v_bits = 52.9f32.to_bits();
    words[36] = (v_bits & 0xFFFF) as u16;
    words[37] = (v_bits >> 16) as u16;
    let i_bits = 10.5f32.to_bits();
    words[38] = (i_bits & 0xFFFF) as u16;
    words[39] = (i_bits >> 16) as u16;
    words[40] = 33000;
    words[41] = 33150;
    words[42] = 185; // 18.5 C
    words[43] = 0x8000u16; // probe absent
    words[44] = 0b0000_0000_0000_0101; // cells 1 and 3 balancing
    words[45] = 9950; // SOH 99.5 %
    let soc_raw: u32 = 87_654_321; // 87.654321 %
    words[46] = (soc_raw & 0xFFFF) as u16;
    words[47] = (soc_raw >> 16) as u16;
    words[48] = 231; // 23.1 C
    words[50] = 0x91; // charging
    words
}

fn stats_block_words() -> Vec<u16> {
    vec![0u16; 19]
}

/// Raw words for the settings block (registers 300..344).
fn settings_block_words() -> Vec<u16> {
    let mut words = vec![0u16; 44];
    words[1] = 16; // series cells (reg 301)
    words[3] = 50; // allowed disbalance (reg 303)
    words[6] = 28000; // capacity 280.00 Ah (reg 306)
    words[15] = 3650; // OV cutoff mV (reg 315)
    words[16] = 2800; // UV cutoff mV (reg 316)
    words[17] = 200; // DCL A (reg 317)
    words[18] = 150; // CCL A (reg 318)
    words[19] = 60; // over-temp C (reg 319)
    words[20] = 0; // low-temp charge C (reg 320)
    words[32] = u16::from_le_bytes(*b"Ba"); // battery name (regs 332..335)
    words[33] = u16::from_le_bytes(*b"nk");
    words[34] = u16::from_le_bytes(*b" A");
    words[41] = 0x0205; // firmware version (reg 341)
    words
}

fn queue_full_cycle(port: &MockSerialPort, with_settings: bool) {
    port.queue_read_reply(&live_block_words());
    port.queue_read_reply(&stats_block_words());
    if with_settings {
        port.queue_read_reply(&settings_block_words());
    }
}

#[tokio::test]
async fn test_read_block_of_zero_is_empty_and_wireless() {
    let port = MockSerialPort::new();
    let (client, _) = test_client(port.clone());
    let values = client.read_block(0, 0).await.unwrap();
    assert!(values.is_empty());
    assert!(port.get_tx_data().is_empty());
}

#[tokio::test]
async fn test_read_block_over_127_is_invalid_arg() {
    let (client, _) = test_client(MockSerialPort::new());
    match client.read_block(0, 128).await {
        Err(Error::InvalidArg(_)) => {}
        other => panic!("expected InvalidArg, got {other:?}"),
    }
}

#[tokio::test]
async fn test_read_block_decodes_and_pairs_registers() {
    let port = MockSerialPort::new();
    port.queue_read_reply(&live_block_words());
    let (client, _) = test_client(port);

    let values = client.read_block(0, 56).await.unwrap();
    assert_eq!(values.get(&0), Some(&RegisterValue::U16(33000)));
    assert_eq!(values.get(&36), Some(&RegisterValue::F32(52.9)));
    assert_eq!(values.get(&46), Some(&RegisterValue::U32(87_654_321)));
    assert_eq!(values.get(&50), Some(&RegisterValue::Enum(0x91)));
    // Uncatalogued addresses carry no entry.
    assert!(!values.contains_key(&17));
}

#[tokio::test]
async fn test_write_register_with_verify() {
    let port = MockSerialPort::new();
    port.queue_write_echo(303, 1);
    port.queue_read_reply(&[60]);
    let (client, _) = test_client(port.clone());

    client.write_register(303, 60.0).await.unwrap();
    // Two requests hit the wire: the write and the readback.
    let tx = port.get_tx_data();
    assert_eq!(tx[1], 0x10);
}

#[tokio::test]
async fn test_write_register_verify_mismatch() {
    let port = MockSerialPort::new();
    port.queue_write_echo(303, 1);
    port.queue_read_reply(&[55]); // BMS kept a different value
    let (client, _) = test_client(port);

    match client.write_register(303, 60.0).await {
        Err(Error::VerifyMismatch {
            address: 303,
            written: 60,
            read_back: 55,
        }) => {}
        other => panic!("expected VerifyMismatch, got {other:?}"),
    }
}

#[tokio::test]
async fn test_poll_cycle_publishes_snapshot() {
    let port = MockSerialPort::new();
    queue_full_cycle(&port, true);
    let (client, store) = test_client(port);

    let snapshot = client.poll_cycle().await.unwrap();
    assert_eq!(snapshot.cell_mv[0], 3300);
    assert_eq!(snapshot.cell_mv[15], 3315);
    assert_eq!(snapshot.min_cell_mv, 3300);
    assert_eq!(snapshot.max_cell_mv, 3315);
    assert_eq!(snapshot.balancing_bitmap, 0b101);
    assert!((snapshot.pack_voltage_v - 52.9).abs() < 1e-6);
    assert!((snapshot.soc_percent - 87.65).abs() < 0.01);
    assert_eq!(snapshot.status, OnlineStatus::Charging);
    assert_eq!(snapshot.series_cell_count, Some(16));
    assert_eq!(snapshot.capacity_ah, Some(280.0));
    assert_eq!(snapshot.charge_current_limit_a, Some(150.0));
    assert_eq!(snapshot.battery_name.as_deref(), Some("Bank A"));
    // The absent probe stays unavailable instead of reading zero.
    assert_eq!(snapshot.temperatures_deci_c[2], None);

    assert_eq!(store.latest().unwrap().unwrap().timestamp_ms, snapshot.timestamp_ms);
    assert_eq!(store.connection_status().unwrap(), ConnectionStatus::Connected);
    assert_eq!(store.history().unwrap().len(), 1);
}

/// The settings block is read on the first cycle and then every Nth; fields
/// carried over in between.
#[tokio::test]
async fn test_settings_cadence() {
    let port = MockSerialPort::new();
    let (client, _) = test_client(port.clone());

    queue_full_cycle(&port, true);
    client.poll_cycle().await.unwrap();
    let tx_after_first = port.get_tx_data().len();

    // Second cycle: live + stats only (settings_every = 2 reads settings on
    // cycles 0, 2, 4, ...).
    queue_full_cycle(&port, false);
    let snapshot = client.poll_cycle().await.unwrap();
    assert_eq!(snapshot.series_cell_count, Some(16), "settings carried over");
    let tx_after_second = port.get_tx_data().len();
    // Two requests (8 bytes each) in the second cycle, three in the first.
    assert_eq!(tx_after_first, 24);
    assert_eq!(tx_after_second, tx_after_first + 16);
}

#[tokio::test]
async fn test_block_read_retries_after_timeout_then_succeeds() {
    let port = MockSerialPort::new();
    let (client, _) = test_client(port.clone());

    // Nothing queued for attempt one; feed the reply for the retry.
    let feeder = {
        let port = port.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            port.queue_read_reply(&[42]);
        })
    };
    let values = client.read_block(303, 1).await.unwrap();
    feeder.await.unwrap();
    assert_eq!(values.get(&303), Some(&RegisterValue::U16(42)));
}

/// A device refusal is surfaced immediately, never blindly retried.
#[tokio::test]
async fn test_poll_cycle_surfaces_device_error_without_retry() {
    let port = MockSerialPort::new();
    port.queue_error_reply(0x03, 0x01);
    let (client, store) = test_client(port.clone());

    match client.poll_cycle().await {
        Err(Error::Decode(DecodeError::DeviceError(0x01))) => {}
        other => panic!("expected DeviceError, got {other:?}"),
    }
    // Only the one failed request went out.
    assert_eq!(port.get_tx_data().len(), 8);
    let _ = store.record_poll_failure();
    assert_eq!(store.latest().unwrap(), None);
}
