//! End-to-end test: mock serial TinyBMS and mock CAN bus wired through the
//! full gateway, from poll cycle to published Victron frames.

use std::sync::Arc;
use std::time::Duration;
use tinybms_rs::model::store::ConnectionStatus;
use tinybms_rs::tinybms::serial_mock::MockSerialPort;
use tinybms_rs::victron::can_mock::MockCanBus;
use tinybms_rs::{Gateway, GatewayConfig};

/// Raw words for a live block with a healthy charging pack.
fn live_block_words() -> Vec<u16> {
    let mut words = vec![0u16; 56];
    for (i, w) in words.iter_mut().take(16).enumerate() {
        *w = 33000 + (i as u16) * 5;
    }
    let v_bits = 52.8f32.to_bits();
    words[36] = (v_bits & 0xFFFF) as u16;
    words[37] = (v_bits >> 16) as u16;
    let i_bits = 12.0f32.to_bits();
    words[38] = (i_bits & 0xFFFF) as u16;
    words[39] = (i_bits >> 16) as u16;
    words[42] = 190;
    words[43] = 0x8000u16;
    words[45] = 10000;
    let soc_raw: u32 = 65_000_000;
    words[46] = (soc_raw & 0xFFFF) as u16;
    words[47] = (soc_raw >> 16) as u16;
    words[48] = 225;
    words[50] = 0x91;
    words
}

fn settings_block_words() -> Vec<u16> {
    let mut words = vec![0u16; 44];
    words[1] = 16;
    words[6] = 28000;
    words[15] = 3650;
    words[16] = 2800;
    words[17] = 200;
    words[18] = 150;
    words[19] = 60;
    words[41] = 0x0103;
    words
}

fn test_config(dir: &tempfile::TempDir) -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.energy_store_path = dir.path().join("energy.json");
    config.poll.cycle = Duration::from_millis(50);
    config.poll.retries = 1;
    config.serial.reply_timeout = Duration::from_millis(50);
    config.publisher.publish_interval = Duration::ZERO;
    config
}

#[tokio::test]
async fn test_gateway_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let serial = MockSerialPort::new();
    let can = MockCanBus::new();

    // Feed one complete poll cycle.
    serial.queue_read_reply(&live_block_words());
    serial.queue_read_reply(&vec![0u16; 19]);
    serial.queue_read_reply(&settings_block_words());

    let gateway = Gateway::start(test_config(&dir), serial.clone(), Arc::new(can.clone()))
        .await
        .unwrap();

    // Let the poller consume the queued cycle and the publisher dispatch.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let snapshot = gateway.store().latest().unwrap().expect("snapshot published");
    assert_eq!(snapshot.series_cell_count, Some(16));
    assert_eq!(
        gateway.store().connection_status().unwrap(),
        ConnectionStatus::Connected
    );

    // The CVL engine computed from the snapshot.
    let runtime = gateway.cvl().latest().expect("cvl computed");
    assert!(runtime.cvl_v > 0.0);

    // Victron frames reached the bus: limits, SOC, voltage/current.
    assert!(!can.transmitted_with_id(0x351).is_empty());
    assert!(!can.transmitted_with_id(0x355).is_empty());
    assert!(!can.transmitted_with_id(0x356).is_empty());

    // Requests that reached the TinyBMS side were well-formed reads.
    let tx = serial.get_tx_data();
    assert_eq!(tx[0], 0xAA);
    assert_eq!(tx[1], 0x03);

    gateway.deinit().await;
}

/// Deinit completes within its bounded grace period even while polls fail.
#[tokio::test]
async fn test_gateway_deinit_is_bounded() {
    let dir = tempfile::tempdir().unwrap();
    let gateway = Gateway::start(
        test_config(&dir),
        MockSerialPort::new(),
        Arc::new(MockCanBus::new()),
    )
    .await
    .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    let started = std::time::Instant::now();
    gateway.deinit().await;
    assert!(started.elapsed() < Duration::from_secs(5));
}
