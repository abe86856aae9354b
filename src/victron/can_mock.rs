//! Mock CAN bus implementation for testing
//!
//! Records transmitted frames and replays queued inbound frames without
//! requiring a CAN controller.

use crate::error::Error;
use crate::victron::can::{CanBus, CanFrame};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct MockInner {
    tx_frames: Vec<CanFrame>,
    rx_queue: VecDeque<CanFrame>,
    /// When set, every transmit fails with BusOff until `recover` is called.
    bus_off: bool,
    recover_attempts: u64,
}

/// Mock bus that simulates the inverter end of the link.
#[derive(Clone, Default)]
pub struct MockCanBus {
    inner: Arc<Mutex<MockInner>>,
}

impl MockCanBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Frames transmitted so far, in order.
    pub fn transmitted(&self) -> Vec<CanFrame> {
        self.inner.lock().unwrap().tx_frames.clone()
    }

    /// Frames transmitted with the given identifier.
    pub fn transmitted_with_id(&self, id: u16) -> Vec<CanFrame> {
        self.transmitted().into_iter().filter(|f| f.id == id).collect()
    }

    /// Queue an inbound frame.
    pub fn queue_rx(&self, frame: CanFrame) {
        self.inner.lock().unwrap().rx_queue.push_back(frame);
    }

    /// Force the bus into the bus-off condition.
    pub fn set_bus_off(&self, bus_off: bool) {
        self.inner.lock().unwrap().bus_off = bus_off;
    }

    pub fn recover_attempts(&self) -> u64 {
        self.inner.lock().unwrap().recover_attempts
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.tx_frames.clear();
        inner.rx_queue.clear();
    }
}

#[async_trait]
impl CanBus for MockCanBus {
    async fn transmit(&self, frame: &CanFrame) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        if inner.bus_off {
            return Err(Error::BusOff);
        }
        inner.tx_frames.push(*frame);
        Ok(())
    }

    async fn receive(&self, window: Duration) -> Result<Option<CanFrame>, Error> {
        if let Some(frame) = self.inner.lock().unwrap().rx_queue.pop_front() {
            return Ok(Some(frame));
        }
        tokio::time::sleep(window).await;
        Ok(self.inner.lock().unwrap().rx_queue.pop_front())
    }

    async fn recover(&self) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        inner.recover_attempts += 1;
        inner.bus_off = false;
        Ok(())
    }
}
