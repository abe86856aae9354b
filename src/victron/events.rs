//! # Gateway Event Bus
//!
//! Outbound observability events consumed by GUI and telemetry
//! collaborators. Delivery is lossy towards slow consumers and never blocks
//! the publisher.

use crate::victron::can::CanBusState;
use tokio::sync::broadcast;

/// Events emitted by the CAN side of the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayEvent {
    /// A frame was handed to the CAN driver.
    FrameReady {
        id: u16,
        dlc: u8,
        data: [u8; 8],
        timestamp_ms: u64,
    },
    /// No partner frame arrived within the keep-alive window.
    KeepAliveTimeout,
    /// A valid 0x307 handshake was received.
    HandshakeReceived,
    /// The CAN driver changed state.
    BusStateChanged { new_state: CanBusState },
}

/// Broadcast-backed event bus.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<GatewayEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        EventBus { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.tx.subscribe()
    }

    /// Emits an event; having no subscribers is not an error.
    pub fn emit(&self, event: GatewayEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        EventBus::new(64)
    }
}
