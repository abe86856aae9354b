//! # Victron CAN Driver
//!
//! Transmit/receive of standard 11-bit frames plus the liveness protocol:
//! a 0x305 keep-alive every second, and partnership confirmation through
//! inbound 0x307 handshake frames carrying the ASCII "VIC" signature.
//!
//! The controller hardware sits behind the [`CanBus`] trait; this module
//! owns state tracking, statistics, bus-off recovery, and the keep-alive
//! worker on top of it.

use crate::constants::{
    CAN_FRAME_OVERHEAD_BITS, CAN_MAX_DLC, CAN_STANDARD_ID_LIMIT, VICTRON_HANDSHAKE_SIGNATURE,
    VICTRON_ID_HANDSHAKE, VICTRON_ID_KEEPALIVE,
};
use crate::error::Error;
use crate::util::lock_with_budget;
use crate::victron::events::{EventBus, GatewayEvent};
use async_trait::async_trait;
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep, timeout, Instant};

/// Budget for the TX and driver-state mutexes.
const CAN_LOCK_BUDGET: Duration = Duration::from_millis(50);

/// Window for the bus-occupancy estimate.
const OCCUPANCY_WINDOW: Duration = Duration::from_secs(60);

/// One standard CAN data frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanFrame {
    pub id: u16,
    pub dlc: u8,
    pub data: [u8; 8],
}

impl CanFrame {
    /// Builds a frame, rejecting identifiers beyond 11 bits and payloads
    /// beyond 8 bytes.
    pub fn new(id: u16, payload: &[u8]) -> Result<Self, Error> {
        if id >= CAN_STANDARD_ID_LIMIT {
            return Err(Error::InvalidArg(format!(
                "CAN id 0x{id:03X} does not fit 11 bits"
            )));
        }
        if payload.len() > CAN_MAX_DLC {
            return Err(Error::InvalidArg(format!(
                "CAN payload of {} bytes exceeds {CAN_MAX_DLC}",
                payload.len()
            )));
        }
        let mut data = [0u8; 8];
        data[..payload.len()].copy_from_slice(payload);
        Ok(CanFrame {
            id,
            dlc: payload.len() as u8,
            data,
        })
    }

    /// Wire bits of this frame including stuffing-free overhead, for the
    /// occupancy estimate.
    fn bits(&self) -> u64 {
        CAN_FRAME_OVERHEAD_BITS + 8 * self.dlc as u64
    }
}

/// Hardware seam: the physical controller (or a test double).
#[async_trait]
pub trait CanBus: Send + Sync {
    /// Queues one frame for transmission.
    async fn transmit(&self, frame: &CanFrame) -> Result<(), Error>;

    /// Waits up to `window` for an inbound frame.
    async fn receive(&self, window: Duration) -> Result<Option<CanFrame>, Error>;

    /// Attempts to bring a bus-off controller back to error-active.
    async fn recover(&self) -> Result<(), Error>;
}

/// Driver configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanConfig {
    pub bitrate: u32,
    pub keepalive_interval: Duration,
    /// Partner considered offline after this long without traffic.
    pub keepalive_timeout: Duration,
    /// Keep-alive cadence while the partner is offline.
    pub keepalive_retry: Duration,
    /// Wait before attempting bus-off recovery.
    pub busoff_backoff: Duration,
}

impl Default for CanConfig {
    fn default() -> Self {
        CanConfig {
            bitrate: 500_000,
            keepalive_interval: Duration::from_millis(1000),
            keepalive_timeout: Duration::from_millis(5000),
            keepalive_retry: Duration::from_millis(1000),
            busoff_backoff: Duration::from_millis(2000),
        }
    }
}

/// Driver lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CanBusState {
    #[default]
    Stopped,
    Running,
    BusOff,
    Recovering,
}

/// Frame/byte/error counters plus the occupancy window.
#[derive(Debug, Default)]
struct StatsInner {
    tx_frames: u64,
    rx_frames: u64,
    tx_bytes: u64,
    rx_bytes: u64,
    tx_errors: u64,
    rx_errors: u64,
    arbitration_lost: u64,
    bus_off_count: u64,
    /// (when, wire bits) per frame seen inside the occupancy window.
    window: VecDeque<(Instant, u64)>,
}

impl StatsInner {
    fn record_frame(&mut self, frame: &CanFrame, now: Instant) {
        self.window.push_back((now, frame.bits()));
        while let Some(&(t, _)) = self.window.front() {
            if now.duration_since(t) > OCCUPANCY_WINDOW {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }

    fn occupancy_percent(&self, now: Instant, bitrate: u32) -> f64 {
        let bits: u64 = self
            .window
            .iter()
            .filter(|(t, _)| now.duration_since(*t) <= OCCUPANCY_WINDOW)
            .map(|(_, b)| b)
            .sum();
        let capacity = bitrate as f64 * OCCUPANCY_WINDOW.as_secs_f64();
        if capacity > 0.0 {
            bits as f64 / capacity * 100.0
        } else {
            0.0
        }
    }
}

/// Public statistics snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CanStats {
    pub tx_frames: u64,
    pub rx_frames: u64,
    pub tx_bytes: u64,
    pub rx_bytes: u64,
    pub tx_errors: u64,
    pub rx_errors: u64,
    pub arbitration_lost: u64,
    pub bus_off_count: u64,
    /// Estimated bus occupancy over the last 60 s, in percent.
    pub occupancy_percent: f64,
}

struct DriverState {
    state: CanBusState,
    last_rx: Option<Instant>,
    partner_online: bool,
    bus_off_since: Option<Instant>,
}

/// CAN driver: liveness, statistics, and recovery around a [`CanBus`].
pub struct CanDriver {
    bus: Arc<dyn CanBus>,
    config: CanConfig,
    state: Mutex<DriverState>,
    stats: Mutex<StatsInner>,
    tx_lock: tokio::sync::Mutex<()>,
    events: EventBus,
}

impl CanDriver {
    pub fn new(bus: Arc<dyn CanBus>, config: CanConfig, events: EventBus) -> Self {
        CanDriver {
            bus,
            config,
            state: Mutex::new(DriverState {
                state: CanBusState::Stopped,
                last_rx: None,
                partner_online: false,
                bus_off_since: None,
            }),
            stats: Mutex::new(StatsInner::default()),
            tx_lock: tokio::sync::Mutex::new(()),
            events,
        }
    }

    /// Marks the driver running; the worker must be spawned separately.
    pub fn start(&self) -> Result<(), Error> {
        self.set_state(CanBusState::Running)
    }

    pub fn state(&self) -> Result<CanBusState, Error> {
        Ok(lock_with_budget(&self.state, CAN_LOCK_BUDGET, "can driver state")?.state)
    }

    /// True once a valid handshake has been seen and traffic is recent.
    pub fn partner_online(&self) -> Result<bool, Error> {
        Ok(lock_with_budget(&self.state, CAN_LOCK_BUDGET, "can driver state")?.partner_online)
    }

    pub fn stats(&self) -> Result<CanStats, Error> {
        let stats = lock_with_budget(&self.stats, CAN_LOCK_BUDGET, "can stats")?;
        Ok(CanStats {
            tx_frames: stats.tx_frames,
            rx_frames: stats.rx_frames,
            tx_bytes: stats.tx_bytes,
            rx_bytes: stats.rx_bytes,
            tx_errors: stats.tx_errors,
            rx_errors: stats.rx_errors,
            arbitration_lost: stats.arbitration_lost,
            bus_off_count: stats.bus_off_count,
            occupancy_percent: stats.occupancy_percent(Instant::now(), self.config.bitrate),
        })
    }

    fn set_state(&self, new_state: CanBusState) -> Result<(), Error> {
        let mut state = lock_with_budget(&self.state, CAN_LOCK_BUDGET, "can driver state")?;
        if state.state != new_state {
            info!("can driver {:?} -> {:?}", state.state, new_state);
            state.state = new_state;
            if new_state == CanBusState::BusOff {
                state.bus_off_since = Some(Instant::now());
            }
            self.events
                .emit(GatewayEvent::BusStateChanged { new_state });
        }
        Ok(())
    }

    /// Transmits one frame. Refused while stopped or bus-off.
    pub async fn send(&self, frame: &CanFrame) -> Result<(), Error> {
        match self.state()? {
            CanBusState::Running => {}
            CanBusState::BusOff | CanBusState::Recovering => return Err(Error::BusOff),
            CanBusState::Stopped => {
                return Err(Error::InvalidArg("can driver not started".into()))
            }
        }

        let _tx = timeout(CAN_LOCK_BUDGET, self.tx_lock.lock())
            .await
            .map_err(|_| Error::LockBudget("can tx"))?;

        match self.bus.transmit(frame).await {
            Ok(()) => {
                let mut stats = lock_with_budget(&self.stats, CAN_LOCK_BUDGET, "can stats")?;
                stats.tx_frames += 1;
                stats.tx_bytes += frame.dlc as u64;
                stats.record_frame(frame, Instant::now());
                Ok(())
            }
            Err(Error::BusOff) => {
                {
                    let mut stats =
                        lock_with_budget(&self.stats, CAN_LOCK_BUDGET, "can stats")?;
                    stats.tx_errors += 1;
                    stats.bus_off_count += 1;
                }
                self.set_state(CanBusState::BusOff)?;
                Err(Error::BusOff)
            }
            Err(e) => {
                lock_with_budget(&self.stats, CAN_LOCK_BUDGET, "can stats")?.tx_errors += 1;
                Err(e)
            }
        }
    }

    /// RX / keep-alive / recovery worker. Runs until `shutdown` flips true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let keepalive = CanFrame {
            id: VICTRON_ID_KEEPALIVE,
            dlc: 8,
            data: [0u8; 8],
        };
        let mut next_keepalive = Instant::now();

        while !*shutdown.borrow() {
            // Bus-off recovery after the configured backoff.
            let lock_result = {
                match lock_with_budget(&self.state, CAN_LOCK_BUDGET, "can driver state") {
                    Ok(s) => Ok((s.state, s.bus_off_since)),
                    Err(e) => Err(e),
                }
            };
            let (state, bus_off_since) = match lock_result {
                Ok(v) => v,
                Err(e) => {
                    warn!("{e}");
                    sleep(Duration::from_millis(10)).await;
                    continue;
                }
            };
            if state == CanBusState::BusOff {
                let waited = bus_off_since
                    .map(|t| Instant::now().duration_since(t))
                    .unwrap_or_default();
                if waited >= self.config.busoff_backoff {
                    let _ = self.set_state(CanBusState::Recovering);
                    match self.bus.recover().await {
                        Ok(()) => {
                            let _ = self.set_state(CanBusState::Running);
                        }
                        Err(e) => {
                            warn!("bus-off recovery failed: {e}");
                            let _ = self.set_state(CanBusState::BusOff);
                        }
                    }
                } else {
                    tokio::select! {
                        _ = sleep(self.config.busoff_backoff - waited) => {}
                        _ = shutdown.changed() => {}
                    }
                    continue;
                }
            }

            // Keep-alive, at the retry cadence while the partner is away.
            if Instant::now() >= next_keepalive && state == CanBusState::Running {
                if let Err(e) = self.send(&keepalive).await {
                    debug!("keep-alive transmit failed: {e}");
                }
                let cadence = if self.partner_online().unwrap_or(false) {
                    self.config.keepalive_interval
                } else {
                    self.config.keepalive_retry
                };
                next_keepalive = Instant::now() + cadence;
            }

            // Partner liveness.
            {
                let mut st = match lock_with_budget(
                    &self.state,
                    CAN_LOCK_BUDGET,
                    "can driver state",
                ) {
                    Ok(s) => s,
                    Err(e) => {
                        warn!("{e}");
                        continue;
                    }
                };
                let quiet = st
                    .last_rx
                    .map(|t| Instant::now().duration_since(t))
                    .unwrap_or(Duration::MAX);
                if quiet > self.config.keepalive_timeout && st.partner_online {
                    st.partner_online = false;
                    drop(st);
                    warn!("no partner traffic for {quiet:?}, marking offline");
                    self.events.emit(GatewayEvent::KeepAliveTimeout);
                }
            }

            // Inbound traffic, bounded so shutdown and keep-alive stay due.
            match self.bus.receive(Duration::from_millis(100)).await {
                Ok(Some(frame)) => self.handle_rx(&frame),
                Ok(None) => {}
                Err(e) => {
                    if let Ok(mut stats) =
                        lock_with_budget(&self.stats, CAN_LOCK_BUDGET, "can stats")
                    {
                        stats.rx_errors += 1;
                    }
                    debug!("can receive error: {e}");
                    sleep(Duration::from_millis(10)).await;
                }
            }
        }
        info!("can worker exiting");
    }

    fn handle_rx(&self, frame: &CanFrame) {
        if let Ok(mut stats) = lock_with_budget(&self.stats, CAN_LOCK_BUDGET, "can stats") {
            stats.rx_frames += 1;
            stats.rx_bytes += frame.dlc as u64;
            stats.record_frame(frame, Instant::now());
        }

        if frame.id == VICTRON_ID_HANDSHAKE {
            // Signature sits in bytes 4..7.
            if frame.data[4..7] == VICTRON_HANDSHAKE_SIGNATURE[..] {
                if let Ok(mut st) =
                    lock_with_budget(&self.state, CAN_LOCK_BUDGET, "can driver state")
                {
                    st.last_rx = Some(Instant::now());
                    if !st.partner_online {
                        info!("victron partner handshake confirmed");
                    }
                    st.partner_online = true;
                }
                self.events.emit(GatewayEvent::HandshakeReceived);
            } else {
                // Logged only; an unknown signature does not reset liveness.
                warn!(
                    "0x307 with unexpected signature {:02X?}",
                    &frame.data[4..7]
                );
            }
        } else if let Ok(mut st) =
            lock_with_budget(&self.state, CAN_LOCK_BUDGET, "can driver state")
        {
            st.last_rx = Some(Instant::now());
        }
    }
}
