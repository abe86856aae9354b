//! # Publisher Scheduler
//!
//! Runs every channel encoder on each new snapshot and dispatches the
//! resulting frames to the CAN driver.
//!
//! Two modes: with a publish interval of zero every encoded frame is
//! dispatched immediately; otherwise encoders refresh a shared buffer and a
//! dedicated task publishes each channel on its own period, resynchronising
//! deadlines instead of bursting after starvation.

use crate::energy::integrator::EnergyIntegrator;
use crate::error::Error;
use crate::model::live_data::LiveData;
use crate::util::{lock_with_budget, now_ms};
use crate::victron::can::{CanDriver, CanFrame};
use crate::victron::cvl::CvlEngine;
use crate::victron::encoders::{BatteryIdentity, EncoderContext, CHANNELS};
use crate::victron::events::{EventBus, GatewayEvent};
use log::{debug, warn};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::time::{sleep_until, Instant};

/// Budget for the shared frame buffer.
const BUFFER_LOCK_BUDGET: Duration = Duration::from_millis(50);

/// Publisher configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublisherConfig {
    /// Zero selects immediate mode; any other value enables the periodic
    /// scheduler (the per-channel periods come from the encoder table).
    pub publish_interval: Duration,
    pub identity: BatteryIdentity,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        PublisherConfig {
            publish_interval: Duration::from_millis(100),
            identity: BatteryIdentity::default(),
        }
    }
}

/// Per-channel slot in the shared buffer.
#[derive(Debug, Clone, Copy)]
struct BufferEntry {
    frame: [u8; 8],
    /// Set once the channel's encoder has produced a frame.
    valid: bool,
    /// Immediate-mode flag: frame not yet dispatched.
    dirty: bool,
    next_deadline: Instant,
}

/// Victron frame publisher.
pub struct Publisher {
    driver: Arc<CanDriver>,
    cvl: Arc<CvlEngine>,
    energy: Arc<EnergyIntegrator>,
    events: EventBus,
    config: PublisherConfig,
    buffer: Mutex<Vec<BufferEntry>>,
    refreshed: Notify,
}

impl Publisher {
    pub fn new(
        driver: Arc<CanDriver>,
        cvl: Arc<CvlEngine>,
        energy: Arc<EnergyIntegrator>,
        events: EventBus,
        config: PublisherConfig,
    ) -> Self {
        let start = Instant::now();
        let buffer = CHANNELS
            .iter()
            .map(|_| BufferEntry {
                frame: [0u8; 8],
                valid: false,
                dirty: false,
                next_deadline: start,
            })
            .collect();
        Publisher {
            driver,
            cvl,
            energy,
            events,
            config,
            buffer: Mutex::new(buffer),
            refreshed: Notify::new(),
        }
    }

    fn immediate_mode(&self) -> bool {
        self.config.publish_interval.is_zero()
    }

    /// Listener entry point: run every encoder against the snapshot and
    /// refresh the buffer. An encoder returning `None` leaves its previous
    /// entry untouched in periodic mode and publishes nothing in immediate
    /// mode.
    pub fn on_snapshot(&self, snapshot: &LiveData) {
        let context = EncoderContext {
            snapshot,
            cvl: self.cvl.latest(),
            energy: self.energy.state().ok(),
            identity: &self.config.identity,
        };

        let result = (|| -> Result<(), Error> {
            let mut buffer = lock_with_budget(&self.buffer, BUFFER_LOCK_BUDGET, "frame buffer")?;
            for (entry, channel) in buffer.iter_mut().zip(CHANNELS) {
                if let Some(frame) = (channel.encoder)(&context) {
                    entry.frame = frame;
                    entry.valid = true;
                    entry.dirty = true;
                }
            }
            Ok(())
        })();
        match result {
            Ok(()) => self.refreshed.notify_one(),
            Err(e) => warn!("encoder refresh skipped: {e}"),
        }
    }

    /// Dispatch task; runs until `shutdown` flips true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        if self.immediate_mode() {
            self.run_immediate(&mut shutdown).await;
        } else {
            self.run_periodic(&mut shutdown).await;
        }
        debug!("publisher exiting");
    }

    /// Immediate mode: every refresh dispatches all newly encoded frames in
    /// stable channel order.
    async fn run_immediate(&self, shutdown: &mut watch::Receiver<bool>) {
        while !*shutdown.borrow() {
            tokio::select! {
                _ = self.refreshed.notified() => {}
                _ = shutdown.changed() => continue,
            }

            let due = {
                let mut buffer = match lock_with_budget(
                    &self.buffer,
                    BUFFER_LOCK_BUDGET,
                    "frame buffer",
                ) {
                    Ok(b) => b,
                    Err(e) => {
                        warn!("{e}");
                        continue;
                    }
                };
                let mut due = Vec::new();
                for (index, entry) in buffer.iter_mut().enumerate() {
                    if entry.valid && entry.dirty {
                        entry.dirty = false;
                        due.push((index, entry.frame));
                    }
                }
                due
            };
            self.dispatch(&due).await;
        }
    }

    /// Periodic mode: wake at the earliest channel deadline, publish what is
    /// due, and advance deadlines by one period. A deadline overshot by more
    /// than one period resynchronises to `now + period` instead of bursting.
    async fn run_periodic(&self, shutdown: &mut watch::Receiver<bool>) {
        while !*shutdown.borrow() {
            let next_wake = {
                match lock_with_budget(&self.buffer, BUFFER_LOCK_BUDGET, "frame buffer") {
                    Ok(buffer) => buffer
                        .iter()
                        .map(|e| e.next_deadline)
                        .min()
                        .unwrap_or_else(|| Instant::now() + self.config.publish_interval),
                    Err(e) => {
                        warn!("{e}");
                        Instant::now() + self.config.publish_interval
                    }
                }
            };

            tokio::select! {
                _ = sleep_until(next_wake) => {}
                _ = shutdown.changed() => continue,
            }

            let now = Instant::now();
            let due = {
                let mut buffer = match lock_with_budget(
                    &self.buffer,
                    BUFFER_LOCK_BUDGET,
                    "frame buffer",
                ) {
                    Ok(b) => b,
                    Err(e) => {
                        warn!("{e}");
                        continue;
                    }
                };
                let mut due = Vec::new();
                for (index, (entry, channel)) in
                    buffer.iter_mut().zip(CHANNELS).enumerate()
                {
                    if entry.next_deadline > now {
                        continue;
                    }
                    if entry.valid {
                        due.push((index, entry.frame));
                    }
                    entry.next_deadline = if now > entry.next_deadline + channel.period {
                        // The task was starved; skip the backlog.
                        now + channel.period
                    } else {
                        entry.next_deadline + channel.period
                    };
                }
                due
            };
            self.dispatch(&due).await;
        }
    }

    /// Sends frames to the CAN driver in stable channel order and echoes
    /// each onto the event bus.
    async fn dispatch(&self, due: &[(usize, [u8; 8])]) {
        for &(index, data) in due {
            let channel = &CHANNELS[index];
            let frame = CanFrame {
                id: channel.can_id,
                dlc: channel.dlc,
                data,
            };
            if let Err(e) = self.driver.send(&frame).await {
                debug!("dispatch of 0x{:03X} failed: {e}", channel.can_id);
                continue;
            }
            self.events.emit(GatewayEvent::FrameReady {
                id: channel.can_id,
                dlc: channel.dlc,
                data,
                timestamp_ms: now_ms(),
            });
        }
    }
}
