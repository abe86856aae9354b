//! # Energy Integrator
//!
//! Integrates pack power over the time between snapshots into lifetime
//! charged and discharged watt-hour totals, and asks the persistence worker
//! to save them once both the delta and the interval hysteresis thresholds
//! are met. In-memory totals stay authoritative; a failed persist is
//! retried on the next trigger.

use crate::error::Error;
use crate::model::live_data::LiveData;
use crate::util::lock_with_budget;
use log::{debug, info, warn};
use std::sync::Mutex;
use std::time::Duration;

/// Budget for acquiring the integrator mutex.
const ENERGY_LOCK_BUDGET: Duration = Duration::from_millis(100);

/// Samples further apart than this are treated as a clock jump.
const MAX_SAMPLE_GAP_HOURS: f64 = 1.0;

/// Persistence hysteresis configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct EnergyConfig {
    /// Minimum change in either total before a persist is considered.
    pub persist_min_delta_wh: f64,
    /// Minimum time between persists.
    pub persist_min_interval: Duration,
}

impl Default for EnergyConfig {
    fn default() -> Self {
        EnergyConfig {
            persist_min_delta_wh: 10.0,
            persist_min_interval: Duration::from_millis(60_000),
        }
    }
}

/// Integrator state; totals are monotonically non-decreasing for the life
/// of the process.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EnergyState {
    pub charged_wh: f64,
    pub discharged_wh: f64,
    pub last_sample_ts_ms: u64,
    pub last_persist_ts_ms: u64,
    pub last_persisted_charged_wh: f64,
    pub last_persisted_discharged_wh: f64,
}

/// A persist request handed to the persistence worker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PersistRequest {
    pub charged_wh: f64,
    pub discharged_wh: f64,
    pub timestamp_ms: u64,
}

struct IntegratorState {
    energy: EnergyState,
    /// False until the first sample has seeded the clock. A plain flag
    /// rather than a timestamp sentinel, so a first sample at t = 0 still
    /// primes integration.
    primed: bool,
}

/// Energy integrator; shared between the poll listener, the persistence
/// worker, and the 0x378 encoder.
pub struct EnergyIntegrator {
    state: Mutex<IntegratorState>,
    config: EnergyConfig,
    persist_tx: tokio::sync::mpsc::Sender<PersistRequest>,
}

impl EnergyIntegrator {
    /// Creates the integrator and the channel end the persistence worker
    /// drains. The channel is shallow: a stuck worker loses persist
    /// triggers, never integration.
    pub fn new(
        config: EnergyConfig,
    ) -> (Self, tokio::sync::mpsc::Receiver<PersistRequest>) {
        let (persist_tx, persist_rx) = tokio::sync::mpsc::channel(4);
        (
            EnergyIntegrator {
                state: Mutex::new(IntegratorState {
                    energy: EnergyState::default(),
                    primed: false,
                }),
                config,
                persist_tx,
            },
            persist_rx,
        )
    }

    /// Seeds the totals from the persisted record at startup.
    pub fn restore(&self, charged_wh: f64, discharged_wh: f64) -> Result<(), Error> {
        let mut inner = lock_with_budget(&self.state, ENERGY_LOCK_BUDGET, "energy state")?;
        let state = &mut inner.energy;
        state.charged_wh = charged_wh.max(0.0);
        state.discharged_wh = discharged_wh.max(0.0);
        state.last_persisted_charged_wh = state.charged_wh;
        state.last_persisted_discharged_wh = state.discharged_wh;
        info!(
            "energy counters restored: {:.1} Wh charged, {:.1} Wh discharged",
            state.charged_wh, state.discharged_wh
        );
        Ok(())
    }

    /// Copies out the current state.
    pub fn state(&self) -> Result<EnergyState, Error> {
        Ok(lock_with_budget(&self.state, ENERGY_LOCK_BUDGET, "energy state")?.energy)
    }

    /// Integrates one snapshot. Called synchronously from the live-data
    /// fan-out; a missed lock budget skips the sample rather than blocking
    /// the poll loop.
    pub fn on_snapshot(&self, snapshot: &LiveData) {
        if let Err(e) = self.integrate(snapshot) {
            warn!("energy integration skipped: {e}");
        }
    }

    fn integrate(&self, snapshot: &LiveData) -> Result<(), Error> {
        let t_ms = snapshot.timestamp_ms;
        let mut voltage = snapshot.pack_voltage_v as f64;
        let mut current = snapshot.pack_current_a as f64;
        if !voltage.is_finite() {
            voltage = 0.0;
        }
        if !current.is_finite() {
            current = 0.0;
        }

        let request = {
            let mut inner = lock_with_budget(&self.state, ENERGY_LOCK_BUDGET, "energy state")?;

            if !inner.primed {
                inner.primed = true;
                inner.energy.last_sample_ts_ms = t_ms;
                return Ok(());
            }
            let state = &mut inner.energy;

            let dt_hours =
                (t_ms as f64 - state.last_sample_ts_ms as f64) / 3_600_000.0;
            if dt_hours <= 0.0 || dt_hours > MAX_SAMPLE_GAP_HOURS {
                debug!("rejecting sample with dt {dt_hours:.4} h");
                state.last_sample_ts_ms = t_ms;
                return Ok(());
            }

            let delta_wh = voltage * current * dt_hours;
            if delta_wh > 0.0 {
                state.charged_wh += delta_wh;
            } else {
                state.discharged_wh += delta_wh.abs();
            }
            state.last_sample_ts_ms = t_ms;

            let charged_delta =
                (state.charged_wh - state.last_persisted_charged_wh).abs();
            let discharged_delta =
                (state.discharged_wh - state.last_persisted_discharged_wh).abs();
            let interval_ms = self.config.persist_min_interval.as_millis() as u64;
            let due = (charged_delta >= self.config.persist_min_delta_wh
                || discharged_delta >= self.config.persist_min_delta_wh)
                && t_ms.saturating_sub(state.last_persist_ts_ms) >= interval_ms;

            due.then_some(PersistRequest {
                charged_wh: state.charged_wh,
                discharged_wh: state.discharged_wh,
                timestamp_ms: t_ms,
            })
        };

        if let Some(request) = request {
            // A full queue means the worker is already writing; the next
            // trigger carries newer totals.
            if self.persist_tx.try_send(request).is_err() {
                debug!("persistence queue full, trigger dropped");
            }
        }
        Ok(())
    }

    /// Called by the persistence worker after a successful write; only then
    /// do the persisted-watermark fields advance.
    pub fn mark_persisted(&self, request: &PersistRequest) -> Result<(), Error> {
        let mut inner = lock_with_budget(&self.state, ENERGY_LOCK_BUDGET, "energy state")?;
        inner.energy.last_persisted_charged_wh = request.charged_wh;
        inner.energy.last_persisted_discharged_wh = request.discharged_wh;
        inner.energy.last_persist_ts_ms = request.timestamp_ms;
        Ok(())
    }
}
