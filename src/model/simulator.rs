//! # BMS Simulator
//!
//! Synthesises plausible pack snapshots and publishes them through the
//! live-data model, driving the whole CAN side without TinyBMS hardware on
//! the bench. The model is a simple charge/discharge cycle with per-cell
//! noise from a deterministic LCG, so runs are reproducible.

use crate::model::live_data::{LiveData, OnlineStatus};
use crate::model::store::LiveDataStore;
use crate::util::now_ms;
use log::{info, warn};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;

/// Simulated pack parameters.
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Snapshot cadence.
    pub cycle: Duration,
    pub series_cell_count: u16,
    pub capacity_ah: f32,
    /// Charge and discharge current magnitude.
    pub cycle_current_a: f32,
    /// Nominal per-cell voltage at 50 % SOC.
    pub nominal_cell_mv: u16,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        SimulatorConfig {
            cycle: Duration::from_millis(1000),
            series_cell_count: 16,
            capacity_ah: 280.0,
            cycle_current_a: 40.0,
            nominal_cell_mv: 3300,
        }
    }
}

/// Charge/discharge phase of the simulated cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Charging,
    Discharging,
}

/// Snapshot generator with the state of the simulated pack.
pub struct BmsSimulator {
    store: LiveDataStore,
    config: SimulatorConfig,
    state: std::sync::Mutex<SimState>,
}

struct SimState {
    soc_percent: f64,
    phase: Phase,
    /// LCG state for cell noise.
    seed: u32,
    last_timestamp_ms: u64,
}

impl BmsSimulator {
    pub fn new(store: LiveDataStore, config: SimulatorConfig) -> Self {
        BmsSimulator {
            store,
            config,
            state: std::sync::Mutex::new(SimState {
                soc_percent: 65.0,
                phase: Phase::Charging,
                seed: 0x2545_F491,
                last_timestamp_ms: 0,
            }),
        }
    }

    /// Advances the pack model by one cycle and returns the snapshot.
    pub fn step(&self) -> LiveData {
        let mut state = self.state.lock().unwrap();
        let config = &self.config;

        // SOC moves by current over capacity per cycle.
        let dt_h = config.cycle.as_secs_f64() / 3600.0;
        let delta_soc =
            config.cycle_current_a as f64 * dt_h / config.capacity_ah as f64 * 100.0;
        match state.phase {
            Phase::Charging => {
                state.soc_percent += delta_soc;
                if state.soc_percent >= 99.0 {
                    state.phase = Phase::Discharging;
                }
            }
            Phase::Discharging => {
                state.soc_percent -= delta_soc;
                if state.soc_percent <= 20.0 {
                    state.phase = Phase::Charging;
                }
            }
        }
        state.soc_percent = state.soc_percent.clamp(0.0, 100.0);

        let current_a = match state.phase {
            Phase::Charging => config.cycle_current_a,
            Phase::Discharging => -config.cycle_current_a,
        };

        // Cell voltage tracks SOC linearly between 3.0 V and 3.45 V around
        // the nominal midpoint, plus a few millivolts of noise per cell.
        let base_mv = config.nominal_cell_mv as f64 + (state.soc_percent - 50.0) * 4.5;
        let mut snapshot = LiveData {
            pack_current_a: current_a,
            soc_percent: state.soc_percent as f32,
            soh_percent: 100.0,
            temperatures_deci_c: [Some(250), Some(235), None],
            status: if current_a > 0.0 {
                OnlineStatus::Charging
            } else {
                OnlineStatus::Discharging
            },
            series_cell_count: Some(config.series_cell_count),
            capacity_ah: Some(config.capacity_ah),
            charge_current_limit_a: Some(150.0),
            discharge_current_limit_a: Some(200.0),
            overvoltage_cutoff_mv: Some(3650),
            undervoltage_cutoff_mv: Some(2800),
            over_temp_cutoff_c: Some(60),
            low_temp_charge_cutoff_c: Some(0),
            battery_name: Some("Simulated Pack".to_string()),
            firmware_version: Some(0x0100),
            ..LiveData::default()
        };
        for cell in snapshot
            .cell_mv
            .iter_mut()
            .take(config.series_cell_count.min(16) as usize)
        {
            // xorshift step, noise in -4..=3 mV.
            state.seed ^= state.seed << 13;
            state.seed ^= state.seed >> 17;
            state.seed ^= state.seed << 5;
            let noise = (state.seed % 8) as i64 - 4;
            *cell = (base_mv as i64 + noise).clamp(2500, 3700) as u16;
        }
        snapshot.finalize_derived();
        snapshot.pack_voltage_v = snapshot
            .cell_mv
            .iter()
            .take(config.series_cell_count.min(16) as usize)
            .map(|&mv| mv as f32 / 1000.0)
            .sum();

        let ts = now_ms().max(state.last_timestamp_ms + 1);
        state.last_timestamp_ms = ts;
        snapshot.timestamp_ms = ts;
        snapshot
    }

    /// Publishes snapshots until `shutdown` flips true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        if let Err(e) = self.store.set_simulation() {
            warn!("{e}");
        }
        info!("bms simulator running");
        while !*shutdown.borrow() {
            let snapshot = self.step();
            if let Err(e) = self.store.publish(snapshot) {
                warn!("simulator publish failed: {e}");
            }
            tokio::select! {
                _ = sleep(self.config.cycle) => {}
                _ = shutdown.changed() => {}
            }
        }
        info!("bms simulator exiting");
    }
}
