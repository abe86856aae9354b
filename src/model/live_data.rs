//! # Live-Data Snapshot
//!
//! Typed view of the most recent TinyBMS poll cycle. A snapshot is built by
//! the client from decoded register blocks; settings-derived fields stay
//! `None` until the settings block has been read at least once, and encoders
//! that depend on them skip their frame rather than emit zeros.

use crate::constants::{
    TINYBMS_STATUS_CHARGING, TINYBMS_STATUS_DISCHARGING, TINYBMS_STATUS_FAULT,
    TINYBMS_STATUS_FULLY_CHARGED, TINYBMS_STATUS_IDLE, TINYBMS_STATUS_REGENERATION,
};
use crate::tinybms::registers::{lookup, RegisterValue};
use std::collections::BTreeMap;

/// Online status reported by the BMS (register 50).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OnlineStatus {
    Charging,
    FullyCharged,
    Discharging,
    Regeneration,
    Idle,
    Fault,
    #[default]
    Unknown,
}

impl OnlineStatus {
    pub fn from_code(code: u16) -> Self {
        match code {
            TINYBMS_STATUS_CHARGING => OnlineStatus::Charging,
            TINYBMS_STATUS_FULLY_CHARGED => OnlineStatus::FullyCharged,
            TINYBMS_STATUS_DISCHARGING => OnlineStatus::Discharging,
            TINYBMS_STATUS_REGENERATION => OnlineStatus::Regeneration,
            TINYBMS_STATUS_IDLE => OnlineStatus::Idle,
            TINYBMS_STATUS_FAULT => OnlineStatus::Fault,
            _ => OnlineStatus::Unknown,
        }
    }
}

/// Snapshot of the pack state after one successful poll cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LiveData {
    /// Per-cell voltages in millivolts; cells beyond the series count read 0.
    pub cell_mv: [u16; 16],
    pub pack_voltage_v: f32,
    /// Pack current in amperes, charge positive.
    pub pack_current_a: f32,
    /// Derived from the populated cells each cycle.
    pub min_cell_mv: u16,
    pub max_cell_mv: u16,
    /// Bit i set means cell i+1 is balancing.
    pub balancing_bitmap: u16,
    /// State of charge in percent, 0.01 resolution.
    pub soc_percent: f32,
    /// State of health in percent, 0.01 resolution.
    pub soh_percent: f32,
    /// Internal and two external sensors in 0.1 C; a missing probe is None.
    pub temperatures_deci_c: [Option<i16>; 3],
    pub status: OnlineStatus,
    // Settings-block fields; None until the settings block has been read.
    pub series_cell_count: Option<u16>,
    pub capacity_ah: Option<f32>,
    pub charge_current_limit_a: Option<f32>,
    pub discharge_current_limit_a: Option<f32>,
    pub overvoltage_cutoff_mv: Option<u16>,
    pub undervoltage_cutoff_mv: Option<u16>,
    pub over_temp_cutoff_c: Option<i16>,
    pub low_temp_charge_cutoff_c: Option<i16>,
    pub battery_name: Option<String>,
    pub firmware_version: Option<u16>,
    pub hardware_version: Option<u16>,
    /// Monotonically increasing across published snapshots.
    pub timestamp_ms: u64,
}

/// TinyBMS reports 0x8000 in a temperature register when no probe is fitted.
const TEMP_PROBE_ABSENT: i16 = i16::MIN;

impl LiveData {
    /// Folds a decoded register block into the snapshot.
    ///
    /// Addresses not modelled here (lifetime counters, statistics) are
    /// ignored; they are catalogued for display but carry no snapshot field.
    pub fn apply_registers(&mut self, values: &BTreeMap<u16, RegisterValue>) {
        let mut name_words: [Option<&str>; 4] = [None; 4];

        for (&address, value) in values {
            match address {
                0..=15 => {
                    // Catalogue scale turns 0.1 mV raw units into mV.
                    if let (Some(desc), Some(raw)) = (lookup(address), value.as_u16()) {
                        self.cell_mv[address as usize] =
                            (raw as f64 * desc.scale).round() as u16;
                    }
                }
                36 => {
                    if let Some(v) = value.as_f32() {
                        self.pack_voltage_v = v;
                    }
                }
                38 => {
                    if let Some(v) = value.as_f32() {
                        self.pack_current_a = v;
                    }
                }
                42 | 43 | 48 => {
                    let slot = match address {
                        48 => 0,
                        42 => 1,
                        _ => 2,
                    };
                    self.temperatures_deci_c[slot] =
                        value.as_i16().filter(|&t| t != TEMP_PROBE_ABSENT);
                }
                44 => {
                    if let Some(v) = value.as_u16() {
                        self.balancing_bitmap = v;
                    }
                }
                45 => {
                    if let Some(v) = value.as_u16() {
                        self.soh_percent = v as f32 * 0.01;
                    }
                }
                46 => {
                    if let Some(v) = value.as_u32() {
                        // Raw unit is 1e-6 percent; keep 0.01 % resolution.
                        self.soc_percent = ((v as f64 * 1e-6) * 100.0).round() as f32 / 100.0;
                    }
                }
                50 => {
                    if let Some(v) = value.as_u16() {
                        self.status = OnlineStatus::from_code(v);
                    }
                }
                301 => self.series_cell_count = value.as_u16(),
                306 => self.capacity_ah = value.as_u16().map(|v| v as f32 * 0.01),
                315 => self.overvoltage_cutoff_mv = value.as_u16(),
                316 => self.undervoltage_cutoff_mv = value.as_u16(),
                317 => self.discharge_current_limit_a = value.as_u16().map(|v| v as f32),
                318 => self.charge_current_limit_a = value.as_u16().map(|v| v as f32),
                319 => self.over_temp_cutoff_c = value.as_i16(),
                320 => self.low_temp_charge_cutoff_c = value.as_i16(),
                332..=335 => {
                    if let RegisterValue::Ascii(s) = value {
                        name_words[(address - 332) as usize] = Some(s.as_str());
                    }
                }
                340 => self.hardware_version = value.as_u16(),
                341 => self.firmware_version = value.as_u16(),
                _ => {}
            }
        }

        if name_words.iter().any(|w| w.is_some()) {
            let name: String = name_words.iter().flatten().copied().collect();
            if !name.is_empty() {
                self.battery_name = Some(name);
            }
        }
    }

    /// Recomputes the derived fields from the populated cells.
    pub fn finalize_derived(&mut self) {
        let count = self
            .series_cell_count
            .map(|c| (c as usize).min(16))
            .unwrap_or(16);
        let populated: Vec<u16> = self.cell_mv[..count]
            .iter()
            .copied()
            .filter(|&mv| mv > 0)
            .collect();
        self.min_cell_mv = populated.iter().copied().min().unwrap_or(0);
        self.max_cell_mv = populated.iter().copied().max().unwrap_or(0);
    }

    /// Cell imbalance in millivolts.
    pub fn imbalance_mv(&self) -> u16 {
        self.max_cell_mv.saturating_sub(self.min_cell_mv)
    }

    /// Mean of the fitted temperature probes in 0.1 C.
    pub fn average_temp_deci_c(&self) -> Option<i16> {
        let fitted: Vec<i32> = self
            .temperatures_deci_c
            .iter()
            .flatten()
            .map(|&t| t as i32)
            .collect();
        if fitted.is_empty() {
            None
        } else {
            Some((fitted.iter().sum::<i32>() / fitted.len() as i32) as i16)
        }
    }

    /// Minimum of the fitted probes in 0.1 C.
    pub fn min_temp_deci_c(&self) -> Option<i16> {
        self.temperatures_deci_c.iter().flatten().copied().min()
    }

    /// Maximum of the fitted probes in 0.1 C.
    pub fn max_temp_deci_c(&self) -> Option<i16> {
        self.temperatures_deci_c.iter().flatten().copied().max()
    }

    /// Index (0-based) of the lowest-voltage populated cell.
    pub fn min_cell_index(&self) -> Option<usize> {
        self.cell_mv
            .iter()
            .enumerate()
            .filter(|(_, &mv)| mv > 0)
            .min_by_key(|(_, &mv)| mv)
            .map(|(i, _)| i)
    }

    /// Index (0-based) of the highest-voltage populated cell.
    pub fn max_cell_index(&self) -> Option<usize> {
        self.cell_mv
            .iter()
            .enumerate()
            .filter(|(_, &mv)| mv > 0)
            .max_by_key(|(_, &mv)| mv)
            .map(|(i, _)| i)
    }
}
