//! # Alarm and Warning Encoding (frame 0x35A)
//!
//! Victron packs alarm state into 2-bit sub-fields, LSB first within each
//! byte: `00` = unsupported, `01` = ok, `10` = active. Bytes 0..3 carry
//! alarms, bytes 4..7 mirror them as warnings; byte 5 additionally encodes
//! the low-temperature-charge warning and byte 7 the "system online" marker.

use crate::constants::{
    ALARM_IMBALANCE_MV, ALARM_OVERCURRENT_FRACTION, ALARM_OVER_TEMP_DECI_C,
    ALARM_UNDER_TEMP_DECI_C,
};
use crate::model::live_data::LiveData;

/// One 2-bit alarm field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlarmBit {
    Unsupported = 0b00,
    Ok = 0b01,
    Active = 0b10,
}

impl AlarmBit {
    fn from_flag(active: bool) -> Self {
        if active {
            AlarmBit::Active
        } else {
            AlarmBit::Ok
        }
    }

    /// Judges a condition that needs a measurement which may be absent.
    fn from_measurement(measured: Option<bool>) -> Self {
        match measured {
            None => AlarmBit::Unsupported,
            Some(active) => AlarmBit::from_flag(active),
        }
    }

    fn at(self, bit_pos: u8) -> u8 {
        (self as u8) << bit_pos
    }
}

/// Per-condition judgement for one snapshot.
#[derive(Debug, Clone, Copy)]
pub struct AlarmSet {
    pub pack_over_voltage: AlarmBit,
    pub pack_under_voltage: AlarmBit,
    pub over_temperature: AlarmBit,
    pub under_temperature: AlarmBit,
    pub high_temperature_charge: AlarmBit,
    pub low_temperature_charge: AlarmBit,
    pub discharge_over_current: AlarmBit,
    pub charge_over_current: AlarmBit,
    pub cell_imbalance: AlarmBit,
}

impl AlarmSet {
    /// Evaluates every condition against the snapshot.
    pub fn evaluate(snapshot: &LiveData) -> Self {
        let t_max = snapshot.max_temp_deci_c();
        let t_min = snapshot.min_temp_deci_c();
        let current = snapshot.pack_current_a;
        let charging = current > 0.0;

        let pack_over_voltage =
            AlarmBit::from_measurement(snapshot.overvoltage_cutoff_mv.map(|cutoff| {
                snapshot.max_cell_mv >= cutoff
            }));
        let pack_under_voltage =
            AlarmBit::from_measurement(snapshot.undervoltage_cutoff_mv.map(|cutoff| {
                snapshot.min_cell_mv > 0 && snapshot.min_cell_mv <= cutoff
            }));

        let over_temperature =
            AlarmBit::from_measurement(t_max.map(|t| t >= ALARM_OVER_TEMP_DECI_C));
        let under_temperature =
            AlarmBit::from_measurement(t_min.map(|t| t <= ALARM_UNDER_TEMP_DECI_C));
        let high_temperature_charge = AlarmBit::from_measurement(
            t_max.map(|t| charging && t >= ALARM_OVER_TEMP_DECI_C),
        );
        // Charging below the BMS's low-temperature cut-off (0 C when the
        // BMS has not reported one).
        let low_temp_limit = snapshot.low_temp_charge_cutoff_c.unwrap_or(0) as i32 * 10;
        let low_temperature_charge = AlarmBit::from_measurement(
            t_min.map(|t| charging && (t as i32) <= low_temp_limit),
        );

        let discharge_over_current = AlarmBit::from_measurement(
            snapshot.discharge_current_limit_a.map(|dcl| {
                current < 0.0 && current.abs() >= ALARM_OVERCURRENT_FRACTION * dcl
            }),
        );
        let charge_over_current =
            AlarmBit::from_measurement(snapshot.charge_current_limit_a.map(|ccl| {
                charging && current >= ALARM_OVERCURRENT_FRACTION * ccl
            }));

        let cell_imbalance = AlarmBit::from_flag(snapshot.imbalance_mv() >= ALARM_IMBALANCE_MV);

        AlarmSet {
            pack_over_voltage,
            pack_under_voltage,
            over_temperature,
            under_temperature,
            high_temperature_charge,
            low_temperature_charge,
            discharge_over_current,
            charge_over_current,
            cell_imbalance,
        }
    }

    fn any_active(&self) -> bool {
        [
            self.pack_over_voltage,
            self.pack_under_voltage,
            self.over_temperature,
            self.under_temperature,
            self.high_temperature_charge,
            self.discharge_over_current,
            self.charge_over_current,
            self.cell_imbalance,
        ]
        .iter()
        .any(|&b| b == AlarmBit::Active)
    }

    /// Packs the set into the 8-byte 0x35A payload.
    pub fn encode(&self) -> [u8; 8] {
        let overall = AlarmBit::from_flag(self.any_active());

        let byte0 = overall.at(0)
            | self.pack_over_voltage.at(2)
            | self.pack_under_voltage.at(4)
            | self.over_temperature.at(6);
        let byte1 = self.under_temperature.at(0)
            | self.high_temperature_charge.at(2)
            | 0b11 << 4
            | self.discharge_over_current.at(6);
        let byte2 = self.charge_over_current.at(0) | 0b111111 << 2;
        let byte3 = self.cell_imbalance.at(0) | 0b111111 << 2;

        // Warning mirror; byte 5 swaps the reserved pair for the
        // low-temperature-charge warning, byte 7 marks the system online.
        let byte5 = self.under_temperature.at(0)
            | self.high_temperature_charge.at(2)
            | self.low_temperature_charge.at(4)
            | self.discharge_over_current.at(6);
        let byte7 = self.cell_imbalance.at(0) | AlarmBit::Ok.at(2) | 0b1111 << 4;

        [byte0, byte1, byte2, byte3, byte0, byte5, byte2, byte7]
    }
}

/// Convenience wrapper: evaluate and pack in one step.
pub fn encode_alarm_frame(snapshot: &LiveData) -> [u8; 8] {
    AlarmSet::evaluate(snapshot).encode()
}
