//! # Gateway Configuration
//!
//! One JSON document loaded at startup. Unknown keys are ignored; a value
//! of the wrong type or outside its sane range is reported and replaced by
//! the default, field by field, so one bad entry never takes down the whole
//! configuration.

use crate::energy::integrator::EnergyConfig;
use crate::error::Error;
use crate::tinybms::client::PollConfig;
use crate::tinybms::serial::SerialConfig;
use crate::victron::can::CanConfig;
use crate::victron::cvl::CvlConfig;
use crate::victron::publisher::PublisherConfig;
use log::warn;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Full gateway configuration; every documented default is overridable.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayConfig {
    pub serial: SerialConfig,
    pub poll: PollConfig,
    pub energy: EnergyConfig,
    /// Where the durable energy record lives.
    pub energy_store_path: PathBuf,
    pub cvl: CvlConfig,
    pub can: CanConfig,
    pub publisher: PublisherConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            serial: SerialConfig::default(),
            poll: PollConfig::default(),
            energy: EnergyConfig::default(),
            energy_store_path: PathBuf::from("tinybms-energy.json"),
            cvl: CvlConfig::default(),
            can: CanConfig::default(),
            publisher: PublisherConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Loads and merges the JSON file at `path` over the defaults.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Io(format!("reading {}: {e}", path.display())))?;
        let value: Value = serde_json::from_str(&text)
            .map_err(|e| Error::InvalidArg(format!("config is not valid JSON: {e}")))?;
        Ok(Self::from_value(&value))
    }

    /// Merges a parsed JSON document over the defaults. Applying the same
    /// document twice yields the same configuration.
    pub fn from_value(root: &Value) -> Self {
        let mut config = GatewayConfig::default();

        if let Some(map) = section(root, "serial") {
            merge_string(&mut config.serial.port, map, "port");
            merge_u32(&mut config.serial.baudrate, map, "baudrate", 1200, 1_000_000);
            merge_duration_ms(&mut config.serial.reply_timeout, map, "reply_timeout_ms", 10, 60_000);
        }

        if let Some(map) = section(root, "poll") {
            merge_duration_ms(&mut config.poll.cycle, map, "cycle_ms", 50, 3_600_000);
            merge_u32(&mut config.poll.settings_every, map, "settings_every", 1, 1000);
            merge_u32(&mut config.poll.retries, map, "retries", 1, 10);
            merge_duration_ms(&mut config.poll.retry_backoff, map, "retry_backoff_ms", 0, 10_000);
            merge_u32(&mut config.poll.failure_threshold, map, "failure_threshold", 1, 100);
        }

        if let Some(map) = section(root, "energy") {
            merge_f64(&mut config.energy.persist_min_delta_wh, map, "persist_min_delta_wh", 0.1, 100_000.0);
            merge_duration_ms(&mut config.energy.persist_min_interval, map, "persist_min_interval_ms", 1000, 86_400_000);
            let mut store_path = config.energy_store_path.display().to_string();
            merge_string(&mut store_path, map, "store_path");
            config.energy_store_path = PathBuf::from(store_path);
        }

        if let Some(map) = section(root, "cvl") {
            let cvl = &mut config.cvl;
            merge_f32(&mut cvl.bulk_soc_threshold, map, "bulk_soc_threshold", 0.0, 100.0);
            merge_f32(&mut cvl.transition_soc_threshold, map, "transition_soc_threshold", 0.0, 100.0);
            merge_f32(&mut cvl.float_soc_threshold, map, "float_soc_threshold", 0.0, 100.0);
            merge_f32(&mut cvl.float_exit_soc, map, "float_exit_soc", 0.0, 100.0);
            merge_f32(&mut cvl.float_approach_offset_mv, map, "float_approach_offset_mv", 0.0, 1000.0);
            merge_f32(&mut cvl.float_offset_mv, map, "float_offset_mv", 0.0, 1000.0);
            merge_f32(&mut cvl.minimum_ccl_in_float_a, map, "minimum_ccl_in_float_a", 0.0, 1000.0);
            merge_f32(&mut cvl.sustain_soc_entry, map, "sustain_soc_entry", 0.0, 100.0);
            merge_f32(&mut cvl.sustain_soc_exit, map, "sustain_soc_exit", 0.0, 100.0);
            merge_f32(&mut cvl.sustain_cell_voltage_v, map, "sustain_cell_voltage_v", 1.0, 5.0);
            merge_f32(&mut cvl.sustain_ccl_limit_a, map, "sustain_ccl_limit_a", 0.0, 1000.0);
            merge_f32(&mut cvl.sustain_dcl_limit_a, map, "sustain_dcl_limit_a", 0.0, 1000.0);
            merge_f32(&mut cvl.max_recovery_step_v, map, "max_recovery_step_v", 0.01, 10.0);
            merge_f32(&mut cvl.imbalance_hold_threshold_mv, map, "imbalance_hold_threshold_mv", 1.0, 2000.0);
            merge_f32(&mut cvl.imbalance_release_threshold_mv, map, "imbalance_release_threshold_mv", 1.0, 2000.0);
            merge_f32(&mut cvl.imbalance_drop_per_mv, map, "imbalance_drop_per_mv", 0.0, 1.0);
            merge_f32(&mut cvl.imbalance_drop_max_v, map, "imbalance_drop_max_v", 0.0, 20.0);
            merge_u16(&mut cvl.series_cell_count, map, "series_cell_count", 1, 64);
            merge_f32(&mut cvl.cell_max_voltage_v, map, "cell_max_voltage_v", 2.0, 5.0);
            merge_f32(&mut cvl.cell_safety_threshold_v, map, "cell_safety_threshold_v", 2.0, 5.0);
            merge_f32(&mut cvl.cell_safety_release_v, map, "cell_safety_release_v", 2.0, 5.0);
            merge_f32(&mut cvl.cell_min_float_voltage_v, map, "cell_min_float_voltage_v", 2.0, 5.0);
            merge_f32(&mut cvl.cell_protection_kp, map, "cell_protection_kp", 0.0, 10_000.0);
            merge_f32(&mut cvl.dynamic_current_nominal_a, map, "dynamic_current_nominal_a", 1.0, 10_000.0);
        }

        if let Some(map) = section(root, "can") {
            merge_u32(&mut config.can.bitrate, map, "bitrate", 10_000, 1_000_000);
            merge_duration_ms(&mut config.can.keepalive_interval, map, "keepalive_interval_ms", 100, 60_000);
            merge_duration_ms(&mut config.can.keepalive_timeout, map, "keepalive_timeout_ms", 500, 600_000);
            merge_duration_ms(&mut config.can.keepalive_retry, map, "keepalive_retry_ms", 100, 60_000);
            merge_duration_ms(&mut config.can.busoff_backoff, map, "busoff_backoff_ms", 100, 600_000);
        }

        if let Some(map) = section(root, "publisher") {
            merge_duration_ms(&mut config.publisher.publish_interval, map, "publish_interval_ms", 0, 60_000);
        }

        if let Some(map) = section(root, "identity") {
            let identity = &mut config.publisher.identity;
            merge_string(&mut identity.manufacturer, map, "manufacturer");
            merge_string(&mut identity.battery_name, map, "battery_name");
            merge_string(&mut identity.serial_number, map, "serial_number");
            merge_string(&mut identity.family, map, "family");
        }

        config
    }
}

fn section<'a>(root: &'a Value, name: &str) -> Option<&'a Map<String, Value>> {
    match root.get(name) {
        None => None,
        Some(Value::Object(map)) => Some(map),
        Some(other) => {
            warn!("config section '{name}' is {other:?}, not an object; using defaults");
            None
        }
    }
}

fn merge_f64(dst: &mut f64, map: &Map<String, Value>, key: &str, lo: f64, hi: f64) {
    if let Some(value) = map.get(key) {
        match value.as_f64() {
            Some(v) if (lo..=hi).contains(&v) => *dst = v,
            _ => warn!("config '{key}' = {value} invalid (want {lo}..={hi}), keeping {dst}"),
        }
    }
}

fn merge_f32(dst: &mut f32, map: &Map<String, Value>, key: &str, lo: f32, hi: f32) {
    let mut wide = *dst as f64;
    merge_f64(&mut wide, map, key, lo as f64, hi as f64);
    *dst = wide as f32;
}

fn merge_u32(dst: &mut u32, map: &Map<String, Value>, key: &str, lo: u32, hi: u32) {
    if let Some(value) = map.get(key) {
        match value.as_u64() {
            Some(v) if (lo as u64..=hi as u64).contains(&v) => *dst = v as u32,
            _ => warn!("config '{key}' = {value} invalid (want {lo}..={hi}), keeping {dst}"),
        }
    }
}

fn merge_u16(dst: &mut u16, map: &Map<String, Value>, key: &str, lo: u16, hi: u16) {
    let mut wide = *dst as u32;
    merge_u32(&mut wide, map, key, lo as u32, hi as u32);
    *dst = wide as u16;
}

fn merge_duration_ms(
    dst: &mut Duration,
    map: &Map<String, Value>,
    key: &str,
    lo_ms: u64,
    hi_ms: u64,
) {
    if let Some(value) = map.get(key) {
        match value.as_u64() {
            Some(v) if (lo_ms..=hi_ms).contains(&v) => *dst = Duration::from_millis(v),
            _ => warn!(
                "config '{key}' = {value} invalid (want {lo_ms}..={hi_ms} ms), keeping {dst:?}"
            ),
        }
    }
}

fn merge_string(dst: &mut String, map: &Map<String, Value>, key: &str) {
    if let Some(value) = map.get(key) {
        match value.as_str() {
            Some(v) if !v.is_empty() => *dst = v.to_string(),
            _ => warn!("config '{key}' = {value} invalid (want non-empty string), keeping {dst}"),
        }
    }
}
