//! # Victron Encoder Table
//!
//! The 19 publisher channels of the Victron BMS-CAN dialect, each a pure
//! function from the gateway state to an 8-byte little-endian payload. An
//! encoder returns `None` when a field it depends on is unavailable, which
//! skips the frame for that cycle instead of emitting zeros.
//!
//! The keep-alive (0x305) is transmitted by the CAN driver's liveness
//! worker and the handshake (0x307) is inbound only; neither is a publisher
//! channel.

use crate::constants::{
    VICTRON_ID_ALARMS, VICTRON_ID_CAPACITY, VICTRON_ID_CELL_EXTREMES, VICTRON_ID_ENERGY,
    VICTRON_ID_FAMILY, VICTRON_ID_LIMITS, VICTRON_ID_MANUFACTURER, VICTRON_ID_MAX_CELL_ID,
    VICTRON_ID_MAX_TEMP_ID, VICTRON_ID_MIN_CELL_ID, VICTRON_ID_MIN_TEMP_ID, VICTRON_ID_MODULES,
    VICTRON_ID_NAME_1, VICTRON_ID_NAME_2, VICTRON_ID_SERIAL_1, VICTRON_ID_SERIAL_2,
    VICTRON_ID_SOC_SOH, VICTRON_ID_VERSION_CAPACITY, VICTRON_ID_VIT,
};
use crate::energy::integrator::EnergyState;
use crate::model::live_data::LiveData;
use crate::victron::alarms::encode_alarm_frame;
use crate::victron::cvl::CvlRuntime;
use std::time::Duration;

/// Names of the temperature probes, indexed like
/// `LiveData::temperatures_deci_c`.
const TEMP_SENSOR_NAMES: [&str; 3] = ["INT", "EXT1", "EXT2"];

/// Static identity strings published on the identification channels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatteryIdentity {
    pub manufacturer: String,
    /// Used when the BMS has not reported a battery name.
    pub battery_name: String,
    pub serial_number: String,
    pub family: String,
}

impl Default for BatteryIdentity {
    fn default() -> Self {
        BatteryIdentity {
            manufacturer: "ENERGUS".to_string(),
            battery_name: "TinyBMS Pack".to_string(),
            serial_number: "TBMS-0000".to_string(),
            family: "LiFePO4".to_string(),
        }
    }
}

/// Everything an encoder may consult.
pub struct EncoderContext<'a> {
    pub snapshot: &'a LiveData,
    /// Latest CVL runtime; `None` before the first computation.
    pub cvl: Option<CvlRuntime>,
    /// Energy totals, read under the integrator mutex by the caller.
    pub energy: Option<EnergyState>,
    pub identity: &'a BatteryIdentity,
}

/// A pure channel encoder.
pub type EncoderFn = fn(&EncoderContext) -> Option<[u8; 8]>;

/// One publisher channel.
pub struct PublisherChannel {
    pub can_id: u16,
    pub dlc: u8,
    pub period: Duration,
    pub encoder: EncoderFn,
    pub description: &'static str,
}

macro_rules! channel {
    ($id:expr, $period_ms:expr, $encoder:ident, $desc:expr) => {
        PublisherChannel {
            can_id: $id,
            dlc: 8,
            period: Duration::from_millis($period_ms),
            encoder: $encoder,
            description: $desc,
        }
    };
}

/// The mandatory 19 channels, in stable dispatch order.
pub static CHANNELS: &[PublisherChannel] = &[
    channel!(VICTRON_ID_LIMITS, 1000, encode_limits, "CVL/CCL/DCL"),
    channel!(VICTRON_ID_SOC_SOH, 1000, encode_soc_soh, "SOC/SOH"),
    channel!(VICTRON_ID_VIT, 1000, encode_vit, "Voltage/current/temperature"),
    channel!(VICTRON_ID_ALARMS, 1000, encode_alarms, "Alarms and warnings"),
    channel!(VICTRON_ID_MANUFACTURER, 2000, encode_manufacturer, "Manufacturer"),
    channel!(VICTRON_ID_VERSION_CAPACITY, 2000, encode_version_capacity, "Firmware/capacity"),
    channel!(VICTRON_ID_NAME_1, 2000, encode_name_1, "Battery name 1/2"),
    channel!(VICTRON_ID_NAME_2, 2000, encode_name_2, "Battery name 2/2"),
    channel!(VICTRON_ID_MODULES, 1000, encode_modules, "Module counts"),
    channel!(VICTRON_ID_CELL_EXTREMES, 1000, encode_cell_extremes, "Cell/temperature extremes"),
    channel!(VICTRON_ID_MIN_CELL_ID, 1000, encode_min_cell_id, "Minimum cell identifier"),
    channel!(VICTRON_ID_MAX_CELL_ID, 1000, encode_max_cell_id, "Maximum cell identifier"),
    channel!(VICTRON_ID_MIN_TEMP_ID, 1000, encode_min_temp_id, "Minimum temperature sensor"),
    channel!(VICTRON_ID_MAX_TEMP_ID, 1000, encode_max_temp_id, "Maximum temperature sensor"),
    channel!(VICTRON_ID_ENERGY, 1000, encode_energy, "Energy counters"),
    channel!(VICTRON_ID_CAPACITY, 5000, encode_capacity, "Installed capacity"),
    channel!(VICTRON_ID_SERIAL_1, 5000, encode_serial_1, "Serial number 1/2"),
    channel!(VICTRON_ID_SERIAL_2, 5000, encode_serial_2, "Serial number 2/2"),
    channel!(VICTRON_ID_FAMILY, 5000, encode_family, "Battery family"),
];

/// Looks up a channel by CAN identifier.
pub fn channel_by_id(can_id: u16) -> Option<&'static PublisherChannel> {
    CHANNELS.iter().find(|c| c.can_id == can_id)
}

fn put_u16(buf: &mut [u8; 8], at: usize, value: u16) {
    buf[at..at + 2].copy_from_slice(&value.to_le_bytes());
}

fn put_i16(buf: &mut [u8; 8], at: usize, value: i16) {
    buf[at..at + 2].copy_from_slice(&value.to_le_bytes());
}

fn put_u32(buf: &mut [u8; 8], at: usize, value: u32) {
    buf[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

/// Rounds a scaled value into u16, saturating at the ends.
fn scale_u16(value: f32, factor: f32) -> u16 {
    (value * factor).round().clamp(0.0, u16::MAX as f32) as u16
}

/// Rounds a scaled value into i16, saturating at the ends.
fn scale_i16(value: f32, factor: f32) -> i16 {
    (value * factor)
        .round()
        .clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

/// Null-padded ASCII, truncated to eight bytes.
fn ascii8(text: &str) -> [u8; 8] {
    let mut buf = [0u8; 8];
    for (slot, byte) in buf.iter_mut().zip(text.bytes()) {
        *slot = byte;
    }
    buf
}

fn encode_limits(ctx: &EncoderContext) -> Option<[u8; 8]> {
    let cvl = ctx.cvl?;
    let mut buf = [0u8; 8];
    put_u16(&mut buf, 0, scale_u16(cvl.cvl_v, 10.0));
    put_u16(&mut buf, 2, scale_u16(cvl.ccl_a, 10.0));
    put_u16(&mut buf, 4, scale_u16(cvl.dcl_a, 10.0));
    Some(buf)
}

fn encode_soc_soh(ctx: &EncoderContext) -> Option<[u8; 8]> {
    let s = ctx.snapshot;
    let mut buf = [0u8; 8];
    put_u16(&mut buf, 0, scale_u16(s.soc_percent, 100.0));
    put_u16(&mut buf, 2, scale_u16(s.soh_percent, 100.0));
    put_u16(&mut buf, 4, scale_u16(s.soc_percent, 100.0));
    Some(buf)
}

fn encode_vit(ctx: &EncoderContext) -> Option<[u8; 8]> {
    let s = ctx.snapshot;
    let temp = s.average_temp_deci_c()?;
    let mut buf = [0u8; 8];
    put_i16(&mut buf, 0, scale_i16(s.pack_voltage_v, 100.0));
    put_i16(&mut buf, 2, scale_i16(s.pack_current_a, 10.0));
    put_i16(&mut buf, 4, temp);
    Some(buf)
}

fn encode_alarms(ctx: &EncoderContext) -> Option<[u8; 8]> {
    Some(encode_alarm_frame(ctx.snapshot))
}

fn encode_manufacturer(ctx: &EncoderContext) -> Option<[u8; 8]> {
    Some(ascii8(&ctx.identity.manufacturer))
}

fn encode_version_capacity(ctx: &EncoderContext) -> Option<[u8; 8]> {
    let s = ctx.snapshot;
    let firmware = s.firmware_version?;
    let capacity_ah = s.capacity_ah?;
    let mut buf = [0u8; 8];
    put_u32(&mut buf, 0, firmware as u32);
    put_u32(
        &mut buf,
        4,
        (capacity_ah as f64 * 100.0).round().clamp(0.0, u32::MAX as f64) as u32,
    );
    Some(buf)
}

fn battery_name(ctx: &EncoderContext) -> String {
    ctx.snapshot
        .battery_name
        .clone()
        .unwrap_or_else(|| ctx.identity.battery_name.clone())
}

fn encode_name_1(ctx: &EncoderContext) -> Option<[u8; 8]> {
    Some(ascii8(&battery_name(ctx)))
}

fn encode_name_2(ctx: &EncoderContext) -> Option<[u8; 8]> {
    let name = battery_name(ctx);
    Some(ascii8(name.get(8..).unwrap_or("")))
}

fn encode_modules(_ctx: &EncoderContext) -> Option<[u8; 8]> {
    // One TinyBMS module online; bytes the dialect leaves unspecified are
    // transmitted as zero.
    let mut buf = [0u8; 8];
    put_u16(&mut buf, 0, 1);
    Some(buf)
}

fn encode_cell_extremes(ctx: &EncoderContext) -> Option<[u8; 8]> {
    let s = ctx.snapshot;
    let t_min = s.min_temp_deci_c()?;
    let t_max = s.max_temp_deci_c()?;
    let mut buf = [0u8; 8];
    put_u16(&mut buf, 0, s.min_cell_mv);
    put_u16(&mut buf, 2, s.max_cell_mv);
    put_i16(&mut buf, 4, t_min);
    put_i16(&mut buf, 6, t_max);
    Some(buf)
}

fn encode_min_cell_id(ctx: &EncoderContext) -> Option<[u8; 8]> {
    let index = ctx.snapshot.min_cell_index()?;
    Some(ascii8(&format!("C{:02}", index + 1)))
}

fn encode_max_cell_id(ctx: &EncoderContext) -> Option<[u8; 8]> {
    let index = ctx.snapshot.max_cell_index()?;
    Some(ascii8(&format!("C{:02}", index + 1)))
}

fn min_temp_sensor(snapshot: &LiveData) -> Option<&'static str> {
    snapshot
        .temperatures_deci_c
        .iter()
        .enumerate()
        .filter_map(|(i, t)| t.map(|t| (i, t)))
        .min_by_key(|&(_, t)| t)
        .map(|(i, _)| TEMP_SENSOR_NAMES[i])
}

fn max_temp_sensor(snapshot: &LiveData) -> Option<&'static str> {
    snapshot
        .temperatures_deci_c
        .iter()
        .enumerate()
        .filter_map(|(i, t)| t.map(|t| (i, t)))
        .max_by_key(|&(_, t)| t)
        .map(|(i, _)| TEMP_SENSOR_NAMES[i])
}

fn encode_min_temp_id(ctx: &EncoderContext) -> Option<[u8; 8]> {
    Some(ascii8(min_temp_sensor(ctx.snapshot)?))
}

fn encode_max_temp_id(ctx: &EncoderContext) -> Option<[u8; 8]> {
    Some(ascii8(max_temp_sensor(ctx.snapshot)?))
}

fn encode_energy(ctx: &EncoderContext) -> Option<[u8; 8]> {
    let energy = ctx.energy?;
    let mut buf = [0u8; 8];
    // Counters are wh / 100 on the wire and saturate rather than wrap.
    put_u32(
        &mut buf,
        0,
        (energy.charged_wh / 100.0).round().clamp(0.0, u32::MAX as f64) as u32,
    );
    put_u32(
        &mut buf,
        4,
        (energy.discharged_wh / 100.0).round().clamp(0.0, u32::MAX as f64) as u32,
    );
    Some(buf)
}

fn encode_capacity(ctx: &EncoderContext) -> Option<[u8; 8]> {
    let capacity_ah = ctx.snapshot.capacity_ah?;
    let mut buf = [0u8; 8];
    put_u32(
        &mut buf,
        0,
        (capacity_ah as f64 * 100.0).round().clamp(0.0, u32::MAX as f64) as u32,
    );
    Some(buf)
}

fn encode_serial_1(ctx: &EncoderContext) -> Option<[u8; 8]> {
    Some(ascii8(&ctx.identity.serial_number))
}

fn encode_serial_2(ctx: &EncoderContext) -> Option<[u8; 8]> {
    Some(ascii8(ctx.identity.serial_number.get(8..).unwrap_or("")))
}

fn encode_family(ctx: &EncoderContext) -> Option<[u8; 8]> {
    Some(ascii8(&ctx.identity.family))
}
