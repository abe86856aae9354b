//! TinyBMS Protocol Constants
//!
//! This module defines constants used in the TinyBMS serial protocol and the
//! Victron CAN dialect, based on the Energus TinyBMS communication manual and
//! the Victron-Energy BMS-CAN register set.

/// Frame sync byte; every TinyBMS frame starts with it
pub const TINYBMS_SYNC_BYTE: u8 = 0xAA;

/// Command code for a block register read (MODBUS function 0x03)
pub const TINYBMS_CMD_READ: u8 = 0x03;

/// Command code for a block register write (MODBUS function 0x10)
pub const TINYBMS_CMD_WRITE: u8 = 0x10;

/// Command code carried by an error reply
pub const TINYBMS_CMD_ERROR: u8 = 0x00;

/// Maximum register count for a single block read
pub const TINYBMS_MAX_READ_REGISTERS: usize = 127;

/// Maximum word count for a single block write
pub const TINYBMS_MAX_WRITE_REGISTERS: usize = 100;

// ----------------------------------------------------------------------------
// Register blocks polled by the client (inclusive start, exclusive end)
// ----------------------------------------------------------------------------

/// Live-data block: cell voltages, pack V/I, SOC, temperatures, status
pub const TINYBMS_BLOCK_LIVE_START: u16 = 0;
pub const TINYBMS_BLOCK_LIVE_END: u16 = 56;

/// Statistics block: lifetime counters and extrema
pub const TINYBMS_BLOCK_STATS_START: u16 = 100;
pub const TINYBMS_BLOCK_STATS_END: u16 = 119;

/// Settings block: capacity, cell count, protection cut-offs
pub const TINYBMS_BLOCK_SETTINGS_START: u16 = 300;
pub const TINYBMS_BLOCK_SETTINGS_END: u16 = 344;

// ----------------------------------------------------------------------------
// Online status codes (register 50)
// ----------------------------------------------------------------------------

pub const TINYBMS_STATUS_CHARGING: u16 = 0x91;
pub const TINYBMS_STATUS_FULLY_CHARGED: u16 = 0x92;
pub const TINYBMS_STATUS_DISCHARGING: u16 = 0x93;
pub const TINYBMS_STATUS_REGENERATION: u16 = 0x96;
pub const TINYBMS_STATUS_IDLE: u16 = 0x97;
pub const TINYBMS_STATUS_FAULT: u16 = 0x9B;

// ----------------------------------------------------------------------------
// Victron CAN identifiers (11-bit, DLC 8, little-endian payloads)
// ----------------------------------------------------------------------------

/// Keep-alive frame transmitted by the gateway
pub const VICTRON_ID_KEEPALIVE: u16 = 0x305;
/// Handshake frame received from the inverter/charger
pub const VICTRON_ID_HANDSHAKE: u16 = 0x307;
/// Charge voltage / charge current / discharge current limits
pub const VICTRON_ID_LIMITS: u16 = 0x351;
/// State of charge / state of health
pub const VICTRON_ID_SOC_SOH: u16 = 0x355;
/// Pack voltage / current / temperature
pub const VICTRON_ID_VIT: u16 = 0x356;
/// Alarm and warning bits
pub const VICTRON_ID_ALARMS: u16 = 0x35A;
/// Manufacturer name (ASCII)
pub const VICTRON_ID_MANUFACTURER: u16 = 0x35E;
/// Firmware version and installed capacity
pub const VICTRON_ID_VERSION_CAPACITY: u16 = 0x35F;
/// Battery name, first half (ASCII)
pub const VICTRON_ID_NAME_1: u16 = 0x370;
/// Battery name, second half (ASCII)
pub const VICTRON_ID_NAME_2: u16 = 0x371;
/// Module status counts
pub const VICTRON_ID_MODULES: u16 = 0x372;
/// Min/max cell voltage and temperature extremes
pub const VICTRON_ID_CELL_EXTREMES: u16 = 0x373;
/// Identifier of the minimum-voltage cell (ASCII)
pub const VICTRON_ID_MIN_CELL_ID: u16 = 0x374;
/// Identifier of the maximum-voltage cell (ASCII)
pub const VICTRON_ID_MAX_CELL_ID: u16 = 0x375;
/// Identifier of the minimum-temperature sensor (ASCII)
pub const VICTRON_ID_MIN_TEMP_ID: u16 = 0x376;
/// Identifier of the maximum-temperature sensor (ASCII)
pub const VICTRON_ID_MAX_TEMP_ID: u16 = 0x377;
/// Lifetime charged / discharged energy counters
pub const VICTRON_ID_ENERGY: u16 = 0x378;
/// Installed capacity
pub const VICTRON_ID_CAPACITY: u16 = 0x379;
/// Serial number, first half (ASCII)
pub const VICTRON_ID_SERIAL_1: u16 = 0x380;
/// Serial number, second half (ASCII)
pub const VICTRON_ID_SERIAL_2: u16 = 0x381;
/// Battery family (ASCII)
pub const VICTRON_ID_FAMILY: u16 = 0x382;

/// ASCII signature expected in bytes 4..7 of an inbound 0x307 handshake
pub const VICTRON_HANDSHAKE_SIGNATURE: &[u8; 3] = b"VIC";

/// Highest valid standard (11-bit) CAN identifier, exclusive
pub const CAN_STANDARD_ID_LIMIT: u16 = 0x800;

/// Maximum CAN payload length
pub const CAN_MAX_DLC: usize = 8;

/// Stuffing-inclusive overhead bits of a standard data frame, used for the
/// bus-occupancy estimate `sum(47 + 8*dlc) / (bitrate * window)`
pub const CAN_FRAME_OVERHEAD_BITS: u64 = 47;

// ----------------------------------------------------------------------------
// Alarm thresholds for the 0x35A frame
// ----------------------------------------------------------------------------

/// Pack over-temperature alarm threshold in 0.1 C
pub const ALARM_OVER_TEMP_DECI_C: i16 = 650;
/// Pack under-temperature alarm threshold in 0.1 C
pub const ALARM_UNDER_TEMP_DECI_C: i16 = -100;
/// Cell imbalance alarm threshold in mV
pub const ALARM_IMBALANCE_MV: u16 = 40;
/// Overcurrent alarms trip at this fraction of the BMS-reported limit
pub const ALARM_OVERCURRENT_FRACTION: f32 = 0.8;
