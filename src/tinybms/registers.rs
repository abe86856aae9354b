//! # TinyBMS Register Catalogue
//!
//! A static, sorted-by-address table describing every register the gateway
//! reads or writes, together with the scaling rules that turn raw 16-bit
//! words into physical quantities and back.
//!
//! Width-2 entries occupy two consecutive registers holding the value's
//! least significant word at the lower address.

use crate::error::Error;
use once_cell::sync::Lazy;

/// Scalar interpretation of a register's raw words.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterKind {
    U16,
    I16,
    U32,
    I32,
    F32,
    /// Discrete code; presented raw, never scaled.
    Enum,
    /// Two ASCII characters per word, low byte first.
    Ascii,
}

/// Functional grouping used for enumeration and display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterGroup {
    Live,
    Stats,
    Battery,
    Safety,
    Balance,
    Hardware,
    Version,
}

/// Immutable descriptor of one catalogue entry.
#[derive(Debug, Clone, Copy)]
pub struct RegisterDescriptor {
    pub address: u16,
    /// Number of consecutive 16-bit registers (1 or 2).
    pub width: u8,
    pub kind: RegisterKind,
    /// Multiplier applied to the raw integer when presenting a physical
    /// quantity; enum/ascii entries carry 1.0 and a distinct decoder.
    pub scale: f64,
    pub group: RegisterGroup,
    pub unit: Option<&'static str>,
    pub label: &'static str,
}

/// A decoded register value.
#[derive(Debug, Clone, PartialEq)]
pub enum RegisterValue {
    U16(u16),
    I16(i16),
    U32(u32),
    I32(i32),
    F32(f32),
    Enum(u16),
    Ascii(String),
}

impl RegisterValue {
    /// The raw integer behind the value, for scaling; ASCII has none.
    fn raw(&self) -> Option<f64> {
        match self {
            RegisterValue::U16(v) => Some(*v as f64),
            RegisterValue::I16(v) => Some(*v as f64),
            RegisterValue::U32(v) => Some(*v as f64),
            RegisterValue::I32(v) => Some(*v as f64),
            RegisterValue::F32(v) => Some(*v as f64),
            RegisterValue::Enum(v) => Some(*v as f64),
            RegisterValue::Ascii(_) => None,
        }
    }

    /// Convenience accessor for u16-kind values.
    pub fn as_u16(&self) -> Option<u16> {
        match self {
            RegisterValue::U16(v) | RegisterValue::Enum(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f32(&self) -> Option<f32> {
        match self {
            RegisterValue::F32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            RegisterValue::U32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i16(&self) -> Option<i16> {
        match self {
            RegisterValue::I16(v) => Some(*v),
            _ => None,
        }
    }
}

impl RegisterDescriptor {
    /// Decodes the register's raw words (LSW first for width-2 entries).
    pub fn decode(&self, words: &[u16]) -> RegisterValue {
        match self.kind {
            RegisterKind::U16 => RegisterValue::U16(words[0]),
            RegisterKind::I16 => RegisterValue::I16(words[0] as i16),
            RegisterKind::Enum => RegisterValue::Enum(words[0]),
            RegisterKind::U32 => {
                RegisterValue::U32(((words[1] as u32) << 16) | words[0] as u32)
            }
            RegisterKind::I32 => {
                RegisterValue::I32((((words[1] as u32) << 16) | words[0] as u32) as i32)
            }
            RegisterKind::F32 => RegisterValue::F32(f32::from_bits(
                ((words[1] as u32) << 16) | words[0] as u32,
            )),
            RegisterKind::Ascii => {
                let mut s = String::with_capacity(words.len() * 2);
                for w in words {
                    for b in w.to_le_bytes() {
                        if b != 0 {
                            s.push(b as char);
                        }
                    }
                }
                RegisterValue::Ascii(s)
            }
        }
    }

    /// Physical presentation value: `raw * scale`. ASCII registers have no
    /// physical value.
    pub fn physical(&self, value: &RegisterValue) -> Option<f64> {
        value.raw().map(|r| r * self.scale)
    }

    /// Converts a user-facing physical value back into raw wire words.
    ///
    /// The inverse of [`physical`]: `raw = round(user / scale)`. A result
    /// outside the kind's numeric range fails `OutOfRange`.
    pub fn encode_user_value(&self, user: f64) -> Result<Vec<u16>, Error> {
        let out_of_range = || Error::OutOfRange {
            address: self.address,
            value: user,
        };

        match self.kind {
            RegisterKind::U16 | RegisterKind::Enum => {
                let raw = (user / self.scale).round();
                if !(0.0..=u16::MAX as f64).contains(&raw) {
                    return Err(out_of_range());
                }
                Ok(vec![raw as u16])
            }
            RegisterKind::I16 => {
                let raw = (user / self.scale).round();
                if !(i16::MIN as f64..=i16::MAX as f64).contains(&raw) {
                    return Err(out_of_range());
                }
                Ok(vec![raw as i16 as u16])
            }
            RegisterKind::U32 => {
                let raw = (user / self.scale).round();
                if !(0.0..=u32::MAX as f64).contains(&raw) {
                    return Err(out_of_range());
                }
                let raw = raw as u32;
                Ok(vec![(raw & 0xFFFF) as u16, (raw >> 16) as u16])
            }
            RegisterKind::I32 => {
                let raw = (user / self.scale).round();
                if !(i32::MIN as f64..=i32::MAX as f64).contains(&raw) {
                    return Err(out_of_range());
                }
                let raw = raw as i32 as u32;
                Ok(vec![(raw & 0xFFFF) as u16, (raw >> 16) as u16])
            }
            RegisterKind::F32 => {
                let bits = (user as f32).to_bits();
                Ok(vec![(bits & 0xFFFF) as u16, (bits >> 16) as u16])
            }
            RegisterKind::Ascii => Err(Error::InvalidArg(format!(
                "register 0x{:04X} is ASCII, not numeric",
                self.address
            ))),
        }
    }
}

macro_rules! reg {
    ($addr:expr, $width:expr, $kind:ident, $scale:expr, $group:ident, $unit:expr, $label:expr) => {
        RegisterDescriptor {
            address: $addr,
            width: $width,
            kind: RegisterKind::$kind,
            scale: $scale,
            group: RegisterGroup::$group,
            unit: $unit,
            label: $label,
        }
    };
}

/// The full catalogue, built once at startup and kept sorted by address.
static CATALOGUE: Lazy<Vec<RegisterDescriptor>> = Lazy::new(|| {
    let mut table = vec![
        // Live block (0..56)
        reg!(0, 1, U16, 0.1, Live, Some("mV"), "Cell 1 voltage"),
        reg!(1, 1, U16, 0.1, Live, Some("mV"), "Cell 2 voltage"),
        reg!(2, 1, U16, 0.1, Live, Some("mV"), "Cell 3 voltage"),
        reg!(3, 1, U16, 0.1, Live, Some("mV"), "Cell 4 voltage"),
        reg!(4, 1, U16, 0.1, Live, Some("mV"), "Cell 5 voltage"),
        reg!(5, 1, U16, 0.1, Live, Some("mV"), "Cell 6 voltage"),
        reg!(6, 1, U16, 0.1, Live, Some("mV"), "Cell 7 voltage"),
        reg!(7, 1, U16, 0.1, Live, Some("mV"), "Cell 8 voltage"),
        reg!(8, 1, U16, 0.1, Live, Some("mV"), "Cell 9 voltage"),
        reg!(9, 1, U16, 0.1, Live, Some("mV"), "Cell 10 voltage"),
        reg!(10, 1, U16, 0.1, Live, Some("mV"), "Cell 11 voltage"),
        reg!(11, 1, U16, 0.1, Live, Some("mV"), "Cell 12 voltage"),
        reg!(12, 1, U16, 0.1, Live, Some("mV"), "Cell 13 voltage"),
        reg!(13, 1, U16, 0.1, Live, Some("mV"), "Cell 14 voltage"),
        reg!(14, 1, U16, 0.1, Live, Some("mV"), "Cell 15 voltage"),
        reg!(15, 1, U16, 0.1, Live, Some("mV"), "Cell 16 voltage"),
        reg!(32, 2, U32, 1.0, Live, Some("s"), "Lifetime counter"),
        reg!(34, 2, U32, 1.0, Live, Some("s"), "Estimated time left"),
        reg!(36, 2, F32, 1.0, Live, Some("V"), "Pack voltage"),
        reg!(38, 2, F32, 1.0, Live, Some("A"), "Pack current"),
        reg!(40, 1, U16, 0.1, Live, Some("mV"), "Minimum cell voltage"),
        reg!(41, 1, U16, 0.1, Live, Some("mV"), "Maximum cell voltage"),
        reg!(42, 1, I16, 0.1, Live, Some("degC"), "External temperature 1"),
        reg!(43, 1, I16, 0.1, Live, Some("degC"), "External temperature 2"),
        reg!(44, 1, U16, 1.0, Balance, None, "Cell balancing bitmap"),
        reg!(45, 1, U16, 0.01, Live, Some("%"), "State of health"),
        reg!(46, 2, U32, 0.000001, Live, Some("%"), "State of charge"),
        reg!(48, 1, I16, 0.1, Live, Some("degC"), "Internal temperature"),
        reg!(50, 1, Enum, 1.0, Live, None, "Online status"),
        // Statistics block (100..119)
        reg!(100, 1, U16, 1.0, Stats, None, "Under-voltage protection count"),
        reg!(101, 1, U16, 1.0, Stats, None, "Over-voltage protection count"),
        reg!(102, 1, U16, 1.0, Stats, None, "Discharge over-current count"),
        reg!(103, 1, U16, 1.0, Stats, None, "Charge over-current count"),
        reg!(104, 1, U16, 1.0, Stats, None, "Over-heat protection count"),
        reg!(105, 2, U32, 1.0, Stats, None, "Charging cycle count"),
        reg!(107, 2, U32, 1.0, Stats, None, "Full-charge count"),
        reg!(112, 2, F32, 1.0, Stats, Some("V"), "Minimum recorded pack voltage"),
        reg!(114, 2, F32, 1.0, Stats, Some("V"), "Maximum recorded pack voltage"),
        reg!(116, 1, I16, 0.1, Stats, Some("degC"), "Minimum recorded temperature"),
        reg!(117, 1, I16, 0.1, Stats, Some("degC"), "Maximum recorded temperature"),
        // Settings block (300..344)
        reg!(301, 1, U16, 1.0, Battery, None, "Series cell count"),
        reg!(303, 1, U16, 1.0, Balance, Some("mV"), "Allowed disbalance"),
        reg!(306, 1, U16, 0.01, Battery, Some("Ah"), "Installed capacity"),
        reg!(308, 1, Enum, 1.0, Battery, None, "Battery chemistry"),
        reg!(315, 1, U16, 1.0, Safety, Some("mV"), "Over-voltage cutoff"),
        reg!(316, 1, U16, 1.0, Safety, Some("mV"), "Under-voltage cutoff"),
        reg!(317, 1, U16, 1.0, Safety, Some("A"), "Discharge over-current cutoff"),
        reg!(318, 1, U16, 1.0, Safety, Some("A"), "Charge over-current cutoff"),
        reg!(319, 1, I16, 1.0, Safety, Some("degC"), "Over-temperature cutoff"),
        reg!(320, 1, I16, 1.0, Safety, Some("degC"), "Low-temperature charge cutoff"),
        reg!(332, 1, Ascii, 1.0, Hardware, None, "Battery name 1"),
        reg!(333, 1, Ascii, 1.0, Hardware, None, "Battery name 2"),
        reg!(334, 1, Ascii, 1.0, Hardware, None, "Battery name 3"),
        reg!(335, 1, Ascii, 1.0, Hardware, None, "Battery name 4"),
        reg!(340, 1, U16, 1.0, Hardware, None, "Hardware version"),
        reg!(341, 1, U16, 1.0, Version, None, "Firmware public version"),
        reg!(342, 1, U16, 1.0, Version, None, "Firmware internal version"),
        reg!(343, 1, U16, 1.0, Version, None, "Bootloader version"),
    ];
    table.sort_by_key(|d| d.address);
    // LSW/MSW pairs must not straddle another entry.
    for pair in table.windows(2) {
        assert!(
            pair[0].address + pair[0].width as u16 <= pair[1].address,
            "catalogue entries overlap at 0x{:04X}",
            pair[1].address
        );
    }
    table
});

/// Returns the whole catalogue, sorted by address.
pub fn catalogue() -> &'static [RegisterDescriptor] {
    &CATALOGUE
}

/// Looks up the descriptor starting at `address` in O(log n).
pub fn lookup(address: u16) -> Option<&'static RegisterDescriptor> {
    let table = catalogue();
    table
        .binary_search_by_key(&address, |d| d.address)
        .ok()
        .map(|i| &table[i])
}

/// Enumerates the descriptors of one group in address order.
pub fn by_group(group: RegisterGroup) -> impl Iterator<Item = &'static RegisterDescriptor> {
    catalogue().iter().filter(move |d| d.group == group)
}
