//! Unit tests for the register catalogue: ordering, lookup, grouping, and
//! the scaling conversions.

use tinybms_rs::error::Error;
use tinybms_rs::tinybms::registers::{
    by_group, catalogue, lookup, RegisterGroup, RegisterKind, RegisterValue,
};

#[test]
fn test_catalogue_is_sorted_and_non_overlapping() {
    let table = catalogue();
    assert!(!table.is_empty());
    for pair in table.windows(2) {
        assert!(pair[0].address < pair[1].address);
        assert!(pair[0].address + pair[0].width as u16 <= pair[1].address);
    }
}

#[test]
fn test_width_two_entries_are_lsw_msw_pairs() {
    for desc in catalogue() {
        assert!(matches!(desc.width, 1 | 2), "width at 0x{:04X}", desc.address);
        if desc.width == 2 {
            // The next catalogued address must not sit inside the pair.
            assert!(lookup(desc.address + 1).is_none());
        }
    }
}

#[test]
fn test_lookup_hits_and_misses() {
    let pack_voltage = lookup(36).expect("pack voltage catalogued");
    assert_eq!(pack_voltage.kind, RegisterKind::F32);
    assert_eq!(pack_voltage.unit, Some("V"));
    // 37 is the MSW of the pack-voltage pair, not an entry of its own.
    assert!(lookup(37).is_none());
    assert!(lookup(0x7FFF).is_none());
}

#[test]
fn test_by_group_is_address_ordered() {
    let safety: Vec<u16> = by_group(RegisterGroup::Safety).map(|d| d.address).collect();
    assert!(!safety.is_empty());
    let mut sorted = safety.clone();
    sorted.sort_unstable();
    assert_eq!(safety, sorted);
    assert!(safety.iter().all(|&a| (300..344).contains(&a)));
}

#[test]
fn test_decode_u32_reassembles_lsw_msw() {
    let desc = lookup(46).expect("SOC catalogued");
    assert_eq!(desc.kind, RegisterKind::U32);
    // LSW at the lower address.
    let value = desc.decode(&[0x5678, 0x1234]);
    assert_eq!(value, RegisterValue::U32(0x1234_5678));
}

#[test]
fn test_decode_f32_from_word_pair() {
    let desc = lookup(36).expect("pack voltage catalogued");
    let bits = 52.5f32.to_bits();
    let value = desc.decode(&[(bits & 0xFFFF) as u16, (bits >> 16) as u16]);
    assert_eq!(value, RegisterValue::F32(52.5));
}

#[test]
fn test_decode_ascii_low_byte_first() {
    let desc = lookup(332).expect("battery name catalogued");
    assert_eq!(desc.kind, RegisterKind::Ascii);
    // 0x4241 little-endian is "AB".
    assert_eq!(desc.decode(&[0x4241]), RegisterValue::Ascii("AB".to_string()));
}

#[test]
fn test_physical_applies_scale() {
    let desc = lookup(0).expect("cell 1 catalogued");
    let value = desc.decode(&[33000]);
    let physical = desc.physical(&value).unwrap();
    assert!((physical - 3300.0).abs() < 1e-9);
}

/// encode(decode(raw)) == raw for in-range raw words.
#[test]
fn test_encode_decode_round_trip() {
    for (address, words) in [
        (0u16, vec![33015u16]),
        (42, vec![0xFF38]), // -20.0 C
        (46, vec![0x1234, 0x0056]),
        (301, vec![16]),
        (306, vec![28000]),
    ] {
        let desc = lookup(address).unwrap();
        let value = desc.decode(&words);
        let physical = desc.physical(&value).unwrap();
        let encoded = desc.encode_user_value(physical).unwrap();
        assert_eq!(encoded, words, "round trip at 0x{address:04X}");
    }
}

#[test]
fn test_encode_out_of_range_fails() {
    let capacity = lookup(306).unwrap();
    // 0.01 Ah scale: u16 tops out at 655.35 Ah.
    match capacity.encode_user_value(700.0) {
        Err(Error::OutOfRange { address: 306, .. }) => {}
        other => panic!("expected OutOfRange, got {other:?}"),
    }
    let temp = lookup(319).unwrap();
    assert!(temp.encode_user_value(40_000.0).is_err());
    assert!(temp.encode_user_value(-40_000.0).is_err());
}

#[test]
fn test_encode_rounds_to_nearest() {
    let cell = lookup(0).unwrap();
    // 3300.04 mV at 0.1 mV resolution rounds to raw 33000.
    assert_eq!(cell.encode_user_value(3300.04).unwrap(), vec![33000]);
    assert_eq!(cell.encode_user_value(3300.06).unwrap(), vec![33001]);
}

#[test]
fn test_ascii_register_rejects_numeric_write() {
    let name = lookup(332).unwrap();
    assert!(matches!(
        name.encode_user_value(1.0),
        Err(Error::InvalidArg(_))
    ));
}
