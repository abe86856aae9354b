//! Tests for the CVL state machine: state selection, the drop rules, the
//! ramp limiter, and the CCL/DCL floors.

use tinybms_rs::model::live_data::LiveData;
use tinybms_rs::victron::cvl::{compute, CvlConfig, CvlEngine, CvlRuntime, CvlState};

const BMS_CCL: f32 = 150.0;
const BMS_DCL: f32 = 200.0;

/// Snapshot with a uniform pack at `cell_mv` plus one cell raised by
/// `imbalance_mv`.
fn snapshot(soc: f32, cell_mv: u16, imbalance_mv: u16, current_a: f32) -> LiveData {
    let mut data = LiveData {
        soc_percent: soc,
        pack_current_a: current_a,
        pack_voltage_v: 16.0 * cell_mv as f32 / 1000.0,
        series_cell_count: Some(16),
        charge_current_limit_a: Some(BMS_CCL),
        discharge_current_limit_a: Some(BMS_DCL),
        ..LiveData::default()
    };
    data.cell_mv = [cell_mv; 16];
    data.cell_mv[15] = cell_mv + imbalance_mv;
    data.finalize_derived();
    data
}

fn seed(config: &CvlConfig) -> CvlRuntime {
    CvlRuntime {
        state: CvlState::Bulk,
        cvl_v: config.bulk_target_v(),
        ccl_a: BMS_CCL,
        dcl_a: BMS_DCL,
        cell_protection_active: false,
        imbalance_hold_active: false,
        previous_cvl_v: config.bulk_target_v(),
    }
}

/// Mid-SOC pack with a tiny imbalance charges at the full bulk target.
#[test]
fn test_bulk_state() {
    let config = CvlConfig::default();
    let out = compute(
        &config,
        &seed(&config),
        &snapshot(50.0, 3300, 10, 20.0),
        BMS_CCL,
        BMS_DCL,
    );
    assert_eq!(out.state, CvlState::Bulk);
    assert!((out.cvl_v - 58.4).abs() < 1e-3, "cvl {}", out.cvl_v);
    assert_eq!(out.ccl_a, BMS_CCL);
    assert_eq!(out.dcl_a, BMS_DCL);
    assert!(!out.cell_protection_active);
    assert!(!out.imbalance_hold_active);
}

/// 150 mV of imbalance at 70 % SOC: hold at bulk target minus the linear
/// drop, CCL clamped to the float floor.
#[test]
fn test_imbalance_hold() {
    let config = CvlConfig::default();
    let out = compute(
        &config,
        &seed(&config),
        &snapshot(70.0, 3300, 150, 20.0),
        BMS_CCL,
        BMS_DCL,
    );
    assert_eq!(out.state, CvlState::ImbalanceHold);
    assert!(out.imbalance_hold_active);
    // drop = min(2.0, (150 - 100) * 0.0005) = 0.025 V
    assert!((out.cvl_v - 58.375).abs() < 1e-3, "cvl {}", out.cvl_v);
    assert_eq!(out.ccl_a, 5.0);
    assert_eq!(out.dcl_a, BMS_DCL);
}

/// The hold releases only once the imbalance falls to the release
/// threshold.
#[test]
fn test_imbalance_hold_hysteresis() {
    let config = CvlConfig::default();
    let held = compute(
        &config,
        &seed(&config),
        &snapshot(70.0, 3300, 150, 10.0),
        BMS_CCL,
        BMS_DCL,
    );
    // 80 mV sits between release (50) and hold (100): still held.
    let still_held = compute(
        &config,
        &held,
        &snapshot(70.0, 3300, 80, 10.0),
        BMS_CCL,
        BMS_DCL,
    );
    assert_eq!(still_held.state, CvlState::ImbalanceHold);
    let released = compute(
        &config,
        &still_held,
        &snapshot(70.0, 3300, 40, 10.0),
        BMS_CCL,
        BMS_DCL,
    );
    assert_ne!(released.state, CvlState::ImbalanceHold);
}

#[test]
fn test_soc_band_selection_and_tie_breaks() {
    let config = CvlConfig::default();
    let run = seed(&config);
    let state_at = |soc: f32| {
        compute(&config, &run, &snapshot(soc, 3300, 0, 10.0), BMS_CCL, BMS_DCL).state
    };
    assert_eq!(state_at(89.9), CvlState::Bulk);
    // On a boundary the higher-SOC state wins.
    assert_eq!(state_at(90.0), CvlState::Transition);
    assert_eq!(state_at(95.0), CvlState::FloatApproach);
    assert_eq!(state_at(98.0), CvlState::Float);
}

/// Float holds down to the exit SOC, then falls back to the band.
#[test]
fn test_float_hysteresis_and_ccl_floor() {
    let config = CvlConfig::default();
    let float = compute(
        &config,
        &seed(&config),
        &snapshot(98.5, 3450, 0, 5.0),
        BMS_CCL,
        BMS_DCL,
    );
    assert_eq!(float.state, CvlState::Float);
    assert!((float.cvl_v - config.float_target_v()).abs() < 1e-3);
    assert_eq!(float.ccl_a, config.minimum_ccl_in_float_a);

    let sticky = compute(
        &config,
        &float,
        &snapshot(96.0, 3450, 0, 5.0),
        BMS_CCL,
        BMS_DCL,
    );
    assert_eq!(sticky.state, CvlState::Float, "96 % is above float_exit_soc");

    let exited = compute(
        &config,
        &sticky,
        &snapshot(94.0, 3400, 0, 5.0),
        BMS_CCL,
        BMS_DCL,
    );
    assert_eq!(exited.state, CvlState::Transition);
}

/// Sustain entry at low SOC with its voltage and current limits; exit only
/// at the higher exit threshold. Sustain outranks the imbalance hold.
#[test]
fn test_sustain_entry_exit_and_priority() {
    let config = CvlConfig::default();
    let sustain = compute(
        &config,
        &seed(&config),
        &snapshot(4.0, 3050, 150, 0.0),
        BMS_CCL,
        BMS_DCL,
    );
    assert_eq!(sustain.state, CvlState::Sustain, "sustain outranks hold");
    assert!((sustain.cvl_v - 50.0).abs() < 1e-3);
    assert_eq!(sustain.ccl_a, config.sustain_ccl_limit_a);
    assert_eq!(sustain.dcl_a, config.sustain_dcl_limit_a);

    let still = compute(
        &config,
        &sustain,
        &snapshot(6.5, 3050, 0, 0.0),
        BMS_CCL,
        BMS_DCL,
    );
    assert_eq!(still.state, CvlState::Sustain, "6.5 % is below sustain_soc_exit");

    let recovered = compute(
        &config,
        &still,
        &snapshot(8.0, 3100, 0, 10.0),
        BMS_CCL,
        BMS_DCL,
    );
    assert_eq!(recovered.state, CvlState::Bulk);
}

/// Cell protection latches at the safety threshold, scales its drop with
/// charge current, and releases below the release voltage.
#[test]
fn test_cell_protection_latch_and_release() {
    let config = CvlConfig::default();
    // One cell at 3.52 V while charging hard.
    let latched = compute(
        &config,
        &seed(&config),
        &snapshot(60.0, 3400, 120, 78.5),
        BMS_CCL,
        BMS_DCL,
    );
    assert!(latched.cell_protection_active);
    // drop = 120 * (1 + 78.5 / 157) * 0.02 = 3.6, capped at 2.0
    let expected = config.ceiling_v() - config.imbalance_drop_max_v;
    assert!(
        (latched.cvl_v - expected).abs() < 1e-3,
        "cvl {} vs {expected}",
        latched.cvl_v
    );

    // 3.48 V sits inside the hysteresis band: still latched.
    let still = compute(
        &config,
        &latched,
        &snapshot(60.0, 3400, 80, 10.0),
        BMS_CCL,
        BMS_DCL,
    );
    assert!(still.cell_protection_active);

    // At the release voltage the latch clears.
    let released = compute(
        &config,
        &still,
        &snapshot(60.0, 3400, 70, 10.0),
        BMS_CCL,
        BMS_DCL,
    );
    assert!(!released.cell_protection_active);
}

/// The CVL may fall freely but climbs at most one recovery step per
/// computation, and never beyond the absolute ceiling.
#[test]
fn test_ramp_and_ceiling_laws() {
    let config = CvlConfig::default();
    let mut run = CvlRuntime {
        cvl_v: 52.0,
        previous_cvl_v: 52.0,
        ..seed(&config)
    };
    for _ in 0..40 {
        let prev = run.cvl_v;
        run = compute(&config, &run, &snapshot(50.0, 3300, 0, 10.0), BMS_CCL, BMS_DCL);
        assert!(run.cvl_v <= prev + config.max_recovery_step_v + 1e-4);
        assert!(run.cvl_v <= config.ceiling_v() + 1e-4);
    }
    // Eventually the target is reached exactly.
    assert!((run.cvl_v - config.bulk_target_v()).abs() < 1e-3);
}

/// Non-finite inputs are sanitised to zero instead of poisoning the output.
#[test]
fn test_non_finite_inputs_are_sanitised() {
    let config = CvlConfig::default();
    let mut data = snapshot(50.0, 3300, 0, 10.0);
    data.soc_percent = f32::NAN;
    data.pack_current_a = f32::INFINITY;
    let out = compute(&config, &seed(&config), &data, f32::NAN, BMS_DCL);
    assert_eq!(out.state, CvlState::Sustain, "NaN SOC reads as 0 %");
    assert!(out.cvl_v.is_finite());
    assert_eq!(out.ccl_a, 0.0, "NaN CCL reads as 0 A");
}

/// The engine skips computing until the BMS has reported its limits.
#[test]
fn test_engine_requires_bms_limits() {
    let engine = CvlEngine::new(CvlConfig::default());
    assert!(engine.latest().is_none());

    let mut data = snapshot(50.0, 3300, 0, 10.0);
    data.charge_current_limit_a = None;
    engine.on_snapshot(&data);
    assert!(engine.latest().is_none());

    engine.on_snapshot(&snapshot(50.0, 3300, 0, 10.0));
    let out = engine.latest().expect("computed");
    assert_eq!(out.state, CvlState::Bulk);
}

/// Re-creating the engine with the same configuration yields the same seed
/// runtime.
#[test]
fn test_double_initialisation_is_a_no_op() {
    let a = CvlEngine::new(CvlConfig::default());
    let b = CvlEngine::new(CvlConfig::default());
    assert_eq!(a.runtime().unwrap(), b.runtime().unwrap());
    assert_eq!(a.config(), b.config());
}
