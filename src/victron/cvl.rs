//! # Charge-Voltage-Limit State Machine
//!
//! Computes the charge voltage limit and the charge/discharge current
//! limits the inverter must respect, from the latest snapshot and the pack
//! configuration. Six states drive the base target; cell protection and the
//! imbalance hold subtract from it, the absolute ceiling and the recovery
//! ramp bound it.
//!
//! All intermediates are IEEE-754 single precision. Non-finite inputs are
//! replaced with 0.0, and SOC or charge current where sign would be
//! nonsensical are clamped to zero.

use crate::error::Error;
use crate::model::live_data::LiveData;
use crate::util::lock_with_budget;
use log::warn;
use std::sync::Mutex;
use std::time::Duration;

/// Budget for acquiring the runtime mutex.
const CVL_LOCK_BUDGET: Duration = Duration::from_millis(10);

/// Pack and algorithm configuration. Defaults describe a 16s LiFePO4 pack.
#[derive(Debug, Clone, PartialEq)]
pub struct CvlConfig {
    pub bulk_soc_threshold: f32,
    pub transition_soc_threshold: f32,
    pub float_soc_threshold: f32,
    pub float_exit_soc: f32,
    pub float_approach_offset_mv: f32,
    pub float_offset_mv: f32,
    pub minimum_ccl_in_float_a: f32,
    pub sustain_soc_entry: f32,
    pub sustain_soc_exit: f32,
    /// Per-cell sustain voltage; the pack target is this times the series count.
    pub sustain_cell_voltage_v: f32,
    pub sustain_ccl_limit_a: f32,
    pub sustain_dcl_limit_a: f32,
    pub max_recovery_step_v: f32,
    pub imbalance_hold_threshold_mv: f32,
    pub imbalance_release_threshold_mv: f32,
    pub imbalance_drop_per_mv: f32,
    pub imbalance_drop_max_v: f32,
    pub series_cell_count: u16,
    pub cell_max_voltage_v: f32,
    pub cell_safety_threshold_v: f32,
    pub cell_safety_release_v: f32,
    pub cell_min_float_voltage_v: f32,
    pub cell_protection_kp: f32,
    pub dynamic_current_nominal_a: f32,
}

impl Default for CvlConfig {
    fn default() -> Self {
        CvlConfig {
            bulk_soc_threshold: 90.0,
            transition_soc_threshold: 95.0,
            float_soc_threshold: 98.0,
            float_exit_soc: 95.0,
            float_approach_offset_mv: 50.0,
            float_offset_mv: 100.0,
            minimum_ccl_in_float_a: 5.0,
            sustain_soc_entry: 5.0,
            sustain_soc_exit: 8.0,
            sustain_cell_voltage_v: 3.125,
            sustain_ccl_limit_a: 5.0,
            sustain_dcl_limit_a: 5.0,
            max_recovery_step_v: 0.4,
            imbalance_hold_threshold_mv: 100.0,
            imbalance_release_threshold_mv: 50.0,
            imbalance_drop_per_mv: 0.0005,
            imbalance_drop_max_v: 2.0,
            series_cell_count: 16,
            cell_max_voltage_v: 3.65,
            cell_safety_threshold_v: 3.50,
            cell_safety_release_v: 3.47,
            cell_min_float_voltage_v: 3.20,
            cell_protection_kp: 120.0,
            dynamic_current_nominal_a: 157.0,
        }
    }
}

impl CvlConfig {
    fn series(&self) -> f32 {
        self.series_cell_count as f32
    }

    /// Bulk charge target: every cell at its maximum.
    pub fn bulk_target_v(&self) -> f32 {
        self.series() * self.cell_max_voltage_v
    }

    /// Float target: cells held below maximum by the float offset.
    pub fn float_target_v(&self) -> f32 {
        self.series() * (self.cell_max_voltage_v - self.float_offset_mv / 1000.0)
    }

    /// Pack-level sustain target.
    pub fn sustain_target_v(&self) -> f32 {
        self.series() * self.sustain_cell_voltage_v
    }

    /// Lowest CVL any drop may reach.
    pub fn floor_v(&self) -> f32 {
        self.series() * self.cell_min_float_voltage_v
    }

    /// Absolute CVL ceiling.
    pub fn ceiling_v(&self) -> f32 {
        self.series() * self.cell_max_voltage_v
    }
}

/// The six charge states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CvlState {
    #[default]
    Bulk,
    Transition,
    FloatApproach,
    Float,
    Sustain,
    ImbalanceHold,
}

/// Output of one computation, kept as the input of the next.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CvlRuntime {
    pub state: CvlState,
    pub cvl_v: f32,
    pub ccl_a: f32,
    pub dcl_a: f32,
    pub cell_protection_active: bool,
    pub imbalance_hold_active: bool,
    pub previous_cvl_v: f32,
}

/// CVL engine: configuration plus the mutex-guarded runtime.
pub struct CvlEngine {
    config: CvlConfig,
    runtime: Mutex<CvlRuntime>,
    /// False until the first computation lands; publishers skip the limits
    /// frame while the runtime is only the seed value.
    computed: std::sync::atomic::AtomicBool,
}

impl CvlEngine {
    pub fn new(config: CvlConfig) -> Self {
        let ceiling = config.ceiling_v();
        CvlEngine {
            runtime: Mutex::new(CvlRuntime {
                state: CvlState::Bulk,
                cvl_v: ceiling,
                ccl_a: 0.0,
                dcl_a: 0.0,
                cell_protection_active: false,
                imbalance_hold_active: false,
                previous_cvl_v: ceiling,
            }),
            config,
            computed: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &CvlConfig {
        &self.config
    }

    /// Copies out the latest runtime.
    pub fn runtime(&self) -> Result<CvlRuntime, Error> {
        Ok(*lock_with_budget(&self.runtime, CVL_LOCK_BUDGET, "cvl runtime")?)
    }

    /// The latest computed output, or `None` before the first computation.
    pub fn latest(&self) -> Option<CvlRuntime> {
        if self.computed.load(std::sync::atomic::Ordering::Acquire) {
            self.runtime().ok()
        } else {
            None
        }
    }

    /// Listener entry point: recompute from the snapshot and store the
    /// result. Skips (keeping the previous output) when the BMS has not yet
    /// reported its current limits or the lock budget is missed.
    pub fn on_snapshot(&self, snapshot: &LiveData) {
        let (bms_ccl, bms_dcl) = match (
            snapshot.charge_current_limit_a,
            snapshot.discharge_current_limit_a,
        ) {
            (Some(ccl), Some(dcl)) => (ccl, dcl),
            _ => return,
        };

        let result = (|| -> Result<(), Error> {
            let mut runtime = lock_with_budget(&self.runtime, CVL_LOCK_BUDGET, "cvl runtime")?;
            *runtime = compute(&self.config, &runtime, snapshot, bms_ccl, bms_dcl);
            Ok(())
        })();
        match result {
            Ok(()) => {
                self.computed
                    .store(true, std::sync::atomic::Ordering::Release);
            }
            Err(e) => warn!("cvl update skipped: {e}"),
        }
    }
}

fn sanitize(value: f32) -> f32 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}

/// One full computation: state selection, then the CVL rules in order
/// (base target, imbalance drop, cell protection, ceiling, ramp), then the
/// CCL/DCL floors.
pub fn compute(
    config: &CvlConfig,
    previous: &CvlRuntime,
    snapshot: &LiveData,
    bms_ccl: f32,
    bms_dcl: f32,
) -> CvlRuntime {
    let soc = sanitize(snapshot.soc_percent).max(0.0);
    let imbalance_mv = snapshot.imbalance_mv() as f32;
    let max_cell_v = sanitize(snapshot.max_cell_mv as f32 / 1000.0);
    let charge_current = sanitize(snapshot.pack_current_a).max(0.0);
    let bms_ccl = sanitize(bms_ccl).max(0.0);
    let bms_dcl = sanitize(bms_dcl).max(0.0);

    // SOC band; on a boundary the higher-SOC state wins. Float is sticky
    // down to the exit threshold.
    let was_float = previous.state == CvlState::Float;
    let soc_band = if soc >= config.float_soc_threshold
        || (was_float && soc >= config.float_exit_soc)
    {
        CvlState::Float
    } else if soc >= config.transition_soc_threshold {
        CvlState::FloatApproach
    } else if soc >= config.bulk_soc_threshold {
        CvlState::Transition
    } else {
        CvlState::Bulk
    };

    // Sustain and the imbalance hold override the band; Sustain wins when
    // both would apply.
    let was_sustain = previous.state == CvlState::Sustain;
    let sustain_active = soc <= config.sustain_soc_entry
        || (was_sustain && soc < config.sustain_soc_exit);
    let imbalance_hold_active = imbalance_mv > config.imbalance_hold_threshold_mv
        || (previous.imbalance_hold_active
            && imbalance_mv > config.imbalance_release_threshold_mv);

    let state = if sustain_active {
        CvlState::Sustain
    } else if imbalance_hold_active {
        CvlState::ImbalanceHold
    } else {
        soc_band
    };

    // Rule 1: base target, with the linear imbalance drop in hold.
    let mut cvl = match state {
        CvlState::Bulk | CvlState::Transition | CvlState::FloatApproach => {
            config.bulk_target_v()
        }
        CvlState::Float => config.float_target_v(),
        CvlState::Sustain => config.sustain_target_v(),
        CvlState::ImbalanceHold => {
            let over = (imbalance_mv - config.imbalance_hold_threshold_mv).max(0.0);
            let drop = (over * config.imbalance_drop_per_mv).min(config.imbalance_drop_max_v);
            (config.bulk_target_v() - drop).max(config.floor_v())
        }
    };

    // Rule 2: hysteretic cell protection with a current-scaled drop.
    let cell_protection_active = if previous.cell_protection_active {
        max_cell_v > config.cell_safety_release_v
    } else {
        max_cell_v >= config.cell_safety_threshold_v
    };
    if cell_protection_active {
        let over_v = (max_cell_v - config.cell_safety_threshold_v).max(0.0);
        let drop = (config.cell_protection_kp
            * (1.0 + charge_current / config.dynamic_current_nominal_a)
            * over_v)
            .min(config.imbalance_drop_max_v);
        // Rules apply in order with the last one winning: while latched the
        // protection target replaces the state target outright.
        cvl = (config.ceiling_v() - drop).max(config.floor_v());
    }

    // Rule 3: absolute ceiling.
    cvl = cvl.min(config.ceiling_v());

    // Rule 4: never climb faster than the recovery step per computation.
    cvl = cvl.min(previous.cvl_v + config.max_recovery_step_v);

    // CCL/DCL floors.
    let mut ccl = bms_ccl;
    let mut dcl = bms_dcl;
    match state {
        CvlState::Float | CvlState::ImbalanceHold => {
            ccl = ccl.min(config.minimum_ccl_in_float_a);
        }
        CvlState::Sustain => {
            ccl = ccl.min(config.sustain_ccl_limit_a);
            dcl = dcl.min(config.sustain_dcl_limit_a);
        }
        _ => {}
    }

    CvlRuntime {
        state,
        cvl_v: cvl,
        ccl_a: ccl,
        dcl_a: dcl,
        cell_protection_active,
        imbalance_hold_active,
        previous_cvl_v: previous.cvl_v,
    }
}
