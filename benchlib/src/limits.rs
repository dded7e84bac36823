// Acceptance thresholds and timing of the conformance run. The
// standard and extended variants differ only in the calibration offset
// band and the contactor drop-out ceiling; both are kept as independent
// constant sets on purpose.

use std::fmt::{self, Display, Formatter};
use std::time::Duration;

use crate::poll::Deadline;

/// Strict open interval: `contains` holds iff `lo < value < hi`. A
/// value exactly on a boundary fails.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Band {
    lo: f64,
    hi: f64,
}

impl Band {
    pub const fn new(lo: f64, hi: f64) -> Self {
        Self { lo, hi }
    }

    pub fn contains(&self, value: f64) -> bool {
        self.lo < value && value < self.hi
    }
}

impl Display for Band {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.lo, self.hi)
    }
}

/// Charging-current sweep: start inclusive, end exclusive.
#[derive(Debug, Clone, Copy)]
pub struct SweepPlan {
    pub start_a: u32,
    pub end_a: u32,
    pub step_a: u32,
}

impl SweepPlan {
    pub fn currents_a(&self) -> impl Iterator<Item = u32> {
        (self.start_a..self.end_a).step_by(self.step_a as usize)
    }
}

pub const CAL_STEP_VOLTAGE: u8 = 1;
pub const CAL_STEP_OFFSET: u8 = 2;
pub const CAL_REF_VOLTAGE: u32 = 0x0BB0_3201;
pub const CAL_REF_OFFSET: u32 = 0x0BB0_3202;

#[derive(Debug, Clone)]
pub struct TestLimits {
    /// Jumper code expected after the initial reset (32 A position).
    pub jumper_before: u8,
    /// Jumper code expected after the final reset (disabled position).
    pub jumper_after: u8,
    pub expect_lock_switch: bool,
    pub voltage1_mv: Band,
    pub voltage2_mv: Band,
    pub offset_mv: Band,
    /// CP/PE with the 2700 Ohm resistor alone, before any PWM.
    pub cp_idle_ohm: Band,
    /// CP/PE with the charge-request resistor in, during the sweep.
    pub cp_load_ohm: Band,
    pub pp_ohm: Band,
    pub sweep: SweepPlan,
    /// Inclusive ceiling on the contactor drop-out time.
    pub dropout_ceiling_ms: u64,
    pub dc_settle: Duration,
    pub calibration_settle: Duration,
    pub autocal_settle: Duration,
    pub resistor_settle: Duration,
    pub contactor_hold: Duration,
    pub sweep_settle: Duration,
    pub reset_settle: Duration,
    pub contactor_close: Deadline,
    pub contactor_open: Deadline,
    pub poll_interval: Duration,
}

impl TestLimits {
    pub fn standard() -> Self {
        Self {
            jumper_before: 6,
            jumper_after: 8,
            expect_lock_switch: false,
            voltage1_mv: Band::new(11_500.0, 12_500.0),
            voltage2_mv: Band::new(-12_500.0, -11_500.0),
            offset_mv: Band::new(-200.0, 0.0),
            cp_idle_ohm: Band::new(880.0 * 0.8, 2_700.0 * 1.2),
            cp_load_ohm: Band::new(880.0 * 0.8, 880.0 * 1.2),
            pp_ohm: Band::new(200.0, 240.0),
            sweep: SweepPlan {
                start_a: 6,
                end_a: 32,
                step_a: 2,
            },
            dropout_ceiling_ms: 110,
            dc_settle: Duration::from_secs(15),
            calibration_settle: Duration::from_millis(2_500),
            autocal_settle: Duration::from_secs(15),
            resistor_settle: Duration::from_secs(2),
            contactor_hold: Duration::from_secs(5),
            sweep_settle: Duration::from_secs(1),
            reset_settle: Duration::from_secs(2),
            contactor_close: Deadline::Within(Duration::from_secs(10)),
            contactor_open: Deadline::Within(Duration::from_secs(2)),
            poll_interval: Duration::from_millis(10),
        }
    }

    pub fn extended() -> Self {
        Self {
            offset_mv: Band::new(-200.0, 200.0),
            dropout_ceiling_ms: 125,
            ..Self::standard()
        }
    }
}
