// Bench-test harness for EVSE charge controllers. The rig switches
// CP/PE and PP/PE resistor banks and the AC contactor lines, drives the
// unit under test through calibration and charging-current steps, and
// checks its reported low-level state against pass/fail thresholds.

pub mod device;
pub mod limits;
pub mod monitor;
pub mod poll;
pub mod recorder;
pub mod rig;
pub mod sequence;
pub mod sim;
