// Test sequencer: the ordered script of setup, calibration, assertion
// and timing steps that makes up one conformance run, plus the
// continuous charging-emulation loop. Each assertion is a function
// returning an outcome; the exit status is decided at the top level.

use std::fmt::{self, Display, Formatter};
use std::time::{Duration, Instant};

use error_stack::{Context, Report, Result, ResultExt};
use log::{debug, error, info};
use rust_fsm::*;

use crate::device::{CalibrationStep, Evse, RigOutputs, GPIO_BUTTON, GPIO_CONTACTOR_CHECK};
use crate::limits::{
    Band, TestLimits, CAL_REF_OFFSET, CAL_REF_VOLTAGE, CAL_STEP_OFFSET, CAL_STEP_VOLTAGE,
};
use crate::poll::{self, wait_until, CancelToken, Deadline, PollError, WaitOutcome};
use crate::recorder::{RunRecord, RunRecorder};
use crate::rig::TestRig;

// Coarse phases of one conformance run. The script drives this
// machine linearly; a run never branches back before Passed/Failed.
state_machine! {
    derive(Debug)
    BenchMachine(Idle)

    Idle => {
        Start => Configuring [RunStarted],
    },
    Configuring => {
        ConfigurationOk => Calibrating [RigConfigured],
        ConfigurationMismatch => Failed [FatalMismatch],
        Aborted => Failed [RunAborted],
    },
    Calibrating => {
        CalibrationOk => Asserting [CalibrationDone],
        CalibrationRejected => Failed [FatalCalibration],
        OperatorInputInvalid => Failed [FatalOperatorInput],
        Aborted => Failed [RunAborted],
    },
    Asserting => {
        ChecksPassed => Passed [RunComplete],
        CheckFailed => Failed [FatalCheck],
        Aborted => Failed [RunAborted],
    },
    Passed => {
        Rearm => Idle,
    },
    Failed => {
        Rearm => Idle,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BenchError {
    Connection,
    OperatorInput,
    CalibrationRejected,
    CheckFailed,
    Device,
    Cancelled,
    Sequencer,
}

impl Context for BenchError {}

impl Display for BenchError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            BenchError::Connection => write!(f, "could not connect to the test stand"),
            BenchError::OperatorInput => write!(f, "operator input rejected"),
            BenchError::CalibrationRejected => write!(f, "unit rejected a calibration command"),
            BenchError::CheckFailed => write!(f, "measured value outside its acceptance band"),
            BenchError::Device => write!(f, "device access failed"),
            BenchError::Cancelled => write!(f, "run cancelled"),
            BenchError::Sequencer => write!(f, "sequencer state error"),
        }
    }
}

/// Console or scripted counterpart for the prompts of a one-shot run.
pub trait Operator {
    fn confirm(&mut self, prompt: &str) -> Result<(), BenchError>;
    fn read_millivolts(&mut self, prompt: &str) -> Result<i32, BenchError>;
}

/// One assertion's result. Created when the check runs, never mutated.
#[derive(Debug, Clone, PartialEq)]
pub struct TestOutcome {
    pub label: String,
    pub measured: f64,
    pub passed: bool,
    pub elapsed_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub record: RunRecord,
    pub outcomes: Vec<TestOutcome>,
}

struct AssertMeasurements {
    cp_idle_ohm: u32,
    cp_load_ohm: u32,
    pp_pe_ohm: u32,
    dropout_ms: u64,
}

fn poll_to_bench(e: Report<PollError>) -> Report<BenchError> {
    let context = match e.current_context() {
        PollError::Cancelled => BenchError::Cancelled,
        PollError::Device => BenchError::Device,
    };
    e.change_context(context)
}

pub struct Sequencer<'a, E: Evse, R: RigOutputs> {
    evse: &'a mut E,
    rig: &'a mut TestRig<R>,
    limits: TestLimits,
    cancel: CancelToken,
    outcomes: Vec<TestOutcome>,
}

impl<'a, E: Evse, R: RigOutputs> Sequencer<'a, E, R> {
    pub fn new(
        evse: &'a mut E,
        rig: &'a mut TestRig<R>,
        limits: TestLimits,
        cancel: CancelToken,
    ) -> Self {
        Self {
            evse,
            rig,
            limits,
            cancel,
            outcomes: Vec::new(),
        }
    }

    /// Outcomes recorded so far; still available after a failed run.
    pub fn outcomes(&self) -> &[TestOutcome] {
        &self.outcomes
    }

    /// Runs the one-shot conformance script. On any error the rig is
    /// returned to its safe state before the error surfaces.
    pub fn run_full_test(
        &mut self,
        operator: &mut dyn Operator,
        recorder: Option<&RunRecorder>,
    ) -> Result<RunReport, BenchError> {
        let mut machine: StateMachine<BenchMachine> = StateMachine::new();
        Self::feed(&mut machine, BenchMachineInput::Start)?;

        let record = match self.run_phases(operator, &mut machine) {
            Ok(record) => record,
            Err(e) => {
                if let Err(safe_err) = self.rig.make_safe() {
                    error!("Failed returning the rig to a safe state: {:?}", safe_err);
                }
                return Err(e);
            }
        };

        if let Some(recorder) = recorder {
            recorder.append(&record).change_context(BenchError::Device)?;
        }
        info!("Done. All OK");
        Ok(RunReport {
            record,
            outcomes: std::mem::take(&mut self.outcomes),
        })
    }

    fn run_phases(
        &mut self,
        operator: &mut dyn Operator,
        machine: &mut StateMachine<BenchMachine>,
    ) -> Result<RunRecord, BenchError> {
        let configured = operator
            .confirm("Set the rotary switch to '32A', then press Enter: ")
            .and_then(|()| self.configuring_phase());
        match configured {
            Ok(()) => Self::feed(machine, BenchMachineInput::ConfigurationOk)?,
            Err(e) => {
                let input = if matches!(e.current_context(), BenchError::CheckFailed) {
                    BenchMachineInput::ConfigurationMismatch
                } else {
                    BenchMachineInput::Aborted
                };
                Self::feed(machine, input)?;
                return Err(e);
            }
        }

        let (voltage1, voltage2, offset) = match self.calibrating_phase(operator) {
            Ok(v) => {
                Self::feed(machine, BenchMachineInput::CalibrationOk)?;
                v
            }
            Err(e) => {
                let input = match e.current_context() {
                    BenchError::OperatorInput => BenchMachineInput::OperatorInputInvalid,
                    BenchError::CalibrationRejected => BenchMachineInput::CalibrationRejected,
                    _ => BenchMachineInput::Aborted,
                };
                Self::feed(machine, input)?;
                return Err(e);
            }
        };

        let measured = match self.asserting_phase() {
            Ok(m) => {
                Self::feed(machine, BenchMachineInput::ChecksPassed)?;
                m
            }
            Err(e) => {
                let input = if matches!(e.current_context(), BenchError::CheckFailed) {
                    BenchMachineInput::CheckFailed
                } else {
                    BenchMachineInput::Aborted
                };
                Self::feed(machine, input)?;
                return Err(e);
            }
        };

        Ok(RunRecord {
            uid: self.evse.uid(),
            voltage1_mv: voltage1,
            voltage2_mv: voltage2,
            offset_mv: offset,
            cp_idle_ohm: measured.cp_idle_ohm,
            cp_load_ohm: measured.cp_load_ohm,
            pp_pe_ohm: measured.pp_pe_ohm,
            dropout_ms: measured.dropout_ms,
        })
    }

    fn feed(
        machine: &mut StateMachine<BenchMachine>,
        input: BenchMachineInput,
    ) -> Result<(), BenchError> {
        machine
            .consume(&input)
            .map_err(|_| Report::new(BenchError::Sequencer))?;
        debug!("Bench state: {:?}", machine.state());
        Ok(())
    }

    /// Initial rig configuration, unit reset, and jumper/lock-switch
    /// verification.
    fn configuring_phase(&mut self) -> Result<(), BenchError> {
        self.rig
            .set_contactor(true, false)
            .change_context(BenchError::Device)?;
        self.rig.set_diode(true).change_context(BenchError::Device)?;
        self.rig
            .set_cp_pe_resistor(false, false, false)
            .change_context(BenchError::Device)?;
        self.rig
            .set_pp_pe_resistor(false, false, true, false)
            .change_context(BenchError::Device)?;
        self.evse.reset().change_context(BenchError::Device)?;

        info!(
            "Waiting for DC protection calibration ({}s)",
            self.limits.dc_settle.as_secs()
        );
        self.settle(self.limits.dc_settle)?;
        info!("... OK");

        self.verify_hardware_configuration(self.limits.jumper_before, true)
    }

    fn verify_hardware_configuration(
        &mut self,
        expected_jumper: u8,
        check_lock_switch: bool,
    ) -> Result<(), BenchError> {
        let conf = self
            .evse
            .hardware_configuration()
            .change_context(BenchError::Device)?;

        info!("Checking jumper configuration");
        let jumper_ok = conf.jumper_configuration == expected_jumper;
        self.outcomes.push(TestOutcome {
            label: format!("jumper configuration {}", expected_jumper),
            measured: conf.jumper_configuration as f64,
            passed: jumper_ok,
            elapsed_ms: None,
        });
        if jumper_ok {
            info!("... OK");
        } else {
            error!("Wrong jumper configuration: {}", conf.jumper_configuration);
            error!("-----------------> NICHT OK");
            return Err(Report::new(BenchError::CheckFailed).attach_printable(format!(
                "jumper configuration {} (expected {})",
                conf.jumper_configuration, expected_jumper
            )));
        }

        if check_lock_switch {
            info!("Checking lock switch configuration");
            let lock_ok = conf.has_lock_switch == self.limits.expect_lock_switch;
            self.outcomes.push(TestOutcome {
                label: "lock switch configuration".to_owned(),
                measured: conf.has_lock_switch as u8 as f64,
                passed: lock_ok,
                elapsed_ms: None,
            });
            if lock_ok {
                info!("... OK");
            } else {
                error!("Wrong lock switch configuration: {}", conf.has_lock_switch);
                error!("-----------------> NICHT OK");
                return Err(Report::new(BenchError::CheckFailed).attach_printable(format!(
                    "lock switch {} (expected {})",
                    conf.has_lock_switch, self.limits.expect_lock_switch
                )));
            }
        }
        Ok(())
    }

    /// Two-point CP/PE calibration from operator-supplied reference
    /// voltages, then the unit's auto-calibration settle.
    fn calibrating_phase(
        &mut self,
        operator: &mut dyn Operator,
    ) -> Result<(i32, i32, i32), BenchError> {
        info!("Starting CP/PE calibration");
        let voltage1 = operator.read_millivolts("Enter CP/PE voltage (in mV): ")?;
        if !self.limits.voltage1_mv.contains(voltage1 as f64) {
            error!(
                "Voltage not allowed: {}mV (expected within {})",
                voltage1, self.limits.voltage1_mv
            );
            return Err(Report::new(BenchError::OperatorInput)
                .attach_printable(format!("voltage1 {}mV outside {}", voltage1, self.limits.voltage1_mv)));
        }
        info!("Calibrating with {}mV", voltage1);
        self.submit_calibration(CalibrationStep {
            step: CAL_STEP_VOLTAGE,
            reference: CAL_REF_VOLTAGE,
            value_mv: voltage1,
        })?;
        self.settle(self.limits.calibration_settle)?;

        let voltage2 = operator.read_millivolts("Enter CP/PE voltage (in mV): ")?;
        if !self.limits.voltage2_mv.contains(voltage2 as f64) {
            error!(
                "Voltage not allowed: {}mV (expected within {})",
                voltage2, self.limits.voltage2_mv
            );
            return Err(Report::new(BenchError::OperatorInput)
                .attach_printable(format!("voltage2 {}mV outside {}", voltage2, self.limits.voltage2_mv)));
        }

        let offset = voltage1 + voltage2;
        if !self.limits.offset_mv.contains(offset as f64) {
            error!(
                "Offset not allowed: {}mV (v1 {}mV, v2 {}mV, expected within {})",
                offset, voltage1, voltage2, self.limits.offset_mv
            );
            return Err(Report::new(BenchError::OperatorInput)
                .attach_printable(format!("offset {}mV outside {}", offset, self.limits.offset_mv)));
        }
        info!("Setting offset {}mV (v1 {}mV, v2 {}mV)", offset, voltage1, voltage2);
        self.submit_calibration(CalibrationStep {
            step: CAL_STEP_OFFSET,
            reference: CAL_REF_OFFSET,
            value_mv: offset,
        })?;
        info!("... OK");

        info!("Waiting for auto-calibration");
        self.settle(self.limits.autocal_settle)?;
        info!("... OK");
        Ok((voltage1, voltage2, offset))
    }

    /// Resistance, current-sweep, and contactor-timing assertions.
    fn asserting_phase(&mut self) -> Result<AssertMeasurements, BenchError> {
        info!("Setting 2700 Ohm resistor");
        self.rig
            .set_cp_pe_resistor(true, false, false)
            .change_context(BenchError::Device)?;
        self.settle(self.limits.resistor_settle)?;

        info!("Testing CP/PE resistance (no PWM)");
        let cp_idle = self
            .evse
            .low_level_state()
            .change_context(BenchError::Device)?
            .cp_pe_ohm;
        self.require_band("CP/PE resistance (no PWM)", cp_idle as f64, self.limits.cp_idle_ohm)?;

        info!("Setting 2700 Ohm + 880 Ohm resistor");
        self.rig
            .set_cp_pe_resistor(true, true, false)
            .change_context(BenchError::Device)?;
        let close = self.wait_for_contactor(true, self.limits.contactor_close)?;
        if !close.met {
            let elapsed_ms = close.elapsed.as_millis() as u64;
            self.outcomes.push(TestOutcome {
                label: "contactor close confirmation".to_owned(),
                measured: elapsed_ms as f64,
                passed: false,
                elapsed_ms: Some(elapsed_ms),
            });
            error!("-----------------> NICHT OK (no contactor confirmation)");
            return Err(Report::new(BenchError::CheckFailed).attach_printable(format!(
                "contactor confirmation not observed within {:?}",
                close.elapsed
            )));
        }

        info!("Engaging contactor");
        self.rig
            .set_contactor(true, true)
            .change_context(BenchError::Device)?;
        self.settle(self.limits.contactor_hold)?;
        info!("... OK");

        info!("Checking PP/PE resistance");
        let pp = self
            .evse
            .low_level_state()
            .change_context(BenchError::Device)?
            .pp_pe_ohm;
        // reported but not fatal; the run continues either way
        self.check_band("PP/PE resistance", pp as f64, self.limits.pp_ohm);

        let sweep = self.limits.sweep;
        let load_band = self.limits.cp_load_ohm;
        let mut cp_load = cp_idle;
        for amps in sweep.currents_a() {
            info!("Testing {}A", amps);
            self.evse
                .set_max_charging_current(amps * 1_000)
                .change_context(BenchError::Device)?;
            self.settle(self.limits.sweep_settle)?;
            let reading = self
                .evse
                .low_level_state()
                .change_context(BenchError::Device)?
                .cp_pe_ohm;
            self.require_band(&format!("CP/PE resistance at {}A", amps), reading as f64, load_band)?;
            cp_load = reading;
        }

        info!("Measuring contactor drop-out time");
        let start = Instant::now();
        self.rig
            .set_cp_pe_resistor(true, false, false)
            .change_context(BenchError::Device)?;
        let open = self.wait_for_contactor(false, self.limits.contactor_open)?;
        self.rig
            .set_contactor(true, false)
            .change_context(BenchError::Device)?;
        let dropout_ms = start.elapsed().as_millis() as u64;
        if !open.met {
            self.outcomes.push(TestOutcome {
                label: "contactor drop-out".to_owned(),
                measured: dropout_ms as f64,
                passed: false,
                elapsed_ms: Some(dropout_ms),
            });
            error!("-----------------> NICHT OK (contactor never dropped out)");
            return Err(Report::new(BenchError::CheckFailed).attach_printable(format!(
                "contactor drop-out not observed within {:?}",
                open.elapsed
            )));
        }

        let ceiling = self.limits.dropout_ceiling_ms;
        let passed = dropout_ms <= ceiling;
        self.outcomes.push(TestOutcome {
            label: "contactor drop-out".to_owned(),
            measured: dropout_ms as f64,
            passed,
            elapsed_ms: Some(dropout_ms),
        });
        if passed {
            info!("Drop-out time: {}ms OK", dropout_ms);
        } else {
            error!("Drop-out time: {}ms (ceiling {}ms)", dropout_ms, ceiling);
            error!("-----------------> NICHT OK");
            return Err(Report::new(BenchError::CheckFailed).attach_printable(format!(
                "drop-out {}ms above ceiling {}ms",
                dropout_ms, ceiling
            )));
        }

        info!("Set the rotary switch to 'disabled', then press the tester button");
        self.wait_for_button()?;

        self.evse.reset().change_context(BenchError::Device)?;
        self.settle(self.limits.reset_settle)?;
        self.verify_hardware_configuration(self.limits.jumper_after, false)?;

        Ok(AssertMeasurements {
            cp_idle_ohm: cp_idle,
            cp_load_ohm: cp_load,
            pp_pe_ohm: pp,
            dropout_ms,
        })
    }

    fn submit_calibration(&mut self, step: CalibrationStep) -> Result<(), BenchError> {
        let accepted = self.evse.calibrate(step).change_context(BenchError::Device)?;
        if accepted {
            Ok(())
        } else {
            error!(
                "EVSE calibration failed: {}, {:#010X}, {}",
                step.step, step.reference, step.value_mv
            );
            Err(Report::new(BenchError::CalibrationRejected).attach_printable(format!(
                "step {} reference {:#010X} value {}mV",
                step.step, step.reference, step.value_mv
            )))
        }
    }

    /// Records one acceptance-band check and logs its verdict. Returns
    /// whether it passed; the caller decides whether a miss is fatal.
    fn check_band(&mut self, label: &str, value: f64, band: Band) -> bool {
        let passed = band.contains(value);
        self.outcomes.push(TestOutcome {
            label: label.to_owned(),
            measured: value,
            passed,
            elapsed_ms: None,
        });
        if passed {
            info!("... OK ({} Ohm)", value);
        } else {
            error!("-----------------> NICHT OK {}", value);
        }
        passed
    }

    fn require_band(&mut self, label: &str, value: f64, band: Band) -> Result<(), BenchError> {
        if self.check_band(label, value, band) {
            Ok(())
        } else {
            Err(Report::new(BenchError::CheckFailed)
                .attach_printable(format!("{}: measured {} outside {}", label, value, band)))
        }
    }

    fn wait_for_contactor(
        &mut self,
        active: bool,
        deadline: Deadline,
    ) -> Result<WaitOutcome, BenchError> {
        if active {
            info!("Waiting for contactor GPIO to become active...");
        } else {
            info!("Waiting for contactor GPIO to become inactive...");
        }
        wait_until(
            &mut *self.evse,
            |s| s.gpio[GPIO_CONTACTOR_CHECK] == active,
            self.limits.poll_interval,
            deadline,
            &self.cancel,
        )
        .map_err(poll_to_bench)
    }

    fn wait_for_button(&mut self) -> Result<(), BenchError> {
        info!("Waiting for the tester button...");
        // operator step: waiting forever here is intentional
        wait_until(
            &mut *self.evse,
            |s| s.gpio[GPIO_BUTTON],
            self.limits.poll_interval,
            Deadline::Never,
            &self.cancel,
        )
        .map_err(poll_to_bench)?;
        Ok(())
    }

    fn settle(&self, duration: Duration) -> Result<(), BenchError> {
        poll::settle(duration, &self.cancel).map_err(poll_to_bench)
    }
}

/// Delays of the continuous emulation loop.
#[derive(Debug, Clone)]
pub struct EmulationDelays {
    pub startup: Duration,
    pub step: Duration,
    pub hold: Duration,
    pub poll_interval: Duration,
}

impl Default for EmulationDelays {
    fn default() -> Self {
        Self {
            startup: Duration::from_secs(5),
            step: Duration::from_secs(5),
            hold: Duration::from_secs(10),
            poll_interval: Duration::from_millis(10),
        }
    }
}

/// Soak/demo mode: cycles the CP/PE bank through the vehicle-state
/// progression and follows the unit's contactor, with no assertions.
/// Returns only on cancellation (after making the rig safe) or on a
/// device failure.
pub fn run_emulation<E: Evse, R: RigOutputs>(
    evse: &mut E,
    rig: &mut TestRig<R>,
    delays: &EmulationDelays,
    cancel: &CancelToken,
) -> Result<(), BenchError> {
    rig.set_contactor(true, false).change_context(BenchError::Device)?;
    rig.set_diode(true).change_context(BenchError::Device)?;
    rig.set_cp_pe_resistor(false, false, false)
        .change_context(BenchError::Device)?;
    rig.set_pp_pe_resistor(false, false, true, false)
        .change_context(BenchError::Device)?;
    evse.reset().change_context(BenchError::Device)?;

    let result = emulation_cycles(evse, rig, delays, cancel);
    if let Err(safe_err) = rig.make_safe() {
        error!("Failed returning the rig to a safe state: {:?}", safe_err);
    }
    match result {
        Err(e) if matches!(e.current_context(), BenchError::Cancelled) => {
            info!("Emulation loop cancelled");
            Ok(())
        }
        other => other,
    }
}

fn emulation_cycles<E: Evse, R: RigOutputs>(
    evse: &mut E,
    rig: &mut TestRig<R>,
    delays: &EmulationDelays,
    cancel: &CancelToken,
) -> Result<(), BenchError> {
    poll::settle(delays.startup, cancel).map_err(poll_to_bench)?;
    loop {
        poll::settle(delays.step, cancel).map_err(poll_to_bench)?;
        rig.set_cp_pe_resistor(true, false, false)
            .change_context(BenchError::Device)?;
        poll::settle(delays.step, cancel).map_err(poll_to_bench)?;
        rig.set_cp_pe_resistor(true, true, false)
            .change_context(BenchError::Device)?;

        let close = wait_until(
            evse,
            |s| s.gpio[GPIO_CONTACTOR_CHECK],
            delays.poll_interval,
            Deadline::Never,
            cancel,
        )
        .map_err(poll_to_bench)?;
        debug!("Contactor confirmed after {:?}", close.elapsed);
        rig.set_contactor(true, true).change_context(BenchError::Device)?;

        poll::settle(delays.hold, cancel).map_err(poll_to_bench)?;
        rig.set_cp_pe_resistor(true, false, false)
            .change_context(BenchError::Device)?;
        wait_until(
            evse,
            |s| !s.gpio[GPIO_CONTACTOR_CHECK],
            delays.poll_interval,
            Deadline::Never,
            cancel,
        )
        .map_err(poll_to_bench)?;
        rig.set_contactor(true, false).change_context(BenchError::Device)?;

        poll::settle(delays.step, cancel).map_err(poll_to_bench)?;
        rig.set_cp_pe_resistor(false, false, false)
            .change_context(BenchError::Device)?;
        poll::settle(delays.step, cancel).map_err(poll_to_bench)?;
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::fs;
    use std::thread;

    use super::*;
    use crate::sim::{SimProfile, SimulatedStation};

    struct ScriptedOperator {
        millivolts: VecDeque<i32>,
    }

    impl ScriptedOperator {
        fn with(entries: &[i32]) -> Self {
            Self {
                millivolts: entries.iter().copied().collect(),
            }
        }
    }

    impl Operator for ScriptedOperator {
        fn confirm(&mut self, _prompt: &str) -> Result<(), BenchError> {
            Ok(())
        }

        fn read_millivolts(&mut self, _prompt: &str) -> Result<i32, BenchError> {
            self.millivolts.pop_front().ok_or_else(|| {
                Report::new(BenchError::OperatorInput).attach_printable("no more scripted entries")
            })
        }
    }

    fn quick_profile() -> SimProfile {
        SimProfile {
            close_latency: Duration::from_millis(5),
            open_latency: Duration::from_millis(5),
            ..SimProfile::default()
        }
    }

    fn fast_limits() -> TestLimits {
        TestLimits {
            dc_settle: Duration::ZERO,
            calibration_settle: Duration::ZERO,
            autocal_settle: Duration::ZERO,
            resistor_settle: Duration::ZERO,
            contactor_hold: Duration::ZERO,
            sweep_settle: Duration::ZERO,
            reset_settle: Duration::ZERO,
            contactor_close: Deadline::Within(Duration::from_secs(2)),
            contactor_open: Deadline::Within(Duration::from_secs(2)),
            poll_interval: Duration::from_millis(1),
            ..TestLimits::standard()
        }
    }

    #[test]
    fn machine_reaches_passed_on_a_clean_run() {
        let mut machine: StateMachine<BenchMachine> = StateMachine::new();
        machine.consume(&BenchMachineInput::Start).unwrap();
        assert!(matches!(machine.state(), BenchMachineState::Configuring));
        machine.consume(&BenchMachineInput::ConfigurationOk).unwrap();
        assert!(matches!(machine.state(), BenchMachineState::Calibrating));
        machine.consume(&BenchMachineInput::CalibrationOk).unwrap();
        assert!(matches!(machine.state(), BenchMachineState::Asserting));
        machine.consume(&BenchMachineInput::ChecksPassed).unwrap();
        assert!(matches!(machine.state(), BenchMachineState::Passed));
    }

    #[test]
    fn configuration_mismatch_is_terminal_for_the_run() {
        let mut machine: StateMachine<BenchMachine> = StateMachine::new();
        machine.consume(&BenchMachineInput::Start).unwrap();
        machine
            .consume(&BenchMachineInput::ConfigurationMismatch)
            .unwrap();
        assert!(matches!(machine.state(), BenchMachineState::Failed));
        machine.consume(&BenchMachineInput::Rearm).unwrap();
        assert!(matches!(machine.state(), BenchMachineState::Idle));
    }

    #[test]
    fn calibration_rejection_fails_the_run() {
        let mut machine: StateMachine<BenchMachine> = StateMachine::new();
        machine.consume(&BenchMachineInput::Start).unwrap();
        machine.consume(&BenchMachineInput::ConfigurationOk).unwrap();
        machine
            .consume(&BenchMachineInput::CalibrationRejected)
            .unwrap();
        assert!(matches!(machine.state(), BenchMachineState::Failed));
    }

    #[test]
    fn full_test_passes_on_a_healthy_unit() {
        let station = SimulatedStation::new(quick_profile());
        let mut evse = station.evse();
        let mut rig = TestRig::new(station.outputs());
        let mut sequencer =
            Sequencer::new(&mut evse, &mut rig, fast_limits(), CancelToken::new());
        let mut operator = ScriptedOperator::with(&[12_000, -12_100]);

        let report = sequencer.run_full_test(&mut operator, None).unwrap();

        assert!(report.outcomes.iter().all(|o| o.passed));
        assert_eq!(report.record.uid, "SIM");
        assert_eq!(report.record.voltage1_mv, 12_000);
        assert_eq!(report.record.voltage2_mv, -12_100);
        assert_eq!(report.record.offset_mv, -100);
        assert_eq!(report.record.cp_idle_ohm, 2_700);
        assert_eq!(report.record.cp_load_ohm, 880);
        assert_eq!(report.record.pp_pe_ohm, 220);
        assert!(report.record.dropout_ms <= 110);

        let calls = station.calls();
        assert!(calls.iter().any(|c| c.starts_with("calibrate 1 ")));
        assert!(calls.iter().any(|c| c.starts_with("calibrate 2 ")));
    }

    #[test]
    fn full_test_appends_one_row_to_the_run_log() {
        let path = std::env::temp_dir().join(format!(
            "evsebench-sequence-test-{}.csv",
            std::process::id()
        ));
        let _ = fs::remove_file(&path);

        let station = SimulatedStation::new(quick_profile());
        let mut evse = station.evse();
        let mut rig = TestRig::new(station.outputs());
        let mut sequencer =
            Sequencer::new(&mut evse, &mut rig, fast_limits(), CancelToken::new());
        let mut operator = ScriptedOperator::with(&[12_000, -12_100]);
        let recorder = RunRecorder::new(&path);

        sequencer.run_full_test(&mut operator, Some(&recorder)).unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 1);
        assert!(contents.starts_with("SIM,12000,-12100,-100,"));

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn wrong_jumper_configuration_is_fatal_before_calibration() {
        let station = SimulatedStation::new(SimProfile {
            jumper_codes: vec![7],
            ..quick_profile()
        });
        let mut evse = station.evse();
        let mut rig = TestRig::new(station.outputs());
        let mut sequencer =
            Sequencer::new(&mut evse, &mut rig, fast_limits(), CancelToken::new());
        let mut operator = ScriptedOperator::with(&[12_000, -12_100]);

        let err = sequencer.run_full_test(&mut operator, None).unwrap_err();
        assert_eq!(*err.current_context(), BenchError::CheckFailed);

        // no calibration command ever reached the unit
        assert!(!station.calls().iter().any(|c| c.starts_with("calibrate")));
        let failed: Vec<_> = sequencer.outcomes().iter().filter(|o| !o.passed).collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].measured, 7.0);
    }

    #[test]
    fn out_of_band_voltage_entry_fails_fast() {
        let station = SimulatedStation::new(quick_profile());
        let mut evse = station.evse();
        let mut rig = TestRig::new(station.outputs());
        let mut sequencer =
            Sequencer::new(&mut evse, &mut rig, fast_limits(), CancelToken::new());
        let mut operator = ScriptedOperator::with(&[13_000]);

        let err = sequencer.run_full_test(&mut operator, None).unwrap_err();
        assert_eq!(*err.current_context(), BenchError::OperatorInput);
        assert!(!station.calls().iter().any(|c| c.starts_with("calibrate")));
    }

    #[test]
    fn offset_bands_are_independent_between_variants() {
        // offset 100 mV: outside (-200, 0), inside (-200, 200)
        let station = SimulatedStation::new(quick_profile());
        let mut evse = station.evse();
        let mut rig = TestRig::new(station.outputs());
        let mut sequencer =
            Sequencer::new(&mut evse, &mut rig, fast_limits(), CancelToken::new());
        let mut operator = ScriptedOperator::with(&[12_000, -11_900]);
        let err = sequencer.run_full_test(&mut operator, None).unwrap_err();
        assert_eq!(*err.current_context(), BenchError::OperatorInput);

        let station = SimulatedStation::new(quick_profile());
        let mut evse = station.evse();
        let mut rig = TestRig::new(station.outputs());
        let extended = TestLimits {
            offset_mv: TestLimits::extended().offset_mv,
            dropout_ceiling_ms: TestLimits::extended().dropout_ceiling_ms,
            ..fast_limits()
        };
        let mut sequencer =
            Sequencer::new(&mut evse, &mut rig, extended, CancelToken::new());
        let mut operator = ScriptedOperator::with(&[12_000, -11_900]);
        let report = sequencer.run_full_test(&mut operator, None).unwrap();
        assert_eq!(report.record.offset_mv, 100);
    }

    #[test]
    fn sweep_aborts_on_first_out_of_band_reading() {
        let station = SimulatedStation::new(SimProfile {
            cp_fail_above_ma: Some(10_000),
            ..quick_profile()
        });
        let mut evse = station.evse();
        let mut rig = TestRig::new(station.outputs());
        let mut sequencer =
            Sequencer::new(&mut evse, &mut rig, fast_limits(), CancelToken::new());
        let mut operator = ScriptedOperator::with(&[12_000, -12_100]);

        let err = sequencer.run_full_test(&mut operator, None).unwrap_err();
        assert_eq!(*err.current_context(), BenchError::CheckFailed);

        let calls = station.calls();
        assert!(calls.iter().any(|c| c == "set_max_charging_current 12000"));
        assert!(!calls.iter().any(|c| c == "set_max_charging_current 14000"));
        // rig was made safe on the way out
        assert_eq!(station.pwm_duty(1), 0);
        assert_eq!(station.pwm_duty(0), 5_000);
    }

    #[test]
    fn slow_contactor_dropout_fails_the_run() {
        let station = SimulatedStation::new(SimProfile {
            open_latency: Duration::from_millis(150),
            ..quick_profile()
        });
        let mut evse = station.evse();
        let mut rig = TestRig::new(station.outputs());
        let mut sequencer =
            Sequencer::new(&mut evse, &mut rig, fast_limits(), CancelToken::new());
        let mut operator = ScriptedOperator::with(&[12_000, -12_100]);

        let err = sequencer.run_full_test(&mut operator, None).unwrap_err();
        assert_eq!(*err.current_context(), BenchError::CheckFailed);

        let dropout = sequencer
            .outcomes()
            .iter()
            .find(|o| o.label == "contactor drop-out")
            .expect("drop-out outcome recorded");
        assert!(!dropout.passed);
        assert!(dropout.elapsed_ms.unwrap() > 110);
    }

    #[test]
    fn missed_contactor_confirmation_records_a_failed_outcome() {
        let station = SimulatedStation::new(SimProfile {
            close_latency: Duration::from_millis(500),
            ..quick_profile()
        });
        let mut evse = station.evse();
        let mut rig = TestRig::new(station.outputs());
        let limits = TestLimits {
            contactor_close: Deadline::Within(Duration::from_millis(30)),
            ..fast_limits()
        };
        let mut sequencer = Sequencer::new(&mut evse, &mut rig, limits, CancelToken::new());
        let mut operator = ScriptedOperator::with(&[12_000, -12_100]);

        let err = sequencer.run_full_test(&mut operator, None).unwrap_err();
        assert_eq!(*err.current_context(), BenchError::CheckFailed);

        let close = sequencer
            .outcomes()
            .iter()
            .find(|o| o.label == "contactor close confirmation")
            .expect("close outcome recorded");
        assert!(!close.passed);
        assert!(close.elapsed_ms.unwrap() >= 30);
    }

    #[test]
    fn missed_contactor_dropout_records_a_failed_outcome() {
        let station = SimulatedStation::new(SimProfile {
            open_latency: Duration::from_millis(500),
            ..quick_profile()
        });
        let mut evse = station.evse();
        let mut rig = TestRig::new(station.outputs());
        let limits = TestLimits {
            contactor_open: Deadline::Within(Duration::from_millis(30)),
            ..fast_limits()
        };
        let mut sequencer = Sequencer::new(&mut evse, &mut rig, limits, CancelToken::new());
        let mut operator = ScriptedOperator::with(&[12_000, -12_100]);

        let err = sequencer.run_full_test(&mut operator, None).unwrap_err();
        assert_eq!(*err.current_context(), BenchError::CheckFailed);

        let dropout = sequencer
            .outcomes()
            .iter()
            .find(|o| o.label == "contactor drop-out")
            .expect("drop-out outcome recorded");
        assert!(!dropout.passed);
        assert!(dropout.elapsed_ms.unwrap() >= 30);
    }

    #[test]
    fn rejected_calibration_is_fatal() {
        let station = SimulatedStation::new(SimProfile {
            reject_calibration: true,
            ..quick_profile()
        });
        let mut evse = station.evse();
        let mut rig = TestRig::new(station.outputs());
        let mut sequencer =
            Sequencer::new(&mut evse, &mut rig, fast_limits(), CancelToken::new());
        let mut operator = ScriptedOperator::with(&[12_000, -12_100]);

        let err = sequencer.run_full_test(&mut operator, None).unwrap_err();
        assert_eq!(*err.current_context(), BenchError::CalibrationRejected);
        assert_eq!(station.pwm_duty(1), 0);
    }

    #[test]
    fn cancelled_run_surfaces_cancellation_and_makes_safe() {
        let station = SimulatedStation::new(quick_profile());
        let mut evse = station.evse();
        let mut rig = TestRig::new(station.outputs());
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut sequencer = Sequencer::new(&mut evse, &mut rig, fast_limits(), cancel);
        let mut operator = ScriptedOperator::with(&[12_000, -12_100]);

        let err = sequencer.run_full_test(&mut operator, None).unwrap_err();
        assert_eq!(*err.current_context(), BenchError::Cancelled);
        assert_eq!(station.pwm_duty(1), 0);
        assert_eq!(station.pwm_duty(0), 5_000);
    }

    #[test]
    fn emulation_loop_stops_on_cancellation_and_makes_safe() {
        let station = SimulatedStation::new(quick_profile());
        let mut evse = station.evse();
        let mut rig = TestRig::new(station.outputs());
        let delays = EmulationDelays {
            startup: Duration::from_millis(1),
            step: Duration::from_millis(1),
            hold: Duration::from_millis(5),
            poll_interval: Duration::from_millis(1),
        };
        let cancel = CancelToken::new();
        let stopper = cancel.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            stopper.cancel();
        });

        run_emulation(&mut evse, &mut rig, &delays, &cancel).unwrap();
        handle.join().unwrap();

        assert_eq!(station.pwm_duty(1), 0);
        assert_eq!(station.pwm_duty(0), 5_000);
    }
}
