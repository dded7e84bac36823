// Software rig: an in-process stand-in for the relay bricks and the
// unit under test, sharing one core behind a mutex the way a real
// transport shares its connection. Used by the binary when no hardware
// is attached and by the sequencer's end-to-end tests.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use error_stack::{Report, Result};

use crate::device::{
    CalibrationStep, ChargerSnapshot, DeviceError, DeviceState, Evse, HardwareConfiguration,
    RelayBank, RigOutputs, GPIO_BUTTON, GPIO_CONTACTOR_CHECK, GPIO_COUNT,
};

const CP_R2700: usize = 1;
const CP_R880: usize = 2;
const CP_R240: usize = 3;

/// Open-circuit reading reported when no resistor is switched in.
const OPEN_OHM: u32 = u32::MAX;

#[derive(Debug, Clone)]
pub struct SimProfile {
    pub uid: String,
    /// Jumper code visible after the n-th reset; the last entry repeats.
    pub jumper_codes: Vec<u8>,
    pub has_lock_switch: bool,
    /// Delay between charge request and contactor confirmation.
    pub close_latency: Duration,
    /// Delay between charge release and confirmation drop-out.
    pub open_latency: Duration,
    /// Models the operator holding the front-panel button down.
    pub button_held: bool,
    pub reject_calibration: bool,
    /// Reports a wildly wrong CP/PE resistance once the commanded
    /// charging current exceeds this, to provoke sweep failures.
    pub cp_fail_above_ma: Option<u32>,
}

impl Default for SimProfile {
    fn default() -> Self {
        Self {
            uid: "SIM".to_owned(),
            jumper_codes: vec![6, 8],
            has_lock_switch: false,
            close_latency: Duration::from_millis(30),
            open_latency: Duration::from_millis(30),
            button_held: true,
            reject_calibration: false,
            cp_fail_above_ma: None,
        }
    }
}

#[derive(Debug)]
struct SimCore {
    profile: SimProfile,
    cp_bank: [bool; 4],
    pp_bank: [bool; 4],
    pwm_duty: [u16; 4],
    max_current_ma: u32,
    resets: u32,
    charge_request_since: Option<Instant>,
    charge_release_since: Option<Instant>,
    contactor_confirmed: bool,
    started: Instant,
    calls: Vec<String>,
}

impl SimCore {
    fn new(profile: SimProfile) -> Self {
        Self {
            profile,
            cp_bank: [false; 4],
            pp_bank: [false; 4],
            pwm_duty: [0; 4],
            max_current_ma: 0,
            resets: 0,
            charge_request_since: None,
            charge_release_since: None,
            contactor_confirmed: false,
            started: Instant::now(),
            calls: Vec::new(),
        }
    }

    fn contactor_gpio(&mut self) -> bool {
        if self.cp_bank[CP_R880] {
            if let Some(since) = self.charge_request_since {
                if since.elapsed() >= self.profile.close_latency {
                    self.contactor_confirmed = true;
                }
            }
        } else if let Some(since) = self.charge_release_since {
            if since.elapsed() >= self.profile.open_latency {
                self.contactor_confirmed = false;
            }
        }
        self.contactor_confirmed
    }

    fn cp_resistance(&self) -> u32 {
        if let Some(limit) = self.profile.cp_fail_above_ma {
            if self.max_current_ma > limit {
                return 50_000;
            }
        }
        if self.cp_bank[CP_R880] {
            880
        } else if self.cp_bank[CP_R2700] {
            2_700
        } else if self.cp_bank[CP_R240] {
            240
        } else {
            OPEN_OHM
        }
    }

    fn pp_resistance(&self) -> u32 {
        if self.pp_bank[0] {
            1_500
        } else if self.pp_bank[1] {
            680
        } else if self.pp_bank[2] {
            220
        } else if self.pp_bank[3] {
            100
        } else {
            OPEN_OHM
        }
    }

    fn jumper_configuration(&self) -> u8 {
        let codes = &self.profile.jumper_codes;
        let index = (self.resets.saturating_sub(1) as usize).min(codes.len().saturating_sub(1));
        codes.get(index).copied().unwrap_or(0)
    }

    fn state(&mut self) -> DeviceState {
        let mut gpio = [false; GPIO_COUNT];
        gpio[GPIO_BUTTON] = self.profile.button_held;
        gpio[GPIO_CONTACTOR_CHECK] = self.contactor_gpio();
        DeviceState {
            gpio,
            cp_pe_ohm: self.cp_resistance(),
            pp_pe_ohm: self.pp_resistance(),
            cp_duty: (self.max_current_ma as f64 / 6.0) as u16,
            uptime_ms: self.started.elapsed().as_millis() as u32,
        }
    }
}

pub struct SimulatedStation {
    core: Arc<Mutex<SimCore>>,
}

impl SimulatedStation {
    pub fn new(profile: SimProfile) -> Self {
        Self {
            core: Arc::new(Mutex::new(SimCore::new(profile))),
        }
    }

    pub fn uid(&self) -> String {
        self.core.lock().unwrap().profile.uid.clone()
    }

    pub fn evse(&self) -> SimEvse {
        SimEvse {
            core: Arc::clone(&self.core),
        }
    }

    pub fn outputs(&self) -> SimOutputs {
        SimOutputs {
            core: Arc::clone(&self.core),
        }
    }

    /// Every facade call in arrival order, for assertions.
    pub fn calls(&self) -> Vec<String> {
        self.core.lock().unwrap().calls.clone()
    }

    /// Duty of a PWM channel; a channel that was never driven reads 0.
    pub fn pwm_duty(&self, channel: u8) -> u16 {
        let core = self.core.lock().unwrap();
        core.pwm_duty.get(channel as usize).copied().unwrap_or(0)
    }
}

pub struct SimEvse {
    core: Arc<Mutex<SimCore>>,
}

impl SimEvse {
    fn core(&self) -> MutexGuard<'_, SimCore> {
        self.core.lock().unwrap()
    }
}

impl Evse for SimEvse {
    fn uid(&self) -> String {
        self.core().profile.uid.clone()
    }

    fn low_level_state(&mut self) -> Result<DeviceState, DeviceError> {
        Ok(self.core().state())
    }

    fn hardware_configuration(&mut self) -> Result<HardwareConfiguration, DeviceError> {
        let core = self.core();
        Ok(HardwareConfiguration {
            jumper_configuration: core.jumper_configuration(),
            has_lock_switch: core.profile.has_lock_switch,
        })
    }

    fn snapshot(&mut self) -> Result<ChargerSnapshot, DeviceError> {
        let mut core = self.core();
        let state = core.state();
        let iec61851_state = if core.contactor_confirmed {
            2
        } else if core.cp_bank[CP_R2700] {
            1
        } else {
            0
        };
        Ok(ChargerSnapshot {
            iec61851_state,
            led_state: iec61851_state,
            contactor_state: u8::from(core.contactor_confirmed) * 3,
            contactor_error: 0,
            lock_state: 0,
            state,
            hardware: HardwareConfiguration {
                jumper_configuration: core.jumper_configuration(),
                has_lock_switch: core.profile.has_lock_switch,
            },
        })
    }

    fn calibrate(&mut self, step: CalibrationStep) -> Result<bool, DeviceError> {
        let mut core = self.core();
        core.calls.push(format!(
            "calibrate {} {:#010X} {}",
            step.step, step.reference, step.value_mv
        ));
        Ok(!core.profile.reject_calibration)
    }

    fn set_max_charging_current(&mut self, milliamps: u32) -> Result<(), DeviceError> {
        let mut core = self.core();
        core.calls
            .push(format!("set_max_charging_current {}", milliamps));
        core.max_current_ma = milliamps;
        Ok(())
    }

    fn reset(&mut self) -> Result<(), DeviceError> {
        let mut core = self.core();
        core.calls.push("reset".to_owned());
        core.resets += 1;
        core.max_current_ma = 0;
        Ok(())
    }
}

pub struct SimOutputs {
    core: Arc<Mutex<SimCore>>,
}

impl SimOutputs {
    fn core(&self) -> MutexGuard<'_, SimCore> {
        self.core.lock().unwrap()
    }
}

impl RigOutputs for SimOutputs {
    fn set_pwm(&mut self, channel: u8, frequency_hz: u16, duty: u16) -> Result<(), DeviceError> {
        let mut core = self.core();
        core.calls
            .push(format!("set_pwm {} {} {}", channel, frequency_hz, duty));
        let slot = core
            .pwm_duty
            .get_mut(channel as usize)
            .ok_or_else(|| Report::new(DeviceError::Write))?;
        *slot = duty;
        Ok(())
    }

    fn relay_values(&mut self, bank: RelayBank) -> Result<[bool; 4], DeviceError> {
        let core = self.core();
        Ok(match bank {
            RelayBank::CpPe => core.cp_bank,
            RelayBank::PpPe => core.pp_bank,
        })
    }

    fn set_relay_values(&mut self, bank: RelayBank, values: [bool; 4]) -> Result<(), DeviceError> {
        let mut core = self.core();
        core.calls
            .push(format!("set_relay {:?} {:?}", bank, values));
        match bank {
            RelayBank::CpPe => {
                // the charge-request relay drives the emulated
                // contactor with the configured latencies
                if values[CP_R880] && !core.cp_bank[CP_R880] {
                    core.charge_request_since = Some(Instant::now());
                    core.charge_release_since = None;
                } else if !values[CP_R880] && core.cp_bank[CP_R880] {
                    core.charge_release_since = Some(Instant::now());
                    core.charge_request_since = None;
                }
                core.cp_bank = values;
            }
            RelayBank::PpPe => core.pp_bank = values,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    fn quick_profile() -> SimProfile {
        SimProfile {
            close_latency: Duration::from_millis(5),
            open_latency: Duration::from_millis(5),
            ..SimProfile::default()
        }
    }

    #[test]
    fn contactor_follows_charge_request_with_latency() {
        let station = SimulatedStation::new(quick_profile());
        let mut evse = station.evse();
        let mut outputs = station.outputs();

        outputs
            .set_relay_values(RelayBank::CpPe, [true, true, true, false])
            .unwrap();
        assert!(!evse.low_level_state().unwrap().gpio[GPIO_CONTACTOR_CHECK]);

        thread::sleep(Duration::from_millis(10));
        assert!(evse.low_level_state().unwrap().gpio[GPIO_CONTACTOR_CHECK]);

        outputs
            .set_relay_values(RelayBank::CpPe, [true, true, false, false])
            .unwrap();
        thread::sleep(Duration::from_millis(10));
        assert!(!evse.low_level_state().unwrap().gpio[GPIO_CONTACTOR_CHECK]);
    }

    #[test]
    fn resistances_follow_the_selected_relays() {
        let station = SimulatedStation::new(quick_profile());
        let mut evse = station.evse();
        let mut outputs = station.outputs();

        assert_eq!(evse.low_level_state().unwrap().cp_pe_ohm, OPEN_OHM);

        outputs
            .set_relay_values(RelayBank::CpPe, [true, true, false, false])
            .unwrap();
        outputs
            .set_relay_values(RelayBank::PpPe, [false, false, true, false])
            .unwrap();
        let state = evse.low_level_state().unwrap();
        assert_eq!(state.cp_pe_ohm, 2_700);
        assert_eq!(state.pp_pe_ohm, 220);
    }

    #[test]
    fn out_of_range_pwm_channel_is_rejected() {
        let station = SimulatedStation::new(quick_profile());
        let mut outputs = station.outputs();
        assert!(outputs.set_pwm(7, 500, 5_000).is_err());
        assert_eq!(station.pwm_duty(7), 0);
    }

    #[test]
    fn jumper_code_advances_per_reset() {
        let station = SimulatedStation::new(quick_profile());
        let mut evse = station.evse();

        assert_eq!(
            evse.hardware_configuration().unwrap().jumper_configuration,
            6
        );
        evse.reset().unwrap();
        assert_eq!(
            evse.hardware_configuration().unwrap().jumper_configuration,
            6
        );
        evse.reset().unwrap();
        assert_eq!(
            evse.hardware_configuration().unwrap().jumper_configuration,
            8
        );
        evse.reset().unwrap();
        assert_eq!(
            evse.hardware_configuration().unwrap().jumper_configuration,
            8
        );
    }
}
