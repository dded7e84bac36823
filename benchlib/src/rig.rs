// Actuation layer: semantic rig operations translated into PWM and
// relay-bank writes. Each operation touches exactly one hardware
// channel and logs the resulting physical configuration.

use error_stack::Result;
use log::info;

use crate::device::{DeviceError, RelayBank, RigOutputs};

const CONTACTOR_INPUT_CHANNEL: u8 = 0;
const CONTACTOR_OUTPUT_CHANNEL: u8 = 1;
const CONTACTOR_PWM_FREQUENCY_HZ: u16 = 500;
const CONTACTOR_DUTY_LIVE: u16 = 5_000;
const CONTACTOR_DUTY_OFF: u16 = 0;

// CP/PE bank layout: relay 0 carries the lock-switch configuration
// diode, relays 1..3 the switchable resistors.
const CP_DIODE: usize = 0;
const CP_R2700: usize = 1;
const CP_R880: usize = 2;
const CP_R240: usize = 3;

pub struct TestRig<R: RigOutputs> {
    outputs: R,
}

impl<R: RigOutputs> TestRig<R> {
    pub fn new(outputs: R) -> Self {
        Self { outputs }
    }

    /// Drives the two AC contactor lines. Live is a fixed 50 % duty at
    /// 500 Hz, off is zero duty; there is no intermediate state.
    pub fn set_contactor(&mut self, input_live: bool, output_live: bool) -> Result<(), DeviceError> {
        for (channel, live, name) in [
            (CONTACTOR_INPUT_CHANNEL, input_live, "AC0"),
            (CONTACTOR_OUTPUT_CHANNEL, output_live, "AC1"),
        ] {
            let duty = if live {
                CONTACTOR_DUTY_LIVE
            } else {
                CONTACTOR_DUTY_OFF
            };
            self.outputs
                .set_pwm(channel, CONTACTOR_PWM_FREQUENCY_HZ, duty)?;
            info!("{} {}", name, if live { "live" } else { "off" });
        }
        Ok(())
    }

    /// Read-modify-write of the diode relay, preserving the resistor
    /// relays on the same bank.
    pub fn set_diode(&mut self, enable: bool) -> Result<(), DeviceError> {
        let mut values = self.outputs.relay_values(RelayBank::CpPe)?;
        values[CP_DIODE] = enable;
        self.outputs.set_relay_values(RelayBank::CpPe, values)?;
        if enable {
            info!("Enable lock switch configuration diode");
        } else {
            info!("Disable lock switch configuration diode");
        }
        Ok(())
    }

    /// Read-modify-write of the three CP/PE resistor relays, preserving
    /// the diode relay. Any subset may be on at once; combined values
    /// emulate intermediate vehicle states.
    pub fn set_cp_pe_resistor(&mut self, r2700: bool, r880: bool, r240: bool) -> Result<(), DeviceError> {
        let mut values = self.outputs.relay_values(RelayBank::CpPe)?;
        values[CP_R2700] = r2700;
        values[CP_R880] = r880;
        values[CP_R240] = r240;
        self.outputs.set_relay_values(RelayBank::CpPe, values)?;

        let mut selected = Vec::new();
        if r2700 {
            selected.push("2700 Ohm");
        }
        if r880 {
            selected.push("880 Ohm");
        }
        if r240 {
            selected.push("240 Ohm");
        }
        info!("Set CP/PE resistor: {}", selected.join(", "));
        Ok(())
    }

    /// The PP/PE bank carries nothing but the four resistors, so it is
    /// written as a full overwrite.
    pub fn set_pp_pe_resistor(
        &mut self,
        r1500: bool,
        r680: bool,
        r220: bool,
        r100: bool,
    ) -> Result<(), DeviceError> {
        self.outputs
            .set_relay_values(RelayBank::PpPe, [r1500, r680, r220, r100])?;

        let mut selected = Vec::new();
        if r1500 {
            selected.push("1500 Ohm");
        }
        if r680 {
            selected.push("680 Ohm");
        }
        if r220 {
            selected.push("220 Ohm");
        }
        if r100 {
            selected.push("100 Ohm");
        }
        info!("Set PP/PE resistor: {}", selected.join(", "));
        Ok(())
    }

    /// Teardown configuration: unit supply stays live, vehicle side is
    /// de-energized. Called on every cancellation and fatal error path.
    pub fn make_safe(&mut self) -> Result<(), DeviceError> {
        self.set_contactor(true, false)
    }
}

#[cfg(test)]
mod tests {
    use error_stack::Result;

    use super::*;

    #[derive(Default)]
    struct FakeOutputs {
        cp_bank: [bool; 4],
        pp_bank: [bool; 4],
        pwm: Vec<(u8, u16, u16)>,
    }

    impl RigOutputs for FakeOutputs {
        fn set_pwm(&mut self, channel: u8, frequency_hz: u16, duty: u16) -> Result<(), DeviceError> {
            self.pwm.push((channel, frequency_hz, duty));
            Ok(())
        }

        fn relay_values(&mut self, bank: RelayBank) -> Result<[bool; 4], DeviceError> {
            Ok(match bank {
                RelayBank::CpPe => self.cp_bank,
                RelayBank::PpPe => self.pp_bank,
            })
        }

        fn set_relay_values(&mut self, bank: RelayBank, values: [bool; 4]) -> Result<(), DeviceError> {
            match bank {
                RelayBank::CpPe => self.cp_bank = values,
                RelayBank::PpPe => self.pp_bank = values,
            }
            Ok(())
        }
    }

    #[test]
    fn diode_toggle_preserves_resistor_relays() {
        let mut rig = TestRig::new(FakeOutputs {
            cp_bank: [false, true, false, true],
            ..FakeOutputs::default()
        });
        rig.set_diode(true).unwrap();
        assert_eq!(rig.outputs.cp_bank, [true, true, false, true]);
        rig.set_diode(false).unwrap();
        assert_eq!(rig.outputs.cp_bank, [false, true, false, true]);
    }

    #[test]
    fn cp_pe_write_preserves_diode_relay() {
        let mut rig = TestRig::new(FakeOutputs {
            cp_bank: [true, true, true, true],
            ..FakeOutputs::default()
        });
        rig.set_cp_pe_resistor(true, false, false).unwrap();
        assert_eq!(rig.outputs.cp_bank, [true, true, false, false]);
    }

    #[test]
    fn pp_pe_write_overwrites_the_whole_bank() {
        let mut rig = TestRig::new(FakeOutputs {
            pp_bank: [true, true, true, true],
            ..FakeOutputs::default()
        });
        rig.set_pp_pe_resistor(false, false, true, false).unwrap();
        assert_eq!(rig.outputs.pp_bank, [false, false, true, false]);
    }

    #[test]
    fn contactor_drives_both_pwm_channels() {
        let mut rig = TestRig::new(FakeOutputs::default());
        rig.set_contactor(true, false).unwrap();
        assert_eq!(rig.outputs.pwm, vec![(0, 500, 5_000), (1, 500, 0)]);

        rig.outputs.pwm.clear();
        rig.set_contactor(true, true).unwrap();
        assert_eq!(rig.outputs.pwm, vec![(0, 500, 5_000), (1, 500, 5_000)]);
    }

    #[test]
    fn make_safe_keeps_supply_live_and_output_off() {
        let mut rig = TestRig::new(FakeOutputs::default());
        rig.make_safe().unwrap();
        assert_eq!(rig.outputs.pwm, vec![(0, 500, 5_000), (1, 500, 0)]);
    }
}
