// Boundary to the test stand hardware. The harness never talks to a
// transport directly; it goes through the two traits below, which a
// network transport (or the simulated station) implements.

use std::fmt::{self, Display, Formatter};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use error_stack::{Context, Report, Result};
use log::info;

pub const GPIO_COUNT: usize = 5;
/// Front-panel button / enable input of the unit under test.
pub const GPIO_BUTTON: usize = 0;
/// Confirmation input wired to the contactor auxiliary contact.
pub const GPIO_CONTACTOR_CHECK: usize = 3;

/// Low-level diagnostic snapshot of the unit under test. Read fresh on
/// every poll, never mutated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceState {
    pub gpio: [bool; GPIO_COUNT],
    pub cp_pe_ohm: u32,
    pub pp_pe_ohm: u32,
    /// CP PWM duty cycle in hundredths of a percent.
    pub cp_duty: u16,
    pub uptime_ms: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HardwareConfiguration {
    pub jumper_configuration: u8,
    pub has_lock_switch: bool,
}

/// Full diagnostic snapshot used by the continuous monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChargerSnapshot {
    pub iec61851_state: u8,
    pub led_state: u8,
    pub contactor_state: u8,
    pub contactor_error: u8,
    pub lock_state: u8,
    pub state: DeviceState,
    pub hardware: HardwareConfiguration,
}

/// One calibration command for the unit under test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalibrationStep {
    pub step: u8,
    pub reference: u32,
    pub value_mv: i32,
}

/// The two relay banks on the rig. The CP/PE bank ties the lock-switch
/// diode (relay 0) and the three CP resistors together, so partial
/// updates to it must read-modify-write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayBank {
    CpPe,
    PpPe,
}

#[derive(Debug)]
pub enum DeviceError {
    Read,
    Write,
    Discovery,
}

impl Context for DeviceError {}

impl Display for DeviceError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            DeviceError::Read => write!(f, "device read failed"),
            DeviceError::Write => write!(f, "device write failed"),
            DeviceError::Discovery => write!(f, "unit discovery failed"),
        }
    }
}

/// The unit under test.
pub trait Evse {
    fn uid(&self) -> String;
    fn low_level_state(&mut self) -> Result<DeviceState, DeviceError>;
    fn hardware_configuration(&mut self) -> Result<HardwareConfiguration, DeviceError>;
    fn snapshot(&mut self) -> Result<ChargerSnapshot, DeviceError>;
    /// Returns whether the unit accepted the calibration command.
    fn calibrate(&mut self, step: CalibrationStep) -> Result<bool, DeviceError>;
    fn set_max_charging_current(&mut self, milliamps: u32) -> Result<(), DeviceError>;
    fn reset(&mut self) -> Result<(), DeviceError>;
}

/// The rig's actuator outputs: two PWM channels for the AC contactor
/// lines and the two 4-way relay banks.
pub trait RigOutputs {
    fn set_pwm(&mut self, channel: u8, frequency_hz: u16, duty: u16) -> Result<(), DeviceError>;
    fn relay_values(&mut self, bank: RelayBank) -> Result<[bool; 4], DeviceError>;
    fn set_relay_values(&mut self, bank: RelayBank, values: [bool; 4]) -> Result<(), DeviceError>;
}

/// Sending half of the one-shot discovery signal. Cloned into the
/// enumeration callback; only the first announcement is kept.
#[derive(Debug, Clone)]
pub struct Announcer {
    tx: Sender<String>,
}

impl Announcer {
    pub fn announce(&self, uid: &str) {
        let _ = self.tx.try_send(uid.to_owned());
    }
}

/// Receiving half, read once by the startup phase.
#[derive(Debug)]
pub struct Discovery {
    rx: Receiver<String>,
}

impl Discovery {
    /// Blocks until a unit identifier has been announced. `None` waits
    /// forever; with a timeout, an elapsed deadline (or a dropped
    /// announcer) is a discovery error.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<String, DeviceError> {
        let uid = match timeout {
            Some(limit) => self
                .rx
                .recv_timeout(limit)
                .map_err(|e| Report::new(e).change_context(DeviceError::Discovery))?,
            None => self
                .rx
                .recv()
                .map_err(|e| Report::new(e).change_context(DeviceError::Discovery))?,
        };
        info!("Found EVSE unit: {}", uid);
        Ok(uid)
    }
}

pub fn discovery() -> (Announcer, Discovery) {
    let (tx, rx) = bounded(1);
    (Announcer { tx }, Discovery { rx })
}
