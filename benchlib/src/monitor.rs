// Continuous state logger: polls the full diagnostic snapshot at a
// fixed interval and appends one CSV row per poll, indefinitely. A
// transient read error is logged and the loop continues; only
// cancellation stops it.

use std::fmt::{self, Display, Formatter};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::thread;
use std::time::Duration;

use chrono::Utc;
use error_stack::{Context, Report, Result, ResultExt};
use log::{info, warn};

use crate::device::{ChargerSnapshot, Evse};
use crate::poll::CancelToken;

pub const DEFAULT_MONITOR_INTERVAL: Duration = Duration::from_millis(200);

pub const MONITOR_HEADER: &str = "Time,IEC61851 State,LED State,Resistance CP/PE,\
Resistance PP/PE,CP PWM Duty Cycle,Contactor State,Contactor Check Error,\
GPIO 0,GPIO 1,GPIO 2,GPIO 3,Lock State,Jumper Configuration,Lock Switch,Uptime";

#[derive(Debug)]
pub enum MonitorError {
    Io,
}

impl Context for MonitorError {}

impl Display for MonitorError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            MonitorError::Io => write!(f, "failed writing monitor log"),
        }
    }
}

/// Opens the monitor log in append mode, writing the header row only
/// when the file is new or empty.
pub fn open_log(path: &Path) -> Result<File, MonitorError> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| Report::new(e).change_context(MonitorError::Io))?;
    let empty = file
        .metadata()
        .map(|m| m.len() == 0)
        .map_err(|e| Report::new(e).change_context(MonitorError::Io))?;
    if empty {
        writeln!(file, "{}", MONITOR_HEADER).change_context(MonitorError::Io)?;
    }
    Ok(file)
}

pub fn snapshot_row(snapshot: &ChargerSnapshot) -> String {
    let gpio = |i: usize| u8::from(snapshot.state.gpio[i]);
    format!(
        "{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{}",
        Utc::now().timestamp_millis(),
        snapshot.iec61851_state,
        snapshot.led_state,
        snapshot.state.cp_pe_ohm,
        snapshot.state.pp_pe_ohm,
        snapshot.state.cp_duty,
        snapshot.contactor_state,
        snapshot.contactor_error,
        gpio(0),
        gpio(1),
        gpio(2),
        gpio(3),
        snapshot.lock_state,
        snapshot.hardware.jumper_configuration,
        u8::from(snapshot.hardware.has_lock_switch),
        snapshot.state.uptime_ms
    )
}

/// Runs until cancelled. Read errors are reported with a timestamp and
/// tolerated; write errors terminate (the log itself is gone).
pub fn run_monitor<E, W>(
    evse: &mut E,
    out: &mut W,
    interval: Duration,
    cancel: &CancelToken,
) -> Result<(), MonitorError>
where
    E: Evse + ?Sized,
    W: Write,
{
    loop {
        if cancel.is_cancelled() {
            info!("Monitor stopped");
            return Ok(());
        }
        thread::sleep(interval);
        match evse.snapshot() {
            Ok(snapshot) => {
                writeln!(out, "{}", snapshot_row(&snapshot)).change_context(MonitorError::Io)?;
            }
            Err(e) => {
                warn!("Read error at {}: {:?}", Utc::now(), e);
            }
        }
    }
}
