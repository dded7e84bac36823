// Append-only run log: one comma-separated row of measurements per
// completed conformance run, accumulating across runs.

use std::fmt::{self, Display, Formatter};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use error_stack::{Context, Report, Result, ResultExt};

#[derive(Debug)]
pub struct RecorderError;

impl Context for RecorderError {}

impl Display for RecorderError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "failed appending run record")
    }
}

/// Measurements of one completed run, in the fixed column order of the
/// run log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRecord {
    pub uid: String,
    pub voltage1_mv: i32,
    pub voltage2_mv: i32,
    pub offset_mv: i32,
    pub cp_idle_ohm: u32,
    pub cp_load_ohm: u32,
    pub pp_pe_ohm: u32,
    pub dropout_ms: u64,
}

impl RunRecord {
    pub fn csv_row(&self) -> String {
        format!(
            "{},{},{},{},{},{},{},{}",
            self.uid,
            self.voltage1_mv,
            self.voltage2_mv,
            self.offset_mv,
            self.cp_idle_ohm,
            self.cp_load_ohm,
            self.pp_pe_ohm,
            self.dropout_ms
        )
    }
}

pub struct RunRecorder {
    path: PathBuf,
}

impl RunRecorder {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Appends one row, creating the file on first use.
    pub fn append(&self, record: &RunRecord) -> Result<(), RecorderError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| Report::new(e).change_context(RecorderError))?;
        writeln!(file, "{}", record.csv_row()).change_context(RecorderError)?;
        Ok(())
    }
}
