// CLI entry point. Until a network transport is wired in, the facade
// traits are backed by the in-process simulated station, so every mode
// can be exercised without bench hardware attached.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::thread;
use std::time::Duration;

use clap::{Parser, Subcommand};
use error_stack::{Report, Result, ResultExt};
use log::{error, info};
use simplelog::{Config, LevelFilter, SimpleLogger};

use benchlib::device::discovery;
use benchlib::limits::TestLimits;
use benchlib::monitor::{self, DEFAULT_MONITOR_INTERVAL};
use benchlib::poll::CancelToken;
use benchlib::recorder::RunRecorder;
use benchlib::rig::TestRig;
use benchlib::sequence::{run_emulation, BenchError, EmulationDelays, Operator, Sequencer};
use benchlib::sim::{SimProfile, SimulatedStation};

#[derive(Parser)]
#[command(about = "Bench-test harness for EVSE charge controllers", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the one-shot conformance test against the connected unit
    FullTest {
        /// Use the extended offset band and drop-out ceiling
        #[arg(long)]
        extended: bool,
        /// Run log, one row appended per passed run
        #[arg(long, default_value = "full_test_log.csv")]
        log: PathBuf,
    },
    /// Cycle through the vehicle states continuously, with no assertions
    Emulate,
    /// Append one diagnostic snapshot row per interval to a CSV log
    Monitor {
        #[arg(long, default_value = "evse-monitor.csv")]
        out: PathBuf,
        #[arg(long, default_value_t = DEFAULT_MONITOR_INTERVAL.as_millis() as u64)]
        interval_ms: u64,
    },
}

fn initiate_logging() {
    let _ = SimpleLogger::init(LevelFilter::Info, Config::default());
}

struct ConsoleOperator;

impl Operator for ConsoleOperator {
    fn confirm(&mut self, prompt: &str) -> Result<(), BenchError> {
        prompt_line(prompt).map(|_| ())
    }

    fn read_millivolts(&mut self, prompt: &str) -> Result<i32, BenchError> {
        let line = prompt_line(prompt)?;
        line.trim().parse().map_err(|_| {
            Report::new(BenchError::OperatorInput)
                .attach_printable(format!("not a millivolt value: {:?}", line.trim()))
        })
    }
}

fn prompt_line(prompt: &str) -> Result<String, BenchError> {
    print!("{}", prompt);
    io::stdout().flush().change_context(BenchError::OperatorInput)?;
    let mut line = String::new();
    io::stdin()
        .lock()
        .read_line(&mut line)
        .change_context(BenchError::OperatorInput)?;
    Ok(line)
}

fn connect(station: &SimulatedStation) -> Result<String, BenchError> {
    let (announcer, discovered) = discovery();
    let uid = station.uid();
    // stands in for the transport's enumeration callback
    thread::spawn(move || {
        announcer.announce(&uid);
    });
    discovered
        .wait(Some(Duration::from_secs(5)))
        .change_context(BenchError::Connection)
}

fn run(command: Command) -> Result<(), BenchError> {
    let station = SimulatedStation::new(SimProfile::default());
    let uid = connect(&station)?;
    info!("Connected to {}", uid);

    let mut evse = station.evse();
    let mut rig = TestRig::new(station.outputs());
    let cancel = CancelToken::new();

    match command {
        Command::FullTest { extended, log } => {
            let limits = if extended {
                TestLimits::extended()
            } else {
                TestLimits::standard()
            };
            let recorder = RunRecorder::new(log);
            let mut sequencer = Sequencer::new(&mut evse, &mut rig, limits, cancel);
            let mut operator = ConsoleOperator;
            sequencer.run_full_test(&mut operator, Some(&recorder))?;
            Ok(())
        }
        Command::Emulate => {
            run_emulation(&mut evse, &mut rig, &EmulationDelays::default(), &cancel)
        }
        Command::Monitor { out, interval_ms } => {
            let mut file = monitor::open_log(&out).change_context(BenchError::Device)?;
            monitor::run_monitor(
                &mut evse,
                &mut file,
                Duration::from_millis(interval_ms),
                &cancel,
            )
            .change_context(BenchError::Device)
        }
    }
}

fn main() -> ExitCode {
    initiate_logging();
    let cli = Cli::parse();
    match run(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:?}", e);
            ExitCode::FAILURE
        }
    }
}
