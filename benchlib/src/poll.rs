// Polling primitive of the harness: block until a predicate over fresh
// device state holds, until a deadline elapses, or until the run is
// cancelled. Every hardware-response wait in the sequencer goes through
// this one bounded, cancellable loop.

use std::fmt::{self, Display, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use error_stack::{Context, Report, Result, ResultExt};

use crate::device::{DeviceState, Evse};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

const SETTLE_SLICE: Duration = Duration::from_millis(50);

/// Wait bound. `Never` is the explicit wait-forever mode reserved for
/// operator-interaction steps; hardware-response waits get `Within`.
#[derive(Debug, Clone, Copy)]
pub enum Deadline {
    Never,
    Within(Duration),
}

#[derive(Debug, Clone, Copy)]
pub struct WaitOutcome {
    pub met: bool,
    pub elapsed: Duration,
}

/// Cooperative cancellation flag shared between the sequencer thread
/// and whoever aborts the run.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub enum PollError {
    Device,
    Cancelled,
}

impl Context for PollError {}

impl Display for PollError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            PollError::Device => write!(f, "device state read failed while waiting"),
            PollError::Cancelled => write!(f, "wait cancelled"),
        }
    }
}

/// Polls a fresh `DeviceState` at `interval` until `predicate` holds.
/// The predicate is checked before the first sleep, so a condition that
/// already holds returns at the first poll.
pub fn wait_until<E, P>(
    evse: &mut E,
    mut predicate: P,
    interval: Duration,
    deadline: Deadline,
    cancel: &CancelToken,
) -> Result<WaitOutcome, PollError>
where
    E: Evse + ?Sized,
    P: FnMut(&DeviceState) -> bool,
{
    let start = Instant::now();
    loop {
        if cancel.is_cancelled() {
            return Err(Report::new(PollError::Cancelled));
        }
        let state = evse.low_level_state().change_context(PollError::Device)?;
        if predicate(&state) {
            return Ok(WaitOutcome {
                met: true,
                elapsed: start.elapsed(),
            });
        }
        if let Deadline::Within(limit) = deadline {
            if start.elapsed() >= limit {
                return Ok(WaitOutcome {
                    met: false,
                    elapsed: start.elapsed(),
                });
            }
        }
        thread::sleep(interval);
    }
}

/// Fixed settle delay, sliced so cancellation takes effect promptly.
pub fn settle(duration: Duration, cancel: &CancelToken) -> Result<(), PollError> {
    let start = Instant::now();
    loop {
        if cancel.is_cancelled() {
            return Err(Report::new(PollError::Cancelled));
        }
        // one clock read per iteration; a second read could land past
        // the deadline and underflow the subtraction
        let remaining = duration.saturating_sub(start.elapsed());
        if remaining.is_zero() {
            return Ok(());
        }
        thread::sleep(remaining.min(SETTLE_SLICE));
    }
}
