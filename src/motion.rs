/// Motion collaborators used by the threshold tuner
///
/// The tuner never talks to hardware directly. Everything it needs (driver
/// writes, homing, moves, position rebasing, progress output, time) goes
/// through the traits below so the same search runs against a printer host
/// or against `simulated_axis::SimulatedAxis`.

use anyhow::Result;
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

use crate::error::TuneError;

/// Axes that support sensorless homing on this frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum Axis {
    X,
    Y,
}

impl Axis {
    pub fn letter(&self) -> char {
        match self {
            Axis::X => 'X',
            Axis::Y => 'Y',
        }
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.letter())
    }
}

impl FromStr for Axis {
    type Err = TuneError;

    /// Case-insensitive, surrounding whitespace ignored ("x", " Y ")
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "X" => Ok(Axis::X),
            "Y" => Ok(Axis::Y),
            _ => Err(TuneError::InvalidAxis(s.to_string())),
        }
    }
}

/// Homing motion and stall status for one axis
pub trait MotionController {
    /// Start a homing move. Returns once the move is issued, not when it ends.
    fn start_homing(&mut self, axis: Axis) -> Result<()>;
    /// Whether the axis currently reports a completed/stalled state
    fn is_homed(&mut self, axis: Axis) -> Result<bool>;
}

/// Relative linear moves used to back the head off after an attempt
pub trait AxisPositioner {
    /// Must complete before the next homing attempt starts
    fn move_relative(&mut self, axis: Axis, distance: f64, feed_rate: f64) -> Result<()>;
}

/// Rebase the controller's position for an axis without moving it
pub trait PositionResetter {
    fn set_logical_zero(&mut self, axis: Axis) -> Result<()>;
}

/// Applies a stall sensitivity value to every driver the host is configured for
pub trait ThresholdWriter {
    fn set(&mut self, threshold: u8) -> Result<()>;
}

/// Fire-and-forget progress sink
pub trait Reporter {
    fn report(&mut self, message: &str);
}

/// Monotonic time source for the stall poller
pub trait Clock {
    /// Time since an arbitrary fixed origin
    fn now(&self) -> Duration;
    fn sleep(&self, duration: Duration);
}

/// Wall clock backed by `Instant` and `thread::sleep`
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self { origin: Instant::now() }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Reporter that logs every message and optionally echoes it to stdout
#[derive(Debug, Clone, Default)]
pub struct LogReporter {
    echo: bool,
}

impl LogReporter {
    pub fn new(echo: bool) -> Self {
        Self { echo }
    }
}

impl Reporter for LogReporter {
    fn report(&mut self, message: &str) {
        log::info!(target: "tuner", "{}", message);
        if self.echo {
            println!("{}", message);
        }
    }
}

/// Every message goes to each reporter in turn
impl Reporter for Vec<Box<dyn Reporter>> {
    fn report(&mut self, message: &str) {
        for reporter in self.iter_mut() {
            reporter.report(message);
        }
    }
}
