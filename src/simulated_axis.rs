/// Simulated sensorless axis
///
/// Deterministic stand-in for a printer host: a stall-time model decides how
/// long a homing move runs before the driver flags a stall at a given
/// threshold, and a simulated clock advances only when the poller sleeps.
/// Used by the tests and by the CLI's `--simulate` dry run.

use anyhow::{bail, Result};
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use crate::motion::{
    Axis, AxisPositioner, Clock, LogReporter, MotionController, PositionResetter, Reporter,
    ThresholdWriter,
};
use crate::tuner::ThresholdTuner;

/// Seconds until stall for a threshold, or None if the axis never stalls
pub type StallModel = Box<dyn Fn(u8) -> Option<f64>>;

/// Clock that only moves when someone sleeps on it
#[derive(Debug, Clone, Default)]
pub struct SimClock {
    now: Rc<Cell<Duration>>,
}

impl SimClock {
    pub fn advance(&self, duration: Duration) {
        self.now.set(self.now.get() + duration);
    }
}

impl Clock for SimClock {
    fn now(&self) -> Duration {
        self.now.get()
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}

/// Everything the tuner asked the simulated machine to do
#[derive(Debug, Clone, Default)]
pub struct SimLog {
    pub thresholds: Vec<u8>,
    pub homing_starts: Vec<Axis>,
    pub moves: Vec<(Axis, f64)>,
    pub zero_resets: Vec<Axis>,
    pub homed_queries: usize,
    /// Ordered trace of writes, homing starts, moves and resets
    pub events: Vec<String>,
}

struct SimState {
    model: StallModel,
    threshold: Option<u8>,
    homing: Option<(Axis, Duration)>,
    moves_until_failure: Option<usize>,
    log: SimLog,
}

/// Shared handle; every clone drives the same simulated machine
#[derive(Clone)]
pub struct SimulatedAxis {
    state: Rc<RefCell<SimState>>,
    clock: SimClock,
}

impl SimulatedAxis {
    pub fn new(model: impl Fn(u8) -> Option<f64> + 'static) -> Self {
        Self {
            state: Rc::new(RefCell::new(SimState {
                model: Box::new(model),
                threshold: None,
                homing: None,
                moves_until_failure: None,
                log: SimLog::default(),
            })),
            clock: SimClock::default(),
        }
    }

    /// stall = base - slope * threshold, floored at an immediate stall
    pub fn linear(base: f64, slope: f64) -> Self {
        Self::new(move |threshold| Some((base - slope * f64::from(threshold)).max(0.0)))
    }

    pub fn clock(&self) -> SimClock {
        self.clock.clone()
    }

    pub fn log(&self) -> SimLog {
        self.state.borrow().log.clone()
    }

    /// Let `count` moves succeed, then fail every move after that
    pub fn fail_moves_after(&self, count: usize) {
        self.state.borrow_mut().moves_until_failure = Some(count);
    }

    /// Tuner wired to this machine and its clock, reporting through the log only
    pub fn tuner(&self) -> ThresholdTuner {
        ThresholdTuner::new(
            Box::new(self.clone()),
            Box::new(self.clone()),
            Box::new(self.clone()),
            Box::new(self.clone()),
            Box::new(LogReporter::new(false)),
        )
        .with_clock(Box::new(self.clock()))
    }
}

impl MotionController for SimulatedAxis {
    fn start_homing(&mut self, axis: Axis) -> Result<()> {
        let now = self.clock.now();
        let mut state = self.state.borrow_mut();
        if state.threshold.is_none() {
            bail!("homing {} before any threshold was applied", axis);
        }
        state.homing = Some((axis, now));
        state.log.homing_starts.push(axis);
        state.log.events.push(format!("home {}", axis));
        Ok(())
    }

    fn is_homed(&mut self, axis: Axis) -> Result<bool> {
        let now = self.clock.now();
        let mut state = self.state.borrow_mut();
        state.log.homed_queries += 1;
        let (homing_axis, started) = match state.homing {
            Some(h) => h,
            None => return Ok(false),
        };
        if homing_axis != axis {
            return Ok(false);
        }
        let threshold = state.threshold.unwrap_or_default();
        let elapsed = now.saturating_sub(started).as_secs_f64();
        Ok((state.model)(threshold).map_or(false, |stall| elapsed >= stall))
    }
}

impl AxisPositioner for SimulatedAxis {
    fn move_relative(&mut self, axis: Axis, distance: f64, _feed_rate: f64) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if let Some(left) = state.moves_until_failure {
            if left == 0 {
                bail!("simulated move failure on {} axis", axis);
            }
            state.moves_until_failure = Some(left - 1);
        }
        state.homing = None;
        state.log.moves.push((axis, distance));
        state.log.events.push(format!("move {} {}", axis, distance));
        Ok(())
    }
}

impl PositionResetter for SimulatedAxis {
    fn set_logical_zero(&mut self, axis: Axis) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.log.zero_resets.push(axis);
        state.log.events.push(format!("zero {}", axis));
        Ok(())
    }
}

impl ThresholdWriter for SimulatedAxis {
    fn set(&mut self, threshold: u8) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.threshold = Some(threshold);
        state.log.thresholds.push(threshold);
        state.log.events.push(format!("set {}", threshold));
        Ok(())
    }
}

/// Reporter that keeps every message for inspection
pub struct CollectingReporter {
    messages: Rc<RefCell<Vec<String>>>,
}

impl CollectingReporter {
    pub fn new() -> (Self, Rc<RefCell<Vec<String>>>) {
        let messages = Rc::new(RefCell::new(Vec::new()));
        (Self { messages: Rc::clone(&messages) }, messages)
    }
}

impl Reporter for CollectingReporter {
    fn report(&mut self, message: &str) {
        self.messages.borrow_mut().push(message.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sim_clock_advances_on_sleep() {
        let clock = SimClock::default();
        assert_eq!(clock.now(), Duration::ZERO);
        clock.sleep(Duration::from_millis(100));
        clock.sleep(Duration::from_millis(100));
        assert_eq!(clock.now(), Duration::from_millis(200));
    }

    #[test]
    fn test_stall_after_model_time() {
        let mut sim = SimulatedAxis::new(|_| Some(0.3));
        let clock = sim.clock();
        sim.set(50).unwrap();
        sim.start_homing(Axis::X).unwrap();
        assert!(!sim.is_homed(Axis::X).unwrap());
        clock.advance(Duration::from_millis(200));
        assert!(!sim.is_homed(Axis::X).unwrap());
        clock.advance(Duration::from_millis(100));
        assert!(sim.is_homed(Axis::X).unwrap());
        // Other axis is not the one homing
        assert!(!sim.is_homed(Axis::Y).unwrap());
    }

    #[test]
    fn test_homing_requires_threshold() {
        let mut sim = SimulatedAxis::new(|_| None);
        assert!(sim.start_homing(Axis::Y).is_err());
    }

    #[test]
    fn test_never_stalls() {
        let mut sim = SimulatedAxis::new(|_| None);
        sim.set(0).unwrap();
        sim.start_homing(Axis::X).unwrap();
        sim.clock().advance(Duration::from_secs(3600));
        assert!(!sim.is_homed(Axis::X).unwrap());
    }

    #[test]
    fn test_linear_model_floors_at_zero() {
        let mut sim = SimulatedAxis::linear(20.0, 0.1);
        sim.set(255).unwrap();
        sim.start_homing(Axis::X).unwrap();
        assert!(sim.is_homed(Axis::X).unwrap());
    }

    #[test]
    fn test_moves_and_resets_are_logged() {
        let mut sim = SimulatedAxis::new(|_| Some(0.1));
        sim.set(3).unwrap();
        sim.start_homing(Axis::X).unwrap();
        sim.move_relative(Axis::X, 150.0, 3000.0).unwrap();
        sim.move_relative(Axis::X, 5.0, 3000.0).unwrap();
        sim.set_logical_zero(Axis::X).unwrap();
        assert_eq!(sim.log().events, vec!["set 3", "home X", "move X 150", "move X 5", "zero X"]);
        assert_eq!(sim.log().zero_resets, vec![Axis::X]);
        // A move ends the homing attempt
        sim.clock().advance(Duration::from_secs(1));
        assert!(!sim.is_homed(Axis::X).unwrap());
    }

    #[test]
    fn test_move_failure_injection() {
        let mut sim = SimulatedAxis::new(|_| None);
        sim.fail_moves_after(1);
        assert!(sim.move_relative(Axis::Y, 5.0, 3000.0).is_ok());
        assert!(sim.move_relative(Axis::Y, 5.0, 3000.0).is_err());
        assert_eq!(sim.log().moves.len(), 1);
    }
}
