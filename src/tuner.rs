/// Sensorless homing threshold tuner
///
/// Finds the usable stall-threshold band for one axis with two binary searches:
/// - Phase 1 walks up from [0, 255] looking for the highest value that does not
///   stall prematurely.
/// - Phase 2 reuses Phase 1's upper bound and walks down looking for the lowest
///   value that still stalls before the attempt times out.
///
/// Every attempt is classified as Premature, Adequate or Timeout by timing how
/// long the homing move runs before the controller reports the axis homed.

use std::time::Duration;

use serde::Serialize;

use crate::config_loader::TuneSettings;
use crate::error::{Result, TuneError};
use crate::motion::{
    Axis, AxisPositioner, Clock, MotionController, PositionResetter, Reporter, SystemClock,
    ThresholdWriter,
};

pub const THRESHOLD_MIN: i32 = 0;
pub const THRESHOLD_MAX: i32 = 255;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_FEED_RATE: f64 = 3000.0;

/// Integer search interval over the threshold domain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchRange {
    pub low: i32,
    pub high: i32,
}

impl SearchRange {
    /// The whole driver range, [0, 255]
    pub fn full() -> Self {
        Self { low: THRESHOLD_MIN, high: THRESHOLD_MAX }
    }

    /// [0, high], used to restart the search below a known-good ceiling
    pub fn below(high: i32) -> Self {
        Self { low: THRESHOLD_MIN, high }
    }

    pub fn is_open(&self) -> bool {
        self.low <= self.high
    }

    /// floor((low + high) / 2) as a driver value
    pub fn midpoint(&self) -> Result<u8> {
        let mid = (self.low + self.high).div_euclid(2);
        u8::try_from(mid).map_err(|_| TuneError::ThresholdOutOfRange(mid))
    }

    /// Drop everything at or above `threshold`
    pub fn lower_ceiling(&mut self, threshold: u8) {
        self.high = i32::from(threshold) - 1;
    }

    /// Drop everything at or below `threshold`
    pub fn raise_floor(&mut self, threshold: u8) {
        self.low = i32::from(threshold) + 1;
    }
}

/// Classification of one homing attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AttemptOutcome {
    /// Stalled before the minimum expected travel time
    Premature,
    /// Stalled inside the expected window
    Adequate,
    /// Never stalled before the attempt's time budget ran out
    Timeout,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TuningRequest {
    pub axis: Axis,
    pub backtrack_amount: f64,
    pub backtrack_to_mid: f64,
    pub timeout_seconds: f64,
    pub min_stall_time: f64,
    pub max_stall_time: f64,
}

impl TuningRequest {
    pub fn from_settings(axis: Axis, settings: &TuneSettings) -> Self {
        Self {
            axis,
            backtrack_amount: settings.backtrack_amount,
            backtrack_to_mid: settings.backtrack_to_mid,
            timeout_seconds: settings.timeout,
            min_stall_time: settings.min_stall_time,
            max_stall_time: settings.max_stall_time,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("backtrack_amount", self.backtrack_amount),
            ("backtrack_to_mid", self.backtrack_to_mid),
            ("timeout_seconds", self.timeout_seconds),
        ];
        for (name, value) in positive {
            if !(value > 0.0) {
                return Err(TuneError::InvalidRequest(format!("{} must be > 0 (got {})", name, value)));
            }
        }
        if !(self.min_stall_time >= 0.0) || !(self.max_stall_time > 0.0) {
            return Err(TuneError::InvalidRequest(format!(
                "stall window must be non-negative (got {}..{})",
                self.min_stall_time, self.max_stall_time
            )));
        }
        if self.min_stall_time > self.max_stall_time {
            return Err(TuneError::InvalidRequest(format!(
                "min_stall_time {} exceeds max_stall_time {}",
                self.min_stall_time, self.max_stall_time
            )));
        }
        Ok(())
    }

    /// Poll bound for one attempt; the request timeout caps the stall window
    pub fn attempt_time_limit(&self) -> f64 {
        self.max_stall_time.min(self.timeout_seconds)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TuningResult {
    pub highest_threshold: u8,
    pub lowest_threshold: u8,
}

/// Runs the two-phase search against injected collaborators.
///
/// The tuner takes `&mut self` for the whole run, so one instance can never
/// interleave two runs on the same axis pair.
pub struct ThresholdTuner {
    motion: Box<dyn MotionController>,
    positioner: Box<dyn AxisPositioner>,
    resetter: Box<dyn PositionResetter>,
    writer: Box<dyn ThresholdWriter>,
    reporter: Box<dyn Reporter>,
    clock: Box<dyn Clock>,
    poll_interval: Duration,
    feed_rate: f64,
}

impl ThresholdTuner {
    pub fn new(
        motion: Box<dyn MotionController>,
        positioner: Box<dyn AxisPositioner>,
        resetter: Box<dyn PositionResetter>,
        writer: Box<dyn ThresholdWriter>,
        reporter: Box<dyn Reporter>,
    ) -> Self {
        Self {
            motion,
            positioner,
            resetter,
            writer,
            reporter,
            clock: Box::new(SystemClock::new()),
            poll_interval: DEFAULT_POLL_INTERVAL,
            feed_rate: DEFAULT_FEED_RATE,
        }
    }

    pub fn with_clock(mut self, clock: Box<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_reporter(mut self, reporter: Box<dyn Reporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_feed_rate(mut self, feed_rate: f64) -> Self {
        self.feed_rate = feed_rate;
        self
    }

    /// Entry point for the external command: parse the axis selector, then tune.
    /// An unknown axis fails before any collaborator is touched.
    pub fn tune_command(&mut self, axes: &str, settings: &TuneSettings) -> Result<TuningResult> {
        let axis: Axis = axes.parse()?;
        self.tune(&TuningRequest::from_settings(axis, settings))
    }

    pub fn tune(&mut self, request: &TuningRequest) -> Result<TuningResult> {
        request.validate()?;
        log::info!(
            target: "tuner",
            "Tuning {} axis: stall window {}..{}s, backtrack {}/{}",
            request.axis,
            request.min_stall_time,
            request.attempt_time_limit(),
            request.backtrack_amount,
            request.backtrack_to_mid
        );

        let (highest_threshold, phase1) = self.find_highest(request)?;
        self.reporter.report(&format!("Highest threshold: {}", highest_threshold));

        let lowest_threshold = self.find_lowest(request, phase1.high, highest_threshold)?;
        self.reporter.report(&format!("Lowest threshold: {}", lowest_threshold));

        Ok(TuningResult { highest_threshold, lowest_threshold })
    }

    /// Phase 1. Returns the last evaluated threshold and the final range.
    fn find_highest(&mut self, request: &TuningRequest) -> Result<(u8, SearchRange)> {
        let axis = request.axis;
        let (min_time, max_time) = (request.min_stall_time, request.attempt_time_limit());
        let mut range = SearchRange::full();
        let mut threshold = 0u8;

        while range.is_open() {
            threshold = range.midpoint()?;
            let outcome = self.classify_attempt(axis, threshold, min_time, max_time)?;
            match outcome {
                AttemptOutcome::Premature => {
                    range.lower_ceiling(threshold);
                    self.backtrack(axis, request.backtrack_amount)?;
                }
                AttemptOutcome::Adequate | AttemptOutcome::Timeout => {
                    // No stall seen: assume the head sits on the home rail
                    if outcome == AttemptOutcome::Timeout {
                        self.resetter.set_logical_zero(axis)?;
                    }
                    range.raise_floor(threshold);
                    self.backtrack(axis, request.backtrack_to_mid)?;
                }
            }
            log::debug!(target: "tuner", "phase 1: {} -> {:?}, range now {:?}", threshold, outcome, range);
        }

        Ok((threshold, range))
    }

    /// Phase 2. `last_threshold` is returned unchanged when Phase 1 left nothing to search.
    fn find_lowest(&mut self, request: &TuningRequest, high: i32, last_threshold: u8) -> Result<u8> {
        let axis = request.axis;
        let (min_time, max_time) = (request.min_stall_time, request.attempt_time_limit());
        let mut range = SearchRange::below(high);
        let mut threshold = last_threshold;

        while range.is_open() {
            threshold = range.midpoint()?;
            let outcome = self.classify_attempt(axis, threshold, min_time, max_time)?;
            match outcome {
                AttemptOutcome::Timeout => {
                    range.raise_floor(threshold);
                    self.resetter.set_logical_zero(axis)?;
                    self.backtrack(axis, request.backtrack_amount)?;
                }
                AttemptOutcome::Adequate => {
                    range.lower_ceiling(threshold);
                    self.backtrack(axis, request.backtrack_to_mid)?;
                }
                AttemptOutcome::Premature => {
                    range.lower_ceiling(threshold);
                    self.backtrack(axis, request.backtrack_amount)?;
                }
            }
            log::debug!(target: "tuner", "phase 2: {} -> {:?}, range now {:?}", threshold, outcome, range);
        }

        Ok(threshold)
    }

    /// Apply `threshold`, start homing and classify how long the stall took.
    pub fn classify_attempt(
        &mut self,
        axis: Axis,
        threshold: u8,
        min_time: f64,
        max_time: f64,
    ) -> Result<AttemptOutcome> {
        self.reporter.report(&format!("Trying homing with threshold of {}", threshold));
        self.writer.set(threshold)?;

        let start = self.clock.now();
        self.motion.start_homing(axis)?;

        let outcome = match self.poll_for_stall(axis, start, max_time)? {
            Some(duration) if duration < min_time => AttemptOutcome::Premature,
            Some(_) => AttemptOutcome::Adequate,
            None => AttemptOutcome::Timeout,
        };
        Ok(outcome)
    }

    /// Poll `is_homed` until it reports true or `timeout` seconds pass.
    /// Returns the elapsed time at detection, or None on timeout.
    fn poll_for_stall(&mut self, axis: Axis, start: Duration, timeout: f64) -> Result<Option<f64>> {
        loop {
            let elapsed = self.clock.now().saturating_sub(start).as_secs_f64();
            if elapsed > timeout {
                self.reporter.report(&format!("{} axis stall detection timed out", axis));
                return Ok(None);
            }
            if self.motion.is_homed(axis)? {
                let homing_time = self.clock.now().saturating_sub(start).as_secs_f64();
                self.reporter.report(&format!("{} axis homing time: {:.2} seconds", axis, homing_time));
                return Ok(Some(homing_time));
            }
            self.clock.sleep(self.poll_interval);
        }
    }

    fn backtrack(&mut self, axis: Axis, distance: f64) -> Result<()> {
        self.positioner.move_relative(axis, distance, self.feed_rate)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulated_axis::SimulatedAxis;

    fn settings() -> TuneSettings {
        TuneSettings::default()
    }

    fn request(axis: Axis) -> TuningRequest {
        TuningRequest::from_settings(axis, &settings())
    }

    /// Stall after a fixed time regardless of threshold
    fn constant(stall: Option<f64>) -> SimulatedAxis {
        SimulatedAxis::new(move |_| stall)
    }

    #[test]
    fn test_search_range_midpoint_floor() {
        assert_eq!(SearchRange::full().midpoint().unwrap(), 127);
        assert_eq!(SearchRange { low: 254, high: 255 }.midpoint().unwrap(), 254);
        assert_eq!(SearchRange { low: 0, high: 0 }.midpoint().unwrap(), 0);
    }

    #[test]
    fn test_search_range_rejects_out_of_domain_mid() {
        match (SearchRange { low: 256, high: 300 }).midpoint() {
            Err(TuneError::ThresholdOutOfRange(278)) => {}
            other => panic!("expected ThresholdOutOfRange, got {:?}", other),
        }
    }

    #[test]
    fn test_search_range_always_shrinks() {
        // Either branch strictly narrows the interval
        let mut range = SearchRange::full();
        let mut steps = 0;
        while range.is_open() {
            let before = range.high - range.low;
            let mid = range.midpoint().unwrap();
            if steps % 2 == 0 { range.raise_floor(mid) } else { range.lower_ceiling(mid) }
            assert!(range.high - range.low < before);
            steps += 1;
        }
        assert!(steps <= 9);
    }

    #[test]
    fn test_classify_attempt_outcomes() {
        let cases = [
            (Some(0.5), AttemptOutcome::Premature),
            (Some(0.85), AttemptOutcome::Premature),
            (Some(0.95), AttemptOutcome::Adequate),
            (Some(1.0), AttemptOutcome::Adequate),
            (Some(4.2), AttemptOutcome::Adequate),
            (Some(10.0), AttemptOutcome::Adequate),
            (Some(10.05), AttemptOutcome::Timeout),
            (None, AttemptOutcome::Timeout),
        ];
        for (stall, expected) in cases {
            let sim = constant(stall);
            let mut tuner = sim.tuner();
            let outcome = tuner.classify_attempt(Axis::X, 42, 1.0, 10.0).unwrap();
            assert_eq!(outcome, expected, "stall at {:?}", stall);
            let log = sim.log();
            assert_eq!(log.thresholds, vec![42]);
            assert_eq!(log.homing_starts, vec![Axis::X]);
        }
    }

    #[test]
    fn test_classify_writes_threshold_before_homing() {
        let sim = constant(Some(2.0));
        let mut tuner = sim.tuner();
        tuner.classify_attempt(Axis::Y, 7, 1.0, 10.0).unwrap();
        assert_eq!(sim.log().events, vec!["set 7".to_string(), "home Y".to_string()]);
    }

    #[test]
    fn test_linear_model_converges_to_band_edges() {
        // stall = 20 - 0.1 * threshold: < 100 times out, > 190 is premature
        let sim = SimulatedAxis::linear(20.0, 0.1);
        let result = sim.tuner().tune(&request(Axis::X)).unwrap();
        assert_eq!(result, TuningResult { highest_threshold: 190, lowest_threshold: 100 });
    }

    #[test]
    fn test_phase_two_restarts_below_phase_one_ceiling() {
        let sim = SimulatedAxis::linear(20.0, 0.1);
        sim.tuner().tune(&request(Axis::X)).unwrap();
        let thresholds = sim.log().thresholds;
        // Phase 1 visits 127,191,159,175,183,187,189,190 and ends with high = 190
        assert_eq!(&thresholds[..8], &[127, 191, 159, 175, 183, 187, 189, 190]);
        assert_eq!(thresholds[8], 95);
    }

    #[test]
    fn test_premature_in_phase_two_lowers_ceiling() {
        // Linear band 100..=190, except a spurious early stall at 95
        let sim = SimulatedAxis::new(|t| {
            if t == 95 { Some(0.5) } else { Some((20.0 - 0.1 * f64::from(t)).max(0.0)) }
        });
        let result = sim.tuner().tune(&request(Axis::X)).unwrap();
        assert_eq!(result, TuningResult { highest_threshold: 190, lowest_threshold: 94 });

        let log = sim.log();
        assert_eq!(&log.thresholds[8..], &[95, 47, 71, 83, 89, 92, 93, 94]);
        // Phase 1 never timed out, every Phase 2 attempt after 95 did
        assert_eq!(log.zero_resets.len(), 7);

        let at = log.events.iter().position(|e| e == "set 95").unwrap();
        assert_eq!(&log.events[at..at + 4], &["set 95", "home X", "move X 5", "set 47"]);
    }

    #[test]
    fn test_invalid_axis_touches_nothing() {
        let sim = SimulatedAxis::linear(20.0, 0.1);
        let mut tuner = sim.tuner();
        match tuner.tune_command("Z", &settings()) {
            Err(TuneError::InvalidAxis(axis)) => assert_eq!(axis, "Z"),
            other => panic!("expected InvalidAxis, got {:?}", other),
        }
        let log = sim.log();
        assert!(log.events.is_empty());
        assert_eq!(log.homed_queries, 0);
    }

    #[test]
    fn test_tune_command_accepts_lowercase_axis() {
        let sim = SimulatedAxis::linear(20.0, 0.1);
        let result = sim.tuner().tune_command("y", &settings()).unwrap();
        assert_eq!(result.highest_threshold, 190);
        assert!(sim.log().homing_starts.iter().all(|a| *a == Axis::Y));
    }

    #[test]
    fn test_all_timeouts_reset_position_every_attempt() {
        let sim = constant(None);
        let result = sim.tuner().tune(&request(Axis::X)).unwrap();
        assert_eq!(result, TuningResult { highest_threshold: 255, lowest_threshold: 255 });

        let log = sim.log();
        // 9 attempts climbing to 255 in each phase
        assert_eq!(log.thresholds.len(), 18);
        assert_eq!(log.zero_resets.len(), 18);
        let distances: Vec<f64> = log.moves.iter().map(|(_, d)| *d).collect();
        assert!(distances[..9].iter().all(|d| *d == 150.0));
        assert!(distances[9..].iter().all(|d| *d == 5.0));
    }

    #[test]
    fn test_all_premature_skips_phase_two() {
        let sim = constant(Some(0.0));
        let result = sim.tuner().tune(&request(Axis::X)).unwrap();
        assert_eq!(result, TuningResult { highest_threshold: 0, lowest_threshold: 0 });

        let log = sim.log();
        assert_eq!(log.thresholds, vec![127, 63, 31, 15, 7, 3, 1, 0]);
        assert!(log.zero_resets.is_empty());
        assert!(log.moves.iter().all(|(_, d)| *d == 5.0));
    }

    #[test]
    fn test_backtrack_distances_follow_outcome() {
        // Adequate everywhere: phase 1 climbs with long moves, phase 2 descends with long moves
        let sim = constant(Some(3.0));
        sim.tuner().tune(&request(Axis::X)).unwrap();
        let log = sim.log();
        assert!(log.moves.iter().all(|(_, d)| *d == 150.0));
        assert!(log.zero_resets.is_empty());
    }

    #[test]
    fn test_tune_is_repeatable() {
        let sim = SimulatedAxis::linear(20.0, 0.1);
        let mut tuner = sim.tuner();
        let first = tuner.tune(&request(Axis::X)).unwrap();
        let second = tuner.tune(&request(Axis::X)).unwrap();
        assert_eq!(first, second);

        let other = SimulatedAxis::linear(20.0, 0.1);
        assert_eq!(other.tuner().tune(&request(Axis::X)).unwrap(), first);
    }

    #[test]
    fn test_phase_iterations_bounded() {
        for (base, slope) in [(20.0, 0.1), (5.0, 0.01), (40.0, 0.3), (12.0, 0.05)] {
            let sim = SimulatedAxis::linear(base, slope);
            sim.tuner().tune(&request(Axis::X)).unwrap();
            assert!(sim.log().thresholds.len() <= 18, "model {} - {}t", base, slope);
        }
    }

    #[test]
    fn test_request_timeout_caps_stall_window() {
        let sim = constant(Some(7.0));
        let mut req = request(Axis::X);
        req.timeout_seconds = 5.0;
        assert_eq!(req.attempt_time_limit(), 5.0);
        let result = sim.tuner().tune(&req).unwrap();
        // Nothing ever stalls inside 5s, same as the all-timeout case
        assert_eq!(result.highest_threshold, 255);
        assert_eq!(sim.log().zero_resets.len(), 18);
    }

    #[test]
    fn test_invalid_request_rejected_before_hardware() {
        let sim = constant(Some(2.0));
        let mut req = request(Axis::X);
        req.min_stall_time = 11.0;
        assert!(matches!(sim.tuner().tune(&req), Err(TuneError::InvalidRequest(_))));

        let mut req = request(Axis::X);
        req.backtrack_amount = 0.0;
        assert!(matches!(sim.tuner().tune(&req), Err(TuneError::InvalidRequest(_))));
        assert!(sim.log().events.is_empty());
    }

    #[test]
    fn test_collaborator_failure_aborts_run() {
        let sim = SimulatedAxis::linear(20.0, 0.1);
        sim.fail_moves_after(2);
        match sim.tuner().tune(&request(Axis::X)) {
            Err(TuneError::Collaborator(e)) => assert!(e.to_string().contains("move")),
            other => panic!("expected Collaborator error, got {:?}", other),
        }
        // Aborted on the third attempt's backtrack, no further homing
        assert_eq!(sim.log().homing_starts.len(), 3);
    }

    #[test]
    fn test_progress_messages_reported() {
        let sim = constant(Some(3.0));
        let (reporter, messages) = crate::simulated_axis::CollectingReporter::new();
        let mut tuner = sim.tuner().with_reporter(Box::new(reporter));
        tuner.tune(&request(Axis::X)).unwrap();
        let messages = messages.borrow();
        assert_eq!(messages[0], "Trying homing with threshold of 127");
        assert_eq!(messages[1], "X axis homing time: 3.00 seconds");
        assert!(messages.iter().any(|m| m == "Highest threshold: 255"));
        assert_eq!(messages.last().unwrap(), "Lowest threshold: 0");
    }
}
