//! Handle-activity detection and safety derivation.
//!
//! A pure, sample-driven state machine: the polling engine is its only
//! mutator, feeding it validated position/load samples; nothing here performs
//! I/O, which keeps every transition testable with plain unit tests.
//!
//! Grab and release use separate thresholds (grab above release) so the
//! machine does not chatter when the handle hovers at the boundary, and the
//! rest baseline is tracked dynamically rather than hard-coded to tolerate
//! mounting and pulley-geometry variance between installations.

use tracing::{debug, warn};

use crate::types::{DetectorConfig, HandleActivityState, RomSide, SafetyEvent};

/// One validated position/load sample fed to the detector
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HandleSample {
    /// Milliseconds since the session started
    pub timestamp_ms: u64,
    /// Handle position in millimeters
    pub position_mm: f32,
    /// Load in kilograms
    pub load_kg: f32,
}

/// Exponentially smoothed velocity over a position stream
///
/// Raw instantaneous deltas at a 10 ms cadence are dominated by sensor
/// jitter; all velocity decisions run on the smoothed value.
#[derive(Debug, Clone)]
pub struct VelocityTracker {
    alpha: f32,
    last: Option<(u64, f32)>,
    ema_mm_s: f32,
}

impl VelocityTracker {
    /// Create a tracker with the given smoothing factor
    #[must_use]
    pub const fn new(alpha: f32) -> Self {
        Self {
            alpha,
            last: None,
            ema_mm_s: 0.0,
        }
    }

    /// Feed one position sample and return the smoothed velocity in mm/s
    pub fn update(&mut self, timestamp_ms: u64, position_mm: f32) -> f32 {
        if let Some((last_ts, last_pos)) = self.last {
            let dt_ms = timestamp_ms.saturating_sub(last_ts);
            if dt_ms > 0 {
                let raw = (position_mm - last_pos) / (dt_ms as f32) * 1000.0;
                self.ema_mm_s = self.alpha * raw + (1.0 - self.alpha) * self.ema_mm_s;
            }
        }
        self.last = Some((timestamp_ms, position_mm));
        self.ema_mm_s
    }

    /// Current smoothed velocity in mm/s
    #[must_use]
    pub const fn velocity(&self) -> f32 {
        self.ema_mm_s
    }

    /// Forget history, e.g. across a reconnect
    pub fn reset(&mut self) {
        self.last = None;
        self.ema_mm_s = 0.0;
    }
}

/// Result of feeding one sample through the detector
#[derive(Debug, Clone, PartialEq)]
pub struct DetectorUpdate {
    /// State after processing the sample
    pub state: HandleActivityState,
    /// Set when this sample caused a transition
    pub transition: Option<HandleActivityState>,
    /// False when the sample failed validation and was discarded
    pub accepted: bool,
    /// Smoothed velocity after this sample, mm/s
    pub velocity_mm_s: f32,
    /// One-shot safety events raised by this sample
    pub events: Vec<SafetyEvent>,
}

/// The 4-state handle-activity machine plus safety derivation
#[derive(Debug)]
pub struct HandleStateDetector {
    config: DetectorConfig,
    state: HandleActivityState,
    baseline_mm: Option<f32>,
    armed: bool,
    waiting_since_ms: Option<u64>,
    extended_since_ms: Option<u64>,
    velocity: VelocityTracker,
    load_ema_kg: Option<f32>,
    last_accepted_pos_mm: Option<f32>,
    last_deload_ms: Option<u64>,
    rom_high_active: bool,
    rom_low_active: bool,
}

impl HandleStateDetector {
    /// Create a detector in `WaitingForRest` with no baseline yet
    #[must_use]
    pub fn new(config: DetectorConfig) -> Self {
        Self {
            velocity: VelocityTracker::new(config.ema_alpha),
            config,
            state: HandleActivityState::WaitingForRest,
            baseline_mm: None,
            armed: false,
            waiting_since_ms: None,
            extended_since_ms: None,
            load_ema_kg: None,
            last_accepted_pos_mm: None,
            last_deload_ms: None,
            rom_high_active: false,
            rom_low_active: false,
        }
    }

    /// Current state
    #[must_use]
    pub const fn state(&self) -> HandleActivityState {
        self.state
    }

    /// Current rest baseline, once one has been established
    #[must_use]
    pub const fn baseline_mm(&self) -> Option<f32> {
        self.baseline_mm
    }

    /// Re-arm detection at a set boundary
    ///
    /// Keeps the learned baseline; clears dwell timers and load smoothing so
    /// stale values from the previous set cannot trip deload detection.
    pub fn reset(&mut self) {
        self.state = HandleActivityState::WaitingForRest;
        self.armed = false;
        self.waiting_since_ms = None;
        self.extended_since_ms = None;
        self.load_ema_kg = None;
    }

    /// Feed one sample through validation, safety checks and the state machine
    pub fn process(&mut self, sample: &HandleSample) -> DetectorUpdate {
        if !self.validate(sample) {
            return DetectorUpdate {
                state: self.state,
                transition: None,
                accepted: false,
                velocity_mm_s: self.velocity.velocity(),
                events: Vec::new(),
            };
        }

        self.last_accepted_pos_mm = Some(sample.position_mm);
        let velocity = self.velocity.update(sample.timestamp_ms, sample.position_mm);

        let mut events = Vec::new();
        self.check_deload(sample, &mut events);
        self.check_rom(sample, &mut events);

        let transition = self.advance(sample, velocity);

        DetectorUpdate {
            state: self.state,
            transition,
            accepted: true,
            velocity_mm_s: velocity,
            events,
        }
    }

    /// Defense against single corrupted BLE packets: a sample outside the
    /// sane absolute range, or one implying a physically impossible jump from
    /// the previous accepted sample, is discarded without advancing anything.
    fn validate(&self, sample: &HandleSample) -> bool {
        let position = sample.position_mm;
        if position < self.config.sample_min_mm || position > self.config.sample_max_mm {
            debug!("Rejected sample: position {position:.1}mm outside sane range");
            return false;
        }

        if let Some(last) = self.last_accepted_pos_mm {
            if (position - last).abs() > self.config.max_sample_delta_mm {
                debug!(
                    "Rejected sample: jump of {:.1}mm exceeds per-sample limit",
                    (position - last).abs()
                );
                return false;
            }
        }

        true
    }

    fn check_deload(&mut self, sample: &HandleSample, events: &mut Vec<SafetyEvent>) {
        let previous = self.load_ema_kg.unwrap_or(sample.load_kg);
        self.load_ema_kg =
            Some(self.config.ema_alpha * sample.load_kg + (1.0 - self.config.ema_alpha) * previous);

        if self.state != HandleActivityState::Active {
            return;
        }
        if previous < self.config.deload_min_load_kg {
            return;
        }

        let drop = previous - sample.load_kg;
        if drop <= self.config.deload_drop_fraction * previous {
            return;
        }

        let debounced = self.last_deload_ms.is_some_and(|last| {
            sample.timestamp_ms.saturating_sub(last) < self.config.deload_cooldown_ms
        });
        if debounced {
            return;
        }

        warn!(
            "Deload detected: load fell {:.1}kg -> {:.1}kg during active lift",
            previous, sample.load_kg
        );
        self.last_deload_ms = Some(sample.timestamp_ms);
        events.push(SafetyEvent::Deload {
            from_kg: previous,
            to_kg: sample.load_kg,
        });
    }

    /// ROM violations fire on the crossing, not on every out-of-bounds
    /// sample, so a handle parked past the bound raises exactly one event.
    fn check_rom(&mut self, sample: &HandleSample, events: &mut Vec<SafetyEvent>) {
        let position = sample.position_mm;

        if position > self.config.rom_high_mm {
            if !self.rom_high_active {
                warn!("Range-of-motion violation: {position:.1}mm above safe bound");
                self.rom_high_active = true;
                events.push(SafetyEvent::RomViolation {
                    side: RomSide::High,
                    position_mm: position,
                });
            }
        } else {
            self.rom_high_active = false;
        }

        if position < self.config.rom_low_mm {
            if !self.rom_low_active {
                warn!("Range-of-motion violation: {position:.1}mm below safe bound");
                self.rom_low_active = true;
                events.push(SafetyEvent::RomViolation {
                    side: RomSide::Low,
                    position_mm: position,
                });
            }
        } else {
            self.rom_low_active = false;
        }
    }

    fn advance(&mut self, sample: &HandleSample, velocity: f32) -> Option<HandleActivityState> {
        let position = sample.position_mm;
        let timestamp = sample.timestamp_ms;

        let next = match self.state {
            HandleActivityState::WaitingForRest => {
                self.track_baseline(position, timestamp);

                let baseline = self.baseline_mm.unwrap_or(position);
                let grabbed = self.armed && position > baseline + self.config.grab_delta_mm;
                if grabbed {
                    let since = *self.extended_since_ms.get_or_insert(timestamp);
                    if timestamp.saturating_sub(since) >= self.config.grab_dwell_ms {
                        self.extended_since_ms = None;
                        Some(HandleActivityState::Moving)
                    } else {
                        None
                    }
                } else {
                    self.extended_since_ms = None;
                    None
                }
            }
            HandleActivityState::Moving => {
                let baseline = self.baseline_mm.unwrap_or(0.0);
                if position <= baseline + self.config.release_delta_mm {
                    // Grabbed but never actually moved: not a set, go back to
                    // waiting instead of reporting a completion.
                    self.armed = false;
                    self.waiting_since_ms = None;
                    Some(HandleActivityState::WaitingForRest)
                } else if velocity.abs() > self.config.movement_velocity_mm_s {
                    Some(HandleActivityState::Active)
                } else {
                    None
                }
            }
            HandleActivityState::Active => {
                let baseline = self.baseline_mm.unwrap_or(0.0);
                if position <= baseline + self.config.release_delta_mm {
                    Some(HandleActivityState::SetComplete)
                } else {
                    None
                }
            }
            HandleActivityState::SetComplete => {
                // One sample in SetComplete lets consumers observe the edge,
                // then detection re-arms for the next set.
                self.armed = false;
                self.waiting_since_ms = None;
                self.extended_since_ms = None;
                Some(HandleActivityState::WaitingForRest)
            }
        };

        if let Some(state) = next {
            debug!("Handle state: {} -> {}", self.state, state);
            self.state = state;
        }
        next
    }

    /// Dynamic rest-baseline tracking while waiting
    ///
    /// The handle must settle inside the tolerance band before detection
    /// arms. Noisy or drifting data that never settles would stall the
    /// machine forever, so exceeding the waiting dwell timeout forces a
    /// re-baseline at the current position instead.
    fn track_baseline(&mut self, position: f32, timestamp: u64) {
        match self.baseline_mm {
            None => {
                self.baseline_mm = Some(position);
                self.armed = true;
                self.waiting_since_ms = None;
            }
            Some(baseline) => {
                if (position - baseline).abs() <= self.config.rest_settle_tolerance_mm {
                    // Settled: arm and let the baseline follow slow drift.
                    self.baseline_mm = Some(baseline + 0.1 * (position - baseline));
                    self.armed = true;
                    self.waiting_since_ms = None;
                } else if !self.armed {
                    let since = *self.waiting_since_ms.get_or_insert(timestamp);
                    if timestamp.saturating_sub(since) > self.config.waiting_dwell_timeout_ms {
                        warn!(
                            "Rest never settled after {}ms, re-baselining at {position:.1}mm",
                            self.config.waiting_dwell_timeout_ms
                        );
                        self.baseline_mm = Some(position);
                        self.armed = true;
                        self.waiting_since_ms = None;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(timestamp_ms: u64, position_mm: f32, load_kg: f32) -> HandleSample {
        HandleSample {
            timestamp_ms,
            position_mm,
            load_kg,
        }
    }

    /// Drive a fresh detector into `Active` and return it with the clock and
    /// position it ended on.
    fn active_detector() -> (HandleStateDetector, u64, f32) {
        let mut detector = HandleStateDetector::new(DetectorConfig::default());
        let mut t = 0u64;
        let mut pos = 0.0f32;

        detector.process(&sample(t, pos, 0.0));
        // Slow ramp: 70 mm/s stays under the movement threshold.
        for _ in 0..25 {
            t += 100;
            pos += 7.0;
            detector.process(&sample(t, pos, 20.0));
        }
        assert_eq!(detector.state(), HandleActivityState::Moving);

        // Fast pulls push the smoothed velocity over the threshold.
        while detector.state() != HandleActivityState::Active {
            t += 100;
            pos += 20.0;
            detector.process(&sample(t, pos, 20.0));
        }
        (detector, t, pos)
    }

    #[test]
    fn test_velocity_tracker_smoothing() {
        let mut tracker = VelocityTracker::new(0.3);
        assert_eq!(tracker.update(0, 0.0), 0.0);

        // 100 mm in 100 ms = 1000 mm/s raw; the EMA approaches it gradually.
        let v1 = tracker.update(100, 100.0);
        assert!((v1 - 300.0).abs() < 0.1);
        let v2 = tracker.update(200, 200.0);
        assert!(v2 > v1 && v2 < 1000.0);
    }

    #[test]
    fn test_extension_without_velocity_reaches_moving_not_active() {
        let mut detector = HandleStateDetector::new(DetectorConfig::default());
        let mut t = 0u64;
        let mut pos = 0.0f32;

        detector.process(&sample(t, pos, 0.0));
        assert_eq!(detector.state(), HandleActivityState::WaitingForRest);

        for _ in 0..25 {
            t += 100;
            pos += 7.0;
            let update = detector.process(&sample(t, pos, 15.0));
            assert_ne!(update.state, HandleActivityState::Active);
        }

        assert_eq!(detector.state(), HandleActivityState::Moving);
    }

    #[test]
    fn test_velocity_while_extended_reaches_active() {
        let (detector, _, _) = active_detector();
        assert_eq!(detector.state(), HandleActivityState::Active);
    }

    #[test]
    fn test_release_reaches_set_complete_then_rearms() {
        let (mut detector, mut t, mut pos) = active_detector();

        while pos > 40.0 {
            t += 100;
            pos = (pos - 150.0).max(20.0);
            detector.process(&sample(t, pos, 1.0));
        }
        assert_eq!(detector.state(), HandleActivityState::SetComplete);

        t += 100;
        detector.process(&sample(t, pos, 0.0));
        assert_eq!(detector.state(), HandleActivityState::WaitingForRest);
    }

    #[test]
    fn test_moving_release_is_not_a_set() {
        let mut detector = HandleStateDetector::new(DetectorConfig::default());
        let mut t = 0u64;
        let mut pos = 0.0f32;

        detector.process(&sample(t, pos, 0.0));
        for _ in 0..25 {
            t += 100;
            pos += 7.0;
            detector.process(&sample(t, pos, 10.0));
        }
        assert_eq!(detector.state(), HandleActivityState::Moving);

        while pos > 30.0 {
            t += 100;
            pos = (pos - 150.0).max(20.0);
            detector.process(&sample(t, pos, 1.0));
        }
        assert_eq!(detector.state(), HandleActivityState::WaitingForRest);
    }

    #[test]
    fn test_sample_validation_rejects_impossible_jumps() {
        let mut detector = HandleStateDetector::new(DetectorConfig::default());

        let update = detector.process(&sample(0, 0.0, 0.0));
        assert!(update.accepted);

        // Outside the sane absolute range.
        let update = detector.process(&sample(10, 5000.0, 0.0));
        assert!(!update.accepted);
        assert_eq!(update.state, HandleActivityState::WaitingForRest);

        // Physically impossible jump from the last accepted sample.
        let update = detector.process(&sample(20, 300.0, 0.0));
        assert!(!update.accepted);

        // A plausible sample relative to the last accepted one still works.
        let update = detector.process(&sample(30, 10.0, 0.0));
        assert!(update.accepted);
    }

    #[test]
    fn test_deload_is_debounced() {
        let (mut detector, mut t, pos) = active_detector();

        // Establish a steady smoothed load.
        for _ in 0..10 {
            t += 100;
            detector.process(&sample(t, pos, 40.0));
        }

        t += 100;
        let update = detector.process(&sample(t, pos, 2.0));
        assert!(update
            .events
            .iter()
            .any(|e| matches!(e, SafetyEvent::Deload { .. })));

        // A second collapse inside the cooldown stays silent.
        t += 100;
        detector.process(&sample(t, pos, 30.0));
        t += 100;
        let update = detector.process(&sample(t, pos, 1.0));
        assert!(update.events.is_empty());

        // After the cooldown a fresh drop fires again.
        t += 2_100;
        for _ in 0..10 {
            t += 100;
            detector.process(&sample(t, pos, 40.0));
        }
        t += 100;
        let update = detector.process(&sample(t, pos, 2.0));
        assert!(update
            .events
            .iter()
            .any(|e| matches!(e, SafetyEvent::Deload { .. })));
    }

    #[test]
    fn test_rom_violation_fires_on_crossing_only() {
        let config = DetectorConfig {
            rom_high_mm: 300.0,
            ..DetectorConfig::default()
        };
        let mut detector = HandleStateDetector::new(config);

        detector.process(&sample(0, 0.0, 0.0));
        detector.process(&sample(100, 180.0, 0.0));
        let update = detector.process(&sample(200, 320.0, 0.0));
        assert_eq!(
            update.events,
            vec![SafetyEvent::RomViolation {
                side: RomSide::High,
                position_mm: 320.0
            }]
        );

        // Parked past the bound: no repeat.
        let update = detector.process(&sample(300, 330.0, 0.0));
        assert!(update.events.is_empty());

        // Back inside, then out again: a new one-shot event.
        detector.process(&sample(400, 200.0, 0.0));
        let update = detector.process(&sample(500, 310.0, 0.0));
        assert_eq!(update.events.len(), 1);
    }

    #[test]
    fn test_waiting_dwell_timeout_forces_rebaseline() {
        let (mut detector, mut t, mut pos) = active_detector();

        // Finish the set and re-arm.
        while pos > 40.0 {
            t += 100;
            pos = (pos - 150.0).max(20.0);
            detector.process(&sample(t, pos, 1.0));
        }
        t += 100;
        detector.process(&sample(t, pos, 0.0));
        assert_eq!(detector.state(), HandleActivityState::WaitingForRest);

        // The handle parks at 80 mm: never inside the settle band, so the
        // machine would stall without the dwell timeout.
        let parked = 80.0;
        let deadline = t + 11_000;
        while t < deadline {
            t += 500;
            detector.process(&sample(t, parked, 0.0));
        }

        let baseline = detector.baseline_mm().unwrap();
        assert!((baseline - parked).abs() < 1.0);
    }

    #[test]
    fn test_reset_rearms_and_keeps_baseline() {
        let (mut detector, _, _) = active_detector();
        let baseline = detector.baseline_mm();

        detector.reset();
        assert_eq!(detector.state(), HandleActivityState::WaitingForRest);
        assert_eq!(detector.baseline_mm(), baseline);
    }
}
