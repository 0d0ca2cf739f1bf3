//! Refresh scheduling policies: debounce, throttle, and the movement gate.
//!
//! These bound how often the client hits the backend in response to
//! fast-changing inputs (position jitter, rapid filter clicks, refresh
//! mashing). They are written as plain state machines over caller-supplied
//! [`Instant`]s rather than wrapping tokio timers directly, so the invariants
//! (one pending value, dropped-not-queued, superseded timers cleared) can be
//! asserted in tests without sleeping. The main loop drives them from its
//! tick event.

use std::time::{Duration, Instant};

use crate::models::haversine_km;

/// Delays an action until its input has stopped changing for a quiet period.
///
/// Each [`submit`](Debouncer::submit) replaces any pending value and re-arms
/// the deadline, so only the last value in a burst ever fires. `poll` returns
/// the value at most once per burst.
#[derive(Debug)]
pub struct Debouncer<T> {
    quiet_period: Duration,
    pending: Option<(T, Instant)>,
}

impl<T> Debouncer<T> {
    pub fn new(quiet_period: Duration) -> Self {
        Self {
            quiet_period,
            pending: None,
        }
    }

    /// Stores `value` and (re)arms the quiet-period deadline. A previously
    /// pending value is discarded, never fired.
    pub fn submit(&mut self, value: T, now: Instant) {
        self.pending = Some((value, now + self.quiet_period));
    }

    /// Fires the pending value if its quiet period has elapsed.
    pub fn poll(&mut self, now: Instant) -> Option<T> {
        let due = matches!(&self.pending, Some((_, deadline)) if now >= *deadline);
        if due {
            self.pending.take().map(|(v, _)| v)
        } else {
            None
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Drops any pending value without firing it.
    pub fn cancel(&mut self) {
        self.pending = None;
    }
}

/// Caps how often an action may fire regardless of input frequency.
///
/// Calls inside the spacing window are dropped, not queued: mashing the
/// refresh key collapses to a single effective press.
#[derive(Debug)]
pub struct Throttle {
    min_spacing: Duration,
    last_allowed: Option<Instant>,
}

impl Throttle {
    pub fn new(min_spacing: Duration) -> Self {
        Self {
            min_spacing,
            last_allowed: None,
        }
    }

    /// Returns true (and records the firing) if enough time has passed since
    /// the last allowed call.
    pub fn allow(&mut self, now: Instant) -> bool {
        match self.last_allowed {
            Some(last) if now.duration_since(last) < self.min_spacing => false,
            _ => {
                self.last_allowed = Some(now);
                true
            }
        }
    }
}

/// Skips position-driven lookups while effectively stationary.
///
/// Independent of any debounce timer: a new position within `min_distance_m`
/// of the last position that actually fired is ignored, so GPS jitter while
/// standing still never triggers redundant lookups.
#[derive(Debug)]
pub struct MovementGate {
    min_distance_m: f64,
    last_fired: Option<(f64, f64)>,
}

impl MovementGate {
    pub fn new(min_distance_m: f64) -> Self {
        Self {
            min_distance_m,
            last_fired: None,
        }
    }

    /// Returns true (and records the position) if `position` is far enough
    /// from the last position that fired. The first position always fires.
    pub fn should_fire(&mut self, position: (f64, f64)) -> bool {
        let moved_m = self
            .last_fired
            .map(|(lat, lng)| haversine_km(lat, lng, position.0, position.1) * 1000.0);

        match moved_m {
            Some(m) if m < self.min_distance_m => false,
            _ => {
                self.last_fired = Some(position);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn debounce_fires_last_value_once() {
        let t0 = Instant::now();
        let mut d = Debouncer::new(secs(1));

        // Five rapid filter changes inside the quiet period.
        for (i, v) in ["a", "b", "c", "d", "e"].iter().enumerate() {
            d.submit(*v, t0 + Duration::from_millis(i as u64 * 100));
        }

        // Not yet quiet.
        assert_eq!(d.poll(t0 + Duration::from_millis(900)), None);
        // Quiet period measured from the last submission.
        assert_eq!(d.poll(t0 + Duration::from_millis(1400)), Some("e"));
        // Fires at most once per burst.
        assert_eq!(d.poll(t0 + secs(10)), None);
    }

    #[test]
    fn debounce_resubmission_discards_pending() {
        let t0 = Instant::now();
        let mut d = Debouncer::new(secs(1));
        d.submit(1, t0);
        d.submit(2, t0 + Duration::from_millis(500));
        assert_eq!(d.poll(t0 + Duration::from_millis(1100)), None);
        assert_eq!(d.poll(t0 + Duration::from_millis(1600)), Some(2));
    }

    #[test]
    fn debounce_cancel_drops_value() {
        let t0 = Instant::now();
        let mut d = Debouncer::new(secs(1));
        d.submit(7, t0);
        d.cancel();
        assert_eq!(d.poll(t0 + secs(5)), None);
    }

    #[test]
    fn throttle_drops_second_press_in_window() {
        let t0 = Instant::now();
        let mut t = Throttle::new(secs(2));
        assert!(t.allow(t0));
        // Second press inside 1s is dropped, not queued.
        assert!(!t.allow(t0 + secs(1)));
        assert!(t.allow(t0 + secs(3)));
    }

    #[test]
    fn throttle_dropped_press_does_not_extend_window() {
        let t0 = Instant::now();
        let mut t = Throttle::new(secs(2));
        assert!(t.allow(t0));
        assert!(!t.allow(t0 + Duration::from_millis(1900)));
        // Window is measured from the last *allowed* call.
        assert!(t.allow(t0 + Duration::from_millis(2100)));
    }

    #[test]
    fn movement_gate_skips_jitter() {
        let mut g = MovementGate::new(50.0);
        assert!(g.should_fire((12.9716, 77.5946)));
        // ~11 m east: jitter, skipped.
        assert!(!g.should_fire((12.9716, 77.5947)));
        // ~1 km east: real movement.
        assert!(g.should_fire((12.9716, 77.6046)));
    }

    #[test]
    fn movement_gate_tracks_last_fired_not_last_seen() {
        let mut g = MovementGate::new(50.0);
        assert!(g.should_fire((12.0, 77.0)));
        // Creep in small steps; none individually fires until total drift
        // from the last fired position exceeds the gate.
        assert!(!g.should_fire((12.0001, 77.0)));
        assert!(!g.should_fire((12.0003, 77.0)));
        assert!(g.should_fire((12.001, 77.0)));
    }
}
