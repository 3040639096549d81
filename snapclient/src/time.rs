/*
 * Copyright 2025 Security Union LLC
 *
 * Licensed under either of
 *
 * * Apache License, Version 2.0
 *   (http://www.apache.org/licenses/LICENSE-2.0)
 * * MIT license
 *   (http://opensource.org/licenses/MIT)
 *
 * at your option.
 *
 * Unless you explicitly state otherwise, any contribution intentionally
 * submitted for inclusion in the work by you, as defined in the Apache-2.0
 * license, shall be dual licensed as above, without any additional terms or
 * conditions.
 */

//! Wire timestamps and local clock sources.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicI64, Ordering as AtomicOrdering};
use web_time::{Duration, Instant, SystemTime, UNIX_EPOCH};

const MICROS_PER_SEC: i64 = 1_000_000;

/// Seconds plus microseconds, as carried on the wire.
///
/// Equality and ordering compare the total microsecond value, so
/// `{1, 1_000_000}` equals `{2, 0}`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Timestamp {
    pub sec: i32,
    pub usec: i32,
}

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp { sec: 0, usec: 0 };

    /// Create a normalized timestamp
    pub fn new(sec: i32, usec: i32) -> Self {
        Self { sec, usec }.normalized()
    }

    /// Carry `usec` into `[0, 1_000_000)` and clamp negative values to zero
    pub fn normalized(self) -> Self {
        Self::from_micros(self.as_micros())
    }

    /// Build from a microsecond count, saturating at zero and `i32::MAX` seconds
    pub fn from_micros(micros: i64) -> Self {
        if micros <= 0 {
            return Self::ZERO;
        }
        let sec = micros / MICROS_PER_SEC;
        if sec > i32::MAX as i64 {
            return Self {
                sec: i32::MAX,
                usec: (MICROS_PER_SEC - 1) as i32,
            };
        }
        Self {
            sec: sec as i32,
            usec: (micros % MICROS_PER_SEC) as i32,
        }
    }

    pub fn from_millis(millis: i64) -> Self {
        Self::from_micros(millis.saturating_mul(1000))
    }

    pub fn as_micros(&self) -> i64 {
        self.sec as i64 * MICROS_PER_SEC + self.usec as i64
    }

    pub fn as_millis(&self) -> i64 {
        self.as_micros().div_euclid(1000)
    }

    /// Shift by a signed microsecond delta
    pub fn add_micros(self, delta: i64) -> Self {
        Self::from_micros(self.as_micros().saturating_add(delta))
    }

    pub fn add_duration(self, delta: Duration) -> Self {
        self.add_micros(delta.as_micros().min(i64::MAX as u128) as i64)
    }

    /// Signed microseconds from `earlier` to `self`
    pub fn micros_since(&self, earlier: Timestamp) -> i64 {
        self.as_micros() - earlier.as_micros()
    }
}

impl PartialEq for Timestamp {
    fn eq(&self, other: &Self) -> bool {
        self.as_micros() == other.as_micros()
    }
}

impl Eq for Timestamp {}

impl Hash for Timestamp {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.as_micros().hash(state);
    }
}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.as_micros().cmp(&other.as_micros())
    }
}

/// Source of local time
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// Monotonic clock reported as time since the Unix epoch.
///
/// The wall clock is read once when the clock is created. Later readings
/// advance with the monotonic clock only, so an NTP step or a manual clock
/// change cannot move local time backward mid-session.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    base: Timestamp,
    started: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        let base = match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(elapsed) => Timestamp::ZERO.add_duration(elapsed),
            Err(_) => Timestamp::ZERO,
        };
        Self {
            base,
            started: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        self.base.add_duration(self.started.elapsed())
    }
}

/// Clock that only moves when told to. Used to drive sessions deterministically.
#[derive(Debug, Default)]
pub struct ManualClock {
    micros: AtomicI64,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            micros: AtomicI64::new(start.as_micros()),
        }
    }

    pub fn set(&self, now: Timestamp) {
        self.micros.store(now.as_micros(), AtomicOrdering::SeqCst);
    }

    pub fn advance(&self, delta: Duration) {
        let delta = delta.as_micros().min(i64::MAX as u128) as i64;
        self.micros.fetch_add(delta, AtomicOrdering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        Timestamp::from_micros(self.micros.load(AtomicOrdering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalization_carries_usec() {
        let ts = Timestamp::new(1, 1_500_000);
        assert_eq!(ts.sec, 2);
        assert_eq!(ts.usec, 500_000);

        let ts = Timestamp::new(3, -250_000);
        assert_eq!(ts.sec, 2);
        assert_eq!(ts.usec, 750_000);
    }

    #[test]
    fn test_negative_clamps_to_zero() {
        assert_eq!(Timestamp::new(-5, 0), Timestamp::ZERO);
        assert_eq!(Timestamp::from_micros(-1), Timestamp::ZERO);
        assert_eq!(Timestamp::new(1, 0).add_micros(-2_000_000), Timestamp::ZERO);
    }

    #[test]
    fn test_equality_ignores_representation() {
        let raw = Timestamp { sec: 1, usec: 1_000_000 };
        assert_eq!(raw, Timestamp::new(2, 0));
        assert!(Timestamp::new(2, 1) > raw);
    }

    #[test]
    fn test_arithmetic() {
        let a = Timestamp::new(10, 250_000);
        let b = a.add_micros(1_800_000);
        assert_eq!(b, Timestamp::new(12, 50_000));
        assert_eq!(b.micros_since(a), 1_800_000);
        assert_eq!(a.micros_since(b), -1_800_000);
        assert_eq!(b.as_millis(), 12_050);
        assert_eq!(Timestamp::from_millis(1500), Timestamp::new(1, 500_000));
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(Timestamp::new(100, 0));
        clock.advance(Duration::from_millis(1500));
        assert_eq!(clock.now(), Timestamp::new(101, 500_000));
        clock.set(Timestamp::new(5, 0));
        assert_eq!(clock.now(), Timestamp::new(5, 0));
    }

    #[test]
    fn test_system_clock_is_after_epoch() {
        assert!(SystemClock::new().now() > Timestamp::new(1_600_000_000, 0));
    }

    #[test]
    fn test_system_clock_never_goes_backward() {
        let clock = SystemClock::new();
        let mut previous = clock.now();
        for _ in 0..1000 {
            let now = clock.now();
            assert!(now >= previous);
            previous = now;
        }
    }
}
