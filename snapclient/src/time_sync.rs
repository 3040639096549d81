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

//! Server clock estimation from round trip probes.
//!
//! Each probe yields three instants: `t0` when the client sent it, `t1` the
//! server time while handling it, and `t2` when the reply came back. With a
//! symmetric path the server clock leads the local one by
//! `t1 - (t0 + t2) / 2`. Paths are rarely symmetric under load, and slow
//! round trips carry the largest asymmetry, so the dynamic strategies keep a
//! window of samples, reject the slow ones and report the median of the rest.
//!
//! What counts as slow is judged against the recent round trips, rejected
//! ones included. A lasting change of the path (a new route, a Wi-Fi rate
//! change) therefore moves the limit along with it instead of locking the
//! window to the old latency.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::config::{TimeSyncConfig, TimeSyncStrategy};
use crate::time::Timestamp;

/// Fewer samples than this leaves the clock unsynchronized
pub const MIN_SAMPLES_FOR_SYNC: usize = 2;

/// Round trips seen before new samples are screened on arrival
const SCREEN_ON_ARRIVAL_MIN: usize = 3;

/// Recent round trips, accepted or not, behind the outlier limit
const LATENCY_HISTORY: usize = 64;

/// Lower bound of the outlier limit, so near zero round trips (loopback,
/// coarse clocks) do not reject everything that follows
pub const MIN_LATENCY_LIMIT_MICROS: i64 = 2_000;

/// One round trip measurement
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeSample {
    /// Local time the probe was sent
    pub t0: Timestamp,
    /// Server time while handling the probe
    pub t1: Timestamp,
    /// Local time the reply was received
    pub t2: Timestamp,
}

impl TimeSample {
    pub fn new(t0: Timestamp, t1: Timestamp, t2: Timestamp) -> Self {
        Self { t0, t1, t2 }
    }

    /// Build a sample from a server reply.
    ///
    /// `c2s_latency_micros` is server receive time minus `t0` as reported in
    /// the reply payload, `server_sent` the reply's send stamp. The server
    /// time of the sample is the midpoint between receipt and reply.
    pub fn from_reply(
        t0: Timestamp,
        c2s_latency_micros: i64,
        server_sent: Timestamp,
        t2: Timestamp,
    ) -> Self {
        let server_received = t0.as_micros() + c2s_latency_micros;
        let midpoint = (server_received + server_sent.as_micros()) / 2;
        Self {
            t0,
            t1: Timestamp::from_micros(midpoint),
            t2,
        }
    }

    /// Full round trip in microseconds
    pub fn latency_micros(&self) -> i64 {
        self.t2.micros_since(self.t0)
    }

    /// Server minus local clock in microseconds
    pub fn offset_micros(&self) -> i64 {
        let local_mid = (self.t0.as_micros() + self.t2.as_micros()) / 2;
        self.t1.as_micros() - local_mid
    }
}

/// Estimated server minus local clock
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClockOffset {
    pub offset_micros: i64,
    /// Local time of the newest sample behind this estimate
    pub last_updated: Timestamp,
    /// Rate of change of the offset, when enough spread exists to tell
    pub drift_ppm: Option<f64>,
}

impl ClockOffset {
    pub fn fixed(offset_micros: i64) -> Self {
        Self {
            offset_micros,
            last_updated: Timestamp::ZERO,
            drift_ppm: None,
        }
    }

    /// Map a local instant to server time
    pub fn to_server(&self, local: Timestamp) -> Timestamp {
        local.add_micros(self.offset_micros)
    }

    /// Map a server instant to local time
    pub fn to_local(&self, server: Timestamp) -> Timestamp {
        server.add_micros(-self.offset_micros)
    }
}

/// What happened to a submitted sample
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleOutcome {
    Accepted,
    /// The reply arrived before the probe left, the local clock moved backward
    ClockWentBackward,
    /// Round trip far above the window median
    Outlier,
    /// The strategy does not use samples
    Ignored,
}

/// Common contract of all estimation strategies
pub trait TimeSync: Send {
    fn add_sample(&mut self, sample: TimeSample) -> SampleOutcome;

    /// Current estimate, `None` until enough samples arrived
    fn current_offset(&self) -> Option<ClockOffset>;

    fn reset(&mut self);

    /// Samples currently backing the estimate
    fn sample_count(&self) -> usize;

    fn strategy(&self) -> TimeSyncStrategy;
}

/// Build the strategy selected by configuration
pub fn create_time_sync(config: &TimeSyncConfig) -> Box<dyn TimeSync + Send> {
    match config.strategy {
        TimeSyncStrategy::Fixed => Box::new(FixedTimeSync::new(config.fixed_offset_micros)),
        TimeSyncStrategy::Dynamic => Box::new(DynamicTimeSync::new(
            config.window_size,
            config.outlier_multiplier,
        )),
        TimeSyncStrategy::DynamicSinceStart => Box::new(DynamicTimeSync::since_start(
            config.max_samples,
            config.outlier_multiplier,
        )),
    }
}

/// Pre-measured offset, used when probing is disabled
#[derive(Debug, Clone)]
pub struct FixedTimeSync {
    offset: ClockOffset,
}

impl FixedTimeSync {
    pub fn new(offset_micros: i64) -> Self {
        Self {
            offset: ClockOffset::fixed(offset_micros),
        }
    }
}

impl TimeSync for FixedTimeSync {
    fn add_sample(&mut self, _sample: TimeSample) -> SampleOutcome {
        SampleOutcome::Ignored
    }

    fn current_offset(&self) -> Option<ClockOffset> {
        Some(self.offset)
    }

    fn reset(&mut self) {}

    fn sample_count(&self) -> usize {
        0
    }

    fn strategy(&self) -> TimeSyncStrategy {
        TimeSyncStrategy::Fixed
    }
}

/// Median filtered estimator over a bounded window.
///
/// A sliding window forgets old samples and follows drift. The cumulative
/// variant keeps everything since the session started (up to a memory cap)
/// and trades that adaptability for lower noise.
#[derive(Debug, Clone)]
pub struct DynamicTimeSync {
    samples: VecDeque<TimeSample>,
    capacity: usize,
    recent_latencies: VecDeque<i64>,
    history_capacity: usize,
    outlier_multiplier: f64,
    strategy: TimeSyncStrategy,
}

impl DynamicTimeSync {
    /// Sliding window of the `window_size` most recent samples
    pub fn new(window_size: usize, outlier_multiplier: f64) -> Self {
        Self::with_strategy(window_size, outlier_multiplier, TimeSyncStrategy::Dynamic)
    }

    /// Cumulative window bounded by `max_samples`
    pub fn since_start(max_samples: usize, outlier_multiplier: f64) -> Self {
        Self::with_strategy(
            max_samples,
            outlier_multiplier,
            TimeSyncStrategy::DynamicSinceStart,
        )
    }

    fn with_strategy(capacity: usize, outlier_multiplier: f64, strategy: TimeSyncStrategy) -> Self {
        let capacity = capacity.max(MIN_SAMPLES_FOR_SYNC);
        let history_capacity = capacity.clamp(SCREEN_ON_ARRIVAL_MIN, LATENCY_HISTORY);
        Self {
            samples: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            recent_latencies: VecDeque::with_capacity(history_capacity),
            history_capacity,
            outlier_multiplier: outlier_multiplier.max(1.0),
            strategy,
        }
    }

    /// Multiple of the median recent round trip, floored
    fn latency_limit(&self) -> Option<i64> {
        let mut latencies: Vec<i64> = self.recent_latencies.iter().copied().collect();
        let median = median(&mut latencies)?;
        let limit = (median as f64 * self.outlier_multiplier) as i64;
        Some(limit.max(MIN_LATENCY_LIMIT_MICROS))
    }

    fn remember_latency(&mut self, latency_micros: i64) {
        if self.recent_latencies.len() >= self.history_capacity {
            self.recent_latencies.pop_front();
        }
        self.recent_latencies.push_back(latency_micros);
    }

    fn survivors(&self) -> Vec<&TimeSample> {
        let all: Vec<&TimeSample> = self.samples.iter().collect();
        let Some(limit) = self.latency_limit() else {
            return all;
        };
        let fast: Vec<&TimeSample> = all
            .iter()
            .copied()
            .filter(|s| s.latency_micros() <= limit)
            .collect();
        if fast.is_empty() {
            all
        } else {
            fast
        }
    }
}

impl TimeSync for DynamicTimeSync {
    fn add_sample(&mut self, sample: TimeSample) -> SampleOutcome {
        if sample.t2 < sample.t0 {
            log::debug!(
                "Discarding time sample: reply at {:?} precedes probe at {:?}",
                sample.t2,
                sample.t0
            );
            return SampleOutcome::ClockWentBackward;
        }

        let screen = self.recent_latencies.len() >= SCREEN_ON_ARRIVAL_MIN;
        let limit = self.latency_limit();
        self.remember_latency(sample.latency_micros());
        if let (true, Some(limit)) = (screen, limit) {
            if sample.latency_micros() > limit {
                log::debug!(
                    "Rejecting outlier time sample: round trip {}us above limit {}us",
                    sample.latency_micros(),
                    limit
                );
                return SampleOutcome::Outlier;
            }
        }

        if self.samples.len() >= self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
        log::trace!(
            "Time sample accepted: offset {}us, round trip {}us",
            sample.offset_micros(),
            sample.latency_micros()
        );
        SampleOutcome::Accepted
    }

    fn current_offset(&self) -> Option<ClockOffset> {
        if self.samples.len() < MIN_SAMPLES_FOR_SYNC {
            return None;
        }
        let survivors = self.survivors();
        let mut offsets: Vec<i64> = survivors.iter().map(|s| s.offset_micros()).collect();
        let offset_micros = median(&mut offsets)?;
        let last_updated = self.samples.back().map(|s| s.t2)?;

        Some(ClockOffset {
            offset_micros,
            last_updated,
            drift_ppm: drift_ppm(&survivors),
        })
    }

    fn reset(&mut self) {
        self.samples.clear();
        self.recent_latencies.clear();
    }

    fn sample_count(&self) -> usize {
        self.samples.len()
    }

    fn strategy(&self) -> TimeSyncStrategy {
        self.strategy
    }
}

/// Median of the values, the mean of the two middle ones for even counts
fn median(values: &mut [i64]) -> Option<i64> {
    if values.is_empty() {
        return None;
    }
    values.sort_unstable();
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        Some((values[mid - 1] + values[mid]) / 2)
    } else {
        Some(values[mid])
    }
}

/// Least squares slope of offset against local receive time, in ppm
fn drift_ppm(samples: &[&TimeSample]) -> Option<f64> {
    if samples.len() < MIN_SAMPLES_FOR_SYNC {
        return None;
    }
    let origin = samples.first()?.t2.as_micros();
    let n = samples.len() as f64;
    let xs: Vec<f64> = samples
        .iter()
        .map(|s| (s.t2.as_micros() - origin) as f64)
        .collect();
    let ys: Vec<f64> = samples.iter().map(|s| s.offset_micros() as f64).collect();
    let mean_x = xs.iter().sum::<f64>() / n;
    let mean_y = ys.iter().sum::<f64>() / n;

    let mut covariance = 0.0;
    let mut variance = 0.0;
    for (x, y) in xs.iter().zip(&ys) {
        covariance += (x - mean_x) * (y - mean_y);
        variance += (x - mean_x) * (x - mean_x);
    }
    if variance <= f64::EPSILON {
        return None;
    }
    Some(covariance / variance * 1_000_000.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TRUE_OFFSET: i64 = 50_000;

    /// Probe sent at `t0_ms` local with symmetric one-way latency
    fn symmetric_sample(t0_ms: i64, round_trip_ms: i64, offset_micros: i64) -> TimeSample {
        let t0 = Timestamp::from_millis(t0_ms);
        let t2 = t0.add_micros(round_trip_ms * 1000);
        let t1 = t0.add_micros(round_trip_ms * 500 + offset_micros);
        TimeSample::new(t0, t1, t2)
    }

    /// Slow request path and fast reply path, skewing the naive estimate
    fn asymmetric_sample(t0_ms: i64, round_trip_ms: i64, offset_micros: i64) -> TimeSample {
        let t0 = Timestamp::from_millis(t0_ms);
        let t2 = t0.add_micros(round_trip_ms * 1000);
        let t1 = t0.add_micros(round_trip_ms * 900 + offset_micros);
        TimeSample::new(t0, t1, t2)
    }

    #[test]
    fn test_sample_math() {
        let sample = symmetric_sample(1_000, 20, TRUE_OFFSET);
        assert_eq!(sample.latency_micros(), 20_000);
        assert_eq!(sample.offset_micros(), TRUE_OFFSET);
    }

    #[test]
    fn test_from_reply_uses_server_midpoint() {
        let t0 = Timestamp::from_millis(10_000);
        // Server clock 50ms ahead, 5ms each way, 2ms processing
        let c2s = 5_000 + TRUE_OFFSET;
        let server_sent = Timestamp::from_micros(t0.as_micros() + TRUE_OFFSET + 7_000);
        let t2 = t0.add_micros(12_000);

        let sample = TimeSample::from_reply(t0, c2s, server_sent, t2);
        assert_eq!(sample.offset_micros(), TRUE_OFFSET);
        assert_eq!(sample.latency_micros(), 12_000);
    }

    #[test]
    fn test_fewer_than_two_samples_is_unsynchronized() {
        let mut sync = DynamicTimeSync::new(10, 3.0);
        assert!(sync.current_offset().is_none());
        sync.add_sample(symmetric_sample(0, 10, TRUE_OFFSET));
        assert!(sync.current_offset().is_none());
        sync.add_sample(symmetric_sample(1000, 10, TRUE_OFFSET));
        assert!(sync.current_offset().is_some());
    }

    #[test]
    fn test_backward_clock_sample_discarded() {
        let mut sync = DynamicTimeSync::new(10, 3.0);
        let t0 = Timestamp::from_millis(5_000);
        let sample = TimeSample::new(t0, t0, t0.add_micros(-1_000));
        assert_eq!(sync.add_sample(sample), SampleOutcome::ClockWentBackward);
        assert_eq!(sync.sample_count(), 0);
    }

    #[test]
    fn test_outlier_scenario() {
        let mut sync = DynamicTimeSync::new(50, 3.0);
        let latencies = [10, 12, 11, 500, 9];
        let mut outcomes = Vec::new();
        for (i, &latency) in latencies.iter().enumerate() {
            let t0 = i as i64 * 1000;
            let sample = if latency >= 100 {
                asymmetric_sample(t0, latency, TRUE_OFFSET)
            } else {
                symmetric_sample(t0, latency, TRUE_OFFSET)
            };
            outcomes.push(sync.add_sample(sample));
        }

        assert_eq!(outcomes[3], SampleOutcome::Outlier);
        let offset = sync.current_offset().unwrap();
        assert!((offset.offset_micros - TRUE_OFFSET).abs() <= 1_000);
    }

    #[test]
    fn test_early_outlier_filtered_at_estimation() {
        let mut sync = DynamicTimeSync::new(50, 3.0);
        // Outlier arrives before screening on arrival kicks in
        sync.add_sample(asymmetric_sample(0, 400, TRUE_OFFSET));
        for i in 1..6 {
            sync.add_sample(symmetric_sample(i * 1000, 10, TRUE_OFFSET));
        }
        let offset = sync.current_offset().unwrap();
        assert_eq!(offset.offset_micros, TRUE_OFFSET);
    }

    #[test]
    fn test_converges_with_noise_and_outliers() {
        let mut sync = DynamicTimeSync::new(50, 3.0);
        // Deterministic jitter pattern in microseconds
        let jitter = [0, 700, -400, 1_200, -900, 300, -200, 800, -600, 100];
        for i in 0..100i64 {
            let t0 = i * 1000;
            let sample = if i % 7 == 3 {
                asymmetric_sample(t0, 400, TRUE_OFFSET)
            } else {
                let noisy = symmetric_sample(t0, 10, TRUE_OFFSET);
                TimeSample::new(
                    noisy.t0,
                    noisy.t1.add_micros(jitter[(i % 10) as usize]),
                    noisy.t2,
                )
            };
            sync.add_sample(sample);
        }
        let offset = sync.current_offset().unwrap();
        assert!(
            (offset.offset_micros - TRUE_OFFSET).abs() <= 1_000,
            "offset {} too far from {}",
            offset.offset_micros,
            TRUE_OFFSET
        );
    }

    #[test]
    fn test_sliding_window_forgets_old_offset() {
        let mut sync = DynamicTimeSync::new(5, 3.0);
        for i in 0..5 {
            sync.add_sample(symmetric_sample(i * 1000, 10, 10_000));
        }
        for i in 5..10 {
            sync.add_sample(symmetric_sample(i * 1000, 10, 90_000));
        }
        assert_eq!(sync.sample_count(), 5);
        assert_eq!(sync.current_offset().unwrap().offset_micros, 90_000);
    }

    #[test]
    fn test_follows_lasting_round_trip_change() {
        let mut sync = DynamicTimeSync::new(50, 3.0);
        for i in 0..10 {
            sync.add_sample(symmetric_sample(i * 1000, 1, 10_000));
        }
        assert_eq!(sync.current_offset().unwrap().offset_micros, 10_000);

        // The path slows to 4ms for good and the server clock steps
        let mut outcomes = Vec::new();
        for i in 10..200 {
            outcomes.push(sync.add_sample(symmetric_sample(i * 1000, 4, 30_000)));
        }
        let rejected = outcomes
            .iter()
            .filter(|o| **o == SampleOutcome::Outlier)
            .count();
        assert!(rejected <= 12, "rejected {rejected}");
        assert_eq!(outcomes.last(), Some(&SampleOutcome::Accepted));

        let offset = sync.current_offset().unwrap();
        assert_eq!(offset.offset_micros, 30_000);
        assert_eq!(offset.last_updated, Timestamp::from_millis(199_004));
    }

    #[test]
    fn test_zero_round_trips_do_not_lock_out_later_samples() {
        let mut sync = DynamicTimeSync::new(20, 3.0);
        for i in 0..10 {
            let t = Timestamp::from_millis(i * 1000);
            sync.add_sample(TimeSample::new(t, t.add_micros(TRUE_OFFSET), t));
        }
        let sample = symmetric_sample(10_000, 1, TRUE_OFFSET);
        assert_eq!(sync.add_sample(sample), SampleOutcome::Accepted);
        assert_eq!(sync.sample_count(), 11);

        // Well above the floor is still an outlier
        let slow = asymmetric_sample(11_000, 50, TRUE_OFFSET);
        assert_eq!(sync.add_sample(slow), SampleOutcome::Outlier);
    }

    #[test]
    fn test_since_start_keeps_history() {
        let mut sync = DynamicTimeSync::since_start(1000, 3.0);
        for i in 0..6 {
            sync.add_sample(symmetric_sample(i * 1000, 10, 10_000));
        }
        for i in 6..10 {
            sync.add_sample(symmetric_sample(i * 1000, 10, 90_000));
        }
        assert_eq!(sync.sample_count(), 10);
        assert_eq!(sync.strategy(), TimeSyncStrategy::DynamicSinceStart);
        // Six of ten samples still say 10ms
        assert_eq!(sync.current_offset().unwrap().offset_micros, 10_000);
    }

    #[test]
    fn test_drift_estimate() {
        let mut sync = DynamicTimeSync::new(20, 3.0);
        // Offset grows 100us per second: 100 ppm
        for i in 0..10 {
            sync.add_sample(symmetric_sample(i * 1000, 10, TRUE_OFFSET + i * 100));
        }
        let drift = sync.current_offset().unwrap().drift_ppm.unwrap();
        assert!((drift - 100.0).abs() < 1.0, "drift {drift}");
    }

    #[test]
    fn test_reset_clears_estimate() {
        let mut sync = DynamicTimeSync::new(10, 3.0);
        sync.add_sample(symmetric_sample(0, 10, TRUE_OFFSET));
        sync.add_sample(symmetric_sample(1000, 10, TRUE_OFFSET));
        sync.reset();
        assert!(sync.current_offset().is_none());
        assert_eq!(sync.sample_count(), 0);
    }

    #[test]
    fn test_fixed_strategy() {
        let config = TimeSyncConfig {
            strategy: TimeSyncStrategy::Fixed,
            fixed_offset_micros: -2_500,
            ..Default::default()
        };
        let mut sync = create_time_sync(&config);
        assert_eq!(
            sync.add_sample(symmetric_sample(0, 10, TRUE_OFFSET)),
            SampleOutcome::Ignored
        );
        assert_eq!(sync.current_offset().unwrap().offset_micros, -2_500);
        sync.reset();
        assert_eq!(sync.current_offset().unwrap().offset_micros, -2_500);
    }

    #[test]
    fn test_clock_offset_mapping() {
        let offset = ClockOffset::fixed(1_500);
        let local = Timestamp::new(10, 0);
        let server = offset.to_server(local);
        assert_eq!(server, Timestamp::new(10, 1_500));
        assert_eq!(offset.to_local(server), local);
    }
}
