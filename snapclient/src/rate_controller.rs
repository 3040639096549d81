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

//! Playback speed and gain decisions.
//!
//! The sink consumes audio on the local clock while the stream is timed by
//! the server clock. The speed factor is the server clock rate over the local
//! one, taken from the drift of the clock estimate, plus a proportional term
//! on how far the output has fallen behind (or run ahead of) elapsed server
//! time. Both stay in a narrow band around 1.0.

use serde::{Deserialize, Serialize};

use crate::config::ControllerConfig;
use crate::jitter_buffer::BufferState;
use crate::protocol::ServerSettings;
use crate::time::Timestamp;

/// Error smoothing.
///
/// Exponential filter over the playout position error so a single step of
/// the clock estimate does not swing the speed factor. Large jumps switch to
/// a fast coefficient until the filter catches up.
#[derive(Debug)]
pub struct LevelFilter {
    filtered_micros: f64,
    level_factor: f64,
    primed: bool,
}

impl Default for LevelFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl LevelFilter {
    pub fn new() -> Self {
        Self {
            filtered_micros: 0.0,
            level_factor: 253.0 / 256.0,
            primed: false,
        }
    }

    pub fn update(&mut self, level_micros: i64) {
        let level = level_micros as f64;
        if !self.primed {
            self.filtered_micros = level;
            self.primed = true;
            return;
        }

        let jump = (level - self.filtered_micros).abs();
        let jump_threshold = (self.filtered_micros.abs() * 0.5).max(100_000.0);
        let factor = if jump > jump_threshold {
            0.7
        } else {
            self.level_factor
        };
        self.filtered_micros = factor * self.filtered_micros + (1.0 - factor) * level;
    }

    /// Pick the smoothing coefficient from the playout delay: short delays
    /// react faster
    pub fn set_target_level(&mut self, target_micros: i64) {
        let target_ms = target_micros / 1000;
        self.level_factor = if target_ms <= 20 {
            251.0 / 256.0
        } else if target_ms <= 60 {
            252.0 / 256.0
        } else if target_ms <= 140 {
            253.0 / 256.0
        } else {
            254.0 / 256.0
        };
    }

    pub fn set_filtered_level(&mut self, level_micros: i64) {
        self.filtered_micros = level_micros as f64;
        self.primed = true;
    }

    pub fn filtered_micros(&self) -> i64 {
        self.filtered_micros as i64
    }

    pub fn reset(&mut self) {
        self.filtered_micros = 0.0;
        self.primed = false;
    }
}

/// Stream time played by the sink since playback was anchored.
///
/// The sink plays `speed_factor` seconds of stream per local second, so the
/// integral of the applied factor over local time is the output position.
/// Elapsed server time minus that position is an error the factor moves.
#[derive(Debug, Default)]
pub struct PlayoutClock {
    anchor: Option<PlayoutAnchor>,
}

#[derive(Debug, Clone, Copy)]
struct PlayoutAnchor {
    server: Timestamp,
    local: Timestamp,
    played_micros: f64,
    factor: f64,
}

impl PlayoutClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Output position equals `server_now`, playing at unity
    pub fn anchor(&mut self, server_now: Timestamp, local_now: Timestamp) {
        self.anchor = Some(PlayoutAnchor {
            server: server_now,
            local: local_now,
            played_micros: 0.0,
            factor: 1.0,
        });
    }

    pub fn is_anchored(&self) -> bool {
        self.anchor.is_some()
    }

    /// Account for the stream played at the current factor up to `local_now`
    pub fn advance(&mut self, local_now: Timestamp) {
        if let Some(anchor) = &mut self.anchor {
            let elapsed = local_now.micros_since(anchor.local).max(0);
            anchor.played_micros += elapsed as f64 * anchor.factor;
            anchor.local = local_now;
        }
    }

    /// Factor the sink plays at from now on
    pub fn set_factor(&mut self, factor: f64) {
        if let Some(anchor) = &mut self.anchor {
            anchor.factor = factor;
        }
    }

    /// Elapsed server time minus played stream time. Positive when the
    /// output lags the stream.
    pub fn error_micros(&self, server_now: Timestamp) -> Option<i64> {
        let anchor = self.anchor.as_ref()?;
        let elapsed = server_now.micros_since(anchor.server) as f64;
        Some((elapsed - anchor.played_micros).round() as i64)
    }

    pub fn reset(&mut self) {
        self.anchor = None;
    }
}

/// Playback targets shared between the session and the output flow
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlaybackSettings {
    /// Linear volume in 0.0..=1.0
    pub volume: f32,
    pub muted: bool,
    /// Added to a chunk's server capture time to get its play time
    pub playout_delay_micros: i64,
}

impl PlaybackSettings {
    pub fn new(buffer_ms: i32, latency_ms: i32, volume_percent: i32, processing_lag_ms: i32) -> Self {
        Self {
            volume: volume_percent.clamp(0, 100) as f32 / 100.0,
            muted: false,
            playout_delay_micros: playout_delay_micros(buffer_ms, latency_ms, processing_lag_ms),
        }
    }

    pub fn from_server(settings: &ServerSettings, processing_lag_ms: i32) -> Self {
        Self {
            muted: settings.muted,
            ..Self::new(
                settings.buffer_ms,
                settings.latency_ms,
                settings.volume_percent,
                processing_lag_ms,
            )
        }
    }
}

/// Server buffer plus client latency, minus what decoding and output add
pub fn playout_delay_micros(buffer_ms: i32, latency_ms: i32, processing_lag_ms: i32) -> i64 {
    let ms = buffer_ms as i64 + latency_ms as i64 - processing_lag_ms as i64;
    ms.max(0) * 1000
}

/// What the output flow measured this cycle
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FillObservation {
    pub state: BufferState,
    /// No chunk pending at all
    pub is_empty: bool,
    /// Lead time past synchronized now, `None` without a clock offset
    pub lead_micros: Option<i64>,
    /// Span from the oldest pending chunk to the end of the newest
    pub span_micros: i64,
    /// Output lag behind elapsed server time, `None` before playback started
    pub position_error_micros: Option<i64>,
    /// Server clock rate relative to the local clock
    pub drift_ppm: Option<f64>,
}

/// Control outcome of one cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    /// Normal rate control
    Adjust,
    /// Nothing buffered: muted until data returns
    Underrun,
    /// First cycle with data after an underrun, unadjusted
    Resumed,
    /// Too much buffered: the caller drops oldest chunks down to the target
    Overrun { trim_to_micros: i64 },
    /// No clock offset yet, unadjusted
    Unsynchronized,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OutputDecision {
    pub speed_factor: f64,
    pub gain: f32,
    pub muted: bool,
    pub action: ControlAction,
    /// Filtered position error, zero when not adjusting
    pub error_micros: i64,
}

/// Drift feed forward plus proportional playback rate controller
#[derive(Debug)]
pub struct RateController {
    min_factor: f64,
    max_factor: f64,
    gain_per_second: f64,
    overrun_factor: f64,
    volume_boost: f32,
    filter: LevelFilter,
    in_underrun: bool,
    target_micros: i64,
}

impl RateController {
    pub fn new(config: &ControllerConfig) -> Self {
        Self {
            min_factor: config.min_speed_factor,
            max_factor: config.max_speed_factor,
            gain_per_second: config.gain_per_second,
            overrun_factor: config.overrun_factor,
            volume_boost: config.volume_boost,
            filter: LevelFilter::new(),
            in_underrun: false,
            target_micros: 0,
        }
    }

    pub fn update(
        &mut self,
        observation: &FillObservation,
        settings: &PlaybackSettings,
    ) -> OutputDecision {
        let target = settings.playout_delay_micros;
        if target != self.target_micros {
            self.target_micros = target;
            self.filter.set_target_level(target);
        }

        if observation.lead_micros.is_none() {
            let muted = settings.muted || observation.is_empty;
            return self.decision(1.0, muted, settings, ControlAction::Unsynchronized, 0);
        }

        if observation.is_empty {
            if !self.in_underrun {
                log::warn!("Buffer underrun: muting output");
            }
            self.in_underrun = true;
            self.filter.reset();
            return self.decision(1.0, true, settings, ControlAction::Underrun, 0);
        }

        if self.in_underrun {
            log::info!("Buffer refilled after underrun, resuming playback");
            self.in_underrun = false;
            self.filter.set_filtered_level(0);
            return self.decision(1.0, settings.muted, settings, ControlAction::Resumed, 0);
        }

        if target > 0 && observation.span_micros as f64 > target as f64 * self.overrun_factor {
            log::warn!(
                "Buffer overrun: {} ms buffered, target {} ms",
                observation.span_micros / 1000,
                target / 1000
            );
            self.filter.set_filtered_level(0);
            return self.decision(
                1.0,
                settings.muted,
                settings,
                ControlAction::Overrun {
                    trim_to_micros: target,
                },
                0,
            );
        }

        let error = match observation.position_error_micros {
            Some(position_error) => {
                self.filter.update(position_error);
                self.filter.filtered_micros()
            }
            None => 0,
        };
        let factor = self.speed_factor(error, observation.drift_ppm);
        log::trace!(
            "Position error {error}us, drift {:?} ppm, speed factor {factor:.6}",
            observation.drift_ppm
        );
        self.decision(factor, settings.muted, settings, ControlAction::Adjust, error)
    }

    /// Clock rate ratio plus a bounded proportional response to the
    /// position error
    pub fn speed_factor(&self, error_micros: i64, drift_ppm: Option<f64>) -> f64 {
        let drift = drift_ppm.filter(|d| d.is_finite()).unwrap_or(0.0) / 1_000_000.0;
        let raw = 1.0 + drift + self.gain_per_second * error_micros as f64 / 1_000_000.0;
        if raw.is_nan() {
            return 1.0;
        }
        raw.clamp(self.min_factor, self.max_factor)
    }

    pub fn reset(&mut self) {
        self.filter.reset();
        self.in_underrun = false;
        self.target_micros = 0;
    }

    pub fn bounds(&self) -> (f64, f64) {
        (self.min_factor, self.max_factor)
    }

    fn decision(
        &self,
        speed_factor: f64,
        muted: bool,
        settings: &PlaybackSettings,
        action: ControlAction,
        error_micros: i64,
    ) -> OutputDecision {
        let gain = if muted {
            0.0
        } else {
            settings.volume * self.volume_boost
        };
        OutputDecision {
            speed_factor,
            gain,
            muted,
            action,
            error_micros,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(delay_ms: i32) -> PlaybackSettings {
        PlaybackSettings::new(delay_ms, 0, 100, 0)
    }

    fn observation(position_error_micros: i64, filled_bytes: usize) -> FillObservation {
        FillObservation {
            state: BufferState {
                capacity_bytes: 100_000,
                filled_bytes,
                low_watermark: 25_000,
                high_watermark: 75_000,
            },
            is_empty: filled_bytes == 0,
            lead_micros: Some(1_000_000),
            span_micros: 1_000_000,
            position_error_micros: Some(position_error_micros),
            drift_ppm: None,
        }
    }

    /// Run the loop against a server clock that runs `drift_ppm` fast,
    /// in 10 ms local steps, and return the last factor
    fn run_against_drift(drift_ppm: f64, estimate: Option<f64>, seconds: i64) -> f64 {
        let mut controller = RateController::new(&ControllerConfig::default());
        let target = settings(1000);
        let mut playout = PlayoutClock::new();
        let server_at = |local_micros: i64| {
            Timestamp::from_micros(local_micros + (local_micros as f64 * drift_ppm / 1e6) as i64)
        };
        playout.anchor(server_at(0), Timestamp::ZERO);

        let mut factor = 1.0;
        for step in 1..=seconds * 100 {
            let local_micros = step * 10_000;
            let local = Timestamp::from_micros(local_micros);
            playout.advance(local);
            let mut obs = observation(0, 5000);
            obs.position_error_micros = playout.error_micros(server_at(local_micros));
            obs.drift_ppm = estimate;
            factor = controller.update(&obs, &target).speed_factor;
            playout.set_factor(factor);
        }
        factor
    }

    #[test]
    fn test_playout_delay() {
        assert_eq!(playout_delay_micros(1000, 20, 0), 1_020_000);
        assert_eq!(playout_delay_micros(1000, 0, 150), 850_000);
        assert_eq!(playout_delay_micros(100, 0, 500), 0);
    }

    #[test]
    fn test_settings_from_server() {
        let server = ServerSettings {
            buffer_ms: 1000,
            latency_ms: 0,
            volume_percent: 57,
            muted: true,
        };
        let settings = PlaybackSettings::from_server(&server, 0);
        assert!((settings.volume - 0.57).abs() < 1e-6);
        assert!(settings.muted);
        assert_eq!(settings.playout_delay_micros, 1_000_000);
        assert_eq!(PlaybackSettings::new(0, 0, 250, 0).volume, 1.0);
    }

    #[test]
    fn test_no_error_no_drift_runs_at_unity() {
        let mut controller = RateController::new(&ControllerConfig::default());
        let decision = controller.update(&observation(0, 5000), &settings(1000));
        assert_eq!(decision.action, ControlAction::Adjust);
        assert_eq!(decision.speed_factor, 1.0);
        assert!(!decision.muted);
        assert_eq!(decision.gain, 1.0);
    }

    #[test]
    fn test_direction_of_correction() {
        let config = ControllerConfig::default();
        let mut controller = RateController::new(&config);
        let behind = controller.update(&observation(20_000, 5000), &settings(1000));
        assert!(behind.speed_factor > 1.0);

        let mut controller = RateController::new(&config);
        let ahead = controller.update(&observation(-20_000, 5000), &settings(1000));
        assert!(ahead.speed_factor < 1.0);
    }

    #[test]
    fn test_drift_feeds_forward() {
        let controller = RateController::new(&ControllerConfig::default());
        assert!((controller.speed_factor(0, Some(250.0)) - 1.00025).abs() < 1e-12);
        assert!((controller.speed_factor(0, Some(-80.0)) - 0.99992).abs() < 1e-12);
        assert_eq!(controller.speed_factor(0, Some(f64::NAN)), 1.0);
        assert_eq!(controller.speed_factor(0, None), 1.0);
    }

    #[test]
    fn test_perfect_clocks_settle_at_unity() {
        assert_eq!(run_against_drift(0.0, Some(0.0), 60), 1.0);
        assert_eq!(run_against_drift(0.0, None, 60), 1.0);
    }

    #[test]
    fn test_tracks_fixed_drift() {
        // Feed forward from the clock estimate
        let factor = run_against_drift(200.0, Some(200.0), 60);
        assert!((factor - 1.0002).abs() < 2e-6, "factor {factor}");

        // Without an estimate the proportional term finds the rate on its own
        let factor = run_against_drift(-300.0, None, 600);
        assert!((factor - 0.9997).abs() < 5e-6, "factor {factor}");
    }

    #[test]
    fn test_factor_always_within_bounds() {
        let config = ControllerConfig::default();
        let mut controller = RateController::new(&config);
        let target = settings(1000);
        for error_ms in [-100_000, -5_000, -200, -1, 0, 1, 200, 5_000, 100_000] {
            for filled in [0usize, 1, 50_000] {
                let decision = controller.update(&observation(error_ms * 1000, filled), &target);
                assert!(decision.speed_factor >= config.min_speed_factor);
                assert!(decision.speed_factor <= config.max_speed_factor);
            }
        }
        assert_eq!(controller.speed_factor(i64::MAX, None), config.max_speed_factor);
        assert_eq!(controller.speed_factor(i64::MIN, None), config.min_speed_factor);
        assert_eq!(
            controller.speed_factor(0, Some(1e9)),
            config.max_speed_factor
        );
    }

    #[test]
    fn test_mute_iff_empty() {
        let mut controller = RateController::new(&ControllerConfig::default());
        let target = settings(1000);
        let sequence = [5000usize, 0, 0, 10, 5000, 0, 7];
        for filled in sequence {
            let decision = controller.update(&observation(0, filled), &target);
            assert_eq!(decision.muted, filled == 0, "filled {filled}");
            if filled == 0 {
                assert_eq!(decision.gain, 0.0);
                assert_eq!(decision.action, ControlAction::Underrun);
            }
        }
    }

    #[test]
    fn test_resume_after_underrun_at_unity() {
        let mut controller = RateController::new(&ControllerConfig::default());
        let target = settings(1000);
        controller.update(&observation(0, 0), &target);
        let resumed = controller.update(&observation(40_000, 2000), &target);
        assert_eq!(resumed.action, ControlAction::Resumed);
        assert_eq!(resumed.speed_factor, 1.0);
        assert!(!resumed.muted);
    }

    #[test]
    fn test_overrun_requests_trim() {
        let mut controller = RateController::new(&ControllerConfig::default());
        let mut obs = observation(0, 90_000);
        obs.span_micros = 2_500_000;
        let decision = controller.update(&obs, &settings(1000));
        assert_eq!(
            decision.action,
            ControlAction::Overrun {
                trim_to_micros: 1_000_000
            }
        );
        assert_eq!(decision.speed_factor, 1.0);
    }

    #[test]
    fn test_unsynchronized_is_unadjusted() {
        let mut controller = RateController::new(&ControllerConfig::default());
        let mut obs = observation(15_000, 5000);
        obs.lead_micros = None;
        let decision = controller.update(&obs, &settings(1000));
        assert_eq!(decision.action, ControlAction::Unsynchronized);
        assert_eq!(decision.speed_factor, 1.0);
        assert!(!decision.muted);
    }

    #[test]
    fn test_unsynchronized_wins_over_empty_buffer() {
        let mut controller = RateController::new(&ControllerConfig::default());
        let mut obs = observation(0, 0);
        obs.lead_micros = None;
        obs.position_error_micros = None;
        let decision = controller.update(&obs, &settings(1000));
        assert_eq!(decision.action, ControlAction::Unsynchronized);
        assert!(decision.muted);
        assert_eq!(decision.gain, 0.0);
    }

    #[test]
    fn test_volume_and_mute_are_independent_of_speed() {
        let config = ControllerConfig {
            volume_boost: 1.5,
            ..Default::default()
        };
        let mut controller = RateController::new(&config);
        let mut target = PlaybackSettings::new(1000, 0, 50, 0);
        let decision = controller.update(&observation(30_000, 5000), &target);
        assert!((decision.gain - 0.75).abs() < 1e-6);
        assert!(decision.speed_factor > 1.0);

        target.muted = true;
        let decision = controller.update(&observation(30_000, 5000), &target);
        assert!(decision.muted);
        assert_eq!(decision.gain, 0.0);
        assert!(decision.speed_factor > 1.0);
    }

    #[test]
    fn test_playout_clock_integrates_factor() {
        let mut playout = PlayoutClock::new();
        assert_eq!(playout.error_micros(Timestamp::from_millis(5)), None);

        playout.anchor(Timestamp::from_millis(50_000), Timestamp::from_millis(1_000));
        playout.advance(Timestamp::from_millis(2_000));
        assert_eq!(playout.error_micros(Timestamp::from_millis(51_000)), Some(0));

        // One second at 0.999 falls a millisecond behind
        playout.set_factor(0.999);
        playout.advance(Timestamp::from_millis(3_000));
        assert_eq!(playout.error_micros(Timestamp::from_millis(52_000)), Some(1_000));

        playout.reset();
        assert!(!playout.is_anchored());
    }

    #[test]
    fn test_level_filter_smooths_and_tracks_jumps() {
        let mut filter = LevelFilter::new();
        filter.update(1_000_000);
        assert_eq!(filter.filtered_micros(), 1_000_000);

        // Small deviation moves the estimate only slightly
        filter.update(1_020_000);
        let smoothed = filter.filtered_micros();
        assert!(smoothed > 1_000_000 && smoothed < 1_010_000);

        // Large jump engages the fast coefficient
        filter.update(3_000_000);
        assert!(filter.filtered_micros() > 1_500_000);

        // Signed errors pass through
        filter.reset();
        filter.update(-42);
        assert_eq!(filter.filtered_micros(), -42);
    }
}
