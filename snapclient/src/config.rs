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

//! Client configuration.
//!
//! Every section has a `Default` impl and deserializes with missing fields
//! filled from it, so a config file only needs to name what it overrides.

use serde::{Deserialize, Serialize};
use web_time::Duration;

use crate::protocol::{Hello, DEFAULT_MAX_PAYLOAD_SIZE, PROTOCOL_VERSION};
use crate::{Result, SnapError};

/// Default server port for the audio stream
pub const DEFAULT_SERVER_PORT: u16 = 1704;

/// Clock offset estimation strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeSyncStrategy {
    /// Offset configured up front, never updated
    Fixed,
    /// Sliding window with outlier rejection
    Dynamic,
    /// Cumulative window since session start
    DynamicSinceStart,
}

impl std::str::FromStr for TimeSyncStrategy {
    type Err = SnapError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "fixed" => Ok(TimeSyncStrategy::Fixed),
            "dynamic" => Ok(TimeSyncStrategy::Dynamic),
            "dynamic_since_start" => Ok(TimeSyncStrategy::DynamicSinceStart),
            other => Err(SnapError::InvalidConfig(format!(
                "unknown time sync strategy '{other}'"
            ))),
        }
    }
}

/// Time synchronizer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeSyncConfig {
    pub strategy: TimeSyncStrategy,
    /// Samples kept by the sliding window
    pub window_size: usize,
    /// Samples slower than `outlier_multiplier` times the median round trip are rejected
    pub outlier_multiplier: f64,
    /// Offset reported by the fixed strategy
    pub fixed_offset_micros: i64,
    /// Hard cap on samples kept by the cumulative strategy
    pub max_samples: usize,
    /// Interval between time probes
    pub probe_interval_ms: u64,
}

impl Default for TimeSyncConfig {
    fn default() -> Self {
        Self {
            strategy: TimeSyncStrategy::Dynamic,
            window_size: 50,
            outlier_multiplier: 3.0,
            fixed_offset_micros: 0,
            max_samples: 10_000,
            probe_interval_ms: 1000,
        }
    }
}

impl TimeSyncConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }
}

/// Jitter buffer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Memory bound for queued chunk payloads
    pub capacity_bytes: usize,
    /// Optional bound on the number of queued chunks
    pub max_chunks: Option<usize>,
    /// Playout delay used until the server sends its settings
    pub buffer_size_ms: u32,
    /// Fill percentage below which the buffer counts as running low
    pub low_watermark_percent: u8,
    /// A chunk due longer ago than this is dropped instead of played
    pub late_tolerance_ms: u32,
    /// A chunk due further in the future than this is considered invalid
    pub max_future_ms: u32,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            capacity_bytes: 1024 * 1024,
            max_chunks: None,
            buffer_size_ms: 1000,
            low_watermark_percent: 25,
            late_tolerance_ms: 50,
            max_future_ms: 100_000,
        }
    }
}

/// Output rate controller configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub min_speed_factor: f64,
    pub max_speed_factor: f64,
    /// Speed change per second of fill error
    pub gain_per_second: f64,
    /// Lead time above `overrun_factor` times target is an overrun
    pub overrun_factor: f64,
    /// Decoder plus output device latency subtracted from the playout delay
    pub processing_lag_ms: i32,
    /// Multiplier applied on top of the volume
    pub volume_boost: f32,
    /// Volume until the server sends its settings
    pub initial_volume_percent: i32,
    /// Additional latency until the server sends its settings
    pub initial_latency_ms: i32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            min_speed_factor: 0.995,
            max_speed_factor: 1.005,
            gain_per_second: 0.05,
            overrun_factor: 2.0,
            processing_lag_ms: 0,
            volume_boost: 1.0,
            initial_volume_percent: 100,
            initial_latency_ms: 0,
        }
    }
}

/// Scheduler policy configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Fill percentage at or below which the output task stays active
    pub activation_at_percent: u8,
    pub active_interval_ms: u64,
    pub idle_interval_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            activation_at_percent: 75,
            active_interval_ms: 5,
            idle_interval_ms: 20,
        }
    }
}

/// Session configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Silence from the server longer than this ends the session
    pub receive_timeout_ms: u64,
    pub max_payload_size: u32,
    /// Unanswered time probes remembered for matching replies
    pub max_outstanding_probes: usize,
    /// Pause between reconnect attempts
    pub reconnect_delay_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            receive_timeout_ms: 5000,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            max_outstanding_probes: 16,
            reconnect_delay_ms: 4000,
        }
    }
}

impl SessionConfig {
    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

/// Identity announced to the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HelloConfig {
    pub mac: String,
    pub host_name: String,
    pub client_name: String,
    pub version: String,
    pub os: String,
    pub arch: String,
    pub instance: u32,
    /// Client id, defaults to the MAC address
    pub id: Option<String>,
}

impl Default for HelloConfig {
    fn default() -> Self {
        Self {
            mac: "00:00:00:00:00:00".to_string(),
            host_name: "snapclient".to_string(),
            client_name: "snapclient".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            instance: 1,
            id: None,
        }
    }
}

impl HelloConfig {
    pub fn to_hello(&self) -> Hello {
        Hello {
            mac: self.mac.clone(),
            host_name: self.host_name.clone(),
            version: self.version.clone(),
            client_name: self.client_name.clone(),
            os: self.os.clone(),
            arch: self.arch.clone(),
            instance: self.instance,
            id: self.id.clone().unwrap_or_else(|| self.mac.clone()),
            protocol_version: PROTOCOL_VERSION,
        }
    }
}

/// Complete client configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub server_host: String,
    pub server_port: u16,
    pub time_sync: TimeSyncConfig,
    pub buffer: BufferConfig,
    pub controller: ControllerConfig,
    pub scheduler: SchedulerConfig,
    pub session: SessionConfig,
    pub hello: HelloConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_host: "127.0.0.1".to_string(),
            server_port: DEFAULT_SERVER_PORT,
            time_sync: TimeSyncConfig::default(),
            buffer: BufferConfig::default(),
            controller: ControllerConfig::default(),
            scheduler: SchedulerConfig::default(),
            session: SessionConfig::default(),
            hello: HelloConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Reject values the engine cannot work with
    pub fn validate(&self) -> Result<()> {
        let ts = &self.time_sync;
        if ts.window_size < 2 {
            return Err(invalid("time_sync.window_size must be at least 2"));
        }
        if ts.max_samples < ts.window_size {
            return Err(invalid("time_sync.max_samples must be >= window_size"));
        }
        if !ts.outlier_multiplier.is_finite() || ts.outlier_multiplier < 1.0 {
            return Err(invalid("time_sync.outlier_multiplier must be >= 1.0"));
        }
        if ts.probe_interval_ms == 0 {
            return Err(invalid("time_sync.probe_interval_ms must be positive"));
        }

        let buffer = &self.buffer;
        if buffer.capacity_bytes == 0 {
            return Err(invalid("buffer.capacity_bytes must be positive"));
        }
        if buffer.max_chunks == Some(0) {
            return Err(invalid("buffer.max_chunks must be positive when set"));
        }
        if buffer.low_watermark_percent > 100 {
            return Err(invalid("buffer.low_watermark_percent must be <= 100"));
        }

        let ctl = &self.controller;
        if !(ctl.min_speed_factor > 0.0
            && ctl.min_speed_factor <= 1.0
            && ctl.max_speed_factor >= 1.0
            && ctl.max_speed_factor.is_finite())
        {
            return Err(invalid(format!(
                "controller speed bounds [{}, {}] must enclose 1.0",
                ctl.min_speed_factor, ctl.max_speed_factor
            )));
        }
        if !ctl.gain_per_second.is_finite() || ctl.gain_per_second < 0.0 {
            return Err(invalid("controller.gain_per_second must be >= 0"));
        }
        if !ctl.overrun_factor.is_finite() || ctl.overrun_factor <= 1.0 {
            return Err(invalid("controller.overrun_factor must be > 1.0"));
        }
        if !ctl.volume_boost.is_finite() || ctl.volume_boost < 0.0 {
            return Err(invalid("controller.volume_boost must be >= 0"));
        }

        let sched = &self.scheduler;
        if sched.activation_at_percent == 0 || sched.activation_at_percent > 100 {
            return Err(invalid("scheduler.activation_at_percent must be in 1..=100"));
        }
        if sched.active_interval_ms > sched.idle_interval_ms {
            return Err(invalid(
                "scheduler.active_interval_ms must not exceed idle_interval_ms",
            ));
        }

        if self.session.receive_timeout_ms == 0 {
            return Err(invalid("session.receive_timeout_ms must be positive"));
        }
        if self.session.max_payload_size == 0 {
            return Err(invalid("session.max_payload_size must be positive"));
        }
        if self.session.max_outstanding_probes == 0 {
            return Err(invalid("session.max_outstanding_probes must be positive"));
        }

        Ok(())
    }
}

fn invalid(reason: impl Into<String>) -> SnapError {
    SnapError::InvalidConfig(reason.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ClientConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.scheduler.activation_at_percent, 75);
        assert_eq!(config.time_sync.outlier_multiplier, 3.0);
    }

    #[test]
    fn test_speed_bounds_must_enclose_unity() {
        let mut config = ClientConfig::default();
        config.controller.min_speed_factor = 1.001;
        assert!(matches!(
            config.validate(),
            Err(SnapError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_activation_percent_range() {
        let mut config = ClientConfig::default();
        config.scheduler.activation_at_percent = 0;
        assert!(config.validate().is_err());
        config.scheduler.activation_at_percent = 101;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: ClientConfig = serde_json::from_str(
            r#"{"server_host":"10.0.0.2","time_sync":{"strategy":"dynamic_since_start"}}"#,
        )
        .unwrap();
        assert_eq!(config.server_host, "10.0.0.2");
        assert_eq!(config.server_port, DEFAULT_SERVER_PORT);
        assert_eq!(config.time_sync.strategy, TimeSyncStrategy::DynamicSinceStart);
        assert_eq!(config.time_sync.window_size, 50);
    }

    #[test]
    fn test_strategy_from_str() {
        assert_eq!(
            "dynamic-since-start".parse::<TimeSyncStrategy>().unwrap(),
            TimeSyncStrategy::DynamicSinceStart
        );
        assert_eq!("Fixed".parse::<TimeSyncStrategy>().unwrap(), TimeSyncStrategy::Fixed);
        assert!("ntp".parse::<TimeSyncStrategy>().is_err());
    }

    #[test]
    fn test_hello_id_defaults_to_mac() {
        let hello = HelloConfig {
            mac: "aa:bb:cc:dd:ee:ff".into(),
            ..Default::default()
        }
        .to_hello();
        assert_eq!(hello.id, "aa:bb:cc:dd:ee:ff");
        assert_eq!(hello.protocol_version, PROTOCOL_VERSION);
    }
}
