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

use web_time::Duration;

use crate::config::SchedulerConfig;

/// When the output task should run next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerDecision {
    /// The consumer should keep polling at the short interval
    pub active: bool,
    pub sleep: Duration,
}

/// Occupancy based run/sleep policy for the output task.
///
/// A buffer at or below the activation threshold needs attention soon, so
/// the task polls often. Above it there is plenty queued and the task can
/// back off.
#[derive(Debug, Clone)]
pub struct SchedulerPolicy {
    activation_at_percent: f32,
    active_interval: Duration,
    idle_interval: Duration,
}

impl SchedulerPolicy {
    pub fn new(config: &SchedulerConfig) -> Self {
        Self {
            activation_at_percent: config.activation_at_percent as f32,
            active_interval: Duration::from_millis(config.active_interval_ms),
            idle_interval: Duration::from_millis(config.idle_interval_ms),
        }
    }

    pub fn decide(&self, fill_percent: f32) -> SchedulerDecision {
        if fill_percent <= self.activation_at_percent {
            SchedulerDecision {
                active: true,
                sleep: self.active_interval,
            }
        } else {
            SchedulerDecision {
                active: false,
                sleep: self.idle_interval,
            }
        }
    }
}

impl Default for SchedulerPolicy {
    fn default() -> Self {
        Self::new(&SchedulerConfig::default())
    }
}
