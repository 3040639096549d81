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

//! Output flow: one call to [`Player::cycle`] moves due audio from the
//! jitter buffer through the decoder into the sink and applies the rate
//! controller's decision.

use std::sync::Arc;

use crate::config::ClientConfig;
use crate::decoder::AudioFormat;
use crate::jitter_buffer::AudioChunk;
use crate::rate_controller::{
    ControlAction, FillObservation, OutputDecision, PlayoutClock, RateController,
};
use crate::scheduler::{SchedulerDecision, SchedulerPolicy};
use crate::shared::SharedState;
use crate::sink::AudioSink;
use crate::statistics::{ClientStatistics, OutputStatistics, SessionStatistics};
use crate::time::Timestamp;
use crate::{Result, SnapError};

/// Outcome of one output cycle
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub chunks_played: usize,
    /// Chunks discarded as expired, implausibly far ahead, or trimmed
    pub chunks_dropped: usize,
    pub speed_factor: f64,
    pub muted: bool,
    pub fill_percent: f32,
    pub action: ControlAction,
    /// Degraded condition handled this cycle, if any
    pub condition: Option<SnapError>,
    pub schedule: SchedulerDecision,
}

/// Drives the sink from the shared jitter buffer
pub struct Player<S: AudioSink> {
    shared: Arc<SharedState>,
    sink: S,
    controller: RateController,
    playout: PlayoutClock,
    scheduler: SchedulerPolicy,
    late_tolerance_micros: i64,
    max_future_micros: i64,
    generation: u64,
    started: bool,
    last_action: Option<ControlAction>,
    sink_format: Option<AudioFormat>,
    stats: OutputStatistics,
}

impl<S: AudioSink> Player<S> {
    pub fn new(shared: Arc<SharedState>, sink: S, config: &ClientConfig) -> Self {
        let generation = shared.generation();
        Self {
            shared,
            sink,
            controller: RateController::new(&config.controller),
            playout: PlayoutClock::new(),
            scheduler: SchedulerPolicy::new(&config.scheduler),
            late_tolerance_micros: config.buffer.late_tolerance_ms as i64 * 1000,
            max_future_micros: config.buffer.max_future_ms as i64 * 1000,
            generation,
            started: false,
            last_action: None,
            sink_format: None,
            stats: OutputStatistics {
                current_speed_factor: 1.0,
                ..Default::default()
            },
        }
    }

    pub fn cycle(&mut self, local_now: Timestamp) -> Result<CycleReport> {
        self.stats.cycles += 1;

        let generation = self.shared.generation();
        if generation != self.generation {
            log::info!("Session reset (generation {generation}), waiting to resynchronize");
            self.generation = generation;
            self.started = false;
            self.last_action = None;
            self.controller.reset();
            self.playout.reset();
        }

        let settings = self.shared.settings()?;
        let clock = self.shared.clock_offset()?;

        let mut dropped = 0;
        let mut due: Vec<AudioChunk> = Vec::new();
        let (decision, observation, fill_percent) = {
            let mut buffer = self.shared.lock_buffer()?;

            let server_now = clock.map(|offset| offset.to_server(local_now));
            if let Some(server_now) = server_now {
                dropped += buffer.drop_future(server_now, self.max_future_micros);
                dropped += buffer.drop_expired(server_now, self.late_tolerance_micros);
                if !self.started && buffer.front().is_some_and(|c| c.timestamp <= server_now) {
                    log::info!("Playback started, first chunk due");
                    self.started = true;
                    self.playout.anchor(server_now, local_now);
                }
            }

            self.playout.advance(local_now);
            let observation = FillObservation {
                state: buffer.state(),
                is_empty: buffer.is_empty(),
                lead_micros: server_now.map(|now| buffer.lead_time_micros(now)),
                span_micros: buffer.buffered_duration_micros(),
                position_error_micros: server_now.and_then(|now| self.playout.error_micros(now)),
                drift_ppm: clock.and_then(|offset| offset.drift_ppm),
            };
            let decision = self.controller.update(&observation, &settings);

            // Output position restarts at synchronized now after a discontinuity
            let reanchor_at = server_now.filter(|_| self.started);
            match decision.action {
                ControlAction::Overrun { trim_to_micros } => {
                    dropped += buffer.trim_to(trim_to_micros);
                    if let Some(now) = reanchor_at {
                        self.playout.anchor(now, local_now);
                    }
                }
                ControlAction::Resumed => {
                    if let Some(now) = reanchor_at {
                        self.playout.anchor(now, local_now);
                    }
                }
                ControlAction::Underrun | ControlAction::Unsynchronized => self.playout.reset(),
                ControlAction::Adjust => {}
            }
            self.playout.set_factor(decision.speed_factor);
            if let (true, Some(server_now)) = (self.started, server_now) {
                while let Some(chunk) = buffer.pop_if_due(server_now) {
                    due.push(chunk);
                }
            }
            (decision, observation, buffer.fill_percent())
        };

        let played = self.play(&due)?;
        self.apply(&decision);

        let condition = self.condition(&decision, &observation, settings.playout_delay_micros);
        self.record(&decision, &observation, played, settings.playout_delay_micros);
        self.last_action = Some(decision.action);

        Ok(CycleReport {
            chunks_played: played,
            chunks_dropped: dropped,
            speed_factor: decision.speed_factor,
            muted: decision.muted,
            fill_percent,
            action: decision.action,
            condition,
            schedule: self.scheduler.decide(fill_percent),
        })
    }

    pub fn statistics(&self) -> &OutputStatistics {
        &self.stats
    }

    /// Combined snapshot of session, buffer and output counters
    pub fn snapshot(&self, session: &SessionStatistics) -> Result<ClientStatistics> {
        let clock = self.shared.clock_offset()?;
        let buffer = self.shared.lock_buffer()?;
        Ok(ClientStatistics {
            session: session.clone(),
            buffer: buffer.statistics().clone(),
            output: self.stats.clone(),
            clock,
            buffered_chunks: buffer.len(),
            buffered_bytes: buffer.filled_bytes(),
            fill_percent: buffer.fill_percent(),
        })
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    /// Decode outside the buffer lock and hand the PCM to the sink
    fn play(&mut self, chunks: &[AudioChunk]) -> Result<usize> {
        if chunks.is_empty() {
            return Ok(0);
        }

        let (decoded, format) = {
            let mut decoder = self.shared.lock_decoder()?;
            let mut decoded = Vec::with_capacity(chunks.len());
            for chunk in chunks {
                match decoder.decode(&chunk.payload) {
                    Ok(pcm) => decoded.push(pcm),
                    Err(e) => {
                        self.stats.decode_errors += 1;
                        log::error!("Skipping chunk seq={}: {e}", chunk.sequence);
                    }
                }
            }
            (decoded, decoder.format())
        };

        if let Some(format) = format {
            if self.sink_format != Some(format) {
                log::info!(
                    "Configuring output: {} Hz, {} channels, {} bits",
                    format.sample_rate,
                    format.channels,
                    format.bits_per_sample
                );
                self.sink.configure(format)?;
                self.sink_format = Some(format);
            }
        }

        let mut played = 0;
        for pcm in decoded {
            let written = self.sink.write(&pcm)?;
            if written < pcm.len() {
                log::warn!("Sink accepted {written} of {} bytes", pcm.len());
            }
            self.stats.bytes_played += written as u64;
            played += 1;
        }
        self.stats.chunks_played += played as u64;
        Ok(played)
    }

    fn apply(&mut self, decision: &OutputDecision) {
        self.sink.set_speed_factor(decision.speed_factor);
        self.sink.set_gain(decision.gain);
        self.sink.set_muted(decision.muted);
    }

    fn condition(
        &self,
        decision: &OutputDecision,
        observation: &FillObservation,
        target_micros: i64,
    ) -> Option<SnapError> {
        match decision.action {
            ControlAction::Unsynchronized => Some(SnapError::ClockSyncUnavailable {
                samples: self.shared.clock_samples(),
            }),
            ControlAction::Underrun if self.started => Some(SnapError::BufferUnderrun),
            ControlAction::Overrun { .. } => Some(SnapError::BufferOverrun {
                lead_ms: millis_u32(observation.span_micros),
                target_ms: millis_u32(target_micros),
            }),
            _ => None,
        }
    }

    fn record(
        &mut self,
        decision: &OutputDecision,
        observation: &FillObservation,
        played: usize,
        target_micros: i64,
    ) {
        let repeated = self.last_action == Some(decision.action);
        match decision.action {
            ControlAction::Underrun if self.started && !repeated => self.stats.underruns += 1,
            ControlAction::Overrun { .. } => self.stats.overruns += 1,
            ControlAction::Unsynchronized => self.stats.unsynchronized_cycles += 1,
            _ => {}
        }
        self.stats.current_speed_factor = decision.speed_factor;
        self.stats.current_lead_ms = observation.lead_micros.unwrap_or(0) / 1000;
        self.stats.target_lead_ms = target_micros / 1000;
        self.stats.muted = decision.muted;
        if played > 0 {
            log::trace!(
                "Played {played} chunks at factor {:.5}, lead {} ms",
                decision.speed_factor,
                self.stats.current_lead_ms
            );
        }
    }
}

fn millis_u32(micros: i64) -> u32 {
    (micros.max(0) / 1000).min(u32::MAX as i64) as u32
}
