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

//! State shared between the receive flow and the output flow.
//!
//! The session is the only writer of chunks, clock offsets and settings; the
//! player is the only consumer of chunks. Every lock is held for a single
//! operation and a poisoned lock is reported as
//! [`SnapError::SharedStatePoisoned`].

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::config::ClientConfig;
use crate::decoder::AudioDecoder;
use crate::jitter_buffer::JitterBuffer;
use crate::rate_controller::PlaybackSettings;
use crate::time_sync::ClockOffset;
use crate::{Result, SnapError};

pub struct SharedState {
    buffer: Mutex<JitterBuffer>,
    clock: Mutex<Option<ClockOffset>>,
    clock_samples: AtomicUsize,
    settings: Mutex<PlaybackSettings>,
    decoder: Mutex<Box<dyn AudioDecoder + Send>>,
    generation: AtomicU64,
}

impl std::fmt::Debug for SharedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedState")
            .field("generation", &self.generation())
            .finish_non_exhaustive()
    }
}

impl SharedState {
    pub fn new(config: &ClientConfig, decoder: Box<dyn AudioDecoder + Send>) -> Self {
        Self {
            buffer: Mutex::new(JitterBuffer::new(
                &config.buffer,
                config.scheduler.activation_at_percent,
            )),
            clock: Mutex::new(None),
            clock_samples: AtomicUsize::new(0),
            settings: Mutex::new(initial_settings(config)),
            decoder: Mutex::new(decoder),
            generation: AtomicU64::new(0),
        }
    }

    pub fn lock_buffer(&self) -> Result<MutexGuard<'_, JitterBuffer>> {
        self.buffer
            .lock()
            .map_err(|_| SnapError::SharedStatePoisoned("jitter buffer"))
    }

    pub fn lock_decoder(&self) -> Result<MutexGuard<'_, Box<dyn AudioDecoder + Send>>> {
        self.decoder
            .lock()
            .map_err(|_| SnapError::SharedStatePoisoned("decoder"))
    }

    /// Most recently published clock offset
    pub fn clock_offset(&self) -> Result<Option<ClockOffset>> {
        self.clock
            .lock()
            .map(|guard| *guard)
            .map_err(|_| SnapError::SharedStatePoisoned("clock offset"))
    }

    /// Publish the estimate together with the number of samples behind it
    pub fn publish_offset(&self, offset: Option<ClockOffset>, samples: usize) -> Result<()> {
        let mut guard = self
            .clock
            .lock()
            .map_err(|_| SnapError::SharedStatePoisoned("clock offset"))?;
        *guard = offset;
        self.clock_samples.store(samples, Ordering::Release);
        Ok(())
    }

    pub fn clock_samples(&self) -> usize {
        self.clock_samples.load(Ordering::Acquire)
    }

    pub fn settings(&self) -> Result<PlaybackSettings> {
        self.settings
            .lock()
            .map(|guard| *guard)
            .map_err(|_| SnapError::SharedStatePoisoned("playback settings"))
    }

    pub fn update_settings(&self, settings: PlaybackSettings) -> Result<()> {
        let mut guard = self
            .settings
            .lock()
            .map_err(|_| SnapError::SharedStatePoisoned("playback settings"))?;
        *guard = settings;
        Ok(())
    }

    /// Bumped on every disconnect
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn bump_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }
}

/// Settings in effect before the server sends its own
pub fn initial_settings(config: &ClientConfig) -> PlaybackSettings {
    PlaybackSettings::new(
        config.buffer.buffer_size_ms as i32,
        config.controller.initial_latency_ms,
        config.controller.initial_volume_percent,
        config.controller.processing_lag_ms,
    )
}
