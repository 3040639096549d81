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

use crate::decoder::AudioFormat;
use crate::Result;

/// Output device driven by the player.
///
/// The speed factor is a resampling ratio around 1.0 that the device (or a
/// resampler in front of it) applies to subsequent writes.
pub trait AudioSink: Send {
    /// Called before the first write and whenever the stream format changes
    fn configure(&mut self, format: AudioFormat) -> Result<()>;

    /// Queue interleaved PCM, returns the number of bytes accepted
    fn write(&mut self, pcm: &[u8]) -> Result<usize>;

    fn set_speed_factor(&mut self, factor: f64);

    /// Linear gain, 0.0 is silence
    fn set_gain(&mut self, gain: f32);

    fn set_muted(&mut self, muted: bool);
}

/// Sink that records what it was told, for tests and dry runs
#[derive(Debug, Default, Clone)]
pub struct RecordingSink {
    pub format: Option<AudioFormat>,
    pub written: Vec<u8>,
    pub writes: usize,
    pub speed_factor: f64,
    pub gain: f32,
    pub muted: bool,
}

impl AudioSink for RecordingSink {
    fn configure(&mut self, format: AudioFormat) -> Result<()> {
        self.format = Some(format);
        Ok(())
    }

    fn write(&mut self, pcm: &[u8]) -> Result<usize> {
        self.written.extend_from_slice(pcm);
        self.writes += 1;
        Ok(pcm.len())
    }

    fn set_speed_factor(&mut self, factor: f64) {
        self.speed_factor = factor;
    }

    fn set_gain(&mut self, gain: f32) {
        self.gain = gain;
    }

    fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
    }
}
