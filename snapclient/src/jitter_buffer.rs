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

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::config::BufferConfig;
use crate::decoder::AudioFormat;
use crate::statistics::BufferStatistics;
use crate::time::Timestamp;

/// Audio chunk waiting for playback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    /// Server time at which the chunk starts playing
    pub timestamp: Timestamp,
    /// Encoded audio as received
    pub payload: Vec<u8>,
    /// Monotonic per session
    pub sequence: u64,
}

impl AudioChunk {
    pub fn new(timestamp: Timestamp, payload: Vec<u8>, sequence: u64) -> Self {
        Self {
            timestamp,
            payload,
            sequence,
        }
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Result of pushing a chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Enqueued,
    DuplicateDropped,
    StaleDropped,
}

/// Fill level view derived from the buffer contents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferState {
    pub capacity_bytes: usize,
    pub filled_bytes: usize,
    pub low_watermark: usize,
    pub high_watermark: usize,
}

impl BufferState {
    pub fn is_empty(&self) -> bool {
        self.filled_bytes == 0
    }

    pub fn fill_percent(&self) -> f32 {
        if self.capacity_bytes == 0 {
            return 0.0;
        }
        (self.filled_bytes as f32 * 100.0 / self.capacity_bytes as f32).min(100.0)
    }

    pub fn is_low(&self) -> bool {
        self.filled_bytes < self.low_watermark
    }

    pub fn is_high(&self) -> bool {
        self.filled_bytes > self.high_watermark
    }
}

/// Timestamp ordered chunk queue.
///
/// Arrivals newer than the current front are inserted in order; anything
/// older than what is already pending (or already handed out) is stale.
/// When the capacity is exceeded the oldest chunks go first.
#[derive(Debug)]
pub struct JitterBuffer {
    chunks: VecDeque<AudioChunk>,
    capacity_bytes: usize,
    max_chunks: Option<usize>,
    low_watermark_percent: u8,
    high_watermark_percent: u8,
    filled_bytes: usize,
    /// Timestamp of the last chunk that left the buffer
    last_released: Option<Timestamp>,
    /// Running estimate of the spacing between consecutive chunks
    nominal_chunk_micros: i64,
    /// Set for uncompressed streams, where a payload's length gives its duration
    pcm_format: Option<AudioFormat>,
    stats: BufferStatistics,
}

impl JitterBuffer {
    pub fn new(config: &BufferConfig, high_watermark_percent: u8) -> Self {
        Self {
            chunks: VecDeque::new(),
            capacity_bytes: config.capacity_bytes,
            max_chunks: config.max_chunks,
            low_watermark_percent: config.low_watermark_percent,
            high_watermark_percent,
            filled_bytes: 0,
            last_released: None,
            nominal_chunk_micros: 0,
            pcm_format: None,
            stats: BufferStatistics::default(),
        }
    }

    /// Buffer bounded only by chunk count
    pub fn with_max_chunks(max_chunks: usize) -> Self {
        let config = BufferConfig {
            capacity_bytes: usize::MAX,
            max_chunks: Some(max_chunks),
            ..Default::default()
        };
        Self::new(&config, 75)
    }

    pub fn push(&mut self, chunk: AudioChunk) -> PushOutcome {
        if self.is_stale(&chunk) {
            log::debug!(
                "Dropping stale chunk seq={} ts={:?}",
                chunk.sequence,
                chunk.timestamp
            );
            self.stats.stale_dropped += 1;
            return PushOutcome::StaleDropped;
        }

        let insert_pos = self.find_insert_position(&chunk);
        if self.is_duplicate(&chunk, insert_pos) {
            log::debug!(
                "Dropping duplicate chunk seq={} ts={:?}",
                chunk.sequence,
                chunk.timestamp
            );
            self.stats.duplicates_dropped += 1;
            return PushOutcome::DuplicateDropped;
        }

        if self.nominal_chunk_micros == 0 {
            if let Some(format) = self.pcm_format {
                self.nominal_chunk_micros = format.duration_micros(chunk.len());
            }
        }

        let reorder_distance = self.chunks.len() - insert_pos;
        if reorder_distance > 0 {
            log::trace!(
                "Reordered chunk seq={} inserted {reorder_distance} positions from the tail",
                chunk.sequence
            );
        } else if let Some(previous) = self.chunks.back() {
            self.update_nominal_duration(chunk.timestamp.micros_since(previous.timestamp));
        }

        self.stats.chunk_enqueued(chunk.len(), reorder_distance);
        self.filled_bytes += chunk.len();
        self.chunks.insert(insert_pos, chunk);
        self.evict_overflow();

        PushOutcome::Enqueued
    }

    pub fn front(&self) -> Option<&AudioChunk> {
        self.chunks.front()
    }

    /// Take the front chunk once its play time has been reached
    pub fn pop_if_due(&mut self, server_now: Timestamp) -> Option<AudioChunk> {
        match self.chunks.front() {
            Some(front) if front.timestamp <= server_now => self.pop_front(),
            _ => None,
        }
    }

    pub fn pop_front(&mut self) -> Option<AudioChunk> {
        let chunk = self.chunks.pop_front()?;
        self.filled_bytes -= chunk.len();
        self.last_released = Some(chunk.timestamp);
        Some(chunk)
    }

    /// Drop chunks whose play time passed more than `tolerance_micros` ago
    pub fn drop_expired(&mut self, server_now: Timestamp, tolerance_micros: i64) -> usize {
        let mut dropped = 0;
        while let Some(front) = self.chunks.front() {
            if server_now.micros_since(front.timestamp) <= tolerance_micros {
                break;
            }
            self.pop_front();
            dropped += 1;
        }
        if dropped > 0 {
            self.stats.late_dropped += dropped as u64;
            log::debug!("Dropped {dropped} expired chunks");
        }
        dropped
    }

    /// Drop chunks due more than `max_future_micros` after `server_now`.
    /// Such timestamps belong to a different clock epoch and would stall
    /// playback indefinitely.
    pub fn drop_future(&mut self, server_now: Timestamp, max_future_micros: i64) -> usize {
        let before = self.chunks.len();
        self.chunks
            .retain(|chunk| chunk.timestamp.micros_since(server_now) <= max_future_micros);
        let dropped = before - self.chunks.len();
        if dropped > 0 {
            self.filled_bytes = self.chunks.iter().map(AudioChunk::len).sum();
            self.stats.future_dropped += dropped as u64;
            log::warn!("Dropped {dropped} chunks stamped more than {max_future_micros}us ahead");
        }
        dropped
    }

    /// Drop the oldest chunks until the buffered span fits `target_micros`
    pub fn trim_to(&mut self, target_micros: i64) -> usize {
        let mut dropped = 0;
        while self.chunks.len() > 1 && self.buffered_duration_micros() > target_micros {
            self.pop_front();
            dropped += 1;
        }
        if dropped > 0 {
            self.stats.overrun_dropped += dropped as u64;
            log::debug!("Overrun trim: removed {dropped} chunks, kept {}", self.chunks.len());
        }
        dropped
    }

    /// Discard everything, including the stale reference point
    pub fn clear(&mut self) {
        let flushed = self.chunks.len();
        self.chunks.clear();
        self.filled_bytes = 0;
        self.last_released = None;
        self.nominal_chunk_micros = 0;
        self.pcm_format = None;
        if flushed > 0 {
            log::debug!("Flushed {flushed} chunks from buffer");
        }
    }

    pub fn state(&self) -> BufferState {
        BufferState {
            capacity_bytes: self.capacity_bytes,
            filled_bytes: self.filled_bytes,
            low_watermark: percent_of(self.capacity_bytes, self.low_watermark_percent),
            high_watermark: percent_of(self.capacity_bytes, self.high_watermark_percent),
        }
    }

    /// Occupancy against whichever limit is closer to being hit
    pub fn fill_percent(&self) -> f32 {
        let by_bytes = self.state().fill_percent();
        match self.max_chunks {
            Some(max) => by_bytes.max((self.chunks.len() as f32 / max as f32 * 100.0).min(100.0)),
            None => by_bytes,
        }
    }

    /// Span from the front chunk start to the end of the newest chunk
    pub fn buffered_duration_micros(&self) -> i64 {
        match (self.chunks.front(), self.chunks.back()) {
            (Some(front), Some(back)) => {
                back.timestamp.micros_since(front.timestamp) + self.nominal_chunk_micros
            }
            _ => 0,
        }
    }

    /// How far buffered audio extends past `server_now`
    pub fn lead_time_micros(&self, server_now: Timestamp) -> i64 {
        match self.chunks.back() {
            Some(back) => (back.timestamp.micros_since(server_now) + self.nominal_chunk_micros).max(0),
            None => 0,
        }
    }

    pub fn nominal_chunk_micros(&self) -> i64 {
        self.nominal_chunk_micros
    }

    /// Seed chunk durations from payload length until spacing is observed.
    /// Only meaningful when payloads are PCM; cleared by [`JitterBuffer::clear`].
    pub fn set_pcm_format(&mut self, format: Option<AudioFormat>) {
        self.pcm_format = format;
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn filled_bytes(&self) -> usize {
        self.filled_bytes
    }

    pub fn statistics(&self) -> &BufferStatistics {
        &self.stats
    }

    fn is_stale(&self, chunk: &AudioChunk) -> bool {
        match (self.chunks.front(), self.last_released) {
            (Some(front), _) => chunk.timestamp < front.timestamp,
            (None, Some(released)) => chunk.timestamp <= released,
            (None, None) => false,
        }
    }

    fn find_insert_position(&self, chunk: &AudioChunk) -> usize {
        self.chunks
            .partition_point(|existing| existing.timestamp <= chunk.timestamp)
    }

    fn is_duplicate(&self, chunk: &AudioChunk, insert_pos: usize) -> bool {
        // Equal timestamps sort directly before the insert position
        let same_timestamp = insert_pos
            .checked_sub(1)
            .and_then(|pos| self.chunks.get(pos))
            .is_some_and(|existing| existing.timestamp == chunk.timestamp);
        same_timestamp
            || self
                .chunks
                .iter()
                .any(|existing| existing.sequence == chunk.sequence)
    }

    fn update_nominal_duration(&mut self, delta_micros: i64) {
        if delta_micros <= 0 {
            return;
        }
        self.nominal_chunk_micros = if self.nominal_chunk_micros == 0 {
            delta_micros
        } else {
            (self.nominal_chunk_micros * 7 + delta_micros) / 8
        };
    }

    fn over_capacity(&self) -> bool {
        self.filled_bytes > self.capacity_bytes
            || self.max_chunks.is_some_and(|max| self.chunks.len() > max)
    }

    fn evict_overflow(&mut self) {
        let mut evicted = 0;
        while self.chunks.len() > 1 && self.over_capacity() {
            self.pop_front();
            evicted += 1;
        }
        if evicted > 0 {
            self.stats.overflow_evictions += evicted;
            log::warn!(
                "Buffer overflow: evicted {evicted} oldest chunks ({} bytes buffered)",
                self.filled_bytes
            );
        }
    }
}

fn percent_of(value: usize, percent: u8) -> usize {
    (value as u128 * percent as u128 / 100) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_chunk(seq: u64, ts_ms: i64, bytes: usize) -> AudioChunk {
        AudioChunk::new(Timestamp::from_millis(ts_ms), vec![0; bytes], seq)
    }

    fn timestamps_ms(buffer: &mut JitterBuffer) -> Vec<i64> {
        let mut out = Vec::new();
        while let Some(chunk) = buffer.pop_front() {
            out.push(chunk.timestamp.as_millis());
        }
        out
    }

    #[test]
    fn test_buffer_creation() {
        let buffer = JitterBuffer::new(&BufferConfig::default(), 75);
        assert!(buffer.is_empty());
        assert_eq!(buffer.len(), 0);
        assert_eq!(buffer.fill_percent(), 0.0);
        assert!(buffer.state().is_empty());
    }

    #[test]
    fn test_out_of_order_insertion() {
        let mut buffer = JitterBuffer::with_max_chunks(10);
        assert_eq!(buffer.push(create_test_chunk(1, 1000, 10)), PushOutcome::Enqueued);
        assert_eq!(buffer.push(create_test_chunk(3, 1040, 10)), PushOutcome::Enqueued);
        assert_eq!(buffer.push(create_test_chunk(2, 1020, 10)), PushOutcome::Enqueued);

        assert_eq!(buffer.statistics().reordered, 1);
        assert_eq!(buffer.front().unwrap().sequence, 1);
        assert_eq!(timestamps_ms(&mut buffer), vec![1000, 1020, 1040]);
    }

    #[test]
    fn test_duplicates_rejected() {
        let mut buffer = JitterBuffer::with_max_chunks(10);
        buffer.push(create_test_chunk(1, 1000, 10));
        buffer.push(create_test_chunk(2, 1020, 10));

        // Same timestamp, new sequence
        assert_eq!(
            buffer.push(create_test_chunk(9, 1020, 10)),
            PushOutcome::DuplicateDropped
        );
        // Same sequence, new timestamp
        assert_eq!(
            buffer.push(create_test_chunk(1, 1060, 10)),
            PushOutcome::DuplicateDropped
        );
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.statistics().duplicates_dropped, 2);
    }

    #[test]
    fn test_older_than_front_is_stale() {
        let mut buffer = JitterBuffer::with_max_chunks(10);
        buffer.push(create_test_chunk(5, 2000, 10));
        assert_eq!(
            buffer.push(create_test_chunk(4, 1980, 10)),
            PushOutcome::StaleDropped
        );
        assert_eq!(buffer.statistics().stale_dropped, 1);
    }

    #[test]
    fn test_already_released_is_stale_when_empty() {
        let mut buffer = JitterBuffer::with_max_chunks(10);
        buffer.push(create_test_chunk(1, 1000, 10));
        assert!(buffer.pop_if_due(Timestamp::from_millis(1000)).is_some());
        assert!(buffer.is_empty());

        assert_eq!(
            buffer.push(create_test_chunk(2, 1000, 10)),
            PushOutcome::StaleDropped
        );
        assert_eq!(buffer.push(create_test_chunk(3, 1020, 10)), PushOutcome::Enqueued);
    }

    #[test]
    fn test_capacity_scenario_evicts_oldest() {
        let mut buffer = JitterBuffer::with_max_chunks(10);
        for (seq, ts) in (100..=111).enumerate() {
            assert_eq!(
                buffer.push(AudioChunk::new(Timestamp::new(ts, 0), vec![0; 4], seq as u64)),
                PushOutcome::Enqueued
            );
        }

        assert_eq!(buffer.len(), 10);
        assert_eq!(buffer.statistics().overflow_evictions, 2);
        let secs: Vec<i32> = std::iter::from_fn(|| buffer.pop_front())
            .map(|c| c.timestamp.sec)
            .collect();
        assert_eq!(secs, (102..=111).collect::<Vec<_>>());
    }

    #[test]
    fn test_byte_capacity_evicts_oldest() {
        let config = BufferConfig {
            capacity_bytes: 250,
            ..Default::default()
        };
        let mut buffer = JitterBuffer::new(&config, 75);
        for i in 0..5 {
            buffer.push(create_test_chunk(i, 1000 + i as i64 * 20, 100));
        }
        assert_eq!(buffer.filled_bytes(), 200);
        assert_eq!(buffer.front().unwrap().sequence, 3);
    }

    #[test]
    fn test_oversized_single_chunk_is_kept() {
        let config = BufferConfig {
            capacity_bytes: 50,
            ..Default::default()
        };
        let mut buffer = JitterBuffer::new(&config, 75);
        buffer.push(create_test_chunk(0, 1000, 100));
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.fill_percent(), 100.0);
    }

    #[test]
    fn test_pop_if_due_respects_server_time() {
        let mut buffer = JitterBuffer::with_max_chunks(10);
        buffer.push(create_test_chunk(1, 1000, 10));
        buffer.push(create_test_chunk(2, 1020, 10));

        assert!(buffer.pop_if_due(Timestamp::from_millis(999)).is_none());
        assert_eq!(buffer.pop_if_due(Timestamp::from_millis(1000)).unwrap().sequence, 1);
        assert!(buffer.pop_if_due(Timestamp::from_millis(1010)).is_none());
        assert_eq!(buffer.pop_if_due(Timestamp::from_millis(1500)).unwrap().sequence, 2);
    }

    #[test]
    fn test_pop_order_is_strictly_increasing() {
        let mut buffer = JitterBuffer::with_max_chunks(64);
        // Scrambled arrival order with duplicates and stragglers
        let arrivals = [
            5, 3, 7, 6, 6, 9, 8, 12, 10, 11, 4, 15, 13, 14, 14, 20, 16, 18, 17, 19,
        ];
        let mut last: Option<Timestamp> = None;
        let mut now_ms = 0;
        for (seq, ts) in arrivals.iter().enumerate() {
            buffer.push(create_test_chunk(seq as u64, ts * 20, 8));
            now_ms += 15;
            while let Some(chunk) = buffer.pop_if_due(Timestamp::from_millis(now_ms + 60)) {
                if let Some(previous) = last {
                    assert!(chunk.timestamp > previous);
                }
                last = Some(chunk.timestamp);
            }
        }
    }

    #[test]
    fn test_drop_expired() {
        let mut buffer = JitterBuffer::with_max_chunks(10);
        for i in 0..4 {
            buffer.push(create_test_chunk(i, 1000 + i as i64 * 20, 10));
        }
        // 1000 and 1020 are more than 30ms late at 1055
        let dropped = buffer.drop_expired(Timestamp::from_millis(1055), 30_000);
        assert_eq!(dropped, 2);
        assert_eq!(buffer.front().unwrap().sequence, 2);
        assert_eq!(buffer.statistics().late_dropped, 2);
    }

    #[test]
    fn test_drop_future() {
        let mut buffer = JitterBuffer::with_max_chunks(10);
        buffer.push(create_test_chunk(0, 1000, 10));
        buffer.push(create_test_chunk(1, 500_000, 10));
        let dropped = buffer.drop_future(Timestamp::from_millis(900), 100_000_000);
        assert_eq!(dropped, 1);
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.filled_bytes(), 10);
        assert_eq!(buffer.statistics().future_dropped, 1);
    }

    #[test]
    fn test_pcm_format_seeds_chunk_duration() {
        let mut buffer = JitterBuffer::with_max_chunks(100);
        buffer.set_pcm_format(Some(AudioFormat::default()));
        // 3840 bytes of 48 kHz stereo 16 bit is 20 ms
        buffer.push(create_test_chunk(0, 1000, 3840));
        assert_eq!(buffer.nominal_chunk_micros(), 20_000);
        assert_eq!(buffer.buffered_duration_micros(), 20_000);
        assert_eq!(buffer.lead_time_micros(Timestamp::from_millis(990)), 30_000);

        // Observed spacing takes over from there
        buffer.push(create_test_chunk(1, 1040, 3840));
        assert_eq!(buffer.nominal_chunk_micros(), 22_500);

        buffer.clear();
        buffer.push(create_test_chunk(2, 2000, 3840));
        assert_eq!(buffer.nominal_chunk_micros(), 0);
    }

    #[test]
    fn test_durations_and_trim() {
        let mut buffer = JitterBuffer::with_max_chunks(100);
        for i in 0..10 {
            buffer.push(create_test_chunk(i, 1000 + i as i64 * 20, 10));
        }
        assert_eq!(buffer.nominal_chunk_micros(), 20_000);
        assert_eq!(buffer.buffered_duration_micros(), 200_000);
        assert_eq!(buffer.lead_time_micros(Timestamp::from_millis(1100)), 100_000);
        assert_eq!(buffer.lead_time_micros(Timestamp::from_millis(5000)), 0);

        let dropped = buffer.trim_to(100_000);
        assert_eq!(dropped, 5);
        assert_eq!(buffer.buffered_duration_micros(), 100_000);
        assert_eq!(buffer.statistics().overrun_dropped, 5);
    }

    #[test]
    fn test_state_watermarks() {
        let config = BufferConfig {
            capacity_bytes: 1000,
            low_watermark_percent: 20,
            ..Default::default()
        };
        let mut buffer = JitterBuffer::new(&config, 80);
        buffer.push(create_test_chunk(0, 1000, 100));

        let state = buffer.state();
        assert_eq!(state.low_watermark, 200);
        assert_eq!(state.high_watermark, 800);
        assert!(state.is_low());
        assert!(!state.is_high());
        assert_eq!(state.fill_percent(), 10.0);
    }

    #[test]
    fn test_clear_resets_reference() {
        let mut buffer = JitterBuffer::with_max_chunks(10);
        buffer.push(create_test_chunk(1, 5000, 10));
        buffer.pop_front();
        buffer.clear();
        // Older material is welcome again after a reset
        assert_eq!(buffer.push(create_test_chunk(1, 1000, 10)), PushOutcome::Enqueued);
        assert_eq!(buffer.filled_bytes(), 10);
    }
}
