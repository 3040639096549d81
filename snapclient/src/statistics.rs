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

use crate::time_sync::ClockOffset;

/// Counters kept by the jitter buffer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BufferStatistics {
    /// Chunks accepted into the buffer
    pub chunks_enqueued: u64,
    /// Payload bytes accepted into the buffer
    pub bytes_enqueued: u64,
    pub duplicates_dropped: u64,
    pub stale_dropped: u64,
    /// Oldest chunks pushed out by the capacity limit
    pub overflow_evictions: u64,
    /// Chunks that were due too long ago to be played
    pub late_dropped: u64,
    /// Chunks stamped implausibly far in the future
    pub future_dropped: u64,
    /// Chunks removed to bring an overfull buffer back to target
    pub overrun_dropped: u64,
    pub reordered: u64,
    /// Largest number of positions a chunk was inserted behind the tail
    pub max_reorder_distance: u32,
}

impl BufferStatistics {
    pub fn chunk_enqueued(&mut self, bytes: usize, reorder_distance: usize) {
        self.chunks_enqueued += 1;
        self.bytes_enqueued += bytes as u64;
        if reorder_distance > 0 {
            self.reordered += 1;
            self.max_reorder_distance = self.max_reorder_distance.max(reorder_distance as u32);
        }
    }

    /// Fraction of enqueued chunks that arrived out of order, in per-myriad
    pub fn reorder_rate_permyriad(&self) -> u16 {
        if self.chunks_enqueued == 0 {
            return 0;
        }
        ((self.reordered as f64 / self.chunks_enqueued as f64) * 10_000.0) as u16
    }
}

/// Counters kept by the session state machine
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionStatistics {
    pub messages_received: u64,
    pub bytes_received: u64,
    /// Malformed frames skipped while streaming
    pub malformed_frames: u64,
    /// Frames ignored because they arrived in the wrong state
    pub ignored_messages: u64,
    pub chunks_forwarded: u64,
    pub time_probes_sent: u64,
    pub time_samples_accepted: u64,
    pub time_samples_rejected: u64,
    pub codec_changes: u64,
    pub connects: u64,
    pub disconnects: u64,
    pub receive_timeouts: u64,
}

/// Counters and gauges kept by the output flow
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputStatistics {
    pub cycles: u64,
    pub chunks_played: u64,
    pub bytes_played: u64,
    pub decode_errors: u64,
    pub underruns: u64,
    pub overruns: u64,
    /// Cycles that ran unadjusted because the clock was not synchronized
    pub unsynchronized_cycles: u64,
    pub current_speed_factor: f64,
    pub current_lead_ms: i64,
    pub target_lead_ms: i64,
    pub muted: bool,
}

/// Snapshot of everything, suitable for periodic JSON logging
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientStatistics {
    pub session: SessionStatistics,
    pub buffer: BufferStatistics,
    pub output: OutputStatistics,
    pub clock: Option<ClockOffset>,
    pub buffered_chunks: usize,
    pub buffered_bytes: usize,
    pub fill_percent: f32,
}
