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

//! # snapclient
//!
//! Synchronization and buffering engine for a multiroom audio client.
//!
//! The client receives timestamped audio chunks from a server, estimates the
//! offset between the server clock and the local clock from round trip
//! probes, holds the chunks in a jitter buffer until their play time, and
//! nudges the playback speed so the buffer stays at its target fill.
//!
//! Two flows share an [`SharedState`]:
//! - the receive flow drives a [`Session`] with bytes from the transport;
//! - the output flow calls [`Player::cycle`], sleeping as the
//!   [`SchedulerPolicy`] suggests.
//!
//! Sockets, decoders and audio devices stay outside: the session consumes
//! and produces bytes, and decoding and output go through the
//! [`AudioDecoder`] and [`AudioSink`] traits.

pub mod config;
pub mod decoder;
pub mod error;
pub mod jitter_buffer;
pub mod player;
pub mod protocol;
pub mod rate_controller;
pub mod scheduler;
pub mod session;
pub mod shared;
pub mod sink;
pub mod statistics;
pub mod time;
pub mod time_sync;

pub use config::{ClientConfig, TimeSyncStrategy};
pub use decoder::{AudioDecoder, AudioFormat, PcmDecoder};
pub use error::{Result, SnapError};
pub use jitter_buffer::{AudioChunk, BufferState, JitterBuffer, PushOutcome};
pub use player::{CycleReport, Player};
pub use protocol::{Message, Payload};
pub use rate_controller::{
    ControlAction, OutputDecision, PlaybackSettings, PlayoutClock, RateController,
};
pub use scheduler::{SchedulerDecision, SchedulerPolicy};
pub use session::{Session, SessionState};
pub use shared::SharedState;
pub use sink::{AudioSink, RecordingSink};
pub use statistics::ClientStatistics;
pub use time::{Clock, ManualClock, SystemClock, Timestamp};
pub use time_sync::{ClockOffset, TimeSample, TimeSync};
