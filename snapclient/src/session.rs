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

//! Protocol session: handshake, steady state streaming and teardown.
//!
//! The session never touches a socket. The driver hands it received bytes
//! with [`Session::on_bytes`], writes whatever [`Session::connect`] and
//! [`Session::poll`] return, and reconnects when a call reports a
//! session-fatal error.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::config::{ClientConfig, TimeSyncStrategy};
use crate::decoder::{stream_format, AudioFormat, CodecKind};
use crate::jitter_buffer::{AudioChunk, PushOutcome};
use crate::protocol::{
    encode, CodecHeader, FrameReader, Message, Payload, ServerSettings, TimeMessage, WireChunk,
};
use crate::rate_controller::PlaybackSettings;
use crate::shared::{initial_settings, SharedState};
use crate::statistics::SessionStatistics;
use crate::time::Timestamp;
use crate::time_sync::{create_time_sync, ClockOffset, SampleOutcome, TimeSample, TimeSync};
use crate::{Result, SnapError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    AwaitingServerSettings,
    AwaitingCodecHeader,
    Streaming,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::AwaitingServerSettings => "awaiting server settings",
            SessionState::AwaitingCodecHeader => "awaiting codec header",
            SessionState::Streaming => "streaming",
        };
        f.write_str(name)
    }
}

/// Probe waiting for its reply
#[derive(Debug, Clone, Copy)]
struct PendingProbe {
    id: u16,
    sent: Timestamp,
}

pub struct Session {
    config: ClientConfig,
    shared: Arc<SharedState>,
    state: SessionState,
    reader: FrameReader,
    time_sync: Box<dyn TimeSync + Send>,
    next_message_id: u16,
    pending_probes: VecDeque<PendingProbe>,
    last_probe: Option<Timestamp>,
    last_received: Option<Timestamp>,
    server_settings: Option<ServerSettings>,
    codec_header: Option<CodecHeader>,
    /// Format announced by the codec header itself, if it carries one
    stream_format: Option<AudioFormat>,
    next_sequence: u64,
    stats: SessionStatistics,
}

impl Session {
    pub fn new(config: &ClientConfig, shared: Arc<SharedState>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config: config.clone(),
            shared,
            state: SessionState::Disconnected,
            reader: FrameReader::new(config.session.max_payload_size),
            time_sync: create_time_sync(&config.time_sync),
            next_message_id: 0,
            pending_probes: VecDeque::new(),
            last_probe: None,
            last_received: None,
            server_settings: None,
            codec_header: None,
            stream_format: None,
            next_sequence: 0,
            stats: SessionStatistics::default(),
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Start a session. Returns the bytes to send: the Hello and, for the
    /// probing strategies, the first time probe.
    pub fn connect(&mut self, now: Timestamp) -> Result<Vec<u8>> {
        if self.state != SessionState::Disconnected {
            log::warn!("connect() while {}, resetting session first", self.state);
            self.disconnect()?;
        }

        self.set_state(SessionState::Connecting);
        self.stats.connects += 1;
        self.last_received = Some(now);

        let hello = Message::new(
            self.next_id(),
            now,
            Payload::Hello(self.config.hello.to_hello()),
        );
        let mut out = encode(&hello)?;

        if self.time_sync.strategy() == TimeSyncStrategy::Fixed {
            self.publish_offset()?;
        } else {
            out.extend_from_slice(&self.probe(now)?);
        }

        // The server does not acknowledge the Hello
        self.set_state(SessionState::AwaitingServerSettings);
        Ok(out)
    }

    /// Feed bytes read from the transport
    pub fn on_bytes(&mut self, bytes: &[u8], now: Timestamp) -> Result<()> {
        if self.state == SessionState::Disconnected {
            log::debug!("Ignoring {} bytes while disconnected", bytes.len());
            return Ok(());
        }

        self.stats.bytes_received += bytes.len() as u64;
        self.last_received = Some(now);
        self.reader.feed(bytes);

        while let Some(next) = self.reader.next_message() {
            match next {
                Ok(mut message) => {
                    message.received = now;
                    self.handle_message(message, now)?;
                    if self.state == SessionState::Disconnected {
                        break;
                    }
                }
                Err(e) if self.state == SessionState::Streaming => {
                    self.stats.malformed_frames += 1;
                    log::warn!("Skipping malformed frame: {e}");
                }
                Err(e) => {
                    log::debug!("Ignoring malformed frame while {}: {e}", self.state);
                }
            }
        }
        Ok(())
    }

    /// Dispatch one decoded message
    pub fn handle_message(&mut self, message: Message, now: Timestamp) -> Result<()> {
        self.stats.messages_received += 1;
        let kind = message.message_type();
        let refers_to = message.refers_to;
        let server_sent = message.sent;

        match message.payload {
            Payload::ServerSettings(settings) => self.on_server_settings(settings),
            Payload::CodecHeader(header) => self.on_codec_header(header),
            Payload::WireChunk(chunk) => self.on_wire_chunk(chunk),
            Payload::Time(time) => self.on_time(time, refers_to, server_sent, now),
            Payload::Hello(_) | Payload::Opaque { .. } => {
                self.stats.ignored_messages += 1;
                log::debug!("Ignoring message type {kind:?} while {}", self.state);
                Ok(())
            }
        }
    }

    /// Periodic housekeeping. Returns a time probe to send when one is due.
    /// A receive timeout ends the session with a transport error.
    pub fn poll(&mut self, now: Timestamp) -> Result<Option<Vec<u8>>> {
        if self.state == SessionState::Disconnected {
            return Ok(None);
        }

        let timeout_micros = self.config.session.receive_timeout_ms as i64 * 1000;
        let silent_for = self
            .last_received
            .map(|last| now.micros_since(last))
            .unwrap_or(0);
        if silent_for > timeout_micros {
            log::warn!(
                "No data from server for {} ms while {}, disconnecting",
                silent_for / 1000,
                self.state
            );
            self.stats.receive_timeouts += 1;
            self.disconnect()?;
            return Err(SnapError::Transport(format!(
                "receive timeout after {} ms",
                silent_for / 1000
            )));
        }

        if self.time_sync.strategy() == TimeSyncStrategy::Fixed {
            return Ok(None);
        }
        let interval_micros = self.config.time_sync.probe_interval_ms as i64 * 1000;
        let due = self
            .last_probe
            .map_or(true, |last| now.micros_since(last) >= interval_micros);
        if due {
            return self.probe(now).map(Some);
        }
        Ok(None)
    }

    /// End the session and drop everything scoped to it
    pub fn disconnect(&mut self) -> Result<()> {
        if self.state == SessionState::Disconnected {
            return Ok(());
        }
        self.stats.disconnects += 1;
        self.set_state(SessionState::Disconnected);

        self.reader.reset();
        self.pending_probes.clear();
        self.last_probe = None;
        self.last_received = None;
        self.server_settings = None;
        self.codec_header = None;
        self.stream_format = None;
        self.time_sync.reset();

        self.shared.lock_buffer()?.clear();
        self.shared.publish_offset(None, 0)?;
        self.shared.update_settings(initial_settings(&self.config))?;
        let generation = self.shared.bump_generation();
        log::debug!("Session generation now {generation}");
        Ok(())
    }

    pub fn statistics(&self) -> &SessionStatistics {
        &self.stats
    }

    pub fn codec_header(&self) -> Option<&CodecHeader> {
        self.codec_header.as_ref()
    }

    pub fn stream_format(&self) -> Option<AudioFormat> {
        self.stream_format
    }

    pub fn server_settings(&self) -> Option<&ServerSettings> {
        self.server_settings.as_ref()
    }

    /// Current estimate of the time synchronizer
    pub fn clock_offset(&self) -> Option<ClockOffset> {
        self.time_sync.current_offset()
    }

    fn on_server_settings(&mut self, settings: ServerSettings) -> Result<()> {
        match self.state {
            SessionState::AwaitingServerSettings
            | SessionState::AwaitingCodecHeader
            | SessionState::Streaming => {}
            _ => {
                self.stats.ignored_messages += 1;
                return Ok(());
            }
        }

        log::info!(
            "Server settings: buffer {} ms, latency {} ms, volume {}%, muted {}",
            settings.buffer_ms,
            settings.latency_ms,
            settings.volume_percent,
            settings.muted
        );
        self.shared.update_settings(PlaybackSettings::from_server(
            &settings,
            self.config.controller.processing_lag_ms,
        ))?;
        self.server_settings = Some(settings);

        if self.state == SessionState::AwaitingServerSettings {
            self.set_state(SessionState::AwaitingCodecHeader);
        }
        Ok(())
    }

    fn on_codec_header(&mut self, header: CodecHeader) -> Result<()> {
        match self.state {
            SessionState::AwaitingCodecHeader | SessionState::Streaming => {}
            _ => {
                log::debug!("Ignoring codec header '{}' while {}", header.codec, self.state);
                self.stats.ignored_messages += 1;
                return Ok(());
            }
        }

        let kind = CodecKind::from_name(&header.codec);
        let announced = stream_format(&header);
        if let Some(format) = announced {
            log::debug!(
                "Codec header '{}' announces {} Hz, {} channels, {} bits",
                header.codec,
                format.sample_rate,
                format.channels,
                format.bits_per_sample
            );
        }

        let init = self.shared.lock_decoder()?.init(&header);
        match init {
            Ok(format) => {
                log::info!(
                    "Codec '{}' initialized: {} Hz, {} channels, {} bits",
                    header.codec,
                    format.sample_rate,
                    format.channels,
                    format.bits_per_sample
                );
                if announced.is_some_and(|a| a != format) {
                    log::warn!("Decoder output format differs from the codec header");
                }
                {
                    let mut buffer = self.shared.lock_buffer()?;
                    if self.state == SessionState::Streaming {
                        // Queued chunks were encoded for the previous codec
                        buffer.clear();
                    }
                    buffer.set_pcm_format((kind == CodecKind::Pcm).then_some(format));
                }
                self.stats.codec_changes += 1;
                self.stream_format = announced;
                self.codec_header = Some(header);
                self.set_state(SessionState::Streaming);
                Ok(())
            }
            Err(e) => {
                log::error!("Decoder initialization failed: {e}");
                self.disconnect()?;
                Err(e)
            }
        }
    }

    fn on_wire_chunk(&mut self, chunk: WireChunk) -> Result<()> {
        if self.state != SessionState::Streaming {
            log::trace!("Ignoring wire chunk while {}", self.state);
            self.stats.ignored_messages += 1;
            return Ok(());
        }

        let delay = self.shared.settings()?.playout_delay_micros;
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        let audio = AudioChunk::new(chunk.timestamp.add_micros(delay), chunk.payload, sequence);
        if self.shared.lock_buffer()?.push(audio) == PushOutcome::Enqueued {
            self.stats.chunks_forwarded += 1;
        }
        Ok(())
    }

    fn on_time(
        &mut self,
        time: TimeMessage,
        refers_to: u16,
        server_sent: Timestamp,
        now: Timestamp,
    ) -> Result<()> {
        if matches!(
            self.state,
            SessionState::Disconnected | SessionState::Connecting
        ) {
            self.stats.ignored_messages += 1;
            return Ok(());
        }

        let Some(index) = self.pending_probes.iter().position(|p| p.id == refers_to) else {
            log::debug!("Ignoring time reply to unknown probe {refers_to}");
            self.stats.ignored_messages += 1;
            return Ok(());
        };
        let Some(probe) = self.pending_probes.remove(index) else {
            return Ok(());
        };

        let sample = TimeSample::from_reply(probe.sent, time.latency_micros(), server_sent, now);
        match self.time_sync.add_sample(sample) {
            SampleOutcome::Accepted => {
                self.stats.time_samples_accepted += 1;
                log::trace!(
                    "Time sample: offset {}us, round trip {}us",
                    sample.offset_micros(),
                    sample.latency_micros()
                );
                self.publish_offset()?;
            }
            SampleOutcome::Ignored => {}
            outcome => {
                self.stats.time_samples_rejected += 1;
                log::debug!("Time sample rejected: {outcome:?}");
            }
        }
        Ok(())
    }

    fn probe(&mut self, now: Timestamp) -> Result<Vec<u8>> {
        let id = self.next_id();
        let message = Message::new(
            id,
            now,
            Payload::Time(TimeMessage {
                latency: Timestamp::ZERO,
            }),
        );
        let bytes = encode(&message)?;

        self.pending_probes.push_back(PendingProbe { id, sent: now });
        while self.pending_probes.len() > self.config.session.max_outstanding_probes {
            self.pending_probes.pop_front();
        }
        self.last_probe = Some(now);
        self.stats.time_probes_sent += 1;
        Ok(bytes)
    }

    fn publish_offset(&self) -> Result<()> {
        self.shared
            .publish_offset(self.time_sync.current_offset(), self.time_sync.sample_count())
    }

    fn next_id(&mut self) -> u16 {
        let id = self.next_message_id;
        self.next_message_id = self.next_message_id.wrapping_add(1);
        id
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            log::info!("Session {} -> {}", self.state, state);
            self.state = state;
        }
    }
}
