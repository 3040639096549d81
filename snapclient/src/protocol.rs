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

//! Binary message codec for the streaming protocol.
//!
//! Every frame starts with a 26 byte little-endian base header:
//!
//! ```text
//! | type u16 | id u16 | refers_to u16 | sent.sec i32 | sent.usec i32 |
//! | received.sec i32 | received.usec i32 | size u32 |
//! ```
//!
//! followed by `size` bytes of type specific payload. Decoding is pure and
//! never panics on hostile input; [`FrameReader`] layers stream reassembly on
//! top for transports that deliver arbitrary byte slices.

use serde::{Deserialize, Serialize};

use crate::time::Timestamp;
use crate::{Result, SnapError};

/// Size of the fixed base header in bytes
pub const BASE_HEADER_SIZE: usize = 26;

/// Size of a `Time` payload in bytes
pub const TIME_PAYLOAD_SIZE: usize = 8;

/// Default upper bound for a single payload
pub const DEFAULT_MAX_PAYLOAD_SIZE: u32 = 1024 * 1024;

/// Protocol version announced in the hello message
pub const PROTOCOL_VERSION: u32 = 2;

/// Message type identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    Base,
    CodecHeader,
    WireChunk,
    ServerSettings,
    Time,
    Hello,
    StreamTags,
    Unknown(u16),
}

impl MessageType {
    pub fn from_u16(value: u16) -> Self {
        match value {
            0 => MessageType::Base,
            1 => MessageType::CodecHeader,
            2 => MessageType::WireChunk,
            3 => MessageType::ServerSettings,
            4 => MessageType::Time,
            5 => MessageType::Hello,
            6 => MessageType::StreamTags,
            other => MessageType::Unknown(other),
        }
    }

    pub fn as_u16(self) -> u16 {
        match self {
            MessageType::Base => 0,
            MessageType::CodecHeader => 1,
            MessageType::WireChunk => 2,
            MessageType::ServerSettings => 3,
            MessageType::Time => 4,
            MessageType::Hello => 5,
            MessageType::StreamTags => 6,
            MessageType::Unknown(other) => other,
        }
    }
}

/// Decoded base header
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BaseHeader {
    pub message_type: MessageType,
    pub id: u16,
    pub refers_to: u16,
    pub sent: Timestamp,
    pub received: Timestamp,
    pub size: u32,
}

/// Client identity sent right after connecting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hello {
    #[serde(rename = "MAC")]
    pub mac: String,
    #[serde(rename = "HostName")]
    pub host_name: String,
    #[serde(rename = "Version")]
    pub version: String,
    #[serde(rename = "ClientName")]
    pub client_name: String,
    #[serde(rename = "OS")]
    pub os: String,
    #[serde(rename = "Arch")]
    pub arch: String,
    #[serde(rename = "Instance")]
    pub instance: u32,
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "SnapStreamProtocolVersion")]
    pub protocol_version: u32,
}

/// Playback targets pushed by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    #[serde(rename = "bufferMs")]
    pub buffer_ms: i32,
    #[serde(rename = "latency")]
    pub latency_ms: i32,
    #[serde(rename = "volume")]
    pub volume_percent: i32,
    pub muted: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            buffer_ms: 1000,
            latency_ms: 0,
            volume_percent: 100,
            muted: false,
        }
    }
}

/// Codec announcement preceding the audio stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecHeader {
    pub codec: String,
    pub payload: Vec<u8>,
}

/// Round trip probe. In a server reply `latency` is server receive time minus
/// client send time and may be negative.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeMessage {
    pub latency: Timestamp,
}

impl TimeMessage {
    pub fn latency_micros(&self) -> i64 {
        self.latency.as_micros()
    }
}

/// One encoded audio chunk stamped with server capture time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireChunk {
    pub timestamp: Timestamp,
    pub payload: Vec<u8>,
}

/// Type specific payload
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    CodecHeader(CodecHeader),
    WireChunk(WireChunk),
    ServerSettings(ServerSettings),
    Time(TimeMessage),
    Hello(Hello),
    /// Carried through untouched: stream tags, the base type and unknown ids
    Opaque { type_id: u16, bytes: Vec<u8> },
}

/// A complete protocol message. The payload size is derived from the
/// payload, so header and body can never disagree.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: u16,
    pub refers_to: u16,
    pub sent: Timestamp,
    pub received: Timestamp,
    pub payload: Payload,
}

impl Message {
    pub fn new(id: u16, sent: Timestamp, payload: Payload) -> Self {
        Self {
            id,
            refers_to: 0,
            sent,
            received: Timestamp::ZERO,
            payload,
        }
    }

    pub fn message_type(&self) -> MessageType {
        match &self.payload {
            Payload::CodecHeader(_) => MessageType::CodecHeader,
            Payload::WireChunk(_) => MessageType::WireChunk,
            Payload::ServerSettings(_) => MessageType::ServerSettings,
            Payload::Time(_) => MessageType::Time,
            Payload::Hello(_) => MessageType::Hello,
            Payload::Opaque { type_id, .. } => MessageType::from_u16(*type_id),
        }
    }
}

/// Outcome of decoding from a byte slice
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// A full message and the number of bytes it occupied
    Complete { message: Message, consumed: usize },
    /// The slice holds a prefix of a frame; at least this many more bytes are needed
    NeedMoreBytes(usize),
}

/// Decode the first message in `bytes`
pub fn decode(bytes: &[u8], max_payload_size: u32) -> Result<Decoded> {
    let header = match decode_header(bytes) {
        Some(header) => header,
        None => return Ok(Decoded::NeedMoreBytes(BASE_HEADER_SIZE - bytes.len())),
    };
    check_payload_size(&header, max_payload_size)?;

    let frame_len = BASE_HEADER_SIZE + header.size as usize;
    if bytes.len() < frame_len {
        return Ok(Decoded::NeedMoreBytes(frame_len - bytes.len()));
    }

    let message = decode_body(&header, &bytes[BASE_HEADER_SIZE..frame_len])?;
    Ok(Decoded::Complete {
        message,
        consumed: frame_len,
    })
}

/// Parse the base header, or `None` if fewer than 26 bytes are available
pub fn decode_header(bytes: &[u8]) -> Option<BaseHeader> {
    let mut reader = ByteReader::new(bytes.get(..BASE_HEADER_SIZE)?);
    Some(BaseHeader {
        message_type: MessageType::from_u16(reader.u16()?),
        id: reader.u16()?,
        refers_to: reader.u16()?,
        sent: reader.timestamp()?,
        received: reader.timestamp()?,
        size: reader.u32()?,
    })
}

/// Decode a payload whose header has already been parsed
pub fn decode_body(header: &BaseHeader, body: &[u8]) -> Result<Message> {
    if body.len() != header.size as usize {
        return Err(malformed(format!(
            "payload is {} bytes, header declares {}",
            body.len(),
            header.size
        )));
    }

    let payload = match header.message_type {
        MessageType::CodecHeader => Payload::CodecHeader(decode_codec_header(body)?),
        MessageType::WireChunk => Payload::WireChunk(decode_wire_chunk(body)?),
        MessageType::ServerSettings => Payload::ServerSettings(decode_json(body, "server settings")?),
        MessageType::Time => Payload::Time(decode_time(body)?),
        MessageType::Hello => Payload::Hello(decode_json(body, "hello")?),
        other => Payload::Opaque {
            type_id: other.as_u16(),
            bytes: body.to_vec(),
        },
    };

    Ok(Message {
        id: header.id,
        refers_to: header.refers_to,
        sent: header.sent,
        received: header.received,
        payload,
    })
}

/// Encode a message into a new buffer
pub fn encode(message: &Message) -> Result<Vec<u8>> {
    let body = encode_payload(&message.payload)?;
    let size = u32::try_from(body.len())
        .map_err(|_| malformed(format!("payload of {} bytes does not fit u32", body.len())))?;

    let mut out = Vec::with_capacity(BASE_HEADER_SIZE + body.len());
    out.extend_from_slice(&message.message_type().as_u16().to_le_bytes());
    out.extend_from_slice(&message.id.to_le_bytes());
    out.extend_from_slice(&message.refers_to.to_le_bytes());
    put_timestamp(&mut out, message.sent);
    put_timestamp(&mut out, message.received);
    out.extend_from_slice(&size.to_le_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

fn encode_payload(payload: &Payload) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    match payload {
        Payload::CodecHeader(header) => {
            put_sized(&mut out, header.codec.as_bytes())?;
            put_sized(&mut out, &header.payload)?;
        }
        Payload::WireChunk(chunk) => {
            put_timestamp(&mut out, chunk.timestamp);
            put_sized(&mut out, &chunk.payload)?;
        }
        Payload::ServerSettings(settings) => put_json(&mut out, settings)?,
        Payload::Time(time) => put_timestamp(&mut out, time.latency),
        Payload::Hello(hello) => put_json(&mut out, hello)?,
        Payload::Opaque { bytes, .. } => out.extend_from_slice(bytes),
    }
    Ok(out)
}

fn check_payload_size(header: &BaseHeader, max_payload_size: u32) -> Result<()> {
    if header.size > max_payload_size {
        return Err(malformed(format!(
            "{:?} payload of {} bytes exceeds limit of {}",
            header.message_type, header.size, max_payload_size
        )));
    }
    Ok(())
}

fn decode_codec_header(body: &[u8]) -> Result<CodecHeader> {
    let mut reader = ByteReader::new(body);
    let name = reader
        .sized()
        .ok_or_else(|| malformed("codec header name truncated"))?;
    let codec = std::str::from_utf8(name)
        .map_err(|_| malformed("codec name is not valid UTF-8"))?
        .to_string();
    let payload = reader
        .sized()
        .ok_or_else(|| malformed("codec header payload truncated"))?
        .to_vec();
    Ok(CodecHeader { codec, payload })
}

fn decode_wire_chunk(body: &[u8]) -> Result<WireChunk> {
    let mut reader = ByteReader::new(body);
    let timestamp = reader
        .timestamp()
        .ok_or_else(|| malformed("wire chunk timestamp truncated"))?;
    let payload = reader
        .sized()
        .ok_or_else(|| malformed("wire chunk payload truncated"))?
        .to_vec();
    Ok(WireChunk { timestamp, payload })
}

fn decode_time(body: &[u8]) -> Result<TimeMessage> {
    if body.len() != TIME_PAYLOAD_SIZE {
        return Err(malformed(format!(
            "time payload must be {TIME_PAYLOAD_SIZE} bytes, got {}",
            body.len()
        )));
    }
    let latency = ByteReader::new(body)
        .timestamp()
        .ok_or_else(|| malformed("time payload truncated"))?;
    Ok(TimeMessage { latency })
}

fn decode_json<T: serde::de::DeserializeOwned>(body: &[u8], what: &str) -> Result<T> {
    let mut reader = ByteReader::new(body);
    let json = reader
        .sized()
        .ok_or_else(|| malformed(format!("{what} json truncated")))?;
    serde_json::from_slice(json).map_err(|e| malformed(format!("{what} json: {e}")))
}

fn put_timestamp(out: &mut Vec<u8>, ts: Timestamp) {
    out.extend_from_slice(&ts.sec.to_le_bytes());
    out.extend_from_slice(&ts.usec.to_le_bytes());
}

fn put_sized(out: &mut Vec<u8>, bytes: &[u8]) -> Result<()> {
    let len = u32::try_from(bytes.len())
        .map_err(|_| malformed(format!("field of {} bytes does not fit u32", bytes.len())))?;
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(bytes);
    Ok(())
}

fn put_json<T: Serialize>(out: &mut Vec<u8>, value: &T) -> Result<()> {
    let json = serde_json::to_vec(value).map_err(|e| malformed(format!("json encode: {e}")))?;
    put_sized(out, &json)
}

fn malformed(reason: impl Into<String>) -> SnapError {
    SnapError::MalformedMessage(reason.into())
}

/// Little-endian cursor over a borrowed slice
struct ByteReader<'a> {
    rest: &'a [u8],
}

impl<'a> ByteReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { rest: bytes }
    }

    fn array<const N: usize>(&mut self) -> Option<[u8; N]> {
        let (head, rest) = self.rest.split_first_chunk::<N>()?;
        self.rest = rest;
        Some(*head)
    }

    fn u16(&mut self) -> Option<u16> {
        self.array().map(u16::from_le_bytes)
    }

    fn u32(&mut self) -> Option<u32> {
        self.array().map(u32::from_le_bytes)
    }

    fn i32(&mut self) -> Option<i32> {
        self.array().map(i32::from_le_bytes)
    }

    fn timestamp(&mut self) -> Option<Timestamp> {
        Some(Timestamp {
            sec: self.i32()?,
            usec: self.i32()?,
        })
    }

    /// A `u32` length followed by that many bytes
    fn sized(&mut self) -> Option<&'a [u8]> {
        let len = self.u32()? as usize;
        if len > self.rest.len() {
            return None;
        }
        let (head, rest) = self.rest.split_at(len);
        self.rest = rest;
        Some(head)
    }
}

/// Reassembles frames from a byte stream.
///
/// A frame whose header is intact but whose body fails to decode is dropped
/// by its declared size, keeping the stream aligned. A declared size above
/// the limit cannot be trusted for framing, so the reader discards everything
/// buffered.
#[derive(Debug)]
pub struct FrameReader {
    buffer: Vec<u8>,
    max_payload_size: u32,
}

impl FrameReader {
    pub fn new(max_payload_size: u32) -> Self {
        Self {
            buffer: Vec::with_capacity(BASE_HEADER_SIZE),
            max_payload_size,
        }
    }

    /// Append bytes read from the transport
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Next complete message, `None` when more bytes are needed
    pub fn next_message(&mut self) -> Option<Result<Message>> {
        let header = decode_header(&self.buffer)?;
        if let Err(e) = check_payload_size(&header, self.max_payload_size) {
            log::warn!("Discarding {} buffered bytes: {e}", self.buffer.len());
            self.buffer.clear();
            return Some(Err(e));
        }

        let frame_len = BASE_HEADER_SIZE + header.size as usize;
        if self.buffer.len() < frame_len {
            return None;
        }

        let result = decode_body(&header, &self.buffer[BASE_HEADER_SIZE..frame_len]);
        self.buffer.drain(..frame_len);
        Some(result)
    }

    /// Number of bytes waiting for the rest of their frame
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
    }
}
