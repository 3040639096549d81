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

//! Decoder interface and codec header inspection.

use serde::{Deserialize, Serialize};

use crate::protocol::CodecHeader;
use crate::{Result, SnapError};

/// Marker preceding the Opus pseudo header ("OPUS" as a little-endian u32)
const OPUS_HEADER_MARKER: u32 = 0x4F50_5553;

/// PCM layout produced by a decoder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
}

impl AudioFormat {
    pub fn bytes_per_frame(&self) -> usize {
        self.channels as usize * (self.bits_per_sample as usize).div_ceil(8)
    }

    pub fn bytes_per_second(&self) -> usize {
        self.bytes_per_frame() * self.sample_rate as usize
    }

    /// Playback time of `bytes` of PCM in this format
    pub fn duration_micros(&self, bytes: usize) -> i64 {
        let per_second = self.bytes_per_second();
        if per_second == 0 {
            return 0;
        }
        (bytes as u128 * 1_000_000 / per_second as u128) as i64
    }
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            channels: 2,
            bits_per_sample: 16,
        }
    }
}

/// Codec named in a codec header
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecKind {
    Pcm,
    Opus,
    Flac,
    Ogg,
    Other(String),
}

impl CodecKind {
    pub fn from_name(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "pcm" => CodecKind::Pcm,
            "opus" => CodecKind::Opus,
            "flac" => CodecKind::Flac,
            "ogg" => CodecKind::Ogg,
            _ => CodecKind::Other(name.to_string()),
        }
    }
}

/// Read the stream format from a codec header, when the header carries one
/// in a form that needs no decoding: a RIFF/WAVE header for PCM, the pseudo
/// header for Opus. FLAC and Ogg describe themselves inside the bitstream.
pub fn stream_format(header: &CodecHeader) -> Option<AudioFormat> {
    match CodecKind::from_name(&header.codec) {
        CodecKind::Pcm => parse_wave_header(&header.payload),
        CodecKind::Opus => parse_opus_header(&header.payload),
        _ => None,
    }
}

fn parse_opus_header(payload: &[u8]) -> Option<AudioFormat> {
    let marker = u32::from_le_bytes(*payload.first_chunk::<4>()?);
    if marker != OPUS_HEADER_MARKER {
        return None;
    }
    let rest = payload.get(4..12)?;
    Some(AudioFormat {
        sample_rate: u32::from_le_bytes(rest[0..4].try_into().ok()?),
        bits_per_sample: u16::from_le_bytes(rest[4..6].try_into().ok()?),
        channels: u16::from_le_bytes(rest[6..8].try_into().ok()?),
    })
}

fn parse_wave_header(payload: &[u8]) -> Option<AudioFormat> {
    if payload.get(0..4)? != b"RIFF" || payload.get(8..12)? != b"WAVE" {
        return None;
    }
    let mut pos = 12;
    while pos + 8 <= payload.len() {
        let id = &payload[pos..pos + 4];
        let len = u32::from_le_bytes(payload[pos + 4..pos + 8].try_into().ok()?) as usize;
        let body = pos + 8;
        if id == b"fmt " {
            let fmt = payload.get(body..body + 16)?;
            return Some(AudioFormat {
                channels: u16::from_le_bytes(fmt[2..4].try_into().ok()?),
                sample_rate: u32::from_le_bytes(fmt[4..8].try_into().ok()?),
                bits_per_sample: u16::from_le_bytes(fmt[14..16].try_into().ok()?),
            });
        }
        // Chunks are padded to even sizes
        pos = body.checked_add(len)?.checked_add(len & 1)?;
    }
    None
}

/// Trait for audio decoders.
///
/// `init` is called for every codec header, including mid-stream codec
/// changes; `decode` turns one chunk payload into interleaved little-endian
/// PCM in the format returned by `format`.
pub trait AudioDecoder: Send {
    fn init(&mut self, header: &CodecHeader) -> Result<AudioFormat>;

    fn decode(&mut self, encoded: &[u8]) -> Result<Vec<u8>>;

    fn format(&self) -> Option<AudioFormat>;
}

/// Decoder for uncompressed PCM streams: the payload already is the output
#[derive(Debug, Default)]
pub struct PcmDecoder {
    format: Option<AudioFormat>,
}

impl PcmDecoder {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AudioDecoder for PcmDecoder {
    fn init(&mut self, header: &CodecHeader) -> Result<AudioFormat> {
        if CodecKind::from_name(&header.codec) != CodecKind::Pcm {
            self.format = None;
            return Err(SnapError::DecoderInit {
                codec: header.codec.clone(),
                reason: "only pcm streams are supported".to_string(),
            });
        }
        let format = parse_wave_header(&header.payload).ok_or_else(|| SnapError::DecoderInit {
            codec: header.codec.clone(),
            reason: "missing or invalid RIFF/WAVE header".to_string(),
        })?;
        log::info!(
            "PCM stream: {} Hz, {} channels, {} bits",
            format.sample_rate,
            format.channels,
            format.bits_per_sample
        );
        self.format = Some(format);
        Ok(format)
    }

    fn decode(&mut self, encoded: &[u8]) -> Result<Vec<u8>> {
        let format = self
            .format
            .ok_or_else(|| SnapError::Decode("decoder not initialized".to_string()))?;
        if encoded.len() % format.bytes_per_frame().max(1) != 0 {
            return Err(SnapError::Decode(format!(
                "{} bytes is not a whole number of {} byte frames",
                encoded.len(),
                format.bytes_per_frame()
            )));
        }
        Ok(encoded.to_vec())
    }

    fn format(&self) -> Option<AudioFormat> {
        self.format
    }
}

/// Build a canonical 44 byte RIFF/WAVE header
pub fn wave_header(format: AudioFormat) -> Vec<u8> {
    let block_align = format.bytes_per_frame() as u16;
    let byte_rate = format.bytes_per_second() as u32;
    let mut out = Vec::with_capacity(44);
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&36u32.to_le_bytes());
    out.extend_from_slice(b"WAVE");
    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&format.channels.to_le_bytes());
    out.extend_from_slice(&format.sample_rate.to_le_bytes());
    out.extend_from_slice(&byte_rate.to_le_bytes());
    out.extend_from_slice(&block_align.to_le_bytes());
    out.extend_from_slice(&format.bits_per_sample.to_le_bytes());
    out.extend_from_slice(b"data");
    out.extend_from_slice(&0u32.to_le_bytes());
    out
}
