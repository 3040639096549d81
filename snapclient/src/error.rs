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

use thiserror::Error;

/// Result type for snapclient operations
pub type Result<T> = std::result::Result<T, SnapError>;

/// Errors that can occur while running a client session
///
/// None of these abort the process. Malformed frames and buffer
/// under/overruns are recovered locally; transport and decoder
/// initialization failures reset the session.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SnapError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Clock not synchronized: {samples} samples collected")]
    ClockSyncUnavailable { samples: usize },

    #[error("Buffer underrun")]
    BufferUnderrun,

    #[error("Buffer overrun: {lead_ms} ms buffered, target {target_ms} ms")]
    BufferOverrun { lead_ms: u32, target_ms: u32 },

    #[error("Decoder initialization failed for codec '{codec}': {reason}")]
    DecoderInit { codec: String, reason: String },

    #[error("Decoder error: {0}")]
    Decode(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Shared state lock poisoned: {0}")]
    SharedStatePoisoned(&'static str),
}

impl SnapError {
    /// Whether the session has to go back to `Disconnected` after this error
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            SnapError::Transport(_)
                | SnapError::DecoderInit { .. }
                | SnapError::SharedStatePoisoned(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(SnapError::Transport("reset".into()).is_session_fatal());
        assert!(SnapError::DecoderInit {
            codec: "flac".into(),
            reason: "unsupported".into()
        }
        .is_session_fatal());
        assert!(!SnapError::MalformedMessage("short".into()).is_session_fatal());
        assert!(!SnapError::BufferUnderrun.is_session_fatal());
    }

    #[test]
    fn test_display() {
        let err = SnapError::ClockSyncUnavailable { samples: 1 };
        assert_eq!(err.to_string(), "Clock not synchronized: 1 samples collected");
    }
}
