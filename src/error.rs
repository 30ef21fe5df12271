//! Error types for the cuedeck engine
//!
//! Expected errors use `Result<T, E>` with meaningful error enums; background
//! components report failures upward as events rather than panicking across
//! thread boundaries.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the engine
#[derive(Debug, Error)]
pub enum EngineError {
    /// IO errors from file operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Decoding-specific errors
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Audio device / output stream errors
    #[error("Audio output error: {0}")]
    AudioOutput(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A channel endpoint was closed while the engine was still running
    #[error("Channel closed: {0}")]
    ChannelClosed(&'static str),

    /// Engine is shutting down and no longer accepts commands
    #[error("Engine is shutting down")]
    ShuttingDown,
}

/// Errors related to audio decoding
#[derive(Debug, Error)]
pub enum DecodeError {
    /// File could not be opened
    #[error("Failed to open {path}: {message}")]
    OpenFailed { path: PathBuf, message: String },

    /// Container format not recognized / no decodable track
    #[error("Unsupported format for {path}: {message}")]
    UnsupportedFormat { path: PathBuf, message: String },

    /// No audio track in the container
    #[error("No audio track found in {path}")]
    NoAudioTrack { path: PathBuf },

    /// Codec failed on a packet
    #[error("Decode failed at frame {frame}: {message}")]
    DecodeFailed { frame: u64, message: String },

    /// Container seek failed (loop restart or trimmed start)
    #[error("Seek to frame {frame} failed: {message}")]
    SeekFailed { frame: u64, message: String },

    /// Resampler construction or processing error
    #[error("Resampling {source_rate}Hz -> {target_rate}Hz failed: {message}")]
    Resample {
        source_rate: u32,
        target_rate: u32,
        message: String,
    },

    /// A decode worker panicked; the panic was contained at the job boundary
    #[error("Decoder panicked: {message}")]
    Panicked { message: String },
}

/// Result type alias using the engine error type
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_error_display_carries_path() {
        let err = DecodeError::OpenFailed {
            path: PathBuf::from("/missing/cue.wav"),
            message: "No such file".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("/missing/cue.wav"));
        assert!(text.contains("No such file"));
    }

    #[test]
    fn test_engine_error_from_decode_error() {
        let err: EngineError = DecodeError::NoAudioTrack {
            path: PathBuf::from("a.ogg"),
        }
        .into();
        assert!(matches!(err, EngineError::Decode(_)));
    }
}
