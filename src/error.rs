// Error types for the lip sync engine
// Loader and extractor errors surface from load(); device errors degrade playback instead of failing it

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// The audio file does not exist
    #[error("Audio file not found: {0:?}")]
    NotFound(PathBuf),

    /// Extension not in the allow-list, or magic bytes contradict the extension
    #[error("Unsupported audio format: {0}")]
    UnsupportedFormat(String),

    /// The decoder rejected the bytes
    #[error("Audio decode error: {0}")]
    Decode(String),

    /// Audio output could not be opened or failed mid-stream.
    /// Never fatal for playback: the controller falls back to wall-clock timing.
    #[error("Audio device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Operation not valid in the current controller state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// A track is loaded but its envelope has no entries
    #[error("Envelope is empty, nothing to play")]
    EmptyEnvelope,

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Settings error: {0}")]
    Settings(String),

    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether playback can continue in a degraded mode after this error
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::DeviceUnavailable(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_device_errors_are_recoverable() {
        assert!(Error::DeviceUnavailable("no device".into()).is_recoverable());
        assert!(!Error::NotFound(PathBuf::from("a.wav")).is_recoverable());
        assert!(!Error::EmptyEnvelope.is_recoverable());
    }

    #[test]
    fn test_display_includes_detail() {
        let err = Error::UnsupportedFormat("txt".into());
        assert_eq!(err.to_string(), "Unsupported audio format: txt");
    }
}
