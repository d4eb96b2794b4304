//! Error types for the live voice engine

use thiserror::Error;

/// Result type alias for voice operations
pub type VoiceResult<T> = Result<T, VoiceError>;

/// Errors that can occur in the live voice engine.
///
/// Codec and chunk level errors (`MalformedFrame`, `ProtocolViolation`) are contained by the
/// session; device and channel level errors always tear the session down.
#[derive(Error, Debug)]
pub enum VoiceError {
    #[error("Capture device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Channel error: {0}")]
    ChannelError(String),

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("No active session")]
    NotConnected,

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Audio playback error: {0}")]
    Playback(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl VoiceError {
    /// True for errors that end the current session.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            VoiceError::DeviceUnavailable(_)
                | VoiceError::ConnectionFailed(_)
                | VoiceError::ChannelError(_)
        )
    }
}

impl From<config::ConfigError> for VoiceError {
    fn from(err: config::ConfigError) -> Self {
        VoiceError::Config(err.to_string())
    }
}

impl From<cpal::DevicesError> for VoiceError {
    fn from(err: cpal::DevicesError) -> Self {
        VoiceError::DeviceUnavailable(err.to_string())
    }
}

impl From<cpal::DefaultStreamConfigError> for VoiceError {
    fn from(err: cpal::DefaultStreamConfigError) -> Self {
        VoiceError::DeviceUnavailable(err.to_string())
    }
}

impl From<cpal::BuildStreamError> for VoiceError {
    fn from(err: cpal::BuildStreamError) -> Self {
        VoiceError::DeviceUnavailable(err.to_string())
    }
}

impl From<cpal::PlayStreamError> for VoiceError {
    fn from(err: cpal::PlayStreamError) -> Self {
        VoiceError::DeviceUnavailable(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for VoiceError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        VoiceError::ChannelError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification() {
        assert!(VoiceError::DeviceUnavailable("no mic".into()).is_fatal());
        assert!(VoiceError::ChannelError("reset".into()).is_fatal());
        assert!(!VoiceError::MalformedFrame("odd length".into()).is_fatal());
        assert!(!VoiceError::NotConnected.is_fatal());
    }
}
