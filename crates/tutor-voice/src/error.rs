//! Error types for the tutor voice pipeline

use std::time::Duration;
use thiserror::Error;

/// Result type alias for voice operations
pub type VoiceResult<T> = Result<T, VoiceError>;

/// Errors that can occur in the turn pipeline and its collaborators.
///
/// `Device` is fatal to a pipeline instance. Backend failures and decode
/// failures are per-turn and recoverable. `Cancelled` is the expected outcome
/// of a barge-in and is not a fault.
#[derive(Error, Debug)]
pub enum VoiceError {
    #[error("Audio device error: {0}")]
    Device(String),

    #[error("{backend} timed out after {after:?}")]
    BackendTimeout { backend: String, after: Duration },

    #[error("{backend} unavailable: {reason}")]
    BackendUnavailable { backend: String, reason: String },

    #[error("Audio decode error: {0}")]
    Decode(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("VAD processing error: {0}")]
    Vad(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl VoiceError {
    pub fn unavailable(backend: impl Into<String>, reason: impl ToString) -> Self {
        VoiceError::BackendUnavailable {
            backend: backend.into(),
            reason: reason.to_string(),
        }
    }

    pub fn timeout(backend: impl Into<String>, after: Duration) -> Self {
        VoiceError::BackendTimeout {
            backend: backend.into(),
            after,
        }
    }

    /// True for failures the orchestrator absorbs by returning to `Idle`.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, VoiceError::Device(_) | VoiceError::Config(_))
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, VoiceError::Cancelled)
    }
}

impl From<cpal::DevicesError> for VoiceError {
    fn from(err: cpal::DevicesError) -> Self {
        VoiceError::Device(err.to_string())
    }
}

impl From<cpal::DefaultStreamConfigError> for VoiceError {
    fn from(err: cpal::DefaultStreamConfigError) -> Self {
        VoiceError::Device(err.to_string())
    }
}

impl From<cpal::BuildStreamError> for VoiceError {
    fn from(err: cpal::BuildStreamError) -> Self {
        VoiceError::Device(err.to_string())
    }
}

impl From<cpal::PlayStreamError> for VoiceError {
    fn from(err: cpal::PlayStreamError) -> Self {
        VoiceError::Device(err.to_string())
    }
}
