use thiserror::Error;

use crate::audio::types::{Direction, SampleFormat};

/// Audio-related errors
#[derive(Error, Debug)]
pub enum AudioError {
    /// The platform device enumerator could not be obtained
    #[error("Audio device enumerator unavailable: {0}")]
    EnumeratorUnavailable(String),

    /// No endpoint matched the request
    #[error("No audio {0} device found")]
    DeviceNotFound(Direction),

    /// Endpoint handle is unusable (missing id, missing name)
    #[error("Invalid audio endpoint: {0}")]
    InvalidEndpoint(String),

    /// Endpoint could not be activated
    #[error("Failed to activate endpoint '{endpoint}': {reason}")]
    ActivationFailed { endpoint: String, reason: String },

    /// The negotiated mix format cannot be used
    #[error("Unsupported mix format: {0}")]
    UnsupportedFormat(String),

    /// Operation is only valid while the device is stopped
    #[error("Cannot {0} while the audio device is running")]
    DeviceRunning(&'static str),

    /// Processing attempted with a format other than 32-bit float
    #[error("Sample format {0:?} does not match the configured float samples")]
    SampleFormatMismatch(SampleFormat),

    /// Hardware stream initialisation failed
    #[error("Failed to initialize audio stream: {0}")]
    StreamInitFailed(String),

    /// Render or capture service could not be retrieved
    #[error("Failed to get {0} service")]
    ServiceUnavailable(Direction),

    /// Hardware buffer size could not be read
    #[error("Failed to query buffer size: {0}")]
    BufferSizeFailed(String),

    /// Wait signal could not be created or armed
    #[error("Wait signal error: {0}")]
    WaitSignalFailed(String),

    /// Hardware stream refused to start
    #[error("Failed to start audio stream: {0}")]
    StreamStartFailed(String),

    /// Processing thread could not be spawned
    #[error("Failed to spawn processing thread: {0}")]
    ThreadSpawnFailed(#[from] std::io::Error),

    /// Device-change subscription failed
    #[error("Failed to subscribe to device notifications: {0}")]
    SubscriptionFailed(String),

    /// Generic backend call failure
    #[error("{backend} error: {message}")]
    Backend {
        backend: &'static str,
        message: String,
    },

    /// No backend exists for this platform
    #[error("Not supported: {0}")]
    NotSupported(String),
}

impl AudioError {
    /// Build a generic backend error
    pub fn backend(backend: &'static str, message: impl Into<String>) -> Self {
        Self::Backend {
            backend,
            message: message.into(),
        }
    }

    /// Whether the caller can reasonably retry, e.g. with another buffer size
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::StreamInitFailed(_)
                | Self::ServiceUnavailable(_)
                | Self::BufferSizeFailed(_)
                | Self::WaitSignalFailed(_)
                | Self::StreamStartFailed(_)
                | Self::ThreadSpawnFailed(_)
                | Self::Backend { .. }
        )
    }

    /// Whether the error comes from calling the API in the wrong state
    pub fn is_misuse(&self) -> bool {
        matches!(
            self,
            Self::DeviceRunning(_) | Self::SampleFormatMismatch(_)
        )
    }
}

/// Result type for audio operations
pub type AudioResult<T> = Result<T, AudioError>;
