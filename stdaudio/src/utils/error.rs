//! Application-level error handling
//!
//! Aggregates the audio and config errors behind one `AppError` with
//! stable error codes, user-facing messages and recovery hints.
//!
//! # Example
//!
//! ```
//! use stdaudio::audio::{AudioError, Direction};
//! use stdaudio::utils::error::{AppError, ErrorCode};
//!
//! let err = AppError::from(AudioError::DeviceNotFound(Direction::Output));
//! assert_eq!(err.code(), ErrorCode::AudioDeviceNotFound);
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::audio::error::AudioError;
use crate::config::ConfigError;

/// Application error type
#[derive(Error, Debug)]
pub enum AppError {
    /// Audio error
    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    /// Config error
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Stable error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Audio
    /// No endpoint or no default endpoint
    AudioDeviceNotFound,
    /// Endpoint could not be activated or validated
    AudioDeviceUnusable,
    /// Mix format cannot be used
    AudioFormatUnsupported,
    /// Hardware stream failed to come up
    AudioStreamStartFailed,
    /// API called in the wrong device state
    AudioDeviceBusy,
    /// Platform enumerator or backend missing
    AudioBackendUnavailable,
    /// Notification subscription failed
    AudioNotificationFailed,

    // Config
    /// Config file could not be read or written
    ConfigIoFailed,
    /// Config file is not valid JSON
    ConfigParseFailed,
    /// Config value out of range
    ConfigInvalid,

    // General
    /// Internal error
    InternalError,
}

/// Error details for display
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorContext {
    pub code: ErrorCode,
    /// User-facing message
    pub message: String,
    /// Full error text for logs
    pub detail: Option<String>,
    pub recovery_hint: Option<String>,
    pub recoverable: bool,
}

impl ErrorContext {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            detail: None,
            recovery_hint: None,
            recoverable: true,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_recovery_hint(mut self, hint: impl Into<String>) -> Self {
        self.recovery_hint = Some(hint.into());
        self
    }

    pub fn not_recoverable(mut self) -> Self {
        self.recoverable = false;
        self
    }
}

impl AppError {
    /// Error code
    pub fn code(&self) -> ErrorCode {
        match self {
            AppError::Audio(AudioError::DeviceNotFound(_)) => ErrorCode::AudioDeviceNotFound,
            AppError::Audio(AudioError::InvalidEndpoint(_))
            | AppError::Audio(AudioError::ActivationFailed { .. }) => {
                ErrorCode::AudioDeviceUnusable
            }
            AppError::Audio(AudioError::UnsupportedFormat(_))
            | AppError::Audio(AudioError::SampleFormatMismatch(_)) => {
                ErrorCode::AudioFormatUnsupported
            }
            AppError::Audio(AudioError::DeviceRunning(_)) => ErrorCode::AudioDeviceBusy,
            AppError::Audio(AudioError::EnumeratorUnavailable(_))
            | AppError::Audio(AudioError::NotSupported(_)) => ErrorCode::AudioBackendUnavailable,
            AppError::Audio(AudioError::SubscriptionFailed(_)) => {
                ErrorCode::AudioNotificationFailed
            }
            AppError::Audio(_) => ErrorCode::AudioStreamStartFailed,

            AppError::Config(ConfigError::Io(_)) => ErrorCode::ConfigIoFailed,
            AppError::Config(ConfigError::Json(_)) => ErrorCode::ConfigParseFailed,
            AppError::Config(ConfigError::Invalid(_)) => ErrorCode::ConfigInvalid,

            AppError::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Message suitable for showing to a user
    pub fn user_message(&self) -> String {
        match self.code() {
            ErrorCode::AudioDeviceNotFound => "No audio device found".to_string(),
            ErrorCode::AudioDeviceUnusable => "The audio device cannot be opened".to_string(),
            ErrorCode::AudioFormatUnsupported => {
                "The audio device uses an unsupported format".to_string()
            }
            ErrorCode::AudioStreamStartFailed => "Audio streaming could not start".to_string(),
            ErrorCode::AudioDeviceBusy => "Stop the audio device before changing it".to_string(),
            ErrorCode::AudioBackendUnavailable => "Audio is not available on this system".to_string(),
            ErrorCode::AudioNotificationFailed => {
                "Device change notifications are unavailable".to_string()
            }
            ErrorCode::ConfigIoFailed => "Cannot access the config file".to_string(),
            ErrorCode::ConfigParseFailed => "The config file is malformed".to_string(),
            ErrorCode::ConfigInvalid => "The config file contains an invalid value".to_string(),
            ErrorCode::InternalError => match self {
                AppError::Internal(msg) => format!("Internal error: {msg}"),
                _ => "Internal error".to_string(),
            },
        }
    }

    /// Recovery hint, if there is a useful one
    pub fn recovery_hint(&self) -> Option<String> {
        match self {
            AppError::Audio(AudioError::DeviceNotFound(direction)) => Some(format!(
                "Connect an {direction} device and select it as the system default"
            )),
            AppError::Audio(AudioError::BufferSizeFailed(_))
            | AppError::Audio(AudioError::StreamInitFailed(_)) => {
                Some("Retry with a different buffer size".to_string())
            }
            AppError::Audio(AudioError::DeviceRunning(_)) => {
                Some("Call stop() before reconfiguring the device".to_string())
            }
            AppError::Config(ConfigError::Json(_)) | AppError::Config(ConfigError::Invalid(_)) => {
                Some("Fix or delete the config file to fall back to defaults".to_string())
            }
            _ => None,
        }
    }

    /// Full error context
    pub fn context(&self) -> ErrorContext {
        let mut ctx = ErrorContext::new(self.code(), self.user_message()).with_detail(self.to_string());
        ctx.recovery_hint = self.recovery_hint();

        if !self.is_recoverable() {
            ctx = ctx.not_recoverable();
        }
        ctx
    }

    /// Whether retrying (possibly with other settings) can succeed
    pub fn is_recoverable(&self) -> bool {
        match self {
            AppError::Audio(e) => e.is_recoverable(),
            AppError::Config(ConfigError::Io(_)) => true,
            AppError::Config(_) | AppError::Internal(_) => false,
        }
    }
}

/// Application result type
pub type AppResult<T> = Result<T, AppError>;

impl From<String> for AppError {
    fn from(msg: String) -> Self {
        AppError::Internal(msg)
    }
}

impl From<&str> for AppError {
    fn from(msg: &str) -> Self {
        AppError::Internal(msg.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::types::Direction;

    #[test]
    fn test_error_code() {
        let err = AppError::Audio(AudioError::DeviceNotFound(Direction::Input));
        assert_eq!(err.code(), ErrorCode::AudioDeviceNotFound);

        let err = AppError::Audio(AudioError::DeviceRunning("connect a callback"));
        assert_eq!(err.code(), ErrorCode::AudioDeviceBusy);

        let err = AppError::Audio(AudioError::StreamStartFailed("test".to_string()));
        assert_eq!(err.code(), ErrorCode::AudioStreamStartFailed);

        let err = AppError::Config(ConfigError::Invalid("test".to_string()));
        assert_eq!(err.code(), ErrorCode::ConfigInvalid);
    }

    #[test]
    fn test_error_context() {
        let err = AppError::Audio(AudioError::BufferSizeFailed("misaligned".to_string()));
        let ctx = err.context();

        assert_eq!(ctx.code, ErrorCode::AudioStreamStartFailed);
        assert!(!ctx.message.is_empty());
        assert!(ctx.detail.as_deref().is_some_and(|d| d.contains("misaligned")));
        assert!(ctx.recovery_hint.is_some());
        assert!(ctx.recoverable);
    }

    #[test]
    fn test_recoverable() {
        let err = AppError::Audio(AudioError::StreamInitFailed("test".to_string()));
        assert!(err.is_recoverable());

        let err = AppError::Audio(AudioError::EnumeratorUnavailable("test".to_string()));
        assert!(!err.is_recoverable());

        let err = AppError::Audio(AudioError::DeviceRunning("connect a callback"));
        assert!(!err.is_recoverable());

        let err = AppError::Internal("fatal".to_string());
        assert!(!err.is_recoverable());
        assert!(!err.context().recoverable);
    }

    #[test]
    fn test_from_string() {
        let err: AppError = "test error".into();
        match err {
            AppError::Internal(msg) => assert_eq!(msg, "test error"),
            _ => panic!("Expected Internal error"),
        }
    }

    #[test]
    fn test_error_code_serialization() {
        let code = ErrorCode::AudioDeviceNotFound;
        let json = serde_json::to_string(&code).unwrap();
        assert_eq!(json, "\"AUDIO_DEVICE_NOT_FOUND\"");

        let deserialized: ErrorCode = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized, code);
    }
}
