//! Error types for soundwatch.

use serde::Serialize;
use thiserror::Error;

/// Fault taxonomy surfaced to the application layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Microphone access was denied or revoked.
    Permission,
    /// The input device is missing, lost or interrupted.
    Device,
    /// Incoming frames were discarded because the ring buffer was full.
    BufferOverrun,
    /// Unread frames were overwritten before the classifier reached them.
    BufferUnderrun,
    /// A single classifier invocation failed.
    ClassifierInvocation,
    /// The classification model could not be loaded.
    ModelLoad,
    /// The operation is not valid in the current pipeline state.
    State,
    /// The audio callback received malformed input or faulted internally.
    Capture,
    /// Invalid configuration.
    Config,
    /// Anything else.
    Other,
}

#[derive(Error, Debug)]
pub enum SoundwatchError {
    // Audio input errors
    #[error("Microphone permission denied: {message}")]
    PermissionDenied { message: String },

    #[error("Audio device unavailable: {device}")]
    DeviceUnavailable { device: String },

    #[error("Audio device lost: {message}")]
    DeviceLost { message: String },

    #[error("Audio capture error: {message}")]
    AudioCapture { message: String },

    #[error("Audio format mismatch: expected {expected}, got {actual}")]
    AudioFormatMismatch { expected: String, actual: String },

    // Classification errors
    #[error("Failed to load classification model: {message}")]
    ModelLoad { message: String },

    #[error("Classifier invocation failed: {message}")]
    ClassifierInvocation { message: String },

    #[error("Classifier returned invalid scores: {message}")]
    InvalidScores { message: String },

    // Lifecycle errors
    #[error("Invalid operation in state {state}: {message}")]
    InvalidState { state: String, message: String },

    // Configuration errors
    #[error("Invalid configuration value for {key}: {message}")]
    ConfigInvalidValue { key: String, message: String },

    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    // General I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl SoundwatchError {
    /// Maps this error onto the fault taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SoundwatchError::PermissionDenied { .. } => ErrorKind::Permission,
            SoundwatchError::DeviceUnavailable { .. }
            | SoundwatchError::DeviceLost { .. }
            | SoundwatchError::AudioCapture { .. }
            | SoundwatchError::AudioFormatMismatch { .. } => ErrorKind::Device,
            SoundwatchError::ModelLoad { .. } => ErrorKind::ModelLoad,
            SoundwatchError::ClassifierInvocation { .. } | SoundwatchError::InvalidScores { .. } => {
                ErrorKind::ClassifierInvocation
            }
            SoundwatchError::InvalidState { .. } => ErrorKind::State,
            SoundwatchError::ConfigInvalidValue { .. } | SoundwatchError::Config(_) => {
                ErrorKind::Config
            }
            SoundwatchError::Io(_) | SoundwatchError::Other(_) => ErrorKind::Other,
        }
    }

    /// Whether the pipeline can keep running after this error.
    ///
    /// Device loss is recoverable (the pipeline goes Interrupted); a device that is
    /// unavailable at start is not.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SoundwatchError::DeviceLost { .. }
                | SoundwatchError::ClassifierInvocation { .. }
                | SoundwatchError::InvalidScores { .. }
                | SoundwatchError::InvalidState { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, SoundwatchError>;
