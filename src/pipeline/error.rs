//! Per-window processing errors for the classification worker.

use crate::error::SoundwatchError;
use std::fmt;

/// Outcome of a failed processing step.
#[derive(Debug)]
pub enum StationError {
    /// The window is lost; processing continues with the next one.
    Recoverable(SoundwatchError),
    /// The worker must stop and the pipeline fails.
    Fatal(SoundwatchError),
}

impl StationError {
    pub fn error(&self) -> &SoundwatchError {
        match self {
            StationError::Recoverable(e) | StationError::Fatal(e) => e,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, StationError::Fatal(_))
    }
}

impl fmt::Display for StationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StationError::Recoverable(e) => write!(f, "Recoverable error: {}", e),
            StationError::Fatal(e) => write!(f, "Fatal error: {}", e),
        }
    }
}

impl std::error::Error for StationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.error())
    }
}
