//! Pipeline lifecycle states.

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Why a pipeline instance entered `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    PermissionDenied,
    DeviceUnavailable,
    FormatMismatch,
    ModelLoad,
    /// Interrupted for longer than the recovery timeout.
    RecoveryTimeout,
    /// The device refused to resume after an interruption.
    RecoveryFailed,
    PermissionRevoked,
    /// Too many consecutive classifier invocation failures.
    ClassifierFailures,
}

impl FailureReason {
    const ALL: [FailureReason; 8] = [
        FailureReason::PermissionDenied,
        FailureReason::DeviceUnavailable,
        FailureReason::FormatMismatch,
        FailureReason::ModelLoad,
        FailureReason::RecoveryTimeout,
        FailureReason::RecoveryFailed,
        FailureReason::PermissionRevoked,
        FailureReason::ClassifierFailures,
    ];
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            FailureReason::PermissionDenied => "permission denied",
            FailureReason::DeviceUnavailable => "device unavailable",
            FailureReason::FormatMismatch => "format mismatch",
            FailureReason::ModelLoad => "model load failed",
            FailureReason::RecoveryTimeout => "recovery timed out",
            FailureReason::RecoveryFailed => "recovery failed",
            FailureReason::PermissionRevoked => "permission revoked",
            FailureReason::ClassifierFailures => "classifier kept failing",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Idle,
    Starting,
    Running,
    Interrupted,
    Stopping,
    Stopped,
    Failed(FailureReason),
}

impl PipelineState {
    /// Holding (or acquiring) the hardware.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            PipelineState::Starting | PipelineState::Running | PipelineState::Interrupted
        )
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, PipelineState::Failed(_))
    }

    fn encode(self) -> u8 {
        match self {
            PipelineState::Idle => 0,
            PipelineState::Starting => 1,
            PipelineState::Running => 2,
            PipelineState::Interrupted => 3,
            PipelineState::Stopping => 4,
            PipelineState::Stopped => 5,
            PipelineState::Failed(reason) => {
                let index = FailureReason::ALL
                    .iter()
                    .position(|r| *r == reason)
                    .unwrap_or(0);
                16 + index as u8
            }
        }
    }

    fn decode(code: u8) -> Self {
        match code {
            0 => PipelineState::Idle,
            1 => PipelineState::Starting,
            2 => PipelineState::Running,
            3 => PipelineState::Interrupted,
            4 => PipelineState::Stopping,
            5 => PipelineState::Stopped,
            n => PipelineState::Failed(
                FailureReason::ALL
                    .get(usize::from(n.saturating_sub(16)))
                    .copied()
                    .unwrap_or(FailureReason::RecoveryFailed),
            ),
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineState::Idle => f.write_str("Idle"),
            PipelineState::Starting => f.write_str("Starting"),
            PipelineState::Running => f.write_str("Running"),
            PipelineState::Interrupted => f.write_str("Interrupted"),
            PipelineState::Stopping => f.write_str("Stopping"),
            PipelineState::Stopped => f.write_str("Stopped"),
            PipelineState::Failed(reason) => write!(f, "Failed({})", reason),
        }
    }
}

/// Lock-free mirror of the controller's state for worker threads.
///
/// Only the controller writes it, always while holding its transition lock.
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl StateCell {
    pub fn new(state: PipelineState) -> Self {
        Self(AtomicU8::new(state.encode()))
    }

    pub fn load(&self) -> PipelineState {
        PipelineState::decode(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, state: PipelineState) {
        self.0.store(state.encode(), Ordering::Release);
    }
}
