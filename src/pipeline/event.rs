//! Events delivered to the application layer.

use crate::classify::result::ClassificationResult;
use crate::error::{ErrorKind, SoundwatchError};
use crate::pipeline::state::PipelineState;
use std::time::Instant;

/// A lifecycle transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    pub from: PipelineState,
    pub to: PipelineState,
    pub at: Instant,
}

/// A fault report. Every fault in the pipeline produces exactly one.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorEvent {
    pub kind: ErrorKind,
    pub message: String,
    pub recoverable: bool,
    pub at: Instant,
    /// Reports of this kind folded into this event while the queue was full.
    pub occurrences: u64,
}

impl ErrorEvent {
    pub fn new(kind: ErrorKind, message: impl Into<String>, recoverable: bool, at: Instant) -> Self {
        Self {
            kind,
            message: message.into(),
            recoverable,
            at,
            occurrences: 1,
        }
    }

    /// Folds a later report of the same kind into this one, keeping its message and time.
    pub(crate) fn absorb(&mut self, later: ErrorEvent) {
        self.occurrences += later.occurrences;
        self.message = later.message;
        self.at = later.at;
    }

    /// Report `error` with its default recoverability.
    pub fn from_error(error: &SoundwatchError, at: Instant) -> Self {
        Self::new(error.kind(), error.to_string(), error.is_recoverable(), at)
    }

    /// Report `error` as fatal to the pipeline instance.
    pub fn fatal(error: &SoundwatchError, at: Instant) -> Self {
        Self::new(error.kind(), error.to_string(), false, at)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    Result(ClassificationResult),
    State(StateChange),
    Error(ErrorEvent),
}

impl PipelineEvent {
    pub fn is_result(&self) -> bool {
        matches!(self, PipelineEvent::Result(_))
    }

    /// Calls the matching subscriber hook.
    pub fn deliver_to<S: Subscriber + ?Sized>(&self, subscriber: &mut S) {
        match self {
            PipelineEvent::Result(result) => subscriber.on_result(result),
            PipelineEvent::State(change) => subscriber.on_state(change),
            PipelineEvent::Error(error) => subscriber.on_error(error),
        }
    }
}

/// Receives pipeline events on the delivery context the application chooses.
pub trait Subscriber {
    fn on_result(&mut self, _result: &ClassificationResult) {}
    fn on_state(&mut self, _change: &StateChange) {}
    fn on_error(&mut self, _error: &ErrorEvent) {}
}

/// Subscriber that records everything it receives.
#[derive(Debug, Clone, Default)]
pub struct EventCollector {
    pub results: Vec<ClassificationResult>,
    pub states: Vec<StateChange>,
    pub errors: Vec<ErrorEvent>,
}

impl EventCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Target states in delivery order.
    pub fn transitions(&self) -> Vec<PipelineState> {
        self.states.iter().map(|c| c.to).collect()
    }
}

impl Subscriber for EventCollector {
    fn on_result(&mut self, result: &ClassificationResult) {
        self.results.push(result.clone());
    }

    fn on_state(&mut self, change: &StateChange) {
        self.states.push(*change);
    }

    fn on_error(&mut self, error: &ErrorEvent) {
        self.errors.push(error.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_error_keeps_kind_and_recoverability() {
        let now = Instant::now();
        let error = SoundwatchError::ClassifierInvocation {
            message: "timeout".to_string(),
        };
        let event = ErrorEvent::from_error(&error, now);
        assert_eq!(event.kind, ErrorKind::ClassifierInvocation);
        assert!(event.recoverable);
        assert!(event.message.contains("timeout"));

        let fatal = ErrorEvent::fatal(&error, now);
        assert!(!fatal.recoverable);
    }

    #[test]
    fn test_deliver_to_routes_by_kind() {
        let now = Instant::now();
        let mut collector = EventCollector::new();
        PipelineEvent::State(StateChange {
            from: PipelineState::Idle,
            to: PipelineState::Starting,
            at: now,
        })
        .deliver_to(&mut collector);
        PipelineEvent::Error(ErrorEvent::new(ErrorKind::Device, "lost", true, now))
            .deliver_to(&mut collector);

        assert_eq!(collector.transitions(), vec![PipelineState::Starting]);
        assert_eq!(collector.errors.len(), 1);
        assert!(collector.results.is_empty());
    }

    #[test]
    fn test_subscriber_hooks_default_to_noop() {
        struct OnlyErrors(u32);
        impl Subscriber for OnlyErrors {
            fn on_error(&mut self, _error: &ErrorEvent) {
                self.0 += 1;
            }
        }

        let now = Instant::now();
        let mut subscriber = OnlyErrors(0);
        PipelineEvent::State(StateChange {
            from: PipelineState::Idle,
            to: PipelineState::Starting,
            at: now,
        })
        .deliver_to(&mut subscriber);
        PipelineEvent::Error(ErrorEvent::new(ErrorKind::State, "already active", true, now))
            .deliver_to(&mut subscriber);
        assert_eq!(subscriber.0, 1);
    }
}
