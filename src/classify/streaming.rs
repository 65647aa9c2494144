//! Streaming classifier: turns the ring buffer into a sequence of results.
//!
//! Windows of N frames are copied out with `try_peek(N)` and the read cursor
//! then moves by the hop H, so consecutive windows share N-H frames. The
//! worker runs on its own thread and never waits on the audio callback: when a
//! full window is not there yet it sleeps for the poll interval and retries.

use crate::audio::capture::{CaptureStats, CaptureStatsHandle};
use crate::audio::frame::ClassificationWindow;
use crate::audio::ring_buffer::RingConsumer;
use crate::classify::classifier::Classifier;
use crate::classify::result::ClassificationResult;
use crate::config::{OverflowPolicy, PipelineConfig};
use crate::error::{ErrorKind, SoundwatchError};
use crate::pipeline::clock::Clock;
use crate::pipeline::dispatcher::ResultDispatcher;
use crate::pipeline::error::StationError;
use crate::pipeline::event::ErrorEvent;
use crate::pipeline::state::{PipelineState, StateCell};
use crossbeam_channel::Sender;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Cumulative classification counters, shared with the controller.
#[derive(Debug, Default)]
pub struct ClassifierCounters {
    delivered: AtomicU64,
    suppressed: AtomicU64,
    failures: AtomicU64,
    frames_dropped: AtomicU64,
}

/// Snapshot of [`ClassifierCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ClassifierStats {
    /// Results accepted by the dispatcher.
    pub delivered: u64,
    /// Results below the minimum confidence.
    pub suppressed: u64,
    /// Failed classifier invocations, including invalid scores.
    pub failures: u64,
    /// Frames lost to the ring buffer's overflow policy.
    pub frames_dropped: u64,
}

impl ClassifierCounters {
    pub fn snapshot(&self) -> ClassifierStats {
        ClassifierStats {
            delivered: self.delivered.load(Ordering::Relaxed),
            suppressed: self.suppressed.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
        }
    }
}

/// What one `step` did.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// Fewer than N frames buffered.
    Pending,
    /// A result at or above the minimum confidence.
    Classified(ClassificationResult),
    /// A result below the minimum confidence; the window still advanced.
    Suppressed(ClassificationResult),
}

/// Sent to the controller when the worker gives up.
#[derive(Debug)]
pub struct WorkerNotice {
    pub session: u64,
    pub error: SoundwatchError,
}

pub struct StreamingClassifier {
    consumer: RingConsumer,
    classifier: Box<dyn Classifier>,
    window_frames: usize,
    hop_frames: usize,
    sample_rate: u32,
    min_confidence: f32,
    max_consecutive_failures: u32,
    consecutive_failures: u32,
    counters: Arc<ClassifierCounters>,
    capture: Option<CaptureStatsHandle>,
    capture_seen: CaptureStats,
    session: u64,
}

impl StreamingClassifier {
    pub fn new(
        consumer: RingConsumer,
        classifier: Box<dyn Classifier>,
        config: &PipelineConfig,
        counters: Arc<ClassifierCounters>,
    ) -> Self {
        Self {
            consumer,
            classifier,
            window_frames: config.window_frames,
            hop_frames: config.hop_frames,
            sample_rate: config.sample_rate,
            min_confidence: config.min_confidence,
            max_consecutive_failures: config.max_consecutive_failures,
            consecutive_failures: 0,
            counters,
            capture: None,
            capture_seen: CaptureStats::default(),
            session: 0,
        }
    }

    /// Stamp results with `session`.
    pub fn with_session(mut self, session: u64) -> Self {
        self.session = session;
        self
    }

    /// Report capture faults seen by `handle` alongside buffer telemetry.
    pub fn with_capture_stats(mut self, handle: CaptureStatsHandle) -> Self {
        self.capture_seen = handle.snapshot();
        self.capture = Some(handle);
        self
    }

    pub fn model_name(&self) -> &str {
        self.classifier.model_name()
    }

    /// Next frame index a window would start at.
    pub fn position(&self) -> u64 {
        self.consumer.position()
    }

    /// Classifies the next window if one is available.
    ///
    /// Invocation failures and invalid scores are `Recoverable` until
    /// `max_consecutive_failures` happen in a row, which is `Fatal`.
    pub fn step(&mut self) -> Result<StepOutcome, StationError> {
        let Some(block) = self.consumer.try_peek(self.window_frames) else {
            return Ok(StepOutcome::Pending);
        };
        self.consumer.advance(self.hop_frames);
        let window = ClassificationWindow::new(block, self.sample_rate);

        let outcome = self
            .classifier
            .classify(&window)
            .and_then(|scores| ClassificationResult::from_scores(&window, scores))
            .map(|result| result.in_session(self.session));

        match outcome {
            Ok(result) => {
                self.consecutive_failures = 0;
                if result.confidence() < self.min_confidence {
                    self.counters.suppressed.fetch_add(1, Ordering::Relaxed);
                    Ok(StepOutcome::Suppressed(result))
                } else {
                    Ok(StepOutcome::Classified(result))
                }
            }
            Err(error) => {
                self.consecutive_failures += 1;
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                if self.consecutive_failures >= self.max_consecutive_failures {
                    Err(StationError::Fatal(SoundwatchError::ClassifierInvocation {
                        message: format!(
                            "{} consecutive failures, last: {}",
                            self.consecutive_failures, error
                        ),
                    }))
                } else {
                    Err(StationError::Recoverable(error))
                }
            }
        }
    }

    /// Collects drop and capture-fault telemetry since the last call.
    pub fn take_telemetry(&mut self, clock: &dyn Clock) -> Vec<ErrorEvent> {
        let mut events = Vec::new();

        let report = self.consumer.take_drop_report();
        if !report.is_empty() {
            self.counters
                .frames_dropped
                .fetch_add(report.frames, Ordering::Relaxed);
            let (kind, what) = match self.consumer.policy() {
                OverflowPolicy::DropNewest => (ErrorKind::BufferOverrun, "incoming frames discarded"),
                OverflowPolicy::DropOldest => (ErrorKind::BufferUnderrun, "unread frames overwritten"),
            };
            events.push(ErrorEvent::new(
                kind,
                format!("{} {} in {} writes", report.frames, what, report.incidents),
                true,
                clock.now(),
            ));
        }

        if let Some(handle) = &self.capture {
            let now = handle.snapshot();
            let malformed = now.malformed - self.capture_seen.malformed;
            let faults = now.faults - self.capture_seen.faults;
            if malformed > 0 || faults > 0 {
                events.push(ErrorEvent::new(
                    ErrorKind::Capture,
                    format!("{} malformed buffers, {} callback faults", malformed, faults),
                    true,
                    clock.now(),
                ));
            }
            self.capture_seen = now;
        }

        events
    }
}

/// Everything the worker thread needs besides the classifier itself.
pub struct WorkerContext {
    pub session: u64,
    pub state: Arc<StateCell>,
    pub dispatcher: Arc<ResultDispatcher>,
    pub notices: Sender<WorkerNotice>,
    pub clock: Arc<dyn Clock>,
    pub poll_interval: Duration,
}

/// Runs a [`StreamingClassifier`] on a dedicated thread.
pub struct ClassifierRunner {
    handle: Option<JoinHandle<()>>,
}

impl ClassifierRunner {
    pub fn spawn(classifier: StreamingClassifier, ctx: WorkerContext) -> std::io::Result<Self> {
        let handle = thread::Builder::new()
            .name("soundwatch-classifier".to_string())
            .spawn(move || run_worker(classifier, ctx))?;
        Ok(Self {
            handle: Some(handle),
        })
    }

    /// Waits for the worker to exit.
    pub fn join(mut self) -> Result<(), String> {
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| "classifier thread panicked".to_string()),
            None => Ok(()),
        }
    }
}

/// Worker loop. Idles while the pipeline is `Starting` or `Interrupted` and
/// exits at the first iteration boundary in any other non-running state, or
/// after a fatal error.
fn run_worker(mut classifier: StreamingClassifier, ctx: WorkerContext) {
    tracing::debug!(
        session = ctx.session,
        model = classifier.model_name(),
        "classifier worker started"
    );

    loop {
        match ctx.state.load() {
            PipelineState::Running => {}
            PipelineState::Starting | PipelineState::Interrupted => {
                thread::sleep(ctx.poll_interval);
                continue;
            }
            _ => break,
        }

        for event in classifier.take_telemetry(ctx.clock.as_ref()) {
            tracing::warn!(kind = ?event.kind, "{}", event.message);
            ctx.dispatcher.post_error(event);
        }

        match classifier.step() {
            Ok(StepOutcome::Pending) => thread::sleep(ctx.poll_interval),
            Ok(StepOutcome::Classified(result)) => {
                if ctx.dispatcher.post_result(result) {
                    classifier.counters.delivered.fetch_add(1, Ordering::Relaxed);
                }
            }
            Ok(StepOutcome::Suppressed(result)) => {
                tracing::trace!(confidence = result.confidence(), "result suppressed");
            }
            Err(StationError::Recoverable(error)) => {
                tracing::warn!(session = ctx.session, "classification failed: {error}");
                ctx.dispatcher
                    .post_error(ErrorEvent::from_error(&error, ctx.clock.now()));
            }
            Err(StationError::Fatal(error)) => {
                tracing::error!(session = ctx.session, "classifier giving up: {error}");
                if ctx
                    .notices
                    .send(WorkerNotice {
                        session: ctx.session,
                        error,
                    })
                    .is_err()
                {
                    tracing::debug!("controller gone before fatal notice");
                }
                break;
            }
        }
    }

    tracing::debug!(session = ctx.session, "classifier worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::ring_buffer::{RingProducer, SampleRingBuffer};
    use crate::classify::classifier::{LabelScore, MockClassifier};
    use crate::pipeline::clock::SystemClock;

    fn config(window: usize, hop: usize) -> PipelineConfig {
        PipelineConfig {
            window_frames: window,
            hop_frames: hop,
            ring_capacity_frames: (window + hop) * 4,
            max_consecutive_failures: 3,
            ..PipelineConfig::default()
        }
    }

    fn build(
        config: &PipelineConfig,
        classifier: MockClassifier,
    ) -> (RingProducer, StreamingClassifier, Arc<ClassifierCounters>) {
        let (producer, consumer) = SampleRingBuffer::new(
            config.ring_capacity_frames,
            config.channel_count,
            config.overflow_policy,
        )
        .split();
        let counters = Arc::new(ClassifierCounters::default());
        let streaming =
            StreamingClassifier::new(consumer, Box::new(classifier), config, Arc::clone(&counters));
        (producer, streaming, counters)
    }

    fn classified(outcome: Result<StepOutcome, StationError>) -> ClassificationResult {
        match outcome {
            Ok(StepOutcome::Classified(result)) => result,
            other => panic!("Expected a classified window, got {other:?}"),
        }
    }

    #[test]
    fn test_pending_until_full_window() {
        let config = config(100, 50);
        let (mut producer, mut streaming, _) = build(&config, MockClassifier::new("silence", 0.99));
        producer.write(&[0.0; 99]);
        assert_eq!(streaming.step().unwrap(), StepOutcome::Pending);
        producer.write(&[0.0; 1]);
        classified(streaming.step());
    }

    #[test]
    fn test_results_carry_session() {
        let config = config(100, 100);
        let (mut producer, streaming, _) = build(&config, MockClassifier::new("silence", 0.99));
        let mut streaming = streaming.with_session(7);
        producer.write(&[0.0; 100]);
        assert_eq!(classified(streaming.step()).session, 7);
    }

    #[test]
    fn test_consecutive_windows_overlap_by_window_minus_hop() {
        let config = config(100, 40);
        let (mut producer, mut streaming, _) = build(&config, MockClassifier::new("silence", 0.99));
        producer.write(&[0.0; 300]);

        let first = classified(streaming.step());
        let second = classified(streaming.step());
        assert_eq!(first.start_frame, 0);
        assert_eq!(second.start_frame, 40);
        assert_eq!(first.end_frame() - second.start_frame, 60);
        assert!(second.window_start > first.window_start);
    }

    #[test]
    fn test_window_count_matches_hop_formula() {
        let config = config(1600, 800);
        let (mut producer, mut streaming, _) = build(&config, MockClassifier::new("silence", 0.99));

        let mut results = 0;
        let mut fed = 0;
        while fed < 80_000 {
            producer.write(&[0.0; 800]);
            fed += 800;
            while let StepOutcome::Classified(_) = streaming.step().unwrap() {
                results += 1;
            }
        }
        assert_eq!(results, (80_000 - 1600) / 800 + 1);
    }

    #[test]
    fn test_low_confidence_is_suppressed_but_advances() {
        let config = PipelineConfig {
            min_confidence: 0.5,
            ..config(10, 10)
        };
        let (mut producer, mut streaming, counters) = build(&config, MockClassifier::new("hum", 0.2));
        producer.write(&[0.0; 20]);

        assert!(matches!(streaming.step(), Ok(StepOutcome::Suppressed(_))));
        assert_eq!(streaming.position(), 10);
        assert!(matches!(streaming.step(), Ok(StepOutcome::Suppressed(_))));
        assert_eq!(streaming.step().unwrap(), StepOutcome::Pending);
        assert_eq!(counters.snapshot().suppressed, 2);
    }

    #[test]
    fn test_single_failure_is_recoverable_and_skips_window() {
        let config = config(10, 10);
        let classifier = MockClassifier::new("silence", 0.99).with_failures_at([1]);
        let (mut producer, mut streaming, counters) = build(&config, classifier);
        producer.write(&[0.0; 30]);

        assert_eq!(classified(streaming.step()).start_frame, 0);
        assert!(matches!(streaming.step(), Err(StationError::Recoverable(_))));
        assert_eq!(classified(streaming.step()).start_frame, 20);
        assert_eq!(counters.snapshot().failures, 1);
    }

    #[test]
    fn test_consecutive_failures_escalate_to_fatal() {
        let config = config(10, 10);
        let classifier = MockClassifier::new("x", 1.0).with_permanent_failure();
        let (mut producer, mut streaming, _) = build(&config, classifier);
        producer.write(&[0.0; 50]);

        assert!(matches!(streaming.step(), Err(StationError::Recoverable(_))));
        assert!(matches!(streaming.step(), Err(StationError::Recoverable(_))));
        match streaming.step() {
            Err(StationError::Fatal(SoundwatchError::ClassifierInvocation { message })) => {
                assert!(message.starts_with("3 consecutive failures"), "{message}");
            }
            other => panic!("Expected fatal escalation, got {other:?}"),
        }
    }

    #[test]
    fn test_success_resets_failure_streak() {
        let config = config(10, 10);
        let classifier = MockClassifier::new("x", 1.0).with_failures_at([0, 1, 3, 4]);
        let (mut producer, mut streaming, _) = build(&config, classifier);
        producer.write(&[0.0; 60]);

        for _ in 0..6 {
            if let Err(error) = streaming.step() {
                assert!(!error.is_fatal(), "streak should have been reset");
            }
        }
    }

    #[test]
    fn test_invalid_scores_count_as_failure() {
        let config = config(10, 10);
        let classifier = MockClassifier::with_scores(vec![LabelScore::new("x", f32::NAN)]);
        let (mut producer, mut streaming, _) = build(&config, classifier);
        producer.write(&[0.0; 10]);

        match streaming.step() {
            Err(StationError::Recoverable(SoundwatchError::InvalidScores { .. })) => {}
            other => panic!("Expected invalid scores, got {other:?}"),
        }
    }

    #[test]
    fn test_telemetry_reports_overrun_for_drop_newest() {
        let config = PipelineConfig {
            overflow_policy: OverflowPolicy::DropNewest,
            ..config(10, 5)
        };
        let (mut producer, mut streaming, counters) =
            build(&config, MockClassifier::new("x", 1.0));
        producer.write(&vec![0.0; config.ring_capacity_frames + 7]);

        let events = streaming.take_telemetry(&SystemClock);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, ErrorKind::BufferOverrun);
        assert!(events[0].recoverable);
        assert_eq!(counters.snapshot().frames_dropped, 7);
        assert!(streaming.take_telemetry(&SystemClock).is_empty());
    }

    #[test]
    fn test_telemetry_reports_underrun_for_drop_oldest() {
        let config = config(10, 5);
        let (mut producer, mut streaming, _) = build(&config, MockClassifier::new("x", 1.0));
        producer.write(&vec![0.0; config.ring_capacity_frames + 3]);

        let events = streaming.take_telemetry(&SystemClock);
        assert_eq!(events[0].kind, ErrorKind::BufferUnderrun);
    }

    #[test]
    fn test_worker_exits_when_state_leaves_running() {
        let config = config(10, 10);
        let (mut producer, streaming, counters) =
            build(&config, MockClassifier::new("silence", 0.99));
        let dispatcher = Arc::new(ResultDispatcher::new(64));
        dispatcher.post_state(crate::pipeline::event::StateChange {
            from: PipelineState::Starting,
            to: PipelineState::Running,
            at: std::time::Instant::now(),
        });
        let state = Arc::new(StateCell::new(PipelineState::Running));
        let (notices, _notice_rx) = crossbeam_channel::unbounded();

        producer.write(&[0.0; 30]);
        let runner = ClassifierRunner::spawn(
            streaming,
            WorkerContext {
                session: 1,
                state: Arc::clone(&state),
                dispatcher: Arc::clone(&dispatcher),
                notices,
                clock: Arc::new(SystemClock),
                poll_interval: Duration::from_millis(1),
            },
        )
        .unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while counters.snapshot().delivered < 3 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        state.store(PipelineState::Stopping);
        runner.join().unwrap();
        assert_eq!(counters.snapshot().delivered, 3);
    }

    #[test]
    fn test_worker_sends_fatal_notice() {
        let config = config(10, 10);
        let classifier = MockClassifier::new("x", 1.0).with_permanent_failure();
        let (mut producer, streaming, _) = build(&config, classifier);
        let (notices, notice_rx) = crossbeam_channel::unbounded();
        producer.write(&[0.0; 100]);

        let runner = ClassifierRunner::spawn(
            streaming,
            WorkerContext {
                session: 9,
                state: Arc::new(StateCell::new(PipelineState::Running)),
                dispatcher: Arc::new(ResultDispatcher::new(64)),
                notices,
                clock: Arc::new(SystemClock),
                poll_interval: Duration::from_millis(1),
            },
        )
        .unwrap();

        let notice = notice_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(notice.session, 9);
        runner.join().unwrap();
    }
}
