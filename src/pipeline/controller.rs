//! Pipeline controller: owns the lifecycle state machine.
//!
//! Every transition happens under one mutex, so concurrent `start`/`stop`
//! calls and device notifications are linearized and each transition is
//! announced exactly once. A supervisor thread consumes device events and
//! worker notices and enforces the recovery deadline while `Interrupted`.
//!
//! ```text
//! Idle ──start──▶ Starting ──ok──▶ Running ◀──restored── Interrupted
//!                    │               │  └──interruption──────▶ │
//!                    ▼               ▼                          ▼
//!                  Failed         Stopping ──▶ Stopped        Failed
//! ```

use crate::audio::capture::{AudioCaptureSession, CaptureStats};
use crate::audio::device::{AudioDevice, DeviceEvent, DeviceEventSender, SessionEvent, StreamFormat};
use crate::audio::ring_buffer::SampleRingBuffer;
use crate::classify::classifier::ClassifierLoader;
use crate::classify::streaming::{
    ClassifierCounters, ClassifierRunner, ClassifierStats, StreamingClassifier, WorkerContext,
    WorkerNotice,
};
use crate::config::PipelineConfig;
use crate::error::{Result, SoundwatchError};
use crate::pipeline::clock::{Clock, SystemClock};
use crate::pipeline::dispatcher::{EventStream, ResultDispatcher};
use crate::pipeline::event::{ErrorEvent, StateChange};
use crate::pipeline::state::{FailureReason, PipelineState, StateCell};
use crossbeam_channel::{Receiver, Sender, bounded, select, unbounded};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// What a control request did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlOutcome {
    /// Capture and classification are running.
    Started,
    /// `start` while already active; nothing changed.
    AlreadyActive,
    /// The pipeline reached `Stopped`.
    Stopped,
    /// `stop` while not active; nothing changed.
    NotActive,
}

/// Point-in-time counters for the whole pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PipelineStats {
    pub state: PipelineState,
    /// Number of `start` calls that reached `Starting`.
    pub sessions: u64,
    pub classifier: ClassifierStats,
    pub capture: CaptureStats,
    /// Results evicted from the dispatch queue.
    pub dropped_results: u64,
}

struct Inner {
    state: PipelineState,
    capture: AudioCaptureSession,
    worker: Option<ClassifierRunner>,
    session: u64,
    recovery_deadline: Option<Instant>,
}

struct Shared {
    config: PipelineConfig,
    cell: Arc<StateCell>,
    dispatcher: Arc<ResultDispatcher>,
    clock: Arc<dyn Clock>,
    loader: Box<dyn ClassifierLoader>,
    counters: Arc<ClassifierCounters>,
    device_tx: Sender<SessionEvent>,
    notice_tx: Sender<WorkerNotice>,
    inner: Mutex<Inner>,
}

/// Drives one capture device and one classifier through the pipeline lifecycle.
///
/// `Failed` is terminal: a failed controller refuses `start` and a new one
/// must be constructed. `Stopped` may be restarted.
pub struct PipelineController {
    shared: Arc<Shared>,
    shutdown: Option<Sender<()>>,
    supervisor: Option<JoinHandle<()>>,
}

impl PipelineController {
    /// Creates an `Idle` controller.
    ///
    /// # Errors
    /// - `ConfigInvalidValue` if `config` fails validation
    /// - `Io` if the supervisor thread cannot be spawned
    pub fn new<D, L>(config: PipelineConfig, device: D, loader: L) -> Result<Self>
    where
        D: AudioDevice + 'static,
        L: ClassifierLoader + 'static,
    {
        Self::with_clock(config, device, loader, Arc::new(SystemClock))
    }

    /// Like [`new`](Self::new) with an injected clock for timestamps and the recovery deadline.
    pub fn with_clock<D, L>(
        config: PipelineConfig,
        device: D,
        loader: L,
        clock: Arc<dyn Clock>,
    ) -> Result<Self>
    where
        D: AudioDevice + 'static,
        L: ClassifierLoader + 'static,
    {
        config.validate()?;

        let format = StreamFormat {
            sample_rate: config.sample_rate,
            channels: config.channel_count,
        };
        let (device_tx, device_rx) = unbounded();
        let (notice_tx, notice_rx) = unbounded();
        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);

        let shared = Arc::new(Shared {
            cell: Arc::new(StateCell::new(PipelineState::Idle)),
            dispatcher: Arc::new(ResultDispatcher::new(config.dispatch_queue_capacity)),
            clock,
            loader: Box::new(loader),
            counters: Arc::new(ClassifierCounters::default()),
            device_tx,
            notice_tx,
            inner: Mutex::new(Inner {
                state: PipelineState::Idle,
                capture: AudioCaptureSession::new(Box::new(device), format),
                worker: None,
                session: 0,
                recovery_deadline: None,
            }),
            config,
        });

        let supervisor_shared = Arc::clone(&shared);
        let supervisor = thread::Builder::new()
            .name("soundwatch-supervisor".to_string())
            .spawn(move || supervise(supervisor_shared, device_rx, notice_rx, shutdown_rx))?;

        Ok(Self {
            shared,
            shutdown: Some(shutdown_tx),
            supervisor: Some(supervisor),
        })
    }

    /// Starts capture and classification.
    ///
    /// Calling `start` while `Starting`, `Running` or `Interrupted` reports a
    /// recoverable state error event and returns `AlreadyActive`.
    ///
    /// # Errors
    /// - `InvalidState` if the pipeline has failed
    /// - the loader's error if the classifier cannot be initialized
    /// - `PermissionDenied`, `DeviceUnavailable` or `AudioFormatMismatch` from capture
    pub fn start(&self) -> Result<ControlOutcome> {
        let shared = &self.shared;
        let mut inner = shared.lock();

        match inner.state {
            PipelineState::Idle | PipelineState::Stopped => {}
            state @ PipelineState::Failed(_) => {
                let error = SoundwatchError::InvalidState {
                    state: state.to_string(),
                    message: "a failed pipeline cannot be restarted".to_string(),
                };
                shared.report(ErrorEvent::from_error(&error, shared.clock.now()));
                return Err(error);
            }
            state => {
                let error = SoundwatchError::InvalidState {
                    state: state.to_string(),
                    message: "pipeline is already active".to_string(),
                };
                tracing::debug!("ignoring start: {error}");
                shared.report(ErrorEvent::from_error(&error, shared.clock.now()));
                return Ok(ControlOutcome::AlreadyActive);
            }
        }

        shared.transition(&mut inner, PipelineState::Starting);
        inner.session += 1;
        let session = inner.session;
        let config = &shared.config;

        let (producer, consumer) = SampleRingBuffer::new(
            config.ring_capacity_frames,
            config.channel_count,
            config.overflow_policy,
        )
        .split();

        let classifier = match shared.loader.load(config) {
            Ok(classifier) => classifier,
            Err(error) => {
                shared.fail(&mut inner, FailureReason::ModelLoad, &error);
                return Err(error);
            }
        };
        tracing::info!(session, model = classifier.model_name(), "classifier loaded");

        let streaming =
            StreamingClassifier::new(consumer, classifier, config, Arc::clone(&shared.counters))
                .with_capture_stats(inner.capture.stats_handle())
                .with_session(session);
        let runner = ClassifierRunner::spawn(
            streaming,
            WorkerContext {
                session,
                state: Arc::clone(&shared.cell),
                dispatcher: Arc::clone(&shared.dispatcher),
                notices: shared.notice_tx.clone(),
                clock: Arc::clone(&shared.clock),
                poll_interval: config.poll_interval(),
            },
        );
        match runner {
            Ok(runner) => inner.worker = Some(runner),
            Err(e) => {
                let error = SoundwatchError::ModelLoad {
                    message: format!("failed to spawn classifier thread: {e}"),
                };
                shared.fail(&mut inner, FailureReason::ModelLoad, &error);
                return Err(error);
            }
        }

        let events = DeviceEventSender::new(session, shared.device_tx.clone());
        if let Err(error) = inner.capture.open(producer, events) {
            let reason = match &error {
                SoundwatchError::PermissionDenied { .. } => FailureReason::PermissionDenied,
                SoundwatchError::AudioFormatMismatch { .. } => FailureReason::FormatMismatch,
                _ => FailureReason::DeviceUnavailable,
            };
            shared.fail(&mut inner, reason, &error);
            return Err(error);
        }

        shared.transition(&mut inner, PipelineState::Running);
        tracing::info!(
            session,
            device = inner.capture.device_name(),
            window = ?config.window_duration(),
            hop = ?config.hop_duration(),
            "pipeline running"
        );
        Ok(ControlOutcome::Started)
    }

    /// Stops capture and classification, releasing the hardware.
    ///
    /// Returns `NotActive` unless the pipeline is `Running` or `Interrupted`.
    /// No result is delivered after the `Stopping` event.
    pub fn stop(&self) -> Result<ControlOutcome> {
        let shared = &self.shared;
        let mut inner = shared.lock();
        if !matches!(
            inner.state,
            PipelineState::Running | PipelineState::Interrupted
        ) {
            return Ok(ControlOutcome::NotActive);
        }

        shared.transition(&mut inner, PipelineState::Stopping);
        inner.recovery_deadline = None;
        if let Err(error) = inner.capture.release() {
            tracing::warn!("failed to release capture device: {error}");
            shared.report(ErrorEvent::from_error(&error, shared.clock.now()));
        }
        shared.join_worker(&mut inner);
        shared.transition(&mut inner, PipelineState::Stopped);
        Ok(ControlOutcome::Stopped)
    }

    pub fn state(&self) -> PipelineState {
        self.shared.cell.load()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.shared.config
    }

    /// Handle for receiving results, state changes and errors.
    pub fn events(&self) -> EventStream {
        EventStream::new(Arc::clone(&self.shared.dispatcher))
    }

    pub fn stats(&self) -> PipelineStats {
        let inner = self.shared.lock();
        PipelineStats {
            state: inner.state,
            sessions: inner.session,
            classifier: self.shared.counters.snapshot(),
            capture: inner.capture.stats(),
            dropped_results: self.shared.dispatcher.dropped_results(),
        }
    }
}

impl Drop for PipelineController {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            tracing::warn!("failed to stop pipeline on drop: {e}");
        }
        self.shutdown.take();
        if let Some(handle) = self.supervisor.take()
            && handle.join().is_err()
        {
            tracing::warn!("supervisor thread panicked");
        }
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, inner: &mut Inner, to: PipelineState) {
        let from = inner.state;
        inner.state = to;
        self.cell.store(to);
        self.dispatcher.post_state(StateChange {
            from,
            to,
            at: self.clock.now(),
        });
        match to {
            PipelineState::Failed(reason) => {
                tracing::error!(session = inner.session, %from, %reason, "pipeline failed")
            }
            _ => tracing::debug!(session = inner.session, %from, %to, "pipeline transition"),
        }
    }

    fn report(&self, event: ErrorEvent) {
        self.dispatcher.post_error(event);
    }

    /// Reports `error` as fatal, enters `Failed` and releases everything.
    fn fail(&self, inner: &mut Inner, reason: FailureReason, error: &SoundwatchError) {
        self.report(ErrorEvent::fatal(error, self.clock.now()));
        self.transition(inner, PipelineState::Failed(reason));
        inner.recovery_deadline = None;
        if let Err(e) = inner.capture.release() {
            tracing::warn!("failed to release capture device: {e}");
        }
        self.join_worker(inner);
    }

    fn join_worker(&self, inner: &mut Inner) {
        if let Some(worker) = inner.worker.take()
            && let Err(e) = worker.join()
        {
            tracing::warn!(session = inner.session, "{e}");
        }
    }

    fn on_device_event(&self, event: SessionEvent) {
        let mut inner = self.lock();
        if event.session != inner.session
            || !matches!(
                inner.state,
                PipelineState::Running | PipelineState::Interrupted
            )
        {
            tracing::debug!(
                session = event.session,
                state = %inner.state,
                "ignoring device event {:?}",
                event.event
            );
            return;
        }

        match (inner.state, event.event) {
            (_, DeviceEvent::PermissionRevoked) => {
                let error = SoundwatchError::PermissionDenied {
                    message: "microphone access was revoked".to_string(),
                };
                self.fail(&mut inner, FailureReason::PermissionRevoked, &error);
            }
            (
                PipelineState::Running,
                DeviceEvent::Interrupted { reason }
                | DeviceEvent::RouteChanged { reason }
                | DeviceEvent::Lost { reason },
            ) => {
                let error = SoundwatchError::DeviceLost { message: reason };
                tracing::warn!(session = inner.session, "{error}");
                let now = self.clock.now();
                self.report(ErrorEvent::from_error(&error, now));
                self.transition(&mut inner, PipelineState::Interrupted);
                inner.recovery_deadline = Some(now + self.config.recovery_timeout());
                if let Err(error) = inner.capture.suspend() {
                    self.fail(&mut inner, FailureReason::RecoveryFailed, &error);
                }
            }
            (PipelineState::Interrupted, DeviceEvent::Restored) => {
                match inner.capture.resume() {
                    Ok(()) => {
                        inner.recovery_deadline = None;
                        self.transition(&mut inner, PipelineState::Running);
                    }
                    Err(error) => self.fail(&mut inner, FailureReason::RecoveryFailed, &error),
                }
            }
            (state, event) => {
                tracing::debug!(%state, "no transition for device event {:?}", event);
            }
        }
    }

    fn on_worker_notice(&self, notice: WorkerNotice) {
        let mut inner = self.lock();
        if notice.session != inner.session
            || !matches!(
                inner.state,
                PipelineState::Running | PipelineState::Interrupted
            )
        {
            return;
        }
        self.fail(&mut inner, FailureReason::ClassifierFailures, &notice.error);
    }

    fn check_recovery_deadline(&self) {
        let mut inner = self.lock();
        if inner.state != PipelineState::Interrupted {
            return;
        }
        if let Some(deadline) = inner.recovery_deadline
            && self.clock.now() >= deadline
        {
            let error = SoundwatchError::DeviceLost {
                message: format!(
                    "input did not recover within {} ms",
                    self.config.recovery_timeout_ms
                ),
            };
            self.fail(&mut inner, FailureReason::RecoveryTimeout, &error);
        }
    }
}

/// Supervisor loop: runs until the controller drops its shutdown sender.
fn supervise(
    shared: Arc<Shared>,
    device_rx: Receiver<SessionEvent>,
    notice_rx: Receiver<WorkerNotice>,
    shutdown_rx: Receiver<()>,
) {
    let tick = shared.config.poll_interval().max(Duration::from_millis(1));
    loop {
        select! {
            recv(shutdown_rx) -> _ => break,
            recv(device_rx) -> event => {
                if let Ok(event) = event {
                    shared.on_device_event(event);
                }
            }
            recv(notice_rx) -> notice => {
                if let Ok(notice) = notice {
                    shared.on_worker_notice(notice);
                }
            }
            default(tick) => {}
        }
        shared.check_recovery_deadline();
    }
    tracing::debug!("supervisor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::device::{MockDevice, MockDeviceHandle, Permission};
    use crate::classify::classifier::{Classifier, MockClassifier};
    use crate::error::ErrorKind;
    use crate::pipeline::clock::ManualClock;
    use crate::pipeline::event::{EventCollector, PipelineEvent};

    fn config() -> PipelineConfig {
        PipelineConfig {
            window_frames: 100,
            hop_frames: 50,
            ring_capacity_frames: 1000,
            recovery_timeout_ms: 500,
            dispatch_queue_capacity: 1024,
            poll_interval_ms: 1,
            ..PipelineConfig::default()
        }
    }

    fn mock_loader(
        classifier: MockClassifier,
    ) -> impl Fn(&PipelineConfig) -> Result<Box<dyn Classifier>> + Send + Sync + 'static {
        move |_: &PipelineConfig| Ok(Box::new(classifier.clone()) as Box<dyn Classifier>)
    }

    fn build(device: MockDevice) -> (PipelineController, MockDeviceHandle) {
        let handle = device.handle();
        let controller =
            PipelineController::new(config(), device, mock_loader(MockClassifier::new("dog", 0.9)))
                .unwrap();
        (controller, handle)
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        condition()
    }

    fn collect(controller: &PipelineController) -> EventCollector {
        let mut collector = EventCollector::new();
        controller.events().deliver_pending(&mut collector);
        collector
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let config = PipelineConfig {
            hop_frames: 0,
            ..config()
        };
        let result = PipelineController::new(
            config,
            MockDevice::new(),
            mock_loader(MockClassifier::new("dog", 0.9)),
        );
        assert!(matches!(
            result,
            Err(SoundwatchError::ConfigInvalidValue { .. })
        ));
    }

    #[test]
    fn test_start_and_stop() {
        let (controller, handle) = build(MockDevice::new());
        assert_eq!(controller.state(), PipelineState::Idle);

        assert_eq!(controller.start().unwrap(), ControlOutcome::Started);
        assert_eq!(controller.state(), PipelineState::Running);
        assert!(handle.is_acquired());

        handle.push_constant(0.0, 300, 50, 1);
        assert!(wait_until(|| controller.stats().classifier.delivered == 5));

        assert_eq!(controller.stop().unwrap(), ControlOutcome::Stopped);
        assert_eq!(controller.state(), PipelineState::Stopped);
        assert!(!handle.is_acquired());

        let events = collect(&controller);
        assert_eq!(
            events.transitions(),
            vec![
                PipelineState::Starting,
                PipelineState::Running,
                PipelineState::Stopping,
                PipelineState::Stopped,
            ]
        );
        assert_eq!(events.results.len(), 5);
        assert_eq!(events.results[0].top().map(|s| s.label.as_str()), Some("dog"));
    }

    #[test]
    fn test_double_start_reports_already_active() {
        let (controller, handle) = build(MockDevice::new());
        controller.start().unwrap();
        assert_eq!(controller.start().unwrap(), ControlOutcome::AlreadyActive);
        assert_eq!(handle.acquire_count(), 1);

        let events = collect(&controller);
        let starting = events
            .transitions()
            .iter()
            .filter(|s| **s == PipelineState::Starting)
            .count();
        assert_eq!(starting, 1);
        assert_eq!(events.errors.len(), 1);
        assert_eq!(events.errors[0].kind, ErrorKind::State);
        assert!(events.errors[0].recoverable);
    }

    #[test]
    fn test_stop_when_idle_is_noop() {
        let (controller, _) = build(MockDevice::new());
        assert_eq!(controller.stop().unwrap(), ControlOutcome::NotActive);
        assert_eq!(controller.state(), PipelineState::Idle);
        assert!(controller.events().drain().is_empty());
    }

    #[test]
    fn test_permission_denied_fails_without_acquiring() {
        let (controller, handle) =
            build(MockDevice::new().with_permission(Permission::Denied));
        let error = controller.start().unwrap_err();
        assert!(matches!(error, SoundwatchError::PermissionDenied { .. }));
        assert_eq!(
            controller.state(),
            PipelineState::Failed(FailureReason::PermissionDenied)
        );
        assert_eq!(handle.acquire_count(), 0);

        let events = collect(&controller);
        assert_eq!(events.errors.len(), 1);
        assert_eq!(events.errors[0].kind, ErrorKind::Permission);
        assert!(!events.errors[0].recoverable);
    }

    #[test]
    fn test_device_unavailable_and_format_mismatch() {
        let (controller, _) = build(MockDevice::new().with_unavailable());
        assert!(controller.start().is_err());
        assert_eq!(
            controller.state(),
            PipelineState::Failed(FailureReason::DeviceUnavailable)
        );

        let (controller, handle) = build(MockDevice::new().with_native_format(StreamFormat {
            sample_rate: 48000,
            channels: 2,
        }));
        let error = controller.start().unwrap_err();
        assert!(matches!(error, SoundwatchError::AudioFormatMismatch { .. }));
        assert_eq!(
            controller.state(),
            PipelineState::Failed(FailureReason::FormatMismatch)
        );
        assert!(!handle.is_acquired());
    }

    #[test]
    fn test_model_load_failure_never_touches_hardware() {
        let device = MockDevice::new();
        let handle = device.handle();
        let loader = |_: &PipelineConfig| -> Result<Box<dyn Classifier>> {
            Err(SoundwatchError::ModelLoad {
                message: "missing weights".to_string(),
            })
        };
        let controller = PipelineController::new(config(), device, loader).unwrap();

        assert!(controller.start().is_err());
        assert_eq!(
            controller.state(),
            PipelineState::Failed(FailureReason::ModelLoad)
        );
        assert_eq!(handle.acquire_count(), 0);

        let events = collect(&controller);
        assert_eq!(events.errors.len(), 1);
        assert_eq!(events.errors[0].kind, ErrorKind::ModelLoad);
    }

    #[test]
    fn test_failed_is_terminal() {
        let (controller, _) = build(MockDevice::new().with_unavailable());
        controller.start().unwrap_err();
        controller.events().drain();

        let error = controller.start().unwrap_err();
        assert!(matches!(error, SoundwatchError::InvalidState { .. }));
        assert!(controller.state().is_failed());

        let events = collect(&controller);
        assert!(events.states.is_empty());
        assert_eq!(events.errors[0].kind, ErrorKind::State);
    }

    #[test]
    fn test_restart_after_stop_uses_new_session() {
        let (controller, handle) = build(MockDevice::new());
        controller.start().unwrap();
        controller.stop().unwrap();
        assert_eq!(controller.start().unwrap(), ControlOutcome::Started);
        assert_eq!(controller.stats().sessions, 2);
        assert_eq!(handle.acquire_count(), 2);
        assert_eq!(handle.release_count(), 1);
    }

    #[test]
    fn test_interruption_and_recovery() {
        let (controller, handle) = build(MockDevice::new());
        controller.start().unwrap();

        assert!(handle.interrupt("phone call"));
        assert!(wait_until(
            || controller.state() == PipelineState::Interrupted
        ));
        assert!(handle.is_suspended());
        assert!(!handle.push(&[0.0; 10]));

        assert!(handle.restore());
        assert!(wait_until(|| controller.state() == PipelineState::Running));
        assert_eq!(handle.resume_count(), 1);

        let events = collect(&controller);
        assert_eq!(
            events.transitions(),
            vec![
                PipelineState::Starting,
                PipelineState::Running,
                PipelineState::Interrupted,
                PipelineState::Running,
            ]
        );
        assert_eq!(events.errors.len(), 1);
        assert_eq!(events.errors[0].kind, ErrorKind::Device);
        assert!(events.errors[0].recoverable);
    }

    #[test]
    fn test_recovery_timeout_fails_pipeline() {
        let device = MockDevice::new();
        let handle = device.handle();
        let clock = ManualClock::new();
        let controller = PipelineController::with_clock(
            config(),
            device,
            mock_loader(MockClassifier::new("dog", 0.9)),
            Arc::new(clock.clone()),
        )
        .unwrap();
        controller.start().unwrap();

        handle.interrupt("route lost");
        assert!(wait_until(
            || controller.state() == PipelineState::Interrupted
        ));
        clock.advance(Duration::from_millis(499));
        thread::sleep(Duration::from_millis(20));
        assert_eq!(controller.state(), PipelineState::Interrupted);

        clock.advance(Duration::from_millis(1));
        assert!(wait_until(|| controller.state()
            == PipelineState::Failed(FailureReason::RecoveryTimeout)));
        assert!(!handle.is_acquired());

        let events = collect(&controller);
        let last = events.errors.last().unwrap();
        assert!(!last.recoverable);
        assert!(last.message.contains("500 ms"));
    }

    #[test]
    fn test_failed_resume_fails_pipeline() {
        let (controller, handle) = build(MockDevice::new().with_resume_failure());
        controller.start().unwrap();
        handle.interrupt("unplugged");
        assert!(wait_until(
            || controller.state() == PipelineState::Interrupted
        ));
        handle.restore();
        assert!(wait_until(|| controller.state()
            == PipelineState::Failed(FailureReason::RecoveryFailed)));
    }

    #[test]
    fn test_permission_revoked_while_running() {
        let (controller, handle) = build(MockDevice::new());
        controller.start().unwrap();
        handle.notify(DeviceEvent::PermissionRevoked);
        assert!(wait_until(|| controller.state()
            == PipelineState::Failed(FailureReason::PermissionRevoked)));
        assert!(!handle.is_acquired());
    }

    #[test]
    fn test_stale_session_events_are_ignored() {
        let (controller, _) = build(MockDevice::new());
        controller.start().unwrap();
        controller
            .shared
            .device_tx
            .send(SessionEvent {
                session: 0,
                event: DeviceEvent::Interrupted {
                    reason: "old".to_string(),
                },
            })
            .unwrap();
        thread::sleep(Duration::from_millis(20));
        assert_eq!(controller.state(), PipelineState::Running);
    }

    #[test]
    fn test_persistent_classifier_failure_fails_pipeline() {
        let device = MockDevice::new();
        let handle = device.handle();
        let classifier = MockClassifier::new("dog", 0.9).with_permanent_failure();
        let controller =
            PipelineController::new(config(), device, mock_loader(classifier)).unwrap();
        controller.start().unwrap();

        handle.push_constant(0.0, 300, 50, 1);
        assert!(wait_until(|| controller.state()
            == PipelineState::Failed(FailureReason::ClassifierFailures)));

        let events = collect(&controller);
        let recoverable = events.errors.iter().filter(|e| e.recoverable).count();
        let fatal = events.errors.iter().filter(|e| !e.recoverable).count();
        assert_eq!(recoverable, 2);
        assert_eq!(fatal, 1);
    }

    #[test]
    fn test_no_results_after_stopping_event() {
        let (controller, handle) = build(MockDevice::new());
        controller.start().unwrap();
        handle.push_constant(0.0, 1000, 50, 1);
        controller.stop().unwrap();

        let events = controller.events().drain();
        let stopping = events
            .iter()
            .position(|e| {
                matches!(e, PipelineEvent::State(c) if c.to == PipelineState::Stopping)
            })
            .unwrap();
        assert!(events[stopping..].iter().all(|e| !e.is_result()));
    }

    #[test]
    fn test_stats_serialize() {
        let (controller, _) = build(MockDevice::new());
        let json = serde_json::to_value(controller.stats()).unwrap();
        assert_eq!(json["state"], "idle");
        assert_eq!(json["classifier"]["delivered"], 0);
    }
}
