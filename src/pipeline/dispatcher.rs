//! Result dispatcher: bounded FIFO between the pipeline threads and the application.
//!
//! Posting never waits for the application. When the queue is full the oldest
//! pending *result* is evicted and counted. Lifecycle and error events are
//! never evicted; a recoverable error that finds the queue full without a
//! result to evict is folded into the newest pending error of the same kind
//! (see `ErrorEvent::occurrences`). Pending events are therefore bounded by
//! `capacity` plus one per `ErrorKind`, plus state changes and fatal errors.
//!
//! The queue also carries the result gate. Queuing a state change opens the gate
//! if the new state is `Running` and closes it otherwise, under the same lock, so
//! no result can land behind an `Interrupted`, `Stopping` or `Failed` event.

use crate::classify::result::ClassificationResult;
use crate::pipeline::event::{ErrorEvent, PipelineEvent, StateChange, Subscriber};
use crate::pipeline::state::PipelineState;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// How often a delivery thread re-checks its stop flag.
const DELIVERY_POLL: Duration = Duration::from_millis(20);

struct Queue {
    events: VecDeque<PipelineEvent>,
    accepting_results: bool,
    dropped_results: u64,
    delivered_results: u64,
}

pub struct ResultDispatcher {
    queue: Mutex<Queue>,
    ready: Condvar,
    capacity: usize,
}

impl ResultDispatcher {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(Queue {
                events: VecDeque::with_capacity(capacity),
                accepting_results: false,
                dropped_results: 0,
                delivered_results: 0,
            }),
            ready: Condvar::new(),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues a result. Returns false if the gate is closed and the result was discarded.
    pub fn post_result(&self, result: ClassificationResult) -> bool {
        let mut queue = self.lock();
        if !queue.accepting_results {
            return false;
        }
        if queue.events.len() >= self.capacity && !Self::evict_oldest_result(&mut queue) {
            // Nothing to make room with: the queue is all lifecycle and error events.
            queue.dropped_results += 1;
            return true;
        }
        queue.events.push_back(PipelineEvent::Result(result));
        drop(queue);
        self.ready.notify_one();
        true
    }

    /// Queues a state change and sets the result gate to match the new state.
    pub fn post_state(&self, change: StateChange) {
        let mut queue = self.lock();
        queue.accepting_results = change.to == PipelineState::Running;
        queue.events.push_back(PipelineEvent::State(change));
        drop(queue);
        self.ready.notify_one();
    }

    /// Queues a fault report.
    ///
    /// Fatal errors are always queued. A recoverable error arriving at a full
    /// queue evicts the oldest result, or else merges into the newest pending
    /// recoverable error of the same kind.
    pub fn post_error(&self, error: ErrorEvent) {
        let mut queue = self.lock();
        if error.recoverable
            && queue.events.len() >= self.capacity
            && !Self::evict_oldest_result(&mut queue)
            && let Some(pending) = queue.events.iter_mut().rev().find_map(|event| match event {
                PipelineEvent::Error(pending) if pending.recoverable && pending.kind == error.kind => {
                    Some(pending)
                }
                _ => None,
            })
        {
            pending.absorb(error);
            return;
        }
        queue.events.push_back(PipelineEvent::Error(error));
        drop(queue);
        self.ready.notify_one();
    }

    fn evict_oldest_result(queue: &mut Queue) -> bool {
        match queue.events.iter().position(PipelineEvent::is_result) {
            Some(oldest) => {
                queue.events.remove(oldest);
                queue.dropped_results += 1;
                true
            }
            None => false,
        }
    }

    /// Results evicted because the application fell behind.
    pub fn dropped_results(&self) -> u64 {
        self.lock().dropped_results
    }

    /// Results handed to the application so far.
    pub fn delivered_results(&self) -> u64 {
        self.lock().delivered_results
    }

    pub fn pending(&self) -> usize {
        self.lock().events.len()
    }

    fn pop(queue: &mut Queue) -> Option<PipelineEvent> {
        let event = queue.events.pop_front()?;
        if event.is_result() {
            queue.delivered_results += 1;
        }
        Some(event)
    }

    fn try_pop(&self) -> Option<PipelineEvent> {
        Self::pop(&mut self.lock())
    }

    fn pop_timeout(&self, timeout: Duration) -> Option<PipelineEvent> {
        let deadline = Instant::now() + timeout;
        let mut queue = self.lock();
        loop {
            if let Some(event) = Self::pop(&mut queue) {
                return Some(event);
            }
            let remaining = deadline.checked_duration_since(Instant::now())?;
            if remaining.is_zero() {
                return None;
            }
            queue = self
                .ready
                .wait_timeout(queue, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn drain_all(&self) -> Vec<PipelineEvent> {
        let mut queue = self.lock();
        let mut events = Vec::with_capacity(queue.events.len());
        while let Some(event) = Self::pop(&mut queue) {
            events.push(event);
        }
        events
    }
}

/// The application's end of the dispatcher.
///
/// Clones share one queue: each event is delivered to exactly one handle.
#[derive(Clone)]
pub struct EventStream {
    dispatcher: Arc<ResultDispatcher>,
}

impl EventStream {
    pub fn new(dispatcher: Arc<ResultDispatcher>) -> Self {
        Self { dispatcher }
    }

    /// Next pending event, without waiting.
    pub fn try_recv(&self) -> Option<PipelineEvent> {
        self.dispatcher.try_pop()
    }

    /// Next event, waiting up to `timeout`.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<PipelineEvent> {
        self.dispatcher.pop_timeout(timeout)
    }

    /// All pending events in order.
    pub fn drain(&self) -> Vec<PipelineEvent> {
        self.dispatcher.drain_all()
    }

    /// Hands every pending event to `subscriber` on the calling thread.
    ///
    /// Returns the number of events delivered.
    pub fn deliver_pending<S: Subscriber + ?Sized>(&self, subscriber: &mut S) -> usize {
        let events = self.drain();
        for event in &events {
            event.deliver_to(subscriber);
        }
        events.len()
    }

    /// Runs `subscriber` on a dedicated delivery thread.
    pub fn spawn_delivery<S>(self, subscriber: S) -> std::io::Result<DeliveryHandle<S>>
    where
        S: Subscriber + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let thread = thread::Builder::new()
            .name("soundwatch-delivery".to_string())
            .spawn(move || {
                let mut subscriber = subscriber;
                while !thread_stop.load(Ordering::Acquire) {
                    if let Some(event) = self.recv_timeout(DELIVERY_POLL) {
                        event.deliver_to(&mut subscriber);
                    }
                }
                self.deliver_pending(&mut subscriber);
                subscriber
            })?;
        Ok(DeliveryHandle {
            stop,
            thread: Some(thread),
        })
    }
}

/// A running delivery thread.
pub struct DeliveryHandle<S> {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<S>>,
}

impl<S> DeliveryHandle<S> {
    /// Delivers whatever is still pending, stops the thread and returns the subscriber.
    ///
    /// Returns `None` if the subscriber panicked.
    pub fn stop(mut self) -> Option<S> {
        self.stop.store(true, Ordering::Release);
        self.thread.take().and_then(|t| t.join().ok())
    }
}

impl<S> Drop for DeliveryHandle<S> {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::frame::{ClassificationWindow, FrameBlock};
    use crate::classify::classifier::LabelScore;
    use crate::error::ErrorKind;
    use crate::pipeline::event::EventCollector;

    fn result(start: u64) -> ClassificationResult {
        let window = ClassificationWindow::new(FrameBlock::new(start, 1, vec![0.0; 4]), 16000);
        ClassificationResult::from_scores(&window, vec![LabelScore::new("silence", 0.9)]).unwrap()
    }

    fn change(from: PipelineState, to: PipelineState) -> StateChange {
        StateChange {
            from,
            to,
            at: Instant::now(),
        }
    }

    fn running_dispatcher(capacity: usize) -> Arc<ResultDispatcher> {
        let dispatcher = Arc::new(ResultDispatcher::new(capacity));
        dispatcher.post_state(change(PipelineState::Starting, PipelineState::Running));
        dispatcher
    }

    fn result_starts(events: &[PipelineEvent]) -> Vec<u64> {
        events
            .iter()
            .filter_map(|e| match e {
                PipelineEvent::Result(r) => Some(r.start_frame),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_results_refused_before_running() {
        let dispatcher = ResultDispatcher::new(8);
        assert!(!dispatcher.post_result(result(0)));
        assert_eq!(dispatcher.pending(), 0);
    }

    #[test]
    fn test_fifo_order() {
        let dispatcher = running_dispatcher(16);
        let stream = EventStream::new(Arc::clone(&dispatcher));
        stream.drain();

        for start in [0, 800, 1600, 2400] {
            assert!(dispatcher.post_result(result(start)));
        }
        assert_eq!(result_starts(&stream.drain()), vec![0, 800, 1600, 2400]);
        assert_eq!(dispatcher.delivered_results(), 4);
    }

    #[test]
    fn test_full_queue_evicts_oldest_result_only() {
        let dispatcher = running_dispatcher(3);
        for start in [0, 1, 2, 3] {
            dispatcher.post_result(result(start));
        }
        let events = EventStream::new(Arc::clone(&dispatcher)).drain();

        // The Running event survives; result 0 was evicted first, then result 1.
        assert!(matches!(events[0], PipelineEvent::State(_)));
        assert_eq!(result_starts(&events), vec![2, 3]);
        assert_eq!(dispatcher.dropped_results(), 2);
    }

    #[test]
    fn test_lifecycle_events_are_never_evicted() {
        let dispatcher = Arc::new(ResultDispatcher::new(2));
        dispatcher.post_state(change(PipelineState::Idle, PipelineState::Starting));
        dispatcher.post_state(change(PipelineState::Starting, PipelineState::Running));
        for _ in 0..3 {
            dispatcher.post_error(ErrorEvent::new(ErrorKind::Device, "x", false, Instant::now()));
        }
        dispatcher.post_state(change(PipelineState::Running, PipelineState::Stopping));
        assert_eq!(dispatcher.pending(), 6);
        assert_eq!(dispatcher.dropped_results(), 0);
    }

    #[test]
    fn test_repeated_telemetry_stays_bounded() {
        let dispatcher = running_dispatcher(4);
        for n in 0..10_000 {
            let message = format!("{n} unread frames overwritten");
            dispatcher.post_error(ErrorEvent::new(ErrorKind::BufferUnderrun, message, true, Instant::now()));
        }
        dispatcher.post_error(ErrorEvent::new(ErrorKind::Capture, "1 malformed buffers", true, Instant::now()));
        assert!(dispatcher.post_result(result(0)));
        assert!(dispatcher.pending() <= 5);

        let events = EventStream::new(Arc::clone(&dispatcher)).drain();
        let errors: Vec<&ErrorEvent> = events
            .iter()
            .filter_map(|e| match e {
                PipelineEvent::Error(error) => Some(error),
                _ => None,
            })
            .collect();
        let underruns: u64 = errors
            .iter()
            .filter(|e| e.kind == ErrorKind::BufferUnderrun)
            .map(|e| e.occurrences)
            .sum();
        assert_eq!(underruns, 10_000);
        assert!(errors.iter().any(|e| e.kind == ErrorKind::Capture));
        assert!(errors.iter().any(|e| e.message == "9999 unread frames overwritten"));
        assert_eq!(dispatcher.dropped_results(), 1);
    }

    #[test]
    fn test_telemetry_evicts_results_before_merging() {
        let dispatcher = running_dispatcher(3);
        dispatcher.post_result(result(0));
        dispatcher.post_result(result(1));
        dispatcher.post_error(ErrorEvent::new(ErrorKind::BufferOverrun, "a", true, Instant::now()));

        let events = EventStream::new(Arc::clone(&dispatcher)).drain();
        assert_eq!(result_starts(&events), vec![1]);
        assert_eq!(events.len(), 3);
        assert_eq!(dispatcher.dropped_results(), 1);
    }

    #[test]
    fn test_fatal_errors_are_never_merged() {
        let dispatcher = running_dispatcher(1);
        for _ in 0..3 {
            dispatcher.post_error(ErrorEvent::new(ErrorKind::Device, "gone", false, Instant::now()));
        }
        assert_eq!(dispatcher.pending(), 4);
    }

    #[test]
    fn test_gate_closes_with_non_running_state() {
        let dispatcher = running_dispatcher(16);
        assert!(dispatcher.post_result(result(0)));
        dispatcher.post_state(change(PipelineState::Running, PipelineState::Interrupted));
        assert!(!dispatcher.post_result(result(800)));
        dispatcher.post_state(change(PipelineState::Interrupted, PipelineState::Running));
        assert!(dispatcher.post_result(result(1600)));

        let events = EventStream::new(dispatcher).drain();
        assert_eq!(result_starts(&events), vec![0, 1600]);
    }

    #[test]
    fn test_recv_timeout_returns_none_when_empty() {
        let stream = EventStream::new(Arc::new(ResultDispatcher::new(4)));
        let started = Instant::now();
        assert!(stream.recv_timeout(Duration::from_millis(30)).is_none());
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_recv_timeout_wakes_on_post() {
        let dispatcher = running_dispatcher(4);
        let stream = EventStream::new(Arc::clone(&dispatcher));
        stream.drain();

        let poster = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            dispatcher.post_result(result(42));
        });
        let event = stream.recv_timeout(Duration::from_secs(5));
        poster.join().unwrap();
        assert!(matches!(event, Some(PipelineEvent::Result(r)) if r.start_frame == 42));
    }

    #[test]
    fn test_deliver_pending_routes_to_subscriber() {
        let dispatcher = running_dispatcher(8);
        dispatcher.post_result(result(0));
        dispatcher.post_error(ErrorEvent::new(ErrorKind::BufferOverrun, "dropped", true, Instant::now()));

        let mut collector = EventCollector::new();
        let delivered = EventStream::new(dispatcher).deliver_pending(&mut collector);
        assert_eq!(delivered, 3);
        assert_eq!(collector.states.len(), 1);
        assert_eq!(collector.results.len(), 1);
        assert_eq!(collector.errors.len(), 1);
    }

    #[test]
    fn test_spawn_delivery_collects_on_own_thread() {
        let dispatcher = running_dispatcher(64);
        let handle = EventStream::new(Arc::clone(&dispatcher))
            .spawn_delivery(EventCollector::new())
            .unwrap();

        for start in 0..10 {
            dispatcher.post_result(result(start));
        }
        let collector = handle.stop().unwrap();
        let starts: Vec<u64> = collector.results.iter().map(|r| r.start_frame).collect();
        assert_eq!(starts, (0..10).collect::<Vec<_>>());
    }
}
