//! Audio capture session: owns the input device and feeds the ring buffer.
//!
//! Everything inside the input callback is bounded: a gate check, a format
//! check over the incoming buffer, one ring buffer write and a few relaxed
//! counter updates. Faults are counted and picked up by the classification
//! thread; nothing is logged or allocated on the callback path.

use crate::audio::device::{
    AudioDevice, DeviceEventSender, InputCallback, Permission, StreamFormat,
};
use crate::audio::ring_buffer::RingProducer;
use crate::error::{Result, SoundwatchError};
use serde::Serialize;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

#[derive(Debug, Default)]
struct CaptureCounters {
    callbacks: AtomicU64,
    frames_written: AtomicU64,
    malformed: AtomicU64,
    faults: AtomicU64,
}

/// Snapshot of capture-side counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CaptureStats {
    /// Hardware buffers received while capture was accepting input.
    pub callbacks: u64,
    /// Frames handed to the ring buffer.
    pub frames_written: u64,
    /// Buffers that were truncated or rejected (partial frame, non-finite samples).
    pub malformed: u64,
    /// Callbacks that panicked and were contained.
    pub faults: u64,
}

/// Read-only view of a session's counters, shareable with other threads.
#[derive(Debug, Clone)]
pub struct CaptureStatsHandle {
    counters: Arc<CaptureCounters>,
}

impl CaptureStatsHandle {
    pub fn snapshot(&self) -> CaptureStats {
        CaptureStats {
            callbacks: self.counters.callbacks.load(Ordering::Relaxed),
            frames_written: self.counters.frames_written.load(Ordering::Relaxed),
            malformed: self.counters.malformed.load(Ordering::Relaxed),
            faults: self.counters.faults.load(Ordering::Relaxed),
        }
    }
}

/// Exclusive owner of the input device for a pipeline's lifetime.
///
/// Each `open` acquires the hardware and binds a fresh ring buffer producer;
/// `release` gives the hardware back. Between the two, `suspend` and `resume`
/// pause input without renegotiating the stream.
pub struct AudioCaptureSession {
    device: Box<dyn AudioDevice>,
    format: StreamFormat,
    accepting: Arc<AtomicBool>,
    counters: Arc<CaptureCounters>,
    open: bool,
}

impl AudioCaptureSession {
    /// Wraps a device that will be opened with `format`.
    pub fn new(device: Box<dyn AudioDevice>, format: StreamFormat) -> Self {
        Self {
            device,
            format,
            accepting: Arc::new(AtomicBool::new(false)),
            counters: Arc::new(CaptureCounters::default()),
            open: false,
        }
    }

    pub fn device_name(&self) -> &str {
        self.device.name()
    }

    pub fn format(&self) -> StreamFormat {
        self.format
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn stats(&self) -> CaptureStats {
        self.stats_handle().snapshot()
    }

    pub fn stats_handle(&self) -> CaptureStatsHandle {
        CaptureStatsHandle {
            counters: Arc::clone(&self.counters),
        }
    }

    /// Acquires the device and starts writing its buffers into `producer`.
    ///
    /// # Errors
    /// - `PermissionDenied` if the platform refuses microphone access
    /// - any acquisition error reported by the device
    /// - `AudioFormatMismatch` if the hardware negotiates a different format
    pub fn open(&mut self, producer: RingProducer, events: DeviceEventSender) -> Result<()> {
        if self.open {
            return Err(SoundwatchError::InvalidState {
                state: "open".to_string(),
                message: "capture session already holds the device".to_string(),
            });
        }
        if self.device.permission() == Permission::Denied {
            return Err(SoundwatchError::PermissionDenied {
                message: format!("access to '{}' was refused", self.device.name()),
            });
        }

        self.accepting.store(false, Ordering::Release);
        let callback = input_callback(
            producer,
            self.format.channels,
            Arc::clone(&self.accepting),
            Arc::clone(&self.counters),
        );

        let negotiated = self.device.acquire(self.format, callback, events)?;
        if negotiated != self.format {
            if let Err(e) = self.device.release() {
                tracing::warn!(device = self.device.name(), "release after format mismatch failed: {e}");
            }
            return Err(SoundwatchError::AudioFormatMismatch {
                expected: self.format.to_string(),
                actual: negotiated.to_string(),
            });
        }

        self.open = true;
        self.accepting.store(true, Ordering::Release);
        tracing::debug!(device = self.device.name(), format = %self.format, "capture opened");
        Ok(())
    }

    /// Stops accepting buffers and pauses the device. Configuration is kept.
    pub fn suspend(&mut self) -> Result<()> {
        self.accepting.store(false, Ordering::Release);
        if !self.open {
            return Ok(());
        }
        self.device.suspend()
    }

    /// Resumes the device and starts accepting buffers again.
    pub fn resume(&mut self) -> Result<()> {
        if !self.open {
            return Err(SoundwatchError::InvalidState {
                state: "released".to_string(),
                message: "cannot resume a released capture session".to_string(),
            });
        }
        self.device.resume()?;
        self.accepting.store(true, Ordering::Release);
        Ok(())
    }

    /// Releases the device. Safe to call when already released.
    pub fn release(&mut self) -> Result<()> {
        self.accepting.store(false, Ordering::Release);
        if !self.open {
            return Ok(());
        }
        self.open = false;
        let result = self.device.release();
        tracing::debug!(device = self.device.name(), "capture released");
        result
    }
}

impl Drop for AudioCaptureSession {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            tracing::warn!("failed to release audio device: {e}");
        }
    }
}

/// Builds the real-time callback that moves hardware buffers into the ring.
fn input_callback(
    mut producer: RingProducer,
    channels: u16,
    accepting: Arc<AtomicBool>,
    counters: Arc<CaptureCounters>,
) -> InputCallback {
    let channels = usize::from(channels.max(1));
    Box::new(move |data: &[f32]| {
        if !accepting.load(Ordering::Acquire) {
            return;
        }
        counters.callbacks.fetch_add(1, Ordering::Relaxed);

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            if data.iter().any(|s| !s.is_finite()) {
                return None;
            }
            let whole = data.len() - data.len() % channels;
            Some((producer.write(&data[..whole]), whole != data.len()))
        }));

        match outcome {
            Ok(Some((written, truncated))) => {
                counters
                    .frames_written
                    .fetch_add(written.written as u64, Ordering::Relaxed);
                if truncated {
                    counters.malformed.fetch_add(1, Ordering::Relaxed);
                }
            }
            Ok(None) => {
                counters.malformed.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                counters.faults.fetch_add(1, Ordering::Relaxed);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::device::MockDevice;
    use crate::audio::ring_buffer::{RingConsumer, SampleRingBuffer};
    use crate::config::OverflowPolicy;
    use crossbeam_channel::unbounded;

    const MONO_16K: StreamFormat = StreamFormat {
        sample_rate: 16000,
        channels: 1,
    };

    fn ring(channels: u16) -> (RingProducer, RingConsumer) {
        SampleRingBuffer::new(64, channels, OverflowPolicy::DropNewest).split()
    }

    fn events() -> DeviceEventSender {
        let (tx, _rx) = unbounded();
        DeviceEventSender::new(1, tx)
    }

    #[test]
    fn test_open_writes_buffers_into_ring() {
        let device = MockDevice::new();
        let handle = device.handle();
        let mut session = AudioCaptureSession::new(Box::new(device), MONO_16K);
        let (producer, mut consumer) = ring(1);

        session.open(producer, events()).unwrap();
        assert!(session.is_open());
        handle.push(&[0.1, 0.2, 0.3]);

        let block = consumer.try_read(3).unwrap();
        assert_eq!(block.samples, vec![0.1, 0.2, 0.3]);
        let stats = session.stats();
        assert_eq!(stats.callbacks, 1);
        assert_eq!(stats.frames_written, 3);
    }

    #[test]
    fn test_open_rejects_denied_permission() {
        let device = MockDevice::new().with_permission(Permission::Denied);
        let handle = device.handle();
        let mut session = AudioCaptureSession::new(Box::new(device), MONO_16K);
        let (producer, _consumer) = ring(1);

        let result = session.open(producer, events());
        assert!(matches!(result, Err(SoundwatchError::PermissionDenied { .. })));
        assert!(!session.is_open());
        assert_eq!(handle.acquire_count(), 0);
    }

    #[test]
    fn test_open_proceeds_when_permission_undetermined() {
        let device = MockDevice::new().with_permission(Permission::Undetermined);
        let mut session = AudioCaptureSession::new(Box::new(device), MONO_16K);
        let (producer, _consumer) = ring(1);
        assert!(session.open(producer, events()).is_ok());
    }

    #[test]
    fn test_open_rejects_format_mismatch_and_releases() {
        let device = MockDevice::new().with_native_format(StreamFormat {
            sample_rate: 44100,
            channels: 2,
        });
        let handle = device.handle();
        let mut session = AudioCaptureSession::new(Box::new(device), MONO_16K);
        let (producer, _consumer) = ring(1);

        match session.open(producer, events()) {
            Err(SoundwatchError::AudioFormatMismatch { expected, actual }) => {
                assert_eq!(expected, "16000Hz/1ch");
                assert_eq!(actual, "44100Hz/2ch");
            }
            other => panic!("Expected format mismatch, got {other:?}"),
        }
        assert!(!handle.is_acquired());
    }

    #[test]
    fn test_suspend_blocks_input_and_resume_restores_it() {
        let device = MockDevice::new();
        let handle = device.handle();
        let mut session = AudioCaptureSession::new(Box::new(device), MONO_16K);
        let (producer, mut consumer) = ring(1);
        session.open(producer, events()).unwrap();

        session.suspend().unwrap();
        handle.push(&[1.0, 1.0]);
        assert_eq!(consumer.available(), 0);

        session.resume().unwrap();
        handle.push(&[2.0]);
        assert_eq!(consumer.try_read(1).unwrap().samples, vec![2.0]);
    }

    #[test]
    fn test_partial_frame_is_truncated_and_counted() {
        let device = MockDevice::new();
        let handle = device.handle();
        let stereo = StreamFormat {
            sample_rate: 16000,
            channels: 2,
        };
        let mut session = AudioCaptureSession::new(Box::new(device), stereo);
        let (producer, mut consumer) = ring(2);
        session.open(producer, events()).unwrap();

        handle.push(&[0.1, 0.2, 0.3]);
        assert_eq!(consumer.try_read(1).unwrap().samples, vec![0.1, 0.2]);
        assert_eq!(session.stats().malformed, 1);
    }

    #[test]
    fn test_non_finite_buffer_is_rejected() {
        let device = MockDevice::new();
        let handle = device.handle();
        let mut session = AudioCaptureSession::new(Box::new(device), MONO_16K);
        let (producer, consumer) = ring(1);
        session.open(producer, events()).unwrap();

        handle.push(&[0.1, f32::NAN, 0.3]);
        assert_eq!(consumer.available(), 0);
        assert_eq!(session.stats().malformed, 1);
    }

    #[test]
    fn test_release_is_idempotent_and_reopen_works() {
        let device = MockDevice::new();
        let handle = device.handle();
        let mut session = AudioCaptureSession::new(Box::new(device), MONO_16K);

        let (producer, _consumer) = ring(1);
        session.open(producer, events()).unwrap();
        session.release().unwrap();
        session.release().unwrap();
        assert_eq!(handle.release_count(), 1);

        let (producer, mut consumer) = ring(1);
        session.open(producer, events()).unwrap();
        handle.push(&[0.5]);
        assert_eq!(consumer.try_read(1).unwrap().samples, vec![0.5]);
    }

    #[test]
    fn test_resume_after_release_is_invalid() {
        let mut session = AudioCaptureSession::new(Box::new(MockDevice::new()), MONO_16K);
        assert!(matches!(
            session.resume(),
            Err(SoundwatchError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_drop_releases_device() {
        let device = MockDevice::new();
        let handle = device.handle();
        {
            let mut session = AudioCaptureSession::new(Box::new(device), MONO_16K);
            let (producer, _consumer) = ring(1);
            session.open(producer, events()).unwrap();
        }
        assert!(!handle.is_acquired());
    }
}
