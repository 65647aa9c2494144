//! Audio input devices: the `AudioDevice` seam, device events and a mock device for tests.
//!
//! A device pushes interleaved `f32` buffers into the callback it is given at
//! acquisition and reports hardware changes through a `DeviceEventSender`.

use crate::error::{Result, SoundwatchError};
use crossbeam_channel::Sender;
use std::fmt;
use std::sync::{Arc, Mutex};

/// Microphone access as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    Granted,
    Denied,
    /// Not decided yet; acquisition may prompt the user.
    Undetermined,
}

/// Sample rate and interleaved channel count of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl fmt::Display for StreamFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}Hz/{}ch", self.sample_rate, self.channels)
    }
}

/// Called by the device for every hardware buffer of interleaved `f32` samples.
///
/// Runs on the device's real-time thread.
pub type InputCallback = Box<dyn FnMut(&[f32]) + Send + 'static>;

/// Hardware lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    /// Another client claimed the device or the OS paused input.
    Interrupted { reason: String },
    /// The input route changed (headset plugged, default device switched).
    RouteChanged { reason: String },
    /// The device disappeared.
    Lost { reason: String },
    /// Input is available again after an interruption.
    Restored,
    /// The user revoked microphone access.
    PermissionRevoked,
}

/// A device event tagged with the capture session that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEvent {
    pub session: u64,
    pub event: DeviceEvent,
}

/// Non-blocking sender handed to a device at acquisition.
#[derive(Clone)]
pub struct DeviceEventSender {
    session: u64,
    tx: Sender<SessionEvent>,
}

impl DeviceEventSender {
    pub fn new(session: u64, tx: Sender<SessionEvent>) -> Self {
        Self { session, tx }
    }

    /// Reports an event. Returns false if it could not be queued.
    pub fn notify(&self, event: DeviceEvent) -> bool {
        self.tx
            .try_send(SessionEvent {
                session: self.session,
                event,
            })
            .is_ok()
    }
}

/// Audio input hardware.
///
/// This trait allows swapping implementations (real audio device vs mock).
/// A pipeline owns exactly one device for its whole life and cycles it through
/// `acquire` / `release` on every start and stop.
pub trait AudioDevice: Send {
    /// Human-readable device name.
    fn name(&self) -> &str;

    /// Current microphone permission.
    fn permission(&self) -> Permission;

    /// Opens the input stream and starts delivering buffers to `callback`.
    ///
    /// Returns the format the hardware actually delivers.
    fn acquire(
        &mut self,
        format: StreamFormat,
        callback: InputCallback,
        events: DeviceEventSender,
    ) -> Result<StreamFormat>;

    /// Pauses delivery while keeping the stream configured.
    fn suspend(&mut self) -> Result<()>;

    /// Resumes delivery after `suspend`.
    fn resume(&mut self) -> Result<()>;

    /// Closes the stream and drops the callback.
    fn release(&mut self) -> Result<()>;
}

impl<D: AudioDevice + ?Sized> AudioDevice for Box<D> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn permission(&self) -> Permission {
        (**self).permission()
    }

    fn acquire(
        &mut self,
        format: StreamFormat,
        callback: InputCallback,
        events: DeviceEventSender,
    ) -> Result<StreamFormat> {
        (**self).acquire(format, callback, events)
    }

    fn suspend(&mut self) -> Result<()> {
        (**self).suspend()
    }

    fn resume(&mut self) -> Result<()> {
        (**self).resume()
    }

    fn release(&mut self) -> Result<()> {
        (**self).release()
    }
}

#[derive(Default)]
struct MockState {
    callback: Option<InputCallback>,
    events: Option<DeviceEventSender>,
    suspended: bool,
    acquire_count: u32,
    release_count: u32,
    suspend_count: u32,
    resume_count: u32,
}

/// Mock audio device for testing.
///
/// Buffers are pushed synchronously from the test thread through a
/// [`MockDeviceHandle`], standing in for the hardware callback thread.
pub struct MockDevice {
    name: String,
    permission: Permission,
    unavailable: bool,
    resume_failure: bool,
    native_format: Option<StreamFormat>,
    state: Arc<Mutex<MockState>>,
}

impl MockDevice {
    /// Create a new mock device that grants permission and accepts any format.
    pub fn new() -> Self {
        Self {
            name: "mock".to_string(),
            permission: Permission::Granted,
            unavailable: false,
            resume_failure: false,
            native_format: None,
            state: Arc::new(Mutex::new(MockState::default())),
        }
    }

    /// Configure the permission the device reports.
    pub fn with_permission(mut self, permission: Permission) -> Self {
        self.permission = permission;
        self
    }

    /// Configure the mock to fail acquisition as if no device were present.
    pub fn with_unavailable(mut self) -> Self {
        self.unavailable = true;
        self
    }

    /// Configure the mock to fail every `resume`.
    pub fn with_resume_failure(mut self) -> Self {
        self.resume_failure = true;
        self
    }

    /// Configure the format the mock negotiates regardless of the request.
    pub fn with_native_format(mut self, format: StreamFormat) -> Self {
        self.native_format = Some(format);
        self
    }

    /// Returns a handle that drives this device from the outside.
    pub fn handle(&self) -> MockDeviceHandle {
        MockDeviceHandle {
            state: Arc::clone(&self.state),
        }
    }
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioDevice for MockDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn permission(&self) -> Permission {
        self.permission
    }

    fn acquire(
        &mut self,
        format: StreamFormat,
        callback: InputCallback,
        events: DeviceEventSender,
    ) -> Result<StreamFormat> {
        if self.unavailable {
            return Err(SoundwatchError::DeviceUnavailable {
                device: self.name.clone(),
            });
        }
        let mut state = lock(&self.state)?;
        state.callback = Some(callback);
        state.events = Some(events);
        state.suspended = false;
        state.acquire_count += 1;
        Ok(self.native_format.unwrap_or(format))
    }

    fn suspend(&mut self) -> Result<()> {
        let mut state = lock(&self.state)?;
        state.suspended = true;
        state.suspend_count += 1;
        Ok(())
    }

    fn resume(&mut self) -> Result<()> {
        let mut state = lock(&self.state)?;
        state.resume_count += 1;
        if self.resume_failure {
            return Err(SoundwatchError::DeviceLost {
                message: "mock resume failure".to_string(),
            });
        }
        state.suspended = false;
        Ok(())
    }

    fn release(&mut self) -> Result<()> {
        let mut state = lock(&self.state)?;
        state.callback = None;
        state.events = None;
        state.suspended = false;
        state.release_count += 1;
        Ok(())
    }
}

fn lock(state: &Mutex<MockState>) -> Result<std::sync::MutexGuard<'_, MockState>> {
    state.lock().map_err(|e| SoundwatchError::Other(format!("mock device poisoned: {e}")))
}

/// Drives a [`MockDevice`] from a test.
#[derive(Clone)]
pub struct MockDeviceHandle {
    state: Arc<Mutex<MockState>>,
}

impl MockDeviceHandle {
    /// Delivers one hardware buffer. Returns false if the device is released or suspended.
    pub fn push(&self, samples: &[f32]) -> bool {
        let Ok(mut state) = self.state.lock() else {
            return false;
        };
        if state.suspended {
            return false;
        }
        match state.callback.as_mut() {
            Some(callback) => {
                callback(samples);
                true
            }
            None => false,
        }
    }

    /// Delivers `frames` frames of a constant value in buffers of `block` frames.
    ///
    /// Returns the number of frames delivered.
    pub fn push_constant(&self, value: f32, frames: usize, block: usize, channels: u16) -> usize {
        let block = block.max(1);
        let buffer = vec![value; block * usize::from(channels.max(1))];
        let mut delivered = 0;
        while delivered < frames {
            let n = block.min(frames - delivered);
            if !self.push(&buffer[..n * usize::from(channels.max(1))]) {
                break;
            }
            delivered += n;
        }
        delivered
    }

    /// Sends a device event as the platform would.
    pub fn notify(&self, event: DeviceEvent) -> bool {
        let sender = match self.state.lock() {
            Ok(state) => state.events.clone(),
            Err(_) => None,
        };
        sender.is_some_and(|s| s.notify(event))
    }

    pub fn interrupt(&self, reason: &str) -> bool {
        self.notify(DeviceEvent::Interrupted {
            reason: reason.to_string(),
        })
    }

    pub fn restore(&self) -> bool {
        self.notify(DeviceEvent::Restored)
    }

    pub fn is_acquired(&self) -> bool {
        self.state.lock().is_ok_and(|s| s.callback.is_some())
    }

    pub fn is_suspended(&self) -> bool {
        self.state.lock().is_ok_and(|s| s.suspended)
    }

    pub fn acquire_count(&self) -> u32 {
        self.state.lock().map_or(0, |s| s.acquire_count)
    }

    pub fn release_count(&self) -> u32 {
        self.state.lock().map_or(0, |s| s.release_count)
    }

    pub fn suspend_count(&self) -> u32 {
        self.state.lock().map_or(0, |s| s.suspend_count)
    }

    pub fn resume_count(&self) -> u32 {
        self.state.lock().map_or(0, |s| s.resume_count)
    }
}
