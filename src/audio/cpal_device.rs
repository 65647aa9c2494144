//! Live microphone input using CPAL (Cross-Platform Audio Library).

use crate::audio::device::{
    AudioDevice, DeviceEvent, DeviceEventSender, InputCallback, Permission, StreamFormat,
};
use crate::error::{Result, SoundwatchError};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

/// Samples converted per callback slice on the i16 path.
const CONVERT_SCRATCH: usize = 1024;

/// Run a closure with stderr temporarily redirected to /dev/null.
///
/// CPAL probes several backends (ALSA, JACK, PipeWire) and they print harmless
/// noise to stderr while doing so.
///
/// # Safety
/// Uses `libc::dup`/`libc::dup2` to save and restore file descriptor 2 (stderr).
/// Safe as long as no other thread is concurrently manipulating fd 2.
fn with_suppressed_stderr<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    unsafe {
        let saved_fd = libc::dup(2);
        let devnull = libc::open(c"/dev/null".as_ptr(), libc::O_WRONLY);
        if saved_fd >= 0 && devnull >= 0 {
            libc::dup2(devnull, 2);
            libc::close(devnull);
        }

        let result = f();

        if saved_fd >= 0 {
            libc::dup2(saved_fd, 2);
            libc::close(saved_fd);
        }

        result
    }
}

/// Preferred device names for PipeWire/PulseAudio desktops.
const PREFERRED_DEVICES: &[&str] = &["pipewire", "pulse", "PulseAudio"];

/// Device name patterns that are never microphones.
const FILTERED_PATTERNS: &[&str] = &[
    "surround",
    "front:",
    "rear:",
    "center:",
    "side:",
    "Digital Output",
    "HDMI",
    "S/PDIF",
];

fn should_filter_device(name: &str) -> bool {
    let lower = name.to_lowercase();
    FILTERED_PATTERNS
        .iter()
        .any(|pattern| lower.contains(&pattern.to_lowercase()))
}

fn is_preferred_device(name: &str) -> bool {
    let lower = name.to_lowercase();
    PREFERRED_DEVICES
        .iter()
        .any(|pref| lower.contains(&pref.to_lowercase()))
}

/// List input devices, marking preferred ones with "\[recommended\]".
///
/// # Errors
/// Returns `SoundwatchError::AudioCapture` if device enumeration fails.
pub fn list_devices() -> Result<Vec<String>> {
    let (host, devices) = with_suppressed_stderr(|| {
        let host = cpal::default_host();
        let devices = host.input_devices();
        (host, devices)
    });
    let _host = host; // keep host alive while iterating devices
    let devices = devices.map_err(|e| SoundwatchError::AudioCapture {
        message: format!("Failed to enumerate input devices: {}", e),
    })?;

    let mut device_names = Vec::new();
    for device in devices {
        if let Ok(name) = device.name() {
            if should_filter_device(&name) {
                continue;
            }
            if is_preferred_device(&name) {
                device_names.push(format!("{} [recommended]", name));
            } else {
                device_names.push(name);
            }
        }
    }

    Ok(device_names)
}

/// Picks a named device, or the best default (PipeWire, then Pulse, then system default).
fn find_device(device_name: Option<&str>) -> Result<cpal::Device> {
    with_suppressed_stderr(|| {
        let host = cpal::default_host();

        if let Some(name) = device_name {
            let devices = host
                .input_devices()
                .map_err(|e| SoundwatchError::AudioCapture {
                    message: format!("Failed to enumerate devices: {}", e),
                })?;
            for dev in devices {
                if let Ok(dev_name) = dev.name()
                    && dev_name == name
                {
                    return Ok(dev);
                }
            }
            return Err(SoundwatchError::DeviceUnavailable {
                device: name.to_string(),
            });
        }

        if let Ok(devices) = host.input_devices() {
            for device in devices {
                if let Ok(name) = device.name()
                    && is_preferred_device(&name)
                {
                    return Ok(device);
                }
            }
        }

        host.default_input_device()
            .ok_or_else(|| SoundwatchError::DeviceUnavailable {
                device: "default".to_string(),
            })
    })
}

/// Wrapper for cpal::Stream to make it Send.
///
/// SAFETY: the stream is only touched through `&mut CpalDevice`, so it is never
/// accessed from two threads at once.
struct SendableStream(cpal::Stream);

unsafe impl Send for SendableStream {}

/// Live microphone input.
///
/// Requests the pipeline format directly (f32 first, then i16 with conversion).
/// Devices that cannot deliver the pipeline format fail acquisition instead of
/// being resampled on the real-time thread.
pub struct CpalDevice {
    name: String,
    device: cpal::Device,
    stream: Option<SendableStream>,
}

impl CpalDevice {
    /// Open `device_name`, or the best default input device when `None`.
    pub fn new(device_name: Option<&str>) -> Result<Self> {
        let device = find_device(device_name)?;
        let name = device.name().unwrap_or_else(|_| "unknown".to_string());
        Ok(Self {
            name,
            device,
            stream: None,
        })
    }

    fn build_stream(
        &self,
        format: StreamFormat,
        callback: InputCallback,
        events: DeviceEventSender,
    ) -> Result<cpal::Stream> {
        let config = cpal::StreamConfig {
            channels: format.channels,
            sample_rate: cpal::SampleRate(format.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let err_events = events.clone();
        let on_error = move |err: cpal::StreamError| {
            let event = match err {
                cpal::StreamError::DeviceNotAvailable => DeviceEvent::Lost {
                    reason: "input device disappeared".to_string(),
                },
                other => DeviceEvent::Interrupted {
                    reason: other.to_string(),
                },
            };
            err_events.notify(event);
        };

        // f32 shares the callback's sample type; hand buffers through untouched.
        let callback = std::sync::Arc::new(std::sync::Mutex::new(callback));
        let f32_callback = std::sync::Arc::clone(&callback);
        if let Ok(stream) = self.device.build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                if let Ok(mut cb) = f32_callback.try_lock() {
                    cb(data);
                }
            },
            on_error.clone(),
            None,
        ) {
            return Ok(stream);
        }

        let channels = usize::from(format.channels.max(1));
        let slice = CONVERT_SCRATCH - CONVERT_SCRATCH % channels;
        self.device
            .build_input_stream(
                &config,
                move |data: &[i16], _: &cpal::InputCallbackInfo| {
                    let Ok(mut cb) = callback.try_lock() else {
                        return;
                    };
                    let mut scratch = [0.0f32; CONVERT_SCRATCH];
                    for chunk in data.chunks(slice) {
                        for (dst, &src) in scratch.iter_mut().zip(chunk) {
                            *dst = f32::from(src) / f32::from(i16::MAX);
                        }
                        cb(&scratch[..chunk.len()]);
                    }
                },
                on_error,
                None,
            )
            .map_err(|e| SoundwatchError::AudioCapture {
                message: format!("Device '{}' cannot capture {}: {}", self.name, format, e),
            })
    }
}

impl AudioDevice for CpalDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn permission(&self) -> Permission {
        // Desktop backends prompt (or refuse) when the stream is opened.
        Permission::Undetermined
    }

    fn acquire(
        &mut self,
        format: StreamFormat,
        callback: InputCallback,
        events: DeviceEventSender,
    ) -> Result<StreamFormat> {
        self.release()?;
        let stream = self.build_stream(format, callback, events)?;
        stream.play().map_err(|e| SoundwatchError::AudioCapture {
            message: format!("Failed to start audio stream: {}", e),
        })?;
        self.stream = Some(SendableStream(stream));
        tracing::debug!(device = %self.name, %format, "cpal stream started");
        Ok(format)
    }

    fn suspend(&mut self) -> Result<()> {
        if let Some(stream) = &self.stream {
            stream.0.pause().map_err(|e| SoundwatchError::DeviceLost {
                message: format!("Failed to pause audio stream: {}", e),
            })?;
        }
        Ok(())
    }

    fn resume(&mut self) -> Result<()> {
        match &self.stream {
            Some(stream) => stream.0.play().map_err(|e| SoundwatchError::DeviceLost {
                message: format!("Failed to resume audio stream: {}", e),
            }),
            None => Err(SoundwatchError::DeviceLost {
                message: "no open stream to resume".to_string(),
            }),
        }
    }

    fn release(&mut self) -> Result<()> {
        if let Some(stream) = self.stream.take() {
            stream.0.pause().map_err(|e| SoundwatchError::AudioCapture {
                message: format!("Failed to stop audio stream: {}", e),
            })?;
        }
        Ok(())
    }
}
