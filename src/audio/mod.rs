//! Audio input: devices, the capture session and the sample ring buffer.

pub mod capture;
#[cfg(feature = "cpal-audio")]
pub mod cpal_device;
pub mod device;
pub mod frame;
pub mod ring_buffer;
pub mod wav;

pub use capture::{AudioCaptureSession, CaptureStats, CaptureStatsHandle};
pub use device::{
    AudioDevice, DeviceEvent, DeviceEventSender, InputCallback, MockDevice, MockDeviceHandle,
    Permission, SessionEvent, StreamFormat,
};
pub use frame::{AudioFrame, ClassificationWindow, FrameBlock};
pub use ring_buffer::{DropReport, RingConsumer, RingProducer, SampleRingBuffer, WriteOutcome};
pub use wav::{PlaybackProgress, WavClip, WavDevice};
