//! soundwatch - streaming sound classification from a live audio input
//!
//! Captures audio into a lock-free ring buffer, classifies overlapping
//! windows on a worker thread and delivers timestamped results, lifecycle
//! changes and errors through a bounded event queue.
//!
//! ```no_run
//! use soundwatch::{LevelClassifier, PipelineConfig, PipelineController, PipelineEvent};
//! use soundwatch::audio::WavDevice;
//! use soundwatch::classify::Classifier;
//! use std::time::Duration;
//!
//! # fn main() -> soundwatch::Result<()> {
//! let device = WavDevice::open(std::path::Path::new("dog.wav"))?;
//! let loader = |_: &PipelineConfig| -> soundwatch::Result<Box<dyn Classifier>> {
//!     Ok(Box::new(LevelClassifier::default()))
//! };
//! let controller = PipelineController::new(PipelineConfig::default(), device, loader)?;
//! let events = controller.events();
//! controller.start()?;
//! while let Some(event) = events.recv_timeout(Duration::from_secs(1)) {
//!     if let PipelineEvent::Result(result) = event {
//!         println!("{:?}", result.top());
//!     }
//! }
//! controller.stop()?;
//! # Ok(())
//! # }
//! ```

// Error handling discipline: propagate, never panic in library code
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::let_underscore_must_use)]

pub mod audio;
pub mod classify;
#[cfg(feature = "cli")]
pub mod cli;
pub mod config;
pub mod defaults;
pub mod error;
pub mod pipeline;

// Core seams (device → classifier → subscriber)
pub use audio::device::{AudioDevice, DeviceEvent, Permission, StreamFormat};
pub use classify::classifier::{Classifier, ClassifierLoader, LabelScore, LevelClassifier};
pub use pipeline::event::Subscriber;

// Pipeline
pub use audio::capture::AudioCaptureSession;
pub use audio::ring_buffer::SampleRingBuffer;
pub use classify::result::ClassificationResult;
pub use classify::streaming::StreamingClassifier;
pub use pipeline::controller::{ControlOutcome, PipelineController, PipelineStats};
pub use pipeline::dispatcher::{EventStream, ResultDispatcher};
pub use pipeline::event::{ErrorEvent, PipelineEvent, StateChange};
pub use pipeline::state::{FailureReason, PipelineState};

// Error handling
pub use error::{ErrorKind, Result, SoundwatchError};

// Config
pub use config::{OverflowPolicy, PipelineConfig};

/// Build version string with optional git commit hash.
///
/// Returns `"0.1.0+abc1234"` when git hash is available, `"0.1.0"` otherwise.
pub fn version_string() -> String {
    let version = env!("CARGO_PKG_VERSION");
    match option_env!("GIT_HASH") {
        Some(hash) if !hash.is_empty() => format!("{}+{}", version, hash),
        _ => version.to_string(),
    }
}
