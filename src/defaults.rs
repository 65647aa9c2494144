//! Default configuration constants for soundwatch.
//!
//! Shared by [`PipelineConfig`](crate::config::PipelineConfig) and the CLI so both
//! agree on what an unconfigured pipeline looks like.

/// Default audio sample rate in Hz.
///
/// 16kHz covers the band most environmental sound classifiers are trained on.
pub const SAMPLE_RATE: u32 = 16000;

/// Default number of interleaved input channels.
pub const CHANNEL_COUNT: u16 = 1;

/// Largest channel count a pipeline accepts.
pub const MAX_CHANNELS: u16 = 8;

/// Default classification window length in frames (0.975s at 16kHz).
pub const WINDOW_FRAMES: usize = 15600;

/// Default hop between successive windows in frames (50% overlap).
pub const HOP_FRAMES: usize = 7800;

/// Default minimum top-label confidence for a result to be delivered.
pub const MIN_CONFIDENCE: f32 = 0.5;

/// Default ring buffer capacity in frames: four windows of headroom.
pub const RING_CAPACITY_FRAMES: usize = WINDOW_FRAMES * 4;

/// Default time allowed for an interrupted input to come back.
pub const RECOVERY_TIMEOUT_MS: u64 = 2000;

/// Consecutive classifier failures tolerated before the pipeline fails.
pub const MAX_CONSECUTIVE_FAILURES: u32 = 3;

/// Default capacity of the result/event delivery queue.
pub const DISPATCH_QUEUE_CAPACITY: usize = 64;

/// Idle sleep for the classification and supervision loops.
pub const POLL_INTERVAL_MS: u64 = 10;

/// Label emitted by [`LevelClassifier`](crate::classify::LevelClassifier) for quiet windows.
pub const SILENCE_LABEL: &str = "silence";

/// Label emitted by [`LevelClassifier`](crate::classify::LevelClassifier) for audible windows.
pub const SOUND_LABEL: &str = "sound";
