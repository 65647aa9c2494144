use crate::defaults;
use crate::error::{Result, SoundwatchError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What the ring buffer does when the producer outpaces the classifier.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Overwrite the oldest unread frames; the classifier skips ahead.
    #[default]
    DropOldest,
    /// Discard incoming frames that do not fit.
    DropNewest,
}

impl std::str::FromStr for OverflowPolicy {
    type Err = SoundwatchError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "drop_oldest" | "dropoldest" => Ok(OverflowPolicy::DropOldest),
            "drop_newest" | "dropnewest" => Ok(OverflowPolicy::DropNewest),
            other => Err(SoundwatchError::ConfigInvalidValue {
                key: "overflow_policy".to_string(),
                message: format!("unknown policy '{other}' (expected drop_oldest or drop_newest)"),
            }),
        }
    }
}

/// Pipeline configuration, fixed at construction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    pub sample_rate: u32,
    pub channel_count: u16,
    /// Window length N in frames.
    pub window_frames: usize,
    /// Hop H in frames, `1 <= H <= N`.
    pub hop_frames: usize,
    /// Results whose best confidence is below this are suppressed.
    pub min_confidence: f32,
    pub ring_capacity_frames: usize,
    pub overflow_policy: OverflowPolicy,
    pub recovery_timeout_ms: u64,
    pub max_consecutive_failures: u32,
    pub dispatch_queue_capacity: usize,
    pub poll_interval_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            sample_rate: defaults::SAMPLE_RATE,
            channel_count: defaults::CHANNEL_COUNT,
            window_frames: defaults::WINDOW_FRAMES,
            hop_frames: defaults::HOP_FRAMES,
            min_confidence: defaults::MIN_CONFIDENCE,
            ring_capacity_frames: defaults::RING_CAPACITY_FRAMES,
            overflow_policy: OverflowPolicy::default(),
            recovery_timeout_ms: defaults::RECOVERY_TIMEOUT_MS,
            max_consecutive_failures: defaults::MAX_CONSECUTIVE_FAILURES,
            dispatch_queue_capacity: defaults::DISPATCH_QUEUE_CAPACITY,
            poll_interval_ms: defaults::POLL_INTERVAL_MS,
        }
    }
}

impl PipelineConfig {
    /// Parse configuration from a TOML document.
    ///
    /// Missing fields use default values. The result is not validated.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Apply environment variable overrides
    ///
    /// Supported environment variables:
    /// - SOUNDWATCH_MIN_CONFIDENCE → min_confidence
    /// - SOUNDWATCH_WINDOW_FRAMES → window_frames
    /// - SOUNDWATCH_HOP_FRAMES → hop_frames
    /// - SOUNDWATCH_OVERFLOW_POLICY → overflow_policy
    ///
    /// Unparseable values are ignored with a warning.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(value) = env_parse::<f32>("SOUNDWATCH_MIN_CONFIDENCE") {
            self.min_confidence = value;
        }
        if let Some(value) = env_parse::<usize>("SOUNDWATCH_WINDOW_FRAMES") {
            self.window_frames = value;
        }
        if let Some(value) = env_parse::<usize>("SOUNDWATCH_HOP_FRAMES") {
            self.hop_frames = value;
        }
        if let Some(value) = env_parse::<OverflowPolicy>("SOUNDWATCH_OVERFLOW_POLICY") {
            self.overflow_policy = value;
        }
        self
    }

    /// Check every option against the pipeline's structural requirements.
    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 {
            return Err(invalid("sample_rate", "must be positive"));
        }
        if self.channel_count == 0 || self.channel_count > defaults::MAX_CHANNELS {
            return Err(invalid(
                "channel_count",
                &format!("must be between 1 and {}", defaults::MAX_CHANNELS),
            ));
        }
        if self.window_frames == 0 {
            return Err(invalid("window_frames", "must be positive"));
        }
        if self.hop_frames == 0 {
            return Err(invalid("hop_frames", "must be positive"));
        }
        if self.hop_frames > self.window_frames {
            return Err(invalid("hop_frames", "must not exceed window_frames"));
        }
        if !(0.0..=1.0).contains(&self.min_confidence) {
            return Err(invalid("min_confidence", "must be within [0, 1]"));
        }
        if self.ring_capacity_frames < self.window_frames + self.hop_frames {
            return Err(invalid(
                "ring_capacity_frames",
                "must hold at least one window plus one hop",
            ));
        }
        if self.recovery_timeout_ms == 0 {
            return Err(invalid("recovery_timeout_ms", "must be positive"));
        }
        if self.max_consecutive_failures == 0 {
            return Err(invalid("max_consecutive_failures", "must be positive"));
        }
        if self.dispatch_queue_capacity == 0 {
            return Err(invalid("dispatch_queue_capacity", "must be positive"));
        }
        Ok(())
    }

    /// Duration covered by one classification window.
    pub fn window_duration(&self) -> Duration {
        frames_to_duration(self.window_frames as u64, self.sample_rate)
    }

    /// Duration between the starts of successive windows.
    pub fn hop_duration(&self) -> Duration {
        frames_to_duration(self.hop_frames as u64, self.sample_rate)
    }

    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Converts a frame count to stream time at the given sample rate.
pub fn frames_to_duration(frames: u64, sample_rate: u32) -> Duration {
    let rate = u64::from(sample_rate.max(1));
    let secs = frames / rate;
    let rem = frames % rate;
    Duration::from_secs(secs) + Duration::from_nanos(rem * 1_000_000_000 / rate)
}

fn invalid(key: &str, message: &str) -> SoundwatchError {
    SoundwatchError::ConfigInvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok().filter(|v| !v.is_empty())?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(variable = name, value = %raw, "ignoring unparseable override");
            None
        }
    }
}
