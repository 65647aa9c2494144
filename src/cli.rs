//! Command-line interface for soundwatch
//!
//! Provides argument parsing using clap derive macros.

use crate::config::{OverflowPolicy, PipelineConfig};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

/// Streaming sound classification from a live audio input
#[derive(Parser, Debug)]
#[command(
    name = "soundwatch",
    version,
    about = "Streaming sound classification from a live audio input"
)]
pub struct Cli {
    /// Subcommand to execute (default: listen)
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Path to configuration file (TOML)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Suppress status output, print results only
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Verbose output (-v: debug, -vv: trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Audio input device name (default: system default input)
    #[arg(long, value_name = "DEVICE", conflicts_with = "input")]
    pub device: Option<String>,

    /// Classify a WAV file instead of a live device
    #[arg(long, short = 'i', value_name = "FILE")]
    pub input: Option<PathBuf>,

    /// Play the WAV file at its real-time rate instead of as fast as possible
    #[arg(long, requires = "input")]
    pub realtime: bool,

    /// Stop after this long (e.g., 30s, 5m). Default: until input ends or Ctrl-C
    #[arg(long, short = 'd', value_name = "DURATION", value_parser = parse_duration)]
    pub duration: Option<Duration>,

    /// Classification window length (e.g., 975ms, 1s)
    #[arg(long, short = 'w', value_name = "DURATION", value_parser = parse_duration)]
    pub window: Option<Duration>,

    /// Hop between successive windows (e.g., 500ms)
    #[arg(long, value_name = "DURATION", value_parser = parse_duration)]
    pub hop: Option<Duration>,

    /// Minimum top-label confidence for a result to be printed (0.0-1.0)
    #[arg(long, short = 'm', value_name = "CONFIDENCE")]
    pub min_confidence: Option<f32>,

    /// RMS level at which the level classifier reports sound
    #[arg(long, value_name = "LEVEL")]
    pub threshold: Option<f32>,

    /// Ring buffer overflow policy (drop_oldest, drop_newest)
    #[arg(long, value_name = "POLICY")]
    pub overflow_policy: Option<OverflowPolicy>,

    /// Emit results and events as JSON lines
    #[arg(long)]
    pub json: bool,
}

/// Parse a duration string.
///
/// Bare numbers are seconds (fractions allowed); anything else goes through
/// `humantime` (`975ms`, `30s`, `1m30s`).
fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if let Ok(secs) = s.parse::<f64>() {
        return Duration::try_from_secs_f64(secs).map_err(|e| e.to_string());
    }
    humantime::parse_duration(s).map_err(|e| e.to_string())
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Classify audio until stopped (default)
    Listen,

    /// List available audio input devices
    Devices,

    /// Print the effective configuration as TOML
    Config,
}

impl Cli {
    /// Applies command-line overrides on top of `config`.
    ///
    /// Window and hop durations are converted to frames at the configured
    /// sample rate. Validation is left to the pipeline.
    pub fn apply_overrides(&self, mut config: PipelineConfig) -> PipelineConfig {
        if let Some(window) = self.window {
            config.window_frames = duration_to_frames(window, config.sample_rate);
        }
        if let Some(hop) = self.hop {
            config.hop_frames = duration_to_frames(hop, config.sample_rate);
        }
        if config.ring_capacity_frames < config.window_frames + config.hop_frames {
            config.ring_capacity_frames = config.window_frames * 4;
        }
        if let Some(min_confidence) = self.min_confidence {
            config.min_confidence = min_confidence;
        }
        if let Some(policy) = self.overflow_policy {
            config.overflow_policy = policy;
        }
        config
    }
}

/// Frames covered by `duration` at `sample_rate`, rounded to nearest.
pub fn duration_to_frames(duration: Duration, sample_rate: u32) -> usize {
    (duration.as_secs_f64() * f64::from(sample_rate)).round() as usize
}
