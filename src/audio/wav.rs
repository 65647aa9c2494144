//! WAV file playback as an audio device.
//!
//! The file is decoded up front, converted to the requested format and then
//! pushed through the input callback from a playback thread in fixed blocks,
//! optionally paced at real-time speed.

use crate::audio::device::{AudioDevice, DeviceEventSender, InputCallback, Permission, StreamFormat};
use crate::error::{Result, SoundwatchError};
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Frames per delivered block (10 ms at 16 kHz).
const DEFAULT_BLOCK_FRAMES: usize = 160;

/// Sleep while suspended.
const PAUSE_POLL: Duration = Duration::from_millis(5);

/// Decoded WAV contents, interleaved `f32` in `[-1, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct WavClip {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl WavClip {
    /// Decode from any reader.
    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        let mut wav_reader = hound::WavReader::new(reader).map_err(|e| {
            SoundwatchError::AudioCapture {
                message: format!("Failed to parse WAV file: {}", e),
            }
        })?;
        let spec = wav_reader.spec();

        let samples = match spec.sample_format {
            hound::SampleFormat::Float => wav_reader
                .samples::<f32>()
                .collect::<std::result::Result<Vec<_>, _>>(),
            hound::SampleFormat::Int => {
                let scale = 1.0 / (1i64 << (spec.bits_per_sample.max(1) - 1)) as f32;
                wav_reader
                    .samples::<i32>()
                    .map(|s| s.map(|v| v as f32 * scale))
                    .collect::<std::result::Result<Vec<_>, _>>()
            }
        }
        .map_err(|e| SoundwatchError::AudioCapture {
            message: format!("Failed to read WAV samples: {}", e),
        })?;

        Ok(Self {
            samples,
            sample_rate: spec.sample_rate,
            channels: spec.channels,
        })
    }

    pub fn open(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path).map_err(|e| SoundwatchError::AudioCapture {
            message: format!("Failed to open {}: {}", path.display(), e),
        })?;
        Self::from_reader(std::io::BufReader::new(file))
    }

    pub fn frame_count(&self) -> usize {
        self.samples.len() / usize::from(self.channels.max(1))
    }

    pub fn duration(&self) -> Duration {
        crate::config::frames_to_duration(self.frame_count() as u64, self.sample_rate)
    }

    /// Converts to `format`: channel mixing first, then resampling.
    pub fn convert(&self, format: StreamFormat) -> Vec<f32> {
        let source_channels = usize::from(self.channels.max(1));
        let target_channels = usize::from(format.channels.max(1));

        if source_channels == target_channels {
            if self.sample_rate == format.sample_rate {
                return self.samples.clone();
            }
            // Resample each channel independently and re-interleave.
            let per_channel: Vec<Vec<f32>> = (0..source_channels)
                .map(|c| {
                    let channel: Vec<f32> = self
                        .samples
                        .iter()
                        .skip(c)
                        .step_by(source_channels)
                        .copied()
                        .collect();
                    resample(&channel, self.sample_rate, format.sample_rate)
                })
                .collect();
            return interleave(&per_channel);
        }

        let mono = mix_to_mono(&self.samples, source_channels);
        let mono = resample(&mono, self.sample_rate, format.sample_rate);
        if target_channels == 1 {
            mono
        } else {
            mono.iter()
                .flat_map(|&s| std::iter::repeat_n(s, target_channels))
                .collect()
        }
    }
}

fn mix_to_mono(samples: &[f32], channels: usize) -> Vec<f32> {
    if channels == 1 {
        return samples.to_vec();
    }
    let scale = 1.0 / channels as f32;
    samples
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() * scale)
        .collect()
}

fn interleave(channels: &[Vec<f32>]) -> Vec<f32> {
    let frames = channels.iter().map(Vec::len).min().unwrap_or(0);
    let mut out = Vec::with_capacity(frames * channels.len());
    for i in 0..frames {
        for channel in channels {
            out.push(channel[i]);
        }
    }
    out
}

/// Simple linear interpolation resampling.
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let ratio = from_rate as f64 / to_rate as f64;
    let output_len = (samples.len() as f64 / ratio).ceil() as usize;

    (0..output_len)
        .map(|i| {
            let source_pos = i as f64 * ratio;
            let source_idx = (source_pos.floor() as usize).min(samples.len() - 1);
            let fraction = source_pos - source_idx as f64;

            if source_idx + 1 >= samples.len() {
                samples[source_idx]
            } else {
                let left = samples[source_idx] as f64;
                let right = samples[source_idx + 1] as f64;
                (left + (right - left) * fraction) as f32
            }
        })
        .collect()
}

#[derive(Debug, Default)]
struct PlaybackState {
    stop: AtomicBool,
    paused: AtomicBool,
    finished: AtomicBool,
    frames_played: AtomicU64,
}

/// Observes a running [`WavDevice`] playback.
#[derive(Debug, Clone)]
pub struct PlaybackProgress {
    state: Arc<PlaybackState>,
}

impl PlaybackProgress {
    /// True once every frame of the latest acquisition has been delivered.
    pub fn is_finished(&self) -> bool {
        self.state.finished.load(Ordering::Acquire)
    }

    pub fn frames_played(&self) -> u64 {
        self.state.frames_played.load(Ordering::Relaxed)
    }
}

/// Audio device that plays a WAV clip into the pipeline.
pub struct WavDevice {
    name: String,
    clip: WavClip,
    block_frames: usize,
    realtime: bool,
    state: Arc<PlaybackState>,
    thread: Option<JoinHandle<()>>,
}

impl WavDevice {
    pub fn new(name: impl Into<String>, clip: WavClip) -> Self {
        Self {
            name: name.into(),
            clip,
            block_frames: DEFAULT_BLOCK_FRAMES,
            realtime: false,
            state: Arc::new(PlaybackState::default()),
            thread: None,
        }
    }

    pub fn open(path: &Path) -> Result<Self> {
        let clip = WavClip::open(path)?;
        Ok(Self::new(path.display().to_string(), clip))
    }

    /// Deliver blocks of `frames` frames per callback.
    pub fn with_block_frames(mut self, frames: usize) -> Self {
        self.block_frames = frames.max(1);
        self
    }

    /// Pace delivery at the clip's real-time rate instead of as fast as possible.
    pub fn with_realtime(mut self, realtime: bool) -> Self {
        self.realtime = realtime;
        self
    }

    pub fn clip(&self) -> &WavClip {
        &self.clip
    }

    pub fn progress(&self) -> PlaybackProgress {
        PlaybackProgress {
            state: Arc::clone(&self.state),
        }
    }

    fn join_playback(&mut self) {
        self.state.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            tracing::warn!(device = %self.name, "playback thread panicked");
        }
    }
}

impl AudioDevice for WavDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn permission(&self) -> Permission {
        Permission::Granted
    }

    fn acquire(
        &mut self,
        format: StreamFormat,
        mut callback: InputCallback,
        _events: DeviceEventSender,
    ) -> Result<StreamFormat> {
        self.join_playback();

        let samples = self.clip.convert(format);
        let channels = usize::from(format.channels.max(1));
        let block_samples = self.block_frames * channels;
        let block_duration =
            crate::config::frames_to_duration(self.block_frames as u64, format.sample_rate);
        let realtime = self.realtime;

        self.state.stop.store(false, Ordering::Release);
        self.state.paused.store(false, Ordering::Release);
        self.state.finished.store(false, Ordering::Release);
        self.state.frames_played.store(0, Ordering::Relaxed);
        let state = Arc::clone(&self.state);

        let thread = thread::Builder::new()
            .name("wav-playback".to_string())
            .spawn(move || {
                for block in samples.chunks(block_samples) {
                    while state.paused.load(Ordering::Acquire) {
                        if state.stop.load(Ordering::Acquire) {
                            return;
                        }
                        thread::sleep(PAUSE_POLL);
                    }
                    if state.stop.load(Ordering::Acquire) {
                        return;
                    }
                    callback(block);
                    state
                        .frames_played
                        .fetch_add((block.len() / channels) as u64, Ordering::Relaxed);
                    if realtime {
                        thread::sleep(block_duration);
                    }
                }
                state.finished.store(true, Ordering::Release);
            })
            .map_err(|e| SoundwatchError::AudioCapture {
                message: format!("Failed to spawn playback thread: {}", e),
            })?;
        self.thread = Some(thread);

        tracing::debug!(device = %self.name, frames = self.clip.frame_count(), "wav playback started");
        Ok(format)
    }

    fn suspend(&mut self) -> Result<()> {
        self.state.paused.store(true, Ordering::Release);
        Ok(())
    }

    fn resume(&mut self) -> Result<()> {
        self.state.paused.store(false, Ordering::Release);
        Ok(())
    }

    fn release(&mut self) -> Result<()> {
        self.join_playback();
        Ok(())
    }
}

impl Drop for WavDevice {
    fn drop(&mut self) {
        self.join_playback();
    }
}
