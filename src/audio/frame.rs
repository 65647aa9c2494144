//! Frame types flowing from the ring buffer to the classifier.

use crate::config::frames_to_duration;
use std::time::Duration;

/// One multi-channel sample set with its position in the stream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AudioFrame<'a> {
    /// Monotonic frame index since the capture session started.
    pub index: u64,
    /// One sample per channel.
    pub samples: &'a [f32],
}

/// A contiguous run of frames copied out of the ring buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameBlock {
    /// Index of the first frame in this block.
    pub start_frame: u64,
    /// Interleaved channel count.
    pub channels: u16,
    /// Interleaved samples, `frame_count() * channels` long.
    pub samples: Vec<f32>,
}

impl FrameBlock {
    pub fn new(start_frame: u64, channels: u16, samples: Vec<f32>) -> Self {
        Self {
            start_frame,
            channels,
            samples,
        }
    }

    /// Number of whole frames in this block.
    pub fn frame_count(&self) -> usize {
        self.samples.len() / usize::from(self.channels.max(1))
    }

    /// Index one past the last frame in this block.
    pub fn end_frame(&self) -> u64 {
        self.start_frame + self.frame_count() as u64
    }

    /// Returns the frame at `offset` within this block.
    pub fn frame(&self, offset: usize) -> Option<AudioFrame<'_>> {
        let channels = usize::from(self.channels.max(1));
        let start = offset.checked_mul(channels)?;
        let samples = self.samples.get(start..start + channels)?;
        Some(AudioFrame {
            index: self.start_frame + offset as u64,
            samples,
        })
    }

    /// Iterates frames in stream order.
    pub fn frames(&self) -> impl Iterator<Item = AudioFrame<'_>> + '_ {
        let channels = usize::from(self.channels.max(1));
        self.samples
            .chunks_exact(channels)
            .enumerate()
            .map(move |(i, samples)| AudioFrame {
                index: self.start_frame + i as u64,
                samples,
            })
    }
}

/// A fixed-length span of frames submitted to the classifier as one unit.
///
/// Owned by the streaming classifier; never aliases ring buffer storage.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassificationWindow {
    pub block: FrameBlock,
    pub sample_rate: u32,
}

impl ClassificationWindow {
    pub fn new(block: FrameBlock, sample_rate: u32) -> Self {
        Self { block, sample_rate }
    }

    pub fn start_frame(&self) -> u64 {
        self.block.start_frame
    }

    pub fn frame_count(&self) -> usize {
        self.block.frame_count()
    }

    pub fn channels(&self) -> u16 {
        self.block.channels
    }

    /// Interleaved samples.
    pub fn samples(&self) -> &[f32] {
        &self.block.samples
    }

    /// Stream time of the first frame.
    pub fn start_time(&self) -> Duration {
        frames_to_duration(self.block.start_frame, self.sample_rate)
    }

    /// Stream time one past the last frame.
    pub fn end_time(&self) -> Duration {
        frames_to_duration(self.block.end_frame(), self.sample_rate)
    }

    /// Averages all channels into a mono signal.
    pub fn mono(&self) -> Vec<f32> {
        let channels = self.block.channels.max(1);
        if channels == 1 {
            return self.block.samples.clone();
        }
        let scale = 1.0 / f32::from(channels);
        self.block
            .samples
            .chunks_exact(usize::from(channels))
            .map(|frame| frame.iter().sum::<f32>() * scale)
            .collect()
    }
}
