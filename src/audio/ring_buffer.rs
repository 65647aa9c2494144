//! Fixed-capacity single-producer/single-consumer ring buffer for audio frames.
//!
//! The producer half lives inside the audio callback, the consumer half on the
//! classification thread. All storage is allocated up front; `write` touches
//! only atomics and never waits on the consumer.
//!
//! Cursors are absolute frame indices (`u64`) that only grow:
//! - `write`: one past the last frame the consumer may read
//! - `claim`: one past the last frame the producer may be writing (`>= write`)
//! - `read`: the consumer's position
//!
//! Under [`OverflowPolicy::DropOldest`] the producer overwrites unread frames and the
//! consumer notices it was lapped. A copy is validated against `claim` after it
//! is taken, so a block that was overwritten mid-copy is retried instead of returned.

use crate::audio::frame::FrameBlock;
use crate::config::OverflowPolicy;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering, fence};

/// Copy attempts before a lapped consumer reports no data.
const MAX_READ_ATTEMPTS: usize = 4;

/// Result of a single producer write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOutcome {
    /// Frames accepted into the buffer.
    pub written: usize,
    /// Frames lost to the overflow policy by this write.
    ///
    /// For `DropNewest` these are incoming frames; for `DropOldest` they are
    /// older, unread frames that were overwritten.
    pub dropped: usize,
}

/// Drop counters accumulated by the producer since the last report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DropReport {
    /// Frames lost.
    pub frames: u64,
    /// Writes that lost at least one frame.
    pub incidents: u64,
}

impl DropReport {
    pub fn is_empty(&self) -> bool {
        self.frames == 0
    }
}

struct Shared {
    slots: Box<[AtomicU32]>,
    capacity: usize,
    channels: usize,
    policy: OverflowPolicy,
    write: AtomicU64,
    claim: AtomicU64,
    read: AtomicU64,
    dropped_frames: AtomicU64,
    drop_incidents: AtomicU64,
}

impl Shared {
    fn slot_base(&self, frame: u64) -> usize {
        (frame % self.capacity as u64) as usize * self.channels
    }
}

/// Ring buffer storage, split into its two halves with [`SampleRingBuffer::split`].
pub struct SampleRingBuffer {
    shared: Arc<Shared>,
}

impl SampleRingBuffer {
    /// Allocates storage for `capacity_frames` frames of `channels` samples.
    pub fn new(capacity_frames: usize, channels: u16, policy: OverflowPolicy) -> Self {
        let capacity = capacity_frames.max(1);
        let channels = usize::from(channels.max(1));
        let slots = (0..capacity * channels)
            .map(|_| AtomicU32::new(0))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            shared: Arc::new(Shared {
                slots,
                capacity,
                channels,
                policy,
                write: AtomicU64::new(0),
                claim: AtomicU64::new(0),
                read: AtomicU64::new(0),
                dropped_frames: AtomicU64::new(0),
                drop_incidents: AtomicU64::new(0),
            }),
        }
    }

    /// Splits into the producer (audio callback) and consumer (classifier) halves.
    pub fn split(self) -> (RingProducer, RingConsumer) {
        (
            RingProducer {
                shared: Arc::clone(&self.shared),
                write: 0,
                overwritten_until: 0,
            },
            RingConsumer {
                shared: self.shared,
                read: 0,
                lapped_frames: 0,
            },
        )
    }
}

/// Writing half. Owned by exactly one audio-producing context.
pub struct RingProducer {
    shared: Arc<Shared>,
    write: u64,
    overwritten_until: u64,
}

impl RingProducer {
    /// Appends interleaved frames, applying the overflow policy.
    ///
    /// A trailing partial frame is ignored. Runs in time proportional to the
    /// input length, performs no allocation and never blocks.
    pub fn write(&mut self, interleaved: &[f32]) -> WriteOutcome {
        let shared = &*self.shared;
        let frames = interleaved.len() / shared.channels;
        if frames == 0 {
            return WriteOutcome::default();
        }

        match shared.policy {
            OverflowPolicy::DropNewest => {
                let read = shared.read.load(Ordering::Acquire);
                let used = (self.write - read) as usize;
                let accepted = frames.min(shared.capacity.saturating_sub(used));
                let new_write = self.write + accepted as u64;

                shared.claim.store(new_write, Ordering::Relaxed);
                fence(Ordering::Release);
                self.copy_in(self.write, &interleaved[..accepted * shared.channels]);
                shared.write.store(new_write, Ordering::Release);
                self.write = new_write;

                let dropped = frames - accepted;
                self.record_drop(dropped as u64);
                WriteOutcome {
                    written: accepted,
                    dropped,
                }
            }
            OverflowPolicy::DropOldest => {
                // Only the newest `capacity` frames of an oversized block can survive.
                let skipped = frames.saturating_sub(shared.capacity);
                let new_write = self.write + frames as u64;
                let new_oldest = new_write.saturating_sub(shared.capacity as u64);

                let read = shared.read.load(Ordering::Acquire);
                let accounted = read.max(self.overwritten_until);
                let lost = new_oldest.saturating_sub(accounted);
                if new_oldest > self.overwritten_until {
                    self.overwritten_until = new_oldest;
                }

                shared.claim.store(new_write, Ordering::Relaxed);
                fence(Ordering::Release);
                self.copy_in(
                    self.write + skipped as u64,
                    &interleaved[skipped * shared.channels..frames * shared.channels],
                );
                shared.write.store(new_write, Ordering::Release);
                self.write = new_write;

                self.record_drop(lost);
                WriteOutcome {
                    written: frames,
                    dropped: lost as usize,
                }
            }
        }
    }

    fn copy_in(&self, first_frame: u64, samples: &[f32]) {
        let shared = &*self.shared;
        let total = shared.slots.len();
        let mut idx = shared.slot_base(first_frame);
        for sample in samples {
            shared.slots[idx].store(sample.to_bits(), Ordering::Relaxed);
            idx += 1;
            if idx == total {
                idx = 0;
            }
        }
    }

    fn record_drop(&self, frames: u64) {
        if frames > 0 {
            self.shared
                .dropped_frames
                .fetch_add(frames, Ordering::Relaxed);
            self.shared.drop_incidents.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Total frames written so far, including frames later overwritten.
    pub fn frames_written(&self) -> u64 {
        self.write
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn channels(&self) -> u16 {
        self.shared.channels as u16
    }
}

/// Reading half. Owned by exactly one classification context.
pub struct RingConsumer {
    shared: Arc<Shared>,
    read: u64,
    lapped_frames: u64,
}

impl RingConsumer {
    /// Copies the next `n` frames without consuming them.
    ///
    /// Returns `None` when fewer than `n` frames are available. Never blocks.
    pub fn try_peek(&mut self, n: usize) -> Option<FrameBlock> {
        if n == 0 || n > self.shared.capacity {
            return None;
        }
        let capacity = self.shared.capacity as u64;
        let channels = self.shared.channels;

        for _ in 0..MAX_READ_ATTEMPTS {
            let write = self.shared.write.load(Ordering::Acquire);
            let oldest = write.saturating_sub(capacity);
            if self.read < oldest {
                self.lapped_frames += oldest - self.read;
                self.publish_read(oldest);
            }
            if write - self.read < n as u64 {
                return None;
            }

            let mut samples = Vec::with_capacity(n * channels);
            let total = self.shared.slots.len();
            let mut idx = self.shared.slot_base(self.read);
            for _ in 0..n * channels {
                samples.push(f32::from_bits(
                    self.shared.slots[idx].load(Ordering::Relaxed),
                ));
                idx += 1;
                if idx == total {
                    idx = 0;
                }
            }

            fence(Ordering::Acquire);
            let claim = self.shared.claim.load(Ordering::Relaxed);
            if claim <= self.read + capacity {
                return Some(FrameBlock::new(self.read, channels as u16, samples));
            }
            // Overwritten while copying; the next attempt skips past the damage.
        }
        None
    }

    /// Copies and consumes the next `n` frames.
    pub fn try_read(&mut self, n: usize) -> Option<FrameBlock> {
        let block = self.try_peek(n)?;
        self.advance(n);
        Some(block)
    }

    /// Consumes up to `n` frames without copying them.
    ///
    /// Returns the number of frames actually skipped.
    pub fn advance(&mut self, n: usize) -> usize {
        let write = self.shared.write.load(Ordering::Acquire);
        let step = (n as u64).min(write.saturating_sub(self.read));
        if step > 0 {
            self.publish_read(self.read + step);
        }
        step as usize
    }

    /// Frames currently readable, counting frames that may be overwritten before
    /// they are read.
    pub fn available(&self) -> usize {
        let write = self.shared.write.load(Ordering::Acquire);
        let oldest = write.saturating_sub(self.shared.capacity as u64);
        (write - self.read.max(oldest)) as usize
    }

    /// Index of the next frame this consumer will read.
    pub fn position(&self) -> u64 {
        self.read
    }

    /// Frames skipped because the producer lapped this consumer.
    pub fn lapped_frames(&self) -> u64 {
        self.lapped_frames
    }

    /// Takes and resets the producer's drop counters.
    pub fn take_drop_report(&self) -> DropReport {
        DropReport {
            frames: self.shared.dropped_frames.swap(0, Ordering::Relaxed),
            incidents: self.shared.drop_incidents.swap(0, Ordering::Relaxed),
        }
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.shared.policy
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn channels(&self) -> u16 {
        self.shared.channels as u16
    }

    fn publish_read(&mut self, position: u64) {
        self.read = position;
        self.shared.read.store(position, Ordering::Release);
    }
}
