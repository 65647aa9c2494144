use crate::audio::frame::ClassificationWindow;
use crate::classify::classifier::LabelScore;
use crate::error::{Result, SoundwatchError};
use serde::{Serialize, Serializer};
use std::time::Duration;

/// Scores for one window, sorted by descending confidence.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassificationResult {
    /// Controller start that produced this result, counted from 1. Frame
    /// indices and stream time restart at zero with every session.
    pub session: u64,
    /// Stream time of the window's first frame.
    #[serde(serialize_with = "as_secs_f64")]
    pub window_start: Duration,
    /// Stream time one past the window's last frame.
    #[serde(serialize_with = "as_secs_f64")]
    pub window_end: Duration,
    pub start_frame: u64,
    pub frame_count: usize,
    pub scores: Vec<LabelScore>,
}

impl ClassificationResult {
    /// Validates raw classifier output and builds a result for `window`.
    ///
    /// Scores are sorted descending; equal confidences keep the classifier's order.
    ///
    /// # Errors
    /// `InvalidScores` if any confidence is NaN or outside `[0, 1]`.
    pub fn from_scores(window: &ClassificationWindow, mut scores: Vec<LabelScore>) -> Result<Self> {
        if let Some(bad) = scores
            .iter()
            .find(|s| !(0.0..=1.0).contains(&s.confidence))
        {
            return Err(SoundwatchError::InvalidScores {
                message: format!("label '{}' has confidence {}", bad.label, bad.confidence),
            });
        }
        scores.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

        Ok(Self {
            session: 0,
            window_start: window.start_time(),
            window_end: window.end_time(),
            start_frame: window.start_frame(),
            frame_count: window.frame_count(),
            scores,
        })
    }

    /// Tags the result with the session that produced it.
    pub fn in_session(mut self, session: u64) -> Self {
        self.session = session;
        self
    }

    /// The highest-scoring label.
    pub fn top(&self) -> Option<&LabelScore> {
        self.scores.first()
    }

    /// Confidence of the top label, 0.0 when there are no scores.
    pub fn confidence(&self) -> f32 {
        self.top().map_or(0.0, |s| s.confidence)
    }

    pub fn end_frame(&self) -> u64 {
        self.start_frame + self.frame_count as u64
    }
}

fn as_secs_f64<S: Serializer>(duration: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_secs_f64())
}
