//! Classification capability: the model behind the streaming classifier.

use crate::audio::frame::ClassificationWindow;
use crate::config::PipelineConfig;
use crate::defaults;
use crate::error::{Result, SoundwatchError};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

/// A label and the confidence in `[0, 1]` that it applies to a window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LabelScore {
    pub label: String,
    pub confidence: f32,
}

impl LabelScore {
    pub fn new(label: impl Into<String>, confidence: f32) -> Self {
        Self {
            label: label.into(),
            confidence,
        }
    }
}

/// Trait for sound classification.
///
/// This trait allows swapping implementations (real model vs mock).
/// Implementations only see fully copied windows and may allocate freely.
pub trait Classifier: Send {
    /// Scores one window. Order of the returned scores does not matter.
    fn classify(&mut self, window: &ClassificationWindow) -> Result<Vec<LabelScore>>;

    /// Name used in logs.
    fn model_name(&self) -> &str;
}

/// Loads a classifier when the pipeline starts.
///
/// Called once per start, on the control thread.
pub trait ClassifierLoader: Send + Sync {
    fn load(&self, config: &PipelineConfig) -> Result<Box<dyn Classifier>>;
}

impl<F> ClassifierLoader for F
where
    F: Fn(&PipelineConfig) -> Result<Box<dyn Classifier>> + Send + Sync,
{
    fn load(&self, config: &PipelineConfig) -> Result<Box<dyn Classifier>> {
        self(config)
    }
}

/// Mock classifier for testing.
///
/// Returns the same scores for every window; selected invocations (counted
/// from zero) fail instead.
#[derive(Debug, Clone)]
pub struct MockClassifier {
    scores: Vec<LabelScore>,
    failing_calls: HashSet<u64>,
    always_fail: bool,
    delay: Duration,
    calls: Arc<AtomicU64>,
}

impl MockClassifier {
    /// Create a mock that returns a single label.
    pub fn new(label: &str, confidence: f32) -> Self {
        Self::with_scores(vec![LabelScore::new(label, confidence)])
    }

    /// Create a mock that returns `scores` verbatim.
    pub fn with_scores(scores: Vec<LabelScore>) -> Self {
        Self {
            scores,
            failing_calls: HashSet::new(),
            always_fail: false,
            delay: Duration::ZERO,
            calls: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Configure invocations (zero-based) that return an error.
    pub fn with_failures_at(mut self, calls: impl IntoIterator<Item = u64>) -> Self {
        self.failing_calls.extend(calls);
        self
    }

    /// Configure the mock to fail every invocation.
    pub fn with_permanent_failure(mut self) -> Self {
        self.always_fail = true;
        self
    }

    /// Sleep for `delay` in every invocation, like a slow model.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Shared invocation counter, readable after the mock has been moved into a pipeline.
    pub fn call_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.calls)
    }
}

impl Classifier for MockClassifier {
    fn classify(&mut self, _window: &ClassificationWindow) -> Result<Vec<LabelScore>> {
        let call = self.calls.fetch_add(1, Ordering::Relaxed);
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        if self.always_fail || self.failing_calls.contains(&call) {
            return Err(SoundwatchError::ClassifierInvocation {
                message: format!("mock failure on call {}", call),
            });
        }
        Ok(self.scores.clone())
    }

    fn model_name(&self) -> &str {
        "mock"
    }
}

/// Level-based classifier: scores `silence` against `sound` from the window's RMS.
///
/// At the threshold both labels score 0.5; at twice the threshold and above
/// `sound` scores 1.0.
#[derive(Debug, Clone)]
pub struct LevelClassifier {
    threshold: f32,
}

impl LevelClassifier {
    /// Default RMS threshold, roughly quiet speech at arm's length.
    pub const DEFAULT_THRESHOLD: f32 = 0.02;

    pub fn new(threshold: f32) -> Self {
        Self {
            threshold: threshold.max(f32::EPSILON),
        }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }
}

impl Default for LevelClassifier {
    fn default() -> Self {
        Self::new(Self::DEFAULT_THRESHOLD)
    }
}

impl Classifier for LevelClassifier {
    fn classify(&mut self, window: &ClassificationWindow) -> Result<Vec<LabelScore>> {
        let rms = calculate_rms(&window.mono());
        let sound = (rms / (2.0 * self.threshold)).clamp(0.0, 1.0);
        Ok(vec![
            LabelScore::new(defaults::SOUND_LABEL, sound),
            LabelScore::new(defaults::SILENCE_LABEL, 1.0 - sound),
        ])
    }

    fn model_name(&self) -> &str {
        "level"
    }
}

/// Calculate the root mean square level of `f32` samples in `[-1, 1]`.
///
/// Returns 0.0 for silence and about 0.707 for a full-scale sine wave.
pub fn calculate_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f64 = samples
        .iter()
        .map(|&sample| {
            let s = f64::from(sample);
            s * s
        })
        .sum();

    let mean_square = sum_squares / samples.len() as f64;
    mean_square.sqrt() as f32
}
