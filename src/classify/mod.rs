//! Classification: the classifier seam, results and the streaming worker.

pub mod classifier;
pub mod result;
pub mod streaming;

pub use classifier::{
    Classifier, ClassifierLoader, LabelScore, LevelClassifier, MockClassifier, calculate_rms,
};
pub use result::ClassificationResult;
pub use streaming::{
    ClassifierCounters, ClassifierRunner, ClassifierStats, StepOutcome, StreamingClassifier,
    WorkerContext, WorkerNotice,
};
