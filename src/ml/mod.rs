pub mod chart;
pub mod classifier;
pub mod engine;
pub mod forecaster;

pub use classifier::{Classification, DefectLabel, ImageClassifier, LinearClassifier};
pub use engine::{ForecastOutput, InferenceEngine, ModelSlot};
pub use forecaster::{ForecastModel, ForecastPoint};
