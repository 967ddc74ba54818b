pub mod collector;

pub use collector::{record_inference, record_model_loaded, record_request, MetricsRecorder};
