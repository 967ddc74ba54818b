//! Inference gateway serving an energy-demand forecaster and a solar-panel
//! defect classifier over HTTP.

pub mod config;
pub mod error;
pub mod metrics;
pub mod ml;
pub mod training;
pub mod web;

pub use config::Config;
pub use error::{GatewayError, GatewayResult, ModelKind};
pub use ml::InferenceEngine;
pub use web::GatewayServer;
