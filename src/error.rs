use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelKind {
    Forecaster,
    Classifier,
}

impl ModelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelKind::Forecaster => "forecaster",
            ModelKind::Classifier => "classifier",
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors surfaced to HTTP clients.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("{0} model not loaded")]
    ModelNotLoaded(ModelKind),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Inference failed: {0}")]
    InferenceFailure(String),

    #[error("Upload exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },
}

impl GatewayError {
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::ModelNotLoaded(_) => "MODEL_NOT_LOADED",
            GatewayError::InvalidInput(_) => "INVALID_INPUT",
            GatewayError::InferenceFailure(_) => "INFERENCE_FAILURE",
            GatewayError::PayloadTooLarge { .. } => "PAYLOAD_TOO_LARGE",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::ModelNotLoaded(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            GatewayError::InferenceFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.to_string(),
            "code": self.code(),
        }));

        (self.status(), body).into_response()
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;

/// Failures while loading a model artifact at startup.
#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("Failed to read artifact {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse artifact {path}: {message}")]
    Parse { path: String, message: String },

    #[error("Invalid artifact: {0}")]
    Invalid(String),

    #[error("Unsupported artifact: {0}")]
    Unsupported(String),
}

#[derive(Error, Debug)]
pub enum DatasetError {
    #[error("Dataset directory not found: {0}")]
    NotFound(String),

    #[error("Dataset split '{split}' is missing class directories: {missing}")]
    MissingClasses { split: String, missing: String },

    #[error("Failed to read dataset: {0}")]
    Io(#[from] std::io::Error),

    #[error("Training command failed: {0}")]
    TrainingFailed(String),
}
