//! HTTP handlers for the inference gateway.

use axum::{
    extract::{
        multipart::{MultipartError, MultipartRejection},
        rejection::JsonRejection,
        Multipart, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

use super::server::AppState;
use crate::error::{GatewayError, GatewayResult};
use crate::metrics::record_request;
use crate::ml::{Classification, ForecastPoint};

/// Multipart part carrying the uploaded image.
const FILE_FIELD: &str = "file";

#[derive(Debug, Deserialize)]
pub struct ForecastRequest {
    pub start_date: String,
    pub end_date: String,
    #[serde(default)]
    pub include_chart: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct ForecastResponse {
    pub forecast: Vec<ForecastPoint>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forecast_graph: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub models: BTreeMap<&'static str, &'static str>,
}

fn track<T>(route: &'static str, result: &GatewayResult<T>) {
    let outcome = match result {
        Ok(_) => "ok",
        Err(GatewayError::ModelNotLoaded(_)) => "model_not_loaded",
        Err(GatewayError::InvalidInput(_)) => "invalid_input",
        Err(GatewayError::InferenceFailure(_)) => "inference_failure",
        Err(GatewayError::PayloadTooLarge { .. }) => "payload_too_large",
    };
    record_request(route, outcome);
}

pub async fn predict_energy(
    State(state): State<AppState>,
    payload: Result<Json<ForecastRequest>, JsonRejection>,
) -> GatewayResult<Json<ForecastResponse>> {
    let result = forecast(&state, payload).await;
    track("predict_energy", &result);
    result.map(Json)
}

async fn forecast(
    state: &AppState,
    payload: Result<Json<ForecastRequest>, JsonRejection>,
) -> GatewayResult<ForecastResponse> {
    let Json(request) = payload.map_err(|e| {
        if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
            GatewayError::PayloadTooLarge {
                limit: state.max_upload_bytes,
            }
        } else {
            GatewayError::InvalidInput(e.body_text())
        }
    })?;
    info!(
        "Prediction requested for period: {} to {}",
        request.start_date, request.end_date
    );

    let include_chart = request
        .include_chart
        .unwrap_or(state.engine.forecast_config().render_chart);
    let output = state
        .engine
        .forecast(&request.start_date, &request.end_date, include_chart)
        .await?;

    Ok(ForecastResponse {
        forecast: output.points,
        forecast_graph: output.chart,
    })
}

pub async fn predict_defect(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> GatewayResult<Json<Classification>> {
    let result = classify(&state, multipart).await;
    track("predict_defect", &result);
    result.map(Json)
}

async fn classify(
    state: &AppState,
    multipart: Result<Multipart, MultipartRejection>,
) -> GatewayResult<Classification> {
    let mut multipart = multipart.map_err(|e| GatewayError::InvalidInput(e.body_text()))?;
    let invalid = |e: MultipartError| {
        if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
            GatewayError::PayloadTooLarge {
                limit: state.max_upload_bytes,
            }
        } else {
            GatewayError::InvalidInput(format!("malformed upload: {}", e.body_text()))
        }
    };

    while let Some(field) = multipart.next_field().await.map_err(invalid)? {
        if field.name() != Some(FILE_FIELD) {
            continue;
        }
        let bytes = field.bytes().await.map_err(invalid)?;
        debug!("Received image upload of {} bytes", bytes.len());
        return state.engine.classify(bytes.to_vec()).await;
    }

    Err(GatewayError::InvalidInput("No file provided".into()))
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let models = state
        .engine
        .model_status()
        .into_iter()
        .map(|(name, loaded)| (name, if loaded { "loaded" } else { "not loaded" }))
        .collect();

    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        models,
    })
}

pub async fn metrics(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(recorder) => (
            [("content-type", "text/plain; version=0.0.4")],
            recorder.render(),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "metrics disabled").into_response(),
    }
}
