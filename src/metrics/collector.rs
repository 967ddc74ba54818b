use anyhow::Result;
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;
use tracing::info;

use crate::error::ModelKind;

const REQUESTS_TOTAL: &str = "gateway_requests_total";
const INFERENCE_SECONDS: &str = "gateway_inference_seconds";
const MODEL_LOADED: &str = "gateway_model_loaded";

const INFERENCE_BUCKETS: &[f64] = &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

/// Process-wide Prometheus recorder; `render` backs the `/metrics` route.
#[derive(Clone)]
pub struct MetricsRecorder {
    handle: PrometheusHandle,
}

impl MetricsRecorder {
    pub fn install() -> Result<Self> {
        let handle = builder()?.install_recorder()?;
        info!("Prometheus metrics recorder installed");
        Ok(Self { handle })
    }

    pub fn render(&self) -> String {
        self.handle.render()
    }
}

fn builder() -> Result<PrometheusBuilder> {
    Ok(PrometheusBuilder::new()
        .set_buckets_for_metric(Matcher::Full(INFERENCE_SECONDS.to_string()), INFERENCE_BUCKETS)?)
}

pub fn record_request(route: &'static str, outcome: &'static str) {
    ::metrics::counter!(REQUESTS_TOTAL, "route" => route, "outcome" => outcome).increment(1);
}

pub fn record_inference(kind: ModelKind, elapsed: Duration) {
    ::metrics::histogram!(INFERENCE_SECONDS, "model" => kind.as_str()).record(elapsed.as_secs_f64());
}

pub fn record_model_loaded(kind: ModelKind, loaded: bool) {
    ::metrics::gauge!(MODEL_LOADED, "model" => kind.as_str()).set(if loaded { 1.0 } else { 0.0 });
}
