use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::task;
use tracing::{debug, error, info, warn};

use crate::config::{ForecastConfig, ModelsConfig};
use crate::error::{GatewayError, GatewayResult, ModelKind};
use crate::metrics as gateway_metrics;
use super::chart;
use super::classifier::{self, Classification, ImageClassifier};
use super::forecaster::{self, ForecastModel, ForecastPoint};

/// A loaded artifact, or why it could not be loaded.
pub enum ModelSlot<T: ?Sized> {
    Loaded(Arc<T>),
    Unavailable(String),
}

impl<T: ?Sized> ModelSlot<T> {
    pub fn is_loaded(&self) -> bool {
        matches!(self, ModelSlot::Loaded(_))
    }

    fn get(&self, kind: ModelKind) -> GatewayResult<Arc<T>> {
        match self {
            ModelSlot::Loaded(model) => Ok(model.clone()),
            ModelSlot::Unavailable(_) => Err(GatewayError::ModelNotLoaded(kind)),
        }
    }
}

impl<T: ?Sized, E: std::fmt::Display> From<Result<Arc<T>, E>> for ModelSlot<T> {
    fn from(result: Result<Arc<T>, E>) -> Self {
        match result {
            Ok(model) => ModelSlot::Loaded(model),
            Err(e) => ModelSlot::Unavailable(e.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ForecastOutput {
    pub points: Vec<ForecastPoint>,
    /// PNG data URL.
    pub chart: Option<String>,
}

/// Immutable service context: built once at startup, shared by every handler.
pub struct InferenceEngine {
    forecaster: ModelSlot<ForecastModel>,
    classifier: ModelSlot<dyn ImageClassifier>,
    forecast_config: ForecastConfig,
}

impl InferenceEngine {
    pub fn new(
        forecaster: ModelSlot<ForecastModel>,
        classifier: ModelSlot<dyn ImageClassifier>,
        forecast_config: ForecastConfig,
    ) -> Self {
        Self {
            forecaster,
            classifier,
            forecast_config,
        }
    }

    /// Loads every configured artifact. A failed load is logged and recorded;
    /// it never aborts startup.
    pub fn load(models: &ModelsConfig, forecast_config: &ForecastConfig) -> Self {
        let forecaster: ModelSlot<ForecastModel> =
            ForecastModel::load_from_file(&models.forecaster_path)
                .map(Arc::new)
                .into();
        let classifier: ModelSlot<dyn ImageClassifier> = classifier::load_classifier(models)
            .map(Arc::<dyn ImageClassifier>::from)
            .into();

        for (kind, slot_loaded, reason) in [
            (ModelKind::Forecaster, forecaster.is_loaded(), unavailable_reason(&forecaster)),
            (ModelKind::Classifier, classifier.is_loaded(), unavailable_reason(&classifier)),
        ] {
            gateway_metrics::record_model_loaded(kind, slot_loaded);
            match reason {
                None => info!("{} model loaded", kind),
                Some(reason) => warn!("{} model unavailable: {}", kind, reason),
            }
        }

        Self::new(forecaster, classifier, forecast_config.clone())
    }

    pub fn model_status(&self) -> BTreeMap<&'static str, bool> {
        BTreeMap::from([
            (ModelKind::Forecaster.as_str(), self.forecaster.is_loaded()),
            (ModelKind::Classifier.as_str(), self.classifier.is_loaded()),
        ])
    }

    pub fn forecast_config(&self) -> &ForecastConfig {
        &self.forecast_config
    }

    pub async fn forecast(
        &self,
        start_date: &str,
        end_date: &str,
        include_chart: bool,
    ) -> GatewayResult<ForecastOutput> {
        let model = self.forecaster.get(ModelKind::Forecaster)?;

        let start = forecaster::parse_timestamp(start_date)?;
        let end = forecaster::parse_timestamp(end_date)?;
        let grid = forecaster::hourly_range(start, end, self.forecast_config.max_points)?;
        debug!("Forecast requested for {} hourly points", grid.len());

        let (width, height) = (self.forecast_config.chart_width, self.forecast_config.chart_height);
        let started = Instant::now();

        let output = task::spawn_blocking(move || -> GatewayResult<ForecastOutput> {
            let points = model.predict(&grid)?;
            let chart = if include_chart {
                let png = chart::render_forecast_chart(&points, &model.history, width, height)?;
                Some(chart::png_data_url(&png))
            } else {
                None
            };
            Ok(ForecastOutput { points, chart })
        })
        .await
        .map_err(|e| GatewayError::InferenceFailure(format!("forecast task failed: {}", e)))?;

        gateway_metrics::record_inference(ModelKind::Forecaster, started.elapsed());
        if let Err(e) = &output {
            error!("Forecast failed: {}", e);
        }
        output
    }

    pub async fn classify(&self, image: Vec<u8>) -> GatewayResult<Classification> {
        let model = self.classifier.get(ModelKind::Classifier)?;
        if image.is_empty() {
            return Err(GatewayError::InvalidInput("uploaded file is empty".into()));
        }

        let started = Instant::now();
        let result = task::spawn_blocking(move || model.classify(&image))
            .await
            .map_err(|e| {
                GatewayError::InferenceFailure(format!("classification task failed: {}", e))
            })?;

        gateway_metrics::record_inference(ModelKind::Classifier, started.elapsed());
        match &result {
            Ok(c) => debug!(
                "Classified panel as {} ({:.3})",
                c.defect_type, c.confidence
            ),
            Err(e) => error!("Classification failed: {}", e),
        }
        result
    }
}

fn unavailable_reason<T: ?Sized>(slot: &ModelSlot<T>) -> Option<&str> {
    match slot {
        ModelSlot::Loaded(_) => None,
        ModelSlot::Unavailable(reason) => Some(reason.as_str()),
    }
}
