//! Decomposable time-series forecaster: piecewise-linear trend plus Fourier
//! seasonalities, with a Gaussian uncertainty interval.

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};
use std::f64::consts::PI;
use std::path::Path;
use tracing::{debug, info};

use crate::error::{ArtifactError, GatewayError, GatewayResult};

const OUTPUT_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Growth {
    #[default]
    Linear,
    Flat,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeasonalityMode {
    #[default]
    Additive,
    Multiplicative,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Seasonality {
    pub name: String,
    pub period_days: f64,
    pub fourier_order: usize,
    pub coefficients: Vec<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observation {
    pub ds: NaiveDateTime,
    pub y: f64,
}

fn default_interval_width() -> f64 {
    0.8
}

/// Serialized parameters of a fitted forecaster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForecastModel {
    pub start: NaiveDateTime,
    pub t_scale_hours: f64,
    pub y_scale: f64,
    #[serde(default)]
    pub growth: Growth,
    pub k: f64,
    pub m: f64,
    #[serde(default)]
    pub changepoints: Vec<f64>,
    #[serde(default)]
    pub deltas: Vec<f64>,
    #[serde(default)]
    pub seasonality_mode: SeasonalityMode,
    #[serde(default)]
    pub seasonalities: Vec<Seasonality>,
    #[serde(default = "default_interval_width")]
    pub interval_width: f64,
    pub sigma_obs: f64,
    #[serde(default)]
    pub trend_uncertainty: f64,
    #[serde(default)]
    pub history: Vec<Observation>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ForecastPoint {
    #[serde(serialize_with = "serialize_time")]
    pub time: NaiveDateTime,
    pub prediction: f64,
    pub lower_bound: f64,
    pub upper_bound: f64,
}

fn serialize_time<S>(time: &NaiveDateTime, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.collect_str(&time.format(OUTPUT_FORMAT))
}

impl ForecastModel {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ArtifactError> {
        let path = path.as_ref();
        info!("Loading forecast model from {}", path.display());

        let content = std::fs::read_to_string(path).map_err(|source| ArtifactError::Io {
            path: path.display().to_string(),
            source,
        })?;

        let model: ForecastModel =
            serde_json::from_str(&content).map_err(|e| ArtifactError::Parse {
                path: path.display().to_string(),
                message: e.to_string(),
            })?;

        model.validate()?;
        Ok(model)
    }

    pub fn validate(&self) -> Result<(), ArtifactError> {
        if !(self.t_scale_hours.is_finite() && self.t_scale_hours > 0.0) {
            return Err(ArtifactError::Invalid("t_scale_hours must be positive".into()));
        }
        if !self.y_scale.is_finite() {
            return Err(ArtifactError::Invalid("y_scale must be finite".into()));
        }
        if !(self.k.is_finite() && self.m.is_finite()) {
            return Err(ArtifactError::Invalid("k and m must be finite".into()));
        }
        if self.changepoints.len() != self.deltas.len() {
            return Err(ArtifactError::Invalid(format!(
                "{} changepoints but {} deltas",
                self.changepoints.len(),
                self.deltas.len()
            )));
        }
        if self.changepoints.windows(2).any(|w| w[0] > w[1]) {
            return Err(ArtifactError::Invalid("changepoints must be ascending".into()));
        }
        if !(self.interval_width > 0.0 && self.interval_width < 1.0) {
            return Err(ArtifactError::Invalid(
                "interval_width must lie strictly between 0 and 1".into(),
            ));
        }
        let non_negative = |v: f64| v.is_finite() && v >= 0.0;
        if !(non_negative(self.sigma_obs) && non_negative(self.trend_uncertainty)) {
            return Err(ArtifactError::Invalid(
                "sigma_obs and trend_uncertainty must be finite and non-negative".into(),
            ));
        }
        if self
            .changepoints
            .iter()
            .chain(&self.deltas)
            .chain(self.seasonalities.iter().flat_map(|s| &s.coefficients))
            .any(|v| !v.is_finite())
        {
            return Err(ArtifactError::Invalid(
                "changepoints, deltas and coefficients must be finite".into(),
            ));
        }
        for s in &self.seasonalities {
            if !(s.period_days > 0.0) || s.fourier_order == 0 {
                return Err(ArtifactError::Invalid(format!(
                    "seasonality '{}' needs a positive period and order",
                    s.name
                )));
            }
            if s.coefficients.len() != 2 * s.fourier_order {
                return Err(ArtifactError::Invalid(format!(
                    "seasonality '{}' has {} coefficients, expected {}",
                    s.name,
                    s.coefficients.len(),
                    2 * s.fourier_order
                )));
            }
        }
        Ok(())
    }

    pub fn predict(&self, timestamps: &[NaiveDateTime]) -> GatewayResult<Vec<ForecastPoint>> {
        debug!("Forecasting {} timestamps", timestamps.len());

        let z = self.interval_z()?;
        let t: Vec<f64> = timestamps.iter().map(|ds| self.scaled_time(ds)).collect();
        let seasonal = self.seasonal_components(timestamps);

        let mut points = Vec::with_capacity(timestamps.len());
        for (i, ds) in timestamps.iter().enumerate() {
            let trend = self.trend(t[i]);
            let yhat = match self.seasonality_mode {
                SeasonalityMode::Additive => (trend + seasonal[i]) * self.y_scale,
                SeasonalityMode::Multiplicative => trend * (1.0 + seasonal[i]) * self.y_scale,
            };
            let spread = self.sigma_obs + self.trend_uncertainty * (t[i] - 1.0).max(0.0);
            let half = z * self.y_scale.abs() * spread;

            if !(yhat.is_finite() && half.is_finite()) {
                return Err(GatewayError::InferenceFailure(format!(
                    "non-finite forecast at {}",
                    ds.format(OUTPUT_FORMAT)
                )));
            }

            points.push(ForecastPoint {
                time: *ds,
                prediction: yhat,
                lower_bound: yhat - half,
                upper_bound: yhat + half,
            });
        }

        Ok(points)
    }

    fn interval_z(&self) -> GatewayResult<f64> {
        let normal = Normal::new(0.0, 1.0)
            .map_err(|e| GatewayError::InferenceFailure(e.to_string()))?;
        Ok(normal.inverse_cdf((1.0 + self.interval_width) / 2.0))
    }

    fn scaled_time(&self, ds: &NaiveDateTime) -> f64 {
        let hours = (*ds - self.start).num_seconds() as f64 / 3600.0;
        hours / self.t_scale_hours
    }

    fn trend(&self, t: f64) -> f64 {
        match self.growth {
            Growth::Flat => self.m,
            Growth::Linear => {
                let (mut k, mut m) = (self.k, self.m);
                for (cp, delta) in self.changepoints.iter().zip(&self.deltas) {
                    if t >= *cp {
                        k += delta;
                        m -= cp * delta;
                    }
                }
                k * t + m
            }
        }
    }

    /// Sum of all seasonal terms for each timestamp, as `X · beta`.
    fn seasonal_components(&self, timestamps: &[NaiveDateTime]) -> Vec<f64> {
        let mut total = DVector::zeros(timestamps.len());
        let days: Vec<f64> = timestamps
            .iter()
            .map(|ds| ds.and_utc().timestamp() as f64 / 86_400.0)
            .collect();

        for s in &self.seasonalities {
            let x = fourier_features(&days, s.period_days, s.fourier_order);
            let beta = DVector::from_column_slice(&s.coefficients);
            total += x * beta;
        }

        total.iter().copied().collect()
    }
}

fn fourier_features(days: &[f64], period: f64, order: usize) -> DMatrix<f64> {
    DMatrix::from_fn(days.len(), 2 * order, |row, col| {
        let harmonic = (col / 2 + 1) as f64;
        let angle = 2.0 * PI * harmonic * days[row] / period;
        if col % 2 == 0 {
            angle.sin()
        } else {
            angle.cos()
        }
    })
}

/// Accepts a bare date (midnight), a date-time with `T` or space, with or
/// without seconds, or RFC 3339 (converted to UTC).
pub fn parse_timestamp(input: &str) -> GatewayResult<NaiveDateTime> {
    let input = input.trim();

    for format in [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M",
    ] {
        if let Ok(ts) = NaiveDateTime::parse_from_str(input, format) {
            return Ok(ts);
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(input, "%Y-%m-%d") {
        if let Some(ts) = date.and_hms_opt(0, 0, 0) {
            return Ok(ts);
        }
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(input) {
        return Ok(ts.naive_utc());
    }

    Err(GatewayError::InvalidInput(format!(
        "could not parse '{}' as a date or datetime",
        input
    )))
}

/// Inclusive hourly grid from `start` to `end`.
pub fn hourly_range(
    start: NaiveDateTime,
    end: NaiveDateTime,
    max_points: usize,
) -> GatewayResult<Vec<NaiveDateTime>> {
    if end < start {
        return Err(GatewayError::InvalidInput(format!(
            "end_date {} is before start_date {}",
            end.format(OUTPUT_FORMAT),
            start.format(OUTPUT_FORMAT)
        )));
    }

    let count = ((end - start).num_seconds() / 3600) as usize + 1;
    if count > max_points {
        return Err(GatewayError::InvalidInput(format!(
            "range spans {} hours, limit is {}",
            count, max_points
        )));
    }

    Ok((0..count)
        .map(|i| start + Duration::hours(i as i64))
        .collect())
}
