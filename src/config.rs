use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub models: ModelsConfig,
    pub forecast: ForecastConfig,
    pub metrics: MetricsConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Empty means any origin.
    pub cors_allow_origins: Vec<String>,
    pub max_upload_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
            cors_allow_origins: Vec::new(),
            max_upload_bytes: 10 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    #[default]
    Cpu,
    Gpu,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ModelsConfig {
    pub forecaster_path: String,
    pub classifier_path: String,
    pub device: Device,
    /// Square input resolution for ONNX classifiers. JSON heads carry their own.
    pub classifier_input_size: u32,
    pub classifier_mean: Option<[f32; 3]>,
    pub classifier_std: Option<[f32; 3]>,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            forecaster_path: "models/forecaster.json".to_string(),
            classifier_path: "models/classifier.json".to_string(),
            device: Device::Cpu,
            classifier_input_size: 128,
            classifier_mean: None,
            classifier_std: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ForecastConfig {
    pub max_points: usize,
    pub render_chart: bool,
    pub chart_width: u32,
    pub chart_height: u32,
}

impl Default for ForecastConfig {
    fn default() -> Self {
        Self {
            max_points: 8784,
            render_chart: false,
            chart_width: 1200,
            chart_height: 600,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub filter: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info,tower_http=info".to_string(),
            json: false,
        }
    }
}

/// Used when `--config` is not given; may be absent.
pub const DEFAULT_CONFIG_PATH: &str = "config.toml";

impl Config {
    /// Layers defaults, then the TOML file at `path`, then
    /// `GATEWAY__SECTION__KEY` environment variables. Only the default path
    /// may be missing.
    pub fn from_file(path: &str) -> Result<Self> {
        Self::from_sources(path, path != DEFAULT_CONFIG_PATH, None)
    }

    fn from_sources(
        path: &str,
        required: bool,
        env: Option<config::Map<String, String>>,
    ) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(Path::new(path)).required(required))
            .add_source(
                config::Environment::with_prefix("GATEWAY")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("server.cors_allow_origins")
                    .try_parsing(true)
                    .source(env),
            )
            .build()?;

        let config: Config = settings.try_deserialize()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn no_env() -> Option<config::Map<String, String>> {
        Some(config::Map::new())
    }

    #[test]
    fn missing_default_file_yields_defaults() {
        let config = Config::from_sources("/nonexistent/gateway.toml", false, no_env()).unwrap();
        assert_eq!(config.server.port, 5000);
        assert_eq!(config.forecast.max_points, 8784);
        assert_eq!(config.models.device, Device::Cpu);
        assert!(config.metrics.enabled);
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        assert!(Config::from_file("/nonexistent/gateway.toml").is_err());
    }

    #[test]
    fn file_values_override_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[server]
port = 8088
cors_allow_origins = ["http://localhost:3000"]

[models]
forecaster_path = "/srv/models/brazil.json"
device = "gpu"

[forecast]
render_chart = true
"#
        )
        .unwrap();

        let config = Config::from_sources(file.path().to_str().unwrap(), true, no_env()).unwrap();
        assert_eq!(config.server.port, 8088);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.cors_allow_origins, vec!["http://localhost:3000"]);
        assert_eq!(config.models.forecaster_path, "/srv/models/brazil.json");
        assert_eq!(config.models.device, Device::Gpu);
        assert!(config.forecast.render_chart);
        assert_eq!(config.forecast.chart_width, 1200);
    }

    #[test]
    fn environment_overrides_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[server]\nport = 8088\nhost = \"127.0.0.1\"").unwrap();

        let env = config::Map::from([
            ("GATEWAY__SERVER__PORT".to_string(), "9100".to_string()),
            (
                "GATEWAY__SERVER__CORS_ALLOW_ORIGINS".to_string(),
                "http://a,http://b".to_string(),
            ),
            ("GATEWAY__LOGGING__JSON".to_string(), "true".to_string()),
            ("UNRELATED__SERVER__PORT".to_string(), "1".to_string()),
        ]);

        let config = Config::from_sources(file.path().to_str().unwrap(), true, Some(env)).unwrap();
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.cors_allow_origins, vec!["http://a", "http://b"]);
        assert!(config.logging.json);
    }
}
