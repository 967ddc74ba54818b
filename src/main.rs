use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use solar_gateway::config::{Config, LoggingConfig, DEFAULT_CONFIG_PATH};
use solar_gateway::metrics::MetricsRecorder;
use solar_gateway::training::{self, TrainArgs};
use solar_gateway::{GatewayServer, InferenceEngine};

#[derive(Parser)]
#[command(name = "solar-gateway")]
#[command(about = "Energy demand forecasting and solar panel defect detection over HTTP")]
struct Cli {
    /// TOML config file; must exist unless left at the default
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the inference API (default)
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
    /// Check a classifier dataset's folder layout and count its images
    InspectDataset { dataset: PathBuf },
    /// Train the defect classifier with the external YOLO CLI
    Train(TrainArgs),
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.filter.as_str()));

    let registry = tracing_subscriber::registry().with(filter);
    if logging.json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::from_file(&cli.config)?;

    init_tracing(&config.logging);

    match cli.command.unwrap_or(Command::Serve { port: None }) {
        Command::Serve { port } => {
            if let Some(port) = port {
                config.server.port = port;
            }
            serve(config).await
        }
        Command::InspectDataset { dataset } => {
            let summary = training::inspect_dataset(&dataset)?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
        Command::Train(args) => {
            training::run_training(&args).await?;
            Ok(())
        }
    }
}

async fn serve(config: Config) -> Result<()> {
    info!("Starting solar inference gateway");

    let metrics = if config.metrics.enabled {
        match MetricsRecorder::install() {
            Ok(recorder) => Some(recorder),
            Err(e) => {
                warn!("Metrics disabled: {}", e);
                None
            }
        }
    } else {
        None
    };

    // Model loading reads and parses whole artifacts.
    let models = config.models.clone();
    let forecast = config.forecast.clone();
    let engine = tokio::task::spawn_blocking(move || InferenceEngine::load(&models, &forecast)).await?;

    for (model, loaded) in engine.model_status() {
        info!(model, loaded, "Model status");
    }

    GatewayServer::new(Arc::new(engine), metrics, config.server)
        .start()
        .await
}
