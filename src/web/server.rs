use anyhow::Result;
use axum::{
    extract::DefaultBodyLimit,
    http::HeaderValue,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tokio::signal;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use super::routes;
use crate::config::ServerConfig;
use crate::metrics::MetricsRecorder;
use crate::ml::InferenceEngine;

/// Shared, read-only handler state.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<InferenceEngine>,
    pub metrics: Option<MetricsRecorder>,
    /// Request body cap, reported back when an upload is rejected.
    pub max_upload_bytes: usize,
}

pub struct GatewayServer {
    state: AppState,
    config: ServerConfig,
}

impl GatewayServer {
    pub fn new(
        engine: Arc<InferenceEngine>,
        metrics: Option<MetricsRecorder>,
        config: ServerConfig,
    ) -> Self {
        Self {
            state: AppState {
                engine,
                metrics,
                max_upload_bytes: config.max_upload_bytes,
            },
            config,
        }
    }

    pub fn build_router(&self) -> Router {
        Router::new()
            .route("/", get(routes::health))
            .route("/health", get(routes::health))
            .route("/metrics", get(routes::metrics))
            .route("/predict/energy", post(routes::predict_energy))
            .route("/predict/defect", post(routes::predict_defect))
            .layer(DefaultBodyLimit::max(self.config.max_upload_bytes))
            .layer(TraceLayer::new_for_http())
            .layer(self.cors_layer())
            .with_state(self.state.clone())
    }

    fn cors_layer(&self) -> CorsLayer {
        let cors = CorsLayer::new().allow_methods(Any).allow_headers(Any);

        if self.config.cors_allow_origins.is_empty() {
            return cors.allow_origin(Any);
        }

        let origins: Vec<HeaderValue> = self
            .config
            .cors_allow_origins
            .iter()
            .filter_map(|origin| match HeaderValue::from_str(origin) {
                Ok(value) => Some(value),
                Err(_) => {
                    warn!("Ignoring invalid CORS origin: {}", origin);
                    None
                }
            })
            .collect();

        cors.allow_origin(AllowOrigin::list(origins))
    }

    pub async fn start(self) -> Result<()> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let app = self.build_router();

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        info!("Inference gateway listening on http://{}", addr);

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        info!("Inference gateway stopped");
        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, stopping server...");
}
