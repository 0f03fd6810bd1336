//! Local HTTP control API for the recorder.
//!
//! Lets keybindings, status bars and the CLI drive the session controller.

pub mod error;
pub mod routes;

use crate::config::Config;
use crate::session::ControllerHandle;
use anyhow::{Context, Result};
use axum::{response::Json, routing::get, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tracing::info;

pub struct ApiServer {
    port: u16,
    controller: ControllerHandle,
}

impl ApiServer {
    pub fn new(controller: ControllerHandle, config: &Config) -> Self {
        Self {
            port: config.api.port,
            controller,
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/", get(service_info))
            .route("/version", get(version))
            .merge(routes::session::router(self.controller.clone()))
            .layer(ServiceBuilder::new())
    }

    pub async fn start(self) -> Result<()> {
        let listener = TcpListener::bind(("127.0.0.1", self.port))
            .await
            .with_context(|| format!("Failed to bind API port {}", self.port))?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener.
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let app = self.router();
        let addr = listener.local_addr()?;

        info!("API server listening on http://{}", addr);
        info!("Endpoints:");
        info!("  GET  /         - Service info");
        info!("  GET  /version  - Version info");
        info!("  POST /start    - Start countdown, then recording");
        info!("  POST /cancel   - Cancel the countdown");
        info!("  POST /pause    - Pause the recording");
        info!("  POST /resume   - Resume with a new segment");
        info!("  POST /stop     - Stop and save the recording");
        info!("  GET  /status   - Session status (?style=waybar)");

        axum::serve(listener, app).await?;

        Ok(())
    }
}

async fn service_info() -> Json<Value> {
    Json(json!({
        "service": "swiftcap-recorder",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running"
    }))
}

async fn version() -> Json<Value> {
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "name": "swiftcap-recorder"
    }))
}
