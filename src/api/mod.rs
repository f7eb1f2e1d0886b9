//! REST API for simulation runs and measured carbon intensity.
//!
//! Routes:
//! - `POST /simulation`, `GET /simulation/get-carbon`, `POST /simulation/next`,
//!   `GET /simulation/stats`: simulation runs
//! - `GET /carbon-intensity/current[/primary]`, `GET /carbon-intensity/history`:
//!   stored readings
//! - `GET /v3/carbon-intensity/{current,history}`: ElectricityMaps-compatible views
//! - `GET /regions`, `GET /providers`, `GET /health`

mod handlers;
mod types;

use std::future::Future;
use std::io;
use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use tokio::net::TcpListener;
use tracing::info;

use crate::config::AppConfig;
use crate::ingest::Ingestor;
use crate::sim::SimulationEngine;
use crate::store::SqliteStore;

pub use types::{ApiError, ErrorResponse};

/// Application state shared across all request handlers.
///
/// Constructed once at startup and wrapped in `Arc`; every member is either
/// immutable or synchronizes internally.
pub struct AppState {
    /// Simulation engine over the shared store.
    pub engine: SimulationEngine,
    /// Measured-data store.
    pub store: SqliteStore,
    /// Loaded configuration.
    pub config: AppConfig,
    /// On-demand ingestion for `update=` requests.
    pub ingestor: Arc<Ingestor>,
}

/// Builds the axum router with all API routes.
///
/// # Arguments
///
/// * `state` - Shared application state
///
/// # Returns
///
/// Configured `Router` ready to serve.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/simulation", post(handlers::create_simulation))
        .route("/simulation/get-carbon", get(handlers::get_simulation_carbon))
        .route("/simulation/next", post(handlers::advance_simulation))
        .route("/simulation/stats", get(handlers::get_simulation_stats))
        .route("/carbon-intensity/current", get(handlers::get_current))
        .route(
            "/carbon-intensity/current/primary",
            get(handlers::get_current_primary),
        )
        .route("/carbon-intensity/history", get(handlers::get_history))
        .route("/v3/carbon-intensity/current", get(handlers::get_v3_current))
        .route("/v3/carbon-intensity/history", get(handlers::get_v3_history))
        .route("/regions", get(handlers::list_regions))
        .route("/providers", get(handlers::list_providers))
        .route("/health", get(handlers::health))
        .with_state(state)
}

/// Serves the API on `listener` until `shutdown` resolves.
///
/// # Errors
///
/// Returns an `io::Error` if the server fails while accepting connections.
pub async fn serve(
    state: Arc<AppState>,
    listener: TcpListener,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> io::Result<()> {
    let app = router(state);
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "API server listening");
    }
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
}
