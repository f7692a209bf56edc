use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::{Router, http::StatusCode, response::IntoResponse, routing::get};
use common::StagingManager;
use common::config::Configuration;
use tower_http::trace::TraceLayer;

pub mod endpoints;

/// Shared state that needs to be accessed by route handlers
pub trait ServerState: std::fmt::Debug + Clone + Send + Sync + 'static {
    fn staging(&self) -> &StagingManager;
    fn upload_dir(&self) -> &Path;
}

/// Default [`ServerState`] implementation backed by one manager instance
#[derive(Clone)]
pub struct AppState {
    staging: Arc<StagingManager>,
    upload_dir: PathBuf,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("staging", &"StagingManager")
            .field("upload_dir", &self.upload_dir)
            .finish()
    }
}

impl AppState {
    /// Create a new AppState from the staging manager and configuration
    pub fn new(staging: Arc<StagingManager>, config: &Configuration) -> Self {
        Self {
            staging,
            upload_dir: PathBuf::from(&config.server.upload_dir),
        }
    }
}

impl ServerState for AppState {
    fn staging(&self) -> &StagingManager {
        &self.staging
    }

    fn upload_dir(&self) -> &Path {
        &self.upload_dir
    }
}

/// Create a new router instance with all routes configured
pub fn create_router<S: ServerState>(state: S) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .merge(endpoints::files::router::<S>())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Basic health check endpoint
async fn health_check() -> impl IntoResponse {
    StatusCode::OK
}
