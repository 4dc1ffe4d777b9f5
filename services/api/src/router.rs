//! Axum Router Configuration

use crate::{handlers, state::AppState, ws::ws_handler};

use axum::{Router, routing::get};
use std::sync::Arc;

/// Creates the main Axum router for the application.
pub fn create_router(app_state: Arc<AppState>) -> Router {
    Router::new()
        .route("/voice-chat", get(ws_handler))
        .route("/health", get(handlers::health))
        .with_state(app_state)
}
