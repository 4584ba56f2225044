//! API Module
//!
//! HTTP API layer for the render queue.
//! Each submodule handles endpoints for a specific domain.

pub mod error;
pub mod health;
pub mod job;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

use crate::coordinator::CoordinatorHandle;
use crate::ws::{ConnectionManager, ws_handler};

/// Shared state handed to every handler
#[derive(Clone)]
pub struct AppState {
    pub coordinator: CoordinatorHandle,
    pub connections: Arc<ConnectionManager>,
    pub request_timeout: Duration,
}

/// Create the main API router with all endpoints
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health check
        .route("/health", get(health::health_check))
        // Job endpoints
        .route("/job", post(job::create_job))
        .route("/job/{id}", get(job::get_job))
        // Status push
        .route("/ws", get(ws_handler))
        // Add state and middleware
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}
