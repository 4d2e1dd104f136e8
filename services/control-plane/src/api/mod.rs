//! HTTP API for the control plane.

pub mod error;
pub mod health;
pub mod request_context;
pub mod v2;

use axum::{
    http::{header, Method},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::state::AppState;

/// Create the main API router.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .allow_origin(Any);

    Router::new()
        .merge(health::routes())
        .nest("/v2", v2::routes())
        .nest("/v1", v2::legacy_routes())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
