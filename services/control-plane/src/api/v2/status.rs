//! Worker heartbeats.

use axum::{
    extract::State,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};

use super::ServiceResultExt;
use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::state::AppState;
use crate::workers::status;

pub fn routes() -> Router<AppState> {
    Router::new().route("/", get(list_status))
}

async fn list_status(State(state): State<AppState>, ctx: RequestContext) -> Result<Response, ApiError> {
    let statuses = status::list(state.core()).await.or_problem(&ctx)?;
    Ok(Json(statuses).into_response())
}
