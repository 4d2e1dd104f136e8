//! Zone endpoints.

use axum::{
    extract::{Path, State},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;

use super::{Params, ServiceResultExt};
use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::service::zones;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_zones))
        .route("/{zone}", get(get_zone))
}

#[derive(Debug, Default, Deserialize)]
struct ZoneQuery {
    /// Only zones offering this capability, e.g. `vm`.
    #[serde(default)]
    capability: Option<String>,
}

async fn list_zones(
    State(state): State<AppState>,
    _ctx: RequestContext,
    Params(query): Params<ZoneQuery>,
) -> Result<Response, ApiError> {
    Ok(Json(zones::list(state.core(), query.capability.as_deref())).into_response())
}

async fn get_zone(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(zone): Path<String>,
) -> Result<Response, ApiError> {
    let zone = zones::get(state.core(), &zone).or_problem(&ctx)?;
    Ok(Json(zone).into_response())
}
