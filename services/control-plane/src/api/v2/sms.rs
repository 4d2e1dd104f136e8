//! Storage manager endpoints.

use axum::{
    extract::{Path, State},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};

use super::{accepted, created, Body, GetQuery, ListQuery, Params, ServiceResultExt};
use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::service::sms::{CreateParams, Sms};
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_sms).post(create_sm))
        .route("/{sm_id}", get(get_sm).delete(delete_sm))
        .route("/{sm_id}/repair", post(repair_sm))
}

async fn list_sms(
    State(state): State<AppState>,
    ctx: RequestContext,
    Params(query): Params<ListQuery>,
) -> Result<Response, ApiError> {
    let sms = Sms::new(state.core(), Some(&ctx.auth))
        .list(&query.opts())
        .await
        .or_problem(&ctx)?;
    Ok(Json(sms).into_response())
}

async fn get_sm(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(sm_id): Path<String>,
    Params(query): Params<GetQuery>,
) -> Result<Response, ApiError> {
    let sm = Sms::new(state.core(), Some(&ctx.auth))
        .get(&sm_id, query.into())
        .await
        .or_problem(&ctx)?;
    Ok(Json(sm).into_response())
}

async fn create_sm(
    State(state): State<AppState>,
    ctx: RequestContext,
    Body(params): Body<CreateParams>,
) -> Result<Response, ApiError> {
    let job = Sms::new(state.core(), Some(&ctx.auth))
        .create(params)
        .await
        .or_problem(&ctx)?;
    Ok(created(job))
}

async fn delete_sm(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(sm_id): Path<String>,
) -> Result<Response, ApiError> {
    let job = Sms::new(state.core(), Some(&ctx.auth))
        .delete(&sm_id)
        .await
        .or_problem(&ctx)?;
    Ok(accepted(job))
}

async fn repair_sm(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(sm_id): Path<String>,
) -> Result<Response, ApiError> {
    let job = Sms::new(state.core(), Some(&ctx.auth))
        .repair(&sm_id)
        .await
        .or_problem(&ctx)?;
    Ok(accepted(job))
}
