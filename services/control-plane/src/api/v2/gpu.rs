//! GPU group and lease endpoints.

use axum::{
    extract::{Path, State},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use fabric_id::UserId;
use serde::Deserialize;

use super::{accepted, created, pagination, Body, Params, ServiceResultExt};
use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::service::gpu::{CreateLeaseParams, Gpus, UpdateLeaseParams};
use crate::state::AppState;

pub fn group_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_groups))
        .route("/{group_id}", get(get_group))
}

pub fn lease_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_leases).post(create_lease))
        .route(
            "/{lease_id}",
            get(get_lease).post(update_lease).delete(delete_lease),
        )
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LeaseQuery {
    #[serde(default)]
    user_id: Option<UserId>,
    #[serde(default)]
    all: bool,
    #[serde(default)]
    page: Option<u32>,
    #[serde(default)]
    page_size: Option<u32>,
}

async fn list_groups(State(state): State<AppState>, ctx: RequestContext) -> Result<Response, ApiError> {
    let groups = Gpus::new(state.core(), Some(&ctx.auth))
        .list_groups()
        .await
        .or_problem(&ctx)?;
    Ok(Json(groups).into_response())
}

async fn get_group(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(group_id): Path<String>,
) -> Result<Response, ApiError> {
    let group = Gpus::new(state.core(), Some(&ctx.auth))
        .get_group(&group_id)
        .await
        .or_problem(&ctx)?;
    Ok(Json(group).into_response())
}

async fn list_leases(
    State(state): State<AppState>,
    ctx: RequestContext,
    Params(query): Params<LeaseQuery>,
) -> Result<Response, ApiError> {
    let leases = Gpus::new(state.core(), Some(&ctx.auth))
        .list_leases(
            query.user_id.as_ref(),
            query.all,
            pagination(query.page, query.page_size),
        )
        .await
        .or_problem(&ctx)?;
    Ok(Json(leases).into_response())
}

async fn get_lease(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(lease_id): Path<String>,
) -> Result<Response, ApiError> {
    let lease = Gpus::new(state.core(), Some(&ctx.auth))
        .get_lease(&lease_id)
        .await
        .or_problem(&ctx)?;
    Ok(Json(lease).into_response())
}

async fn create_lease(
    State(state): State<AppState>,
    ctx: RequestContext,
    Body(params): Body<CreateLeaseParams>,
) -> Result<Response, ApiError> {
    let job = Gpus::new(state.core(), Some(&ctx.auth))
        .create_lease(params)
        .await
        .or_problem(&ctx)?;
    Ok(created(job))
}

/// Attach (`vmId`) or detach (`vmId: null`). Without a change the current
/// lease is returned.
async fn update_lease(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(lease_id): Path<String>,
    Body(params): Body<UpdateLeaseParams>,
) -> Result<Response, ApiError> {
    let svc = Gpus::new(state.core(), Some(&ctx.auth));
    match svc.update_lease(&lease_id, params).await.or_problem(&ctx)? {
        Some(job) => Ok(accepted(job)),
        None => {
            let lease = svc.get_lease(&lease_id).await.or_problem(&ctx)?;
            Ok(Json(lease).into_response())
        }
    }
}

async fn delete_lease(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(lease_id): Path<String>,
) -> Result<Response, ApiError> {
    let job = Gpus::new(state.core(), Some(&ctx.auth))
        .delete_lease(&lease_id)
        .await
        .or_problem(&ctx)?;
    Ok(accepted(job))
}
