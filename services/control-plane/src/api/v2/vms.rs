//! VM endpoints, including snapshots and power actions.
//!
//! Mounted twice: under `/v2` with version 2 jobs and under `/v1` with the
//! legacy version 1 jobs.

use axum::{
    extract::{Path, State},
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};

use super::{accepted, created, Body, GetQuery, ListQuery, Params, ServiceResultExt};
use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::model::job::JobVersion;
use crate::service::vms::snapshots::SnapshotParams;
use crate::service::vms::{ActionParams, CreateParams, UpdateParams, Vms};
use crate::state::AppState;

pub fn routes(version: JobVersion) -> Router<AppState> {
    Router::new()
        .route("/", get(list_vms).post(create_vm))
        .route("/{vm_id}", get(get_vm).post(update_vm).delete(delete_vm))
        .route("/{vm_id}/repair", post(repair_vm))
        .route("/{vm_id}/actions", post(do_action))
        .route("/{vm_id}/snapshots", get(list_snapshots).post(create_snapshot))
        .route(
            "/{vm_id}/snapshots/{snapshot_id}",
            get(get_snapshot).delete(delete_snapshot),
        )
        .layer(Extension(version))
}

fn service<'a>(state: &'a AppState, ctx: &'a RequestContext, version: JobVersion) -> Vms<'a> {
    Vms::new(state.core(), Some(&ctx.auth)).with_version(version)
}

async fn list_vms(
    State(state): State<AppState>,
    Extension(version): Extension<JobVersion>,
    ctx: RequestContext,
    Params(query): Params<ListQuery>,
) -> Result<Response, ApiError> {
    let vms = service(&state, &ctx, version)
        .list(&query.opts())
        .await
        .or_problem(&ctx)?;
    Ok(Json(vms).into_response())
}

async fn get_vm(
    State(state): State<AppState>,
    Extension(version): Extension<JobVersion>,
    ctx: RequestContext,
    Path(vm_id): Path<String>,
    Params(query): Params<GetQuery>,
) -> Result<Response, ApiError> {
    let vm = service(&state, &ctx, version)
        .get(&vm_id, query.into())
        .await
        .or_problem(&ctx)?;
    Ok(Json(vm).into_response())
}

async fn create_vm(
    State(state): State<AppState>,
    Extension(version): Extension<JobVersion>,
    ctx: RequestContext,
    Body(params): Body<CreateParams>,
) -> Result<Response, ApiError> {
    let job = service(&state, &ctx, version)
        .create(params)
        .await
        .or_problem(&ctx)?;
    Ok(created(job))
}

async fn update_vm(
    State(state): State<AppState>,
    Extension(version): Extension<JobVersion>,
    ctx: RequestContext,
    Path(vm_id): Path<String>,
    Body(params): Body<UpdateParams>,
) -> Result<Response, ApiError> {
    let job = service(&state, &ctx, version)
        .update(&vm_id, params)
        .await
        .or_problem(&ctx)?;
    Ok(accepted(job))
}

async fn delete_vm(
    State(state): State<AppState>,
    Extension(version): Extension<JobVersion>,
    ctx: RequestContext,
    Path(vm_id): Path<String>,
) -> Result<Response, ApiError> {
    let job = service(&state, &ctx, version)
        .delete(&vm_id)
        .await
        .or_problem(&ctx)?;
    Ok(accepted(job))
}

async fn repair_vm(
    State(state): State<AppState>,
    Extension(version): Extension<JobVersion>,
    ctx: RequestContext,
    Path(vm_id): Path<String>,
) -> Result<Response, ApiError> {
    let job = service(&state, &ctx, version)
        .repair(&vm_id)
        .await
        .or_problem(&ctx)?;
    Ok(accepted(job))
}

/// POST /v2/vms/{id}/actions `{"action": "start" | "stop" | "restart"}`
async fn do_action(
    State(state): State<AppState>,
    Extension(version): Extension<JobVersion>,
    ctx: RequestContext,
    Path(vm_id): Path<String>,
    Body(params): Body<ActionParams>,
) -> Result<Response, ApiError> {
    let job = service(&state, &ctx, version)
        .action(&vm_id, params)
        .await
        .or_problem(&ctx)?;
    Ok(accepted(job))
}

async fn list_snapshots(
    State(state): State<AppState>,
    Extension(version): Extension<JobVersion>,
    ctx: RequestContext,
    Path(vm_id): Path<String>,
) -> Result<Response, ApiError> {
    let snapshots = service(&state, &ctx, version)
        .list_snapshots(&vm_id)
        .await
        .or_problem(&ctx)?;
    Ok(Json(snapshots).into_response())
}

async fn get_snapshot(
    State(state): State<AppState>,
    Extension(version): Extension<JobVersion>,
    ctx: RequestContext,
    Path((vm_id, snapshot_id)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let snapshot = service(&state, &ctx, version)
        .get_snapshot(&vm_id, &snapshot_id)
        .await
        .or_problem(&ctx)?;
    Ok(Json(snapshot).into_response())
}

async fn create_snapshot(
    State(state): State<AppState>,
    Extension(version): Extension<JobVersion>,
    ctx: RequestContext,
    Path(vm_id): Path<String>,
    Body(params): Body<SnapshotParams>,
) -> Result<Response, ApiError> {
    let job = service(&state, &ctx, version)
        .create_snapshot(&vm_id, params)
        .await
        .or_problem(&ctx)?;
    Ok(created(job))
}

async fn delete_snapshot(
    State(state): State<AppState>,
    Extension(version): Extension<JobVersion>,
    ctx: RequestContext,
    Path((vm_id, snapshot_id)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let job = service(&state, &ctx, version)
        .delete_snapshot(&vm_id, &snapshot_id)
        .await
        .or_problem(&ctx)?;
    Ok(accepted(job))
}
