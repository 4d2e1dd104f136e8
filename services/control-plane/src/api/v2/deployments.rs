//! Deployment endpoints.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};

use super::{accepted, created, Body, GetQuery, ListQuery, Params, ServiceResultExt};
use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::service::deployments::{Command, CreateParams, Deployments, UpdateParams};
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_deployments).post(create_deployment))
        .route(
            "/{deployment_id}",
            get(get_deployment)
                .post(update_deployment)
                .delete(delete_deployment),
        )
        .route("/{deployment_id}/repair", post(repair_deployment))
        .route("/{deployment_id}/command", post(run_command))
}

async fn list_deployments(
    State(state): State<AppState>,
    ctx: RequestContext,
    Params(query): Params<ListQuery>,
) -> Result<Response, ApiError> {
    let svc = Deployments::new(state.core(), Some(&ctx.auth));
    let items = svc.list(&query.opts()).await.or_problem(&ctx)?;
    Ok(Json(items).into_response())
}

async fn get_deployment(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(deployment_id): Path<String>,
    Params(query): Params<GetQuery>,
) -> Result<Response, ApiError> {
    let svc = Deployments::new(state.core(), Some(&ctx.auth));
    let deployment = svc.get(&deployment_id, query.into()).await.or_problem(&ctx)?;
    Ok(Json(deployment).into_response())
}

/// POST /v2/deployments
async fn create_deployment(
    State(state): State<AppState>,
    ctx: RequestContext,
    Body(params): Body<CreateParams>,
) -> Result<Response, ApiError> {
    let svc = Deployments::new(state.core(), Some(&ctx.auth));
    Ok(created(svc.create(params).await.or_problem(&ctx)?))
}

/// POST /v2/deployments/{id}
async fn update_deployment(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(deployment_id): Path<String>,
    Body(params): Body<UpdateParams>,
) -> Result<Response, ApiError> {
    let svc = Deployments::new(state.core(), Some(&ctx.auth));
    Ok(accepted(svc.update(&deployment_id, params).await.or_problem(&ctx)?))
}

async fn delete_deployment(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(deployment_id): Path<String>,
) -> Result<Response, ApiError> {
    let svc = Deployments::new(state.core(), Some(&ctx.auth));
    Ok(accepted(svc.delete(&deployment_id).await.or_problem(&ctx)?))
}

async fn repair_deployment(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(deployment_id): Path<String>,
) -> Result<Response, ApiError> {
    let svc = Deployments::new(state.core(), Some(&ctx.auth));
    Ok(accepted(svc.repair(&deployment_id).await.or_problem(&ctx)?))
}

/// Restart or build, synchronously.
async fn run_command(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(deployment_id): Path<String>,
    Body(command): Body<Command>,
) -> Result<Response, ApiError> {
    let svc = Deployments::new(state.core(), Some(&ctx.auth));
    svc.command(&deployment_id, command).await.or_problem(&ctx)?;
    Ok(StatusCode::NO_CONTENT.into_response())
}
