//! Resource migration (ownership transfer) endpoints.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};

use super::{Body, PageQuery, Params, ServiceResultExt};
use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::service::migrations::{CreateParams, Migrations, UpdateParams};
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_migrations).post(create_migration))
        .route(
            "/{migration_id}",
            get(get_migration)
                .post(update_migration)
                .delete(delete_migration),
        )
}

async fn list_migrations(
    State(state): State<AppState>,
    ctx: RequestContext,
    Params(query): Params<PageQuery>,
) -> Result<Response, ApiError> {
    let migrations = Migrations::new(state.core(), Some(&ctx.auth))
        .list(query.pagination())
        .await
        .or_problem(&ctx)?;
    Ok(Json(migrations).into_response())
}

async fn get_migration(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(migration_id): Path<String>,
) -> Result<Response, ApiError> {
    let migration = Migrations::new(state.core(), Some(&ctx.auth))
        .get(&migration_id)
        .await
        .or_problem(&ctx)?;
    Ok(Json(migration).into_response())
}

/// Set up a transfer. When the caller may accept it at once, the outcome
/// carries the owner update job.
async fn create_migration(
    State(state): State<AppState>,
    ctx: RequestContext,
    Body(params): Body<CreateParams>,
) -> Result<Response, ApiError> {
    let outcome = Migrations::new(state.core(), Some(&ctx.auth))
        .create(params)
        .await
        .or_problem(&ctx)?;
    Ok((StatusCode::CREATED, Json(outcome)).into_response())
}

/// Accept with `{"status": "accepted", "code": ...}`.
async fn update_migration(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(migration_id): Path<String>,
    Body(params): Body<UpdateParams>,
) -> Result<Response, ApiError> {
    let outcome = Migrations::new(state.core(), Some(&ctx.auth))
        .update(&migration_id, params)
        .await
        .or_problem(&ctx)?;
    Ok(Json(outcome).into_response())
}

async fn delete_migration(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(migration_id): Path<String>,
) -> Result<Response, ApiError> {
    Migrations::new(state.core(), Some(&ctx.auth))
        .delete(&migration_id)
        .await
        .or_problem(&ctx)?;
    Ok(StatusCode::NO_CONTENT.into_response())
}
