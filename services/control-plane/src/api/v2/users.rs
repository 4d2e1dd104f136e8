//! User endpoints.

use axum::{
    extract::{Path, State},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};

use super::{Body, PageQuery, Params, ServiceResultExt};
use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::service::users::{UpdateParams, Users};
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_users))
        .route("/{user_id}", get(get_user).post(update_user))
}

async fn list_users(
    State(state): State<AppState>,
    ctx: RequestContext,
    Params(query): Params<PageQuery>,
) -> Result<Response, ApiError> {
    let users = Users::new(state.core(), Some(&ctx.auth))
        .list(query.pagination())
        .await
        .or_problem(&ctx)?;
    Ok(Json(users).into_response())
}

async fn get_user(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(user_id): Path<String>,
) -> Result<Response, ApiError> {
    let user = Users::new(state.core(), Some(&ctx.auth))
        .get(&user_id)
        .await
        .or_problem(&ctx)?;
    Ok(Json(user).into_response())
}

/// Admins change roles.
async fn update_user(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(user_id): Path<String>,
    Body(params): Body<UpdateParams>,
) -> Result<Response, ApiError> {
    let user = Users::new(state.core(), Some(&ctx.auth))
        .update(&user_id, params)
        .await
        .or_problem(&ctx)?;
    Ok(Json(user).into_response())
}
