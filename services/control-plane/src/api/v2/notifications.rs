//! Notification endpoints.

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
use crate::service::notifications::{Notifications, UpdateParams};
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/", get(list_notifications)).route(
        "/{notification_id}",
        get(get_notification)
            .post(update_notification)
            .delete(delete_notification),
    )
}

async fn list_notifications(
    State(state): State<AppState>,
    ctx: RequestContext,
    Params(query): Params<PageQuery>,
) -> Result<Response, ApiError> {
    let notifications = Notifications::new(state.core(), Some(&ctx.auth))
        .list(query.all, query.pagination())
        .await
        .or_problem(&ctx)?;
    Ok(Json(notifications).into_response())
}

async fn get_notification(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(notification_id): Path<String>,
) -> Result<Response, ApiError> {
    let notification = Notifications::new(state.core(), Some(&ctx.auth))
        .get(&notification_id)
        .await
        .or_problem(&ctx)?;
    Ok(Json(notification).into_response())
}

/// Mark read (`{"read": true}`) or unread.
async fn update_notification(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(notification_id): Path<String>,
    Body(params): Body<UpdateParams>,
) -> Result<Response, ApiError> {
    let notification = Notifications::new(state.core(), Some(&ctx.auth))
        .update(&notification_id, params)
        .await
        .or_problem(&ctx)?;
    Ok(Json(notification).into_response())
}

async fn delete_notification(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(notification_id): Path<String>,
) -> Result<Response, ApiError> {
    Notifications::new(state.core(), Some(&ctx.auth))
        .delete(&notification_id)
        .await
        .or_problem(&ctx)?;
    Ok(StatusCode::NO_CONTENT.into_response())
}
