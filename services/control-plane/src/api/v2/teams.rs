//! Team endpoints.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;

use super::{Body, PageQuery, Params, ServiceResultExt};
use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::service::teams::{CreateParams, JoinParams, MemberRef, Teams, UpdateParams};
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_teams).post(create_team))
        .route(
            "/{team_id}",
            get(get_team).post(update_team).delete(delete_team),
        )
}

/// An update, or a join when `invitationCode` is present.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateBody {
    #[serde(default)]
    invitation_code: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    resources: Option<Vec<String>>,
    #[serde(default)]
    members: Option<Vec<MemberRef>>,
}

async fn list_teams(
    State(state): State<AppState>,
    ctx: RequestContext,
    Params(query): Params<PageQuery>,
) -> Result<Response, ApiError> {
    let teams = Teams::new(state.core(), Some(&ctx.auth))
        .list(query.all, query.pagination())
        .await
        .or_problem(&ctx)?;
    Ok(Json(teams).into_response())
}

async fn get_team(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(team_id): Path<String>,
) -> Result<Response, ApiError> {
    let team = Teams::new(state.core(), Some(&ctx.auth))
        .get(&team_id)
        .await
        .or_problem(&ctx)?;
    Ok(Json(team).into_response())
}

async fn create_team(
    State(state): State<AppState>,
    ctx: RequestContext,
    Body(params): Body<CreateParams>,
) -> Result<Response, ApiError> {
    let team = Teams::new(state.core(), Some(&ctx.auth))
        .create(params)
        .await
        .or_problem(&ctx)?;
    Ok((StatusCode::CREATED, Json(team)).into_response())
}

async fn update_team(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(team_id): Path<String>,
    Body(body): Body<UpdateBody>,
) -> Result<Response, ApiError> {
    let svc = Teams::new(state.core(), Some(&ctx.auth));
    let team = match body.invitation_code {
        Some(invitation_code) => svc.join(&team_id, JoinParams { invitation_code }).await,
        None => {
            let params = UpdateParams {
                name: body.name,
                description: body.description,
                resources: body.resources,
                members: body.members,
            };
            svc.update(&team_id, params).await
        }
    }
    .or_problem(&ctx)?;
    Ok(Json(team).into_response())
}

async fn delete_team(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(team_id): Path<String>,
) -> Result<Response, ApiError> {
    Teams::new(state.core(), Some(&ctx.auth))
        .delete(&team_id)
        .await
        .or_problem(&ctx)?;
    Ok(StatusCode::NO_CONTENT.into_response())
}
