//! Job endpoints: read the queue, and let admins cancel.

use axum::{
    extract::{Path, State},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use fabric_id::{JobId, UserId};
use serde::Deserialize;

use super::{pagination, Body, Params, ServiceResultExt};
use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::model::job::{JobStatus, JobType};
use crate::service::jobs::{Jobs, ListParams, UpdateParams};
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_jobs))
        .route("/{job_id}", get(get_job).post(update_job))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobQuery {
    #[serde(default)]
    status: Option<JobStatus>,
    #[serde(default, rename = "type")]
    job_type: Option<JobType>,
    #[serde(default)]
    user_id: Option<UserId>,
    #[serde(default)]
    all: bool,
    #[serde(default)]
    page: Option<u32>,
    #[serde(default)]
    page_size: Option<u32>,
}

fn parse_job_id(raw: &str, ctx: &RequestContext) -> Result<JobId, ApiError> {
    JobId::parse(raw).map_err(|_| {
        ApiError::not_found("not_found", format!("job not found: {raw}"))
            .with_request_id(ctx.request_id.clone())
    })
}

async fn list_jobs(
    State(state): State<AppState>,
    ctx: RequestContext,
    Params(query): Params<JobQuery>,
) -> Result<Response, ApiError> {
    let params = ListParams {
        status: query.status,
        job_type: query.job_type,
        user_id: query.user_id.map(|u| u.as_str().to_string()),
        all: query.all,
    };
    let jobs = Jobs::new(state.core(), Some(&ctx.auth))
        .list(&params, pagination(query.page, query.page_size))
        .await
        .or_problem(&ctx)?;
    Ok(Json(jobs).into_response())
}

async fn get_job(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(job_id): Path<String>,
) -> Result<Response, ApiError> {
    let job_id = parse_job_id(&job_id, &ctx)?;
    let job = Jobs::new(state.core(), Some(&ctx.auth))
        .get(job_id)
        .await
        .or_problem(&ctx)?;
    Ok(Json(job).into_response())
}

/// Cancel with `{"status": "terminated"}`. Admins only.
async fn update_job(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(job_id): Path<String>,
    Body(params): Body<UpdateParams>,
) -> Result<Response, ApiError> {
    let job_id = parse_job_id(&job_id, &ctx)?;
    let job = Jobs::new(state.core(), Some(&ctx.auth))
        .update(job_id, params)
        .await
        .or_problem(&ctx)?;
    Ok(Json(job).into_response())
}
