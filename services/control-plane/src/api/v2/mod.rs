//! API v2 routes.

mod deployments;
mod gpu;
mod hooks;
mod jobs;
mod migrations;
mod notifications;
mod sms;
mod status;
mod teams;
mod users;
mod vms;
mod zones;

use axum::extract::{FromRequest, FromRequestParts, Json, Query, Request};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Router;
use fabric_id::UserId;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::db::Pagination;
use crate::model::job::JobVersion;
use crate::service::resources::{GetOpts, ListOpts};
use crate::service::{JobRef, ServiceError};
use crate::state::AppState;

/// Create API v2 routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .nest("/deployments", deployments::routes())
        .nest("/vms", vms::routes(JobVersion::V2))
        .nest("/storageManagers", sms::routes())
        .nest("/gpuGroups", gpu::group_routes())
        .nest("/gpuLeases", gpu::lease_routes())
        .nest("/resourceMigrations", migrations::routes())
        .nest("/notifications", notifications::routes())
        .nest("/teams", teams::routes())
        .nest("/users", users::routes())
        .nest("/zones", zones::routes())
        .nest("/jobs", jobs::routes())
        .nest("/status", status::routes())
        .nest("/hooks", hooks::routes())
}

/// The legacy VM surface: same operations, version 1 jobs.
pub fn legacy_routes() -> Router<AppState> {
    Router::new().nest("/vms", vms::routes(JobVersion::V1))
}

/// JSON request body whose rejections render as problem details.
pub struct Body<T>(pub T);

impl<S, T> FromRequest<S> for Body<T>
where
    S: Send + Sync,
    T: DeserializeOwned,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state).await?;
        Ok(Self(value))
    }
}

/// Query string whose rejections render as problem details.
pub struct Params<T>(pub T);

impl<S, T> FromRequestParts<S> for Params<T>
where
    S: Send + Sync,
    T: DeserializeOwned,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Query(value) = Query::<T>::from_request_parts(parts, state).await?;
        Ok(Self(value))
    }
}

/// Largest page a caller may ask for.
const MAX_PAGE_SIZE: u32 = 1000;

/// Paging shared by every list endpoint. Pages are zero-based.
pub fn pagination(page: Option<u32>, page_size: Option<u32>) -> Option<Pagination> {
    match (page, page_size) {
        (None, None) => None,
        (page, size) => Some(Pagination {
            page: page.unwrap_or(0),
            page_size: size.unwrap_or(100).clamp(1, MAX_PAGE_SIZE),
        }),
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageQuery {
    #[serde(default)]
    pub all: bool,
    #[serde(default)]
    pub page: Option<u32>,
    #[serde(default)]
    pub page_size: Option<u32>,
}

impl PageQuery {
    pub fn pagination(&self) -> Option<Pagination> {
        pagination(self.page, self.page_size)
    }
}

/// Query of the resource list endpoints.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    #[serde(default)]
    pub user_id: Option<UserId>,
    #[serde(default)]
    pub all: bool,
    #[serde(default)]
    pub shared: bool,
    #[serde(default)]
    pub page: Option<u32>,
    #[serde(default)]
    pub page_size: Option<u32>,
}

impl ListQuery {
    pub fn opts(&self) -> ListOpts {
        ListOpts {
            user_id: self.user_id.clone(),
            all: self.all,
            shared: self.shared,
            pagination: pagination(self.page, self.page_size),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct GetQuery {
    #[serde(default)]
    pub shared: bool,
}

impl From<GetQuery> for GetOpts {
    fn from(query: GetQuery) -> Self {
        Self { shared: query.shared }
    }
}

/// Attach the request id to a service failure.
pub trait ServiceResultExt<T> {
    fn or_problem(self, ctx: &RequestContext) -> Result<T, ApiError>;
}

impl<T> ServiceResultExt<T> for Result<T, ServiceError> {
    fn or_problem(self, ctx: &RequestContext) -> Result<T, ApiError> {
        self.map_err(|e| ApiError::from(e).with_request_id(ctx.request_id.clone()))
    }
}

/// `201 Created` with the id of the new resource and its job.
pub fn created(job: JobRef) -> Response {
    (StatusCode::CREATED, Json(job)).into_response()
}

/// `200 OK` with the id of the resource and the enqueued job.
pub fn accepted(job: JobRef) -> Response {
    (StatusCode::OK, Json(job)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pagination_defaults() {
        assert_eq!(pagination(None, None), None);
        assert_eq!(
            pagination(Some(2), None),
            Some(Pagination {
                page: 2,
                page_size: 100
            })
        );
        assert_eq!(pagination(None, Some(50_000)).map(|p| p.page_size), Some(MAX_PAGE_SIZE));
        assert_eq!(pagination(None, Some(0)).map(|p| p.page_size), Some(1));
    }
}
