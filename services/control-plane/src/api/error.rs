//! RFC 7807 problem responses.

use axum::{
    extract::rejection::{JsonRejection, PathRejection, QueryRejection},
    http::{header::CONTENT_TYPE, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::service::ServiceError;

#[derive(Debug, Serialize)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub r#type: String,
    pub title: String,
    pub status: u16,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    pub code: String,
    pub request_id: String,
    pub retryable: bool,
}

impl ProblemDetails {
    fn new(status: StatusCode, code: impl Into<String>, detail: impl Into<String>) -> Self {
        let code = code.into();
        let title = status
            .canonical_reason()
            .unwrap_or("Unknown Error")
            .to_string();
        Self {
            r#type: format!("https://fabric.dev/problems/{code}"),
            title,
            status: status.as_u16(),
            detail: detail.into(),
            instance: None,
            code,
            request_id: "unknown".to_string(),
            retryable: false,
        }
    }

    fn set_request_id(&mut self, request_id: impl Into<String>) {
        let request_id = request_id.into();
        self.request_id = request_id.clone();
        if self.instance.is_none() {
            self.instance = Some(request_id);
        }
    }
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub problem: Box<ProblemDetails>,
}

impl ApiError {
    pub fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        let problem = Box::new(ProblemDetails::new(status, code, message));
        Self { status, problem }
    }

    pub fn bad_request(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, code, message)
    }

    pub fn not_found(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, code, message)
    }

    pub fn internal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, code, message)
    }

    pub fn conflict(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, code, message)
    }

    pub fn unauthorized(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, code, message)
    }

    pub fn forbidden(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, code, message)
    }

    pub fn unavailable(code: impl Into<String>, message: impl Into<String>) -> Self {
        let mut err = Self::new(StatusCode::SERVICE_UNAVAILABLE, code, message);
        err.problem.retryable = true;
        err
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.problem.set_request_id(request_id);
        self
    }

    pub fn code(&self) -> &str {
        &self.problem.code
    }
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        let detail = err.to_string();
        match err.root() {
            ServiceError::NotFound { .. } => Self::not_found("not_found", detail),
            ServiceError::NonUniqueField(_) => Self::conflict("non_unique_field", detail),
            ServiceError::AlreadyExists(_) => Self::conflict("already_exists", detail),
            ServiceError::AlreadyMigrated(_) => Self::conflict("already_migrated", detail),
            ServiceError::AlreadyAccepted => Self::conflict("already_accepted", detail),
            ServiceError::ConflictingActivity(_) => Self::conflict("conflicting_activity", detail),
            ServiceError::InvalidArgument(_) => Self::bad_request("invalid_argument", detail),
            ServiceError::QuotaExceeded { .. } => Self::bad_request("quota_exceeded", detail),
            ServiceError::BadMigrationCode => Self::bad_request("bad_migration_code", detail),
            ServiceError::Forbidden(_) => Self::forbidden("forbidden", detail),
            ServiceError::Store(store) if store.is_transient() => {
                Self::unavailable("store_unavailable", detail)
            }
            ServiceError::Subsystem(sub) if !sub.is_terminal() => {
                Self::unavailable("subsystem_unavailable", detail)
            }
            _ => Self::internal("internal_error", detail),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request("invalid_body", rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::bad_request("invalid_query", rejection.body_text())
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        Self::bad_request("invalid_path", rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response = (self.status, Json(self.problem)).into_response();
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/problem+json"),
        );
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subsystems::SubsystemError;
    use rstest::rstest;

    #[rstest]
    #[case(ServiceError::not_found("vm", "v1"), StatusCode::NOT_FOUND)]
    #[case(ServiceError::NonUniqueField("name web".into()), StatusCode::CONFLICT)]
    #[case(ServiceError::AlreadyExists("lease".into()), StatusCode::CONFLICT)]
    #[case(ServiceError::AlreadyAccepted, StatusCode::CONFLICT)]
    #[case(ServiceError::ConflictingActivity("beingDeleted".into()), StatusCode::CONFLICT)]
    #[case(ServiceError::invalid("bad name"), StatusCode::BAD_REQUEST)]
    #[case(ServiceError::QuotaExceeded { field: "ram", current: 9.0, quota: 8.0 }, StatusCode::BAD_REQUEST)]
    #[case(ServiceError::BadMigrationCode, StatusCode::BAD_REQUEST)]
    #[case(ServiceError::Forbidden("admin only".into()), StatusCode::FORBIDDEN)]
    #[case(SubsystemError::Transient("503".into()).into(), StatusCode::SERVICE_UNAVAILABLE)]
    #[case(SubsystemError::PortInUse(30001).into(), StatusCode::INTERNAL_SERVER_ERROR)]
    fn test_service_error_status(#[case] err: ServiceError, #[case] status: StatusCode) {
        assert_eq!(ApiError::from(err).status, status);
    }

    #[test]
    fn test_context_is_looked_through() {
        let err = ServiceError::not_found("deployment", "d1").context("update deployment d1");
        let api = ApiError::from(err);
        assert_eq!(api.status, StatusCode::NOT_FOUND);
        assert!(api.problem.detail.starts_with("failed to update deployment d1"));
    }

    #[test]
    fn test_problem_content_type() {
        let response = ApiError::forbidden("forbidden", "no").with_request_id("r1").into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "application/problem+json"
        );
    }
}
