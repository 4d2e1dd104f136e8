//! Request-scoped context extracted from HTTP requests.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::HeaderMap;
use fabric_id::{RequestId, UserId};

use crate::api::error::ApiError;
use crate::service::{users, AuthInfo};
use crate::state::AppState;

pub const AUTHORIZATION_HEADER: &str = "Authorization";
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// The caller of a `/v2` request, resolved against the user store.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub auth: AuthInfo,
}

/// Identity claimed by a bearer token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub user_id: UserId,
    pub is_admin: bool,
}

pub fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

/// Request id from `x-request-id`, or a fresh one.
pub fn request_id(headers: &HeaderMap) -> String {
    header_string(headers, REQUEST_ID_HEADER).unwrap_or_else(|| RequestId::new().to_string())
}

/// Development bearer stub: `user:<id>` for a regular user and
/// `admin:<id>` for an administrator.
pub fn principal_from_headers(headers: &HeaderMap) -> Result<Principal, ApiError> {
    let Some(auth_value) = header_string(headers, AUTHORIZATION_HEADER) else {
        return Err(ApiError::unauthorized(
            "missing_authorization",
            "an Authorization Bearer token is required",
        ));
    };

    let Some(token) = auth_value.trim().strip_prefix("Bearer ") else {
        return Err(ApiError::unauthorized(
            "invalid_authorization",
            "Authorization must be a Bearer token",
        ));
    };

    let (is_admin, id) = match token.trim().split_once(':') {
        Some(("user", id)) => (false, id),
        Some(("admin", id)) => (true, id),
        _ => {
            return Err(ApiError::unauthorized(
                "invalid_token",
                "token must be in the form 'user:<id>' or 'admin:<id>'",
            ))
        }
    };

    let user_id = UserId::parse(id.trim())
        .map_err(|e| ApiError::unauthorized("invalid_token", e.to_string()))?;
    Ok(Principal { user_id, is_admin })
}

impl FromRequestParts<AppState> for RequestContext {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let request_id = request_id(&parts.headers);

        let principal =
            principal_from_headers(&parts.headers).map_err(|e| e.with_request_id(request_id.clone()))?;

        let auth = users::authenticate(state.core(), &principal.user_id, principal.is_admin)
            .await
            .map_err(|e| ApiError::from(e).with_request_id(request_id.clone()))?;

        Ok(Self { request_id, auth })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use rstest::rstest;

    fn headers(auth: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_str(auth).unwrap());
        headers
    }

    #[rstest]
    #[case("Bearer user:alice", "alice", false)]
    #[case("Bearer admin:root", "root", true)]
    #[case("Bearer  user:bob.smith@kth.se", "bob.smith@kth.se", false)]
    fn test_valid_tokens(#[case] value: &str, #[case] user: &str, #[case] admin: bool) {
        let principal = principal_from_headers(&headers(value)).unwrap();
        assert_eq!(principal.user_id.as_str(), user);
        assert_eq!(principal.is_admin, admin);
    }

    #[rstest]
    #[case("Basic dXNlcjpwdw==", "invalid_authorization")]
    #[case("Bearer alice", "invalid_token")]
    #[case("Bearer root:alice", "invalid_token")]
    #[case("Bearer user:", "invalid_token")]
    fn test_rejected_tokens(#[case] value: &str, #[case] code: &str) {
        let err = principal_from_headers(&headers(value)).unwrap_err();
        assert_eq!(err.code(), code);
    }

    #[test]
    fn test_missing_header() {
        let err = principal_from_headers(&HeaderMap::new()).unwrap_err();
        assert_eq!(err.status, axum::http::StatusCode::UNAUTHORIZED);
    }
}
