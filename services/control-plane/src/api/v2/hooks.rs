//! Inbound webhooks from the image registry and the CI provider.
//!
//! Neither carries a bearer token. The registry authenticates with the
//! shared secret as its `Authorization` header; the CI provider signs the
//! body with HMAC-SHA256 in `X-Hub-Signature-256`.

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{debug, info};

use crate::api::error::ApiError;
use crate::api::request_context::{header_string, request_id, AUTHORIZATION_HEADER};
use crate::service::deployments::Deployments;
use crate::state::AppState;

pub const SIGNATURE_HEADER: &str = "X-Hub-Signature-256";
pub const EVENT_HEADER: &str = "X-GitHub-Event";

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/harbor", post(harbor_hook))
        .route("/github", post(github_hook))
}

#[derive(Debug, Deserialize)]
struct HarborEvent {
    #[serde(rename = "type")]
    event_type: String,
    event_data: HarborEventData,
}

#[derive(Debug, Deserialize)]
struct HarborEventData {
    repository: HarborRepository,
}

#[derive(Debug, Deserialize)]
struct HarborRepository {
    namespace: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct GithubPush {
    #[serde(rename = "ref")]
    git_ref: String,
    repository: GithubRepository,
}

#[derive(Debug, Deserialize)]
struct GithubRepository {
    id: i64,
}

#[derive(Debug, Serialize)]
struct HookOutcome {
    triggered: usize,
}

/// Whether `signature` (`sha256=<hex>`) is the HMAC-SHA256 of `body`.
pub fn verify_signature(secret: &str, body: &[u8], signature: &str) -> bool {
    let Some(hex_digest) = signature.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_digest) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

fn forbidden(request_id: &str) -> ApiError {
    ApiError::forbidden("invalid_signature", "webhook could not be authenticated")
        .with_request_id(request_id.to_string())
}

/// An image push restarts the custom deployments running it.
async fn harbor_hook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let request_id = request_id(&headers);
    let secret = &state.core().config.registry.webhook_secret;
    let token = header_string(&headers, AUTHORIZATION_HEADER).unwrap_or_default();
    if secret.is_empty() || token != *secret {
        return Err(forbidden(&request_id));
    }

    let event: HarborEvent = serde_json::from_slice(&body).map_err(|e| {
        ApiError::bad_request("invalid_body", e.to_string()).with_request_id(request_id.clone())
    })?;
    if event.event_type != "PUSH_ARTIFACT" {
        debug!(event_type = %event.event_type, "Ignoring registry event");
        return Ok(StatusCode::NO_CONTENT.into_response());
    }

    let repository = &event.event_data.repository;
    let triggered = Deployments::new(state.core(), None)
        .on_image_pushed(&repository.namespace, &repository.name)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(request_id.clone()))?;
    info!(
        project = %repository.namespace,
        repository = %repository.name,
        triggered,
        "Registry push handled"
    );
    Ok(Json(HookOutcome { triggered }).into_response())
}

/// A push to a tracked branch builds the deployments following it.
async fn github_hook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let request_id = request_id(&headers);
    let secret = &state.core().config.github.webhook_secret;
    let signature = header_string(&headers, SIGNATURE_HEADER).unwrap_or_default();
    if secret.is_empty() || !verify_signature(secret, &body, &signature) {
        return Err(forbidden(&request_id));
    }

    let event = header_string(&headers, EVENT_HEADER).unwrap_or_default();
    if event != "push" {
        debug!(event = %event, "Ignoring source event");
        return Ok(StatusCode::NO_CONTENT.into_response());
    }

    let push: GithubPush = serde_json::from_slice(&body).map_err(|e| {
        ApiError::bad_request("invalid_body", e.to_string()).with_request_id(request_id.clone())
    })?;
    let triggered = Deployments::new(state.core(), None)
        .on_source_pushed(push.repository.id, &push.git_ref)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(request_id.clone()))?;
    info!(
        repository_id = push.repository.id,
        git_ref = %push.git_ref,
        triggered,
        "Source push handled"
    );
    Ok(Json(HookOutcome { triggered }).into_response())
}
