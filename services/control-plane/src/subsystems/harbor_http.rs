//! Image registry client speaking the Harbor v2 REST API.
//!
//! Translates between the registry's wire format and the public objects in
//! [`super::harbor`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::harbor::{Project, Repository, Robot, Webhook};
use super::{ObjectApi, ObjectKey, ObjectKind, SubsystemError};
use crate::config::RegistryConfig;

const API_PREFIX: &str = "/api/v2.0";

/// Harbor registry client.
pub struct HarborClient {
    client: reqwest::Client,
    base_url: String,
    user: String,
    password: String,
    /// `project/repository:tag` copied into new repositories.
    placeholder: String,
}

impl HarborClient {
    pub fn new(config: &RegistryConfig) -> Result<Self, SubsystemError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| SubsystemError::Other(format!("failed to build registry client: {e}")))?;

        let base_url = if config.url.starts_with("http://") || config.url.starts_with("https://") {
            config.url.trim_end_matches('/').to_string()
        } else {
            format!("https://{}", config.url.trim_end_matches('/'))
        };

        Ok(Self {
            client,
            base_url,
            user: config.user.clone(),
            password: config.password.clone(),
            placeholder: config.placeholder_image.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}{}", self.base_url, API_PREFIX, path)
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, self.url(path))
            .basic_auth(&self.user, Some(&self.password))
    }

    async fn send(
        &self,
        builder: reqwest::RequestBuilder,
        what: &str,
    ) -> Result<Response, SubsystemError> {
        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() || e.is_connect() {
                SubsystemError::Transient(format!("registry unreachable: {e}"))
            } else {
                SubsystemError::Other(format!("registry request failed: {e}"))
            }
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        debug!(status = %status, body = %body, what, "Registry request failed");
        Err(classify(status, what, &body))
    }

    async fn json<T: for<'de> Deserialize<'de>>(
        &self,
        builder: reqwest::RequestBuilder,
        what: &str,
    ) -> Result<Option<T>, SubsystemError> {
        match self.send(builder, what).await {
            Ok(response) => response
                .json::<T>()
                .await
                .map(Some)
                .map_err(|e| SubsystemError::Other(format!("invalid registry response: {e}"))),
            Err(SubsystemError::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    // =========================================================================
    // Projects
    // =========================================================================

    async fn read_project(&self, name: &str) -> Result<Option<Project>, SubsystemError> {
        let wire: Option<ProjectWire> = self
            .json(
                self.request(reqwest::Method::GET, &format!("/projects/{name}")),
                "project",
            )
            .await?;
        Ok(wire.map(Project::from))
    }

    async fn create_project(&self, project: &Project) -> Result<Project, SubsystemError> {
        let body = json!({
            "project_name": project.name,
            "metadata": {"public": project.public.to_string()},
        });
        match self
            .send(
                self.request(reqwest::Method::POST, "/projects").json(&body),
                "project",
            )
            .await
        {
            Ok(_) => {}
            Err(SubsystemError::BadState(_)) => {
                debug!(project = %project.name, "Project already exists");
            }
            Err(err) => return Err(err),
        }
        self.read_project(&project.name)
            .await?
            .ok_or_else(|| SubsystemError::NotFound(format!("project {}", project.name)))
    }

    async fn update_project(&self, project: &Project) -> Result<Project, SubsystemError> {
        let body = json!({"metadata": {"public": project.public.to_string()}});
        self.send(
            self.request(reqwest::Method::PUT, &format!("/projects/{}", project.name))
                .json(&body),
            "project",
        )
        .await?;
        self.read_project(&project.name)
            .await?
            .ok_or_else(|| SubsystemError::NotFound(format!("project {}", project.name)))
    }

    // =========================================================================
    // Robots
    // =========================================================================

    async fn find_robot(&self, project: &str, name: &str) -> Result<Option<RobotWire>, SubsystemError> {
        let full_name = format!("robot${project}+{name}");
        let robots: Option<Vec<RobotWire>> = self
            .json(
                self.request(reqwest::Method::GET, &format!("/projects/{project}/robots")),
                "robot",
            )
            .await?;
        Ok(robots
            .unwrap_or_default()
            .into_iter()
            .find(|r| r.name == full_name))
    }

    fn robot_body(robot: &Robot) -> Value {
        json!({
            "name": robot.name,
            "description": robot.description,
            "disable": robot.disabled,
            "level": "project",
            "duration": -1,
            "permissions": [{
                "kind": "project",
                "namespace": robot.project,
                "access": [
                    {"resource": "repository", "action": "pull"},
                    {"resource": "repository", "action": "push"},
                ],
            }],
        })
    }

    async fn create_robot(&self, robot: &Robot) -> Result<Robot, SubsystemError> {
        if let Some(existing) = self.find_robot(&robot.project, &robot.name).await? {
            return Ok(existing.into_robot(&robot.project, &robot.name, None));
        }

        let created: RobotCreated = self
            .send(
                self.request(reqwest::Method::POST, "/robots")
                    .json(&Self::robot_body(robot)),
                "robot",
            )
            .await?
            .json()
            .await
            .map_err(|e| SubsystemError::Other(format!("invalid registry response: {e}")))?;

        Ok(Robot {
            id: Some(created.id),
            secret: Some(created.secret),
            ..robot.clone()
        })
    }

    async fn update_robot(&self, robot: &Robot) -> Result<Robot, SubsystemError> {
        let existing = self
            .find_robot(&robot.project, &robot.name)
            .await?
            .ok_or_else(|| SubsystemError::NotFound(format!("robot {}", robot.name)))?;

        let mut body = Self::robot_body(robot);
        body["name"] = json!(existing.name);
        self.send(
            self.request(reqwest::Method::PUT, &format!("/robots/{}", existing.id))
                .json(&body),
            "robot",
        )
        .await?;

        Ok(Robot {
            id: Some(existing.id),
            secret: robot.secret.clone(),
            ..robot.clone()
        })
    }

    // =========================================================================
    // Repositories
    // =========================================================================

    async fn read_repository(
        &self,
        project: &str,
        name: &str,
    ) -> Result<Option<Repository>, SubsystemError> {
        let wire: Option<RepositoryWire> = self
            .json(
                self.request(
                    reqwest::Method::GET,
                    &format!("/projects/{project}/repositories/{name}"),
                ),
                "repository",
            )
            .await?;
        Ok(wire.map(|w| Repository {
            name: name.to_string(),
            project: project.to_string(),
            id: Some(w.id),
            created_at: None,
        }))
    }

    /// Repositories cannot be created empty; copy the placeholder image in.
    async fn create_repository(&self, repository: &Repository) -> Result<Repository, SubsystemError> {
        if let Some(existing) = self
            .read_repository(&repository.project, &repository.name)
            .await?
        {
            return Ok(existing);
        }

        self.send(
            self.request(
                reqwest::Method::POST,
                &format!(
                    "/projects/{}/repositories/{}/artifacts",
                    repository.project, repository.name
                ),
            )
            .query(&[("from", self.placeholder.as_str())]),
            "repository",
        )
        .await?;

        self.read_repository(&repository.project, &repository.name)
            .await?
            .ok_or_else(|| SubsystemError::NotFound(format!("repository {}", repository.name)))
    }

    // =========================================================================
    // Webhooks
    // =========================================================================

    async fn find_webhook(&self, project: &str, name: &str) -> Result<Option<WebhookWire>, SubsystemError> {
        let policies: Option<Vec<WebhookWire>> = self
            .json(
                self.request(
                    reqwest::Method::GET,
                    &format!("/projects/{project}/webhook/policies"),
                ),
                "webhook",
            )
            .await?;
        Ok(policies
            .unwrap_or_default()
            .into_iter()
            .find(|p| p.name == name))
    }

    fn webhook_body(webhook: &Webhook) -> Value {
        json!({
            "name": webhook.name,
            "enabled": true,
            "event_types": ["PUSH_ARTIFACT"],
            "targets": [{
                "type": "http",
                "address": webhook.target,
                "auth_header": webhook.token,
                "skip_cert_verify": false,
            }],
        })
    }

    async fn create_webhook(&self, webhook: &Webhook) -> Result<Webhook, SubsystemError> {
        if self.find_webhook(&webhook.project, &webhook.name).await?.is_none() {
            self.send(
                self.request(
                    reqwest::Method::POST,
                    &format!("/projects/{}/webhook/policies", webhook.project),
                )
                .json(&Self::webhook_body(webhook)),
                "webhook",
            )
            .await?;
        }

        self.find_webhook(&webhook.project, &webhook.name)
            .await?
            .map(|w| w.into_webhook(&webhook.project))
            .ok_or_else(|| SubsystemError::NotFound(format!("webhook {}", webhook.name)))
    }

    async fn update_webhook(&self, webhook: &Webhook) -> Result<Webhook, SubsystemError> {
        let existing = self
            .find_webhook(&webhook.project, &webhook.name)
            .await?
            .ok_or_else(|| SubsystemError::NotFound(format!("webhook {}", webhook.name)))?;

        self.send(
            self.request(
                reqwest::Method::PUT,
                &format!(
                    "/projects/{}/webhook/policies/{}",
                    webhook.project, existing.id
                ),
            )
            .json(&Self::webhook_body(webhook)),
            "webhook",
        )
        .await?;

        Ok(Webhook {
            id: Some(existing.id),
            ..webhook.clone()
        })
    }
}

fn classify(status: StatusCode, what: &str, body: &str) -> SubsystemError {
    match status {
        StatusCode::NOT_FOUND => SubsystemError::NotFound(what.to_string()),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            SubsystemError::Unauthorized(format!("registry refused {what} request"))
        }
        StatusCode::CONFLICT => SubsystemError::BadState(format!("{what} already exists")),
        StatusCode::TOO_MANY_REQUESTS
        | StatusCode::BAD_GATEWAY
        | StatusCode::SERVICE_UNAVAILABLE
        | StatusCode::GATEWAY_TIMEOUT => {
            SubsystemError::Transient(format!("registry returned {status} for {what}"))
        }
        s if s.is_server_error() => {
            SubsystemError::Transient(format!("registry returned {status} for {what}: {body}"))
        }
        _ => SubsystemError::Other(format!("registry returned {status} for {what}: {body}")),
    }
}

fn decode<T: for<'de> Deserialize<'de>>(body: Value) -> Result<T, SubsystemError> {
    serde_json::from_value(body)
        .map_err(|e| SubsystemError::Other(format!("invalid registry object: {e}")))
}

fn encode<T: Serialize>(value: T) -> Result<Value, SubsystemError> {
    serde_json::to_value(value)
        .map_err(|e| SubsystemError::Other(format!("failed to encode registry object: {e}")))
}

// =============================================================================
// Wire format
// =============================================================================

#[derive(Debug, Deserialize)]
struct ProjectWire {
    project_id: i64,
    name: String,
    #[serde(default)]
    metadata: ProjectMetadata,
}

#[derive(Debug, Default, Deserialize)]
struct ProjectMetadata {
    #[serde(default)]
    public: Option<String>,
}

impl From<ProjectWire> for Project {
    fn from(wire: ProjectWire) -> Self {
        Self {
            name: wire.name,
            public: wire.metadata.public.as_deref() == Some("true"),
            id: Some(wire.project_id),
            created_at: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RobotWire {
    id: i64,
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    disable: bool,
}

impl RobotWire {
    fn into_robot(self, project: &str, short_name: &str, secret: Option<String>) -> Robot {
        Robot {
            name: short_name.to_string(),
            project: project.to_string(),
            description: self.description,
            disabled: self.disable,
            id: Some(self.id),
            secret,
            created_at: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RobotCreated {
    id: i64,
    secret: String,
}

#[derive(Debug, Deserialize)]
struct RepositoryWire {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct WebhookWire {
    id: i64,
    name: String,
    #[serde(default)]
    targets: Vec<WebhookTargetWire>,
}

#[derive(Debug, Deserialize)]
struct WebhookTargetWire {
    address: String,
    #[serde(default)]
    auth_header: String,
}

impl WebhookWire {
    fn into_webhook(self, project: &str) -> Webhook {
        let target = self.targets.into_iter().next();
        Webhook {
            name: self.name,
            project: project.to_string(),
            target: target.as_ref().map(|t| t.address.clone()).unwrap_or_default(),
            token: target.map(|t| t.auth_header).unwrap_or_default(),
            id: Some(self.id),
            created_at: None,
        }
    }
}

#[async_trait]
impl ObjectApi for HarborClient {
    async fn read(&self, key: &ObjectKey) -> Result<Option<Value>, SubsystemError> {
        match key.kind {
            ObjectKind::HarborProject => self.read_project(&key.name).await?.map(encode).transpose(),
            ObjectKind::HarborRobot => self
                .find_robot(&key.scope, &key.name)
                .await?
                .map(|r| encode(r.into_robot(&key.scope, &key.name, None)))
                .transpose(),
            ObjectKind::HarborRepository => self
                .read_repository(&key.scope, &key.name)
                .await?
                .map(encode)
                .transpose(),
            ObjectKind::HarborWebhook => self
                .find_webhook(&key.scope, &key.name)
                .await?
                .map(|w| encode(w.into_webhook(&key.scope)))
                .transpose(),
            other => Err(unsupported(other)),
        }
    }

    async fn create(&self, key: &ObjectKey, body: Value) -> Result<Value, SubsystemError> {
        match key.kind {
            ObjectKind::HarborProject => encode(self.create_project(&decode(body)?).await?),
            ObjectKind::HarborRobot => encode(self.create_robot(&decode(body)?).await?),
            ObjectKind::HarborRepository => encode(self.create_repository(&decode(body)?).await?),
            ObjectKind::HarborWebhook => encode(self.create_webhook(&decode(body)?).await?),
            other => Err(unsupported(other)),
        }
    }

    async fn update(&self, key: &ObjectKey, body: Value) -> Result<Value, SubsystemError> {
        match key.kind {
            ObjectKind::HarborProject => encode(self.update_project(&decode(body)?).await?),
            ObjectKind::HarborRobot => encode(self.update_robot(&decode(body)?).await?),
            ObjectKind::HarborRepository => {
                let repository: Repository = decode(body)?;
                self.send(
                    self.request(
                        reqwest::Method::PUT,
                        &format!(
                            "/projects/{}/repositories/{}",
                            repository.project, repository.name
                        ),
                    )
                    .json(&json!({"description": ""})),
                    "repository",
                )
                .await?;
                encode(repository)
            }
            ObjectKind::HarborWebhook => encode(self.update_webhook(&decode(body)?).await?),
            other => Err(unsupported(other)),
        }
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), SubsystemError> {
        let path = match key.kind {
            ObjectKind::HarborProject => format!("/projects/{}", key.name),
            ObjectKind::HarborRobot => {
                let robot = self
                    .find_robot(&key.scope, &key.name)
                    .await?
                    .ok_or_else(|| SubsystemError::NotFound(format!("robot {}", key.name)))?;
                format!("/robots/{}", robot.id)
            }
            ObjectKind::HarborRepository => {
                format!("/projects/{}/repositories/{}", key.scope, key.name)
            }
            ObjectKind::HarborWebhook => {
                let webhook = self
                    .find_webhook(&key.scope, &key.name)
                    .await?
                    .ok_or_else(|| SubsystemError::NotFound(format!("webhook {}", key.name)))?;
                format!("/projects/{}/webhook/policies/{}", key.scope, webhook.id)
            }
            other => return Err(unsupported(other)),
        };

        self.send(self.request(reqwest::Method::DELETE, &path), key.kind.as_str())
            .await?;
        Ok(())
    }

    async fn list(
        &self,
        _zone: &str,
        kind: ObjectKind,
        scope: &str,
    ) -> Result<Vec<Value>, SubsystemError> {
        match kind {
            ObjectKind::HarborRobot => {
                let robots: Option<Vec<RobotWire>> = self
                    .json(
                        self.request(reqwest::Method::GET, &format!("/projects/{scope}/robots")),
                        "robot",
                    )
                    .await?;
                let prefix = format!("robot${scope}+");
                robots
                    .unwrap_or_default()
                    .into_iter()
                    .map(|r| {
                        let short = r.name.trim_start_matches(prefix.as_str()).to_string();
                        encode(r.into_robot(scope, &short, None))
                    })
                    .collect()
            }
            ObjectKind::HarborWebhook => {
                let policies: Option<Vec<WebhookWire>> = self
                    .json(
                        self.request(
                            reqwest::Method::GET,
                            &format!("/projects/{scope}/webhook/policies"),
                        ),
                        "webhook",
                    )
                    .await?;
                policies
                    .unwrap_or_default()
                    .into_iter()
                    .map(|w| encode(w.into_webhook(scope)))
                    .collect()
            }
            other => {
                warn!(kind = %other, "Listing not supported by registry client");
                Err(unsupported(other))
            }
        }
    }

    async fn invoke(
        &self,
        key: &ObjectKey,
        action: &str,
        _args: Value,
    ) -> Result<Value, SubsystemError> {
        Err(SubsystemError::Other(format!(
            "action {action} not supported on {}",
            key.kind
        )))
    }
}

fn unsupported(kind: ObjectKind) -> SubsystemError {
    SubsystemError::Other(format!("{kind} is not a registry object"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> HarborClient {
        HarborClient::new(&RegistryConfig {
            url: server.uri(),
            user: "admin".to_string(),
            password: "secret".to_string(),
            placeholder_image: "library/placeholder:latest".to_string(),
            http: true,
            webhook_secret: String::new(),
        })
        .unwrap()
    }

    fn key(kind: ObjectKind, scope: &str, name: &str) -> ObjectKey {
        ObjectKey {
            zone: "dev".to_string(),
            kind,
            scope: scope.to_string(),
            name: name.to_string(),
        }
    }

    #[tokio::test]
    async fn test_read_missing_project() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v2.0/projects/u-alice"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let result = client(&server)
            .read(&key(ObjectKind::HarborProject, "", "u-alice"))
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_create_existing_project_returns_it() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v2.0/projects"))
            .respond_with(ResponseTemplate::new(409))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v2.0/projects/u-alice"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "project_id": 7,
                "name": "u-alice",
                "metadata": {"public": "false"},
            })))
            .mount(&server)
            .await;

        let created = client(&server)
            .create(
                &key(ObjectKind::HarborProject, "", "u-alice"),
                json!({"name": "u-alice"}),
            )
            .await
            .unwrap();
        let project: Project = serde_json::from_value(created).unwrap();
        assert_eq!(project.id, Some(7));
        assert!(!project.public);
    }

    #[tokio::test]
    async fn test_create_robot_returns_secret() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v2.0/projects/u-alice/robots"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v2.0/robots"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "id": 12,
                "name": "robot$u-alice+web",
                "secret": "s3cr3t",
            })))
            .mount(&server)
            .await;

        let created = client(&server)
            .create(
                &key(ObjectKind::HarborRobot, "u-alice", "web"),
                json!({"name": "web", "project": "u-alice"}),
            )
            .await
            .unwrap();
        let robot: Robot = serde_json::from_value(created).unwrap();
        assert_eq!(robot.id, Some(12));
        assert_eq!(robot.secret.as_deref(), Some("s3cr3t"));
        assert_eq!(robot.full_name(), "robot$u-alice+web");
    }

    #[tokio::test]
    async fn test_repository_is_seeded_from_placeholder() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v2.0/projects/u-alice/repositories/web"))
            .respond_with(ResponseTemplate::new(404))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v2.0/projects/u-alice/repositories/web/artifacts"))
            .and(query_param("from", "library/placeholder:latest"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v2.0/projects/u-alice/repositories/web"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": 3, "name": "u-alice/web"})))
            .mount(&server)
            .await;

        let created = client(&server)
            .create(
                &key(ObjectKind::HarborRepository, "u-alice", "web"),
                json!({"name": "web", "project": "u-alice"}),
            )
            .await
            .unwrap();
        assert_eq!(created["id"], json!(3));
    }

    #[tokio::test]
    async fn test_status_classification() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v2.0/projects/locked"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v2.0/projects/busy"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let harbor = client(&server);
        let err = harbor
            .read(&key(ObjectKind::HarborProject, "", "locked"))
            .await
            .unwrap_err();
        assert!(matches!(err, SubsystemError::Unauthorized(_)));

        let err = harbor
            .read(&key(ObjectKind::HarborProject, "", "busy"))
            .await
            .unwrap_err();
        assert!(matches!(err, SubsystemError::Transient(_)));
    }

    #[tokio::test]
    async fn test_delete_missing_webhook_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v2.0/projects/u-alice/webhook/policies"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;

        let err = client(&server)
            .delete(&key(ObjectKind::HarborWebhook, "u-alice", "web"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
