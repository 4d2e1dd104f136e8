//! End-to-end tests over HTTP against the in-memory store, the simulated
//! subsystems and a live job runner.

use std::sync::Arc;
use std::time::Duration;

use fabric_control_plane::{
    api,
    config::FabricConfig,
    db::{MemoryStore, Store},
    jobs::{JobRunner, Registry, RunnerConfig},
    model::worker::WorkerState,
    service::Core,
    state::AppState,
    subsystems::Subsystems,
    workers::status,
};
use hmac::{Hmac, Mac};
use reqwest::StatusCode;
use serde_json::{json, Value};
use sha2::Sha256;
use tokio::net::TcpListener;
use tokio::sync::watch;

const GITHUB_SECRET: &str = "itest-github-secret";

struct ApiFixture {
    base_url: String,
    client: reqwest::Client,
    core: Arc<Core>,
    _shutdown: watch::Sender<bool>,
}

impl ApiFixture {
    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn get(&self, user: &str, path: &str) -> reqwest::RequestBuilder {
        self.client.get(self.url(path)).bearer_auth(user)
    }

    fn post(&self, user: &str, path: &str, body: Value) -> reqwest::RequestBuilder {
        self.client.post(self.url(path)).bearer_auth(user).json(&body)
    }

    fn delete(&self, user: &str, path: &str) -> reqwest::RequestBuilder {
        self.client.delete(self.url(path)).bearer_auth(user)
    }

    /// Poll a job until it reaches a terminal status.
    async fn wait_for_job(&self, user: &str, job_id: &str) -> Value {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let job: Value = self
                .get(user, &format!("/v2/jobs/{job_id}"))
                .send()
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
            if matches!(job["status"].as_str(), Some("completed" | "terminated")) {
                return job;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "job {job_id} did not finish: {job}"
            );
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("fabric_control_plane=debug")
        .with_test_writer()
        .try_init();
}

async fn start_api() -> ApiFixture {
    init_tracing();
    let mut config = FabricConfig::default();
    config.github.webhook_secret = GITHUB_SECRET.to_string();
    config.jobs.idle_poll_millis = 10;
    config.jobs.drain_poll_millis = 10;
    config.jobs.cancel_poll_millis = 10;
    let config = Arc::new(config);

    let (subsystems, _) = Subsystems::simulated();
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let core = Arc::new(Core::new(store, subsystems, config.clone()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let runner = Arc::new(JobRunner::new(
        core.clone(),
        Registry::new(&config.jobs),
        RunnerConfig::from_settings(&config.jobs, 2),
    ));
    tokio::spawn(runner.run(shutdown_rx));

    let app = api::create_router(AppState::new(core.clone()));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    ApiFixture {
        base_url: format!("http://{addr}"),
        client: reqwest::Client::new(),
        core,
        _shutdown: shutdown_tx,
    }
}

#[tokio::test]
async fn test_health_endpoints() {
    let api = start_api().await;
    for path in ["/healthz", "/readyz", "/livez"] {
        let resp = api.client.get(api.url(path)).send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK, "{path}");
    }
}

#[tokio::test]
async fn test_requests_need_a_bearer_token() {
    let api = start_api().await;
    let resp = api.client.get(api.url("/v2/deployments")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        resp.headers()["content-type"].to_str().unwrap(),
        "application/problem+json"
    );
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "missing_authorization");
}

#[tokio::test]
async fn test_deployment_lifecycle() {
    let api = start_api().await;
    let alice = "user:alice";

    let resp = api
        .post(alice, "/v2/deployments", json!({ "name": "web", "image": "nginx:1.27" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    let created: Value = resp.json().await.unwrap();
    let id = created["id"].as_str().unwrap().to_string();
    let job = api.wait_for_job(alice, created["jobId"].as_str().unwrap()).await;
    assert_eq!(job["status"], "completed", "{job}");

    let deployment: Value = api
        .get(alice, &format!("/v2/deployments/{id}"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(deployment["name"], "web");
    assert!(deployment["activities"].as_object().unwrap().is_empty());

    // Someone else's deployment does not exist for bob.
    let resp = api
        .get("user:bob", &format!("/v2/deployments/{id}"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let resp = api
        .post(alice, &format!("/v2/deployments/{id}"), json!({ "replicas": 2 }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let updated: Value = resp.json().await.unwrap();
    let job = api.wait_for_job(alice, updated["jobId"].as_str().unwrap()).await;
    assert_eq!(job["status"], "completed", "{job}");

    let resp = api.delete(alice, &format!("/v2/deployments/{id}")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let deleted: Value = resp.json().await.unwrap();
    let job = api.wait_for_job(alice, deleted["jobId"].as_str().unwrap()).await;
    assert_eq!(job["status"], "completed", "{job}");

    let resp = api
        .get(alice, &format!("/v2/deployments/{id}"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_name_clash_and_bad_input() {
    let api = start_api().await;
    let alice = "user:alice";
    let body = json!({ "name": "api", "image": "nginx:1.27" });

    let resp = api.post(alice, "/v2/deployments", body.clone()).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    let resp = api.post(alice, "/v2/deployments", body).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::CONFLICT);

    let resp = api
        .post(alice, "/v2/deployments", json!({ "name": "Not A Label", "image": "x" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let resp = api
        .post(alice, "/v2/deployments", json!({ "replicas": "many" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let problem: Value = resp.json().await.unwrap();
    assert_eq!(problem["code"], "invalid_body");
}

#[tokio::test]
async fn test_jobs_are_scoped_and_cancellable_by_admins() {
    let api = start_api().await;
    let alice = "user:alice";

    let resp = api
        .post(alice, "/v2/deployments", json!({ "name": "svc", "image": "nginx:1.27" }))
        .send()
        .await
        .unwrap();
    let created: Value = resp.json().await.unwrap();
    let job_id = created["jobId"].as_str().unwrap().to_string();
    api.wait_for_job(alice, &job_id).await;

    let listed: Vec<Value> = api
        .get("user:bob", "/v2/jobs?all=true")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(listed.is_empty());

    let resp = api
        .get("user:bob", &format!("/v2/jobs/{job_id}"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let resp = api
        .post(alice, &format!("/v2/jobs/{job_id}"), json!({ "status": "terminated" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    let listed: Vec<Value> = api
        .get("admin:root", "/v2/jobs?all=true&type=createDeployment")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);
}

#[tokio::test]
async fn test_zones_and_status() {
    let api = start_api().await;
    let zones: Vec<Value> = api
        .get("user:alice", "/v2/zones?capability=vm")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(zones.len(), 1);
    let resp = api.get("user:alice", "/v2/zones/mars").send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    status::report(&api.core, "cp-1", "jobRunner", WorkerState::Running)
        .await
        .unwrap();
    let statuses: Vec<Value> = api
        .get("user:alice", "/v2/status")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0]["status"], "running");
}

#[tokio::test]
async fn test_github_hook_requires_signature() {
    let api = start_api().await;
    let body = json!({ "ref": "refs/heads/main", "repository": { "id": 42 } }).to_string();

    let resp = api
        .client
        .post(api.url("/v2/hooks/github"))
        .header("X-GitHub-Event", "push")
        .header("X-Hub-Signature-256", "sha256=00")
        .body(body.clone())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    let mut mac = Hmac::<Sha256>::new_from_slice(GITHUB_SECRET.as_bytes()).unwrap();
    mac.update(body.as_bytes());
    let signature = format!("sha256={}", hex::encode(mac.finalize().into_bytes()));
    let resp = api
        .client
        .post(api.url("/v2/hooks/github"))
        .header("X-GitHub-Event", "push")
        .header("X-Hub-Signature-256", signature)
        .body(body)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let outcome: Value = resp.json().await.unwrap();
    assert_eq!(outcome["triggered"], 0);
}

#[tokio::test]
async fn test_harbor_hook_without_secret_is_refused() {
    let api = start_api().await;
    let resp = api
        .client
        .post(api.url("/v2/hooks/harbor"))
        .json(&json!({
            "type": "PUSH_ARTIFACT",
            "event_data": { "repository": { "namespace": "u-alice", "name": "web" } }
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
}
