use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use paperlab_ai::{AnalysisProvider, Paper, ProviderError, ProviderOutput, ProviderRegistry};
use paperlab_core::ProviderId;
use paperlab_infra::PipelineConfig;
use paperlab_infra::jobs::{InMemoryNotifier, InMemorySubjectStore, RetryPolicy};
use reqwest::StatusCode;
use serde_json::json;

use paperlab_api::app::{AppServices, build_app};

struct Summarizer {
    id: ProviderId,
}

#[async_trait]
impl AnalysisProvider for Summarizer {
    fn id(&self) -> &ProviderId {
        &self.id
    }

    async fn analyze(&self, paper: &Paper) -> Result<ProviderOutput, ProviderError> {
        Ok(ProviderOutput::new(json!({ "title": paper.title }), 0.9).with_summary("short summary"))
    }
}

struct Unauthorized {
    id: ProviderId,
}

#[async_trait]
impl AnalysisProvider for Unauthorized {
    fn id(&self) -> &ProviderId {
        &self.id
    }

    async fn analyze(&self, _paper: &Paper) -> Result<ProviderOutput, ProviderError> {
        Err(ProviderError::Unauthorized("invalid api key".to_string()))
    }
}

struct TestServer {
    base_url: String,
    services: Arc<AppServices>,
    notifier: Arc<InMemoryNotifier>,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn() -> Self {
        paperlab_observability::init_for_tests();

        let mut registry = ProviderRegistry::new();
        registry.register_shared(Arc::new(Summarizer {
            id: ProviderId::from("summarizer"),
        }));
        registry.register_shared(Arc::new(Unauthorized {
            id: ProviderId::from("locked"),
        }));

        let subjects = Arc::new(InMemorySubjectStore::new());
        subjects.insert(Paper::new("paper-1".into(), "Attention Is All You Need"));

        let notifier = Arc::new(InMemoryNotifier::new());
        let config = PipelineConfig::default()
            .with_concurrency(2)
            .with_poll_interval(Duration::from_millis(5))
            .with_retry_policy(RetryPolicy::exponential(
                1,
                Duration::from_millis(5),
                Duration::from_millis(20),
            ));

        let services = Arc::new(AppServices::in_memory(
            config,
            Arc::new(registry),
            subjects,
            notifier.clone(),
            None,
        ));

        // Same router as prod, bound to an ephemeral port.
        let app = build_app(services.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url,
            services,
            notifier,
            handle,
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn enqueue(client: &reqwest::Client, base_url: &str, body: serde_json::Value) -> reqwest::Response {
    client
        .post(format!("{}/jobs", base_url))
        .json(&body)
        .send()
        .await
        .unwrap()
}

async fn job_eventually(client: &reqwest::Client, base_url: &str, id: &str, status: &str) -> serde_json::Value {
    // Workers run in the background; poll until the job reaches `status`.
    for _ in 0..200 {
        let res = client
            .get(format!("{}/jobs/{}", base_url, id))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);

        let body: serde_json::Value = res.json().await.unwrap();
        if body["status"] == status {
            return body;
        }

        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    panic!("job {id} did not reach {status} within timeout");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn health_reports_ok_until_pool_closes() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client.get(format!("{}/health", srv.base_url)).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    if let Some(pool) = &srv.services.pool {
        pool.close().await;
    }

    let res = client.get(format!("{}/health", srv.base_url)).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn enqueue_then_poll_until_completed() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = enqueue(
        &client,
        &srv.base_url,
        json!({
            "subject_id": "paper-1",
            "owner_id": "alice",
            "capabilities": ["summarizer", "locked"],
        }),
    )
    .await;
    assert_eq!(res.status(), StatusCode::CREATED);
    let body: serde_json::Value = res.json().await.unwrap();
    let id = body["id"].as_str().unwrap().to_string();

    let job = job_eventually(&client, &srv.base_url, &id, "completed").await;
    assert_eq!(job["progress_percent"], 100);
    assert_eq!(job["result"].as_array().unwrap().len(), 1);
    assert_eq!(job["result"][0]["provider_id"], "summarizer");

    let outcomes = srv.notifier.all();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].1.payload["providers"], json!(["summarizer"]));
    assert_eq!(outcomes[0].1.payload["failed_providers"], json!(["locked"]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn enqueue_validation_errors_are_400() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = enqueue(
        &client,
        &srv.base_url,
        json!({ "subject_id": "paper-1", "owner_id": "alice", "capabilities": [] }),
    )
    .await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "validation_error");

    let res = enqueue(
        &client,
        &srv.base_url,
        json!({ "subject_id": "paper-1", "owner_id": "alice", "capabilities": ["nope"] }),
    )
    .await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let res = enqueue(
        &client,
        &srv.base_url,
        json!({ "subject_id": " ", "owner_id": "alice", "capabilities": ["summarizer"] }),
    )
    .await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "invalid_id");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_and_malformed_job_ids() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client
        .get(format!("{}/jobs/not-a-uuid", srv.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let res = client
        .get(format!("{}/jobs/{}", srv.base_url, unknown_job_id()))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "not_found");
}

fn unknown_job_id() -> String {
    paperlab_infra::jobs::JobId::new().to_string()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_job_can_be_retried() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = enqueue(
        &client,
        &srv.base_url,
        json!({ "subject_id": "paper-1", "owner_id": "bob", "capabilities": ["locked"] }),
    )
    .await;
    let body: serde_json::Value = res.json().await.unwrap();
    let id = body["id"].as_str().unwrap().to_string();

    let job = job_eventually(&client, &srv.base_url, &id, "failed").await;
    assert_eq!(job["error"]["retryable"], false);
    assert!(job["error"]["message"].as_str().unwrap().contains("API key"));

    let res = client
        .post(format!("{}/jobs/{}/retry", srv.base_url, id))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["retried_from"], id.as_str());
    let new_id = body["id"].as_str().unwrap().to_string();

    job_eventually(&client, &srv.base_url, &new_id, "failed").await;

    let res = client
        .get(format!("{}/jobs?owner_id=bob", srv.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["count"], 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_is_idempotent_and_retry_of_cancelled_conflicts() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    // No workers: the job stays pending.
    if let Some(pool) = &srv.services.pool {
        pool.close().await;
    }

    let res = enqueue(
        &client,
        &srv.base_url,
        json!({ "subject_id": "paper-1", "owner_id": "carol", "capabilities": ["summarizer"] }),
    )
    .await;
    let body: serde_json::Value = res.json().await.unwrap();
    let id = body["id"].as_str().unwrap().to_string();

    let res = client
        .post(format!("{}/jobs/{}/cancel", srv.base_url, id))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["cancelled"], true);

    let res = client
        .post(format!("{}/jobs/{}/cancel", srv.base_url, id))
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["cancelled"], false);

    let res = client
        .post(format!("{}/jobs/{}/retry", srv.base_url, id))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CONFLICT);

    assert!(srv.notifier.all().is_empty());
}
