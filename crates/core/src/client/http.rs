//! HTTP implementation of the control-plane contract

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Response, StatusCode};
use tracing::{debug, info};

use super::protocol::{
    CompleteRequest, FailRequest, Heartbeat, NextTaskResponse, OutputChunk, OutputRequest,
    RegisterResponse,
};
use super::{ControlPlane, OutputSink};
use crate::capabilities::WorkerCapabilities;
use crate::config::AgentConfig;
use crate::error::Error;
use crate::task::{ExecutionResult, Task};
use crate::Result;

/// Completion reports carry at most this many characters of output
pub const MAX_REPORTED_OUTPUT_CHARS: usize = 5000;

/// Typed wrapper over the control-plane REST API
#[derive(Debug, Clone)]
pub struct ControlPlaneClient {
    client: Client,
    base_url: String,
}

impl ControlPlaneClient {
    pub fn new(config: &AgentConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let mut auth = HeaderValue::from_str(&format!("Bearer {}", config.api_key))
            .map_err(|_| Error::Config("API key contains invalid header characters".into()))?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);

        let client = Client::builder()
            .default_headers(headers)
            .user_agent(concat!("worker-agent/", env!("CARGO_PKG_VERSION")))
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: config.api_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

/// Turn a non-2xx response into `Error::Api`, preferring the body's
/// `message` (or `error`) field as the description.
async fn check(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<serde_json::Value>(&body)
        .ok()
        .and_then(|v| {
            v.get("message")
                .or_else(|| v.get("error"))
                .and_then(|m| m.as_str())
                .map(str::to_string)
        })
        .or_else(|| (!body.trim().is_empty()).then(|| body.trim().to_string()))
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("request failed").to_string());

    Err(Error::Api {
        status: status.as_u16(),
        message,
    })
}

fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[async_trait]
impl OutputSink for ControlPlaneClient {
    async fn send_output(&self, task_id: &str, chunks: &[OutputChunk]) -> Result<()> {
        let url = self.url(&format!("/api/tasks/{}/output", urlencoding::encode(task_id)));
        let response = self
            .client
            .post(url)
            .json(&OutputRequest { output: chunks })
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }
}

#[async_trait]
impl ControlPlane for ControlPlaneClient {
    async fn register(&self, capabilities: &WorkerCapabilities) -> Result<String> {
        info!("Registering with control plane at {}", self.base_url);

        let response = self
            .client
            .post(self.url("/api/workers/register"))
            .json(capabilities)
            .send()
            .await?;
        let body: RegisterResponse = check(response).await?.json().await?;

        body.worker_id
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| Error::Registration("response did not include a workerId".into()))
    }

    async fn heartbeat(&self, heartbeat: &Heartbeat) -> Result<()> {
        let response = self
            .client
            .post(self.url("/api/workers/heartbeat"))
            .json(heartbeat)
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    async fn next_task(&self, worker_id: &str) -> Result<Option<Task>> {
        let url = self.url(&format!(
            "/api/workers/{}/tasks/next",
            urlencoding::encode(worker_id)
        ));
        let response = check(self.client.get(url).send().await?).await?;
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }

        let body = response.text().await?;
        if body.trim().is_empty() {
            return Ok(None);
        }
        let parsed: NextTaskResponse = serde_json::from_str(&body)?;
        if let Some(task) = &parsed.task {
            debug!("Received task {}", task.id);
        }
        Ok(parsed.task)
    }

    async fn complete_task(
        &self,
        task_id: &str,
        worker_id: &str,
        result: &ExecutionResult,
    ) -> Result<()> {
        let url = self.url(&format!("/api/tasks/{}/complete", urlencoding::encode(task_id)));
        let body = CompleteRequest {
            worker_id,
            execution_time: result.execution_time,
            output: truncate_chars(&result.output, MAX_REPORTED_OUTPUT_CHARS),
        };
        check(self.client.put(url).json(&body).send().await?).await?;
        Ok(())
    }

    async fn fail_task(&self, task_id: &str, worker_id: &str, error_message: &str) -> Result<()> {
        let url = self.url(&format!("/api/tasks/{}/fail", urlencoding::encode(task_id)));
        let body = FailRequest {
            worker_id,
            error_message,
        };
        check(self.client.put(url).json(&body).send().await?).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{HostIdentity, ResourceSnapshot, RuntimeMap};
    use axum::extract::{Path, State};
    use axum::http::{HeaderMap as AxumHeaders, StatusCode as AxumStatus};
    use axum::routing::{get, post, put};
    use axum::{Json, Router};
    use serde_json::{json, Value};
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Recorded {
        calls: Arc<Mutex<Vec<(String, Value)>>>,
    }

    impl Recorded {
        fn push(&self, name: impl Into<String>, body: Value) {
            self.calls.lock().unwrap().push((name.into(), body));
        }

        fn calls(&self) -> Vec<(String, Value)> {
            self.calls.lock().unwrap().clone()
        }
    }

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn client_for(url: String) -> ControlPlaneClient {
        let config = AgentConfig {
            api_url: url,
            api_key: "test-key".into(),
            ..Default::default()
        };
        ControlPlaneClient::new(&config).unwrap()
    }

    fn capabilities() -> WorkerCapabilities {
        WorkerCapabilities {
            identity: HostIdentity::from_parts(Some("aa:bb".into()), "host".into()),
            resources: ResourceSnapshot::default(),
            is_docker: false,
            runtimes: RuntimeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_register_sends_auth_and_returns_id() {
        let recorded = Recorded::default();
        let router = Router::new()
            .route(
                "/api/workers/register",
                post(
                    |State(rec): State<Recorded>, headers: AxumHeaders, Json(body): Json<Value>| async move {
                        let auth = headers
                            .get("authorization")
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or_default()
                            .to_string();
                        let agent = headers
                            .get("user-agent")
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or_default()
                            .to_string();
                        rec.push(format!("{}|{}", auth, agent), body);
                        Json(json!({ "workerId": "w-7" }))
                    },
                ),
            )
            .with_state(recorded.clone());

        let client = client_for(serve(router).await);
        let id = client.register(&capabilities()).await.unwrap();
        assert_eq!(id, "w-7");

        let calls = recorded.calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].0.starts_with("Bearer test-key|worker-agent/"));
        assert_eq!(calls[0].1["macAddress"], json!("aabb"));
    }

    #[tokio::test]
    async fn test_register_without_worker_id_is_error() {
        let router = Router::new().route("/api/workers/register", post(|| async { Json(json!({})) }));
        let client = client_for(serve(router).await);
        let err = client.register(&capabilities()).await.unwrap_err();
        assert!(matches!(err, Error::Registration(_)));
    }

    #[tokio::test]
    async fn test_non_2xx_carries_status_and_message() {
        let router = Router::new().route(
            "/api/workers/register",
            post(|| async {
                (
                    AxumStatus::FORBIDDEN,
                    Json(json!({ "message": "invalid api key" })),
                )
            }),
        );
        let client = client_for(serve(router).await);
        let err = client.register(&capabilities()).await.unwrap_err();
        assert_eq!(err.status(), Some(403));
        assert!(err.to_string().contains("invalid api key"));
    }

    #[tokio::test]
    async fn test_next_task_present_and_absent() {
        let router = Router::new().route(
            "/api/workers/{worker_id}/tasks/next",
            get(|Path(worker_id): Path<String>| async move {
                if worker_id == "busy-worker" {
                    Json(json!({ "task": { "id": "t1", "executionConfig": { "command": "echo" } } }))
                } else {
                    Json(json!({ "task": null }))
                }
            }),
        );
        let client = client_for(serve(router).await);

        let task = client.next_task("busy-worker").await.unwrap().unwrap();
        assert_eq!(task.id, "t1");
        assert!(client.next_task("idle-worker").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_next_task_no_content() {
        let router = Router::new().route(
            "/api/workers/{worker_id}/tasks/next",
            get(|| async { AxumStatus::NO_CONTENT }),
        );
        let client = client_for(serve(router).await);
        assert!(client.next_task("w").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_complete_truncates_output() {
        let recorded = Recorded::default();
        let router = Router::new()
            .route(
                "/api/tasks/{task_id}/complete",
                put(
                    |State(rec): State<Recorded>, Path(task_id): Path<String>, Json(body): Json<Value>| async move {
                        rec.push(task_id, body);
                        AxumStatus::OK
                    },
                ),
            )
            .with_state(recorded.clone());
        let client = client_for(serve(router).await);

        let result = ExecutionResult::success("é".repeat(MAX_REPORTED_OUTPUT_CHARS + 10), 3);
        client.complete_task("t 1", "w-1", &result).await.unwrap();

        let calls = recorded.calls();
        assert_eq!(calls[0].0, "t 1");
        let body = &calls[0].1;
        assert_eq!(body["workerId"], json!("w-1"));
        assert_eq!(body["executionTime"], json!(3));
        assert_eq!(
            body["output"].as_str().unwrap().chars().count(),
            MAX_REPORTED_OUTPUT_CHARS
        );
    }

    #[tokio::test]
    async fn test_fail_and_output_bodies() {
        let recorded = Recorded::default();
        let router = Router::new()
            .route(
                "/api/tasks/{task_id}/fail",
                put(|State(rec): State<Recorded>, Json(body): Json<Value>| async move {
                    rec.push("fail", body);
                    AxumStatus::OK
                }),
            )
            .route(
                "/api/tasks/{task_id}/output",
                post(|State(rec): State<Recorded>, Json(body): Json<Value>| async move {
                    rec.push("output", body);
                    AxumStatus::OK
                }),
            )
            .with_state(recorded.clone());
        let client = client_for(serve(router).await);

        client.fail_task("t1", "w-1", "boom").await.unwrap();
        client
            .send_output("t1", &[OutputChunk::stdout("hello")])
            .await
            .unwrap();

        let calls = recorded.calls();
        assert_eq!(calls[0].1, json!({ "workerId": "w-1", "errorMessage": "boom" }));
        assert_eq!(calls[1].1["output"][0]["type"], json!("stdout"));
        assert_eq!(calls[1].1["output"][0]["data"], json!("hello"));
    }

    #[test]
    fn test_truncate_chars() {
        assert_eq!(truncate_chars("hello", 3), "hel");
        assert_eq!(truncate_chars("hé", 5), "hé");
        assert_eq!(truncate_chars("ééé", 2), "éé");
    }
}
