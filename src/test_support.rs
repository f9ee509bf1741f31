//! Shared test doubles and the in-process HTTP harness.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode, header};
use axum::response::Response;
use http_body_util::BodyExt;
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;

use crate::errors::LlmError;
use crate::llm::{Completion, CompletionRequest, LlmClient, ResponseFormat};
use crate::orchestrator::Orchestrator;
use crate::phase::PhaseSpec;
use crate::server::api::{AppState, SharedState};
use crate::server::app::build_router;
use crate::server::auth::{generate_api_key, hash_api_key};
use crate::server::ratelimit::RateLimits;
use crate::store::{ArtifactFiles, DbHandle, Role, SpecflowDb};

/// LLM client that replays queued replies and records every request.
/// Once the queue is empty it answers with a document that satisfies the
/// built-in validators for the requested format.
pub struct ScriptedLlm {
    replies: Mutex<VecDeque<Result<String, LlmError>>>,
    calls: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedLlm {
    pub fn new(replies: Vec<Result<String, LlmError>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<CompletionRequest> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    fn provider(&self) -> &'static str {
        "scripted"
    }

    async fn complete(&self, request: CompletionRequest) -> Result<Completion, LlmError> {
        let format = request.format;
        let model = request.model.clone();
        self.calls.lock().unwrap().push(request);

        let text = match self.replies.lock().unwrap().pop_front() {
            Some(reply) => reply?,
            None => match format {
                ResponseFormat::Markdown => {
                    "# Generated document\n\nScripted content that is long enough to pass validation.\n"
                        .to_string()
                }
                ResponseFormat::Json => "{\"generated\": true}".to_string(),
            },
        };
        Ok(Completion {
            text,
            model,
            input_tokens: None,
            output_tokens: None,
        })
    }
}

pub const TEST_SECRET: &str = "test-secret-that-is-at-least-32-characters";

pub struct TestAppOptions {
    pub general_limit: u32,
    pub execute_limit: u32,
    pub replies: Vec<Result<String, LlmError>>,
}

impl Default for TestAppOptions {
    fn default() -> Self {
        Self {
            general_limit: 1_000,
            execute_limit: 1_000,
            replies: Vec::new(),
        }
    }
}

/// The full router over an in-memory database, with one admin and one
/// regular user already registered.
pub struct TestApp {
    router: Router,
    pub state: SharedState,
    pub llm: Arc<ScriptedLlm>,
    pub admin_key: String,
    pub user_key: String,
    _artifacts: TempDir,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_options(TestAppOptions::default()).await
    }

    pub async fn with_options(options: TestAppOptions) -> Self {
        let artifacts = TempDir::new().unwrap();
        let db = DbHandle::new(SpecflowDb::new_in_memory().unwrap());
        let files = ArtifactFiles::new(artifacts.path());
        let llm = Arc::new(ScriptedLlm::new(options.replies));
        let spec = Arc::new(PhaseSpec::builtin().unwrap());

        let admin_key = generate_api_key();
        let user_key = generate_api_key();
        let admin_hash = hash_api_key(TEST_SECRET, &admin_key);
        let user_hash = hash_api_key(TEST_SECRET, &user_key);
        db.call(move |db| {
            db.create_user("admin@example.com", "Admin", Role::Admin, &admin_hash)?;
            db.create_user("user@example.com", "User", Role::User, &user_hash)?;
            Ok(())
        })
        .await
        .unwrap();

        let state = Arc::new(AppState {
            orchestrator: Orchestrator::new(db.clone(), files.clone(), llm.clone(), spec),
            db,
            files,
            auth_secret: TEST_SECRET.to_string(),
            limits: RateLimits::per_minute(options.general_limit, options.execute_limit),
        });

        Self {
            router: build_router(state.clone()),
            state,
            llm,
            admin_key,
            user_key,
            _artifacts: artifacts,
        }
    }

    pub fn router(&self) -> Router {
        self.router.clone()
    }

    pub fn artifacts_root(&self) -> &Path {
        self.state.files.root()
    }

    pub async fn raw(
        &self,
        method: Method,
        uri: &str,
        key: Option<&str>,
        body: Option<Value>,
    ) -> Response {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(key) = key {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", key));
        }
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        self.router().oneshot(request).await.unwrap()
    }

    /// Status and JSON body; non-JSON bodies come back as `Value::Null`.
    pub async fn send(
        &self,
        method: Method,
        uri: &str,
        key: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let response = self.raw(method, uri, key, body).await;
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    /// Create a project as `key` and return its slug.
    pub async fn create_project(&self, key: &str, name: &str) -> String {
        let (status, body) = self
            .send(
                Method::POST,
                "/api/projects",
                Some(key),
                Some(serde_json::json!({ "name": name })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "{}", body);
        body["data"]["slug"].as_str().unwrap().to_string()
    }
}
