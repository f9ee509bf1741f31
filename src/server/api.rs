use std::str::FromStr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{
        FromRequest, FromRequestParts, Path, Query, Request, State,
        rejection::{JsonRejection, PathRejection, QueryRejection},
    },
    http::{HeaderValue, StatusCode, header, request::Parts},
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use serde::{Deserialize, Serialize};

use super::auth::{self, CurrentUser, require_admin};
use super::ratelimit::RateLimits;
use crate::approval::{
    self, DependencyApprovalRequest, MAX_CHOICE_LEN, MAX_NOTES_LEN, StackApprovalRequest, presets,
};
use crate::errors::{ApprovalError, OrchestratorError};
use crate::orchestrator::Orchestrator;
use crate::phase::{ApprovalKind, Phase};
use crate::store::{ArtifactFiles, DbHandle, Project, Role, Selection, User};

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub db: DbHandle,
    pub files: ArtifactFiles,
    pub orchestrator: Orchestrator,
    pub auth_secret: String,
    pub limits: RateLimits,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateProjectRequest {
    pub name: Option<String>,
    pub description: Option<String>,
}

#[derive(Deserialize)]
pub struct UpdateProjectRequest {
    pub name: Option<String>,
    pub description: Option<String>,
}

#[derive(Deserialize)]
pub struct ArtifactListQuery {
    pub phase: Option<String>,
}

#[derive(Deserialize)]
pub struct ArtifactVersionQuery {
    pub version: Option<i64>,
}

#[derive(Deserialize)]
pub struct CreateUserRequest {
    pub email: Option<String>,
    pub name: Option<String>,
    pub role: Option<String>,
}

#[derive(Deserialize)]
pub struct UpdateRoleRequest {
    pub role: Option<String>,
}

#[derive(Deserialize)]
pub struct SetSettingRequest {
    pub value: Option<String>,
}

#[derive(Serialize)]
pub struct CreatedUser {
    pub user: User,
    /// Shown once; only its hash is stored.
    pub api_key: String,
}

#[derive(Serialize)]
pub struct Selections {
    pub stack: Option<Selection>,
    pub dependencies: Option<Selection>,
}

// ── Envelope ──────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct Envelope<T> {
    pub success: bool,
    pub data: T,
}

pub fn ok<T: Serialize>(data: T) -> Json<Envelope<T>> {
    Json(Envelope {
        success: true,
        data,
    })
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized(String),
    Forbidden(String),
    NotFound(String),
    Conflict(String),
    RateLimited { retry_after_secs: u64, limit: u32 },
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg.clone()),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg.clone()),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            ApiError::RateLimited { .. } => (
                StatusCode::TOO_MANY_REQUESTS,
                "Too many requests".to_string(),
            ),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
        };

        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), error = %message, "Request failed");
        } else {
            tracing::warn!(status = status.as_u16(), error = %message, "Request rejected");
        }

        match self {
            ApiError::RateLimited {
                retry_after_secs,
                limit,
            } => {
                let body = serde_json::json!({
                    "success": false,
                    "error": message,
                    "retry_after_secs": retry_after_secs,
                });
                let mut response = (status, Json(body)).into_response();
                let headers = response.headers_mut();
                headers.insert(header::RETRY_AFTER, HeaderValue::from(retry_after_secs));
                headers.insert("x-ratelimit-limit", HeaderValue::from(limit));
                headers.insert("x-ratelimit-remaining", HeaderValue::from(0u32));
                response
            }
            ApiError::Internal(_) => (
                status,
                Json(serde_json::json!({"success": false, "error": "Internal server error"})),
            )
                .into_response(),
            _ => (
                status,
                Json(serde_json::json!({"success": false, "error": message})),
            )
                .into_response(),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        ApiError::Internal(format!("{:#}", e))
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(e: OrchestratorError) -> Self {
        match e {
            OrchestratorError::UnknownPhase(_)
            | OrchestratorError::NotCurrentPhase { .. }
            | OrchestratorError::NoExecutors(_)
            | OrchestratorError::Terminal(_)
            | OrchestratorError::AdvanceBlocked { .. } => ApiError::BadRequest(e.to_string()),
            OrchestratorError::AlreadyRunning { .. } => ApiError::Conflict(e.to_string()),
            OrchestratorError::InvalidArtifact { .. } | OrchestratorError::Executor(_) => {
                ApiError::Internal(e.to_string())
            }
            OrchestratorError::Storage(inner) => ApiError::from(inner),
        }
    }
}

impl From<ApprovalError> for ApiError {
    fn from(e: ApprovalError) -> Self {
        match e {
            ApprovalError::Invalid(_) | ApprovalError::PhaseNotReached { .. } => {
                ApiError::BadRequest(e.to_string())
            }
            ApprovalError::Storage(inner) => ApiError::from(inner),
        }
    }
}

/// `Json` that reports malformed bodies through the envelope as 400.
pub struct ApiJson<T>(pub T);

impl<T, S> FromRequest<S> for ApiJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(ApiJson(value)),
            Err(rejection) => Err(ApiError::BadRequest(rejection.body_text())),
        }
    }
}

/// `Path` with enveloped 400s for segments that fail to parse.
pub struct ApiPath<T>(pub T);

impl<T, S> FromRequestParts<S> for ApiPath<T>
where
    Path<T>: FromRequestParts<S, Rejection = PathRejection>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        match Path::<T>::from_request_parts(parts, state).await {
            Ok(Path(value)) => Ok(ApiPath(value)),
            Err(rejection) => Err(ApiError::BadRequest(rejection.body_text())),
        }
    }
}

/// `Query` with enveloped 400s.
pub struct ApiQuery<T>(pub T);

impl<T, S> FromRequestParts<S> for ApiQuery<T>
where
    Query<T>: FromRequestParts<S, Rejection = QueryRejection>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        match Query::<T>::from_request_parts(parts, state).await {
            Ok(Query(value)) => Ok(ApiQuery(value)),
            Err(rejection) => Err(ApiError::BadRequest(rejection.body_text())),
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

/// All `/api` routes. Rate limiting, tracing and CORS are layered on in
/// `app::build_router`.
pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/projects", get(list_projects).post(create_project))
        .route(
            "/api/projects/{slug}",
            get(get_project).put(update_project).delete(delete_project),
        )
        .route("/api/projects/{slug}/status", get(project_status))
        .route(
            "/api/projects/{slug}/phases/{phase}/execute",
            post(execute_phase),
        )
        .route("/api/projects/{slug}/advance", post(advance_project))
        .route("/api/projects/{slug}/approve-stack", post(approve_stack))
        .route(
            "/api/projects/{slug}/approve-dependencies",
            post(approve_dependencies),
        )
        .route("/api/projects/{slug}/selections", get(get_selections))
        .route("/api/projects/{slug}/artifacts", get(list_artifacts))
        .route(
            "/api/projects/{slug}/artifacts/{phase}/{name}",
            get(get_artifact),
        )
        .route(
            "/api/projects/{slug}/artifacts/{phase}/{name}/versions",
            get(artifact_versions),
        )
        .route("/api/phases", get(list_phases))
        .route("/api/presets/stack", get(stack_presets))
        .route("/api/presets/dependencies", get(dependency_presets))
        .route("/api/me", get(me))
        .route("/api/admin/users", get(list_users).post(create_user))
        .route("/api/admin/users/{id}/role", put(update_user_role))
        .route("/api/settings", get(list_settings))
        .route(
            "/api/settings/{key}",
            get(get_setting).put(set_setting).delete(delete_setting),
        )
}

// ── Helpers ───────────────────────────────────────────────────────────

fn visible(user: &User, project: &Project) -> bool {
    user.is_admin() || project.owner_id == Some(user.id)
}

/// Load a project the caller may see. Projects owned by someone else are
/// reported as missing.
async fn load_project(state: &SharedState, user: &User, slug: &str) -> Result<Project, ApiError> {
    let lookup = slug.to_string();
    let project = state
        .db
        .call(move |db| db.get_project(&lookup))
        .await?
        .filter(|p| visible(user, p))
        .ok_or_else(|| ApiError::NotFound(format!("Project '{}' not found", slug)))?;
    Ok(project)
}

fn parse_phase(raw: &str) -> Result<Phase, ApiError> {
    Phase::from_str(raw).map_err(ApiError::BadRequest)
}

fn bounded_text(field: &str, value: &str, max: usize) -> Result<String, ApiError> {
    let value = value.trim();
    if value.chars().count() > max {
        return Err(ApiError::BadRequest(format!(
            "{} must be at most {} characters",
            field, max
        )));
    }
    Ok(value.to_string())
}

fn content_type_for(name: &str) -> &'static str {
    match name.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase()) {
        Some(ext) if ext == "json" => "application/json",
        Some(ext) if ext == "md" => "text/markdown; charset=utf-8",
        _ => "text/plain; charset=utf-8",
    }
}

fn validate_setting_key(key: &str) -> Result<(), ApiError> {
    let valid = !key.is_empty()
        && key.len() <= MAX_CHOICE_LEN
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'));
    if valid {
        Ok(())
    } else {
        Err(ApiError::BadRequest(format!("Invalid setting key '{}'", key)))
    }
}

// ── Handlers: projects ────────────────────────────────────────────────

pub async fn health_check() -> &'static str {
    "ok"
}

async fn list_projects(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
) -> Result<impl IntoResponse, ApiError> {
    let owner = (!user.is_admin()).then_some(user.id);
    let projects = state.db.call(move |db| db.list_projects(owner)).await?;
    Ok(ok(projects))
}

async fn create_project(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    ApiJson(req): ApiJson<CreateProjectRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let name = req.name.as_deref().map(str::trim).unwrap_or_default();
    if name.is_empty() {
        return Err(ApiError::BadRequest("Project name is required".into()));
    }
    let name = bounded_text("name", name, MAX_CHOICE_LEN)?;
    let description = bounded_text(
        "description",
        req.description.as_deref().unwrap_or_default(),
        MAX_NOTES_LEN,
    )?;

    let owner = user.id;
    let project = state
        .db
        .call(move |db| db.create_project(&name, &description, Some(owner)))
        .await?;
    tracing::info!(project = %project.slug, owner = user.id, "Project created");
    Ok((StatusCode::CREATED, ok(project)))
}

async fn get_project(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    ApiPath(slug): ApiPath<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(ok(load_project(&state, &user, &slug).await?))
}

async fn update_project(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    ApiPath(slug): ApiPath<String>,
    ApiJson(req): ApiJson<UpdateProjectRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let project = load_project(&state, &user, &slug).await?;

    let name = match req.name.as_deref().map(str::trim) {
        Some("") => return Err(ApiError::BadRequest("Project name is required".into())),
        Some(name) => Some(bounded_text("name", name, MAX_CHOICE_LEN)?),
        None => None,
    };
    let description = req
        .description
        .as_deref()
        .map(|d| bounded_text("description", d, MAX_NOTES_LEN))
        .transpose()?;

    let slug = project.slug;
    let updated = state
        .db
        .call(move |db| db.update_project(&slug, name.as_deref(), description.as_deref()))
        .await?
        .ok_or_else(|| ApiError::NotFound("Project not found".into()))?;
    Ok(ok(updated))
}

async fn delete_project(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    ApiPath(slug): ApiPath<String>,
) -> Result<impl IntoResponse, ApiError> {
    let project = load_project(&state, &user, &slug).await?;
    let _permit = state.orchestrator.claim(&project)?;
    let target = project.slug.clone();
    let deleted = state.db.call(move |db| db.delete_project(&target)).await?;
    if !deleted {
        return Err(ApiError::NotFound(format!("Project '{}' not found", slug)));
    }
    state.files.remove_project(&project.slug).await?;
    tracing::info!(project = %project.slug, "Project deleted");
    Ok(ok(serde_json::json!({ "slug": project.slug, "deleted": true })))
}

// ── Handlers: phases ──────────────────────────────────────────────────

async fn project_status(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    ApiPath(slug): ApiPath<String>,
) -> Result<impl IntoResponse, ApiError> {
    let project = load_project(&state, &user, &slug).await?;
    Ok(ok(state.orchestrator.status(&project).await?))
}

async fn execute_phase(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    ApiPath((slug, phase)): ApiPath<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let project = load_project(&state, &user, &slug).await?;
    let run = state.orchestrator.execute_phase(&project, &phase).await?;
    Ok(ok(run))
}

async fn advance_project(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    ApiPath(slug): ApiPath<String>,
) -> Result<impl IntoResponse, ApiError> {
    let project = load_project(&state, &user, &slug).await?;
    Ok(ok(state.orchestrator.advance(&project).await?))
}

async fn list_phases(
    State(state): State<SharedState>,
    CurrentUser(_user): CurrentUser,
) -> Result<impl IntoResponse, ApiError> {
    Ok(ok(state.orchestrator.spec().clone()))
}

// ── Handlers: approvals ───────────────────────────────────────────────

async fn approve_stack(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    ApiPath(slug): ApiPath<String>,
    ApiJson(req): ApiJson<StackApprovalRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let project = load_project(&state, &user, &slug).await?;
    let outcome = approval::approve_stack(&state.db, &state.files, &project, &req).await?;
    Ok(ok(outcome))
}

async fn approve_dependencies(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    ApiPath(slug): ApiPath<String>,
    ApiJson(req): ApiJson<DependencyApprovalRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let project = load_project(&state, &user, &slug).await?;
    let outcome = approval::approve_dependencies(&state.db, &state.files, &project, &req).await?;
    Ok(ok(outcome))
}

async fn get_selections(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    ApiPath(slug): ApiPath<String>,
) -> Result<impl IntoResponse, ApiError> {
    let project = load_project(&state, &user, &slug).await?;
    let project_id = project.id;
    let selections = state
        .db
        .call(move |db| {
            Ok(Selections {
                stack: db.latest_selection(project_id, ApprovalKind::Stack)?,
                dependencies: db.latest_selection(project_id, ApprovalKind::Dependencies)?,
            })
        })
        .await?;
    Ok(ok(selections))
}

async fn stack_presets(CurrentUser(_user): CurrentUser) -> impl IntoResponse {
    ok(presets::STACK_PRESETS)
}

async fn dependency_presets(CurrentUser(_user): CurrentUser) -> impl IntoResponse {
    ok(presets::DEPENDENCY_PRESETS)
}

// ── Handlers: artifacts ───────────────────────────────────────────────

async fn list_artifacts(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    ApiPath(slug): ApiPath<String>,
    ApiQuery(query): ApiQuery<ArtifactListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let phase = query.phase.as_deref().map(parse_phase).transpose()?;
    let project = load_project(&state, &user, &slug).await?;
    let project_id = project.id;
    let artifacts = state
        .db
        .call(move |db| db.latest_artifacts(project_id, phase))
        .await?;
    let summaries: Vec<_> = artifacts.iter().map(|a| a.summary()).collect();
    Ok(ok(summaries))
}

/// Raw artifact content; the content type follows the file extension.
async fn get_artifact(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    ApiPath((slug, phase, name)): ApiPath<(String, String, String)>,
    ApiQuery(query): ApiQuery<ArtifactVersionQuery>,
) -> Result<Response, ApiError> {
    let phase = parse_phase(&phase)?;
    let project = load_project(&state, &user, &slug).await?;
    let project_id = project.id;
    let lookup = name.clone();
    let artifact = state
        .db
        .call(move |db| db.get_artifact(project_id, phase, &lookup, query.version))
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Artifact {}/{} not found", phase, name)))?;

    let mut response = (
        [(header::CONTENT_TYPE, content_type_for(&artifact.name))],
        artifact.content,
    )
        .into_response();
    response
        .headers_mut()
        .insert("x-artifact-version", HeaderValue::from(artifact.version));
    Ok(response)
}

async fn artifact_versions(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    ApiPath((slug, phase, name)): ApiPath<(String, String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let phase = parse_phase(&phase)?;
    let project = load_project(&state, &user, &slug).await?;
    let project_id = project.id;
    let lookup = name.clone();
    let versions = state
        .db
        .call(move |db| db.artifact_versions(project_id, phase, &lookup))
        .await?;
    if versions.is_empty() {
        return Err(ApiError::NotFound(format!(
            "Artifact {}/{} not found",
            phase, name
        )));
    }
    Ok(ok(versions))
}

// ── Handlers: users ───────────────────────────────────────────────────

async fn me(CurrentUser(user): CurrentUser) -> impl IntoResponse {
    ok(user)
}

async fn list_users(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&user)?;
    Ok(ok(state.db.call(|db| db.list_users()).await?))
}

async fn create_user(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    ApiJson(req): ApiJson<CreateUserRequest>,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&user)?;
    let email = req.email.as_deref().map(str::trim).unwrap_or_default();
    if email.is_empty() {
        return Err(ApiError::BadRequest("email is required".into()));
    }
    if !email.contains('@') {
        return Err(ApiError::BadRequest(format!("Invalid email '{}'", email)));
    }
    let email = bounded_text("email", email, MAX_CHOICE_LEN)?.to_lowercase();
    let name = bounded_text("name", req.name.as_deref().unwrap_or_default(), MAX_CHOICE_LEN)?;
    let role = match req.role.as_deref() {
        Some(role) => Role::from_str(role).map_err(ApiError::BadRequest)?,
        None => Role::User,
    };

    let api_key = auth::generate_api_key();
    let key_hash = auth::hash_api_key(&state.auth_secret, &api_key);
    let lookup = email.clone();
    let created = state
        .db
        .call(move |db| db.create_user(&lookup, &name, role, &key_hash))
        .await?
        .ok_or_else(|| ApiError::Conflict(format!("A user with email {} already exists", email)))?;

    tracing::info!(user_id = created.id, role = created.role.as_str(), "User created");
    Ok((
        StatusCode::CREATED,
        ok(CreatedUser {
            user: created,
            api_key,
        }),
    ))
}

enum RoleChange {
    Updated(User),
    NotFound,
    LastAdmin,
}

async fn update_user_role(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    ApiPath(id): ApiPath<i64>,
    ApiJson(req): ApiJson<UpdateRoleRequest>,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&user)?;
    let role = req
        .role
        .as_deref()
        .ok_or_else(|| ApiError::BadRequest("role is required".into()))
        .and_then(|r| Role::from_str(r).map_err(ApiError::BadRequest))?;

    let change = state
        .db
        .call(move |db| {
            let Some(target) = db.get_user(id)? else {
                return Ok(RoleChange::NotFound);
            };
            if target.is_admin() && role == Role::User && db.count_admins()? <= 1 {
                return Ok(RoleChange::LastAdmin);
            }
            match db.update_user_role(id, role)? {
                Some(updated) => Ok(RoleChange::Updated(updated)),
                None => Ok(RoleChange::NotFound),
            }
        })
        .await?;

    match change {
        RoleChange::Updated(updated) => {
            tracing::info!(user_id = updated.id, role = updated.role.as_str(), "Role changed");
            Ok(ok(updated))
        }
        RoleChange::NotFound => Err(ApiError::NotFound(format!("User {} not found", id))),
        RoleChange::LastAdmin => Err(ApiError::BadRequest(
            "Cannot demote the last remaining admin".into(),
        )),
    }
}

// ── Handlers: settings ────────────────────────────────────────────────

async fn list_settings(
    State(state): State<SharedState>,
    CurrentUser(_user): CurrentUser,
) -> Result<impl IntoResponse, ApiError> {
    Ok(ok(state.db.call(|db| db.list_settings()).await?))
}

async fn get_setting(
    State(state): State<SharedState>,
    CurrentUser(_user): CurrentUser,
    ApiPath(key): ApiPath<String>,
) -> Result<impl IntoResponse, ApiError> {
    validate_setting_key(&key)?;
    let lookup = key.clone();
    let setting = state
        .db
        .call(move |db| db.get_setting(&lookup))
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Setting '{}' not found", key)))?;
    Ok(ok(setting))
}

async fn set_setting(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    ApiPath(key): ApiPath<String>,
    ApiJson(req): ApiJson<SetSettingRequest>,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&user)?;
    validate_setting_key(&key)?;
    let value = req
        .value
        .ok_or_else(|| ApiError::BadRequest("value is required".into()))?;
    let value = bounded_text("value", &value, MAX_NOTES_LEN)?;
    let setting = state
        .db
        .call(move |db| db.set_setting(&key, &value))
        .await?;
    Ok(ok(setting))
}

async fn delete_setting(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    ApiPath(key): ApiPath<String>,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&user)?;
    validate_setting_key(&key)?;
    let lookup = key.clone();
    let deleted = state.db.call(move |db| db.delete_setting(&lookup)).await?;
    if !deleted {
        return Err(ApiError::NotFound(format!("Setting '{}' not found", key)));
    }
    Ok(ok(serde_json::json!({ "key": key, "deleted": true })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{TestApp, TestAppOptions};
    use axum::http::Method;
    use http_body_util::BodyExt;
    use serde_json::json;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_create_project_requires_name() {
        let app = TestApp::new().await;
        let key = app.user_key.clone();
        for body in [json!({}), json!({"name": null}), json!({"name": "   "})] {
            let (status, body) = app
                .send(Method::POST, "/api/projects", Some(&key), Some(body))
                .await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert_eq!(body["success"], false);
            assert!(body["error"].as_str().unwrap().contains("required"));
        }
    }

    #[tokio::test]
    async fn test_create_project_returns_slug_and_analysis() {
        let app = TestApp::new().await;
        let key = app.user_key.clone();
        let (status, body) = app
            .send(
                Method::POST,
                "/api/projects",
                Some(&key),
                Some(json!({"name": "Test Project", "description": "A shop"})),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["success"], true);
        let slug = body["data"]["slug"].as_str().unwrap();
        assert_eq!(slug, "test-project");
        assert!(
            slug.chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        );
        assert_eq!(body["data"]["current_phase"], "ANALYSIS");

        let second = app.create_project(&key, "Test Project").await;
        assert_eq!(second, "test-project-2");
    }

    #[tokio::test]
    async fn test_malformed_body_is_bad_request() {
        let app = TestApp::new().await;
        let response = app
            .router()
            .oneshot(
                axum::http::Request::post("/api/projects")
                    .header(header::AUTHORIZATION, format!("Bearer {}", app.user_key))
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(axum::body::Body::from("{not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_missing_project_is_not_found() {
        let app = TestApp::new().await;
        let key = app.user_key.clone();
        let uri = "/api/projects/does-not-exist";
        let (status, _) = app.send(Method::GET, uri, Some(&key), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = app
            .send(Method::PUT, uri, Some(&key), Some(json!({"name": "x"})))
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = app.send(Method::DELETE, uri, Some(&key), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_unparseable_path_and_query_use_envelope() {
        let app = TestApp::new().await;
        let (user, admin) = (app.user_key.clone(), app.admin_key.clone());
        let slug = app.create_project(&user, "Shop").await;

        let (status, body) = app
            .send(
                Method::GET,
                &format!("/api/projects/{}/artifacts/ANALYSIS/x.md?version=abc", slug),
                Some(&user),
                None,
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        assert!(body["error"].is_string());

        let (status, body) = app
            .send(
                Method::PUT,
                "/api/admin/users/abc/role",
                Some(&admin),
                Some(json!({"role": "user"})),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn test_auth_required_and_validated() {
        let app = TestApp::new().await;
        let (status, body) = app.send(Method::GET, "/api/projects", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["success"], false);
        let (status, _) = app
            .send(Method::GET, "/api/projects", Some("sf_wrong"), None)
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_projects_are_private_to_owner() {
        let app = TestApp::new().await;
        let (user, admin) = (app.user_key.clone(), app.admin_key.clone());
        let slug = app.create_project(&admin, "Admin Only").await;

        let (status, _) = app
            .send(Method::GET, &format!("/api/projects/{}", slug), Some(&user), None)
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (_, body) = app.send(Method::GET, "/api/projects", Some(&user), None).await;
        assert_eq!(body["data"].as_array().unwrap().len(), 0);
        let (_, body) = app.send(Method::GET, "/api/projects", Some(&admin), None).await;
        assert_eq!(body["data"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_update_keeps_slug() {
        let app = TestApp::new().await;
        let key = app.user_key.clone();
        let slug = app.create_project(&key, "Old Name").await;
        let (status, body) = app
            .send(
                Method::PUT,
                &format!("/api/projects/{}", slug),
                Some(&key),
                Some(json!({"name": "New Name"})),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["name"], "New Name");
        assert_eq!(body["data"]["slug"], "old-name");
    }

    #[tokio::test]
    async fn test_execute_analysis_then_list_artifacts() {
        let app = TestApp::new().await;
        let key = app.user_key.clone();
        let slug = app.create_project(&key, "Shop").await;

        let (status, body) = app
            .send(
                Method::POST,
                &format!("/api/projects/{}/phases/ANALYSIS/execute", slug),
                Some(&key),
                None,
            )
            .await;
        assert_eq!(status, StatusCode::OK, "{}", body);

        let (status, body) = app
            .send(
                Method::GET,
                &format!("/api/projects/{}/artifacts?phase=ANALYSIS", slug),
                Some(&key),
                None,
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        let names: Vec<&str> = body["data"]
            .as_array()
            .unwrap()
            .iter()
            .map(|a| a["name"].as_str().unwrap())
            .collect();
        assert!(names.contains(&"project-brief.md"));
        assert!(names.contains(&"constitution.md"));
        assert!(
            app.artifacts_root()
                .join(&slug)
                .join("ANALYSIS")
                .join("project-brief.md")
                .exists()
        );
    }

    #[tokio::test]
    async fn test_unknown_phase_rejected_before_executors() {
        let app = TestApp::new().await;
        let key = app.user_key.clone();
        let slug = app.create_project(&key, "Shop").await;

        let (status, body) = app
            .send(
                Method::POST,
                &format!("/api/projects/{}/phases/BOGUS/execute", slug),
                Some(&key),
                None,
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        assert!(app.llm.calls().is_empty());

        let (status, _) = app
            .send(
                Method::GET,
                &format!("/api/projects/{}/artifacts?phase=BOGUS", slug),
                Some(&key),
                None,
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_failed_executor_is_server_error_and_persists_nothing() {
        let app = TestApp::with_options(TestAppOptions {
            replies: vec![Err(crate::errors::LlmError::Transport("boom".into()))],
            ..Default::default()
        })
        .await;
        let key = app.user_key.clone();
        let slug = app.create_project(&key, "Shop").await;

        let (status, body) = app
            .send(
                Method::POST,
                &format!("/api/projects/{}/phases/ANALYSIS/execute", slug),
                Some(&key),
                None,
            )
            .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "Internal server error");

        let (_, body) = app
            .send(
                Method::GET,
                &format!("/api/projects/{}/artifacts", slug),
                Some(&key),
                None,
            )
            .await;
        assert!(body["data"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_executing_non_current_phase_is_bad_request() {
        let app = TestApp::new().await;
        let key = app.user_key.clone();
        let slug = app.create_project(&key, "Shop").await;
        let (status, _) = app
            .send(
                Method::POST,
                &format!("/api/projects/{}/phases/SPEC/execute", slug),
                Some(&key),
                None,
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_advance_blocked_until_artifacts_exist() {
        let app = TestApp::new().await;
        let key = app.user_key.clone();
        let slug = app.create_project(&key, "Shop").await;
        let advance = format!("/api/projects/{}/advance", slug);

        let (status, _) = app.send(Method::POST, &advance, Some(&key), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        app.send(
            Method::POST,
            &format!("/api/projects/{}/phases/ANALYSIS/execute", slug),
            Some(&key),
            None,
        )
        .await;
        let (status, body) = app.send(Method::POST, &advance, Some(&key), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["current_phase"], "STACK_SELECTION");
        assert_eq!(body["data"]["completed_phases"], json!(["ANALYSIS"]));

        let (_, body) = app
            .send(
                Method::GET,
                &format!("/api/projects/{}/status", slug),
                Some(&key),
                None,
            )
            .await;
        assert_eq!(body["data"]["can_advance"], false);
    }

    async fn reach_stack_selection(app: &TestApp, key: &str) -> String {
        let slug = app.create_project(key, "Shop").await;
        app.send(
            Method::POST,
            &format!("/api/projects/{}/phases/ANALYSIS/execute", slug),
            Some(key),
            None,
        )
        .await;
        let (status, _) = app
            .send(
                Method::POST,
                &format!("/api/projects/{}/advance", slug),
                Some(key),
                None,
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        slug
    }

    #[tokio::test]
    async fn test_approve_stack_before_phase_is_rejected() {
        let app = TestApp::new().await;
        let key = app.user_key.clone();
        let slug = app.create_project(&key, "Shop").await;
        let (status, _) = app
            .send(
                Method::POST,
                &format!("/api/projects/{}/approve-stack", slug),
                Some(&key),
                Some(json!({"preset_id": "nextjs-fullstack"})),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_reapproval_adds_versions_without_deleting() {
        let app = TestApp::new().await;
        let key = app.user_key.clone();
        let slug = reach_stack_selection(&app, &key).await;
        let approve = format!("/api/projects/{}/approve-stack", slug);

        let (status, body) = app
            .send(
                Method::POST,
                &approve,
                Some(&key),
                Some(json!({"preset_id": "nextjs-fullstack"})),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "{}", body);
        assert_eq!(body["data"]["project"]["stack_approved"], true);

        let (status, _) = app
            .send(
                Method::POST,
                &approve,
                Some(&key),
                Some(json!({
                    "source": "custom",
                    "frontend": "Svelte",
                    "backend": "Go",
                    "database": "Postgres",
                    "deployment": "Fly.io",
                })),
            )
            .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = app
            .send(
                Method::GET,
                &format!(
                    "/api/projects/{}/artifacts/STACK_SELECTION/stack-decision.md/versions",
                    slug
                ),
                Some(&key),
                None,
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        let versions: Vec<i64> = body["data"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v["version"].as_i64().unwrap())
            .collect();
        assert_eq!(versions, vec![1, 2]);

        let (_, body) = app
            .send(
                Method::GET,
                &format!("/api/projects/{}/selections", slug),
                Some(&key),
                None,
            )
            .await;
        assert_eq!(body["data"]["stack"]["payload"]["backend"], "Go");
    }

    #[tokio::test]
    async fn test_artifact_content_type_follows_extension() {
        let app = TestApp::new().await;
        let key = app.user_key.clone();
        let slug = app.create_project(&key, "Shop").await;
        app.send(
            Method::POST,
            &format!("/api/projects/{}/phases/ANALYSIS/execute", slug),
            Some(&key),
            None,
        )
        .await;

        let response = app
            .raw(
                Method::GET,
                &format!("/api/projects/{}/artifacts/ANALYSIS/project-brief.md", slug),
                Some(&key),
                None,
            )
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/markdown; charset=utf-8"
        );
        assert_eq!(response.headers()["x-artifact-version"], "1");
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert!(String::from_utf8_lossy(&bytes).starts_with('#'));

        let (status, _) = app
            .send(
                Method::GET,
                &format!("/api/projects/{}/artifacts/ANALYSIS/missing.md", slug),
                Some(&key),
                None,
            )
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_delete_project_removes_files() {
        let app = TestApp::new().await;
        let key = app.user_key.clone();
        let slug = app.create_project(&key, "Shop").await;
        app.send(
            Method::POST,
            &format!("/api/projects/{}/phases/ANALYSIS/execute", slug),
            Some(&key),
            None,
        )
        .await;
        assert!(app.artifacts_root().join(&slug).exists());

        let (status, _) = app
            .send(Method::DELETE, &format!("/api/projects/{}", slug), Some(&key), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert!(!app.artifacts_root().join(&slug).exists());
        let (status, _) = app
            .send(Method::GET, &format!("/api/projects/{}", slug), Some(&key), None)
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_delete_while_running_is_conflict() {
        let app = TestApp::new().await;
        let key = app.user_key.clone();
        let slug = app.create_project(&key, "Shop").await;
        let lookup = slug.clone();
        let project = app
            .state
            .db
            .call(move |db| db.get_project(&lookup))
            .await
            .unwrap()
            .unwrap();

        let permit = app.state.orchestrator.claim(&project).unwrap();
        let (status, body) = app
            .send(Method::DELETE, &format!("/api/projects/{}", slug), Some(&key), None)
            .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["success"], false);
        let (status, _) = app
            .send(Method::GET, &format!("/api/projects/{}", slug), Some(&key), None)
            .await;
        assert_eq!(status, StatusCode::OK);

        drop(permit);
        let (status, _) = app
            .send(Method::DELETE, &format!("/api/projects/{}", slug), Some(&key), None)
            .await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_admin_user_management() {
        let app = TestApp::new().await;
        let (user, admin) = (app.user_key.clone(), app.admin_key.clone());

        let (status, _) = app.send(Method::GET, "/api/admin/users", Some(&user), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, body) = app
            .send(
                Method::POST,
                "/api/admin/users",
                Some(&admin),
                Some(json!({"email": "New@Example.com", "name": "New"})),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["data"]["user"]["email"], "new@example.com");
        let new_key = body["data"]["api_key"].as_str().unwrap().to_string();

        let (status, body) = app.send(Method::GET, "/api/me", Some(&new_key), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["role"], "user");

        let (status, _) = app
            .send(
                Method::POST,
                "/api/admin/users",
                Some(&admin),
                Some(json!({"email": "new@example.com"})),
            )
            .await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_last_admin_cannot_be_demoted() {
        let app = TestApp::new().await;
        let admin = app.admin_key.clone();
        let (_, me) = app.send(Method::GET, "/api/me", Some(&admin), None).await;
        let id = me["data"]["id"].as_i64().unwrap();

        let (status, _) = app
            .send(
                Method::PUT,
                &format!("/api/admin/users/{}/role", id),
                Some(&admin),
                Some(json!({"role": "user"})),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = app
            .send(
                Method::PUT,
                "/api/admin/users/9999/role",
                Some(&admin),
                Some(json!({"role": "admin"})),
            )
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_settings_read_by_users_written_by_admins() {
        let app = TestApp::new().await;
        let (user, admin) = (app.user_key.clone(), app.admin_key.clone());

        let (status, _) = app
            .send(
                Method::PUT,
                "/api/settings/theme",
                Some(&user),
                Some(json!({"value": "dark"})),
            )
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = app
            .send(Method::PUT, "/api/settings/theme", Some(&admin), Some(json!({})))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = app
            .send(
                Method::PUT,
                "/api/settings/theme",
                Some(&admin),
                Some(json!({"value": "dark"})),
            )
            .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = app
            .send(Method::GET, "/api/settings/theme", Some(&user), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["value"], "dark");

        let (status, _) = app
            .send(Method::DELETE, "/api/settings/theme", Some(&admin), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = app
            .send(Method::GET, "/api/settings/theme", Some(&user), None)
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_presets_and_phases_listed() {
        let app = TestApp::new().await;
        let key = app.user_key.clone();
        let (_, body) = app
            .send(Method::GET, "/api/presets/stack", Some(&key), None)
            .await;
        assert!(
            body["data"]
                .as_array()
                .unwrap()
                .iter()
                .any(|p| p["id"] == "nextjs-fullstack")
        );
        let (status, _) = app.send(Method::GET, "/api/phases", Some(&key), None).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[test]
    fn test_content_type_for() {
        assert_eq!(content_type_for("api-spec.json"), "application/json");
        assert_eq!(content_type_for("prd.MD"), "text/markdown; charset=utf-8");
        assert_eq!(content_type_for("notes"), "text/plain; charset=utf-8");
    }
}
