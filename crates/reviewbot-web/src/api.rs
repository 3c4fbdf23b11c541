//! Admin surface and health endpoint: standard REST/axum routes over
//! the repository registry and agent executions. Optional bearer-style API key.

use axum::{
    body::Body,
    extract::{Path, State},
    http::{Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use reviewbot_core::{AgentRecord, Database, Error, Repository};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::metrics::MetricsCollector;
use crate::webhook::{pr_webhook_handler, WebhookConfig, WebhookState};

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    pub code: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.code.as_str() {
            "unauthorized" => StatusCode::UNAUTHORIZED,
            "not_found" => StatusCode::NOT_FOUND,
            "bad_request" => StatusCode::BAD_REQUEST,
            "conflict" => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(self)).into_response()
    }
}

impl ApiError {
    fn unauthorized() -> Self {
        Self { error: "invalid or missing API key".into(), code: "unauthorized".into() }
    }

    fn bad_request(msg: impl Into<String>) -> Self {
        Self { error: msg.into(), code: "bad_request".into() }
    }
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        match e {
            Error::RepositoryNotFound(ref id) => {
                Self { error: format!("repository {id} not found"), code: "not_found".into() }
            }
            Error::AgentNotFound(ref id) => {
                Self { error: format!("agent {id} not found"), code: "not_found".into() }
            }
            Error::RepositoryAlreadyRegistered(ref name) => {
                Self { error: format!("repository {name} already registered"), code: "conflict".into() }
            }
            other => Self { error: other.to_string(), code: "internal_error".into() },
        }
    }
}

pub struct AppState {
    pub db: Arc<Database>,
    pub metrics: MetricsCollector,
    pub admin_api_key: Option<SecretString>,
    pub webhook: Arc<WebhookState>,
}

impl AppState {
    pub fn new(db: Arc<Database>, webhook_secret: Option<SecretString>, admin_api_key: Option<SecretString>) -> Self {
        let webhook = Arc::new(WebhookState { config: WebhookConfig::new(webhook_secret), database: db.clone() });
        Self {
            db,
            metrics: MetricsCollector::default(),
            admin_api_key,
            webhook,
        }
    }
}

async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(expected) = &state.admin_api_key else {
        return Ok(next.run(request).await);
    };
    let provided = request
        .headers()
        .get("x-api-key")
        .or_else(|| request.headers().get("authorization"))
        .and_then(|v| v.to_str().ok())
        .map(|s| s.strip_prefix("Bearer ").unwrap_or(s));
    match provided {
        Some(key) if key == expected.expose_secret() => Ok(next.run(request).await),
        _ => Err(ApiError::unauthorized()),
    }
}

pub fn create_router(state: Arc<AppState>) -> Router {
    let admin_routes = Router::new()
        .route("/repositories", get(list_repositories).post(create_repository))
        .route("/repositories/:id", delete(delete_repository))
        .route("/agents", get(list_agents))
        .route("/agents/:id", get(get_agent))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    let public_routes = Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        .route("/webhooks/azuredevops/pr", post(webhook_handler));

    Router::new()
        .merge(admin_routes)
        .merge(public_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok", version: env!("CARGO_PKG_VERSION") })
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.metrics.gather(&state.db).await {
        Ok(body) => (StatusCode::OK, body),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn webhook_handler(
    State(state): State<Arc<AppState>>,
    headers: axum::http::HeaderMap,
    body: axum::body::Bytes,
) -> impl IntoResponse {
    pr_webhook_handler(State(state.webhook.clone()), headers, body).await
}

#[derive(Debug, Deserialize)]
struct CreateRepositoryRequest {
    organization: String,
    project: String,
    name: String,
    url: String,
}

#[derive(Debug, Serialize)]
struct RepositoryResponse {
    id: i64,
    organization: String,
    project: String,
    name: String,
    url: String,
    hook_id: Option<String>,
}

impl From<Repository> for RepositoryResponse {
    fn from(r: Repository) -> Self {
        Self { id: r.id, organization: r.organization, project: r.project, name: r.name, url: r.url, hook_id: r.hook_id }
    }
}

async fn list_repositories(State(state): State<Arc<AppState>>) -> Result<Json<Vec<RepositoryResponse>>, ApiError> {
    let repos = state.db.list_repositories().await?;
    Ok(Json(repos.into_iter().map(Into::into).collect()))
}

async fn create_repository(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateRepositoryRequest>,
) -> Result<Json<RepositoryResponse>, ApiError> {
    if req.name.trim().is_empty() {
        return Err(ApiError::bad_request("name must not be empty"));
    }
    let repo = Repository::new(req.organization, req.project, req.name, req.url);
    let saved = state.db.register_repository(&repo).await?;
    Ok(Json(saved.into()))
}

async fn delete_repository(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> Result<StatusCode, ApiError> {
    state.db.delete_repository(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Serialize)]
struct AgentResponse {
    agent_id: String,
    pr_id: i64,
    repository_id: i64,
    phase: String,
    status: String,
    started_at: chrono::DateTime<chrono::Utc>,
    ended_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl From<AgentRecord> for AgentResponse {
    fn from(r: AgentRecord) -> Self {
        Self {
            agent_id: r.agent_id,
            pr_id: r.pr_id,
            repository_id: r.repository_id,
            phase: r.phase.as_str().to_string(),
            status: r.status.as_str().to_string(),
            started_at: r.started_at,
            ended_at: r.ended_at,
        }
    }
}

async fn list_agents(State(state): State<Arc<AppState>>) -> Result<Json<Vec<AgentResponse>>, ApiError> {
    let agents = state.db.list_agents(100).await?;
    Ok(Json(agents.into_iter().map(Into::into).collect()))
}

async fn get_agent(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Result<Json<AgentResponse>, ApiError> {
    let agent = state.db.get_agent(&id).await?;
    Ok(Json(agent.into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tower::ServiceExt;

    async fn test_state() -> Arc<AppState> {
        let db = Arc::new(Database::in_memory().await.unwrap());
        Arc::new(AppState::new(db, None, None))
    }

    #[tokio::test]
    async fn health_returns_ok() {
        let state = test_state().await;
        let router = create_router(state);
        let response = router
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn create_and_list_repository_round_trips() {
        let state = test_state().await;
        let router = create_router(state);
        let body = serde_json::to_vec(&serde_json::json!({
            "organization": "acme",
            "project": "widgets",
            "name": "widgets-api",
            "url": "https://dev.azure.com/acme/widgets/_git/widgets-api"
        }))
        .unwrap();
        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/repositories")
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = router
            .oneshot(Request::builder().uri("/repositories").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn admin_route_rejects_missing_api_key_when_configured() {
        let db = Arc::new(Database::in_memory().await.unwrap());
        let state = Arc::new(AppState::new(db, None, Some(SecretString::new("secret".into()))));
        let router = create_router(state);
        let response = router
            .oneshot(Request::builder().uri("/repositories").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
