use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode, header},
    response::{
        IntoResponse, Response,
        sse::{Event, Sse},
    },
    routing::{get, post},
};
use futures::Stream;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Value, json};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::{StreamExt, wrappers::ReceiverStream};
use tokio_util::sync::CancellationToken;

use crate::decomposition::{
    BuildSpec, Decomposition, ParallelizationStats, analyze, decompose, validate_decomposition,
};
use crate::drafts::{ApprovalOutcome, DefaultEffector, DraftKind, DraftService, GithubClient};
use crate::errors::FactoryError;
use crate::factory::db::DbHandle;
use crate::factory::models::{Adapter, BuildRecord, CouncilOutcome};
use crate::factory_config::FactoryToml;
use crate::router::{
    BudgetCeilings, ExecutionAdapter, ExecutionRequest, ExecutionRouter, ExecutionState,
    parse_execution_body,
};
use crate::runs::{CreateRunRequest, ResumeRequest, RunService};
use crate::streaming::{
    BuildStatusSource, RunStatusSource, StreamKey, StreamManager, StreamSubscription,
};

/// Header carrying the caller's identity on mutating routes.
pub const USER_ID_HEADER: &str = "x-user-id";

const ADAPTER_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct AppState {
    pub db: DbHandle,
    pub router: ExecutionRouter,
    pub drafts: DraftService,
    pub runs: RunService,
    pub streams: StreamManager,
    pub ceilings: BudgetCeilings,
    pub http: reqwest::Client,
    /// Cancelled on server shutdown; every stream holds a child token.
    pub shutdown: CancellationToken,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(db: DbHandle, config: &FactoryToml, adapter: Arc<dyn ExecutionAdapter>) -> Self {
        let github = config.github_token.as_deref().map(GithubClient::new);
        let effector = Arc::new(DefaultEffector::new(db.clone(), github));
        let http = reqwest::Client::builder()
            .timeout(ADAPTER_PROBE_TIMEOUT)
            .build()
            .unwrap_or_default();

        Self {
            router: ExecutionRouter::new(adapter, config.cost_model),
            drafts: DraftService::new(db.clone(), effector, config.council_policy()),
            runs: RunService::new(db.clone()),
            streams: StreamManager::new(config.stream_limits()),
            ceilings: config.ceilings(),
            http,
            shutdown: CancellationToken::new(),
            db,
        }
    }
}

// ── Request types ────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateBuildRequest {
    pub spec: String,
    #[serde(default)]
    pub tech_stack: Vec<String>,
    pub project_id: Option<i64>,
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateProjectRequest {
    pub name: String,
    pub github_repo: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCouncilDecisionRequest {
    pub subject: String,
    pub outcome: String,
    pub decided_by: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateDraftRequest {
    pub kind: String,
    pub payload: Value,
    pub project_id: i64,
    #[serde(default)]
    pub sources: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApproveDraftRequest {
    #[serde(default)]
    pub diff_reviewed: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateAdapterRequest {
    pub name: String,
    pub base_url: String,
}

// ── Response types ───────────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build: Option<BuildRecord>,
    pub decomposition: Decomposition,
    pub stats: ParallelizationStats,
    pub validation_errors: Vec<String>,
}

impl BuildResponse {
    fn new(build: Option<BuildRecord>, decomposition: Decomposition) -> Self {
        Self {
            build,
            stats: analyze(&decomposition),
            validation_errors: validate_decomposition(&decomposition),
            decomposition,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterHealth {
    pub id: i64,
    pub name: String,
    pub base_url: String,
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ── Error type ───────────────────────────────────────────────────────

/// Maps core errors onto HTTP responses. Internal failures are logged and
/// answered with a generic message.
#[derive(Debug)]
pub struct ApiError(FactoryError);

impl From<FactoryError> for ApiError {
    fn from(err: FactoryError) -> Self {
        Self(err)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self(FactoryError::Database(err))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = match self.0 {
            FactoryError::Gate { message, plan } => json!({ "error": message, "plan": plan }),
            ref err if err.is_internal() => {
                tracing::error!(error = %err, "Request failed");
                json!({ "error": "Internal server error" })
            }
            err => json!({ "error": err.to_string() }),
        };
        (status, Json(body)).into_response()
    }
}

// ── Router ───────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/builds", post(create_build))
        .route("/api/builds/{id}", get(get_build))
        .route("/api/builds/{id}/validate", post(validate_build))
        .route("/api/builds/{id}/execute", post(execute_build))
        .route("/api/builds/{id}/stream", get(stream_build))
        .route("/api/projects", post(create_project))
        .route("/api/projects/{id}", get(get_project))
        .route(
            "/api/projects/{id}/council-decisions",
            post(create_council_decision),
        )
        .route("/api/drafts", post(create_draft))
        .route("/api/drafts/{id}", get(get_draft))
        .route("/api/drafts/{id}/preview", get(preview_draft))
        .route("/api/drafts/{id}/events", get(list_draft_events))
        .route("/api/drafts/{id}/approve", post(approve_draft))
        .route("/api/runs", post(create_run))
        .route("/api/runs/{id}", get(get_run))
        .route("/api/runs/{id}/events", get(list_run_events))
        .route("/api/runs/{id}/resume", post(resume_run))
        .route("/api/runs/{id}/cancel", post(cancel_run))
        .route("/api/runs/{id}/stream", get(stream_run))
        .route("/api/adapters", post(create_adapter))
        .route("/api/adapters/health", get(adapter_health))
}

// ── Helpers ──────────────────────────────────────────────────────────

fn user_id(headers: &HeaderMap) -> Result<String, FactoryError> {
    headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or(FactoryError::Unauthorized)
}

fn parse_json(body: &Bytes) -> Result<Value, FactoryError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(json!({}));
    }
    serde_json::from_slice(body)
        .map_err(|e| FactoryError::Validation(format!("Invalid JSON body: {}", e)))
}

fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, FactoryError> {
    serde_json::from_value(parse_json(body)?)
        .map_err(|e| FactoryError::Validation(format!("Invalid request body: {}", e)))
}

fn sse_response(
    subscription: StreamSubscription,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    Sse::new(ReceiverStream::new(subscription.frames).map(|frame| Ok(frame.into_event())))
}

async fn load_build(state: &AppState, id: i64) -> Result<Decomposition, ApiError> {
    let decomposition = state
        .db
        .call(move |db| db.get_build_decomposition(id))
        .await?
        .ok_or_else(|| FactoryError::not_found("Build", id))?;
    Ok(decomposition)
}

// ── Handlers ─────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn create_build(
    State(state): State<SharedState>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let req: CreateBuildRequest = parse_body(&body)?;
    let spec = BuildSpec::new(&req.spec).with_tech_stack(req.tech_stack);
    let decomposition = decompose(&spec).map_err(FactoryError::from)?;

    if req.dry_run {
        return Ok((StatusCode::OK, Json(BuildResponse::new(None, decomposition))));
    }

    if let Some(project_id) = req.project_id {
        state
            .db
            .call(move |db| db.get_project(project_id))
            .await?
            .ok_or_else(|| FactoryError::not_found("Project", project_id))?;
    }

    let stored = decomposition.clone();
    let build = state
        .db
        .call(move |db| db.create_build(req.project_id, &spec, &stored))
        .await?;
    tracing::info!(
        build_id = build.id,
        waves = build.total_waves,
        "Build decomposed"
    );

    Ok((
        StatusCode::CREATED,
        Json(BuildResponse::new(Some(build), decomposition)),
    ))
}

async fn get_build(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let build = state
        .db
        .call(move |db| db.get_build(id))
        .await?
        .ok_or_else(|| FactoryError::not_found("Build", id))?;
    let decomposition = load_build(&state, id).await?;
    Ok(Json(BuildResponse::new(Some(build), decomposition)))
}

async fn validate_build(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let decomposition = load_build(&state, id).await?;
    let errors = validate_decomposition(&decomposition);
    Ok(Json(json!({ "valid": errors.is_empty(), "errors": errors })))
}

async fn execute_build(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = user_id(&headers)?;

    let mut value = parse_json(&body)?;
    if let Some(object) = value.as_object_mut()
        && !object.contains_key("buildPlanId")
    {
        object.insert("buildPlanId".to_string(), json!(id.to_string()));
    }
    let body = parse_execution_body(&value)?;
    if body.build_plan_id != id.to_string() {
        return Err(FactoryError::Validation(format!(
            "buildPlanId '{}' does not match build {}",
            body.build_plan_id, id
        ))
        .into());
    }

    let stats = analyze(&load_build(&state, id).await?);
    let request = ExecutionRequest::new(body, &user_id, state.ceilings);
    let envelope = state.router.route(&request, &stats).await;

    let record_envelope = envelope.clone();
    state
        .db
        .call(move |db| db.insert_execution(id, &record_envelope))
        .await?;

    let status = match envelope.state {
        ExecutionState::Failed => envelope
            .status_code
            .and_then(|code| StatusCode::from_u16(code).ok())
            .unwrap_or(StatusCode::BAD_GATEWAY),
        _ => StatusCode::OK,
    };
    Ok((status, Json(envelope)))
}

async fn stream_build(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .db
        .call(move |db| db.get_build_status(id))
        .await?
        .ok_or_else(|| FactoryError::not_found("Build", id))?;

    let source = Arc::new(BuildStatusSource::new(state.db.clone(), id));
    let subscription =
        state
            .streams
            .subscribe(StreamKey::build(id), source, state.shutdown.child_token())?;
    Ok(sse_response(subscription))
}

async fn create_project(
    State(state): State<SharedState>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let req: CreateProjectRequest = parse_body(&body)?;
    if req.name.trim().is_empty() {
        return Err(FactoryError::Validation("Project name is required".to_string()).into());
    }
    let project = state
        .db
        .call(move |db| db.create_project(req.name.trim(), req.github_repo.as_deref()))
        .await?;
    Ok((StatusCode::CREATED, Json(project)))
}

async fn get_project(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let project = state
        .db
        .call(move |db| db.get_project(id))
        .await?
        .ok_or_else(|| FactoryError::not_found("Project", id))?;
    Ok(Json(project))
}

async fn create_council_decision(
    State(state): State<SharedState>,
    Path(project_id): Path<i64>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let req: CreateCouncilDecisionRequest = parse_body(&body)?;
    let outcome: CouncilOutcome = req.outcome.parse().map_err(FactoryError::Validation)?;

    state
        .db
        .call(move |db| db.get_project(project_id))
        .await?
        .ok_or_else(|| FactoryError::not_found("Project", project_id))?;

    let decision = state
        .db
        .call(move |db| {
            db.create_council_decision(project_id, &req.subject, outcome, &req.decided_by)
        })
        .await?;
    Ok((StatusCode::CREATED, Json(decision)))
}

async fn create_draft(
    State(state): State<SharedState>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let req: CreateDraftRequest = parse_body(&body)?;
    let kind: DraftKind = req.kind.parse().map_err(FactoryError::Validation)?;
    let draft = state
        .drafts
        .create(
            kind,
            req.payload,
            req.project_id,
            req.sources.unwrap_or_else(|| json!([])),
        )
        .await?;
    Ok((StatusCode::CREATED, Json(draft)))
}

async fn get_draft(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.drafts.get(id).await?))
}

async fn preview_draft(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let (draft, plan) = state.drafts.plan(id).await?;
    Ok(Json(json!({ "draft": draft, "plan": plan })))
}

async fn list_draft_events(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.drafts.events(id).await?))
}

async fn approve_draft(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ApprovalOutcome>, ApiError> {
    let actor = user_id(&headers)?;
    let req: ApproveDraftRequest = parse_body(&body)?;
    if !req.diff_reviewed {
        return Err(FactoryError::Validation(
            "diffReviewed must be true to approve a draft".to_string(),
        )
        .into());
    }
    Ok(Json(state.drafts.approve(id, &actor).await?))
}

async fn create_run(
    State(state): State<SharedState>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let req: CreateRunRequest = parse_body(&body)?;
    Ok(Json(state.runs.create(req).await?))
}

async fn get_run(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.runs.get(&id).await?))
}

async fn list_run_events(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let body = state.runs.events_ndjson(&id).await?;
    Ok(([(header::CONTENT_TYPE, "application/x-ndjson")], body))
}

async fn resume_run(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let req: ResumeRequest = parse_body(&body)?;
    state.runs.resume(&id, req).await?;
    Ok(Json(json!({ "success": true })))
}

async fn cancel_run(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.runs.cancel(&id).await?;
    Ok(Json(json!({ "success": true })))
}

async fn stream_run(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.runs.get(&id).await?;
    let source = Arc::new(RunStatusSource::new(state.db.clone(), &id));
    let subscription =
        state
            .streams
            .subscribe(StreamKey::run(&id), source, state.shutdown.child_token())?;
    Ok(sse_response(subscription))
}

async fn create_adapter(
    State(state): State<SharedState>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let req: CreateAdapterRequest = parse_body(&body)?;
    if req.name.trim().is_empty() {
        return Err(FactoryError::Validation("Adapter name is required".to_string()).into());
    }
    if !(req.base_url.starts_with("http://") || req.base_url.starts_with("https://")) {
        return Err(FactoryError::Validation(format!(
            "Adapter baseUrl must be an http(s) URL: {}",
            req.base_url
        ))
        .into());
    }
    let base_url = req.base_url.trim_end_matches('/').to_string();
    let adapter = state
        .db
        .call(move |db| db.create_adapter(req.name.trim(), &base_url))
        .await?;
    Ok((StatusCode::CREATED, Json(adapter)))
}

async fn adapter_health(
    State(state): State<SharedState>,
) -> Result<Json<Vec<AdapterHealth>>, ApiError> {
    let adapters = state.db.call(|db| db.list_adapters()).await?;
    let checks = adapters
        .into_iter()
        .map(|adapter| check_adapter_health(&state.http, adapter));
    let results = futures::future::join_all(checks).await;

    for result in &results {
        let (id, healthy, error) = (result.id, result.healthy, result.error.clone());
        state
            .db
            .call(move |db| db.record_adapter_health(id, healthy, error.as_deref()))
            .await?;
    }
    Ok(Json(results))
}

async fn check_adapter_health(client: &reqwest::Client, adapter: Adapter) -> AdapterHealth {
    let url = format!("{}/health", adapter.base_url);
    let error = match client.get(&url).send().await {
        Ok(resp) if resp.status().is_success() => None,
        Ok(resp) => Some(format!("Health check returned {}", resp.status())),
        Err(e) => Some(format!("Health check failed: {}", e)),
    };
    if let Some(ref e) = error {
        tracing::warn!(adapter = %adapter.name, url = %url, error = %e, "Adapter unhealthy");
    }
    AdapterHealth {
        id: adapter.id,
        name: adapter.name,
        base_url: adapter.base_url,
        healthy: error.is_none(),
        error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::db::FactoryDb;
    use crate::factory::models::BuildStatus;
    use crate::router::{AdapterResponse, ExecutionRequest};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::ServiceExt;

    const TWO_WAVE_SPEC: &str =
        "## Schema\n- Owns: db/schema.sql\n\n## API\n- Depends on: schema\n- Owns: src/api.rs\n";

    #[derive(Default)]
    struct CountingAdapter {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ExecutionAdapter for CountingAdapter {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn dispatch(
            &self,
            request: &ExecutionRequest,
        ) -> Result<AdapterResponse, FactoryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(AdapterResponse {
                status: "ACCEPTED".to_string(),
                result: Some(json!({ "buildPlanId": request.build_plan_id })),
                execution_envelope_id: "env-1".to_string(),
                execution_run_id: "run-1".to_string(),
            })
        }
    }

    fn test_state(config: FactoryToml) -> (SharedState, Arc<CountingAdapter>) {
        let db = DbHandle::new(FactoryDb::new_in_memory().unwrap());
        let adapter = Arc::new(CountingAdapter::default());
        let state = Arc::new(AppState::new(db, &config, adapter.clone()));
        (state, adapter)
    }

    fn fast_config() -> FactoryToml {
        let mut config = FactoryToml::default();
        config.stream.poll_interval_ms = 10;
        config.stream.keepalive_secs = 5;
        config
    }

    fn test_app() -> (Router, SharedState, Arc<CountingAdapter>) {
        let (state, adapter) = test_state(fast_config());
        (api_router().with_state(state.clone()), state, adapter)
    }

    async fn body_json(response: Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn body_text(response: Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn post_as(uri: &str, user: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .header(USER_ID_HEADER, user)
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn create_build(app: &Router, spec: &str) -> i64 {
        let response = app
            .clone()
            .oneshot(post_json("/api/builds", json!({ "spec": spec })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        body_json(response).await["build"]["id"].as_i64().unwrap()
    }

    async fn create_project(app: &Router) -> i64 {
        let response = app
            .clone()
            .oneshot(post_json(
                "/api/projects",
                json!({ "name": "demo", "githubRepo": "acme/widgets" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        body_json(response).await["id"].as_i64().unwrap()
    }

    // ── Health and builds ────────────────────────────────────────────

    #[tokio::test]
    async fn test_health_check() {
        let (app, _, _) = test_app();
        let response = app.oneshot(get_req("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "ok");
    }

    #[tokio::test]
    async fn test_dry_run_returns_waves_without_storing() {
        let (app, _, _) = test_app();
        let response = app
            .oneshot(post_json(
                "/api/builds",
                json!({ "spec": TWO_WAVE_SPEC, "dryRun": true }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert!(json.get("build").is_none());
        assert_eq!(json["stats"]["totalWaves"], 2);
        assert_eq!(json["stats"]["waveSizes"], json!([1, 1]));
        assert_eq!(json["validationErrors"], json!([]));
    }

    #[tokio::test]
    async fn test_create_and_get_build() {
        let (app, _, _) = test_app();
        let id = create_build(&app, TWO_WAVE_SPEC).await;

        let response = app
            .oneshot(get_req(&format!("/api/builds/{}", id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["build"]["status"], "PENDING");
        assert_eq!(json["build"]["totalWaves"], 2);
        assert_eq!(json["stats"]["totalWorkstreams"], 2);
    }

    #[tokio::test]
    async fn test_empty_spec_is_rejected() {
        let (app, _, _) = test_app();
        let response = app
            .oneshot(post_json("/api/builds", json!({ "spec": "   " })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"], "Spec is empty");
    }

    #[tokio::test]
    async fn test_cyclic_spec_is_rejected() {
        let (app, _, _) = test_app();
        let spec = "## A\n- Depends on: b\n\n## B\n- Depends on: a\n";
        let response = app
            .oneshot(post_json("/api/builds", json!({ "spec": spec })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let error = body_json(response).await["error"].as_str().unwrap().to_string();
        assert!(error.contains("cycle"), "{}", error);
    }

    #[tokio::test]
    async fn test_build_for_unknown_project_is_not_found() {
        let (app, _, _) = test_app();
        let response = app
            .oneshot(post_json(
                "/api/builds",
                json!({ "spec": TWO_WAVE_SPEC, "projectId": 77 }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_validate_build() {
        let (app, _, _) = test_app();
        let id = create_build(&app, TWO_WAVE_SPEC).await;
        let response = app
            .oneshot(post_json(&format!("/api/builds/{}/validate", id), json!({})))
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json["valid"], true);
        assert_eq!(json["errors"], json!([]));
    }

    // ── Execution ────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_execute_requires_user_identity() {
        let (app, _, adapter) = test_app();
        let id = create_build(&app, TWO_WAVE_SPEC).await;
        let response = app
            .oneshot(post_json(&format!("/api/builds/{}/execute", id), json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_execute_rejects_extra_fields() {
        let (app, _, adapter) = test_app();
        let id = create_build(&app, TWO_WAVE_SPEC).await;
        let response = app
            .oneshot(post_as(
                &format!("/api/builds/{}/execute", id),
                "alice",
                json!({ "maxCostUSD": 1000 }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            body_json(response).await["error"],
            "Extra fields not allowed: maxCostUSD"
        );
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_execute_rejects_mismatched_plan_id() {
        let (app, _, adapter) = test_app();
        let id = create_build(&app, TWO_WAVE_SPEC).await;
        let response = app
            .oneshot(post_as(
                &format!("/api/builds/{}/execute", id),
                "alice",
                json!({ "buildPlanId": "999" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_execute_dispatches_and_records() {
        let (app, state, adapter) = test_app();
        let id = create_build(&app, TWO_WAVE_SPEC).await;
        let response = app
            .oneshot(post_as(
                &format!("/api/builds/{}/execute", id),
                "alice",
                json!({ "sessionId": "s-1" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["state"], "COMPLETED");
        assert_eq!(json["userId"], "alice");
        assert_eq!(json["buildPlanId"], id.to_string());
        assert_eq!(json["adapterStatus"], "ACCEPTED");
        assert_eq!(json["executionRunId"], "run-1");
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 1);

        let stored = state.db.call(move |db| db.count_executions(id)).await.unwrap();
        assert_eq!(stored, 1);
    }

    #[tokio::test]
    async fn test_execute_over_budget_never_dispatches() {
        let mut config = fast_config();
        config.budget.max_cost_usd = 0.5;
        let (state, adapter) = test_state(config);
        let app = api_router().with_state(state);
        let id = create_build(&app, TWO_WAVE_SPEC).await;

        let response = app
            .oneshot(post_as(
                &format!("/api/builds/{}/execute", id),
                "alice",
                json!({}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["state"], "BUDGET_EXCEEDED");
        assert_eq!(json["ceilings"]["maxCostUSD"], 0.5);
        assert!(!json["violations"].as_array().unwrap().is_empty());
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_execute_unknown_build() {
        let (app, _, adapter) = test_app();
        let response = app
            .oneshot(post_as("/api/builds/404/execute", "alice", json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 0);
    }

    // ── Streams ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_build_stream_ends_on_terminal_status() {
        let (app, state, _) = test_app();
        let id = create_build(&app, TWO_WAVE_SPEC).await;
        state
            .db
            .call(move |db| db.update_build_status(id, BuildStatus::Completed, None))
            .await
            .unwrap();

        let response = app
            .oneshot(get_req(&format!("/api/builds/{}/stream", id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let text = body_text(response).await;
        assert!(text.contains("event: end"), "{}", text);
        assert!(text.contains("COMPLETED"), "{}", text);
    }

    #[tokio::test]
    async fn test_stream_for_unknown_build() {
        let (app, _, _) = test_app();
        let response = app.oneshot(get_req("/api/builds/9/stream")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    // ── Drafts ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_draft_approval_flow() {
        let (app, _, _) = test_app();
        let project_id = create_project(&app).await;

        let response = app
            .clone()
            .oneshot(post_json(
                "/api/drafts",
                json!({
                    "kind": "WORK_ORDER",
                    "projectId": project_id,
                    "payload": { "title": "Add retries", "description": "Wrap calls" },
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let draft_id = body_json(response).await["id"].as_i64().unwrap();
        let approve_uri = format!("/api/drafts/{}/approve", draft_id);

        let response = app
            .clone()
            .oneshot(get_req(&format!("/api/drafts/{}/preview", draft_id)))
            .await
            .unwrap();
        let preview = body_json(response).await;
        assert_eq!(preview["draft"]["status"], "DRAFT");
        assert_eq!(preview["plan"]["checks"]["councilRequired"], false);

        let response = app
            .clone()
            .oneshot(post_json(&approve_uri, json!({ "diffReviewed": true })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .clone()
            .oneshot(post_as(&approve_uri, "alice", json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .clone()
            .oneshot(post_as(&approve_uri, "alice", json!({ "diffReviewed": true })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let outcome = body_json(response).await;
        assert_eq!(outcome["draft"]["status"], "APPROVED");
        assert!(
            outcome["draft"]["resultRef"]
                .as_str()
                .unwrap()
                .starts_with("work_order:")
        );

        let response = app
            .clone()
            .oneshot(post_as(&approve_uri, "bob", json!({ "diffReviewed": true })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            body_json(response).await["error"],
            "Cannot approve draft with status: APPROVED"
        );

        let response = app
            .oneshot(get_req(&format!("/api/drafts/{}/events", draft_id)))
            .await
            .unwrap();
        let events = body_json(response).await;
        assert_eq!(events.as_array().unwrap().len(), 1);
        assert_eq!(events[0]["actorUserId"], "alice");
    }

    #[tokio::test]
    async fn test_gated_draft_is_forbidden_with_plan() {
        let (app, _, _) = test_app();
        let project_id = create_project(&app).await;
        let response = app
            .clone()
            .oneshot(post_json(
                "/api/drafts",
                json!({
                    "kind": "GITHUB_ISSUE",
                    "projectId": project_id,
                    "payload": { "title": "Bug", "body": "Broken" },
                }),
            ))
            .await
            .unwrap();
        let draft_id = body_json(response).await["id"].as_i64().unwrap();

        let response = app
            .oneshot(post_as(
                &format!("/api/drafts/{}/approve", draft_id),
                "alice",
                json!({ "diffReviewed": true }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let json = body_json(response).await;
        assert_eq!(json["plan"]["checks"]["councilRequired"], true);
        assert_eq!(json["plan"]["checks"]["councilSatisfied"], false);
    }

    #[tokio::test]
    async fn test_unknown_draft_kind() {
        let (app, _, _) = test_app();
        let project_id = create_project(&app).await;
        let response = app
            .oneshot(post_json(
                "/api/drafts",
                json!({ "kind": "EMAIL", "projectId": project_id, "payload": {} }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_council_decision_requires_known_outcome() {
        let (app, _, _) = test_app();
        let project_id = create_project(&app).await;
        let uri = format!("/api/projects/{}/council-decisions", project_id);

        let response = app
            .clone()
            .oneshot(post_json(
                &uri,
                json!({ "subject": "ship", "outcome": "MAYBE", "decidedBy": "council" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .oneshot(post_json(
                &uri,
                json!({ "subject": "ship", "outcome": "APPROVED", "decidedBy": "council" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(body_json(response).await["outcome"], "APPROVED");
    }

    // ── Runs ─────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_run_lifecycle() {
        let (app, _, _) = test_app();
        let response = app
            .clone()
            .oneshot(post_json("/api/runs", json!({ "prompt": "ship it" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let created = body_json(response).await;
        assert_eq!(created["status"], "WAITING_APPROVAL");
        let run_id = created["runId"].as_str().unwrap().to_string();

        let response = app
            .clone()
            .oneshot(get_req(&format!("/api/runs/{}/events", run_id)))
            .await
            .unwrap();
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/x-ndjson"
        );
        let text = body_text(response).await;
        assert!(text.lines().count() >= 2);
        for line in text.lines() {
            serde_json::from_str::<Value>(line).unwrap();
        }

        let response = app
            .clone()
            .oneshot(post_json(
                &format!("/api/runs/{}/resume", run_id),
                json!({ "approved": true }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .clone()
            .oneshot(get_req(&format!("/api/runs/{}", run_id)))
            .await
            .unwrap();
        assert_eq!(body_json(response).await["status"], "COMPLETED");

        let response = app
            .oneshot(post_json(&format!("/api/runs/{}/cancel", run_id), json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_create_run_with_empty_body() {
        let (app, _, _) = test_app();
        let request = Request::builder()
            .method("POST")
            .uri("/api/runs")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unknown_run_is_not_found() {
        let (app, _, _) = test_app();
        let response = app.oneshot(get_req("/api/runs/missing")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["error"], "Run missing not found");
    }

    // ── Adapters ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_unreachable_adapter_is_unhealthy() {
        let (app, _, _) = test_app();
        let response = app
            .clone()
            .oneshot(post_json(
                "/api/adapters",
                json!({ "name": "remote", "baseUrl": "http://127.0.0.1:9/" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(body_json(response).await["baseUrl"], "http://127.0.0.1:9");

        let response = app.oneshot(get_req("/api/adapters/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json[0]["name"], "remote");
        assert_eq!(json[0]["healthy"], false);
        assert!(json[0]["error"].is_string());
    }

    #[tokio::test]
    async fn test_adapter_requires_http_url() {
        let (app, _, _) = test_app();
        let response = app
            .oneshot(post_json(
                "/api/adapters",
                json!({ "name": "remote", "baseUrl": "ftp://host" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
