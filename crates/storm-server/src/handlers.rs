//! HTTP endpoints.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use storm_core::errors::ProviderError;
use storm_core::ids::{RunId, SessionId};
use storm_core::models::{ResearchTask, DEFAULT_ANALYSTS, DEFAULT_INTERVIEW_TURNS};
use storm_engine::{ChatPipeline, EngineError, ResearchPipeline, ScriptedPipeline};
use storm_llm::{build_provider, ModelConfig, ProviderKind};

use crate::server::AppState;
use crate::tasks::TaskRecord;

pub const SERVICE_NAME: &str = "storm-research";

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), Json(json!({ "detail": self.to_string() }))).into_response()
    }
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::SessionBusy(_) => Self::Conflict(e.to_string()),
            EngineError::SessionNotFound(_) | EngineError::Core(_) => Self::BadRequest(e.to_string()),
            EngineError::Provider(ProviderError::Configuration(ref msg)) => Self::BadRequest(msg.clone()),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<ProviderError> for ApiError {
    fn from(e: ProviderError) -> Self {
        Self::BadRequest(e.to_string())
    }
}

fn default_max_analysts() -> usize {
    DEFAULT_ANALYSTS
}

fn default_max_interview_turns() -> usize {
    DEFAULT_INTERVIEW_TURNS
}

fn default_true() -> bool {
    true
}

#[derive(Clone, Debug, Deserialize)]
pub struct ResearchRequest {
    pub topic: String,
    #[serde(default = "default_max_analysts")]
    pub max_analysts: usize,
    #[serde(default = "default_max_interview_turns")]
    pub max_interview_turns: usize,
    #[serde(default = "default_true")]
    pub parallel_interviews: bool,
    #[serde(default)]
    pub model_provider: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub azure_endpoint: Option<String>,
    #[serde(default)]
    pub azure_deployment: Option<String>,
}

impl ResearchRequest {
    fn task(&self) -> Result<ResearchTask, ApiError> {
        let task = ResearchTask::new(self.topic.as_str())
            .and_then(|t| t.with_max_analysts(self.max_analysts))
            .and_then(|t| t.with_max_interview_turns(self.max_interview_turns))
            .map_err(|e| ApiError::BadRequest(e.to_string()))?;
        Ok(task.with_parallel_interviews(self.parallel_interviews))
    }

    fn provider(&self, default: ProviderKind) -> Result<ProviderKind, ApiError> {
        match self.model_provider.as_deref().filter(|p| !p.trim().is_empty()) {
            Some(name) => Ok(name.parse()?),
            None => Ok(default),
        }
    }

    /// Echo of the request for the task record. Credentials are left out.
    fn summary(&self, provider: ProviderKind) -> Value {
        json!({
            "topic": self.topic,
            "max_analysts": self.max_analysts,
            "max_interview_turns": self.max_interview_turns,
            "parallel_interviews": self.parallel_interviews,
            "model_provider": provider.as_str(),
        })
    }
}

/// Content pipeline for `config`: the offline script for `Scripted`, a
/// retrying chat pipeline for every model backend.
pub fn pipeline_for_config(config: ModelConfig) -> Result<Arc<dyn ResearchPipeline>, ProviderError> {
    if config.provider == ProviderKind::Scripted {
        return Ok(Arc::new(ScriptedPipeline::new()));
    }
    config.validate()?;
    tracing::debug!(provider = %config.provider, model = %config.model, "model configured");
    Ok(Arc::new(ChatPipeline::new(build_provider(config)?)))
}

fn pipeline_for(provider: ProviderKind, request: &ResearchRequest) -> Result<Arc<dyn ResearchPipeline>, ApiError> {
    let config = ModelConfig::from_env(provider).with_overrides(
        request.api_key.clone(),
        request.azure_endpoint.clone(),
        request.azure_deployment.clone(),
    );
    Ok(pipeline_for_config(config)?)
}

/// POST /research/interactive/{session_id}
pub async fn start_interactive_research(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(request): Json<ResearchRequest>,
) -> Result<Json<Value>, ApiError> {
    let session = SessionId::from_raw(session_id);
    if !state.registry.is_registered(&session) {
        return Err(ApiError::BadRequest(format!(
            "no WebSocket connection for session {session}; connect to /ws/{session} first"
        )));
    }

    let task = request.task()?;
    let provider = request.provider(state.config.default_provider)?;
    let pipeline = pipeline_for(provider, &request)?;
    let topic = task.topic().to_owned();

    let (run_id, handle) = state.orchestrator.spawn(session.clone(), task, pipeline)?;
    state
        .tasks
        .start(session.clone(), run_id.clone(), topic.as_str(), request.summary(provider));
    tracing::info!(session_id = %session, run_id = %run_id, topic = %topic, provider = %provider, "research started");

    let tasks = Arc::clone(&state.tasks);
    let finished = run_id.clone();
    let _ = tokio::spawn(async move {
        match handle.await {
            Ok(Ok(result)) => {
                let _ = tasks.complete(&finished, result);
            }
            Ok(Err(e)) => {
                let _ = tasks.fail(&finished, e.to_string());
            }
            Err(e) => {
                tracing::error!(run_id = %finished, error = %e, "research task aborted");
                let _ = tasks.fail(&finished, format!("task aborted: {e}"));
            }
        }
    });

    Ok(Json(json!({
        "message": format!("Interactive research started for topic: {topic}"),
        "session_id": session,
        "run_id": run_id,
    })))
}

/// GET /research/tasks
pub async fn list_tasks(State(state): State<AppState>) -> Json<Value> {
    let tasks = state.tasks.list();
    Json(json!({ "total": tasks.len(), "tasks": tasks }))
}

/// GET /research/tasks/{id}
pub async fn get_task(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<TaskRecord>, ApiError> {
    state
        .tasks
        .get(&RunId::from_raw(id.as_str()))
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("task not found: {id}")))
}

/// DELETE /research/tasks/{id}
pub async fn delete_task(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Value>, ApiError> {
    if state.tasks.delete(&RunId::from_raw(id.as_str())) {
        Ok(Json(json!({ "message": format!("task {id} deleted") })))
    } else {
        Err(ApiError::NotFound(format!("task not found: {id}")))
    }
}

/// GET /health
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": Utc::now(),
        "version": env!("CARGO_PKG_VERSION"),
        "service": SERVICE_NAME,
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "sessions": state.registry.count(),
        "active_runs": state.orchestrator.active_count(),
        "pending_asks": state.broker.pending_count(),
    }))
}
