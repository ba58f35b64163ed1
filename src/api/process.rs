/// Process engine REST API endpoints
///
/// Thin handlers over `ProcessEngine` and `DefinitionRegistry`: they extract
/// the request, call the engine and wrap the result in the response envelope.
/// Malformed bodies are answered with the same envelope as engine errors.

use crate::api::{ApiError, ApiResponse, ApiResult};
use crate::diagram::DiagramRenderer;
use crate::error::EngineError;
use crate::process::types::ProcessDefinitionView;
use crate::runtime::{
    engine::ProcessEngine,
    history::HistoryEvent,
    tasks::Task,
    types::{CompleteTaskRequest, ProcessInstanceView, StartProcessRequest},
};
use axum::{
    extract::{rejection::JsonRejection, Multipart, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use std::sync::Arc;

/// Application state containing shared resources
#[derive(Clone)]
pub struct AppState {
    /// Execution engine (owns tasks, history and the definition registry)
    pub engine: Arc<ProcessEngine>,
    /// Renderer used by the diagram endpoint
    pub renderer: Arc<dyn DiagramRenderer>,
}

/// Resource name used when an upload carries no file name
const DEFAULT_RESOURCE_NAME: &str = "process.bpmn20.xml";

/// Create process management routes
pub fn create_process_routes() -> Router<AppState> {
    Router::new()
        .route("/api/process/deploy", post(deploy_process))
        .route("/api/process/definitions", get(list_definitions))
        .route("/api/process/start", post(start_process))
        .route("/api/process/tasks/{user_id}", get(list_user_tasks))
        .route("/api/process/task/complete", post(complete_task))
        .route("/api/process/instance/{id}", get(get_instance))
        .route("/api/process/instance/{id}/suspend", post(suspend_instance))
        .route("/api/process/instance/{id}/activate", post(activate_instance))
        .route("/api/process/instance/{id}/history", get(instance_history))
        .route("/api/process/diagram/{definition_id}", get(process_diagram))
}

/// Deploy a process resource
///
/// POST /api/process/deploy (multipart, field `file`)
/// Returns: deployment id
async fn deploy_process(State(state): State<AppState>, mut multipart: Multipart) -> ApiResult<String> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| EngineError::Validation(format!("invalid multipart body: {}", e)))?
    {
        if field.name() != Some("file") {
            continue;
        }

        let name = field
            .file_name()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or(DEFAULT_RESOURCE_NAME)
            .to_string();
        let bytes = field
            .bytes()
            .await
            .map_err(|e| EngineError::Validation(format!("failed to read upload: {}", e)))?;

        let deployment = state.engine.definitions().deploy(&name, &bytes).await?;
        return Ok(ApiResponse::success(deployment.id));
    }

    Err(EngineError::Validation("multipart field 'file' is required".to_string()).into())
}

/// List the latest version of every process definition
///
/// GET /api/process/definitions
async fn list_definitions(State(state): State<AppState>) -> ApiResult<Vec<ProcessDefinitionView>> {
    let definitions = state
        .engine
        .definitions()
        .list_latest_per_key()
        .iter()
        .map(|entry| entry.definition.view())
        .collect();
    Ok(ApiResponse::success(definitions))
}

/// Start a process instance
///
/// POST /api/process/start
/// Body: { "processDefinitionKey": "...", "startUserId": "...", "businessKey"?, "variables"? }
async fn start_process(
    State(state): State<AppState>,
    payload: Result<Json<StartProcessRequest>, JsonRejection>,
) -> ApiResult<ProcessInstanceView> {
    let Json(request) = payload.map_err(rejected)?;
    let instance = state.engine.start(request).await?;
    Ok(ApiResponse::success(instance))
}

/// Outstanding tasks of a user
///
/// GET /api/process/tasks/{userId}
async fn list_user_tasks(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> ApiResult<Vec<Task>> {
    Ok(ApiResponse::success(state.engine.list_tasks(&user_id).await))
}

/// Complete a task
///
/// POST /api/process/task/complete
/// Body: { "taskId": "...", "userId": "...", "approved"?, "comment"?, "variables"? }
async fn complete_task(
    State(state): State<AppState>,
    payload: Result<Json<CompleteTaskRequest>, JsonRejection>,
) -> ApiResult<()> {
    let Json(request) = payload.map_err(rejected)?;
    state.engine.complete(request).await?;
    Ok(ApiResponse::empty())
}

/// GET /api/process/instance/{id}
async fn get_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<ProcessInstanceView> {
    Ok(ApiResponse::success(state.engine.get_instance(&id).await?))
}

/// POST /api/process/instance/{id}/suspend
async fn suspend_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<ProcessInstanceView> {
    Ok(ApiResponse::success(state.engine.suspend_instance(&id).await?))
}

/// POST /api/process/instance/{id}/activate
async fn activate_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<ProcessInstanceView> {
    Ok(ApiResponse::success(state.engine.activate_instance(&id).await?))
}

/// GET /api/process/instance/{id}/history
async fn instance_history(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Vec<HistoryEvent>> {
    Ok(ApiResponse::success(state.engine.instance_history(&id).await?))
}

/// Render a definition diagram with live positions highlighted
///
/// GET /api/process/diagram/{definitionId}
/// Failures are logged and answered with an empty body.
async fn process_diagram(
    State(state): State<AppState>,
    Path(definition_id): Path<String>,
) -> Response {
    let content_type = state.renderer.content_type();

    let compiled = match state.engine.definitions().get(&definition_id) {
        Ok(compiled) => compiled,
        Err(e) => {
            tracing::error!("🖼️ Diagram for {} unavailable: {}", definition_id, e);
            return (StatusCode::OK, [(header::CONTENT_TYPE, content_type)], Vec::new()).into_response();
        }
    };

    let active = state.engine.active_node_ids(&definition_id).await;
    match state.renderer.render(&compiled.graph, &active) {
        Ok(image) => (StatusCode::OK, [(header::CONTENT_TYPE, content_type)], image).into_response(),
        Err(e) => {
            tracing::error!("🖼️ Failed to render diagram for {}: {:#}", definition_id, e);
            (StatusCode::OK, [(header::CONTENT_TYPE, content_type)], Vec::new()).into_response()
        }
    }
}

fn rejected(rejection: JsonRejection) -> ApiError {
    EngineError::Validation(rejection.body_text()).into()
}
