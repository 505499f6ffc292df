use std::path::Path as FsPath;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{header, HeaderMap, HeaderValue},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tessera_core::GenerationRequest;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

use crate::{
    error::ApiError,
    runner,
    tasks::{prompt_preview, Task, TaskStatus},
    AppState,
};

const REQUEST_ID_HEADER: &str = "x-request-id";

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/generate", post(generate))
        .route("/progress/{task_id}", get(progress))
        .route("/status/{task_id}", get(status))
        .route("/result/{task_id}", get(result))
        .route("/generated_samples/{filename}", get(generated_sample))
        .route("/latest_image", get(latest_image))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct GenerateBody {
    prompt: Option<String>,
    #[serde(rename = "async", default = "default_async")]
    run_async: bool,
    #[serde(rename = "userId")]
    user_id: Option<Value>,
    #[serde(rename = "projectId")]
    project_id: Option<Value>,
    temperature: Option<f64>,
    cfg_weight: Option<f64>,
    seed: Option<u64>,
}

fn default_async() -> bool {
    true
}

#[derive(Serialize)]
struct TaskSnapshot<'a> {
    task_id: &'a str,
    #[serde(flatten)]
    task: &'a Task,
}

fn jpeg(bytes: Vec<u8>) -> Response {
    ([(header::CONTENT_TYPE, "image/jpeg")], bytes).into_response()
}

/// Reads a stored image; `Ok(None)` when the file has gone missing.
async fn read_image(path: &FsPath) -> anyhow::Result<Option<Vec<u8>>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("failed to read {}", path.display())),
    }
}

fn lookup(state: &AppState, task_id: &str) -> Result<Task, ApiError> {
    state.tasks.get(task_id).ok_or_else(|| ApiError::TaskNotFound {
        task_id: task_id.to_string(),
    })
}

async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "Image generation service running",
        "model": state.model.name(),
        "model_loaded": state.model.is_loaded(),
        "tasks": state.tasks.count(),
    }))
}

async fn generate(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Result<Json<GenerateBody>, JsonRejection>,
) -> Result<Response, ApiError> {
    let request_id = headers
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("none")
        .to_string();
    let body = match body {
        Ok(Json(body)) => body,
        Err(JsonRejection::JsonDataError(rejection)) => {
            warn!(%request_id, "mistyped generation request: {rejection}");
            return Err(ApiError::InvalidBody(rejection.body_text()));
        }
        Err(rejection) => {
            warn!(%request_id, "unreadable generation request: {rejection}");
            return Err(ApiError::MissingPrompt);
        }
    };
    let prompt = body
        .prompt
        .filter(|prompt| !prompt.trim().is_empty())
        .ok_or(ApiError::MissingPrompt)?;

    info!(
        %request_id,
        user_id = ?body.user_id,
        project_id = ?body.project_id,
        prompt = %prompt_preview(&prompt),
        run_async = body.run_async,
        "generation requested"
    );

    let request = GenerationRequest {
        prompt,
        temperature: body.temperature,
        cfg_weight: body.cfg_weight,
        seed: body.seed,
    };

    if body.run_async {
        let task_id = state
            .tasks
            .create(&request.prompt, Some(request_id.clone()));
        runner::spawn_task(state.clone(), task_id.clone(), request);
        info!(%request_id, %task_id, "task queued");
        return Ok(Json(json!({
            "task_id": task_id,
            "status": "processing",
            "message": "Image generation started",
            "progress_url": format!("/progress/{task_id}"),
            "result_url": format!("/result/{task_id}"),
            "status_url": format!("/status/{task_id}"),
        }))
        .into_response());
    }

    let Some(permit) = state.gate.try_acquire() else {
        warn!(%request_id, "rejecting synchronous request, generation in progress");
        return Err(ApiError::Busy);
    };
    let stored = runner::generate(&state, request, None, permit)
        .await
        .map_err(|e| {
            error!(%request_id, "synchronous generation failed: {e:#}");
            ApiError::Generation {
                message: format!("{e:#}"),
                request_id: request_id.clone(),
            }
        })?;
    let bytes = read_image(&stored.path)
        .await?
        .ok_or(ApiError::FileMissing)?;
    Ok(jpeg(bytes))
}

async fn progress(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let task = lookup(&state, &task_id)?;
    let snapshot = serde_json::to_value(TaskSnapshot {
        task_id: &task_id,
        task: &task,
    })
    .context("failed to serialize task")?;
    Ok(Json(snapshot))
}

async fn status(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> Result<Response, ApiError> {
    let task = lookup(&state, &task_id)?;

    if task.status == TaskStatus::Completed {
        if let Some(path) = &task.path {
            if let Some(bytes) = read_image(path).await? {
                let mut response = jpeg(bytes);
                let headers = response.headers_mut();
                let status = HeaderValue::try_from(task.status.as_str())
                    .context("task status is not a valid header value")?;
                headers.insert("x-task-status", status);
                headers.insert("x-task-progress", HeaderValue::from(u16::from(task.progress)));
                return Ok(response);
            }
        }
        warn!(%task_id, "completed task has no image on disk");
        return Ok(Json(json!({
            "status": task.status,
            "progress": task.progress,
            "message": "Image file was not found on disk",
            "error": "File not found",
        }))
        .into_response());
    }

    let mut body = json!({
        "task_id": task_id,
        "status": task.status,
        "progress": task.progress,
        "message": task.message,
        "timestamp": task.timestamp,
    });
    if let Some(error) = &task.error {
        body["error"] = json!(error);
    }
    Ok(Json(body).into_response())
}

async fn result(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> Result<Response, ApiError> {
    let task = lookup(&state, &task_id)?;
    if task.status != TaskStatus::Completed {
        return Err(ApiError::NotCompleted {
            status: task.status,
        });
    }
    let path = task.path.as_deref().ok_or(ApiError::MissingResultPath)?;
    let bytes = read_image(path).await?.ok_or(ApiError::FileMissing)?;
    Ok(jpeg(bytes))
}

async fn generated_sample(
    State(state): State<Arc<AppState>>,
    Path(filename): Path<String>,
) -> Result<Response, ApiError> {
    let path = state
        .images
        .resolve(&filename)
        .await
        .ok_or(ApiError::ImageNotFound)?;
    let bytes = read_image(&path).await?.ok_or(ApiError::ImageNotFound)?;
    Ok(jpeg(bytes))
}

async fn latest_image(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let path = state.images.latest().await?.ok_or(ApiError::NoImages)?;
    let bytes = read_image(&path).await?.ok_or(ApiError::NoImages)?;
    Ok(jpeg(bytes))
}
