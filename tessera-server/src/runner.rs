use std::sync::Arc;

use anyhow::Result;
use tessera_core::{GenerationRequest, ModelHandle, Progress, ProgressSink, Stage};
use tokio::task::JoinHandle;
use tracing::{error, info, info_span, warn, Instrument};

use crate::{AppState, GatePermit, StoredImage, TaskStatus, TaskStore};

/// Mirrors engine progress into the bound task, if any.
struct TaskProgress {
    tasks: Arc<TaskStore>,
    task_id: Option<String>,
}

impl TaskProgress {
    fn mark(&self, status: TaskStatus, percent: u8, message: impl Into<String>) {
        let Some(task_id) = &self.task_id else {
            return;
        };
        if let Err(e) = self.tasks.advance(task_id, status, percent, message) {
            warn!(%task_id, "dropped progress update: {e}");
        }
    }
}

impl ProgressSink for TaskProgress {
    fn report(&self, progress: Progress) {
        let status = match progress.stage {
            Stage::Preparing => TaskStatus::Preparing,
            Stage::Tokenizing => TaskStatus::Tokenizing,
            Stage::Generating => TaskStatus::Generating,
            Stage::Decoding => TaskStatus::Decoding,
        };
        self.mark(status, progress.percent, progress.message);
    }
}

/// Runs one generation end to end while holding `permit`: model load, sampling,
/// decoding, saving and recording the outcome on the task. The permit travels into
/// the blocking worker and comes back out of it, so it is released only after the
/// task is marked completed or failed (or during unwind if the worker panics).
pub async fn generate(
    state: &AppState,
    request: GenerationRequest,
    task_id: Option<String>,
    permit: GatePermit,
) -> Result<StoredImage> {
    let progress = TaskProgress {
        tasks: state.tasks.clone(),
        task_id: task_id.clone(),
    };
    progress.mark(TaskStatus::Starting, 0, "Starting image generation");

    let (permit, outcome) = execute(state, request, progress, permit).await;
    let outcome = match (outcome, &task_id) {
        (Ok(stored), Some(task_id)) => state
            .tasks
            .complete(task_id, stored.filename.clone(), stored.path.clone())
            .map(|()| stored)
            .map_err(anyhow::Error::from),
        (outcome, _) => outcome,
    };
    if let (Err(e), Some(task_id)) = (&outcome, &task_id) {
        if let Err(e) = state.tasks.fail(task_id, format!("{e:#}")) {
            warn!("could not mark task failed: {e}");
        }
    }
    drop(permit);
    outcome
}

async fn execute(
    state: &AppState,
    request: GenerationRequest,
    progress: TaskProgress,
    permit: GatePermit,
) -> (Option<GatePermit>, Result<StoredImage>) {
    let model = match state.model.ensure_loaded().await {
        Ok(model) => model,
        Err(e) => return (Some(permit), Err(e)),
    };
    let engine = state.engine.clone();
    let images = state.images.clone();
    let worker = tokio::task::spawn_blocking(move || {
        let stored = engine
            .run(model.as_ref(), &request, &progress)
            .and_then(|generation| {
                progress.mark(TaskStatus::Saving, 95, "Saving image");
                images.save(&generation.image)
            });
        (permit, stored)
    });
    match worker.await {
        Ok((permit, stored)) => (Some(permit), stored),
        Err(e) => (None, Err(anyhow::Error::new(e).context("generation worker panicked"))),
    }
}

/// Waits for the gate, then generates; the outcome lands on the task.
pub async fn run_task(state: Arc<AppState>, task_id: String, request: GenerationRequest) {
    let span = info_span!("generation", task_id = %task_id);
    async move {
        let permit = match state.gate.acquire().await {
            Ok(permit) => permit,
            Err(e) => {
                error!("generation failed: {e:#}");
                if let Err(e) = state.tasks.fail(&task_id, format!("{e:#}")) {
                    warn!("could not mark task failed: {e}");
                }
                return;
            }
        };
        match generate(&state, request, Some(task_id), permit).await {
            Ok(stored) => info!(filename = %stored.filename, "task completed"),
            Err(e) => error!("generation failed: {e:#}"),
        }
    }
    .instrument(span)
    .await
}

pub fn spawn_task(
    state: Arc<AppState>,
    task_id: String,
    request: GenerationRequest,
) -> JoinHandle<()> {
    tokio::spawn(run_task(state, task_id, request))
}

/// Warms the model in the background so the first request does not pay for loading.
pub fn spawn_preload(model: Arc<ModelHandle>) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(model = model.name(), "preloading model in background");
        match model.ensure_loaded().await {
            Ok(_) => info!("model preloaded"),
            Err(e) => error!("model preload failed, will retry on first request: {e:#}"),
        }
    })
}
