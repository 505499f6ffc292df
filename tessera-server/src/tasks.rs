use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

const PROMPT_PREVIEW_CHARS: usize = 50;

/// Lifecycle of a generation task. Ordering follows the lifecycle, so a
/// transition is legal only when it does not move backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Starting,
    Preparing,
    Tokenizing,
    Generating,
    Decoding,
    Saving,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    pub fn as_str(self) -> String {
        serde_plain::to_string(&self).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub status: TaskStatus,
    pub progress: u8,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Task {
    fn pending(prompt: &str, request_id: Option<String>) -> Self {
        Self {
            status: TaskStatus::Pending,
            progress: 0,
            message: "Task created, waiting to start".to_string(),
            timestamp: Utc::now(),
            prompt: prompt_preview(prompt),
            filename: None,
            path: None,
            request_id,
            error: None,
        }
    }
}

pub fn prompt_preview(prompt: &str) -> String {
    match prompt.char_indices().nth(PROMPT_PREVIEW_CHARS) {
        Some((cut, _)) => format!("{}...", &prompt[..cut]),
        None => prompt.to_string(),
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("task {0} not found")]
    NotFound(String),
    #[error("task {id} cannot move from {from:?} to {to:?}")]
    Backwards {
        id: String,
        from: TaskStatus,
        to: TaskStatus,
    },
}

#[derive(Default)]
struct Inner {
    tasks: HashMap<String, Task>,
    /// Insertion order, oldest first.
    order: VecDeque<String>,
}

impl Inner {
    /// Drops the oldest finished task. Live tasks are never evicted.
    fn evict_one(&mut self) -> bool {
        let Some(pos) = self.order.iter().position(|id| {
            self.tasks
                .get(id)
                .is_some_and(|task| task.status.is_terminal())
        }) else {
            return false;
        };
        if let Some(id) = self.order.remove(pos) {
            self.tasks.remove(&id);
            debug!(task_id = %id, "evicted finished task");
        }
        true
    }
}

/// Concurrency-safe map of task id to task record.
///
/// Every operation holds the lock only for the map access itself.
pub struct TaskStore {
    inner: Mutex<Inner>,
    capacity: usize,
}

impl TaskStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::default(),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a new `pending` task and returns its freshly minted id.
    pub fn create(&self, prompt: &str, request_id: Option<String>) -> String {
        let mut inner = self.lock();
        while inner.tasks.len() >= self.capacity {
            if !inner.evict_one() {
                warn!(
                    live = inner.tasks.len(),
                    capacity = self.capacity,
                    "task store over capacity with no finished tasks to evict"
                );
                break;
            }
        }
        let id = loop {
            let id = Uuid::new_v4().to_string();
            if !inner.tasks.contains_key(&id) {
                break id;
            }
        };
        inner.tasks.insert(id.clone(), Task::pending(prompt, request_id));
        inner.order.push_back(id.clone());
        id
    }

    pub fn get(&self, id: &str) -> Option<Task> {
        self.lock().tasks.get(id).cloned()
    }

    /// Tasks currently retained, live and finished.
    pub fn count(&self) -> usize {
        self.lock().tasks.len()
    }

    fn update(
        &self,
        id: &str,
        to: TaskStatus,
        apply: impl FnOnce(&mut Task),
    ) -> Result<(), TransitionError> {
        let mut inner = self.lock();
        let task = inner
            .tasks
            .get_mut(id)
            .ok_or_else(|| TransitionError::NotFound(id.to_string()))?;
        if task.status.is_terminal() || to < task.status {
            return Err(TransitionError::Backwards {
                id: id.to_string(),
                from: task.status,
                to,
            });
        }
        task.status = to;
        task.timestamp = Utc::now();
        apply(task);
        Ok(())
    }

    /// Moves a running task to `status`. Progress never decreases.
    pub fn advance(
        &self,
        id: &str,
        status: TaskStatus,
        progress: u8,
        message: impl Into<String>,
    ) -> Result<(), TransitionError> {
        debug_assert!(!status.is_terminal(), "use complete() or fail()");
        let message = message.into();
        self.update(id, status, |task| {
            task.progress = task.progress.max(progress.min(100));
            task.message = message;
        })
    }

    pub fn complete(
        &self,
        id: &str,
        filename: String,
        path: PathBuf,
    ) -> Result<(), TransitionError> {
        self.update(id, TaskStatus::Completed, |task| {
            task.progress = 100;
            task.message = "Image generation complete".to_string();
            task.filename = Some(filename);
            task.path = Some(path);
        })
    }

    /// Records a failure. Progress stays where the run stopped.
    pub fn fail(&self, id: &str, error: impl Into<String>) -> Result<(), TransitionError> {
        let error = error.into();
        self.update(id, TaskStatus::Failed, |task| {
            task.message = "Image generation failed".to_string();
            task.error = Some(error);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_tasks_are_pending_and_immediately_visible() {
        let store = TaskStore::new(8);
        let id = store.create("a red cube", Some("req-1".to_string()));
        let task = store.get(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.progress, 0);
        assert_eq!(task.prompt, "a red cube");
        assert_eq!(task.request_id.as_deref(), Some("req-1"));
    }

    #[test]
    fn ids_are_never_reused() {
        let store = TaskStore::new(1024);
        let mut ids: Vec<_> = (0..200).map(|_| store.create("p", None)).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 200);
    }

    #[test]
    fn long_prompts_are_truncated_on_char_boundaries() {
        let prompt = "é".repeat(60);
        let preview = prompt_preview(&prompt);
        assert_eq!(preview.chars().count(), 53);
        assert!(preview.ends_with("..."));
        assert_eq!(prompt_preview("short"), "short");
        assert_eq!(prompt_preview(&"x".repeat(50)), "x".repeat(50));
    }

    #[test]
    fn transitions_only_move_forward() {
        let store = TaskStore::new(8);
        let id = store.create("p", None);
        store.advance(&id, TaskStatus::Starting, 0, "start").unwrap();
        store.advance(&id, TaskStatus::Generating, 40, "gen").unwrap();
        store.advance(&id, TaskStatus::Generating, 45, "gen").unwrap();

        let err = store
            .advance(&id, TaskStatus::Tokenizing, 10, "back")
            .unwrap_err();
        assert!(matches!(err, TransitionError::Backwards { .. }));

        // a stale lower value does not pull progress back
        store.advance(&id, TaskStatus::Generating, 30, "late").unwrap();
        assert_eq!(store.get(&id).unwrap().progress, 45);
    }

    #[test]
    fn terminal_states_are_final() {
        let store = TaskStore::new(8);
        let id = store.create("p", None);
        store
            .complete(&id, "a.jpg".to_string(), PathBuf::from("out/a.jpg"))
            .unwrap();
        let task = store.get(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.progress, 100);
        assert_eq!(task.filename.as_deref(), Some("a.jpg"));

        assert!(store.fail(&id, "late").is_err());
        assert!(store.advance(&id, TaskStatus::Saving, 95, "x").is_err());
    }

    #[test]
    fn failure_records_the_error() {
        let store = TaskStore::new(8);
        let id = store.create("p", None);
        store.advance(&id, TaskStatus::Generating, 50, "gen").unwrap();
        store.fail(&id, "out of memory").unwrap();
        let task = store.get(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.progress, 50);
        assert_eq!(task.error.as_deref(), Some("out of memory"));
        assert_eq!(
            store.fail("missing", "x"),
            Err(TransitionError::NotFound("missing".to_string()))
        );
    }

    #[test]
    fn evicts_oldest_finished_task_when_full() {
        let store = TaskStore::new(2);
        let done = store.create("first", None);
        let live = store.create("second", None);
        store.fail(&done, "boom").unwrap();

        let newest = store.create("third", None);
        assert!(store.get(&done).is_none());
        assert!(store.get(&live).is_some());
        assert!(store.get(&newest).is_some());

        // nothing finished left to evict, so the store grows past capacity
        let extra = store.create("fourth", None);
        assert!(store.get(&extra).is_some());
        assert_eq!(store.count(), 3);
    }

    #[test]
    fn statuses_serialize_lowercase() {
        assert_eq!(TaskStatus::Generating.as_str(), "generating");
        assert_eq!(
            serde_json::to_value(TaskStatus::Completed).unwrap(),
            serde_json::json!("completed")
        );
    }
}
