pub mod error;
pub mod gate;
pub mod routes;
pub mod runner;
pub mod storage;
pub mod tasks;

use std::sync::Arc;

pub use error::ApiError;
pub use gate::{GatePermit, SingleFlightGate};
pub use routes::router;
pub use storage::{ImageStore, StoredImage};
pub use tasks::{Task, TaskStatus, TaskStore};

use tessera_core::{GenerationEngine, ModelHandle};

/// Shared state behind every handler.
pub struct AppState {
    pub model: Arc<ModelHandle>,
    pub engine: GenerationEngine,
    pub tasks: Arc<TaskStore>,
    pub gate: SingleFlightGate,
    pub images: ImageStore,
}

impl AppState {
    pub fn new(
        model: Arc<ModelHandle>,
        engine: GenerationEngine,
        images: ImageStore,
        max_tasks: usize,
    ) -> Self {
        Self {
            model,
            engine,
            tasks: Arc::new(TaskStore::new(max_tasks)),
            gate: SingleFlightGate::new(),
            images,
        }
    }
}
