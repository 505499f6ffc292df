use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::Result;
use hf_hub::api::tokio::Api;
use tokio::sync::OnceCell;
use tracing::{error, info};

use crate::{load_model, DeviceMap, MultiModalModel};

type LoadFuture = Pin<Box<dyn Future<Output = Result<Arc<dyn MultiModalModel>>> + Send>>;
type LoadFn = dyn Fn() -> LoadFuture + Send + Sync;

/// Lazily loaded, process-wide model.
///
/// Concurrent callers of [`ModelHandle::ensure_loaded`] share a single load. A failed
/// load leaves the handle empty, so the next caller starts a fresh attempt.
pub struct ModelHandle {
    name: String,
    loader: Box<LoadFn>,
    model: OnceCell<Arc<dyn MultiModalModel>>,
}

impl ModelHandle {
    /// Handle that downloads `model_name` from the hub on first use.
    pub fn new(model_name: impl Into<String>, device_map: DeviceMap) -> Self {
        let name = model_name.into();
        let repo = name.clone();
        Self::from_fn(name, move || {
            let repo = repo.clone();
            async move { load_model(&repo, Api::new()?, device_map).await }
        })
    }

    /// Handle backed by an arbitrary async loader.
    pub fn from_fn<F, Fut>(name: impl Into<String>, load: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Arc<dyn MultiModalModel>>> + Send + 'static,
    {
        Self {
            name: name.into(),
            loader: Box::new(move || -> LoadFuture { Box::pin(load()) }),
            model: OnceCell::new(),
        }
    }

    /// Handle around a model that is already in memory.
    pub fn loaded(name: impl Into<String>, model: Arc<dyn MultiModalModel>) -> Self {
        let name = name.into();
        let message = format!("model `{name}` has no loader");
        Self {
            name,
            loader: Box::new(move || -> LoadFuture {
                let message = message.clone();
                Box::pin(async move { Err(anyhow::anyhow!(message)) })
            }),
            model: OnceCell::new_with(Some(model)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_loaded(&self) -> bool {
        self.model.initialized()
    }

    pub async fn ensure_loaded(&self) -> Result<Arc<dyn MultiModalModel>> {
        let model = self
            .model
            .get_or_try_init(|| async {
                info!(model = %self.name, "loading model");
                let loaded = (self.loader)().await;
                match &loaded {
                    Ok(_) => info!(model = %self.name, "model loaded"),
                    Err(e) => error!(model = %self.name, "model load failed: {e:#}"),
                }
                loaded
            })
            .await?;
        Ok(model.clone())
    }
}

impl std::fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelHandle")
            .field("name", &self.name)
            .field("loaded", &self.is_loaded())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockModel;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_share_one_load() -> Result<()> {
        let loads = Arc::new(AtomicUsize::new(0));
        let counter = loads.clone();
        let handle = Arc::new(ModelHandle::from_fn("mock", move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(Arc::new(MockModel::new()) as Arc<dyn MultiModalModel>)
            }
        }));

        let callers: Vec<_> = (0..8)
            .map(|_| {
                let handle = handle.clone();
                tokio::spawn(async move { handle.ensure_loaded().await.map(|_| ()) })
            })
            .collect();
        for caller in callers {
            caller.await??;
        }

        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert!(handle.is_loaded());
        Ok(())
    }

    #[tokio::test]
    async fn failed_load_can_be_retried() -> Result<()> {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let handle = ModelHandle::from_fn("flaky", move || {
            let attempt = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt == 0 {
                    anyhow::bail!("weights missing");
                }
                Ok(Arc::new(MockModel::new()) as Arc<dyn MultiModalModel>)
            }
        });

        let err = handle.ensure_loaded().await.err().unwrap();
        assert!(err.to_string().contains("weights missing"));
        assert!(!handle.is_loaded());

        handle.ensure_loaded().await?;
        assert!(handle.is_loaded());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[tokio::test]
    async fn preloaded_handle_never_calls_the_loader() -> Result<()> {
        let handle = ModelHandle::loaded("mock", Arc::new(MockModel::new()));
        assert!(handle.is_loaded());
        assert_eq!(handle.ensure_loaded().await?.pad_id(), 0);
        Ok(())
    }
}
