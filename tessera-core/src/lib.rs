pub mod cache;
pub mod device_map;
pub mod engine;
pub mod handle;
pub mod loader;
mod loader_factory;
mod util;

mod janus;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use cache::KvCache;
pub use device_map::*;
pub use engine::{Generation, GenerationEngine, NoProgress, Progress, ProgressSink, Stage};
pub use handle::ModelHandle;
pub use janus::{JanusLoader, JanusModel};
pub use loader::*;
pub use loader_factory::*;
pub use util::{decoded_to_image, encode_jpeg, select_best_device, tensor_to_image};

use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};

/// Per-request knobs. Anything left unset falls back to the engine's [`SamplingConfig`].
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Default)]
pub struct GenerationRequest {
    pub prompt: String,
    pub temperature: Option<f64>,
    pub cfg_weight: Option<f64>,
    pub seed: Option<u64>,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq)]
pub struct SamplingConfig {
    pub temperature: f64,
    /// Classifier-free guidance weight.
    pub cfg_weight: f64,
    /// Image tokens sampled per image; always `(image_size / patch_size)^2`.
    pub token_count: usize,
    pub image_size: usize,
    pub patch_size: usize,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            cfg_weight: 5.0,
            token_count: 576,
            image_size: 384,
            patch_size: 16,
        }
    }
}

impl SamplingConfig {
    pub fn grid(&self) -> usize {
        self.image_size / self.patch_size
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.patch_size > 0 && self.image_size % self.patch_size == 0,
            "image size {} is not a multiple of patch size {}",
            self.image_size,
            self.patch_size
        );
        anyhow::ensure!(
            self.token_count == self.grid() * self.grid(),
            "token count {} does not cover a {}x{} grid",
            self.token_count,
            self.grid(),
            self.grid()
        );
        anyhow::ensure!(self.temperature >= 0.0, "temperature must not be negative");
        Ok(())
    }

    pub fn with_request(mut self, request: &GenerationRequest) -> Self {
        if let Some(temperature) = request.temperature {
            self.temperature = temperature;
        }
        if let Some(cfg_weight) = request.cfg_weight {
            self.cfg_weight = cfg_weight;
        }
        self
    }
}

/// The opaque capabilities a multimodal generator exposes to the sampling loop.
///
/// Every tensor argument carries the guidance batch in its first dimension: row 0
/// is the conditional branch, row 1 the unconditional one.
pub trait MultiModalModel: Send + Sync {
    fn device(&self) -> &Device;

    /// Applies the chat template and image-start tag, then tokenizes.
    fn encode_prompt(&self, prompt: &str) -> anyhow::Result<Vec<u32>>;

    /// Token used to blank out the unconditional branch.
    fn pad_id(&self) -> u32;

    fn new_cache(&self) -> KvCache;

    /// `(batch, seq)` token ids to `(batch, seq, hidden)` input embeddings.
    fn embed_tokens(&self, tokens: &Tensor) -> anyhow::Result<Tensor>;

    /// One decoder pass over `(batch, seq, hidden)` embeddings, extending `cache` by `seq` positions.
    fn forward_step(&self, embeds: &Tensor, cache: &mut KvCache) -> anyhow::Result<Tensor>;

    /// `(batch, hidden)` to `(batch, image_vocab)` logits.
    fn gen_head(&self, hidden: &Tensor) -> anyhow::Result<Tensor>;

    /// `(batch,)` image token ids to `(batch, hidden)` embeddings for the next step.
    fn embed_image_tokens(&self, tokens: &Tensor) -> anyhow::Result<Tensor>;

    /// `(1, token_count)` codes to `(1, 3, height, width)` pixels in `[-1, 1]`.
    /// `shape` is the code layout `[batch, channels, grid, grid]`.
    fn decode_image(&self, codes: &Tensor, shape: [usize; 4]) -> anyhow::Result<Tensor>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_geometry_is_consistent() {
        let config = SamplingConfig::default();
        assert_eq!(config.grid(), 24);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_inconsistent_geometry() {
        let config = SamplingConfig {
            image_size: 380,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = SamplingConfig {
            token_count: 100,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn request_overrides_defaults() {
        let request = GenerationRequest {
            temperature: Some(0.5),
            ..GenerationRequest::new("a red cube")
        };
        let config = SamplingConfig::default().with_request(&request);
        assert_eq!(config.temperature, 0.5);
        assert_eq!(config.cfg_weight, 5.0);
    }
}
