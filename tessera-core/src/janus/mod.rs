use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Error, Result};
use candle_core::{Device, Module, Tensor};
use candle_nn::{embedding, linear, Embedding, Linear, VarBuilder};
use hf_hub::api::tokio::{Api, ApiRepo};
use tokenizers::Tokenizer;
use tracing::{debug, info};

mod config;
mod llama;
mod prompt;
mod vq;

use crate::{select_best_device, DeviceMap, KvCache, Loader, ModelVariant, MultiModalModel};
use config::{AlignerParams, Config, GenHeadParams, VqConfig};
use llama::LanguageModel;
use vq::VqDecoder;

const BOS_TAG: &str = "<｜begin▁of▁sentence｜>";

/// Projects language-model hidden states onto the image codebook.
struct GenHead {
    output_mlp_projector: Linear,
    vision_head: Linear,
}

impl GenHead {
    fn new(params: &GenHeadParams, vb: VarBuilder) -> candle_core::Result<Self> {
        Ok(Self {
            output_mlp_projector: linear(
                params.n_embed,
                params.image_token_embed,
                vb.pp("output_mlp_projector"),
            )?,
            vision_head: linear(
                params.image_token_embed,
                params.image_token_size,
                vb.pp("vision_head"),
            )?,
        })
    }
}

impl Module for GenHead {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        xs.apply(&self.output_mlp_projector)?
            .gelu_erf()?
            .apply(&self.vision_head)
    }
}

/// `mlp_gelu` projector lifting codebook embeddings into the language model's width.
struct GenAligner {
    layers: Vec<Linear>,
}

impl GenAligner {
    fn new(params: &AlignerParams, vb: VarBuilder) -> candle_core::Result<Self> {
        let vb = vb.pp("layers");
        let mut layers = vec![linear(params.input_dim, params.n_embed, vb.pp(0))?];
        for i in 1..params.depth {
            layers.push(linear(params.n_embed, params.n_embed, vb.pp(2 * i))?);
        }
        Ok(Self { layers })
    }
}

impl Module for GenAligner {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let mut xs = xs.apply(&self.layers[0])?;
        for layer in &self.layers[1..] {
            xs = xs.gelu_erf()?.apply(layer)?;
        }
        Ok(xs)
    }
}

pub struct JanusModel {
    device: Device,
    tokenizer: Tokenizer,
    bos_id: Option<u32>,
    pad_id: u32,
    language_model: LanguageModel,
    gen_head: GenHead,
    gen_aligner: GenAligner,
    gen_embed: Embedding,
    gen_vision_model: VqDecoder,
}

impl JanusModel {
    pub fn new(config: &Config, tokenizer: Tokenizer, vb: VarBuilder) -> Result<Self> {
        let pad_id = tokenizer
            .token_to_id(prompt::PAD_TAG)
            .with_context(|| format!("tokenizer has no `{}` token", prompt::PAD_TAG))?;
        let bos_id = tokenizer.token_to_id(BOS_TAG);

        let language_model = LanguageModel::new(&config.language_config, vb.pp("language_model"))
            .context("failed to build language model")?;
        let gen_head = GenHead::new(&config.gen_head_config.params, vb.pp("gen_head"))
            .context("failed to build generation head")?;
        let gen_aligner = GenAligner::new(&config.gen_aligner_config.params, vb.pp("gen_aligner"))
            .context("failed to build generation aligner")?;
        let vision = &config.gen_vision_config.params;
        let gen_embed = embedding(vision.image_token_size, vision.n_embed, vb.pp("gen_embed"))
            .context("failed to build generation embedding")?;
        let gen_vision_model = VqDecoder::new(&VqConfig::vq_16(vision), vb.pp("gen_vision_model"))
            .context("failed to build vision decoder")?;

        Ok(Self {
            device: vb.device().clone(),
            tokenizer,
            bos_id,
            pad_id,
            language_model,
            gen_head,
            gen_aligner,
            gen_embed,
            gen_vision_model,
        })
    }
}

impl MultiModalModel for JanusModel {
    fn device(&self) -> &Device {
        &self.device
    }

    fn encode_prompt(&self, user_prompt: &str) -> Result<Vec<u32>> {
        let text = prompt::image_generation_prompt(user_prompt);
        let mut ids = self
            .tokenizer
            .encode(text.as_str(), true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        if let Some(bos) = self.bos_id {
            if ids.first() != Some(&bos) {
                ids.insert(0, bos);
            }
        }
        debug!(tokens = ids.len(), "encoded prompt");
        Ok(ids)
    }

    fn pad_id(&self) -> u32 {
        self.pad_id
    }

    fn new_cache(&self) -> KvCache {
        KvCache::new(self.language_model.num_layers())
    }

    fn embed_tokens(&self, tokens: &Tensor) -> Result<Tensor> {
        Ok(self.language_model.embed(tokens)?)
    }

    fn forward_step(&self, embeds: &Tensor, cache: &mut KvCache) -> Result<Tensor> {
        Ok(self.language_model.forward_embeds(embeds, cache)?)
    }

    fn gen_head(&self, hidden: &Tensor) -> Result<Tensor> {
        Ok(self.gen_head.forward(hidden)?)
    }

    fn embed_image_tokens(&self, tokens: &Tensor) -> Result<Tensor> {
        Ok(tokens.apply(&self.gen_embed)?.apply(&self.gen_aligner)?)
    }

    fn decode_image(&self, codes: &Tensor, shape: [usize; 4]) -> Result<Tensor> {
        Ok(self.gen_vision_model.decode_code(codes, shape)?)
    }
}

enum WeightFiles {
    Safetensors(Vec<PathBuf>),
    Pickle(PathBuf),
}

fn shard_names(index: &Path) -> Result<BTreeSet<String>> {
    let raw = std::fs::read_to_string(index).context("failed to read weight index")?;
    let index: serde_json::Value = serde_json::from_str(&raw).context("failed to parse weight index")?;
    let weight_map = index
        .get("weight_map")
        .and_then(|m| m.as_object())
        .context("weight index has no `weight_map`")?;
    Ok(weight_map
        .values()
        .filter_map(|file| file.as_str().map(str::to_string))
        .collect())
}

async fn fetch_weights(repo: &ApiRepo) -> Result<WeightFiles> {
    if let Ok(path) = repo.get("model.safetensors").await {
        return Ok(WeightFiles::Safetensors(vec![path]));
    }
    if let Ok(index) = repo.get("model.safetensors.index.json").await {
        let mut paths = Vec::new();
        for shard in shard_names(&index)? {
            let path = repo
                .get(&shard)
                .await
                .with_context(|| format!("failed to get weight shard {shard}"))?;
            paths.push(path);
        }
        return Ok(WeightFiles::Safetensors(paths));
    }
    let path = repo
        .get("pytorch_model.bin")
        .await
        .context("no safetensors or single-file pytorch weights found")?;
    Ok(WeightFiles::Pickle(path))
}

pub struct JanusLoader;

impl Loader for JanusLoader {
    type Model = JanusModel;

    async fn load(variant: ModelVariant, api: Api, device_map: DeviceMap) -> Result<Self::Model> {
        let device = select_best_device(device_map).context("failed to set up device")?;
        let dtype = device.bf16_default_to_f32();

        let repo = api.model(variant.repo_id().to_string());
        let config_filename = repo
            .get("config.json")
            .await
            .context("failed to get Janus config")?;
        let tokenizer_filename = repo
            .get("tokenizer.json")
            .await
            .context("failed to get Janus tokenizer")?;
        let weights = fetch_weights(&repo).await?;

        let config_str =
            std::fs::read_to_string(&config_filename).context("failed to read Janus config")?;
        let config: Config =
            serde_json::from_str(&config_str).context("failed to parse Janus config")?;
        let tokenizer = Tokenizer::from_file(tokenizer_filename)
            .map_err(Error::msg)
            .context("failed to load Janus tokenizer")?;

        let vb = match weights {
            WeightFiles::Safetensors(paths) => unsafe {
                VarBuilder::from_mmaped_safetensors(&paths, dtype, &device)
                    .context("failed to build Janus var builder")?
            },
            WeightFiles::Pickle(path) => VarBuilder::from_pth(&path, dtype, &device)
                .context("failed to build Janus var builder from pickle")?,
        };
        let model = JanusModel::new(&config, tokenizer, vb)?;
        info!(?variant, ?dtype, "Janus model ready");
        Ok(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lists_unique_shards_from_index() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let index = dir.path().join("model.safetensors.index.json");
        std::fs::write(
            &index,
            r#"{"weight_map": {"a": "model-00001-of-00002.safetensors", "b": "model-00002-of-00002.safetensors", "c": "model-00001-of-00002.safetensors"}}"#,
        )?;
        let shards = shard_names(&index)?;
        assert_eq!(
            shards.into_iter().collect::<Vec<_>>(),
            vec![
                "model-00001-of-00002.safetensors".to_string(),
                "model-00002-of-00002.safetensors".to_string()
            ]
        );
        Ok(())
    }

    #[test]
    fn aligner_and_head_shapes() -> candle_core::Result<()> {
        let vb = VarBuilder::zeros(candle_core::DType::F32, &Device::Cpu);
        let aligner = GenAligner::new(
            &AlignerParams {
                input_dim: 8,
                n_embed: 16,
                depth: 2,
            },
            vb.pp("gen_aligner"),
        )?;
        let head = GenHead::new(
            &GenHeadParams {
                n_embed: 16,
                image_token_embed: 16,
                image_token_size: 64,
            },
            vb.pp("gen_head"),
        )?;
        let xs = Tensor::zeros((2, 8), candle_core::DType::F32, &Device::Cpu)?;
        let hidden = aligner.forward(&xs)?;
        assert_eq!(hidden.dims(), &[2, 16]);
        assert_eq!(head.forward(&hidden)?.dims(), &[2, 64]);
        Ok(())
    }
}
