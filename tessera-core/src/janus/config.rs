use serde::Deserialize;

/// The subset of a Janus `config.json` needed to rebuild the generation path.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub language_config: LanguageConfig,
    #[serde(default)]
    pub gen_head_config: ComponentConfig<GenHeadParams>,
    #[serde(default)]
    pub gen_aligner_config: ComponentConfig<AlignerParams>,
    #[serde(default)]
    pub gen_vision_config: ComponentConfig<GenVisionParams>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LanguageConfig {
    #[serde(default = "default_hidden_size")]
    pub hidden_size: usize,
    #[serde(default = "default_intermediate_size")]
    pub intermediate_size: usize,
    #[serde(default = "default_num_hidden_layers")]
    pub num_hidden_layers: usize,
    #[serde(default = "default_num_attention_heads")]
    pub num_attention_heads: usize,
    pub num_key_value_heads: Option<usize>,
    #[serde(default = "default_vocab_size")]
    pub vocab_size: usize,
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f64,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
}

impl LanguageConfig {
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    pub fn num_kv_heads(&self) -> usize {
        self.num_key_value_heads.unwrap_or(self.num_attention_heads)
    }
}

/// Janus wraps every sub-model config as `{ "cls": ..., "params": { ... } }`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ComponentConfig<P> {
    #[serde(default)]
    pub params: P,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GenHeadParams {
    pub n_embed: usize,
    pub image_token_embed: usize,
    pub image_token_size: usize,
}

impl Default for GenHeadParams {
    fn default() -> Self {
        Self {
            n_embed: 2048,
            image_token_embed: 2048,
            image_token_size: 16384,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AlignerParams {
    pub input_dim: usize,
    pub n_embed: usize,
    #[serde(default = "default_depth")]
    pub depth: usize,
}

impl Default for AlignerParams {
    fn default() -> Self {
        Self {
            input_dim: 8,
            n_embed: 2048,
            depth: 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GenVisionParams {
    pub image_token_size: usize,
    pub n_embed: usize,
}

impl Default for GenVisionParams {
    fn default() -> Self {
        Self {
            image_token_size: 16384,
            n_embed: 8,
        }
    }
}

/// Architecture of the VQ image tokenizer's decoder.
#[derive(Debug, Clone)]
pub struct VqConfig {
    pub codebook_size: usize,
    pub codebook_embed_dim: usize,
    pub codebook_l2_norm: bool,
    pub z_channels: usize,
    pub ch: usize,
    pub ch_mult: Vec<usize>,
    pub num_res_blocks: usize,
    pub out_channels: usize,
    pub num_groups: usize,
}

impl VqConfig {
    pub fn vq_16(vision: &GenVisionParams) -> Self {
        Self {
            codebook_size: vision.image_token_size,
            codebook_embed_dim: vision.n_embed,
            codebook_l2_norm: true,
            z_channels: 256,
            ch: 128,
            ch_mult: vec![1, 1, 2, 2, 4],
            num_res_blocks: 2,
            out_channels: 3,
            num_groups: 32,
        }
    }

    /// Spatial upsampling between the code grid and the output image.
    pub fn upsample_factor(&self) -> usize {
        1 << (self.ch_mult.len() - 1)
    }
}

fn default_hidden_size() -> usize {
    2048
}
fn default_intermediate_size() -> usize {
    5632
}
fn default_num_hidden_layers() -> usize {
    24
}
fn default_num_attention_heads() -> usize {
    16
}
fn default_vocab_size() -> usize {
    102400
}
fn default_max_position_embeddings() -> usize {
    16384
}
fn default_rms_norm_eps() -> f64 {
    1e-6
}
fn default_rope_theta() -> f64 {
    10000.0
}
fn default_depth() -> usize {
    2
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nested_component_configs() {
        let raw = r#"{
            "language_config": {"hidden_size": 2048, "num_hidden_layers": 24, "vocab_size": 102400},
            "gen_head_config": {"cls": "vision_head", "params": {"image_token_embed": 2048, "image_token_size": 16384, "n_embed": 2048}},
            "gen_aligner_config": {"cls": "MlpProjector", "params": {"depth": 2, "input_dim": 8, "n_embed": 2048, "projector_type": "mlp_gelu"}},
            "gen_vision_config": {"cls": "VQ-16", "params": {"image_token_size": 16384, "n_embed": 8}},
            "model_type": "multi_modality"
        }"#;
        let config: Config = serde_json::from_str(raw).unwrap();
        assert_eq!(config.language_config.head_dim(), 128);
        assert_eq!(config.language_config.num_kv_heads(), 16);
        assert_eq!(config.gen_aligner_config.params.input_dim, 8);
        assert_eq!(config.gen_head_config.params.image_token_size, 16384);

        let vq = VqConfig::vq_16(&config.gen_vision_config.params);
        assert_eq!(vq.codebook_embed_dim, 8);
        assert_eq!(vq.upsample_factor(), 16);
    }
}
