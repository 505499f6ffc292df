use candle_core::{Module, Result, Tensor, D};
use candle_nn::{conv2d, group_norm, Conv2d, Conv2dConfig, GroupNorm, VarBuilder};

use super::config::VqConfig;

fn conv3x3(in_channels: usize, out_channels: usize, vb: VarBuilder) -> Result<Conv2d> {
    let cfg = Conv2dConfig {
        padding: 1,
        ..Default::default()
    };
    conv2d(in_channels, out_channels, 3, cfg, vb)
}

fn conv1x1(in_channels: usize, out_channels: usize, vb: VarBuilder) -> Result<Conv2d> {
    conv2d(in_channels, out_channels, 1, Default::default(), vb)
}

fn normalize(channels: usize, num_groups: usize, vb: VarBuilder) -> Result<GroupNorm> {
    group_norm(num_groups, channels, 1e-6, vb)
}

struct ResnetBlock {
    norm1: GroupNorm,
    conv1: Conv2d,
    norm2: GroupNorm,
    conv2: Conv2d,
    nin_shortcut: Option<Conv2d>,
}

impl ResnetBlock {
    fn new(in_channels: usize, out_channels: usize, num_groups: usize, vb: VarBuilder) -> Result<Self> {
        let nin_shortcut = if in_channels != out_channels {
            Some(conv1x1(in_channels, out_channels, vb.pp("nin_shortcut"))?)
        } else {
            None
        };
        Ok(Self {
            norm1: normalize(in_channels, num_groups, vb.pp("norm1"))?,
            conv1: conv3x3(in_channels, out_channels, vb.pp("conv1"))?,
            norm2: normalize(out_channels, num_groups, vb.pp("norm2"))?,
            conv2: conv3x3(out_channels, out_channels, vb.pp("conv2"))?,
            nin_shortcut,
        })
    }
}

impl Module for ResnetBlock {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let h = xs.apply(&self.norm1)?.silu()?.apply(&self.conv1)?;
        let h = h.apply(&self.norm2)?.silu()?.apply(&self.conv2)?;
        match &self.nin_shortcut {
            Some(shortcut) => xs.apply(shortcut)? + h,
            None => xs + h,
        }
    }
}

struct AttnBlock {
    norm: GroupNorm,
    q: Conv2d,
    k: Conv2d,
    v: Conv2d,
    proj_out: Conv2d,
}

impl AttnBlock {
    fn new(channels: usize, num_groups: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            norm: normalize(channels, num_groups, vb.pp("norm"))?,
            q: conv1x1(channels, channels, vb.pp("q"))?,
            k: conv1x1(channels, channels, vb.pp("k"))?,
            v: conv1x1(channels, channels, vb.pp("v"))?,
            proj_out: conv1x1(channels, channels, vb.pp("proj_out"))?,
        })
    }
}

impl Module for AttnBlock {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (b, c, h, w) = xs.dims4()?;
        let normed = xs.apply(&self.norm)?;
        let q = normed
            .apply(&self.q)?
            .reshape((b, c, h * w))?
            .transpose(1, 2)?
            .contiguous()?;
        let k = normed.apply(&self.k)?.reshape((b, c, h * w))?;
        let v = normed.apply(&self.v)?.reshape((b, c, h * w))?;

        let weights = (q.matmul(&k)? * (c as f64).powf(-0.5))?;
        let weights = candle_nn::ops::softmax(&weights, D::Minus1)?;
        let attended = v
            .matmul(&weights.transpose(1, 2)?.contiguous()?)?
            .reshape((b, c, h, w))?
            .apply(&self.proj_out)?;
        xs + attended
    }
}

struct UpBlock {
    res: Vec<ResnetBlock>,
    attn: Vec<AttnBlock>,
    upsample: Option<Conv2d>,
}

impl Module for UpBlock {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mut h = xs.clone();
        for (i, block) in self.res.iter().enumerate() {
            h = h.apply(block)?;
            if let Some(attn) = self.attn.get(i) {
                h = h.apply(attn)?;
            }
        }
        match &self.upsample {
            Some(conv) => {
                let (_, _, height, width) = h.dims4()?;
                h.upsample_nearest2d(height * 2, width * 2)?.apply(conv)
            }
            None => Ok(h),
        }
    }
}

struct Decoder {
    conv_in: Conv2d,
    mid: (ResnetBlock, AttnBlock, ResnetBlock),
    conv_blocks: Vec<UpBlock>,
    norm_out: GroupNorm,
    conv_out: Conv2d,
}

impl Decoder {
    fn new(cfg: &VqConfig, vb: VarBuilder) -> Result<Self> {
        let groups = cfg.num_groups;
        let levels = cfg.ch_mult.len();
        let mut block_in = cfg.ch * cfg.ch_mult[levels - 1];

        let conv_in = conv3x3(cfg.z_channels, block_in, vb.pp("conv_in"))?;
        let vb_mid = vb.pp("mid");
        let mid = (
            ResnetBlock::new(block_in, block_in, groups, vb_mid.pp("0"))?,
            AttnBlock::new(block_in, groups, vb_mid.pp("1"))?,
            ResnetBlock::new(block_in, block_in, groups, vb_mid.pp("2"))?,
        );

        let mut conv_blocks = Vec::with_capacity(levels);
        for level in 0..levels {
            let vb_block = vb.pp("conv_blocks").pp(level);
            let block_out = cfg.ch * cfg.ch_mult[levels - level - 1];
            let mut res = Vec::with_capacity(cfg.num_res_blocks + 1);
            let mut attn = Vec::new();
            for i in 0..=cfg.num_res_blocks {
                res.push(ResnetBlock::new(block_in, block_out, groups, vb_block.pp("res").pp(i))?);
                block_in = block_out;
                // only the coarsest level attends
                if level == 0 {
                    attn.push(AttnBlock::new(block_in, groups, vb_block.pp("attn").pp(i))?);
                }
            }
            let upsample = if level != levels - 1 {
                Some(conv3x3(block_in, block_in, vb_block.pp("upsample").pp("conv"))?)
            } else {
                None
            };
            conv_blocks.push(UpBlock {
                res,
                attn,
                upsample,
            });
        }

        Ok(Self {
            conv_in,
            mid,
            conv_blocks,
            norm_out: normalize(block_in, groups, vb.pp("norm_out"))?,
            conv_out: conv3x3(block_in, cfg.out_channels, vb.pp("conv_out"))?,
        })
    }
}

impl Module for Decoder {
    fn forward(&self, z: &Tensor) -> Result<Tensor> {
        let mut h = z.apply(&self.conv_in)?;
        h = h.apply(&self.mid.0)?.apply(&self.mid.1)?.apply(&self.mid.2)?;
        for block in &self.conv_blocks {
            h = h.apply(block)?;
        }
        h.apply(&self.norm_out)?.silu()?.apply(&self.conv_out)
    }
}

/// Decoder half of the VQ image tokenizer: codebook lookup, post-quant conv, upsampling decoder.
pub struct VqDecoder {
    codebook: Tensor,
    post_quant_conv: Conv2d,
    decoder: Decoder,
    upsample_factor: usize,
}

impl VqDecoder {
    pub fn new(cfg: &VqConfig, vb: VarBuilder) -> Result<Self> {
        let codebook = vb.pp("quantize").pp("embedding").get(
            (cfg.codebook_size, cfg.codebook_embed_dim),
            "weight",
        )?;
        let codebook = if cfg.codebook_l2_norm {
            let norm = codebook.sqr()?.sum_keepdim(1)?.sqrt()?.affine(1.0, 1e-12)?;
            codebook.broadcast_div(&norm)?
        } else {
            codebook
        };
        Ok(Self {
            codebook,
            post_quant_conv: conv1x1(cfg.codebook_embed_dim, cfg.z_channels, vb.pp("post_quant_conv"))?,
            decoder: Decoder::new(cfg, vb.pp("decoder"))?,
            upsample_factor: cfg.upsample_factor(),
        })
    }

    pub fn upsample_factor(&self) -> usize {
        self.upsample_factor
    }

    /// `codes` of any shape holding `b * h * w` indices; `shape` is `[b, c, h, w]` of the latent.
    pub fn decode_code(&self, codes: &Tensor, shape: [usize; 4]) -> Result<Tensor> {
        let [b, c, h, w] = shape;
        let latent = self
            .codebook
            .index_select(&codes.flatten_all()?, 0)?
            .reshape((b, h, w, c))?
            .permute((0, 3, 1, 2))?
            .contiguous()?;
        latent.apply(&self.post_quant_conv)?.apply(&self.decoder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn decodes_code_grid_to_upsampled_pixels() -> Result<()> {
        let cfg = VqConfig {
            codebook_size: 64,
            codebook_embed_dim: 8,
            codebook_l2_norm: true,
            z_channels: 32,
            ch: 32,
            ch_mult: vec![1, 2],
            num_res_blocks: 1,
            out_channels: 3,
            num_groups: 8,
        };
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let decoder = VqDecoder::new(&cfg, vb)?;
        assert_eq!(decoder.upsample_factor(), 2);

        let codes = Tensor::arange(0u32, 16, &Device::Cpu)?.reshape((1, 16))?;
        let pixels = decoder.decode_code(&codes, [1, 8, 4, 4])?;
        assert_eq!(pixels.dims(), &[1, 3, 8, 8]);
        Ok(())
    }
}
