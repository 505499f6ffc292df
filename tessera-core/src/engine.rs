//! Autoregressive image-token sampling with classifier-free guidance.
//!
//! A run feeds a two-row batch through the model: row 0 carries the real prompt,
//! row 1 the same prompt with everything but its first and last token blanked out.
//! Each step blends the two rows' logits, draws one image token, and feeds that
//! token back into both rows. After a fixed number of steps the collected codes are
//! decoded into pixels.

use anyhow::{anyhow, Result};
use candle_core::{DType, IndexOp, Tensor};
use candle_transformers::generation::LogitsProcessor;
use image::DynamicImage;
use tracing::{debug, info};

use crate::{decoded_to_image, GenerationRequest, MultiModalModel, SamplingConfig};

/// Channels of the VQ latent the image codes index into.
pub const LATENT_CHANNELS: usize = 8;

/// Share of overall task progress covered by the sampling loop.
pub const GENERATION_PROGRESS: (u8, u8) = (15, 85);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Preparing,
    Tokenizing,
    Generating,
    Decoding,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Progress {
    pub stage: Stage,
    pub percent: u8,
    pub message: String,
}

impl Progress {
    fn new(stage: Stage, percent: u8, message: impl Into<String>) -> Self {
        Self {
            stage,
            percent,
            message: message.into(),
        }
    }
}

pub trait ProgressSink: Send + Sync {
    fn report(&self, progress: Progress);
}

/// Discards progress; used when nobody is polling.
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn report(&self, _progress: Progress) {}
}

/// Emits a progress value only once the loop has moved at least five points further.
#[derive(Debug, Default)]
struct ProgressThrottle {
    last_reported: usize,
}

impl ProgressThrottle {
    fn tick(&mut self, step: usize, total: usize) -> Option<u8> {
        let phase = 100 * step / total;
        if phase <= self.last_reported + 4 {
            return None;
        }
        self.last_reported = phase;
        let (start, end) = GENERATION_PROGRESS;
        Some(start + ((end - start) as usize * step / total) as u8)
    }
}

/// Conditional row, then the unconditional row with its interior replaced by `pad_id`.
pub fn guidance_rows(ids: &[u32], pad_id: u32) -> [Vec<u32>; 2] {
    let mut uncond = ids.to_vec();
    let len = uncond.len();
    if len > 2 {
        uncond[1..len - 1].fill(pad_id);
    }
    [ids.to_vec(), uncond]
}

/// `uncond + w * (cond - uncond)` over a `(2, vocab)` logits batch.
pub fn guided_logits(logits: &Tensor, cfg_weight: f64) -> candle_core::Result<Tensor> {
    let logits = logits.to_dtype(DType::F32)?;
    let cond = logits.i(0)?;
    let uncond = logits.i(1)?;
    cond.sub(&uncond)?.affine(cfg_weight, 0.0)?.add(&uncond)
}

fn random_seed() -> Result<u64> {
    let mut buf = [0u8; 8];
    getrandom::getrandom(&mut buf).map_err(|e| anyhow!("failed to draw a sampling seed: {e}"))?;
    Ok(u64::from_le_bytes(buf))
}

#[derive(Debug, Clone)]
pub struct Generation {
    pub image: DynamicImage,
    /// Sampled image codes in position order.
    pub tokens: Vec<u32>,
    pub seed: u64,
}

#[derive(Debug, Clone, Default)]
pub struct GenerationEngine {
    defaults: SamplingConfig,
}

impl GenerationEngine {
    pub fn new(defaults: SamplingConfig) -> Result<Self> {
        defaults.validate()?;
        Ok(Self { defaults })
    }

    pub fn run(
        &self,
        model: &dyn MultiModalModel,
        request: &GenerationRequest,
        sink: &dyn ProgressSink,
    ) -> Result<Generation> {
        let config = self.defaults.with_request(request);
        config.validate()?;
        let seed = match request.seed {
            Some(seed) => seed,
            None => random_seed()?,
        };
        info!(
            seed,
            temperature = config.temperature,
            cfg_weight = config.cfg_weight,
            tokens = config.token_count,
            "starting generation"
        );

        sink.report(Progress::new(Stage::Preparing, 5, "Preparing prompt"));
        sink.report(Progress::new(Stage::Tokenizing, 10, "Tokenizing input"));
        let ids = model.encode_prompt(&request.prompt)?;
        let device = model.device();
        let [cond, uncond] = guidance_rows(&ids, model.pad_id());
        let tokens = Tensor::from_vec([cond, uncond].concat(), (2, ids.len()), device)?;

        sink.report(Progress::new(
            Stage::Generating,
            GENERATION_PROGRESS.0,
            "Starting token generation",
        ));
        let mut embeds = model.embed_tokens(&tokens)?;
        let mut processor = LogitsProcessor::new(seed, Some(config.temperature), None);
        let mut throttle = ProgressThrottle::default();
        let mut generated = Vec::with_capacity(config.token_count);
        let mut cache = model.new_cache();

        for step in 0..config.token_count {
            if let Some(percent) = throttle.tick(step, config.token_count) {
                debug!(step, total = config.token_count, percent, "generating");
                sink.report(Progress::new(
                    Stage::Generating,
                    percent,
                    format!("Generating token {step}/{}", config.token_count),
                ));
            }

            let hidden = model.forward_step(&embeds, &mut cache)?;
            let last = hidden.i((.., hidden.dim(1)? - 1, ..))?;
            let logits = model.gen_head(&last)?;
            let token = processor.sample(&guided_logits(&logits, config.cfg_weight)?)?;
            generated.push(token);

            let next = Tensor::new(&[token, token], device)?;
            embeds = model.embed_image_tokens(&next)?.unsqueeze(1)?;
        }

        sink.report(Progress::new(
            Stage::Decoding,
            GENERATION_PROGRESS.1,
            "Decoding image",
        ));
        let grid = config.grid();
        let codes = Tensor::new(generated.as_slice(), device)?.unsqueeze(0)?;
        let decoded = model.decode_image(&codes, [1, LATENT_CHANNELS, grid, grid])?;
        let image = decoded_to_image(&decoded)?;
        info!(width = image.width(), height = image.height(), "decoded image");

        Ok(Generation {
            image,
            tokens: generated,
            seed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockModel, RecordingSink, StepRecord, MOCK_PAD_ID, MOCK_VOCAB};
    use candle_core::Device;

    fn small_engine(image_size: usize) -> GenerationEngine {
        let grid = image_size / 16;
        GenerationEngine::new(SamplingConfig {
            token_count: grid * grid,
            image_size,
            ..Default::default()
        })
        .unwrap()
    }

    fn seeded(prompt: &str, seed: u64) -> GenerationRequest {
        GenerationRequest {
            seed: Some(seed),
            ..GenerationRequest::new(prompt)
        }
    }

    #[test]
    fn samples_exactly_token_count_and_threads_the_cache() -> Result<()> {
        let model = MockModel::new();
        let stats = model.stats();
        let engine = small_engine(64);

        let generation = engine.run(&model, &seeded("a red cube", 7), &NoProgress)?;
        assert_eq!(generation.tokens.len(), 16);
        assert_eq!(generation.seed, 7);
        assert_eq!((generation.image.width(), generation.image.height()), (64, 64));

        let prompt_len = model.encode_prompt("a red cube")?.len();
        let steps = stats.steps();
        assert_eq!(steps.len(), 16);
        assert_eq!(
            steps[0],
            StepRecord {
                input_len: prompt_len,
                cache_offset: 0
            }
        );
        for (i, step) in steps.iter().enumerate().skip(1) {
            assert_eq!(
                *step,
                StepRecord {
                    input_len: 1,
                    cache_offset: prompt_len + i - 1
                }
            );
        }
        assert_eq!(stats.decoded_codes(), generation.tokens);
        Ok(())
    }

    #[test]
    fn unconditional_row_keeps_only_the_ends() -> Result<()> {
        let model = MockModel::new();
        let stats = model.stats();
        small_engine(64).run(&model, &seeded("a red cube", 1), &NoProgress)?;

        let ids = model.encode_prompt("a red cube")?;
        let rows = stats.prompt_rows();
        assert_eq!(rows[0], ids);
        assert_eq!(rows[1][0], ids[0]);
        assert_eq!(rows[1][ids.len() - 1], ids[ids.len() - 1]);
        assert!(rows[1][1..ids.len() - 1].iter().all(|&t| t == MOCK_PAD_ID));
        Ok(())
    }

    #[test]
    fn guidance_rows_leave_short_prompts_alone() {
        assert_eq!(guidance_rows(&[4, 5], 0), [vec![4, 5], vec![4, 5]]);
        assert_eq!(guidance_rows(&[4, 5, 6, 7], 0), [vec![4, 5, 6, 7], vec![4, 0, 0, 7]]);
    }

    #[test]
    fn progress_is_banded_throttled_and_monotonic() -> Result<()> {
        let model = MockModel::new();
        let sink = RecordingSink::default();
        GenerationEngine::default().run(&model, &seeded("a lighthouse", 3), &sink)?;

        let updates = sink.updates();
        assert_eq!(updates.first().map(|p| (p.stage, p.percent)), Some((Stage::Preparing, 5)));
        assert_eq!(updates[1].stage, Stage::Tokenizing);
        assert_eq!(updates.last().map(|p| (p.stage, p.percent)), Some((Stage::Decoding, 85)));
        assert!(updates.windows(2).all(|w| w[0].percent <= w[1].percent));
        assert!(updates.windows(2).all(|w| w[0].stage <= w[1].stage));

        let generating: Vec<_> = updates
            .iter()
            .filter(|p| p.stage == Stage::Generating)
            .collect();
        // the start marker plus one update per five points of the 576-step loop
        assert_eq!(generating.len(), 20);
        assert!(generating.iter().all(|p| (15..85).contains(&p.percent)));
        Ok(())
    }

    #[test]
    fn throttle_reports_every_five_points() {
        let mut throttle = ProgressThrottle::default();
        let reported: Vec<u8> = (0..576).filter_map(|i| throttle.tick(i, 576)).collect();
        assert_eq!(reported.len(), 19);
        assert_eq!(reported[0], 18);
        assert!(reported.iter().all(|p| (15..85).contains(p)));
    }

    #[test]
    fn blends_conditional_and_unconditional_logits() -> candle_core::Result<()> {
        let logits = Tensor::new(&[[2f32, 0.0], [1.0, 1.0]], &Device::Cpu)?;
        assert_eq!(guided_logits(&logits, 5.0)?.to_vec1::<f32>()?, vec![6.0, -4.0]);
        assert_eq!(guided_logits(&logits, 1.0)?.to_vec1::<f32>()?, vec![2.0, 0.0]);
        assert_eq!(guided_logits(&logits, 0.0)?.to_vec1::<f32>()?, vec![1.0, 1.0]);
        Ok(())
    }

    #[test]
    fn guidance_steers_greedy_choice() -> Result<()> {
        let mut cond = vec![0f32; MOCK_VOCAB];
        let mut uncond = vec![0f32; MOCK_VOCAB];
        cond[3] = 1.0;
        uncond[5] = 2.0;
        let model = MockModel::with_logits(cond, uncond);
        let request = GenerationRequest {
            temperature: Some(0.0),
            ..seeded("a tree", 11)
        };
        let generation = small_engine(64).run(&model, &request, &NoProgress)?;
        assert!(generation.tokens.iter().all(|&t| t == 3));
        Ok(())
    }

    #[test]
    fn sampling_is_stochastic_rather_than_argmax() -> Result<()> {
        let mut cond = vec![0f32; MOCK_VOCAB];
        cond[0] = 1.0;
        cond[1] = 0.5;
        let model = MockModel::with_logits(cond, vec![0f32; MOCK_VOCAB]);
        let request = GenerationRequest {
            temperature: Some(1.0),
            cfg_weight: Some(1.0),
            ..seeded("a river", 42)
        };
        let tokens = small_engine(128).run(&model, &request, &NoProgress)?.tokens;
        assert_eq!(tokens.len(), 64);

        let argmax_hits = tokens.iter().filter(|&&t| t == 0).count();
        let mut distinct = tokens.clone();
        distinct.sort_unstable();
        distinct.dedup();
        assert!(argmax_hits < 32, "argmax drawn {argmax_hits} times out of 64");
        assert!(distinct.len() >= 4);

        let greedy = GenerationRequest {
            temperature: Some(0.0),
            ..request
        };
        let tokens = small_engine(128).run(&model, &greedy, &NoProgress)?.tokens;
        assert!(tokens.iter().all(|&t| t == 0));
        Ok(())
    }

    #[test]
    fn seeded_runs_are_reproducible() -> Result<()> {
        let model = MockModel::new();
        let engine = small_engine(128);
        let first = engine.run(&model, &seeded("a boat", 99), &NoProgress)?;
        let second = engine.run(&model, &seeded("a boat", 99), &NoProgress)?;
        assert_eq!(first.tokens, second.tokens);
        Ok(())
    }

    #[test]
    fn rejects_bad_geometry_before_touching_the_model() {
        let model = MockModel::new();
        let stats = model.stats();
        let engine = GenerationEngine {
            defaults: SamplingConfig {
                token_count: 10,
                ..Default::default()
            },
        };
        assert!(engine.run(&model, &seeded("x", 1), &NoProgress).is_err());
        assert_eq!(stats.forward_calls(), 0);
        assert!(GenerationEngine::new(engine.defaults).is_err());
    }

    #[test]
    fn decoder_failures_propagate() {
        let model = MockModel::new().failing_decode();
        let err = small_engine(64)
            .run(&model, &seeded("x", 1), &NoProgress)
            .unwrap_err();
        assert!(err.to_string().contains("decode"));
    }
}
