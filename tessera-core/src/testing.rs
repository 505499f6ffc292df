//! Instrumented stand-in for a real model, used by this crate's tests and the server's.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use candle_core::{DType, Device, Tensor};

use crate::{KvCache, MultiModalModel, Progress, ProgressSink};

pub const MOCK_VOCAB: usize = 16;
pub const MOCK_HIDDEN: usize = 4;
pub const MOCK_PAD_ID: u32 = 0;
pub const MOCK_BOS_ID: u32 = 1;
pub const MOCK_EOS_ID: u32 = 15;
/// Pixels per code along each axis of the decoded image.
pub const MOCK_UPSAMPLE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepRecord {
    pub input_len: usize,
    pub cache_offset: usize,
}

#[derive(Debug, Default)]
pub struct MockStats {
    forward_calls: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
    steps: Mutex<Vec<StepRecord>>,
    prompt_rows: Mutex<Vec<Vec<u32>>>,
    decoded_codes: Mutex<Vec<u32>>,
}

impl MockStats {
    pub fn forward_calls(&self) -> usize {
        self.forward_calls.load(Ordering::SeqCst)
    }

    /// Highest number of threads seen inside `forward_step` at once.
    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    /// Steps of the most recent run.
    pub fn steps(&self) -> Vec<StepRecord> {
        self.steps.lock().unwrap().clone()
    }

    pub fn prompt_rows(&self) -> Vec<Vec<u32>> {
        self.prompt_rows.lock().unwrap().clone()
    }

    pub fn decoded_codes(&self) -> Vec<u32> {
        self.decoded_codes.lock().unwrap().clone()
    }
}

struct ActiveGuard<'a>(&'a MockStats);

impl<'a> ActiveGuard<'a> {
    fn enter(stats: &'a MockStats) -> Self {
        let now = stats.active.fetch_add(1, Ordering::SeqCst) + 1;
        stats.max_active.fetch_max(now, Ordering::SeqCst);
        Self(stats)
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct MockModel {
    device: Device,
    cond_logits: Vec<f32>,
    uncond_logits: Vec<f32>,
    step_delay: Duration,
    fail_decode: bool,
    stats: Arc<MockStats>,
}

impl Default for MockModel {
    fn default() -> Self {
        Self::new()
    }
}

impl MockModel {
    pub fn new() -> Self {
        let mut cond = vec![0f32; MOCK_VOCAB];
        cond[2] = 1.0;
        cond[7] = 0.5;
        Self::with_logits(cond, vec![0f32; MOCK_VOCAB])
    }

    /// Fixed per-row logits returned by `gen_head` at every step.
    pub fn with_logits(cond_logits: Vec<f32>, uncond_logits: Vec<f32>) -> Self {
        assert_eq!(cond_logits.len(), MOCK_VOCAB);
        assert_eq!(uncond_logits.len(), MOCK_VOCAB);
        Self {
            device: Device::Cpu,
            cond_logits,
            uncond_logits,
            step_delay: Duration::ZERO,
            fail_decode: false,
            stats: Arc::default(),
        }
    }

    /// Sleeps inside every forward step so overlapping runs would be observable.
    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = delay;
        self
    }

    pub fn failing_decode(mut self) -> Self {
        self.fail_decode = true;
        self
    }

    pub fn stats(&self) -> Arc<MockStats> {
        self.stats.clone()
    }
}

impl MultiModalModel for MockModel {
    fn device(&self) -> &Device {
        &self.device
    }

    fn encode_prompt(&self, prompt: &str) -> Result<Vec<u32>> {
        let mut ids = vec![MOCK_BOS_ID];
        ids.extend(prompt.bytes().map(|b| 2 + u32::from(b) % 13));
        ids.push(MOCK_EOS_ID);
        Ok(ids)
    }

    fn pad_id(&self) -> u32 {
        MOCK_PAD_ID
    }

    fn new_cache(&self) -> KvCache {
        KvCache::new(1)
    }

    fn embed_tokens(&self, tokens: &Tensor) -> Result<Tensor> {
        let (batch, seq_len) = tokens.dims2()?;
        *self.stats.prompt_rows.lock().unwrap() = tokens.to_vec2::<u32>()?;
        self.stats.steps.lock().unwrap().clear();
        Ok(Tensor::zeros((batch, seq_len, MOCK_HIDDEN), DType::F32, &self.device)?)
    }

    fn forward_step(&self, embeds: &Tensor, cache: &mut KvCache) -> Result<Tensor> {
        let _active = ActiveGuard::enter(&self.stats);
        self.stats.forward_calls.fetch_add(1, Ordering::SeqCst);
        let (_, seq_len, _) = embeds.dims3()?;
        self.stats.steps.lock().unwrap().push(StepRecord {
            input_len: seq_len,
            cache_offset: cache.offset(),
        });
        if !self.step_delay.is_zero() {
            std::thread::sleep(self.step_delay);
        }
        cache.advance(seq_len);
        Ok(embeds.clone())
    }

    fn gen_head(&self, hidden: &Tensor) -> Result<Tensor> {
        let (batch, _) = hidden.dims2()?;
        if batch != 2 {
            bail!("expected a conditional/unconditional pair, got batch {batch}");
        }
        let logits = [self.cond_logits.as_slice(), self.uncond_logits.as_slice()].concat();
        Ok(Tensor::from_vec(logits, (2, MOCK_VOCAB), &self.device)?)
    }

    fn embed_image_tokens(&self, tokens: &Tensor) -> Result<Tensor> {
        let batch = tokens.dim(0)?;
        Ok(Tensor::zeros((batch, MOCK_HIDDEN), DType::F32, &self.device)?)
    }

    fn decode_image(&self, codes: &Tensor, shape: [usize; 4]) -> Result<Tensor> {
        if self.fail_decode {
            bail!("mock decode failure");
        }
        *self.stats.decoded_codes.lock().unwrap() = codes.flatten_all()?.to_vec1::<u32>()?;
        let [batch, _, h, w] = shape;
        Ok(Tensor::zeros(
            (batch, 3, h * MOCK_UPSAMPLE, w * MOCK_UPSAMPLE),
            DType::F32,
            &self.device,
        )?)
    }
}

#[derive(Debug, Default)]
pub struct RecordingSink {
    updates: Mutex<Vec<Progress>>,
}

impl RecordingSink {
    pub fn updates(&self) -> Vec<Progress> {
        self.updates.lock().unwrap().clone()
    }
}

impl ProgressSink for RecordingSink {
    fn report(&self, progress: Progress) {
        self.updates.lock().unwrap().push(progress);
    }
}
