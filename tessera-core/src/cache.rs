use candle_core::{Result, Tensor};

/// Key/value tensors accumulated across autoregressive steps.
///
/// A fresh cache is created for every generation run and threaded through each
/// step, so step `i` only feeds the newest position instead of the whole sequence.
#[derive(Debug, Clone, Default)]
pub struct KvCache {
    layers: Vec<Option<(Tensor, Tensor)>>,
    offset: usize,
}

impl KvCache {
    pub fn new(num_layers: usize) -> Self {
        Self {
            layers: vec![None; num_layers],
            offset: 0,
        }
    }

    /// Number of positions already stored.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Appends `k`/`v` (shape `(batch, heads, seq, head_dim)`) for `layer` and returns the full history.
    pub fn append(&mut self, layer: usize, k: &Tensor, v: &Tensor) -> Result<(Tensor, Tensor)> {
        let slot = self
            .layers
            .get_mut(layer)
            .ok_or_else(|| candle_core::Error::msg(format!("no cache slot for layer {layer}")))?;
        let (k, v) = match slot.take() {
            Some((prev_k, prev_v)) => (
                Tensor::cat(&[&prev_k, k], 2)?,
                Tensor::cat(&[&prev_v, v], 2)?,
            ),
            None => (k.clone(), v.clone()),
        };
        *slot = Some((k.clone(), v.clone()));
        Ok((k, v))
    }

    /// Marks `seq_len` new positions as consumed once every layer has appended them.
    pub fn advance(&mut self, seq_len: usize) {
        self.offset += seq_len;
    }
}
