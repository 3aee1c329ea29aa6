//! # Reference Recurrent Transducer
//!
//! A stacked Elman network that maps each position's flattened pileup column
//! to base and run-length logits:
//!
//! ```text
//! h[l]   = tanh(W_in[l] · x[l] + b[l] + W_hh[l] · h[l])    x[0] = column, x[l+1] = h[l]
//! base   = W_base · h[top] + b_base
//! rle    = W_rle  · h[top] + b_rle
//! ```
//!
//! There is one layer per hidden-state slot (`recurrent_depth`), so the
//! carry returned after the last position of a window is exactly the
//! `[batch × depth × hidden]` state the next window starts from.

use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::data::tensor::Tensor3;
use crate::error::{PolishError, Result};
use crate::model::{HiddenState, ModelArch, ModelMeta, SequenceModel, StepOutput};

/// Affine map `y = W · x + b`, `W` row-major `[rows × cols]`
#[derive(Clone, Debug, PartialEq)]
pub struct Linear {
    rows: usize,
    cols: usize,
    weight: Vec<f32>,
    bias: Vec<f32>,
}

impl Linear {
    pub fn new(rows: usize, cols: usize, weight: Vec<f32>, bias: Vec<f32>) -> Result<Self> {
        if weight.len() != rows * cols || bias.len() != rows {
            return Err(PolishError::invalid_data(format!(
                "linear layer {}x{} got {} weights and {} biases",
                rows,
                cols,
                weight.len(),
                bias.len()
            )));
        }
        Ok(Self {
            rows,
            cols,
            weight,
            bias,
        })
    }

    fn random(rows: usize, cols: usize, rng: &mut StdRng) -> Self {
        let bound = 1.0 / (cols.max(1) as f32).sqrt();
        Self {
            rows,
            cols,
            weight: (0..rows * cols).map(|_| rng.gen_range(-bound..bound)).collect(),
            bias: (0..rows).map(|_| rng.gen_range(-bound..bound)).collect(),
        }
    }

    /// `out = W · x + b`
    #[inline]
    fn apply(&self, x: &[f32], out: &mut [f32]) {
        debug_assert_eq!(x.len(), self.cols);
        for (r, o) in out.iter_mut().enumerate().take(self.rows) {
            let w = &self.weight[r * self.cols..(r + 1) * self.cols];
            *o = self.bias[r] + dot(w, x);
        }
    }

    pub fn weight(&self) -> &[f32] {
        &self.weight
    }

    pub fn bias(&self) -> &[f32] {
        &self.bias
    }
}

#[inline]
fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// One tanh recurrent layer
#[derive(Clone, Debug, PartialEq)]
pub struct RecurrentLayer {
    input: Linear,
    /// `[hidden × hidden]`
    recurrent: Vec<f32>,
}

impl RecurrentLayer {
    pub fn new(input: Linear, recurrent: Vec<f32>) -> Result<Self> {
        if recurrent.len() != input.rows * input.rows {
            return Err(PolishError::invalid_data(format!(
                "recurrent matrix has {} values for hidden size {}",
                recurrent.len(),
                input.rows
            )));
        }
        Ok(Self { input, recurrent })
    }

    /// `h <- tanh(W_in · x + b + W_hh · h)`, with `scratch` of hidden size
    #[inline]
    fn update(&self, x: &[f32], h: &mut [f32], scratch: &mut [f32]) {
        let n = self.input.rows;
        self.input.apply(x, scratch);
        for (r, s) in scratch.iter_mut().enumerate() {
            *s += dot(&self.recurrent[r * n..(r + 1) * n], h);
        }
        for (hv, &s) in h.iter_mut().zip(scratch.iter()) {
            *hv = s.tanh();
        }
    }
}

/// Stacked Elman recurrent network with base and run-length heads
#[derive(Clone, Debug, PartialEq)]
pub struct ElmanTransducer {
    arch: ModelArch,
    meta: ModelMeta,
    layers: Vec<RecurrentLayer>,
    base_head: Linear,
    rle_head: Linear,
}

impl ElmanTransducer {
    /// Assemble a model, checking every layer against `arch` and `meta`
    pub fn from_parts(
        arch: ModelArch,
        meta: ModelMeta,
        layers: Vec<RecurrentLayer>,
        base_head: Linear,
        rle_head: Linear,
    ) -> Result<Self> {
        let hidden = meta.hidden_size;
        if layers.len() != meta.recurrent_depth() {
            return Err(PolishError::invalid_data(format!(
                "{} recurrent layers for depth {}",
                layers.len(),
                meta.recurrent_depth()
            )));
        }
        for (l, layer) in layers.iter().enumerate() {
            let in_dim = if l == 0 { arch.features() } else { hidden };
            if layer.input.rows != hidden || layer.input.cols != in_dim {
                return Err(PolishError::invalid_data(format!(
                    "layer {} is {}x{}, expected {}x{}",
                    l, layer.input.rows, layer.input.cols, hidden, in_dim
                )));
            }
        }
        if base_head.rows != arch.base_classes || base_head.cols != hidden {
            return Err(PolishError::invalid_data("base head does not match architecture"));
        }
        if rle_head.rows != arch.rle_classes || rle_head.cols != hidden {
            return Err(PolishError::invalid_data("run-length head does not match architecture"));
        }
        Ok(Self {
            arch,
            meta,
            layers,
            base_head,
            rle_head,
        })
    }

    /// Seeded random initialization
    pub fn random(arch: ModelArch, meta: ModelMeta, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let hidden = meta.hidden_size;
        let layers = (0..meta.recurrent_depth())
            .map(|l| {
                let in_dim = if l == 0 { arch.features() } else { hidden };
                let bound = 1.0 / (hidden.max(1) as f32).sqrt();
                RecurrentLayer {
                    input: Linear::random(hidden, in_dim, &mut rng),
                    recurrent: (0..hidden * hidden)
                        .map(|_| rng.gen_range(-bound..bound))
                        .collect(),
                }
            })
            .collect();
        let base_head = Linear::random(arch.base_classes, hidden, &mut rng);
        let rle_head = Linear::random(arch.rle_classes, hidden, &mut rng);
        Self {
            arch,
            meta,
            layers,
            base_head,
            rle_head,
        }
    }

    /// Named parameter tensors in checkpoint order
    pub fn named_tensors(&self) -> Vec<(String, &[f32])> {
        let mut out = Vec::with_capacity(3 * self.layers.len() + 4);
        for (l, layer) in self.layers.iter().enumerate() {
            out.push((format!("layer{}.w_in", l), layer.input.weight()));
            out.push((format!("layer{}.b_in", l), layer.input.bias()));
            out.push((format!("layer{}.w_hh", l), layer.recurrent.as_slice()));
        }
        out.push(("base.w".to_string(), self.base_head.weight()));
        out.push(("base.b".to_string(), self.base_head.bias()));
        out.push(("rle.w".to_string(), self.rle_head.weight()));
        out.push(("rle.b".to_string(), self.rle_head.bias()));
        out
    }

    /// Rebuild from tensors produced by [`ElmanTransducer::named_tensors`]
    pub fn from_named_tensors(
        arch: ModelArch,
        meta: ModelMeta,
        mut tensors: HashMap<String, Vec<f32>>,
    ) -> Result<Self> {
        let mut take = |name: &str| {
            tensors
                .remove(name)
                .ok_or_else(|| PolishError::invalid_data(format!("missing tensor '{}'", name)))
        };
        let hidden = meta.hidden_size;
        let mut layers = Vec::with_capacity(meta.recurrent_depth());
        for l in 0..meta.recurrent_depth() {
            let in_dim = if l == 0 { arch.features() } else { hidden };
            let input = Linear::new(
                hidden,
                in_dim,
                take(&format!("layer{}.w_in", l))?,
                take(&format!("layer{}.b_in", l))?,
            )?;
            layers.push(RecurrentLayer::new(input, take(&format!("layer{}.w_hh", l))?)?);
        }
        let base_head = Linear::new(arch.base_classes, hidden, take("base.w")?, take("base.b")?)?;
        let rle_head = Linear::new(arch.rle_classes, hidden, take("rle.w")?, take("rle.b")?)?;
        Self::from_parts(arch, meta, layers, base_head, rle_head)
    }
}

impl SequenceModel for ElmanTransducer {
    fn arch(&self) -> &ModelArch {
        &self.arch
    }

    fn meta(&self) -> &ModelMeta {
        &self.meta
    }

    fn step(&self, window: &Tensor3, hidden: HiddenState) -> Result<StepOutput> {
        let [batch, width, features] = window.dims();
        if features != self.arch.features() {
            return Err(PolishError::inference(format!(
                "window has {} features per position, model expects {}",
                features,
                self.arch.features()
            )));
        }
        let expected = [batch, self.meta.recurrent_depth(), self.meta.hidden_size];
        if hidden.dims() != expected {
            return Err(PolishError::inference(format!(
                "hidden state {:?} does not match {:?}",
                hidden.dims(),
                expected
            )));
        }

        let n_hidden = self.meta.hidden_size;
        let mut h = hidden.into_tensor();
        let mut base_logits = Tensor3::zeros([batch, width, self.arch.base_classes]);
        let mut rle_logits = Tensor3::zeros([batch, width, self.arch.rle_classes]);
        let mut x = vec![0.0f32; features.max(n_hidden)];
        let mut scratch = vec![0.0f32; n_hidden];

        for i in 0..batch {
            for t in 0..width {
                x[..features].copy_from_slice(window.row(i, t));
                let mut x_len = features;
                for (l, layer) in self.layers.iter().enumerate() {
                    let h_l = h.row_mut(i, l);
                    layer.update(&x[..x_len], h_l, &mut scratch);
                    x[..n_hidden].copy_from_slice(h_l);
                    x_len = n_hidden;
                }
                self.base_head.apply(&x[..n_hidden], base_logits.row_mut(i, t));
                self.rle_head.apply(&x[..n_hidden], rle_logits.row_mut(i, t));
            }
        }

        Ok(StepOutput {
            base_logits,
            rle_logits,
            hidden: HiddenState::from_tensor(h),
        })
    }
}
