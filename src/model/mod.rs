//! # Model Module
//!
//! The windowed inference core:
//! - `stepper`: drives a recurrent model across the windows of one batch,
//!   threading the hidden state from call to call
//! - `evidence`: softmax-normalizes each window's logits and sums them into
//!   per-position evidence tensors
//! - `resolver`: arg-max of the accumulated evidence, one label per position
//! - `recurrent`: the reference recurrent transducer loaded from checkpoints
//!
//! The model itself sits behind [`SequenceModel`]. It is a pure function of
//! `(window, hidden)`; the recurrent carry is an owned [`HiddenState`] value
//! that the caller moves in and receives back.

pub mod evidence;
pub mod recurrent;
pub mod resolver;
pub mod stepper;

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::data::sequence::ImageShape;
use crate::data::tensor::Tensor3;
use crate::error::{PolishError, Result};
use crate::io::checkpoint;

pub use evidence::{EvidenceAccumulator, EvidenceTensor};
pub use recurrent::ElmanTransducer;
pub use resolver::LabelResolver;
pub use stepper::RecurrentInferenceStepper;

/// Fixed architecture hyperparameters a checkpoint must agree with
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelArch {
    pub channels: usize,
    pub image_height: usize,
    pub seq_len: usize,
    pub base_classes: usize,
    pub rle_classes: usize,
}

impl ModelArch {
    /// Input feature width of one sequence position
    #[inline]
    pub fn features(&self) -> usize {
        self.image_height * self.channels
    }

    pub fn image_shape(&self) -> ImageShape {
        ImageShape::new(self.seq_len, self.image_height, self.channels)
    }
}

/// Recorded training metadata of a checkpoint
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelMeta {
    pub hidden_size: usize,
    pub gru_layers: usize,
    /// Training iteration the checkpoint was saved at
    pub iteration: u64,
}

impl ModelMeta {
    /// Hidden-state slots per instance; the carry is bidirectional
    #[inline]
    pub fn recurrent_depth(&self) -> usize {
        2 * self.gru_layers
    }
}

/// Recurrent carry, `[batch × recurrent_depth × hidden_size]`
#[derive(Clone, Debug, PartialEq)]
pub struct HiddenState(Tensor3);

impl HiddenState {
    /// All-zero state for the start of a batch
    pub fn zeros(batch: usize, meta: &ModelMeta) -> Self {
        Self(Tensor3::zeros([batch, meta.recurrent_depth(), meta.hidden_size]))
    }

    pub fn from_tensor(t: Tensor3) -> Self {
        Self(t)
    }

    #[inline]
    pub fn dims(&self) -> [usize; 3] {
        self.0.dims()
    }

    pub fn tensor(&self) -> &Tensor3 {
        &self.0
    }

    pub fn tensor_mut(&mut self) -> &mut Tensor3 {
        &mut self.0
    }

    pub fn into_tensor(self) -> Tensor3 {
        self.0
    }
}

/// Output of one model call on one window
#[derive(Clone, Debug)]
pub struct StepOutput {
    /// `[batch × W × base_classes]`
    pub base_logits: Tensor3,
    /// `[batch × W × rle_classes]`
    pub rle_logits: Tensor3,
    pub hidden: HiddenState,
}

/// A recurrent sequence model evaluated one window at a time
pub trait SequenceModel {
    fn arch(&self) -> &ModelArch;

    fn meta(&self) -> &ModelMeta;

    /// Evaluate `window` (`[batch × W × features]`) from `hidden`.
    ///
    /// # Errors
    /// Returns `PolishError::Inference` when the input shapes do not match
    /// the model.
    fn step(&self, window: &Tensor3, hidden: HiddenState) -> Result<StepOutput>;
}

impl<M: SequenceModel + ?Sized> SequenceModel for &M {
    fn arch(&self) -> &ModelArch {
        (**self).arch()
    }

    fn meta(&self) -> &ModelMeta {
        (**self).meta()
    }

    fn step(&self, window: &Tensor3, hidden: HiddenState) -> Result<StepOutput> {
        (**self).step(window, hidden)
    }
}

impl<M: SequenceModel + ?Sized> SequenceModel for Box<M> {
    fn arch(&self) -> &ModelArch {
        (**self).arch()
    }

    fn meta(&self) -> &ModelMeta {
        (**self).meta()
    }

    fn step(&self, window: &Tensor3, hidden: HiddenState) -> Result<StepOutput> {
        (**self).step(window, hidden)
    }
}

/// Load a checkpoint and check it against the run's architecture.
///
/// # Errors
/// `PolishError::Startup` if the checkpoint cannot be read or was trained for
/// a different architecture.
pub fn load_model(path: &Path, arch: &ModelArch) -> Result<ElmanTransducer> {
    let model = checkpoint::read_checkpoint(path).map_err(|e| {
        PolishError::startup(format!("cannot load checkpoint {}: {:#}", path.display(), e))
    })?;
    if model.arch() != arch {
        return Err(PolishError::startup(format!(
            "checkpoint {} was built for {:?}, run expects {:?}",
            path.display(),
            model.arch(),
            arch
        )));
    }
    tracing::info!(
        path = %path.display(),
        hidden_size = model.meta().hidden_size,
        gru_layers = model.meta().gru_layers,
        iteration = model.meta().iteration,
        "loaded model"
    );
    Ok(model)
}
