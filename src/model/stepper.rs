//! # Recurrent Inference Stepper
//!
//! Invokes the model once per window of a batch. The hidden state is an owned
//! value: each call consumes the previous carry and hands back the next, so
//! windows of one batch must be stepped in increasing start order and no
//! state survives past the batch.

use crate::data::sequence::Batch;
use crate::data::tensor::Tensor3;
use crate::error::{PolishError, Result};
use crate::io::window::WindowSlice;
use crate::model::{HiddenState, SequenceModel, StepOutput};

/// Drives one model across sequential windows
pub struct RecurrentInferenceStepper<M> {
    model: M,
}

impl<M: SequenceModel> RecurrentInferenceStepper<M> {
    pub fn new(model: M) -> Self {
        Self { model }
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    /// Zero carry for a batch of `batch` instances
    pub fn initial_state(&self, batch: usize) -> HiddenState {
        HiddenState::zeros(batch, self.model.meta())
    }

    /// Evaluate `slice` of `batch` from `hidden`.
    ///
    /// # Errors
    /// Shape mismatches and model errors surface as `PolishError::Inference`.
    pub fn step(&self, batch: &Batch, slice: &WindowSlice, hidden: HiddenState) -> Result<StepOutput> {
        if slice.end > batch.seq_len() {
            return Err(PolishError::inference(format!(
                "window {}..{} exceeds sequence length {}",
                slice.start,
                slice.end,
                batch.seq_len()
            )));
        }
        let window = batch.images().slice_axis1(slice.start..slice.end);
        self.step_tensor(&window, hidden)
    }

    /// Evaluate an already extracted `[batch × W × features]` window
    pub fn step_tensor(&self, window: &Tensor3, hidden: HiddenState) -> Result<StepOutput> {
        let [batch, width, _] = window.dims();
        let meta = self.model.meta();
        let expected = [batch, meta.recurrent_depth(), meta.hidden_size];
        if hidden.dims() != expected {
            return Err(PolishError::inference(format!(
                "hidden state {:?} does not match model carry {:?}",
                hidden.dims(),
                expected
            )));
        }

        let out = self.model.step(window, hidden)?;

        let arch = self.model.arch();
        check_logits("base", &out.base_logits, [batch, width, arch.base_classes])?;
        check_logits("run-length", &out.rle_logits, [batch, width, arch.rle_classes])?;
        if out.hidden.dims() != expected {
            return Err(PolishError::inference(format!(
                "model returned hidden state {:?}, expected {:?}",
                out.hidden.dims(),
                expected
            )));
        }
        Ok(out)
    }
}

fn check_logits(head: &str, logits: &Tensor3, expected: [usize; 3]) -> Result<()> {
    if logits.dims() != expected {
        return Err(PolishError::inference(format!(
            "{} logits {:?}, expected {:?}",
            head,
            logits.dims(),
            expected
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::sequence::{GenomicPosition, ImageShape, SequenceInstance, SequenceMeta};
    use crate::io::window::{EdgePolicy, WindowParams, WindowScheduler};
    use crate::model::{ElmanTransducer, ModelArch, ModelMeta};

    fn arch() -> ModelArch {
        ModelArch {
            channels: 1,
            image_height: 2,
            seq_len: 6,
            base_classes: 5,
            rle_classes: 3,
        }
    }

    fn meta() -> ModelMeta {
        ModelMeta {
            hidden_size: 4,
            gru_layers: 1,
            iteration: 0,
        }
    }

    fn batch(n: usize) -> Batch {
        let shape = ImageShape::new(6, 2, 1);
        let instances = (0..n)
            .map(|i| SequenceInstance {
                meta: SequenceMeta {
                    contig: "c".to_string(),
                    contig_start: 0,
                    contig_end: 6,
                    chunk_id: i as u32,
                    positions: (0..6).map(|p| GenomicPosition::new(p, 0)).collect(),
                    filename: String::new(),
                },
                image: (0..12).map(|v| (v + i) as f32 * 0.1).collect(),
            })
            .collect();
        Batch::from_instances(instances, &shape).unwrap()
    }

    #[test]
    fn test_threads_hidden_state() {
        let model = ElmanTransducer::random(arch(), meta(), 4);
        let stepper = RecurrentInferenceStepper::new(&model);
        let scheduler = WindowScheduler::new(WindowParams {
            seq_len: 6,
            width: 4,
            jump: 2,
            edge_policy: EdgePolicy::Drop,
        })
        .unwrap();
        let b = batch(2);
        let mut hidden = stepper.initial_state(b.len());
        let mut outputs = Vec::new();
        for w in &scheduler {
            let out = stepper.step(&b, &w, hidden).unwrap();
            hidden = out.hidden.clone();
            outputs.push(out);
        }
        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs[1].base_logits.dims(), [2, 4, 5]);

        // Second window from a zero carry differs from the threaded result
        let windows = scheduler.slices();
        let cold = stepper
            .step(&b, &windows[1], stepper.initial_state(2))
            .unwrap();
        assert_ne!(cold.base_logits, outputs[1].base_logits);
    }

    #[test]
    fn test_rejects_wrong_hidden_shape() {
        let model = ElmanTransducer::random(arch(), meta(), 4);
        let stepper = RecurrentInferenceStepper::new(&model);
        let b = batch(2);
        let slice = WindowScheduler::new(WindowParams {
            seq_len: 6,
            width: 4,
            jump: 2,
            edge_policy: EdgePolicy::Drop,
        })
        .unwrap()
        .slices()[0];
        let err = stepper
            .step(&b, &slice, stepper.initial_state(3))
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::FailureKind::Inference);
    }
}
