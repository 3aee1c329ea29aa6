//! # Batch Runner
//!
//! Runs the window loop of one batch and forwards the resolved labels.
//!
//! Per batch:
//! 1. Zero the hidden state and both evidence tensors.
//! 2. For every window in increasing start order, step the model from the
//!    previous carry and fuse both heads into the evidence.
//! 3. Resolve each head by arg-max and write every instance to the sink.
//!
//! Nothing carries over from one batch to the next.

use std::time::Instant;

use tracing::info_span;

use crate::data::sequence::Batch;
use crate::data::Rank;
use crate::error::{PolishError, Result};
use crate::io::images::ImageDataset;
use crate::io::predictions::OutputSink;
use crate::io::window::{WindowParams, WindowScheduler};
use crate::model::evidence::EvidenceAccumulator;
use crate::model::resolver::LabelResolver;
use crate::model::stepper::RecurrentInferenceStepper;
use crate::model::SequenceModel;
use crate::utils::progress::{BatchClock, ProgressReporter};

/// Totals of a completed shard
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ShardStats {
    pub n_batches: usize,
    pub n_instances: usize,
}

/// Window loop over batches for one model
pub struct BatchRunner<M> {
    stepper: RecurrentInferenceStepper<M>,
    scheduler: WindowScheduler,
    accumulator: EvidenceAccumulator,
}

impl<M: SequenceModel> BatchRunner<M> {
    /// # Errors
    /// The window geometry must be valid and its sequence length must match
    /// the model's.
    pub fn new(model: M, window: WindowParams) -> Result<Self> {
        let scheduler = WindowScheduler::new(window)?;
        let arch = *model.arch();
        if arch.seq_len != window.seq_len {
            return Err(PolishError::config(format!(
                "model expects sequences of {}, windows are laid out for {}",
                arch.seq_len, window.seq_len
            )));
        }
        Ok(Self {
            stepper: RecurrentInferenceStepper::new(model),
            scheduler,
            accumulator: EvidenceAccumulator::new(0, arch.seq_len, arch.base_classes, arch.rle_classes),
        })
    }

    pub fn scheduler(&self) -> &WindowScheduler {
        &self.scheduler
    }

    /// Predict one batch and write each of its instances to `sink`
    pub fn run_batch(&mut self, batch: &Batch, sink: &mut dyn OutputSink) -> Result<()> {
        if batch.seq_len() != self.scheduler.seq_len() {
            return Err(PolishError::inference(format!(
                "batch sequence length {} does not match {}",
                batch.seq_len(),
                self.scheduler.seq_len()
            )));
        }
        let n = batch.len();
        self.accumulator.reset(n);
        let mut hidden = self.stepper.initial_state(n);

        for slice in &self.scheduler {
            let out = self.stepper.step(batch, &slice, hidden)?;
            self.accumulator
                .fuse(&out.base_logits, &out.rle_logits, slice.padding)?;
            hidden = out.hidden;
        }

        let base = LabelResolver::resolve(self.accumulator.base());
        let rle = LabelResolver::resolve(self.accumulator.rle());
        for (i, meta) in batch.metas().iter().enumerate() {
            sink.write(meta, base.instance(i), rle.instance(i))?;
        }
        Ok(())
    }

    /// Predict every instance of `dataset` in batches of `batch_size`
    pub fn run_dataset(
        &mut self,
        rank: Rank,
        dataset: &ImageDataset,
        batch_size: usize,
        pool: &rayon::ThreadPool,
        sink: &mut dyn OutputSink,
        reporter: &mut dyn ProgressReporter,
    ) -> Result<ShardStats> {
        let mut clock = BatchClock::new(rank, dataset.n_batches(batch_size));
        for (idx, range) in dataset.batch_ranges(batch_size).enumerate() {
            let _span = info_span!("batch", idx, size = range.len()).entered();
            let started = Instant::now();
            let batch = dataset.load_batch(range, pool)?;
            self.run_batch(&batch, sink)?;
            let progress = clock.record(batch.len(), started.elapsed());
            reporter.report(&progress);
        }
        reporter.finish();
        Ok(ShardStats {
            n_batches: clock.batches_done(),
            n_instances: clock.instances_done(),
        })
    }
}
