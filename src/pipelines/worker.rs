//! # Worker Entry
//!
//! ## Role
//! Everything one worker does between launch and exit: join the group, bind
//! the device, load the model, run its shard, publish its artifact and meet
//! the other workers at the teardown barrier.
//!
//! ## Lifecycle
//! `Uninitialized → JoinedGroup → RunningBatches → Finished`. Transitions
//! are strictly forward and one step at a time; [`WorkerLifecycle`] rejects
//! anything else. A fatal error leaves the worker in its current state and
//! its artifact unpublished.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::data::Rank;
use crate::error::{PolishError, Result};
use crate::io::images::ImageDataset;
use crate::io::predictions::{output_path, OutputSink, PredictionWriter};
use crate::io::window::WindowParams;
use crate::model::{load_model, ModelArch, SequenceModel};
use crate::pipelines::batch::BatchRunner;
use crate::pipelines::group::{ProcessGroup, RendezvousConfig};
use crate::pipelines::shard::ShardAssignment;
use crate::utils::progress::{reporter_for, ProgressReporter};
use crate::utils::threading::build_thread_pool;

/// Run-wide parameters shared by every worker
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkerSpec {
    pub world_size: usize,
    pub output_prefix: PathBuf,
    pub model_path: PathBuf,
    pub batch_size: usize,
    pub loader_threads: usize,
    pub window: WindowParams,
    pub arch: ModelArch,
    #[serde(default)]
    pub rendezvous: RendezvousConfig,
}

/// Everything a worker process receives on startup
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkerInvocation {
    pub rank: Rank,
    pub assignment: ShardAssignment,
    pub spec: WorkerSpec,
}

impl WorkerInvocation {
    pub fn run(&self) -> Result<WorkerReport> {
        run_worker(self.rank, &self.assignment, &self.spec)
    }
}

/// Lifecycle state of one worker
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum WorkerState {
    Uninitialized,
    JoinedGroup,
    RunningBatches,
    Finished,
}

impl WorkerState {
    fn next(self) -> Option<Self> {
        match self {
            WorkerState::Uninitialized => Some(WorkerState::JoinedGroup),
            WorkerState::JoinedGroup => Some(WorkerState::RunningBatches),
            WorkerState::RunningBatches => Some(WorkerState::Finished),
            WorkerState::Finished => None,
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkerState::Uninitialized => "uninitialized",
            WorkerState::JoinedGroup => "joined-group",
            WorkerState::RunningBatches => "running-batches",
            WorkerState::Finished => "finished",
        };
        f.write_str(s)
    }
}

/// Forward-only state machine of one worker
#[derive(Debug)]
pub struct WorkerLifecycle {
    rank: Rank,
    state: WorkerState,
}

impl WorkerLifecycle {
    pub fn new(rank: Rank) -> Self {
        Self {
            rank,
            state: WorkerState::Uninitialized,
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Move to `to`, which must be the immediate successor of the current state
    pub fn advance(&mut self, to: WorkerState) -> Result<()> {
        if self.state.next() != Some(to) {
            return Err(PolishError::invalid_data(format!(
                "rank {}: illegal transition {} -> {}",
                self.rank, self.state, to
            )));
        }
        tracing::debug!(rank = self.rank.0, from = %self.state, to = %to, "worker state");
        self.state = to;
        Ok(())
    }
}

/// Outcome of a finished worker
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerReport {
    pub rank: Rank,
    pub n_files: usize,
    pub n_batches: usize,
    pub n_instances: usize,
    pub output: PathBuf,
}

/// Run worker `rank` with the checkpoint named in `spec`
#[instrument(skip_all, fields(rank = rank.0))]
pub fn run_worker(rank: Rank, assignment: &ShardAssignment, spec: &WorkerSpec) -> Result<WorkerReport> {
    let mut reporter = reporter_for(rank);
    run_worker_inner(rank, assignment, spec, reporter.as_mut(), || {
        load_model(&spec.model_path, &spec.arch)
    })
}

/// Run worker `rank` with an already constructed model
pub fn run_worker_with_model<M: SequenceModel>(
    rank: Rank,
    assignment: &ShardAssignment,
    spec: &WorkerSpec,
    model: M,
    reporter: &mut dyn ProgressReporter,
) -> Result<WorkerReport> {
    run_worker_inner(rank, assignment, spec, reporter, || Ok(model))
}

fn run_worker_inner<M, F>(
    rank: Rank,
    assignment: &ShardAssignment,
    spec: &WorkerSpec,
    reporter: &mut dyn ProgressReporter,
    load: F,
) -> Result<WorkerReport>
where
    M: SequenceModel,
    F: FnOnce() -> Result<M>,
{
    if assignment.world_size() != spec.world_size {
        return Err(PolishError::config(format!(
            "assignment has {} shards for a world of {}",
            assignment.world_size(),
            spec.world_size
        )));
    }
    if spec.batch_size == 0 {
        return Err(PolishError::config("batch size must be positive"));
    }
    let files = assignment.shard(rank)?;
    let device = assignment.device(rank)?;
    let mut lifecycle = WorkerLifecycle::new(rank);

    let mut group = ProcessGroup::join(rank, spec.world_size, &spec.rendezvous)?;
    lifecycle.advance(WorkerState::JoinedGroup)?;

    device.ensure_available()?;
    let model = load()?;
    if model.arch() != &spec.arch {
        return Err(PolishError::startup(format!(
            "model built for {:?}, run expects {:?}",
            model.arch(),
            spec.arch
        )));
    }
    let pool = build_thread_pool(spec.loader_threads, &format!("loader-r{}", rank))?;
    info!(rank = rank.0, device = %device, n_files = files.len(), "Worker ready");

    lifecycle.advance(WorkerState::RunningBatches)?;
    let output = output_path(&spec.output_prefix, rank);
    let mut sink = PredictionWriter::create(&output)?;
    let dataset = ImageDataset::open(files, &spec.arch.image_shape())?;
    let mut runner = BatchRunner::new(model, spec.window)?;
    let stats = runner.run_dataset(rank, &dataset, spec.batch_size, &pool, &mut sink, reporter)?;
    sink.finish()?;

    // The shard is complete and published; a sibling that failed must not fail this worker
    if let Err(e) = group.barrier() {
        warn!(rank = rank.0, error = %e, "Teardown barrier incomplete");
    }
    group.leave();
    lifecycle.advance(WorkerState::Finished)?;

    info!(
        rank = rank.0,
        batches = stats.n_batches,
        instances = stats.n_instances,
        "Worker finished"
    );
    Ok(WorkerReport {
        rank,
        n_files: files.len(),
        n_batches: stats.n_batches,
        n_instances: stats.n_instances,
        output,
    })
}
