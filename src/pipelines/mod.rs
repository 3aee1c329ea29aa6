//! # Pipeline Module
//!
//! High-level orchestration of a prediction run.
//!
//! - `batch`: window loop, evidence fusion and label resolution per batch
//! - `worker`: lifecycle of one worker process
//! - `group`: rendezvous and teardown barrier between workers
//! - `shard`: input partitioning and device binding per rank
//! - `coordinator`: launches the workers and aggregates their outcome

pub mod batch;
pub mod coordinator;
pub mod group;
pub mod shard;
pub mod worker;

pub use batch::{BatchRunner, ShardStats};
pub use coordinator::{ProcessLauncher, RunPlan, RunSummary, WorkerCoordinator, WorkerLauncher};
pub use group::{ProcessGroup, RendezvousConfig};
pub use shard::{Device, ShardAssignment};
pub use worker::{run_worker, run_worker_with_model, WorkerInvocation, WorkerReport, WorkerSpec};
