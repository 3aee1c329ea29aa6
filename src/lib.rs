//! # Polisher Library
//!
//! Windowed recurrent inference over pileup images with per-position
//! evidence fusion, run across a group of worker processes.
//!
//! ## Modules
//! - `config`: CLI argument parsing and validation
//! - `data`: Tensors, sequence instances, batches and label sequences
//! - `error`: Error types, failure classes and result aliases
//! - `io`: Window schedule, image and checkpoint containers, prediction output
//! - `model`: Sequence model seam, stepper, evidence fusion, label resolution
//! - `pipelines`: Batch loop, worker lifecycle and multi-worker coordination
//! - `utils`: Thread pools and progress reporting

pub mod config;
pub mod data;
pub mod error;
pub mod io;
pub mod model;
pub mod pipelines;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use data::{Batch, ImageShape, LabelSequence, Rank, SequenceMeta, Tensor3};
pub use error::{FailureKind, PolishError, Result};
pub use io::predictions::{OutputSink, PredictionWriter};
pub use io::window::{EdgePolicy, WindowParams, WindowScheduler};
pub use model::evidence::EvidenceAccumulator;
pub use model::resolver::LabelResolver;
pub use model::stepper::RecurrentInferenceStepper;
pub use model::{load_model, ModelArch, ModelMeta, SequenceModel};
pub use pipelines::{BatchRunner, RunPlan, WorkerCoordinator};
