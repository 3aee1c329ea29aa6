//! # I/O Module
//!
//! File formats and window geometry.
//!
//! - `window`: sliding-window schedule over the sequence axis
//! - `images`: memory-mapped pileup image container (input)
//! - `checkpoint`: model parameter container
//! - `predictions`: output sink and the per-worker prediction artifact

pub mod checkpoint;
pub mod images;
pub mod predictions;
pub mod window;

pub use images::{ImageDataset, ImageFileWriter};
pub use predictions::{output_path, read_predictions, OutputSink, Prediction, PredictionWriter};
pub use window::{EdgePolicy, Padding, WindowParams, WindowScheduler, WindowSlice};
