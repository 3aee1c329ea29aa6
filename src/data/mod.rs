//! # Data Module
//!
//! In-memory representations of pileup images, label sequences and the
//! dense tensors that flow between the model and the evidence accumulator.
//!
//! ## Design Philosophy: Data-Oriented Design
//! - **Flat buffers:** every tensor is a single row-major `Vec<f32>` with an
//!   explicit shape, so window extraction and evidence fusion are slice copies.
//! - **Zero-cost newtypes:** `Rank` and `ClassId` keep worker identities and
//!   class labels from being mixed with plain offsets.

pub mod labels;
pub mod sequence;
pub mod tensor;

pub use labels::{BaseClass, LabelSequence};
pub use sequence::{Batch, GenomicPosition, ImageShape, SequenceInstance, SequenceMeta};
pub use tensor::Tensor3;

use serde::{Deserialize, Serialize};

/// Worker identity within the worker group (0-based)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Rank(pub u32);

impl Rank {
    /// Rank whose worker emits progress reports
    pub const PRIMARY: Rank = Rank(0);

    pub fn new(idx: u32) -> Self {
        Self(idx)
    }

    pub fn as_usize(self) -> usize {
        self.0 as usize
    }

    pub fn is_primary(self) -> bool {
        self == Self::PRIMARY
    }
}

impl From<usize> for Rank {
    fn from(idx: usize) -> Self {
        Self(idx as u32)
    }
}

impl From<Rank> for usize {
    fn from(rank: Rank) -> usize {
        rank.0 as usize
    }
}

impl std::fmt::Display for Rank {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Class label produced by one of the two output heads
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ClassId(pub u32);

impl ClassId {
    /// Label of positions that received no evidence
    pub const NO_EVIDENCE: ClassId = ClassId(0);

    pub fn new(idx: u32) -> Self {
        Self(idx)
    }

    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl From<usize> for ClassId {
    fn from(idx: usize) -> Self {
        Self(idx as u32)
    }
}
