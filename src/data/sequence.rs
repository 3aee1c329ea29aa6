//! # Sequence Instances and Batches
//!
//! A sequence instance is one fixed-length pileup image plus the identity of
//! the genomic chunk it was generated from. Batches stack instances along a
//! leading axis so one model call evaluates a window of every instance.

use serde::{Deserialize, Serialize};

use crate::data::tensor::Tensor3;
use crate::error::{PolishError, Result};

/// Geometry shared by every image of a run
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageShape {
    /// Positions along the sequence axis
    pub seq_len: usize,
    /// Feature rows per position
    pub height: usize,
    /// Channels per feature row
    pub channels: usize,
}

impl ImageShape {
    pub fn new(seq_len: usize, height: usize, channels: usize) -> Self {
        Self {
            seq_len,
            height,
            channels,
        }
    }

    /// Flattened feature width of one position (`height * channels`)
    #[inline]
    pub fn features(&self) -> usize {
        self.height * self.channels
    }

    /// Number of pixels in one image
    #[inline]
    pub fn n_pixels(&self) -> usize {
        self.seq_len * self.features()
    }
}

/// Genomic coordinate of one image column.
///
/// Columns inserted relative to the reference share `ref_pos` and count up
/// `insert` from 1; reference columns have `insert == 0`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GenomicPosition {
    pub ref_pos: u64,
    pub insert: u32,
}

impl GenomicPosition {
    pub fn new(ref_pos: u64, insert: u32) -> Self {
        Self { ref_pos, insert }
    }
}

/// Identity metadata of one sequence instance
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceMeta {
    pub contig: String,
    pub contig_start: u64,
    pub contig_end: u64,
    pub chunk_id: u32,
    /// One coordinate per image column
    pub positions: Vec<GenomicPosition>,
    /// Name of the image file the instance was read from
    #[serde(default, skip_serializing)]
    pub filename: String,
}

/// One loaded image and its identity
#[derive(Clone, Debug)]
pub struct SequenceInstance {
    pub meta: SequenceMeta,
    /// Row-major `[seq_len × features]`
    pub image: Vec<f32>,
}

/// Stacked instances evaluated together
#[derive(Clone, Debug)]
pub struct Batch {
    metas: Vec<SequenceMeta>,
    /// `[batch × seq_len × features]`
    images: Tensor3,
}

impl Batch {
    /// Stack instances in order. All images must match `shape`.
    pub fn from_instances(instances: Vec<SequenceInstance>, shape: &ImageShape) -> Result<Self> {
        if instances.is_empty() {
            return Err(PolishError::invalid_data("cannot build an empty batch"));
        }
        let n = instances.len();
        let mut data = Vec::with_capacity(n * shape.n_pixels());
        let mut metas = Vec::with_capacity(n);
        for inst in instances {
            if inst.image.len() != shape.n_pixels() {
                return Err(PolishError::invalid_data(format!(
                    "image for {}:{}-{} chunk {} has {} values, expected {}",
                    inst.meta.contig,
                    inst.meta.contig_start,
                    inst.meta.contig_end,
                    inst.meta.chunk_id,
                    inst.image.len(),
                    shape.n_pixels()
                )));
            }
            data.extend_from_slice(&inst.image);
            metas.push(inst.meta);
        }
        let images = Tensor3::from_vec([n, shape.seq_len, shape.features()], data)
            .ok_or_else(|| PolishError::invalid_data("batch tensor size mismatch"))?;
        Ok(Self { metas, images })
    }

    /// Build directly from a stacked tensor
    pub fn from_parts(metas: Vec<SequenceMeta>, images: Tensor3) -> Result<Self> {
        if metas.len() != images.dims()[0] {
            return Err(PolishError::invalid_data(format!(
                "{} metadata entries for a batch of {}",
                metas.len(),
                images.dims()[0]
            )));
        }
        Ok(Self { metas, images })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.metas.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.metas.is_empty()
    }

    #[inline]
    pub fn seq_len(&self) -> usize {
        self.images.dims()[1]
    }

    pub fn metas(&self) -> &[SequenceMeta] {
        &self.metas
    }

    pub fn images(&self) -> &Tensor3 {
        &self.images
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(chunk: u32) -> SequenceMeta {
        SequenceMeta {
            contig: "contig_1".to_string(),
            contig_start: 0,
            contig_end: 3,
            chunk_id: chunk,
            positions: (0..3).map(|p| GenomicPosition::new(p, 0)).collect(),
            filename: "a.img".to_string(),
        }
    }

    #[test]
    fn test_batch_stacks_in_order() {
        let shape = ImageShape::new(3, 2, 1);
        let a = SequenceInstance { meta: meta(0), image: vec![1.0; 6] };
        let b = SequenceInstance { meta: meta(1), image: vec![2.0; 6] };
        let batch = Batch::from_instances(vec![a, b], &shape).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.images().dims(), [2, 3, 2]);
        assert_eq!(batch.images().row(1, 0), &[2.0, 2.0]);
        assert_eq!(batch.metas()[1].chunk_id, 1);
    }

    #[test]
    fn test_batch_rejects_wrong_size() {
        let shape = ImageShape::new(3, 2, 1);
        let a = SequenceInstance { meta: meta(0), image: vec![1.0; 5] };
        assert!(Batch::from_instances(vec![a], &shape).is_err());
        assert!(Batch::from_instances(Vec::new(), &shape).is_err());
    }

    #[test]
    fn test_filename_not_serialized() {
        let json = serde_json::to_string(&meta(4)).unwrap();
        assert!(!json.contains("a.img"));
        let back: SequenceMeta = serde_json::from_str(&json).unwrap();
        assert_eq!(back.filename, "");
        assert_eq!(back.chunk_id, 4);
    }
}
