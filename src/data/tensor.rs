//! # Dense Rank-3 Tensors
//!
//! Row-major `[d0 × d1 × d2]` buffers. Every tensor in the inference path is
//! rank 3 with the batch on the leading axis: images `[B × L × F]`, window
//! logits `[B × W × C]`, hidden state `[B × depth × hidden]` and evidence
//! `[B × L × C]`.

use std::ops::Range;

/// Row-major rank-3 tensor of `f32`
#[derive(Clone, Debug, PartialEq)]
pub struct Tensor3 {
    dims: [usize; 3],
    data: Vec<f32>,
}

impl Tensor3 {
    /// Create a zero-filled tensor
    pub fn zeros(dims: [usize; 3]) -> Self {
        Self {
            dims,
            data: vec![0.0; dims[0] * dims[1] * dims[2]],
        }
    }

    /// Wrap an existing buffer; `None` if the length does not match the shape
    pub fn from_vec(dims: [usize; 3], data: Vec<f32>) -> Option<Self> {
        if data.len() == dims[0] * dims[1] * dims[2] {
            Some(Self { dims, data })
        } else {
            None
        }
    }

    #[inline]
    pub fn dims(&self) -> [usize; 3] {
        self.dims
    }

    #[inline]
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    #[inline]
    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn into_vec(self) -> Vec<f32> {
        self.data
    }

    /// Set every element to zero, keeping the allocation
    pub fn fill_zero(&mut self) {
        self.data.fill(0.0);
    }

    /// Flat offset of element `[i, j, 0]`
    #[inline]
    fn row_offset(&self, i: usize, j: usize) -> usize {
        (i * self.dims[1] + j) * self.dims[2]
    }

    /// Innermost vector at `[i, j, ..]`
    #[inline]
    pub fn row(&self, i: usize, j: usize) -> &[f32] {
        let start = self.row_offset(i, j);
        &self.data[start..start + self.dims[2]]
    }

    #[inline]
    pub fn row_mut(&mut self, i: usize, j: usize) -> &mut [f32] {
        let start = self.row_offset(i, j);
        let width = self.dims[2];
        &mut self.data[start..start + width]
    }

    /// Contiguous `[j_range × d2]` block of the `i`-th matrix
    #[inline]
    pub fn rows(&self, i: usize, j: Range<usize>) -> &[f32] {
        let start = self.row_offset(i, j.start);
        let end = self.row_offset(i, j.end);
        &self.data[start..end]
    }

    #[inline]
    pub fn rows_mut(&mut self, i: usize, j: Range<usize>) -> &mut [f32] {
        let start = self.row_offset(i, j.start);
        let end = self.row_offset(i, j.end);
        &mut self.data[start..end]
    }

    /// Copy of the sub-range `j` of axis 1 for every `i`: `[d0 × len(j) × d2]`
    pub fn slice_axis1(&self, j: Range<usize>) -> Tensor3 {
        debug_assert!(j.end <= self.dims[1]);
        let len = j.end - j.start;
        let mut data = Vec::with_capacity(self.dims[0] * len * self.dims[2]);
        for i in 0..self.dims[0] {
            data.extend_from_slice(self.rows(i, j.clone()));
        }
        Tensor3 {
            dims: [self.dims[0], len, self.dims[2]],
            data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_vec_checks_len() {
        assert!(Tensor3::from_vec([2, 3, 4], vec![0.0; 24]).is_some());
        assert!(Tensor3::from_vec([2, 3, 4], vec![0.0; 23]).is_none());
    }

    #[test]
    fn test_row_indexing() {
        let data: Vec<f32> = (0..24).map(|x| x as f32).collect();
        let t = Tensor3::from_vec([2, 3, 4], data).unwrap();
        assert_eq!(t.row(0, 0), &[0.0, 1.0, 2.0, 3.0]);
        assert_eq!(t.row(1, 2), &[20.0, 21.0, 22.0, 23.0]);
        assert_eq!(t.rows(1, 1..3).len(), 8);
        assert_eq!(t.rows(1, 1..3)[0], 16.0);
    }

    #[test]
    fn test_slice_axis1() {
        let data: Vec<f32> = (0..24).map(|x| x as f32).collect();
        let t = Tensor3::from_vec([2, 3, 4], data).unwrap();
        let s = t.slice_axis1(1..3);
        assert_eq!(s.dims(), [2, 2, 4]);
        assert_eq!(s.row(0, 0), t.row(0, 1));
        assert_eq!(s.row(1, 1), t.row(1, 2));
    }
}
