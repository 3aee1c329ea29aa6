//! # Evidence Accumulation
//!
//! Each window's logits are turned into a probability distribution over the
//! class axis and added into a running `[batch × L × classes]` evidence
//! tensor at the window's offset. Adding at an offset is the same as adding
//! the window output zero-padded by `top`/`bottom` rows to full length.
//!
//! Fusion is elementwise addition, so the final tensor does not depend on the
//! order windows are fused in (up to floating-point rounding).

use wide::f32x8;

use crate::data::tensor::Tensor3;
use crate::error::{PolishError, Result};
use crate::io::window::Padding;

/// Running evidence of one class head
#[derive(Clone, Debug)]
pub struct EvidenceTensor {
    values: Tensor3,
    /// Windows fused into each position
    coverage: Vec<u32>,
}

impl EvidenceTensor {
    pub fn zeros(batch: usize, seq_len: usize, classes: usize) -> Self {
        Self {
            values: Tensor3::zeros([batch, seq_len, classes]),
            coverage: vec![0; seq_len],
        }
    }

    #[inline]
    pub fn batch(&self) -> usize {
        self.values.dims()[0]
    }

    #[inline]
    pub fn seq_len(&self) -> usize {
        self.values.dims()[1]
    }

    #[inline]
    pub fn classes(&self) -> usize {
        self.values.dims()[2]
    }

    pub fn values(&self) -> &Tensor3 {
        &self.values
    }

    /// Number of fused windows that contained each position
    pub fn coverage(&self) -> &[u32] {
        &self.coverage
    }

    /// Zero the evidence, resizing for a batch of `batch` instances
    pub fn reset(&mut self, batch: usize) {
        let [b, l, c] = self.values.dims();
        if b == batch {
            self.values.fill_zero();
        } else {
            self.values = Tensor3::zeros([batch, l, c]);
        }
        self.coverage.fill(0);
    }

    /// Softmax `logits` (`[batch × W × classes]`) over classes and add them at
    /// rows `padding.top..L - padding.bottom`. `scratch` is reused between calls.
    pub fn fuse(&mut self, logits: &Tensor3, padding: Padding, scratch: &mut Vec<f32>) -> Result<()> {
        let [batch, width, classes] = logits.dims();
        if batch != self.batch() || classes != self.classes() {
            return Err(PolishError::inference(format!(
                "window logits {:?} do not match evidence [{}, _, {}]",
                logits.dims(),
                self.batch(),
                self.classes()
            )));
        }
        if padding.top + width + padding.bottom != self.seq_len() {
            return Err(PolishError::inference(format!(
                "window of width {} padded by {}+{} does not span length {}",
                width,
                padding.top,
                padding.bottom,
                self.seq_len()
            )));
        }

        let rows = padding.top..padding.top + width;
        scratch.resize(width * classes, 0.0);
        for i in 0..batch {
            let src = logits.rows(i, 0..width);
            softmax_rows(src, classes, &mut scratch[..])?;
            add_assign(self.values.rows_mut(i, rows.clone()), &scratch[..]);
        }
        for c in &mut self.coverage[rows] {
            *c += 1;
        }
        Ok(())
    }
}

/// Row-wise softmax of `src` (`[n × classes]`) into `out`.
///
/// The row maximum is subtracted before exponentiation.
pub fn softmax_rows(src: &[f32], classes: usize, out: &mut [f32]) -> Result<()> {
    debug_assert_eq!(src.len(), out.len());
    for (row, dst) in src.chunks_exact(classes).zip(out.chunks_exact_mut(classes)) {
        let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        if !max.is_finite() {
            return Err(PolishError::inference(format!(
                "non-finite logits (row max {})",
                max
            )));
        }
        let mut sum = 0.0f32;
        for (d, &x) in dst.iter_mut().zip(row) {
            let e = (x - max).exp();
            *d = e;
            sum += e;
        }
        if !sum.is_finite() {
            return Err(PolishError::inference("non-finite logits"));
        }
        let inv = 1.0 / sum;
        for d in dst.iter_mut() {
            *d *= inv;
        }
    }
    Ok(())
}

/// `dst += src`, eight lanes at a time
#[inline]
pub fn add_assign(dst: &mut [f32], src: &[f32]) {
    debug_assert_eq!(dst.len(), src.len());
    let n = dst.len();
    let mut k = 0;

    while k + 8 <= n {
        let mut a = [0.0f32; 8];
        let mut b = [0.0f32; 8];
        a.copy_from_slice(&dst[k..k + 8]);
        b.copy_from_slice(&src[k..k + 8]);
        let res: [f32; 8] = (f32x8::from(a) + f32x8::from(b)).into();
        dst[k..k + 8].copy_from_slice(&res);
        k += 8;
    }

    // Scalar tail
    for i in k..n {
        dst[i] += src[i];
    }
}

/// Evidence for both class heads of one batch
#[derive(Clone, Debug)]
pub struct EvidenceAccumulator {
    base: EvidenceTensor,
    rle: EvidenceTensor,
    scratch: Vec<f32>,
}

impl EvidenceAccumulator {
    pub fn new(batch: usize, seq_len: usize, base_classes: usize, rle_classes: usize) -> Self {
        Self {
            base: EvidenceTensor::zeros(batch, seq_len, base_classes),
            rle: EvidenceTensor::zeros(batch, seq_len, rle_classes),
            scratch: Vec::new(),
        }
    }

    /// Zero both heads for a new batch
    pub fn reset(&mut self, batch: usize) {
        self.base.reset(batch);
        self.rle.reset(batch);
    }

    /// Fuse one window's output into both heads
    pub fn fuse(&mut self, base_logits: &Tensor3, rle_logits: &Tensor3, padding: Padding) -> Result<()> {
        self.base.fuse(base_logits, padding, &mut self.scratch)?;
        self.rle.fuse(rle_logits, padding, &mut self.scratch)?;
        Ok(())
    }

    pub fn base(&self) -> &EvidenceTensor {
        &self.base
    }

    pub fn rle(&self) -> &EvidenceTensor {
        &self.rle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::window::{EdgePolicy, WindowParams, WindowScheduler};
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::{Rng, SeedableRng};

    fn random_logits(rng: &mut StdRng, dims: [usize; 3]) -> Tensor3 {
        let n = dims[0] * dims[1] * dims[2];
        Tensor3::from_vec(dims, (0..n).map(|_| rng.gen_range(-6.0..6.0)).collect()).unwrap()
    }

    #[test]
    fn test_softmax_rows_sum_to_one() {
        let src = [1.0, 2.0, 3.0, 1000.0, 1000.0, -1000.0];
        let mut out = [0.0; 6];
        softmax_rows(&src, 3, &mut out).unwrap();
        assert!((out[..3].iter().sum::<f32>() - 1.0).abs() < 1e-6);
        assert!((out[3..].iter().sum::<f32>() - 1.0).abs() < 1e-6);
        // Large logits stay finite
        assert!((out[3] - 0.5).abs() < 1e-6);
        assert_eq!(out[5], 0.0);
        assert!(out[2] > out[1] && out[1] > out[0]);
    }

    #[test]
    fn test_softmax_rejects_nan() {
        let src = [f32::NAN, f32::NAN];
        let mut out = [0.0; 2];
        assert!(softmax_rows(&src, 2, &mut out).is_err());
    }

    #[test]
    fn test_add_assign_with_tail() {
        let mut dst: Vec<f32> = (0..11).map(|x| x as f32).collect();
        let src = vec![1.0; 11];
        add_assign(&mut dst, &src);
        let expected: Vec<f32> = (1..12).map(|x| x as f32).collect();
        assert_eq!(dst, expected);
    }

    #[test]
    fn test_fuse_offsets_and_coverage() {
        let mut ev = EvidenceTensor::zeros(1, 6, 2);
        let mut scratch = Vec::new();
        let logits = Tensor3::zeros([1, 4, 2]);
        ev.fuse(&logits, Padding { top: 2, bottom: 0 }, &mut scratch).unwrap();
        assert_eq!(ev.coverage(), &[0, 0, 1, 1, 1, 1]);
        assert_eq!(ev.values().row(0, 0), &[0.0, 0.0]);
        assert_eq!(ev.values().row(0, 3), &[0.5, 0.5]);
    }

    #[test]
    fn test_fuse_rejects_misaligned_padding() {
        let mut ev = EvidenceTensor::zeros(1, 6, 2);
        let mut scratch = Vec::new();
        let logits = Tensor3::zeros([1, 4, 2]);
        let err = ev
            .fuse(&logits, Padding { top: 1, bottom: 0 }, &mut scratch)
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::FailureKind::Inference);
        assert!(ev
            .fuse(&Tensor3::zeros([2, 4, 2]), Padding { top: 2, bottom: 0 }, &mut scratch)
            .is_err());
    }

    #[test]
    fn test_coverage_matches_scheduler() {
        let scheduler = WindowScheduler::new(WindowParams {
            seq_len: 37,
            width: 8,
            jump: 3,
            edge_policy: EdgePolicy::Drop,
        })
        .unwrap();
        let mut acc = EvidenceAccumulator::new(2, 37, 5, 3);
        for w in &scheduler {
            acc.fuse(&Tensor3::zeros([2, 8, 5]), &Tensor3::zeros([2, 8, 3]), w.padding)
                .unwrap();
        }
        assert_eq!(acc.base().coverage(), scheduler.coverage().as_slice());
        assert_eq!(acc.rle().coverage(), scheduler.coverage().as_slice());
        // Each covered position carries one unit of probability per window
        for (p, &c) in scheduler.coverage().iter().enumerate() {
            let total: f32 = acc.base().values().row(1, p).iter().sum();
            assert!((total - c as f32).abs() < 1e-5);
        }
    }

    #[test]
    fn test_fuse_order_invariance() {
        let scheduler = WindowScheduler::new(WindowParams {
            seq_len: 1000,
            width: 100,
            jump: 50,
            edge_policy: EdgePolicy::Drop,
        })
        .unwrap();
        let mut rng = StdRng::seed_from_u64(2024);
        let windows: Vec<_> = scheduler
            .iter()
            .map(|w| {
                (
                    w.padding,
                    random_logits(&mut rng, [3, 100, 5]),
                    random_logits(&mut rng, [3, 100, 11]),
                )
            })
            .collect();

        let fuse_all = |order: &[usize]| {
            let mut acc = EvidenceAccumulator::new(3, 1000, 5, 11);
            for &k in order {
                let (padding, base, rle) = &windows[k];
                acc.fuse(base, rle, *padding).unwrap();
            }
            acc
        };

        let forward: Vec<usize> = (0..windows.len()).collect();
        let mut shuffled = forward.clone();
        shuffled.shuffle(&mut rng);
        let reversed: Vec<usize> = forward.iter().rev().copied().collect();

        let reference = fuse_all(&forward);
        for order in [shuffled, reversed] {
            let other = fuse_all(&order);
            for (a, b) in reference
                .base()
                .values()
                .data()
                .iter()
                .zip(other.base().values().data())
            {
                assert!((a - b).abs() < 1e-5);
            }
            for (a, b) in reference
                .rle()
                .values()
                .data()
                .iter()
                .zip(other.rle().values().data())
            {
                assert!((a - b).abs() < 1e-5);
            }
            assert_eq!(reference.base().coverage(), other.base().coverage());
        }
    }

    #[test]
    fn test_reset_resizes() {
        let mut acc = EvidenceAccumulator::new(4, 6, 5, 3);
        acc.fuse(
            &Tensor3::zeros([4, 6, 5]),
            &Tensor3::zeros([4, 6, 3]),
            Padding { top: 0, bottom: 0 },
        )
        .unwrap();
        acc.reset(2);
        assert_eq!(acc.base().batch(), 2);
        assert!(acc.base().values().data().iter().all(|&x| x == 0.0));
        assert!(acc.rle().coverage().iter().all(|&c| c == 0));
    }
}
