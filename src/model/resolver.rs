//! # Label Resolution
//!
//! Collapses accumulated evidence to one class id per position by arg-max
//! over the class axis.
//!
//! Tie-break: the lowest class id wins. A class only replaces the current
//! best when its score is strictly greater, so equal scores keep the earlier
//! class and NaN never wins. A position with all-zero evidence (no window
//! covered it) therefore resolves to class 0.

use crate::data::labels::LabelSequence;
use crate::data::ClassId;
use crate::model::evidence::EvidenceTensor;

/// Arg-max resolver for evidence tensors
#[derive(Clone, Copy, Debug, Default)]
pub struct LabelResolver;

impl LabelResolver {
    /// Resolve every position of every instance
    pub fn resolve(evidence: &EvidenceTensor) -> LabelSequence {
        let values = evidence.values();
        let [batch, seq_len, classes] = values.dims();
        let labels = if classes == 0 {
            vec![ClassId::NO_EVIDENCE.0; batch * seq_len]
        } else {
            values
                .data()
                .chunks_exact(classes)
                .map(|scores| argmax(scores) as u32)
                .collect()
        };
        LabelSequence::new(batch, seq_len, labels)
    }
}

/// Index of the first maximum of `scores`; [`ClassId::NO_EVIDENCE`] for an
/// empty slice
#[inline]
pub fn argmax(scores: &[f32]) -> usize {
    let mut best = ClassId::NO_EVIDENCE.as_usize();
    let mut best_score = match scores.first() {
        Some(&s) => s,
        None => return best,
    };
    for (k, &s) in scores.iter().enumerate().skip(1) {
        // NaN in the running best is displaced by any real score
        if s > best_score || (best_score.is_nan() && !s.is_nan()) {
            best = k;
            best_score = s;
        }
    }
    best
}
