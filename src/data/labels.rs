//! # Label Alphabets and Label Sequences
//!
//! Base-identity classes follow the training label encoding: class 0 is the
//! gap, which also absorbs `N`; classes 1..=4 are A, C, G, T. Run-length
//! classes are literal run lengths, so class 0 is a run of length zero. In
//! both heads class 0 is therefore the label a position gets when nothing
//! covered it.

use crate::data::ClassId;

/// Base-identity class
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BaseClass {
    Gap = 0,
    A = 1,
    C = 2,
    G = 3,
    T = 4,
}

impl BaseClass {
    /// Number of base-identity classes
    pub const COUNT: usize = 5;

    /// Map an ASCII base from a truth sequence to its class
    pub fn from_ascii(b: u8) -> Self {
        match b {
            b'A' | b'a' => BaseClass::A,
            b'C' | b'c' => BaseClass::C,
            b'G' | b'g' => BaseClass::G,
            b'T' | b't' => BaseClass::T,
            _ => BaseClass::Gap,
        }
    }

    pub fn from_class(id: ClassId) -> Option<Self> {
        match id.0 {
            0 => Some(BaseClass::Gap),
            1 => Some(BaseClass::A),
            2 => Some(BaseClass::C),
            3 => Some(BaseClass::G),
            4 => Some(BaseClass::T),
            _ => None,
        }
    }

    /// Printable symbol
    pub fn symbol(self) -> char {
        match self {
            BaseClass::Gap => '_',
            BaseClass::A => 'A',
            BaseClass::C => 'C',
            BaseClass::G => 'G',
            BaseClass::T => 'T',
        }
    }

    /// Symbol for a raw class id; ids outside the alphabet print as `?`
    pub fn symbol_for(id: u32) -> char {
        Self::from_class(ClassId(id)).map_or('?', Self::symbol)
    }

    /// Inverse of [`BaseClass::symbol_for`] for alphabet symbols
    pub fn class_for_symbol(c: char) -> Option<u32> {
        match c {
            '_' => Some(0),
            'A' => Some(1),
            'C' => Some(2),
            'G' => Some(3),
            'T' => Some(4),
            _ => None,
        }
    }
}

/// Resolved labels of one class head, `[batch × seq_len]`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LabelSequence {
    batch: usize,
    seq_len: usize,
    labels: Vec<u32>,
}

impl LabelSequence {
    pub fn new(batch: usize, seq_len: usize, labels: Vec<u32>) -> Self {
        debug_assert_eq!(labels.len(), batch * seq_len);
        Self {
            batch,
            seq_len,
            labels,
        }
    }

    #[inline]
    pub fn batch(&self) -> usize {
        self.batch
    }

    #[inline]
    pub fn seq_len(&self) -> usize {
        self.seq_len
    }

    /// Labels of instance `i`
    #[inline]
    pub fn instance(&self, i: usize) -> &[u32] {
        &self.labels[i * self.seq_len..(i + 1) * self.seq_len]
    }

    pub fn as_slice(&self) -> &[u32] {
        &self.labels
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ascii_mapping() {
        assert_eq!(BaseClass::from_ascii(b'A'), BaseClass::A);
        assert_eq!(BaseClass::from_ascii(b'T'), BaseClass::T);
        assert_eq!(BaseClass::from_ascii(b'_'), BaseClass::Gap);
        assert_eq!(BaseClass::from_ascii(b'N'), BaseClass::Gap);
        assert_eq!(BaseClass::G as u8, 3);
    }

    #[test]
    fn test_symbols() {
        let s: String = [0, 1, 2, 3, 4, 9].iter().map(|&c| BaseClass::symbol_for(c)).collect();
        assert_eq!(s, "_ACGT?");
        assert_eq!(BaseClass::class_for_symbol('G'), Some(3));
        assert_eq!(BaseClass::class_for_symbol('?'), None);
    }

    #[test]
    fn test_instance_rows() {
        let labels = LabelSequence::new(2, 3, vec![1, 2, 3, 4, 0, 1]);
        assert_eq!(labels.instance(0), &[1, 2, 3]);
        assert_eq!(labels.instance(1), &[4, 0, 1]);
    }
}
