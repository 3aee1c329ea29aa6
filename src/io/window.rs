//! # Sliding Window Infrastructure
//!
//! Partitions the sequence axis of an image into fixed-width overlapping
//! windows. Each window is evaluated by one model call; the scheduler also
//! reports the zero padding that re-aligns the window-local output of width
//! `W` onto the full length `L`.
//!
//! Windows start at 0 and stride by `jump`. With [`EdgePolicy::Drop`] a window
//! that would run past `L` is not produced, so the trailing
//! `L - (last_start + W)` positions receive no evidence. [`EdgePolicy::Clip`]
//! appends one extra full-width window flush with the end of the sequence
//! when that tail is non-empty.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{PolishError, Result};

/// Handling of the tail that no strided window reaches
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgePolicy {
    /// Never produce a window past the end; the tail gets no evidence
    #[default]
    Drop,
    /// Add a final window `[L - W, L)` if the tail would be uncovered
    Clip,
}

impl FromStr for EdgePolicy {
    type Err = PolishError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "drop" => Ok(EdgePolicy::Drop),
            "clip" => Ok(EdgePolicy::Clip),
            other => Err(PolishError::config(format!(
                "unknown edge policy '{}', expected 'drop' or 'clip'",
                other
            ))),
        }
    }
}

impl fmt::Display for EdgePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EdgePolicy::Drop => f.write_str("drop"),
            EdgePolicy::Clip => f.write_str("clip"),
        }
    }
}

/// Zero rows above and below a window-local output
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Padding {
    /// Rows before the window (`start`)
    pub top: usize,
    /// Rows after the window (`L - end`)
    pub bottom: usize,
}

/// One window on the sequence axis, `[start, end)`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WindowSlice {
    pub start: usize,
    pub end: usize,
    /// Re-alignment of the window output onto the full sequence
    pub padding: Padding,
}

impl WindowSlice {
    #[inline]
    pub fn width(&self) -> usize {
        self.end - self.start
    }

    #[inline]
    pub fn contains(&self, pos: usize) -> bool {
        self.start <= pos && pos < self.end
    }
}

/// Window geometry of a run
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowParams {
    /// Sequence length `L`
    pub seq_len: usize,
    /// Window width `W`
    pub width: usize,
    /// Stride `J`
    pub jump: usize,
    #[serde(default)]
    pub edge_policy: EdgePolicy,
}

impl WindowParams {
    /// Check `0 < jump <= width <= seq_len`
    pub fn validate(&self) -> Result<()> {
        if self.jump == 0 {
            return Err(PolishError::config("window jump must be positive"));
        }
        if self.jump > self.width {
            return Err(PolishError::config(format!(
                "window jump ({}) must not exceed window width ({})",
                self.jump, self.width
            )));
        }
        if self.width > self.seq_len {
            return Err(PolishError::config(format!(
                "window width ({}) must not exceed sequence length ({})",
                self.width, self.seq_len
            )));
        }
        Ok(())
    }
}

/// Produces the ordered window slices for one sequence length
#[derive(Clone, Debug)]
pub struct WindowScheduler {
    params: WindowParams,
}

impl WindowScheduler {
    /// Create a scheduler after validating the geometry
    pub fn new(params: WindowParams) -> Result<Self> {
        params.validate()?;
        Ok(Self { params })
    }

    pub fn params(&self) -> &WindowParams {
        &self.params
    }

    #[inline]
    pub fn seq_len(&self) -> usize {
        self.params.seq_len
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.params.width
    }

    /// Fresh iterator over the windows, in increasing start order
    pub fn iter(&self) -> WindowIter {
        WindowIter {
            seq_len: self.params.seq_len,
            width: self.params.width,
            jump: self.params.jump,
            edge_policy: self.params.edge_policy,
            next_start: 0,
            last_end: 0,
            done: false,
        }
    }

    /// All windows collected
    pub fn slices(&self) -> Vec<WindowSlice> {
        self.iter().collect()
    }

    /// Number of windows
    pub fn n_windows(&self) -> usize {
        self.iter().count()
    }

    /// Number of windows containing each position
    pub fn coverage(&self) -> Vec<u32> {
        let mut cov = vec![0u32; self.params.seq_len];
        for w in self.iter() {
            for c in &mut cov[w.start..w.end] {
                *c += 1;
            }
        }
        cov
    }
}

impl<'a> IntoIterator for &'a WindowScheduler {
    type Item = WindowSlice;
    type IntoIter = WindowIter;

    fn into_iter(self) -> WindowIter {
        self.iter()
    }
}

/// Iterator over window slices
#[derive(Clone, Debug)]
pub struct WindowIter {
    seq_len: usize,
    width: usize,
    jump: usize,
    edge_policy: EdgePolicy,
    next_start: usize,
    last_end: usize,
    done: bool,
}

impl WindowIter {
    fn slice(&self, start: usize) -> WindowSlice {
        let end = start + self.width;
        WindowSlice {
            start,
            end,
            padding: Padding {
                top: start,
                bottom: self.seq_len - end,
            },
        }
    }
}

impl Iterator for WindowIter {
    type Item = WindowSlice;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let start = self.next_start;
        if start + self.width <= self.seq_len {
            let slice = self.slice(start);
            self.last_end = slice.end;
            self.next_start = start + self.jump;
            return Some(slice);
        }

        // Strided windows exhausted
        self.done = true;
        match self.edge_policy {
            EdgePolicy::Drop => None,
            EdgePolicy::Clip if self.last_end < self.seq_len => {
                let slice = self.slice(self.seq_len - self.width);
                self.last_end = self.seq_len;
                Some(slice)
            }
            EdgePolicy::Clip => None,
        }
    }
}
