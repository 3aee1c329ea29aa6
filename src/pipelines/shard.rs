//! # Shard Assignment
//!
//! Splits the input files of a run into one shard per worker and fixes the
//! device of every rank. Shards are pairwise disjoint and together cover the
//! input exactly, so every instance is predicted by exactly one worker.

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::data::Rank;
use crate::error::{PolishError, Result};

/// Compute device of one worker
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    Cpu(u32),
    /// Named accelerator such as `cuda:1`; not available in this build
    Accelerator { kind: String, index: u32 },
}

impl Device {
    /// Default device of `rank`
    pub fn for_rank(rank: Rank) -> Self {
        Device::Cpu(rank.0)
    }

    /// Fail with a startup error if the device cannot be used
    pub fn ensure_available(&self) -> Result<()> {
        match self {
            Device::Cpu(_) => Ok(()),
            Device::Accelerator { .. } => Err(PolishError::startup(format!(
                "device {} unavailable: only cpu devices are supported",
                self
            ))),
        }
    }
}

impl FromStr for Device {
    type Err = PolishError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (kind, index) = match s.split_once(':') {
            Some((k, i)) => {
                let index = i
                    .parse::<u32>()
                    .map_err(|_| PolishError::config(format!("invalid device index in '{}'", s)))?;
                (k, index)
            }
            None => (s, 0),
        };
        if kind.is_empty() {
            return Err(PolishError::config(format!("invalid device '{}'", s)));
        }
        match kind.to_ascii_lowercase().as_str() {
            "cpu" => Ok(Device::Cpu(index)),
            other => Ok(Device::Accelerator {
                kind: other.to_string(),
                index,
            }),
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu(i) => write!(f, "cpu:{}", i),
            Device::Accelerator { kind, index } => write!(f, "{}:{}", kind, index),
        }
    }
}

/// Per-rank input files and devices
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardAssignment {
    shards: Vec<Vec<PathBuf>>,
    devices: Vec<Device>,
}

impl ShardAssignment {
    /// Split `files` into `devices.len()` contiguous shards of near-equal size.
    ///
    /// Files are deduplicated and sorted first, so rank `r` of `w` gets the
    /// slice `[r·n/w, (r+1)·n/w)` of the sorted list.
    pub fn partition(files: &[PathBuf], devices: Vec<Device>) -> Result<Self> {
        let world = devices.len();
        if world == 0 {
            return Err(PolishError::config("at least one worker is required"));
        }
        let sorted: Vec<PathBuf> = files.iter().cloned().collect::<BTreeSet<_>>().into_iter().collect();
        let n = sorted.len();
        let shards = (0..world)
            .map(|r| sorted[r * n / world..(r + 1) * n / world].to_vec())
            .collect();
        Self::new(shards, devices)
    }

    /// Use explicit shards. Shards must be disjoint and match `devices` in number.
    pub fn new(shards: Vec<Vec<PathBuf>>, devices: Vec<Device>) -> Result<Self> {
        if shards.is_empty() {
            return Err(PolishError::config("at least one worker is required"));
        }
        if shards.len() != devices.len() {
            return Err(PolishError::config(format!(
                "{} shards for {} devices",
                shards.len(),
                devices.len()
            )));
        }
        let mut seen = BTreeSet::new();
        for (rank, shard) in shards.iter().enumerate() {
            for file in shard {
                if !seen.insert(file) {
                    return Err(PolishError::config(format!(
                        "{} assigned twice (again to rank {})",
                        file.display(),
                        rank
                    )));
                }
            }
        }
        Ok(Self { shards, devices })
    }

    pub fn world_size(&self) -> usize {
        self.shards.len()
    }

    pub fn ranks(&self) -> impl Iterator<Item = Rank> {
        (0..self.world_size()).map(Rank::from)
    }

    pub fn shard(&self, rank: Rank) -> Result<&[PathBuf]> {
        self.shards
            .get(rank.as_usize())
            .map(Vec::as_slice)
            .ok_or_else(|| self.rank_error(rank))
    }

    pub fn device(&self, rank: Rank) -> Result<&Device> {
        self.devices.get(rank.as_usize()).ok_or_else(|| self.rank_error(rank))
    }

    pub fn n_files(&self) -> usize {
        self.shards.iter().map(Vec::len).sum()
    }

    fn rank_error(&self, rank: Rank) -> PolishError {
        PolishError::config(format!("rank {} outside a world of {}", rank, self.world_size()))
    }
}
