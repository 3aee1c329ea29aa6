//! # Model Checkpoint I/O
//!
//! Binary container for [`ElmanTransducer`] parameters.
//!
//! Format:
//! - [Magic 8 bytes] "PLSHCKPT"
//! - [Version u32]
//! - [Header Length u64]
//! - [Header JSON] (architecture, training metadata, tensor table)
//! - [Tensor Data] little-endian `f32`, tensors back to back in table order

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{bail, ensure, Context, Result};
use memmap2::Mmap;
use serde::{Deserialize, Serialize};

use crate::model::{ElmanTransducer, ModelArch, ModelMeta, SequenceModel};

const MAGIC: &[u8; 8] = b"PLSHCKPT";
const VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct TensorEntry {
    name: String,
    len: usize,
}

#[derive(Serialize, Deserialize)]
struct Header {
    arch: ModelArch,
    meta: ModelMeta,
    tensors: Vec<TensorEntry>,
}

/// Write `model` to `path`
pub fn write_checkpoint(path: &Path, model: &ElmanTransducer) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("Failed to create checkpoint {}", path.display()))?;
    let mut writer = BufWriter::new(file);

    let tensors = model.named_tensors();
    let header = Header {
        arch: *model.arch(),
        meta: *model.meta(),
        tensors: tensors
            .iter()
            .map(|(name, t)| TensorEntry {
                name: name.clone(),
                len: t.len(),
            })
            .collect(),
    };
    let header_json = serde_json::to_vec(&header)?;

    writer.write_all(MAGIC)?;
    writer.write_all(&VERSION.to_le_bytes())?;
    writer.write_all(&(header_json.len() as u64).to_le_bytes())?;
    writer.write_all(&header_json)?;

    for (_, t) in &tensors {
        for v in t.iter() {
            writer.write_all(&v.to_le_bytes())?;
        }
    }
    writer.flush()?;
    Ok(())
}

/// Read a checkpoint written by [`write_checkpoint`]
pub fn read_checkpoint(path: &Path) -> Result<ElmanTransducer> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open checkpoint {}", path.display()))?;
    // SAFETY: the file is opened read-only and not modified while mapped
    let mmap = unsafe { Mmap::map(&file) }.context("Failed to map checkpoint")?;
    let bytes: &[u8] = &mmap;

    ensure!(bytes.len() >= 20, "checkpoint truncated ({} bytes)", bytes.len());
    if &bytes[0..8] != MAGIC {
        bail!("not a checkpoint file (bad magic)");
    }
    let version = u32::from_le_bytes(bytes[8..12].try_into()?);
    ensure!(version == VERSION, "unsupported checkpoint version {}", version);
    let header_len = u64::from_le_bytes(bytes[12..20].try_into()?) as usize;
    let header_end = 20usize
        .checked_add(header_len)
        .filter(|&end| end <= bytes.len())
        .context("checkpoint header runs past end of file")?;
    let header: Header =
        serde_json::from_slice(&bytes[20..header_end]).context("Failed to parse checkpoint header")?;

    let mut offset = header_end;
    let mut tensors = HashMap::with_capacity(header.tensors.len());
    for entry in header.tensors {
        let end = entry
            .len
            .checked_mul(4)
            .and_then(|n_bytes| offset.checked_add(n_bytes))
            .filter(|&end| end <= bytes.len())
            .with_context(|| format!("tensor '{}' runs past end of file", entry.name))?;
        let values: Vec<f32> = bytes[offset..end]
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        offset = end;
        tensors.insert(entry.name, values);
    }
    ensure!(offset == bytes.len(), "{} trailing bytes in checkpoint", bytes.len() - offset);

    let model = ElmanTransducer::from_named_tensors(header.arch, header.meta, tensors)?;
    Ok(model)
}
