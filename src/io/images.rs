//! # Pileup Image Container
//!
//! Binary container holding the pileup images of one input file.
//!
//! Format:
//! - [Magic 8 bytes] "PLSHIMG1"
//! - [Header] (Version u32, record count u32, seq_len u32, height u32, channels u32)
//! - [Records] per record: metadata length u32, JSON [`SequenceMeta`],
//!   `seq_len · height · channels` u8 pixels (row-major, position first)
//!
//! Files are memory-mapped and indexed up front so the number of instances
//! in a shard is known before the first batch. Batches are decoded in
//! parallel on the worker's loader pool.

use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};

use anyhow::{bail, ensure, Context};
use memmap2::Mmap;
use rayon::prelude::*;
use tracing::info_span;

use crate::data::sequence::{Batch, ImageShape, SequenceInstance, SequenceMeta};
use crate::error::{PolishError, Result};

const MAGIC: &[u8; 8] = b"PLSHIMG1";
const VERSION: u32 = 1;
/// Magic + version + count + seq_len + height + channels
const HEADER_LEN: usize = 8 + 4 * 5;
/// Byte offset of the record count, patched by [`ImageFileWriter::finish`]
const COUNT_OFFSET: u64 = 12;

/// Streaming writer for an image container
pub struct ImageFileWriter {
    writer: BufWriter<File>,
    shape: ImageShape,
    count: u32,
}

impl ImageFileWriter {
    /// Create `path` and write a header with a zero record count
    pub fn create(path: &Path, shape: ImageShape) -> anyhow::Result<Self> {
        let file = File::create(path)
            .with_context(|| format!("Failed to create image file {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        writer.write_all(MAGIC)?;
        writer.write_all(&VERSION.to_le_bytes())?;
        writer.write_all(&0u32.to_le_bytes())?;
        for dim in [shape.seq_len, shape.height, shape.channels] {
            writer.write_all(&u32::try_from(dim)?.to_le_bytes())?;
        }
        Ok(Self {
            writer,
            shape,
            count: 0,
        })
    }

    /// Append one record
    pub fn push(&mut self, meta: &SequenceMeta, pixels: &[u8]) -> anyhow::Result<()> {
        ensure!(
            pixels.len() == self.shape.n_pixels(),
            "image has {} pixels, expected {}",
            pixels.len(),
            self.shape.n_pixels()
        );
        ensure!(
            meta.positions.len() == self.shape.seq_len,
            "{} coordinates for a sequence of {}",
            meta.positions.len(),
            self.shape.seq_len
        );
        let json = serde_json::to_vec(meta)?;
        self.writer.write_all(&u32::try_from(json.len())?.to_le_bytes())?;
        self.writer.write_all(&json)?;
        self.writer.write_all(pixels)?;
        self.count += 1;
        Ok(())
    }

    /// Patch the record count and flush. Returns the number of records.
    pub fn finish(mut self) -> anyhow::Result<u32> {
        self.writer.seek(SeekFrom::Start(COUNT_OFFSET))?;
        self.writer.write_all(&self.count.to_le_bytes())?;
        self.writer.flush()?;
        Ok(self.count)
    }
}

#[derive(Clone, Copy, Debug)]
struct RecordSpan {
    meta: (usize, usize),
    pixels: usize,
}

/// One mapped input file and its record table
struct ImageFile {
    name: String,
    mmap: Mmap,
    records: Vec<RecordSpan>,
}

impl ImageFile {
    fn open(path: &Path, shape: &ImageShape) -> anyhow::Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("Failed to open image file {}", path.display()))?;
        // SAFETY: the file is opened read-only and not modified while mapped
        let mmap = unsafe { Mmap::map(&file) }.context("Failed to map image file")?;
        let records = index_records(&mmap, shape)
            .with_context(|| format!("Corrupt image file {}", path.display()))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Ok(Self { name, mmap, records })
    }
}

fn read_u32(bytes: &[u8], offset: usize) -> anyhow::Result<u32> {
    let end = offset + 4;
    ensure!(end <= bytes.len(), "truncated at byte {}", offset);
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[offset..end]);
    Ok(u32::from_le_bytes(buf))
}

fn index_records(bytes: &[u8], shape: &ImageShape) -> anyhow::Result<Vec<RecordSpan>> {
    ensure!(bytes.len() >= HEADER_LEN, "file shorter than header");
    if &bytes[0..8] != MAGIC {
        bail!("Invalid magic bytes");
    }
    let version = read_u32(bytes, 8)?;
    if version != VERSION {
        bail!("Unsupported image container version {}", version);
    }
    let count = read_u32(bytes, 12)? as usize;
    let dims = [
        read_u32(bytes, 16)? as usize,
        read_u32(bytes, 20)? as usize,
        read_u32(bytes, 24)? as usize,
    ];
    if dims != [shape.seq_len, shape.height, shape.channels] {
        bail!(
            "image geometry {:?} does not match configured {}x{}x{}",
            dims,
            shape.seq_len,
            shape.height,
            shape.channels
        );
    }

    let n_pixels = shape.n_pixels();
    // The header count is untrusted; reserve no more than the file can hold
    let max_records = (bytes.len() - HEADER_LEN) / (4 + n_pixels);
    ensure!(
        count <= max_records,
        "header claims {} records but file holds at most {}",
        count,
        max_records
    );
    let mut records = Vec::with_capacity(count);
    let mut offset = HEADER_LEN;
    for rec in 0..count {
        let meta_len = read_u32(bytes, offset).with_context(|| format!("record {}", rec))? as usize;
        let meta_start = offset + 4;
        let pixels = meta_start + meta_len;
        let end = pixels
            .checked_add(n_pixels)
            .filter(|&end| end <= bytes.len())
            .with_context(|| format!("record {} truncated", rec))?;
        records.push(RecordSpan {
            meta: (meta_start, meta_len),
            pixels,
        });
        offset = end;
    }
    ensure!(
        offset == bytes.len(),
        "{} trailing bytes after {} records",
        bytes.len() - offset,
        count
    );
    Ok(records)
}

/// All instances of one worker's shard
pub struct ImageDataset {
    shape: ImageShape,
    files: Vec<ImageFile>,
    /// `(file, record)` for every instance, in file order
    index: Vec<(u32, u32)>,
}

impl ImageDataset {
    /// Map and index every file of the shard
    ///
    /// # Errors
    /// Missing files are `FileNotFound`; corrupt containers are `InvalidData`.
    pub fn open(paths: &[PathBuf], shape: &ImageShape) -> Result<Self> {
        let _span = info_span!("index_images", n_files = paths.len()).entered();
        let mut files = Vec::with_capacity(paths.len());
        let mut index = Vec::new();
        for (f, path) in paths.iter().enumerate() {
            if !path.exists() {
                return Err(PolishError::FileNotFound { path: path.clone() });
            }
            let file = ImageFile::open(path, shape)
                .map_err(|e| PolishError::invalid_data(format!("{:#}", e)))?;
            index.extend((0..file.records.len()).map(|r| (f as u32, r as u32)));
            files.push(file);
        }
        tracing::debug!(n_instances = index.len(), "Indexed image files");
        Ok(Self {
            shape: *shape,
            files,
            index,
        })
    }

    pub fn shape(&self) -> &ImageShape {
        &self.shape
    }

    pub fn n_instances(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Number of batches of at most `batch_size` instances
    pub fn n_batches(&self, batch_size: usize) -> usize {
        self.n_instances().div_ceil(batch_size.max(1))
    }

    /// Instance ranges of consecutive batches
    pub fn batch_ranges(&self, batch_size: usize) -> impl Iterator<Item = Range<usize>> + '_ {
        let size = batch_size.max(1);
        (0..self.n_instances())
            .step_by(size)
            .map(move |s| s..(s + size).min(self.n_instances()))
    }

    /// Decode one instance
    pub fn instance(&self, i: usize) -> Result<SequenceInstance> {
        let &(f, r) = self
            .index
            .get(i)
            .ok_or_else(|| PolishError::invalid_data(format!("instance {} out of range", i)))?;
        let file = &self.files[f as usize];
        let span = file.records[r as usize];
        let (start, len) = span.meta;
        let mut meta: SequenceMeta = serde_json::from_slice(&file.mmap[start..start + len])
            .map_err(|e| {
                PolishError::invalid_data(format!("Bad metadata in record {} of {}: {}", r, file.name, e))
            })?;
        if meta.positions.len() != self.shape.seq_len {
            return Err(PolishError::invalid_data(format!(
                "record {} of {} has {} coordinates, expected {}",
                r,
                file.name,
                meta.positions.len(),
                self.shape.seq_len
            )));
        }
        meta.filename = file.name.clone();
        let pixels = &file.mmap[span.pixels..span.pixels + self.shape.n_pixels()];
        let image = pixels.iter().map(|&p| p as f32).collect();
        Ok(SequenceInstance { meta, image })
    }

    /// Decode the instances in `range` on `pool` and stack them in order
    pub fn load_batch(&self, range: Range<usize>, pool: &rayon::ThreadPool) -> Result<Batch> {
        let instances = pool.install(|| {
            range
                .into_par_iter()
                .map(|i| self.instance(i))
                .collect::<Result<Vec<_>>>()
        })?;
        Batch::from_instances(instances, &self.shape)
    }
}
