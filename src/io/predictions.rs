//! # Prediction Output
//!
//! The [`OutputSink`] seam receives one resolved instance at a time.
//! [`PredictionWriter`] persists them as a BGZF-compressed TSV, one artifact
//! per worker named `<prefix>_<rank>.tsv.gz`.
//!
//! Records go to `<artifact>.partial` and the file is renamed into place
//! only by [`PredictionWriter::finish`], so a worker that fails midway
//! never leaves something that looks like a complete result.
//!
//! Line layout (tab-separated, after a `#` header line):
//! `contig  start  end  chunk_id  filename  ref:ins,...  bases  rle,...`
//! with bases written as `_ACGT` symbols.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use noodles::bgzf::io as bgzf_io;

use crate::data::labels::BaseClass;
use crate::data::sequence::{GenomicPosition, SequenceMeta};
use crate::data::Rank;
use crate::error::{PolishError, Result};

const HEADER: &str = "#contig\tcontig_start\tcontig_end\tchunk_id\tfilename\tpositions\tbases\trle";

/// Destination for resolved predictions
pub trait OutputSink {
    /// Persist the labels of one instance. `base` and `rle` hold one class
    /// id per image column, aligned with `meta.positions`.
    fn write(&mut self, meta: &SequenceMeta, base: &[u32], rle: &[u32]) -> Result<()>;

    /// Complete the output after the last record
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

/// One decoded prediction line
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Prediction {
    pub contig: String,
    pub contig_start: u64,
    pub contig_end: u64,
    pub chunk_id: u32,
    pub filename: String,
    pub positions: Vec<GenomicPosition>,
    pub base: Vec<u32>,
    pub rle: Vec<u32>,
}

impl Prediction {
    /// Consensus string of the base labels
    pub fn base_symbols(&self) -> String {
        self.base.iter().map(|&b| BaseClass::symbol_for(b)).collect()
    }
}

/// In-memory sink
impl OutputSink for Vec<Prediction> {
    fn write(&mut self, meta: &SequenceMeta, base: &[u32], rle: &[u32]) -> Result<()> {
        self.push(Prediction {
            contig: meta.contig.clone(),
            contig_start: meta.contig_start,
            contig_end: meta.contig_end,
            chunk_id: meta.chunk_id,
            filename: meta.filename.clone(),
            positions: meta.positions.clone(),
            base: base.to_vec(),
            rle: rle.to_vec(),
        });
        Ok(())
    }
}

/// Artifact path of `rank`: `<prefix>_<rank>.tsv.gz`
pub fn output_path(prefix: &Path, rank: Rank) -> PathBuf {
    PathBuf::from(format!("{}_{}.tsv.gz", prefix.display(), rank))
}

/// Temporary path the artifact is written under until finished
pub fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".partial");
    PathBuf::from(name)
}

/// BGZF TSV prediction file
pub struct PredictionWriter {
    writer: Option<BufWriter<bgzf_io::Writer<File>>>,
    path: PathBuf,
    partial: PathBuf,
    n_records: usize,
}

impl PredictionWriter {
    /// Start the artifact for `path`; records go to its `.partial` file.
    ///
    /// An artifact left at `path` by an earlier run is removed first, so
    /// `path` only exists again once this writer finishes.
    pub fn create(path: &Path) -> Result<Self> {
        match std::fs::remove_file(path) {
            Ok(()) => tracing::warn!(path = %path.display(), "Removed stale prediction artifact"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(PolishError::write(format!(
                    "Failed to remove stale {}: {}",
                    path.display(),
                    e
                )))
            }
        }
        let partial = partial_path(path);
        let file = File::create(&partial).map_err(|e| {
            PolishError::write(format!("Failed to create {}: {}", partial.display(), e))
        })?;
        let mut writer = BufWriter::new(bgzf_io::Writer::new(file));
        writeln!(writer, "{}", HEADER).map_err(|e| write_error(&partial, e))?;
        Ok(Self {
            writer: Some(writer),
            path: path.to_path_buf(),
            partial,
            n_records: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn n_records(&self) -> usize {
        self.n_records
    }

    fn write_record(
        writer: &mut impl Write,
        meta: &SequenceMeta,
        base: &[u32],
        rle: &[u32],
    ) -> std::io::Result<()> {
        write!(
            writer,
            "{}\t{}\t{}\t{}\t{}\t",
            meta.contig, meta.contig_start, meta.contig_end, meta.chunk_id, meta.filename
        )?;
        for (i, p) in meta.positions.iter().enumerate() {
            if i > 0 {
                writer.write_all(b",")?;
            }
            write!(writer, "{}:{}", p.ref_pos, p.insert)?;
        }
        writer.write_all(b"\t")?;
        let symbols: String = base.iter().map(|&b| BaseClass::symbol_for(b)).collect();
        writer.write_all(symbols.as_bytes())?;
        writer.write_all(b"\t")?;
        for (i, r) in rle.iter().enumerate() {
            if i > 0 {
                writer.write_all(b",")?;
            }
            write!(writer, "{}", r)?;
        }
        writer.write_all(b"\n")
    }
}

impl OutputSink for PredictionWriter {
    fn write(&mut self, meta: &SequenceMeta, base: &[u32], rle: &[u32]) -> Result<()> {
        for (field, value) in [("contig", &meta.contig), ("filename", &meta.filename)] {
            if value.contains(['\t', '\n', '\r']) {
                return Err(PolishError::write(format!(
                    "chunk {}: {} {:?} contains a tab or line break",
                    meta.chunk_id, field, value
                )));
            }
        }
        if base.len() != meta.positions.len() || rle.len() != meta.positions.len() {
            return Err(PolishError::write(format!(
                "chunk {} of {}: {} bases and {} run lengths for {} positions",
                meta.chunk_id,
                meta.contig,
                base.len(),
                rle.len(),
                meta.positions.len()
            )));
        }
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| PolishError::write(format!("{} already finished", self.path.display())))?;
        Self::write_record(writer, meta, base, rle).map_err(|e| write_error(&self.partial, e))?;
        self.n_records += 1;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        let Some(writer) = self.writer.take() else {
            return Ok(());
        };
        let bgzf = writer
            .into_inner()
            .map_err(|e| write_error(&self.partial, e.into_error()))?;
        let file = bgzf.finish().map_err(|e| write_error(&self.partial, e))?;
        file.sync_all().map_err(|e| write_error(&self.partial, e))?;
        std::fs::rename(&self.partial, &self.path).map_err(|e| {
            PolishError::write(format!(
                "Failed to move {} to {}: {}",
                self.partial.display(),
                self.path.display(),
                e
            ))
        })?;
        tracing::info!(path = %self.path.display(), records = self.n_records, "Predictions written");
        Ok(())
    }
}

fn write_error(path: &Path, e: std::io::Error) -> PolishError {
    PolishError::write(format!("Failed to write {}: {}", path.display(), e))
}

/// Decode every record of a finished artifact
pub fn read_predictions(path: &Path) -> Result<Vec<Prediction>> {
    let file = File::open(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => PolishError::FileNotFound {
            path: path.to_path_buf(),
        },
        _ => PolishError::Io(e),
    })?;
    let reader = BufReader::new(bgzf_io::Reader::new(file));
    let mut out = Vec::new();
    for (lineno, line) in reader.lines().enumerate() {
        let line = line?;
        if line.starts_with('#') || line.is_empty() {
            continue;
        }
        out.push(parse_line(&line).map_err(|msg| {
            PolishError::invalid_data(format!("{}:{}: {}", path.display(), lineno + 1, msg))
        })?);
    }
    Ok(out)
}

fn parse_line(line: &str) -> std::result::Result<Prediction, String> {
    let fields: Vec<&str> = line.split('\t').collect();
    if fields.len() != 8 {
        return Err(format!("expected 8 fields, found {}", fields.len()));
    }
    let num = |s: &str, what: &str| s.parse::<u64>().map_err(|_| format!("bad {}: {:?}", what, s));

    let positions = split_list(fields[5])
        .map(|p| {
            let (r, i) = p.split_once(':').ok_or_else(|| format!("bad position {:?}", p))?;
            Ok(GenomicPosition::new(
                num(r, "position")?,
                num(i, "insert index")? as u32,
            ))
        })
        .collect::<std::result::Result<Vec<_>, String>>()?;
    let base = fields[6]
        .chars()
        .map(|c| BaseClass::class_for_symbol(c).ok_or_else(|| format!("bad base symbol {:?}", c)))
        .collect::<std::result::Result<Vec<_>, String>>()?;
    let rle = split_list(fields[7])
        .map(|r| num(r, "run length").map(|v| v as u32))
        .collect::<std::result::Result<Vec<_>, String>>()?;

    Ok(Prediction {
        contig: fields[0].to_string(),
        contig_start: num(fields[1], "start")?,
        contig_end: num(fields[2], "end")?,
        chunk_id: num(fields[3], "chunk id")? as u32,
        filename: fields[4].to_string(),
        positions,
        base,
        rle,
    })
}

fn split_list(s: &str) -> impl Iterator<Item = &str> {
    s.split(',').filter(|p| !p.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(chunk: u32) -> SequenceMeta {
        SequenceMeta {
            contig: "contig_2".to_string(),
            contig_start: 40,
            contig_end: 43,
            chunk_id: chunk,
            positions: vec![
                GenomicPosition::new(40, 0),
                GenomicPosition::new(40, 1),
                GenomicPosition::new(41, 0),
            ],
            filename: "part_3.img".to_string(),
        }
    }

    #[test]
    fn test_output_path() {
        let p = output_path(Path::new("/tmp/out/preds"), Rank(3));
        assert_eq!(p, PathBuf::from("/tmp/out/preds_3.tsv.gz"));
        assert_eq!(partial_path(&p), PathBuf::from("/tmp/out/preds_3.tsv.gz.partial"));
    }

    #[test]
    fn test_finish_publishes_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let path = output_path(&dir.path().join("run"), Rank(0));
        let mut w = PredictionWriter::create(&path).unwrap();
        w.write(&meta(5), &[1, 0, 4], &[2, 0, 11]).unwrap();
        w.write(&meta(6), &[2, 3, 3], &[1, 1, 1]).unwrap();
        assert!(!path.exists());
        assert!(partial_path(&path).exists());
        w.finish().unwrap();
        assert!(path.exists());
        assert!(!partial_path(&path).exists());

        let preds = read_predictions(&path).unwrap();
        assert_eq!(preds.len(), 2);
        assert_eq!(preds[0].chunk_id, 5);
        assert_eq!(preds[0].base_symbols(), "A_T");
        assert_eq!(preds[0].rle, vec![2, 0, 11]);
        assert_eq!(preds[0].positions[1], GenomicPosition::new(40, 1));
        assert_eq!(preds[1].filename, "part_3.img");
        assert_eq!(preds[1].base, vec![2, 3, 3]);
    }

    #[test]
    fn test_unfinished_writer_leaves_partial() {
        let dir = tempfile::tempdir().unwrap();
        let path = output_path(&dir.path().join("run"), Rank(1));
        {
            let mut w = PredictionWriter::create(&path).unwrap();
            w.write(&meta(0), &[1, 1, 1], &[1, 1, 1]).unwrap();
        }
        assert!(!path.exists());
        assert!(partial_path(&path).exists());
    }

    #[test]
    fn test_length_mismatch_is_write_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = PredictionWriter::create(&dir.path().join("x.tsv.gz")).unwrap();
        let err = w.write(&meta(0), &[1, 1], &[1, 1, 1]).unwrap_err();
        assert_eq!(err.kind(), crate::error::FailureKind::Write);
    }

    #[test]
    fn test_create_removes_stale_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let path = output_path(&dir.path().join("run"), Rank(0));
        std::fs::write(&path, b"old").unwrap();
        let mut w = PredictionWriter::create(&path).unwrap();
        assert!(!path.exists());
        w.write(&meta(1), &[1, 2, 3], &[1, 1, 1]).unwrap();
        w.finish().unwrap();
        assert_eq!(read_predictions(&path).unwrap().len(), 1);
    }

    #[test]
    fn test_rejects_field_separators_in_names() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = PredictionWriter::create(&dir.path().join("x.tsv.gz")).unwrap();
        let mut bad = meta(0);
        bad.contig = "chr1\tx".to_string();
        let err = w.write(&bad, &[1, 1, 1], &[1, 1, 1]).unwrap_err();
        assert_eq!(err.kind(), crate::error::FailureKind::Write);
        let mut bad = meta(0);
        bad.filename = "a\nb.img".to_string();
        assert!(w.write(&bad, &[1, 1, 1], &[1, 1, 1]).is_err());
        assert_eq!(w.n_records(), 0);

        // Commas only separate list fields
        let mut ok = meta(2);
        ok.contig = "chr1,alt".to_string();
        w.write(&ok, &[1, 1, 1], &[1, 1, 1]).unwrap();
        w.finish().unwrap();
        let preds = read_predictions(&dir.path().join("x.tsv.gz")).unwrap();
        assert_eq!(preds[0].contig, "chr1,alt");
    }

    #[test]
    fn test_create_in_missing_dir_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = PredictionWriter::create(&dir.path().join("no/such/dir/x.tsv.gz"))
            .err()
            .unwrap();
        assert_eq!(err.kind(), crate::error::FailureKind::Write);
    }

    #[test]
    fn test_memory_sink() {
        let mut sink: Vec<Prediction> = Vec::new();
        sink.write(&meta(9), &[0, 2, 1], &[0, 3, 1]).unwrap();
        assert_eq!(sink[0].base_symbols(), "_CA");
    }
}
