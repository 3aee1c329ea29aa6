//! # Batch Progress and ETA
//!
//! Progress accounting for the batch loop of one worker. The clock counts
//! completed batches and estimates the remaining time as the wall-clock
//! duration of the most recent batch times the number of batches left.
//!
//! Reporting is behind [`ProgressReporter`] so only the primary rank prints
//! and tests can run silently. On a terminal the reporter rewrites a single
//! progress line; otherwise it emits one structured log event per batch.

use std::fmt;
use std::io::{self, IsTerminal, Write};
use std::time::{Duration, Instant};

use crate::data::Rank;

/// Remaining-time estimate split into hours, minutes and seconds
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct Eta {
    pub hours: u64,
    pub minutes: u64,
    pub seconds: u64,
}

impl Eta {
    /// `last_batch × remaining`, truncated to whole seconds
    pub fn estimate(last_batch: Duration, remaining: usize) -> Self {
        let total = last_batch.saturating_mul(remaining.min(u32::MAX as usize) as u32);
        Self::from_secs(total.as_secs())
    }

    pub fn from_secs(secs: u64) -> Self {
        Self {
            hours: secs / 3600,
            minutes: (secs % 3600) / 60,
            seconds: secs % 60,
        }
    }

    pub fn as_secs(&self) -> u64 {
        self.hours * 3600 + self.minutes * 60 + self.seconds
    }
}

impl fmt::Display for Eta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}h{:02}m{:02}s", self.hours, self.minutes, self.seconds)
    }
}

/// State after one completed batch
#[derive(Clone, Debug)]
pub struct BatchProgress {
    pub rank: Rank,
    pub batches_done: usize,
    pub total_batches: usize,
    pub instances_done: usize,
    pub last_batch: Duration,
    pub elapsed: Duration,
    pub eta: Eta,
}

/// Monotonic batch counter with ETA
#[derive(Debug)]
pub struct BatchClock {
    rank: Rank,
    total_batches: usize,
    batches_done: usize,
    instances_done: usize,
    start_time: Instant,
}

impl BatchClock {
    pub fn new(rank: Rank, total_batches: usize) -> Self {
        Self {
            rank,
            total_batches,
            batches_done: 0,
            instances_done: 0,
            start_time: Instant::now(),
        }
    }

    pub fn batches_done(&self) -> usize {
        self.batches_done
    }

    pub fn instances_done(&self) -> usize {
        self.instances_done
    }

    /// Record a completed batch of `n_instances` that took `duration`
    pub fn record(&mut self, n_instances: usize, duration: Duration) -> BatchProgress {
        self.batches_done += 1;
        self.instances_done += n_instances;
        let remaining = self.total_batches.saturating_sub(self.batches_done);
        BatchProgress {
            rank: self.rank,
            batches_done: self.batches_done,
            total_batches: self.total_batches,
            instances_done: self.instances_done,
            last_batch: duration,
            elapsed: self.start_time.elapsed(),
            eta: Eta::estimate(duration, remaining),
        }
    }
}

/// Receives one report per completed batch
pub trait ProgressReporter {
    fn report(&mut self, progress: &BatchProgress);

    /// Called once after the last batch
    fn finish(&mut self) {}
}

/// Discards all reports
#[derive(Clone, Copy, Debug, Default)]
pub struct NullReporter;

impl ProgressReporter for NullReporter {
    fn report(&mut self, _progress: &BatchProgress) {}
}

/// Progress on stderr: a rewritten line on a terminal, log events otherwise
#[derive(Debug)]
pub struct StderrReporter {
    is_tty: bool,
    dirty: bool,
}

impl StderrReporter {
    pub fn new() -> Self {
        Self {
            is_tty: io::stderr().is_terminal(),
            dirty: false,
        }
    }
}

impl Default for StderrReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressReporter for StderrReporter {
    fn report(&mut self, progress: &BatchProgress) {
        if self.is_tty {
            print_tty_progress(progress);
            self.dirty = true;
        } else {
            tracing::info!(
                rank = progress.rank.0,
                batches = progress.batches_done,
                total = progress.total_batches,
                instances = progress.instances_done,
                batch_secs = format!("{:.2}", progress.last_batch.as_secs_f64()),
                elapsed = %format_duration(progress.elapsed.as_secs_f64()),
                eta = %progress.eta,
                rss_mb = get_rss_mb().map(|m| m.to_string()).unwrap_or_else(|| "?".to_string()),
                "batches done"
            );
        }
    }

    fn finish(&mut self) {
        if self.is_tty && self.dirty {
            eprintln!();
            self.dirty = false;
        }
    }
}

/// Reporter for a worker: the primary rank reports, every other rank is silent
pub fn reporter_for(rank: Rank) -> Box<dyn ProgressReporter> {
    if rank.is_primary() {
        Box::new(StderrReporter::new())
    } else {
        Box::new(NullReporter)
    }
}

/// Get RSS memory usage in MB (Linux only)
fn get_rss_mb() -> Option<u64> {
    #[cfg(target_os = "linux")]
    {
        std::fs::read_to_string("/proc/self/statm")
            .ok()
            .and_then(|s| {
                let parts: Vec<&str> = s.split_whitespace().collect();
                // Second field is RSS in pages
                parts.get(1)?.parse::<u64>().ok()
            })
            .map(|pages| pages * 4096 / (1024 * 1024))
    }
    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}

/// Format duration in human-readable form
pub fn format_duration(secs: f64) -> String {
    if secs < 60.0 {
        format!("{:.0}s", secs)
    } else if secs < 3600.0 {
        let mins = (secs / 60.0).floor();
        let remaining_secs = secs % 60.0;
        format!("{:.0}m{:.0}s", mins, remaining_secs)
    } else {
        format!("{:.1}h", secs / 3600.0)
    }
}

fn print_tty_progress(p: &BatchProgress) {
    let progress_pct = if p.total_batches > 0 {
        (p.batches_done as f64 / p.total_batches as f64 * 100.0).min(100.0)
    } else {
        0.0
    };

    let bar_width = 20;
    let filled = ((progress_pct / 100.0) * bar_width as f64) as usize;
    let bar: String =
        "=".repeat(filled.min(bar_width)) + &" ".repeat(bar_width.saturating_sub(filled));

    let mem_str = get_rss_mb().map(|mb| format!(" {}MB", mb)).unwrap_or_default();

    eprint!(
        "\r[{}] {:>5.1}% | batches {}/{} | {} | ETA: {}{}    \x1b[K",
        bar,
        progress_pct,
        p.batches_done,
        p.total_batches,
        format_duration(p.elapsed.as_secs_f64()),
        p.eta,
        mem_str
    );
    let _ = io::stderr().flush();
}
