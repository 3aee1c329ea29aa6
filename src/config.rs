//! # Configuration Logic
//!
//! ## Role
//! CLI argument parsing and validation.
//!
//! ## Commands
//! - `predict`: run a multi-worker prediction over a set of image files
//! - `worker`: internal; runs one worker from an invocation read on stdin
//!
//! ## Validation
//! - `0 < jump <= window <= seq_len`
//! - batch size and worker count are positive
//! - one device per worker when devices are given (default `cpu:<rank>`)
//! - at least one input image file; directories expand to their `*.img`
//!   files in sorted order
//!
//! ## Example CLI
//! ```bash
//! polisher predict --images images/ --model model.ckpt --output out/preds --workers 2
//! ```

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand, ValueHint};

use crate::data::Rank;
use crate::error::{PolishError, Result};
use crate::io::window::{EdgePolicy, WindowParams};
use crate::model::ModelArch;
use crate::pipelines::coordinator::RunPlan;
use crate::pipelines::group::RendezvousConfig;
use crate::pipelines::shard::Device;
use crate::pipelines::worker::WorkerSpec;

/// File extension of pileup image containers
pub const IMAGE_EXTENSION: &str = "img";

/// Windowed consensus prediction over pileup images
#[derive(Parser, Debug, Clone)]
#[command(name = "polisher", version, about, long_about = None)]
pub struct Config {
    /// Log span timings to stderr
    #[arg(long, global = true)]
    pub profile: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Predict consensus labels for every image
    Predict(PredictArgs),

    /// Run one worker (reads its invocation as JSON on stdin)
    #[command(hide = true)]
    Worker,
}

#[derive(Args, Debug, Clone)]
pub struct PredictArgs {
    /// Image files or directories of `.img` files
    #[arg(long, required = true, num_args = 1.., value_hint = ValueHint::AnyPath)]
    pub images: Vec<PathBuf>,

    /// Model checkpoint
    #[arg(long, value_hint = ValueHint::FilePath)]
    pub model: PathBuf,

    /// Output prefix; worker r writes `<output>_<r>.tsv.gz`
    #[arg(long, value_hint = ValueHint::FilePath)]
    pub output: PathBuf,

    #[arg(long, default_value_t = 64)]
    pub batch_size: usize,

    /// Number of worker processes
    #[arg(long, default_value_t = 1)]
    pub workers: usize,

    /// Device per worker, e.g. `cpu:0,cpu:1`
    #[arg(long, value_delimiter = ',')]
    pub devices: Option<Vec<Device>>,

    /// Image decoding threads per worker
    #[arg(long, default_value_t = 4)]
    pub loader_threads: usize,

    /// Positions per image
    #[arg(long, default_value_t = 1000)]
    pub seq_len: usize,

    /// Window width
    #[arg(long, default_value_t = 100)]
    pub window: usize,

    /// Window stride
    #[arg(long, default_value_t = 50)]
    pub jump: usize,

    /// Tail handling: `drop` leaves uncovered positions at class 0, `clip`
    /// adds a final window flush with the end
    #[arg(long, default_value_t = EdgePolicy::Drop)]
    pub edge_policy: EdgePolicy,

    #[arg(long, default_value_t = 90)]
    pub image_height: usize,

    #[arg(long, default_value_t = 1)]
    pub image_channels: usize,

    #[arg(long, default_value_t = 5)]
    pub base_classes: usize,

    #[arg(long, default_value_t = 51)]
    pub rle_classes: usize,

    /// Rendezvous address of rank 0
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST))]
    pub master_addr: IpAddr,

    #[arg(long, default_value_t = 12355)]
    pub master_port: u16,

    /// Seconds allowed for all workers to join
    #[arg(long, default_value_t = 60)]
    pub join_timeout_secs: u64,
}

impl Config {
    /// Parse command-line arguments and validate them
    pub fn parse_and_validate() -> Result<Self> {
        // Usage errors exit with the configuration status rather than clap's own
        let config = match Self::try_parse() {
            Ok(config) => config,
            Err(e) if e.use_stderr() => return Err(PolishError::config(e.to_string())),
            Err(e) => e.exit(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        match &self.command {
            Command::Predict(args) => args.validate(),
            Command::Worker => Ok(()),
        }
    }
}

impl PredictArgs {
    pub fn validate(&self) -> Result<()> {
        self.window_params().validate()?;
        if self.batch_size == 0 {
            return Err(PolishError::config("--batch-size must be positive"));
        }
        if self.workers == 0 {
            return Err(PolishError::config("--workers must be positive"));
        }
        if self.image_height == 0 || self.image_channels == 0 {
            return Err(PolishError::config("image height and channels must be positive"));
        }
        if self.base_classes == 0 || self.rle_classes == 0 {
            return Err(PolishError::config("class counts must be positive"));
        }
        if let Some(devices) = &self.devices {
            if devices.len() != self.workers {
                return Err(PolishError::config(format!(
                    "{} devices given for {} workers",
                    devices.len(),
                    self.workers
                )));
            }
        }
        if !self.model.exists() {
            return Err(PolishError::FileNotFound {
                path: self.model.clone(),
            });
        }
        if self.input_files()?.is_empty() {
            return Err(PolishError::config("no image files found"));
        }
        Ok(())
    }

    pub fn window_params(&self) -> WindowParams {
        WindowParams {
            seq_len: self.seq_len,
            width: self.window,
            jump: self.jump,
            edge_policy: self.edge_policy,
        }
    }

    pub fn arch(&self) -> ModelArch {
        ModelArch {
            channels: self.image_channels,
            image_height: self.image_height,
            seq_len: self.seq_len,
            base_classes: self.base_classes,
            rle_classes: self.rle_classes,
        }
    }

    /// Devices in rank order
    pub fn devices(&self) -> Vec<Device> {
        match &self.devices {
            Some(d) => d.clone(),
            None => (0..self.workers).map(|r| Device::for_rank(Rank::from(r))).collect(),
        }
    }

    pub fn rendezvous(&self) -> RendezvousConfig {
        RendezvousConfig {
            addr: SocketAddr::new(self.master_addr, self.master_port),
            join_timeout_secs: self.join_timeout_secs,
        }
    }

    /// All image files named by `--images`, directories expanded
    pub fn input_files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for path in &self.images {
            files.extend(expand_input(path)?);
        }
        Ok(files)
    }

    pub fn worker_spec(&self) -> WorkerSpec {
        WorkerSpec {
            world_size: self.workers,
            output_prefix: self.output.clone(),
            model_path: self.model.clone(),
            batch_size: self.batch_size,
            loader_threads: self.loader_threads,
            window: self.window_params(),
            arch: self.arch(),
            rendezvous: self.rendezvous(),
        }
    }

    pub fn run_plan(&self) -> Result<RunPlan> {
        RunPlan::new(&self.input_files()?, self.devices(), self.worker_spec())
    }
}

/// A file as is, or the sorted `*.img` files of a directory
pub fn expand_input(path: &Path) -> Result<Vec<PathBuf>> {
    if path.is_dir() {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(path)? {
            let p = entry?.path();
            if p.is_file() && p.extension().is_some_and(|e| e == IMAGE_EXTENSION) {
                files.push(p);
            }
        }
        files.sort();
        Ok(files)
    } else if path.exists() {
        Ok(vec![path.to_path_buf()])
    } else {
        Err(PolishError::FileNotFound {
            path: path.to_path_buf(),
        })
    }
}
