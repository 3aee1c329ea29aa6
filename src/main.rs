//! # Polisher: Windowed Consensus Prediction
//!
//! Slides a recurrent model over pileup images, fuses the overlapping window
//! predictions per position and writes one consensus label per position.
//!
//! ## Usage
//! ```bash
//! # Single worker
//! polisher predict --images images/ --model model.ckpt --output out/preds
//!
//! # Four workers, one shard of the input each
//! polisher predict --images images/ --model model.ckpt --output out/preds --workers 4
//!
//! # With profiling output
//! polisher predict --images images/ --model model.ckpt --output out/preds --profile
//! ```

use std::io::Read;
use std::time::Instant;

use polisher::config::{Command, Config, PredictArgs};
use polisher::pipelines::coordinator::{ProcessLauncher, WorkerCoordinator};
use polisher::pipelines::worker::WorkerInvocation;
use polisher::{PolishError, Result};

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        std::process::exit(e.exit_code());
    }
}

/// Initialize the tracing subscriber; `profile` adds span close timings
fn init_logging(profile: bool) {
    use tracing_subscriber::fmt::format::FmtSpan;
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let layer = fmt::layer().with_writer(std::io::stderr).with_target(false);
    if profile {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                layer
                    .with_span_events(FmtSpan::CLOSE)
                    .with_timer(fmt::time::uptime()),
            )
            .init();
    } else {
        tracing_subscriber::registry().with(filter).with(layer).init();
    }
}

fn run() -> Result<()> {
    let config = Config::parse_and_validate()?;
    init_logging(config.profile);

    match &config.command {
        Command::Predict(args) => predict(args, config.profile),
        Command::Worker => worker(),
    }
}

fn predict(args: &PredictArgs, profile: bool) -> Result<()> {
    let start = Instant::now();
    if profile {
        eprintln!("=== Profiling enabled ===\n");
    }
    eprintln!("Polisher v{}", env!("CARGO_PKG_VERSION"));

    let plan = args.run_plan()?;
    eprintln!("Workers: {}", plan.world_size());
    eprintln!("Images: {} files", plan.assignment.n_files());
    eprintln!("Model: {:?}", args.model);

    if let Some(parent) = args.output.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let launcher = ProcessLauncher::current()?.with_profile(profile);
    let summary = WorkerCoordinator::new(plan).run(&launcher)?;

    for path in &summary.outputs {
        eprintln!("Output: {}", path.display());
    }
    eprintln!("\nCompleted in {:.2}s", start.elapsed().as_secs_f64());
    Ok(())
}

/// Entry of a worker process launched by `predict`
fn worker() -> Result<()> {
    let mut input = String::new();
    std::io::stdin().read_to_string(&mut input)?;
    let invocation: WorkerInvocation = serde_json::from_str(&input)
        .map_err(|e| PolishError::startup(format!("invalid worker invocation: {}", e)))?;
    invocation.run()?;
    Ok(())
}
