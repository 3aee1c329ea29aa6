//! # Worker Coordinator
//!
//! ## Role
//! Launches one worker per rank, waits for all of them and turns their exit
//! statuses into a single run result.
//!
//! ## Failure policy
//! - A startup failure of any worker aborts the run: the remaining workers
//!   are killed, since the group cannot operate partially.
//! - Inference and write failures only end the worker that raised them;
//!   its siblings run to completion.
//! - The run succeeds only if every worker finished.
//!
//! Launching is behind [`WorkerLauncher`]. [`ProcessLauncher`] re-executes
//! the current program as `polisher worker` and sends the
//! [`WorkerInvocation`] as JSON on the child's stdin.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use tracing::{error, info, info_span, warn};

use crate::data::Rank;
use crate::error::{FailureKind, PolishError, Result, WorkerFailure};
use crate::io::predictions::output_path;
use crate::pipelines::shard::{Device, ShardAssignment};
use crate::pipelines::worker::{WorkerInvocation, WorkerSpec};

/// Pause between exit polls
const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// How a worker ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerExit {
    Success,
    Failed(FailureKind),
}

impl WorkerExit {
    /// Exit of a process that returned `code` (`None` if killed by a signal)
    pub fn from_code(code: Option<i32>) -> Self {
        match code {
            Some(0) => WorkerExit::Success,
            Some(c) => WorkerExit::Failed(FailureKind::from_exit_code(c)),
            None => WorkerExit::Failed(FailureKind::Other),
        }
    }
}

/// A running worker
pub trait WorkerHandle {
    fn rank(&self) -> Rank;

    /// Exit status if the worker has ended, without blocking
    fn try_wait(&mut self) -> Result<Option<WorkerExit>>;

    /// Block until the worker ends
    fn wait(&mut self) -> Result<WorkerExit>;

    /// Terminate the worker
    fn kill(&mut self) -> Result<()>;
}

/// Starts workers
pub trait WorkerLauncher {
    type Handle: WorkerHandle;

    fn launch(&self, invocation: WorkerInvocation) -> Result<Self::Handle>;
}

/// The plan of a whole run: one shard and device per rank plus shared parameters
#[derive(Clone, Debug)]
pub struct RunPlan {
    pub assignment: ShardAssignment,
    pub spec: WorkerSpec,
}

impl RunPlan {
    /// Partition `files` over `devices`, one worker per device
    pub fn new(files: &[PathBuf], devices: Vec<Device>, spec: WorkerSpec) -> Result<Self> {
        if devices.len() != spec.world_size {
            return Err(PolishError::config(format!(
                "{} devices for {} workers",
                devices.len(),
                spec.world_size
            )));
        }
        spec.window.validate()?;
        let assignment = ShardAssignment::partition(files, devices)?;
        Ok(Self { assignment, spec })
    }

    pub fn world_size(&self) -> usize {
        self.assignment.world_size()
    }

    pub fn invocation(&self, rank: Rank) -> WorkerInvocation {
        WorkerInvocation {
            rank,
            assignment: self.assignment.clone(),
            spec: self.spec.clone(),
        }
    }

    /// Artifact paths of every rank
    pub fn outputs(&self) -> Vec<PathBuf> {
        self.assignment
            .ranks()
            .map(|r| output_path(&self.spec.output_prefix, r))
            .collect()
    }
}

/// Result of a successful run
#[derive(Clone, Debug)]
pub struct RunSummary {
    pub world_size: usize,
    pub outputs: Vec<PathBuf>,
    pub elapsed: Duration,
}

/// Runs a plan to completion
pub struct WorkerCoordinator {
    plan: RunPlan,
}

impl WorkerCoordinator {
    pub fn new(plan: RunPlan) -> Self {
        Self { plan }
    }

    pub fn plan(&self) -> &RunPlan {
        &self.plan
    }

    /// Launch every worker and wait until all have ended.
    ///
    /// # Errors
    /// `PolishError::WorkerFailed` naming every rank that did not finish.
    pub fn run<L: WorkerLauncher>(&self, launcher: &L) -> Result<RunSummary> {
        let world_size = self.plan.world_size();
        let _span = info_span!("run_workers", world_size).entered();
        let start = Instant::now();

        let mut handles = Vec::with_capacity(world_size);
        for rank in self.plan.assignment.ranks() {
            match launcher.launch(self.plan.invocation(rank)) {
                Ok(h) => handles.push(h),
                Err(e) => {
                    error!(rank = rank.0, error = %e, "Failed to launch worker");
                    kill_all(&mut handles);
                    return Err(e);
                }
            }
        }
        info!(world_size, "Launched workers");

        let exits = wait_all(&mut handles)?;
        let failures: Vec<WorkerFailure> = exits
            .iter()
            .enumerate()
            .filter_map(|(rank, exit)| match exit {
                WorkerExit::Success => None,
                WorkerExit::Failed(kind) => Some(WorkerFailure { rank, kind: *kind }),
            })
            .collect();

        if !failures.is_empty() {
            return Err(PolishError::WorkerFailed { failures });
        }
        let elapsed = start.elapsed();
        info!(world_size, elapsed_secs = elapsed.as_secs_f64(), "All workers finished");
        Ok(RunSummary {
            world_size,
            outputs: self.plan.outputs(),
            elapsed,
        })
    }
}

/// Poll until every worker has ended; a startup failure kills the rest
fn wait_all<H: WorkerHandle>(handles: &mut [H]) -> Result<Vec<WorkerExit>> {
    let mut exits: Vec<Option<WorkerExit>> = vec![None; handles.len()];
    loop {
        for (h, exit) in handles.iter_mut().zip(exits.iter_mut()) {
            if exit.is_some() {
                continue;
            }
            if let Some(e) = h.try_wait()? {
                match e {
                    WorkerExit::Success => info!(rank = h.rank().0, "Worker finished"),
                    WorkerExit::Failed(kind) => error!(rank = h.rank().0, %kind, "Worker failed"),
                }
                *exit = Some(e);
            }
        }

        if exits.contains(&Some(WorkerExit::Failed(FailureKind::Startup))) {
            for (h, exit) in handles.iter_mut().zip(exits.iter_mut()) {
                if exit.is_none() {
                    warn!(rank = h.rank().0, "Stopping worker after startup failure");
                    h.kill()?;
                    *exit = Some(h.wait()?);
                }
            }
        }

        if exits.iter().all(Option::is_some) {
            return Ok(exits.into_iter().flatten().collect());
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

fn kill_all<H: WorkerHandle>(handles: &mut [H]) {
    for h in handles.iter_mut() {
        if let Err(e) = h.kill().and_then(|_| h.wait().map(|_| ())) {
            warn!(rank = h.rank().0, error = %e, "Could not stop worker");
        }
    }
}

/// Runs each worker as a child process of `program`
#[derive(Clone, Debug)]
pub struct ProcessLauncher {
    program: PathBuf,
    profile: bool,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            profile: false,
        }
    }

    /// Launcher for the running executable
    pub fn current() -> Result<Self> {
        let exe = std::env::current_exe()
            .map_err(|e| PolishError::startup(format!("cannot locate own executable: {}", e)))?;
        Ok(Self::new(exe))
    }

    /// Pass `--profile` to every worker
    pub fn with_profile(mut self, profile: bool) -> Self {
        self.profile = profile;
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

impl WorkerLauncher for ProcessLauncher {
    type Handle = ProcessHandle;

    fn launch(&self, invocation: WorkerInvocation) -> Result<ProcessHandle> {
        let rank = invocation.rank;
        let payload = serde_json::to_vec(&invocation)
            .map_err(|e| PolishError::startup(format!("cannot encode rank {}: {}", rank, e)))?;

        let mut cmd = Command::new(&self.program);
        cmd.arg("worker");
        if self.profile {
            cmd.arg("--profile");
        }
        let mut child = cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| {
                PolishError::startup(format!(
                    "cannot start worker {} ({}): {}",
                    rank,
                    self.program.display(),
                    e
                ))
            })?;

        let sent = match child.stdin.take() {
            Some(mut stdin) => stdin.write_all(&payload).and_then(|_| stdin.flush()),
            None => Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "no stdin")),
        };
        if let Err(e) = sent {
            let _ = child.kill();
            let _ = child.wait();
            return Err(PolishError::startup(format!("cannot send invocation to worker {}: {}", rank, e)));
        }
        Ok(ProcessHandle { rank, child })
    }
}

/// Child process of one worker
#[derive(Debug)]
pub struct ProcessHandle {
    rank: Rank,
    child: Child,
}

impl WorkerHandle for ProcessHandle {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn try_wait(&mut self) -> Result<Option<WorkerExit>> {
        Ok(self.child.try_wait()?.map(|s| WorkerExit::from_code(s.code())))
    }

    fn wait(&mut self) -> Result<WorkerExit> {
        Ok(WorkerExit::from_code(self.child.wait()?.code()))
    }

    fn kill(&mut self) -> Result<()> {
        match self.child.kill() {
            Ok(()) => Ok(()),
            // Already exited
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
