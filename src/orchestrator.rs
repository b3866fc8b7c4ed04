//! End-to-end run of one isolated manifest
//!
//! ```text
//! Start -> ManifestFetched -> SandboxBuilt -> CommandRan -> CleanedUp -> Done
//!   \___________\________________\______________\______________-> Failed
//! ```
//!
//! The sandbox root is allocated before anything is fetched, and cleanup of
//! that root runs on every path out of [`Orchestrator::run`], including
//! failures, timeouts and cancellation.

use crate::digest::Digest;
use crate::error::{IsolateError, IsolateResult};
use crate::exec;
use crate::sandbox::{remove_sandbox, SandboxBuilder};
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Lifecycle of one run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Start,
    ManifestFetched,
    SandboxBuilt,
    CommandRan,
    CleanedUp,
    Done,
    Failed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Start => "start",
            Self::ManifestFetched => "manifest_fetched",
            Self::SandboxBuilt => "sandbox_built",
            Self::CommandRan => "command_ran",
            Self::CleanedUp => "cleaned_up",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// What to run
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub manifest: Digest,
    /// Appended to the manifest command
    pub extra_args: Vec<String>,
    /// Parent directory for the sandbox
    pub work_dir: PathBuf,
    pub timeout: Option<Duration>,
}

/// Result of a run, including the cleanup outcome
#[derive(Debug)]
pub struct RunReport {
    /// Exit code of the command, or the error that prevented one
    pub outcome: IsolateResult<i32>,
    /// Reported separately so it never hides `outcome`
    pub cleanup_error: Option<IsolateError>,
    /// Whether the sandbox directory is gone. Cleanup is always attempted,
    /// so this is false only alongside `cleanup_error`.
    pub sandbox_removed: bool,
    /// Last phase the run reached before cleanup
    pub reached: Phase,
    /// `Done` or `Failed`
    pub phase: Phase,
    pub sandbox_root: PathBuf,
    pub duration: Duration,
}

impl RunReport {
    /// Process exit code for this run
    pub fn exit_code(&self) -> u8 {
        match &self.outcome {
            Ok(code) => u8::try_from(*code).unwrap_or(1),
            Err(e) => e.exit_code(),
        }
    }
}

struct Tracker {
    phase: Phase,
}

impl Tracker {
    fn advance(&mut self, next: Phase) {
        debug!("Phase {} -> {}", self.phase, next);
        self.phase = next;
    }
}

/// Drives manifest loading, sandbox building, execution and cleanup
pub struct Orchestrator {
    builder: SandboxBuilder,
}

impl Orchestrator {
    pub fn new(builder: SandboxBuilder) -> Self {
        Self { builder }
    }

    /// Run `request` to completion. `cancel` resolving at any point stops the
    /// run; the sandbox is still removed before this returns.
    pub async fn run<C>(&self, request: &RunRequest, cancel: C) -> RunReport
    where
        C: Future<Output = ()>,
    {
        let started = Instant::now();
        let root = request
            .work_dir
            .join(format!("run_{}", Uuid::new_v4().simple()));
        let mut tracker = Tracker {
            phase: Phase::Start,
        };
        tokio::pin!(cancel);

        info!("Running manifest {}", request.manifest.short());
        let outcome = self.drive(request, &root, &mut tracker, cancel.as_mut()).await;
        if let Err(e) = &outcome {
            warn!("Run failed after {}: {}", tracker.phase, e);
        }
        let reached = tracker.phase;

        let cleanup_error = remove_sandbox(&root).await.err();
        if let Some(e) = &cleanup_error {
            warn!("{}", e);
        }
        tracker.advance(Phase::CleanedUp);

        let phase = if outcome.is_ok() {
            Phase::Done
        } else {
            Phase::Failed
        };
        tracker.advance(phase);

        RunReport {
            outcome,
            sandbox_removed: cleanup_error.is_none(),
            cleanup_error,
            reached,
            phase,
            sandbox_root: root,
            duration: started.elapsed(),
        }
    }

    async fn drive<C>(
        &self,
        request: &RunRequest,
        root: &Path,
        tracker: &mut Tracker,
        mut cancel: Pin<&mut C>,
    ) -> IsolateResult<i32>
    where
        C: Future<Output = ()>,
    {
        let manifest = tokio::select! {
            manifest = self.builder.load_manifest(&request.manifest) => manifest?,
            _ = cancel.as_mut() => return Err(IsolateError::Cancelled),
        };
        tracker.advance(Phase::ManifestFetched);

        tokio::select! {
            fetched = self.builder.prefetch(&manifest) => fetched?,
            _ = cancel.as_mut() => return Err(IsolateError::Cancelled),
        }
        tokio::fs::create_dir_all(&request.work_dir)
            .await
            .map_err(|e| {
                IsolateError::io(
                    format!("creating work directory {}", request.work_dir.display()),
                    e,
                )
            })?;
        let sandbox = self.builder.build(&manifest, root).await?;
        tracker.advance(Phase::SandboxBuilt);

        let mut argv = sandbox.command().to_vec();
        argv.extend(request.extra_args.iter().cloned());
        let code =
            exec::run_command(&argv, sandbox.working_dir(), request.timeout, cancel.as_mut())
                .await?;
        tracker.advance(Phase::CommandRan);

        info!("Command exited with {}", code);
        Ok(code)
    }
}
