//! Command execution inside a built sandbox

use crate::error::{IsolateError, IsolateResult};
use std::future::Future;
use std::path::Path;
use std::process::ExitStatus;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Exit code reported for a child that ended without one
const ABNORMAL_EXIT: i32 = 1;

enum Outcome {
    Exited(std::io::Result<ExitStatus>),
    TimedOut(Duration),
    Cancelled,
}

/// Run `argv` in `working_dir` and return its exit code.
///
/// Stdio is inherited. A child that exits non-zero is a normal result, not
/// an error. The child is killed when `timeout` elapses or `cancel`
/// resolves.
pub async fn run_command<C>(
    argv: &[String],
    working_dir: &Path,
    timeout: Option<Duration>,
    cancel: C,
) -> IsolateResult<i32>
where
    C: Future<Output = ()>,
{
    let Some((program, args)) = argv.split_first() else {
        return Err(IsolateError::User("Command is empty".to_string()));
    };
    let rendered = argv.join(" ");

    let mut child = Command::new(resolve_program(program, working_dir))
        .args(args)
        .current_dir(working_dir)
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| IsolateError::LaunchFailed {
            command: rendered.clone(),
            source,
        })?;
    info!("Started '{}' (pid {:?})", rendered, child.id());

    let deadline = async {
        match timeout {
            Some(limit) => {
                tokio::time::sleep(limit).await;
                limit
            }
            None => std::future::pending().await,
        }
    };

    let outcome = tokio::select! {
        status = child.wait() => Outcome::Exited(status),
        limit = deadline => Outcome::TimedOut(limit),
        _ = cancel => Outcome::Cancelled,
    };

    let status = match outcome {
        Outcome::Exited(status) => {
            status.map_err(|e| IsolateError::io("waiting for command", e))?
        }
        Outcome::TimedOut(limit) => {
            warn!("'{}' exceeded its time limit, killing it", rendered);
            stop(&mut child).await;
            return Err(IsolateError::TimedOut(limit));
        }
        Outcome::Cancelled => {
            warn!("Cancellation requested, killing '{}'", rendered);
            stop(&mut child).await;
            return Err(IsolateError::Cancelled);
        }
    };

    let code = exit_code(status);
    debug!("'{}' exited with {}", rendered, code);
    Ok(code)
}

/// Programs given as a relative path with a separator refer to files inside
/// the sandbox, not to the caller's working directory.
fn resolve_program(program: &str, working_dir: &Path) -> std::path::PathBuf {
    let path = Path::new(program);
    if path.is_relative() && path.components().count() > 1 {
        working_dir.join(path)
    } else {
        path.to_path_buf()
    }
}

async fn stop(child: &mut tokio::process::Child) {
    if let Err(e) = child.kill().await {
        warn!("Could not kill command: {}", e);
    }
}

/// Exit code of a finished child. POSIX signals map to `128 + n`.
pub fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    ABNORMAL_EXIT
}
