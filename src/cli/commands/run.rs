//! Run command - build a sandbox from a manifest and run its command

use super::cache::open_cache;
use crate::audit::AuditLog;
use crate::cli::args::RunArgs;
use crate::config::{Config, ConfigManager};
use crate::digest::Digest;
use crate::error::{IsolateError, IsolateResult};
use crate::orchestrator::{Orchestrator, RunRequest};
use crate::sandbox::SandboxBuilder;
use crate::storage::{DirectoryBackend, FetchClient, RetryPolicy, StorageBackend};
use crate::ui::{self, FetchProgress, UiContext};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Execute the run command and return the exit code to report
pub async fn execute<C>(
    args: RunArgs,
    config: &Config,
    ctx: &UiContext,
    cancel: C,
) -> IsolateResult<u8>
where
    C: Future<Output = ()>,
{
    let manifest = Digest::parse(&args.hash)?;
    let store_dir = resolve_store_dir(args.store.clone(), config)?;
    let cache = open_cache(args.cache.clone(), config).await?;
    debug!(
        "Store {}, cache {}",
        store_dir.display(),
        cache.root().display()
    );

    let backend: Arc<dyn StorageBackend> = Arc::new(DirectoryBackend::new(store_dir));
    let retry = RetryPolicy::new(
        config.storage.retries,
        Duration::from_millis(config.storage.retry_delay_ms),
    );
    let max_in_flight = args.max_in_flight.unwrap_or(config.storage.max_in_flight);
    let client = FetchClient::new(backend, max_in_flight, retry);

    let progress = Arc::new(FetchProgress::new(ctx));
    let builder = SandboxBuilder::new(client, cache.clone()).with_observer(progress.clone());
    let orchestrator = Orchestrator::new(builder);

    let request = RunRequest {
        manifest,
        extra_args: args.args,
        work_dir: args
            .work_dir
            .or_else(|| config.run.work_dir.clone())
            .unwrap_or_else(ConfigManager::default_work_dir),
        timeout: resolve_timeout(args.timeout, config.run.timeout_secs),
    };

    let audit = AuditLog::new(config);
    audit.run_started(&request).await;
    let report = orchestrator.run(&request, cancel).await;
    progress.finish();
    audit.run_finished(&request, &report).await;

    if let Some(ref e) = report.cleanup_error {
        ui::step_warn(ctx, &e.to_string());
    }

    if !args.no_trim {
        match cache.trim().await {
            Ok(trimmed) if trimmed.evicted > 0 => ui::step_info(
                ctx,
                &format!(
                    "Trimmed {} cache entries ({})",
                    trimmed.evicted,
                    ui::format_bytes(trimmed.freed_bytes)
                ),
            ),
            Ok(_) => {}
            Err(e) => ui::step_warn(ctx, &format!("Cache trim failed: {}", e)),
        }
    }

    let exit_code = report.exit_code();
    report.outcome.map(|_| exit_code)
}

fn resolve_store_dir(flag: Option<PathBuf>, config: &Config) -> IsolateResult<PathBuf> {
    flag.or_else(|| config.storage.dir.clone()).ok_or_else(|| {
        IsolateError::User("No store configured: pass --store or set storage.dir".to_string())
    })
}

/// Flag wins over config; zero means no limit
fn resolve_timeout(flag: Option<u64>, configured: u64) -> Option<Duration> {
    Some(flag.unwrap_or(configured))
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs)
}
