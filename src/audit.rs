//! Audit logging for sandbox runs
//!
//! Writes JSON lines to `~/.local/state/run-isolated/audit.log`.
//! Enabled by default; turn off with `general.audit_log = false`.

use crate::config::{schema::Config, ConfigManager};
use crate::orchestrator::{RunReport, RunRequest};
use chrono::Utc;
use serde_json::json;
use std::path::PathBuf;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::warn;

/// File-based audit logger that appends JSON lines
pub struct AuditLog {
    enabled: bool,
    path: PathBuf,
}

impl AuditLog {
    /// Create a new audit logger from config
    pub fn new(config: &Config) -> Self {
        Self {
            enabled: config.general.audit_log,
            path: ConfigManager::audit_log_path(),
        }
    }

    pub async fn run_started(&self, request: &RunRequest) {
        self.log(
            "run.started",
            &json!({
                "manifest": request.manifest,
                "extra_args": request.extra_args,
                "work_dir": request.work_dir,
            }),
        )
        .await;
    }

    pub async fn run_finished(&self, request: &RunRequest, report: &RunReport) {
        let error = report.outcome.as_ref().err().map(ToString::to_string);
        self.log(
            "run.finished",
            &json!({
                "manifest": request.manifest,
                "exit_code": report.exit_code(),
                "phase": report.phase.to_string(),
                "reached": report.reached.to_string(),
                "error": error,
                "sandbox_removed": report.sandbox_removed,
                "cleanup_error": report.cleanup_error.as_ref().map(ToString::to_string),
                "duration_ms": report.duration.as_millis() as u64,
            }),
        )
        .await;
    }

    /// Log an audit event as a JSON line
    ///
    /// Drops events on IO failure after a warning; the run itself is never
    /// affected.
    pub async fn log(&self, event: &str, data: &serde_json::Value) {
        if !self.enabled {
            return;
        }

        let entry = json!({
            "timestamp": Utc::now().to_rfc3339(),
            "event": event,
            "data": data,
        });

        let mut line = match serde_json::to_string(&entry) {
            Ok(s) => s,
            Err(e) => {
                warn!("Failed to serialize audit event: {}", e);
                return;
            }
        };
        line.push('\n');

        if let Err(e) = self.append(&line).await {
            warn!("Failed to write audit log: {}", e);
        }
    }

    async fn append(&self, line: &str) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;

        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}
