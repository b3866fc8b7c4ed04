//! Fetch progress with CI fallback

use super::context::UiContext;
use crate::digest::Digest;
use crate::sandbox::BuildObserver;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Reports sandbox construction progress.
///
/// An indicatif bar in interactive terminals; otherwise a single line per
/// fetch batch on stderr.
pub struct FetchProgress {
    bar: Option<ProgressBar>,
    quiet: bool,
    bytes: AtomicU64,
}

impl FetchProgress {
    pub fn new(ctx: &UiContext) -> Self {
        let bar = ctx.use_fancy_output().then(|| {
            let bar = ProgressBar::hidden();
            bar.set_style(
                ProgressStyle::default_bar()
                    .template("  {spinner:.cyan} Fetching {bar:20.cyan/dim} {pos}/{len} {msg:.dim}  {elapsed:.dim}")
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏ ")
                    .progress_chars("━╸─"),
            );
            bar
        });
        Self {
            bar,
            quiet: ctx.is_quiet(),
            bytes: AtomicU64::new(0),
        }
    }

    /// Total bytes fetched so far
    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    /// Remove the bar from the terminal
    pub fn finish(&self) {
        if let Some(ref bar) = self.bar {
            bar.finish_and_clear();
        }
    }
}

impl BuildObserver for FetchProgress {
    fn fetch_started(&self, count: usize) {
        match self.bar {
            Some(ref bar) => {
                bar.set_draw_target(indicatif::ProgressDrawTarget::stderr());
                bar.set_length(bar.length().unwrap_or(0) + count as u64);
                bar.enable_steady_tick(Duration::from_millis(120));
            }
            None if !self.quiet => {
                eprintln!("{} Fetching {} objects", style("...").dim(), count);
            }
            None => {}
        }
    }

    fn fetch_finished(&self, digest: &Digest, bytes: u64) {
        let total = self.bytes.fetch_add(bytes, Ordering::Relaxed) + bytes;
        if let Some(ref bar) = self.bar {
            bar.inc(1);
            bar.set_message(format!("{} ({})", digest.short(), super::format_bytes(total)));
        }
    }

    fn finished(&self) {
        self.finish();
    }
}
