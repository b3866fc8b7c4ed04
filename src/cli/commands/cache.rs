//! Cache command - inspect and trim the local cache

use crate::cache::{CacheEntry, CachePolicies, LocalCache};
use crate::cli::args::{CacheAction, CacheArgs, OutputFormat};
use crate::config::{Config, ConfigManager};
use crate::error::IsolateResult;
use crate::ui::{self, UiContext};
use std::path::PathBuf;

/// Open the cache at `dir`, or the configured one, with configured limits
pub(crate) async fn open_cache(dir: Option<PathBuf>, config: &Config) -> IsolateResult<LocalCache> {
    let root = dir
        .or_else(|| config.cache.dir.clone())
        .unwrap_or_else(ConfigManager::default_cache_dir);
    let policies = CachePolicies::new(config.cache.max_size_bytes(), config.cache.max_items);
    LocalCache::open(root, policies).await
}

/// Execute the cache command
pub async fn execute(args: CacheArgs, config: &Config, ctx: &UiContext) -> IsolateResult<()> {
    match args.action {
        CacheAction::List { format } => {
            let cache = open_cache(args.dir, config).await?;
            list_entries(&cache, format).await
        }
        CacheAction::Stats => {
            let cache = open_cache(args.dir, config).await?;
            show_stats(&cache).await
        }
        CacheAction::Trim {
            max_size_mb,
            max_items,
        } => {
            let mut config = config.clone();
            if let Some(mb) = max_size_mb {
                config.cache.max_size_mb = mb;
            }
            if let Some(items) = max_items {
                config.cache.max_items = items;
            }
            let cache = open_cache(args.dir, &config).await?;
            trim(&cache, ctx).await
        }
        CacheAction::Clear { yes } => {
            let cache = open_cache(args.dir, config).await?;
            clear(&cache, &ctx.clone().with_auto_yes(yes)).await
        }
    }
}

async fn list_entries(cache: &LocalCache, format: OutputFormat) -> IsolateResult<()> {
    let entries = cache.entries().await?;

    match format {
        OutputFormat::Table => print_table(cache, &entries),
        OutputFormat::Json => print_json(&entries)?,
        OutputFormat::Plain => {
            for entry in &entries {
                println!("{}", entry.digest);
            }
        }
    }

    Ok(())
}

fn print_table(cache: &LocalCache, entries: &[CacheEntry]) {
    if entries.is_empty() {
        println!("Cache at {} is empty.", cache.root().display());
        return;
    }

    println!("{:<66} {:>10}  {:<16}", "DIGEST", "SIZE", "LAST USED");
    println!("{}", "-".repeat(94));
    for entry in entries {
        println!(
            "{:<66} {:>10}  {:<16}",
            entry.digest,
            ui::format_bytes(entry.size),
            entry.last_used.format("%Y-%m-%d %H:%M").to_string()
        );
    }
    println!();
    println!("Total: {} entries", entries.len());
}

fn print_json(entries: &[CacheEntry]) -> IsolateResult<()> {
    #[derive(serde::Serialize)]
    struct EntryJson<'a> {
        digest: &'a str,
        size: u64,
        last_used: String,
    }

    let json: Vec<EntryJson<'_>> = entries
        .iter()
        .map(|e| EntryJson {
            digest: e.digest.as_str(),
            size: e.size,
            last_used: e.last_used.to_rfc3339(),
        })
        .collect();

    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}

async fn show_stats(cache: &LocalCache) -> IsolateResult<()> {
    let stats = cache.stats().await?;
    let policies = cache.policies();
    let limit = |value: String, unlimited: bool| {
        if unlimited {
            "unlimited".to_string()
        } else {
            value
        }
    };

    ui::section("Cache");
    ui::key_value("Directory", &cache.root().display().to_string());
    ui::key_value("Entries", &stats.items.to_string());
    ui::key_value("Size", &ui::format_bytes(stats.total_bytes));
    ui::key_value(
        "Max entries",
        &limit(policies.max_items.to_string(), policies.max_items == 0),
    );
    ui::key_value(
        "Max size",
        &limit(
            ui::format_bytes(policies.max_size_bytes),
            policies.max_size_bytes == 0,
        ),
    );
    Ok(())
}

async fn trim(cache: &LocalCache, ctx: &UiContext) -> IsolateResult<()> {
    let report = cache.trim().await?;
    ui::step_ok(
        ctx,
        &format!(
            "Evicted {} entries ({}), removed {} stale temp files",
            report.evicted,
            ui::format_bytes(report.freed_bytes),
            report.stale_temp_files
        ),
    );
    Ok(())
}

async fn clear(cache: &LocalCache, ctx: &UiContext) -> IsolateResult<()> {
    let question = format!("Remove every entry from {}?", cache.root().display());
    if !ui::confirm(ctx, &question, false).await? {
        ui::step_info(ctx, "Nothing removed (pass --yes to skip the prompt)");
        return Ok(());
    }

    let removed = cache.clear().await?;
    ui::step_ok(ctx, &format!("Removed {} entries", removed));
    Ok(())
}
