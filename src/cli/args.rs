//! CLI argument definitions using clap derive

use crate::config::CONFIG_ENV;
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use std::path::PathBuf;

/// run-isolated - Run a command in a sandbox built from an isolated manifest
///
/// Fetches the files named by a content-addressed manifest into a local
/// cache, hardlinks them read-only into a fresh directory, runs the
/// manifest's command there and removes the directory afterwards.
#[derive(Parser, Debug)]
#[command(name = "run-isolated")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Suppress status output
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Configuration file path
    #[arg(short, long, global = true, env = CONFIG_ENV)]
    pub config: Option<PathBuf>,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Build a sandbox from a manifest and run its command
    Run(RunArgs),

    /// Inspect and trim the local cache
    Cache(CacheArgs),

    /// Add files to a directory store
    Store(StoreArgs),

    /// Show or initialize configuration
    Config(ConfigArgs),

    /// Generate shell completions
    Completions {
        /// Target shell
        shell: Shell,
    },
}

/// Arguments for the run command
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Digest of the isolated manifest
    #[arg(short = 'H', long = "hash", value_name = "DIGEST")]
    pub hash: String,

    /// Cache directory (default: from config)
    #[arg(long, value_name = "DIR")]
    pub cache: Option<PathBuf>,

    /// Directory store to fetch from (default: from config)
    #[arg(long, value_name = "DIR")]
    pub store: Option<PathBuf>,

    /// Parent directory for the sandbox (default: from config)
    #[arg(long, value_name = "DIR")]
    pub work_dir: Option<PathBuf>,

    /// Maximum concurrent fetches
    #[arg(long, value_name = "N")]
    pub max_in_flight: Option<usize>,

    /// Kill the command after this many seconds
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Skip trimming the cache after the run
    #[arg(long)]
    pub no_trim: bool,

    /// Extra arguments appended to the manifest command
    #[arg(last = true)]
    pub args: Vec<String>,
}

/// Arguments for the cache command
#[derive(Parser, Debug)]
pub struct CacheArgs {
    /// Cache directory (default: from config)
    #[arg(long, global = true, value_name = "DIR")]
    pub dir: Option<PathBuf>,

    /// Subcommand for cache
    #[command(subcommand)]
    pub action: CacheAction,
}

/// Cache subcommands
#[derive(Subcommand, Debug)]
pub enum CacheAction {
    /// List cache entries, least recently used first
    List {
        /// Output format
        #[arg(short, long, default_value = "table")]
        format: OutputFormat,
    },

    /// Show entry count and total size
    Stats,

    /// Evict entries until the configured limits hold
    Trim {
        /// Size limit in megabytes (default: from config)
        #[arg(long)]
        max_size_mb: Option<u64>,

        /// Entry limit (default: from config)
        #[arg(long)]
        max_items: Option<usize>,
    },

    /// Remove every cache entry
    Clear {
        /// Skip confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
}

/// Arguments for the store command
#[derive(Parser, Debug)]
pub struct StoreArgs {
    /// Directory store (default: from config)
    #[arg(long, value_name = "DIR")]
    pub dir: Option<PathBuf>,

    /// Subcommand for store
    #[command(subcommand)]
    pub action: StoreAction,
}

/// Store subcommands
#[derive(Subcommand, Debug)]
pub enum StoreAction {
    /// Store files and print their digests
    Add {
        /// Files to store
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
}

/// Arguments for the config command
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    /// Subcommand for config
    #[command(subcommand)]
    pub action: Option<ConfigAction>,
}

/// Config subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Show configuration file path
    Path,

    /// Initialize default configuration
    Init {
        /// Overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },
}

/// Output format for listings
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table
    Table,
    /// JSON output
    Json,
    /// Simple text (one per line)
    Plain,
}
