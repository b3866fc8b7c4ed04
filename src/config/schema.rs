//! Configuration schema for run-isolated
//!
//! Configuration is stored at `~/.config/run-isolated/config.toml`

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Local cache settings
    pub cache: CacheConfig,

    /// Content-addressed store settings
    pub storage: StorageConfig,

    /// Sandbox and command settings
    pub run: RunConfig,
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log format: "text" or "json"
    pub log_format: String,

    /// Enable audit logging
    pub audit_log: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_format: "text".to_string(),
            audit_log: true,
        }
    }
}

/// Cache configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Cache directory (default: platform cache dir)
    pub dir: Option<PathBuf>,

    /// Trim to this many megabytes after each run (0 = unlimited)
    pub max_size_mb: u64,

    /// Trim to this many entries after each run (0 = unlimited)
    pub max_items: usize,
}

impl CacheConfig {
    pub fn max_size_bytes(&self) -> u64 {
        self.max_size_mb.saturating_mul(1024 * 1024)
    }
}

/// Storage backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding objects named by digest
    pub dir: Option<PathBuf>,

    /// Maximum concurrent fetches
    pub max_in_flight: usize,

    /// Attempts per object, including the first
    pub retries: u32,

    /// Delay before the first retry, doubled for each further one
    pub retry_delay_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dir: None,
            max_in_flight: 8,
            retries: 3,
            retry_delay_ms: 250,
        }
    }
}

/// Run configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Parent directory for sandboxes (default: system temp dir)
    pub work_dir: Option<PathBuf>,

    /// Kill the command after this many seconds (0 = no limit)
    pub timeout_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = Config::default();
        let toml = toml::to_string_pretty(&config).unwrap();
        assert!(toml.contains("[general]"));
        assert!(toml.contains("[storage]"));
        assert!(toml.contains("max_in_flight = 8"));
    }

    #[test]
    fn config_deserializes_empty() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.storage.retries, 3);
        assert!(config.general.audit_log);
        assert!(config.cache.dir.is_none());
    }

    #[test]
    fn config_deserializes_partial() {
        let toml = r#"
            [cache]
            dir = "/var/cache/isolated"
            max_size_mb = 2
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.cache.dir, Some(PathBuf::from("/var/cache/isolated")));
        assert_eq!(config.cache.max_size_bytes(), 2 * 1024 * 1024);
        assert_eq!(config.storage.retry_delay_ms, 250); // default preserved
    }
}
