//! Persistent content-addressed file cache
//!
//! One file per digest, named by the digest, directly under the cache root.
//! Entries are immutable once committed and may be hardlinked into any number
//! of sandboxes at the same time.
//!
//! # Concurrency Model
//!
//! - Writers stream into a private temporary file and rename it into place
//! - Two builders racing on the same digest both rename identical bytes;
//!   the second rename replaces the first atomically
//! - Readers never observe a partial body
//! - Eviction only unlinks the cache name; sandboxes keep their own links
//!
//! # Layout
//!
//! | Name | Meaning |
//! |------|---------|
//! | `<digest>` | committed entry |
//! | `.<digest>.<uuid>.tmp` | in-progress write, ignored by readers |

mod policy;
mod sink;

pub use policy::{CachePolicies, TrimReport};
pub use sink::CacheSink;

use crate::digest::Digest;
use crate::error::{IsolateError, IsolateResult};
use crate::perms;
use chrono::{DateTime, Utc};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::fs;
use tracing::{debug, info, warn};

/// Temp files older than this are assumed abandoned by a crashed writer
const STALE_TEMP_AGE: Duration = Duration::from_secs(3600);

/// A committed cache entry
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub digest: Digest,
    pub path: PathBuf,
    pub size: u64,
    /// Refreshed every time a sandbox uses the entry
    pub last_used: DateTime<Utc>,
}

/// Aggregate numbers for `cache stats`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub items: usize,
    pub total_bytes: u64,
}

/// Handle on one cache directory
#[derive(Debug, Clone)]
pub struct LocalCache {
    root: PathBuf,
    policies: CachePolicies,
}

impl LocalCache {
    /// Open (creating if needed) the cache at `root`
    pub async fn open(root: impl Into<PathBuf>, policies: CachePolicies) -> IsolateResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await.map_err(|e| {
            IsolateError::io(format!("creating cache directory {}", root.display()), e)
        })?;
        Ok(Self { root, policies })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn policies(&self) -> CachePolicies {
        self.policies
    }

    /// Absolute path of the body for `digest`, whether or not it exists
    pub fn path_for(&self, digest: &Digest) -> PathBuf {
        self.root.join(digest.as_str())
    }

    pub fn contains(&self, digest: &Digest) -> bool {
        std::fs::symlink_metadata(self.path_for(digest))
            .map(|m| m.is_file())
            .unwrap_or(false)
    }

    /// Read a committed entry
    pub async fn read(&self, digest: &Digest) -> IsolateResult<Vec<u8>> {
        let path = self.path_for(digest);
        fs::read(&path)
            .await
            .map_err(|e| IsolateError::io(format!("reading cache entry {}", path.display()), e))
    }

    /// Start an atomic write of `digest`
    pub fn sink(&self, digest: &Digest) -> CacheSink {
        CacheSink::new(&self.root, digest)
    }

    /// Mark an entry as recently used. Best effort.
    pub fn touch(&self, digest: &Digest) {
        let path = self.path_for(digest);
        let result = std::fs::File::open(&path).and_then(|f| f.set_modified(SystemTime::now()));
        if let Err(e) = result {
            debug!("Could not refresh {}: {}", path.display(), e);
        }
    }

    /// All committed entries, least recently used first
    pub async fn entries(&self) -> IsolateResult<Vec<CacheEntry>> {
        let mut dir = fs::read_dir(&self.root).await.map_err(|e| {
            IsolateError::io(format!("reading cache directory {}", self.root.display()), e)
        })?;

        let mut entries = Vec::new();
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| IsolateError::io("reading cache entry", e))?
        {
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            let Ok(digest) = Digest::parse(&name) else {
                continue;
            };
            let metadata = match entry.metadata().await {
                Ok(m) if m.is_file() => m,
                Ok(_) => continue,
                // Evicted by a concurrent trim
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(IsolateError::io(format!("stat {}", name), e)),
            };
            let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            entries.push(CacheEntry {
                digest,
                path: entry.path(),
                size: metadata.len(),
                last_used: DateTime::<Utc>::from(modified),
            });
        }

        entries.sort_by(|a, b| a.last_used.cmp(&b.last_used).then(a.digest.cmp(&b.digest)));
        Ok(entries)
    }

    pub async fn stats(&self) -> IsolateResult<CacheStats> {
        let entries = self.entries().await?;
        Ok(CacheStats {
            items: entries.len(),
            total_bytes: entries.iter().map(|e| e.size).sum(),
        })
    }

    /// Evict least recently used entries until the policies hold, and sweep
    /// abandoned temporary files.
    pub async fn trim(&self) -> IsolateResult<TrimReport> {
        let mut report = TrimReport {
            stale_temp_files: self.sweep_temp_files().await?,
            ..TrimReport::default()
        };

        let entries = self.entries().await?;
        let mut items = entries.len();
        let mut total: u64 = entries.iter().map(|e| e.size).sum();

        for entry in &entries {
            if !self.policies.exceeded(items, total) {
                break;
            }
            match remove_entry(&entry.path).await {
                Ok(()) => {
                    debug!("Evicted {} ({} bytes)", entry.digest.short(), entry.size);
                    report.evicted += 1;
                    report.freed_bytes += entry.size;
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!("Could not evict {}: {}", entry.path.display(), e);
                    continue;
                }
            }
            items -= 1;
            total -= entry.size;
        }

        if report.evicted > 0 {
            info!(
                "Trimmed cache: evicted {} entries, freed {} bytes",
                report.evicted, report.freed_bytes
            );
        }
        Ok(report)
    }

    /// Remove every committed entry, returning how many were removed
    pub async fn clear(&self) -> IsolateResult<usize> {
        let mut removed = 0;
        for entry in self.entries().await? {
            remove_entry(&entry.path).await.map_err(|e| {
                IsolateError::io(format!("removing cache entry {}", entry.path.display()), e)
            })?;
            removed += 1;
        }
        self.sweep_temp_files().await?;
        Ok(removed)
    }

    async fn sweep_temp_files(&self) -> IsolateResult<usize> {
        let mut dir = fs::read_dir(&self.root)
            .await
            .map_err(|e| IsolateError::io("reading cache directory", e))?;
        let now = SystemTime::now();
        let mut removed = 0;

        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| IsolateError::io("reading cache entry", e))?
        {
            if !sink::is_temp_name(&entry.file_name().to_string_lossy()) {
                continue;
            }
            let age = entry
                .metadata()
                .await
                .ok()
                .and_then(|m| m.modified().ok())
                .and_then(|modified| now.duration_since(modified).ok());
            if age.is_some_and(|age| age >= STALE_TEMP_AGE)
                && fs::remove_file(entry.path()).await.is_ok()
            {
                removed += 1;
            }
        }

        Ok(removed)
    }
}

/// Unlink a cache name. Sandboxes still linked to the body keep it, and it
/// stays read-only for them.
async fn remove_entry(path: &Path) -> io::Result<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || perms::remove_file(&path))
        .await
        .unwrap_or_else(|join| Err(io::Error::other(join.to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FetchSink;
    use tempfile::TempDir;

    async fn store(cache: &LocalCache, content: &[u8]) -> Digest {
        let digest = Digest::of(content);
        let mut sink = Box::new(cache.sink(&digest));
        sink.write(content).await.unwrap();
        sink.commit().await.unwrap();
        digest
    }

    fn age(cache: &LocalCache, digest: &Digest, seconds_ago: u64) {
        let when = SystemTime::now() - Duration::from_secs(seconds_ago);
        std::fs::File::open(cache.path_for(digest))
            .unwrap()
            .set_modified(when)
            .unwrap();
    }

    #[tokio::test]
    async fn committed_entry_is_readable() {
        let temp = TempDir::new().unwrap();
        let cache = LocalCache::open(temp.path(), CachePolicies::default()).await.unwrap();

        let digest = store(&cache, b"cached body").await;
        assert!(cache.contains(&digest));
        assert_eq!(cache.read(&digest).await.unwrap(), b"cached body");
    }

    #[tokio::test]
    async fn entries_skip_foreign_and_temp_files() {
        let temp = TempDir::new().unwrap();
        let cache = LocalCache::open(temp.path(), CachePolicies::default()).await.unwrap();
        let digest = store(&cache, b"one").await;
        std::fs::write(temp.path().join("README"), b"not an entry").unwrap();
        std::fs::write(temp.path().join(format!(".{}.x.tmp", digest)), b"partial").unwrap();

        let entries = cache.entries().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].digest, digest);
        assert_eq!(cache.stats().await.unwrap(), CacheStats { items: 1, total_bytes: 3 });
    }

    #[tokio::test]
    async fn trim_evicts_least_recently_used() {
        let temp = TempDir::new().unwrap();
        let policies = CachePolicies {
            max_items: 2,
            ..CachePolicies::default()
        };
        let cache = LocalCache::open(temp.path(), policies).await.unwrap();

        let oldest = store(&cache, b"oldest").await;
        let middle = store(&cache, b"middle").await;
        let newest = store(&cache, b"newest").await;
        age(&cache, &oldest, 300);
        age(&cache, &middle, 200);
        age(&cache, &newest, 100);
        // Using the oldest entry makes it the most recent.
        cache.touch(&oldest);

        let report = cache.trim().await.unwrap();
        assert_eq!(report.evicted, 1);
        assert!(cache.contains(&oldest));
        assert!(!cache.contains(&middle));
        assert!(cache.contains(&newest));
    }

    #[tokio::test]
    async fn trim_respects_size_limit() {
        let temp = TempDir::new().unwrap();
        let policies = CachePolicies {
            max_size_bytes: 10,
            ..CachePolicies::default()
        };
        let cache = LocalCache::open(temp.path(), policies).await.unwrap();
        let a = store(&cache, b"aaaaaa").await;
        let b = store(&cache, b"bbbbbb").await;
        age(&cache, &a, 100);

        let report = cache.trim().await.unwrap();
        assert_eq!(report.evicted, 1);
        assert_eq!(report.freed_bytes, 6);
        assert!(!cache.contains(&a));
        assert!(cache.contains(&b));
    }

    #[tokio::test]
    async fn trim_removes_read_only_entries() {
        let temp = TempDir::new().unwrap();
        let policies = CachePolicies {
            max_items: 0,
            max_size_bytes: 1,
        };
        let cache = LocalCache::open(temp.path(), policies).await.unwrap();
        let digest = store(&cache, b"protected").await;
        perms::set_read_only(&cache.path_for(&digest), true).unwrap();

        cache.trim().await.unwrap();
        assert!(!cache.contains(&digest));
    }

    #[tokio::test]
    async fn unlimited_policies_keep_everything() {
        let temp = TempDir::new().unwrap();
        let cache = LocalCache::open(temp.path(), CachePolicies::default()).await.unwrap();
        store(&cache, b"one").await;
        store(&cache, b"two").await;

        assert_eq!(cache.trim().await.unwrap(), TrimReport::default());
        assert_eq!(cache.stats().await.unwrap().items, 2);
    }

    #[tokio::test]
    async fn clear_removes_all_entries() {
        let temp = TempDir::new().unwrap();
        let cache = LocalCache::open(temp.path(), CachePolicies::default()).await.unwrap();
        store(&cache, b"one").await;
        store(&cache, b"two").await;

        assert_eq!(cache.clear().await.unwrap(), 2);
        assert!(cache.entries().await.unwrap().is_empty());
    }
}
