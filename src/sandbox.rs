//! Sandbox construction
//!
//! Turns a manifest into a populated directory tree:
//!
//! 1. Load the manifest and its includes through the cache
//! 2. Fetch every file digest missing from the cache
//! 3. Hardlink cache bodies into the sandbox, copying across volumes
//! 4. Protect every hardlinked body read-only
//!
//! A build that fails part way removes whatever it created before
//! returning the error.

use crate::cache::LocalCache;
use crate::digest::Digest;
use crate::error::{FetchError, IsolateError, IsolateResult, LinkError};
use crate::manifest::{FileEntry, Manifest, ManifestDocument, SandboxPath};
use crate::perms::{self, HardLinker, Linker};
use crate::storage::{FetchChannel, FetchClient, Priority};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Hooks for reporting build progress. All methods default to no-ops.
pub trait BuildObserver: Send + Sync {
    /// `count` digests are about to be fetched
    fn fetch_started(&self, _count: usize) {}

    fn fetch_finished(&self, _digest: &Digest, _bytes: u64) {}

    fn placed(&self, _path: &SandboxPath) {}

    /// Construction ended, successfully or not
    fn finished(&self) {}
}

/// Observer that reports nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentObserver;

impl BuildObserver for SilentObserver {}

/// A built sandbox. Call [`Sandbox::destroy`] when done with it.
#[derive(Debug)]
pub struct Sandbox {
    root: PathBuf,
    working_dir: PathBuf,
    command: Vec<String>,
    linked: Vec<PathBuf>,
    copied: Vec<PathBuf>,
}

impl Sandbox {
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory the command runs in
    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn command(&self) -> &[String] {
        &self.command
    }

    /// Files that share a body with a cache entry
    pub fn linked(&self) -> &[PathBuf] {
        &self.linked
    }

    /// Files copied because the cache lives on another volume
    pub fn copied(&self) -> &[PathBuf] {
        &self.copied
    }

    /// Delete the whole tree, leaving shared cache bodies protected
    pub async fn destroy(self) -> IsolateResult<()> {
        remove_sandbox(&self.root).await
    }
}

/// Delete a sandbox tree, which may be partially built. Bodies shared with
/// the cache keep their read-only protection.
pub async fn remove_sandbox(root: &Path) -> IsolateResult<()> {
    let path = root.to_path_buf();
    let result = tokio::task::spawn_blocking(move || perms::remove_tree(&path))
        .await
        .unwrap_or_else(|join| Err(io::Error::other(join.to_string())));
    result.map_err(|source| IsolateError::CleanupFailed {
        path: root.to_path_buf(),
        source,
    })
}

/// Builds sandboxes from manifests
pub struct SandboxBuilder {
    client: FetchClient,
    cache: LocalCache,
    linker: Arc<dyn Linker>,
    observer: Arc<dyn BuildObserver>,
}

impl SandboxBuilder {
    pub fn new(client: FetchClient, cache: LocalCache) -> Self {
        Self {
            client,
            cache,
            linker: Arc::new(HardLinker),
            observer: Arc::new(SilentObserver),
        }
    }

    /// Place files with `linker` instead of platform hardlinks
    pub fn with_linker(mut self, linker: impl Linker + 'static) -> Self {
        self.linker = Arc::new(linker);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn BuildObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn cache(&self) -> &LocalCache {
        &self.cache
    }

    /// Fetch, parse and merge the manifest stored under `digest`.
    ///
    /// Includes are loaded level by level. Failing to fetch the root document
    /// is reported as [`IsolateError::ManifestFetch`]; failing to fetch an
    /// include is a build failure like any other missing file.
    pub async fn load_manifest(&self, digest: &Digest) -> IsolateResult<Manifest> {
        let mut documents: HashMap<Digest, ManifestDocument> = HashMap::new();
        let mut level = vec![digest.clone()];

        while !level.is_empty() {
            let wanted: Vec<(Digest, Option<u64>)> =
                level.iter().map(|d| (d.clone(), None)).collect();
            if let Err((failed, source)) = self.ensure_cached(&wanted, Priority::High).await {
                return Err(if &failed == digest {
                    IsolateError::ManifestFetch {
                        digest: failed,
                        source,
                    }
                } else {
                    IsolateError::FetchFailed {
                        digest: failed,
                        source,
                    }
                });
            }

            let mut next = Vec::new();
            for current in level.drain(..) {
                let bytes = self.cache.read(&current).await?;
                let document = ManifestDocument::parse(&current, &bytes)?;
                self.cache.touch(&current);
                for include in &document.includes {
                    if include != &current
                        && !documents.contains_key(include)
                        && !next.contains(include)
                    {
                        next.push(include.clone());
                    }
                }
                documents.insert(current, document);
            }
            next.retain(|d| !documents.contains_key(d));
            level = next;
        }

        let manifest = Manifest::resolve(digest, &documents)?;
        info!(
            "Loaded manifest {} ({} files, {} documents)",
            digest.short(),
            manifest.files.len(),
            documents.len()
        );
        Ok(manifest)
    }

    /// Materialize `manifest` at `root`, which must not exist yet.
    ///
    /// On failure the partially built tree is removed before the error is
    /// returned.
    pub async fn build(&self, manifest: &Manifest, root: &Path) -> IsolateResult<Sandbox> {
        let result = self.build_inner(manifest, root).await;
        self.observer.finished();
        if result.is_err() {
            if let Err(e) = remove_sandbox(root).await {
                warn!("Could not remove partial sandbox: {}", e);
            }
        }
        result
    }

    /// Bring every file of `manifest` into the cache without touching any
    /// sandbox. Safe to drop part way.
    pub async fn prefetch(&self, manifest: &Manifest) -> IsolateResult<()> {
        self.ensure_cached(&manifest.unique_digests(), Priority::Normal)
            .await
            .map_err(|(digest, source)| IsolateError::FetchFailed { digest, source })
    }

    async fn build_inner(&self, manifest: &Manifest, root: &Path) -> IsolateResult<Sandbox> {
        self.prefetch(manifest).await?;

        let plan: Vec<(SandboxPath, FileEntry, PathBuf)> = manifest
            .files
            .iter()
            .map(|(path, entry)| (path.clone(), entry.clone(), self.cache.path_for(&entry.digest)))
            .collect();
        let linker = Arc::clone(&self.linker);
        let observer = Arc::clone(&self.observer);
        let sandbox_root = root.to_path_buf();
        let placement = tokio::task::spawn_blocking(move || {
            place_files(linker.as_ref(), observer.as_ref(), &sandbox_root, &plan)
        })
        .await
        .map_err(|e| IsolateError::io("placing sandbox files", io::Error::other(e.to_string())))??;

        for (digest, _) in manifest.unique_digests() {
            self.cache.touch(&digest);
        }

        let working_dir = match &manifest.relative_cwd {
            Some(cwd) => cwd.under(root),
            None => root.to_path_buf(),
        };
        tokio::fs::create_dir_all(&working_dir).await.map_err(|e| {
            IsolateError::io(format!("creating working directory {}", working_dir.display()), e)
        })?;

        info!(
            "Built sandbox at {} ({} linked, {} copied)",
            root.display(),
            placement.linked.len(),
            placement.copied.len()
        );

        Ok(Sandbox {
            root: root.to_path_buf(),
            working_dir,
            command: manifest.command.clone(),
            linked: placement.linked,
            copied: placement.copied,
        })
    }

    /// Fetch every digest in `wanted` that the cache does not hold yet.
    ///
    /// Returns the first failed digest with its error once all requested
    /// fetches have completed.
    async fn ensure_cached(
        &self,
        wanted: &[(Digest, Option<u64>)],
        priority: Priority,
    ) -> Result<(), (Digest, FetchError)> {
        let mut channel = FetchChannel::new();
        let mut requested = Vec::new();

        for (digest, size) in wanted {
            if self.cache.contains(digest) {
                debug!("Cache hit for {}", digest.short());
                continue;
            }
            self.client.async_fetch(
                &channel,
                priority,
                digest.clone(),
                *size,
                Box::new(self.cache.sink(digest)),
            );
            requested.push(digest.clone());
        }

        if requested.is_empty() {
            return Ok(());
        }
        debug!(
            "Fetching {} objects from {} backend",
            requested.len(),
            self.client.backend_name()
        );
        self.observer.fetch_started(requested.len());

        let mut failure = None;
        for completion in channel.wait_all(requested).await {
            match completion.result {
                Ok(bytes) => self.observer.fetch_finished(&completion.digest, bytes),
                Err(e) => {
                    warn!("Fetch of {} failed: {}", completion.digest.short(), e);
                    if failure.is_none() {
                        failure = Some((completion.digest, e));
                    }
                }
            }
        }
        failure.map_or(Ok(()), Err)
    }
}

struct Placement {
    linked: Vec<PathBuf>,
    copied: Vec<PathBuf>,
}

/// Link or copy every planned file under `root`, then protect the links
fn place_files(
    linker: &dyn Linker,
    observer: &dyn BuildObserver,
    root: &Path,
    plan: &[(SandboxPath, FileEntry, PathBuf)],
) -> IsolateResult<Placement> {
    fs::create_dir_all(root)
        .map_err(|e| IsolateError::io(format!("creating sandbox {}", root.display()), e))?;

    let mut placement = Placement {
        linked: Vec::with_capacity(plan.len()),
        copied: Vec::new(),
    };

    for (path, entry, source) in plan {
        let destination = path.under(root);
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| IsolateError::io(format!("creating {}", parent.display()), e))?;
        }

        match linker.link(source, &destination) {
            Ok(()) => placement.linked.push(destination.clone()),
            Err(LinkError::CrossDevice { .. }) => {
                debug!("{} is on another volume, copying", path);
                copy_writable(source, &destination).map_err(|e| link_io(path, source, &destination, e))?;
                placement.copied.push(destination.clone());
            }
            Err(source) => {
                return Err(IsolateError::Link {
                    path: path.as_path().to_path_buf(),
                    source,
                })
            }
        }

        if entry.is_executable() {
            perms::set_executable(&destination).map_err(|e| link_io(path, source, &destination, e))?;
        }
        observer.placed(path);
    }

    for linked in &placement.linked {
        perms::set_read_only(linked, true)
            .map_err(|e| IsolateError::io(format!("protecting {}", linked.display()), e))?;
    }

    Ok(placement)
}

/// Copy a cache body; the copy belongs to the sandbox alone
fn copy_writable(source: &Path, destination: &Path) -> io::Result<()> {
    fs::copy(source, destination)?;
    perms::set_read_only(destination, false)
}

fn link_io(path: &SandboxPath, source: &Path, destination: &Path, error: io::Error) -> IsolateError {
    IsolateError::Link {
        path: path.as_path().to_path_buf(),
        source: LinkError::Io {
            source_path: source.to_path_buf(),
            destination: destination.to_path_buf(),
            error,
        },
    }
}
