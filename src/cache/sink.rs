//! Atomic cache writes

use crate::digest::Digest;
use crate::storage::FetchSink;
use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

pub(super) fn is_temp_name(name: &str) -> bool {
    name.starts_with('.') && name.ends_with(".tmp")
}

/// Writes one cache entry through a temporary file
///
/// Nothing is visible under the digest name until [`FetchSink::commit`]
/// renames the finished body into place. A sink dropped without commit
/// removes its temporary file.
pub struct CacheSink {
    temp_path: PathBuf,
    final_path: PathBuf,
    file: Option<File>,
    finished: bool,
}

impl CacheSink {
    pub(super) fn new(root: &Path, digest: &Digest) -> Self {
        Self {
            temp_path: root.join(format!(
                ".{}.{}.tmp",
                digest.as_str(),
                Uuid::new_v4().simple()
            )),
            final_path: root.join(digest.as_str()),
            file: None,
            finished: false,
        }
    }

    pub fn final_path(&self) -> &Path {
        &self.final_path
    }

    async fn file(&mut self) -> io::Result<&mut File> {
        if self.file.is_none() {
            self.file = Some(File::create(&self.temp_path).await?);
        }
        self.file
            .as_mut()
            .ok_or_else(|| io::Error::other("cache sink closed"))
    }
}

#[async_trait]
impl FetchSink for CacheSink {
    async fn write(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.file().await?.write_all(chunk).await
    }

    async fn reset(&mut self) -> io::Result<()> {
        self.file = None;
        match fs::remove_file(&self.temp_path).await {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    async fn commit(mut self: Box<Self>) -> io::Result<()> {
        // Empty bodies never call write
        let file = self.file().await?;
        file.flush().await?;
        file.sync_all().await?;
        self.file = None;

        let result = fs::rename(&self.temp_path, &self.final_path).await;
        if let Err(e) = result {
            // A concurrent writer may have placed identical bytes first, and
            // some platforms refuse to replace a read-only file.
            if fs::metadata(&self.final_path).await.is_err() {
                return Err(e);
            }
            debug!("{} already committed by another writer", self.final_path.display());
            let _ = fs::remove_file(&self.temp_path).await;
        }
        self.finished = true;
        Ok(())
    }

    async fn abort(mut self: Box<Self>) {
        self.file = None;
        let _ = fs::remove_file(&self.temp_path).await;
        self.finished = true;
    }
}

impl Drop for CacheSink {
    fn drop(&mut self) {
        if !self.finished {
            self.file = None;
            let _ = std::fs::remove_file(&self.temp_path);
        }
    }
}
