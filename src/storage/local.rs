//! Directory-backed store
//!
//! Objects are files named by their digest directly under the root, the same
//! layout the local cache uses. Useful for stores shared over a mounted
//! filesystem and for seeding a store from the command line.

use crate::digest::Digest;
use crate::error::{FetchError, IsolateError, IsolateResult};
use crate::storage::{ChunkStream, StorageBackend};
use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use std::io;
use std::path::{Path, PathBuf};
use tokio::io::AsyncReadExt;
use tracing::debug;
use uuid::Uuid;

const CHUNK_SIZE: usize = 64 * 1024;

/// Store rooted at a local directory
#[derive(Debug, Clone)]
pub struct DirectoryBackend {
    root: PathBuf,
}

impl DirectoryBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, digest: &Digest) -> PathBuf {
        self.root.join(digest.as_str())
    }

    /// Add `content` to the store and return its digest.
    ///
    /// Written to a temporary name first and renamed into place, so readers
    /// never see a partial object.
    pub async fn put(&self, content: &[u8]) -> IsolateResult<Digest> {
        let digest = Digest::of(content);
        let path = self.object_path(&digest);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            debug!("{} already stored", digest.short());
            return Ok(digest);
        }

        tokio::fs::create_dir_all(&self.root).await.map_err(|e| {
            IsolateError::io(format!("creating store directory {}", self.root.display()), e)
        })?;

        let temp = self
            .root
            .join(format!(".{}.{}.tmp", digest.as_str(), Uuid::new_v4().simple()));
        tokio::fs::write(&temp, content)
            .await
            .map_err(|e| IsolateError::io(format!("writing {}", temp.display()), e))?;
        if let Err(e) = tokio::fs::rename(&temp, &path).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(IsolateError::io(format!("storing {}", path.display()), e));
        }

        Ok(digest)
    }
}

fn transport(digest: &Digest, err: io::Error) -> FetchError {
    FetchError::Transport(format!("reading {}: {}", digest.short(), err))
}

#[async_trait]
impl StorageBackend for DirectoryBackend {
    async fn fetch(&self, digest: &Digest) -> Result<ChunkStream, FetchError> {
        let file = match tokio::fs::File::open(self.object_path(digest)).await {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(FetchError::NotFound(digest.clone()))
            }
            Err(e) => return Err(transport(digest, e)),
        };

        let digest = digest.clone();
        let chunks = stream::try_unfold(file, move |mut file| {
            let digest = digest.clone();
            async move {
                let mut buf = vec![0u8; CHUNK_SIZE];
                match file.read(&mut buf).await {
                    Ok(0) => Ok(None),
                    Ok(read) => {
                        buf.truncate(read);
                        Ok(Some((buf, file)))
                    }
                    Err(e) => Err(transport(&digest, e)),
                }
            }
        });

        Ok(chunks.boxed())
    }

    fn name(&self) -> &'static str {
        "directory"
    }
}
