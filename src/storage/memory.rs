//! In-memory backend for embedding and tests

use crate::digest::Digest;
use crate::error::FetchError;
use crate::storage::{ChunkStream, StorageBackend};
use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::Mutex;

const DEFAULT_CHUNK_SIZE: usize = 4096;

#[derive(Default)]
struct State {
    objects: HashMap<Digest, Vec<u8>>,
    calls: HashMap<Digest, usize>,
    failures: HashMap<Digest, u32>,
}

/// Objects held in a map, served in fixed-size chunks
///
/// Counts every fetch per digest and can inject transient failures, which
/// makes it useful to observe caching and retry behavior.
pub struct MemoryBackend {
    state: Mutex<State>,
    chunk_size: usize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::with_chunk_size(DEFAULT_CHUNK_SIZE)
    }

    pub fn with_chunk_size(chunk_size: usize) -> Self {
        Self {
            state: Mutex::new(State::default()),
            chunk_size: chunk_size.max(1),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Store `content` under its digest
    pub fn insert(&self, content: impl Into<Vec<u8>>) -> Digest {
        let content = content.into();
        let digest = Digest::of(&content);
        self.state().objects.insert(digest.clone(), content);
        digest
    }

    /// Store `content` under an arbitrary digest, e.g. to simulate corruption
    pub fn insert_raw(&self, digest: Digest, content: impl Into<Vec<u8>>) {
        self.state().objects.insert(digest, content.into());
    }

    /// Make the next `times` fetches of `digest` fail with a transport error
    pub fn fail_next(&self, digest: &Digest, times: u32) {
        self.state().failures.insert(digest.clone(), times);
    }

    /// Number of fetches issued for `digest`, including failed ones
    pub fn calls(&self, digest: &Digest) -> usize {
        self.state().calls.get(digest).copied().unwrap_or(0)
    }

    /// Number of fetches issued for all digests
    pub fn total_calls(&self) -> usize {
        self.state().calls.values().sum()
    }

    fn load(&self, digest: &Digest) -> Result<Vec<u8>, FetchError> {
        let mut state = self.state();
        *state.calls.entry(digest.clone()).or_insert(0) += 1;

        if let Some(remaining) = state.failures.get_mut(digest) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(FetchError::Transport(format!(
                    "injected failure for {}",
                    digest.short()
                )));
            }
        }

        state
            .objects
            .get(digest)
            .cloned()
            .ok_or_else(|| FetchError::NotFound(digest.clone()))
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn fetch(&self, digest: &Digest) -> Result<ChunkStream, FetchError> {
        let content = self.load(digest)?;
        let chunks: Vec<Result<Vec<u8>, FetchError>> = content
            .chunks(self.chunk_size)
            .map(|chunk| Ok(chunk.to_vec()))
            .collect();
        Ok(stream::iter(chunks).boxed())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
