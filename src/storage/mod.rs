//! Content-addressed storage access
//!
//! A [`StorageBackend`] turns a digest into a stream of byte chunks. The
//! [`FetchClient`] schedules requests against a backend with priorities, a
//! bounded number of in-flight fetches and retries, and reports exactly one
//! [`Completion`] per request on a [`FetchChannel`].
//!
//! No network transport lives here. The bundled backends read from a local
//! directory (for example a mounted share) or from memory.

mod client;
mod local;
mod memory;
mod retry;

pub use client::{Completion, FetchChannel, FetchClient, FetchSink, Priority};
pub use local::DirectoryBackend;
pub use memory::MemoryBackend;
pub use retry::RetryPolicy;

use crate::digest::Digest;
use crate::error::FetchError;
use async_trait::async_trait;
use futures_util::stream::BoxStream;

/// Chunks of one object, in order
pub type ChunkStream = BoxStream<'static, Result<Vec<u8>, FetchError>>;

/// Abstract content-addressed store
///
/// Implementations report an unknown digest as [`FetchError::NotFound`] and
/// any failure worth retrying as [`FetchError::Transport`]. Size and digest
/// verification is done by the [`FetchClient`], not by backends.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Open the object identified by `digest`
    async fn fetch(&self, digest: &Digest) -> Result<ChunkStream, FetchError>;

    /// Human-readable backend name for logs
    fn name(&self) -> &'static str;
}
