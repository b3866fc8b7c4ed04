//! Prioritized, bounded fetch scheduling
//!
//! Requests go into a priority queue. A dispatcher task pops the most urgent
//! one whenever a worker slot is free, so at most `max_in_flight` backend
//! fetches run at once and later submissions simply wait in the queue.

use crate::digest::Digest;
use crate::error::FetchError;
use crate::storage::{RetryPolicy, StorageBackend};
use async_trait::async_trait;
use futures_util::StreamExt;
use sha2::{Digest as _, Sha256};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

/// Scheduling priority. Only affects the order in which queued requests
/// start, never their outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Low,
    Normal,
    High,
}

/// Destination for fetched bytes
///
/// A sink receives chunks in order. It is committed once the content was
/// verified, reset before a retry, and aborted when the fetch fails for good.
#[async_trait]
pub trait FetchSink: Send {
    async fn write(&mut self, chunk: &[u8]) -> io::Result<()>;

    /// Discard everything written so far
    async fn reset(&mut self) -> io::Result<()>;

    async fn commit(self: Box<Self>) -> io::Result<()>;

    async fn abort(self: Box<Self>);
}

/// Terminal signal for one request
#[derive(Debug)]
pub struct Completion {
    pub digest: Digest,
    /// Number of bytes delivered to the sink
    pub result: Result<u64, FetchError>,
}

/// Receives the completions of the requests submitted with it
pub struct FetchChannel {
    tx: UnboundedSender<Completion>,
    rx: UnboundedReceiver<Completion>,
}

impl FetchChannel {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx }
    }

    /// Wait for the completion of every digest in `digests`, in whatever
    /// order they finish.
    ///
    /// Completions for digests outside the set are dropped.
    pub async fn wait_all(&mut self, digests: impl IntoIterator<Item = Digest>) -> Vec<Completion> {
        let mut pending: HashSet<Digest> = digests.into_iter().collect();
        let mut completed = Vec::with_capacity(pending.len());

        while !pending.is_empty() {
            // The channel keeps its own sender, so recv only ends with it.
            let Some(completion) = self.rx.recv().await else {
                break;
            };
            if pending.remove(&completion.digest) {
                completed.push(completion);
            } else {
                debug!("Ignoring completion for {}", completion.digest.short());
            }
        }

        completed
    }
}

impl Default for FetchChannel {
    fn default() -> Self {
        Self::new()
    }
}

struct FetchRequest {
    digest: Digest,
    expected_size: Option<u64>,
    sink: Box<dyn FetchSink>,
    done: UnboundedSender<Completion>,
}

struct Queued {
    priority: Priority,
    sequence: u64,
    request: FetchRequest,
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    // Max-heap: higher priority first, then earlier submission.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

struct Shared {
    backend: Arc<dyn StorageBackend>,
    queue: Mutex<BinaryHeap<Queued>>,
    ready: Notify,
    closed: AtomicBool,
    slots: Arc<Semaphore>,
    retry: RetryPolicy,
    sequence: AtomicU64,
}

impl Shared {
    fn pop(&self) -> Option<Queued> {
        self.queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop()
    }
}

/// Schedules fetches against a [`StorageBackend`]
///
/// Must be created inside a Tokio runtime. Dropping the client lets the
/// dispatcher finish the queued requests and exit.
pub struct FetchClient {
    shared: Arc<Shared>,
}

impl FetchClient {
    pub fn new(backend: Arc<dyn StorageBackend>, max_in_flight: usize, retry: RetryPolicy) -> Self {
        let shared = Arc::new(Shared {
            backend,
            queue: Mutex::new(BinaryHeap::new()),
            ready: Notify::new(),
            closed: AtomicBool::new(false),
            slots: Arc::new(Semaphore::new(max_in_flight.max(1))),
            retry,
            sequence: AtomicU64::new(0),
        });
        tokio::spawn(dispatch(Arc::clone(&shared)));
        Self { shared }
    }

    /// Schedule retrieval of `digest` into `sink`.
    ///
    /// Returns immediately. The outcome arrives on `channel` as exactly one
    /// [`Completion`] for this request.
    pub fn async_fetch(
        &self,
        channel: &FetchChannel,
        priority: Priority,
        digest: Digest,
        expected_size: Option<u64>,
        sink: Box<dyn FetchSink>,
    ) {
        let sequence = self.shared.sequence.fetch_add(1, AtomicOrdering::Relaxed);
        debug!("Queueing {} at {:?} priority", digest.short(), priority);

        let queued = Queued {
            priority,
            sequence,
            request: FetchRequest {
                digest,
                expected_size,
                sink,
                done: channel.tx.clone(),
            },
        };
        self.shared
            .queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(queued);
        self.shared.ready.notify_one();
    }

    /// Name of the backend this client talks to
    pub fn backend_name(&self) -> &'static str {
        self.shared.backend.name()
    }
}

impl Drop for FetchClient {
    fn drop(&mut self) {
        self.shared.closed.store(true, AtomicOrdering::Release);
        self.shared.ready.notify_one();
    }
}

async fn dispatch(shared: Arc<Shared>) {
    loop {
        let Ok(slot) = Arc::clone(&shared.slots).acquire_owned().await else {
            return;
        };

        let queued = loop {
            if let Some(queued) = shared.pop() {
                break queued;
            }
            if shared.closed.load(AtomicOrdering::Acquire) {
                return;
            }
            shared.ready.notified().await;
        };

        tokio::spawn(serve(Arc::clone(&shared), queued.request, slot));
    }
}

/// Delivers a failure if the worker is dropped before it reported anything.
struct CompletionGuard {
    digest: Digest,
    done: Option<UnboundedSender<Completion>>,
}

impl CompletionGuard {
    fn complete(&mut self, result: Result<u64, FetchError>) {
        if let Some(done) = self.done.take() {
            let _ = done.send(Completion {
                digest: self.digest.clone(),
                result,
            });
        }
    }
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        if self.done.is_some() {
            self.complete(Err(FetchError::Transport(
                "fetch worker stopped before completing".to_string(),
            )));
        }
    }
}

async fn serve(shared: Arc<Shared>, request: FetchRequest, _slot: OwnedSemaphorePermit) {
    let FetchRequest {
        digest,
        expected_size,
        sink,
        done,
    } = request;
    let mut guard = CompletionGuard {
        digest: digest.clone(),
        done: Some(done),
    };

    let result = fetch_with_retry(&shared, &digest, expected_size, sink).await;
    match &result {
        Ok(size) => debug!("Fetched {} ({} bytes)", digest.short(), size),
        Err(e) => warn!("Fetch of {} failed: {}", digest.short(), e),
    }
    guard.complete(result);
}

async fn fetch_with_retry(
    shared: &Shared,
    digest: &Digest,
    expected_size: Option<u64>,
    mut sink: Box<dyn FetchSink>,
) -> Result<u64, FetchError> {
    let mut attempt = 1;
    loop {
        let outcome =
            fetch_once(shared.backend.as_ref(), digest, expected_size, sink.as_mut()).await;
        match outcome {
            Ok(size) => {
                return match sink.commit().await {
                    Ok(()) => Ok(size),
                    Err(e) => Err(FetchError::Sink(e)),
                };
            }
            Err(e) if e.is_retryable() && shared.retry.allows_retry_after(attempt) => {
                let delay = shared.retry.delay_for(attempt);
                debug!(
                    "Attempt {} for {} failed ({}), retrying in {:?}",
                    attempt,
                    digest.short(),
                    e,
                    delay
                );
                if let Err(e) = sink.reset().await {
                    sink.abort().await;
                    return Err(FetchError::Sink(e));
                }
                attempt += 1;
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                sink.abort().await;
                return Err(e);
            }
        }
    }
}

/// Stream one object into `sink`, verifying its size and digest.
async fn fetch_once(
    backend: &dyn StorageBackend,
    digest: &Digest,
    expected_size: Option<u64>,
    sink: &mut dyn FetchSink,
) -> Result<u64, FetchError> {
    let mut chunks = backend.fetch(digest).await?;
    let mut hasher = Sha256::new();
    let mut received: u64 = 0;

    while let Some(chunk) = chunks.next().await {
        let chunk = chunk?;
        received += chunk.len() as u64;
        if let Some(expected) = expected_size {
            // Stop early instead of writing an oversized body.
            if received > expected {
                return Err(FetchError::SizeMismatch {
                    digest: digest.clone(),
                    expected,
                    actual: received,
                });
            }
        }
        hasher.update(&chunk);
        sink.write(&chunk).await.map_err(FetchError::Sink)?;
    }

    if let Some(expected) = expected_size {
        if received != expected {
            return Err(FetchError::SizeMismatch {
                digest: digest.clone(),
                expected,
                actual: received,
            });
        }
    }

    let actual = Digest::from_hasher(hasher);
    if actual != *digest {
        return Err(FetchError::DigestMismatch {
            expected: digest.clone(),
            actual,
        });
    }

    Ok(received)
}
