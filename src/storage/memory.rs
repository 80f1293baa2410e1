//! In-memory content store, used for local runs and tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{ContentHash, ContentStore, Files};
use crate::error::StorageError;

/// Counts collaborator calls that are currently outstanding and remembers
/// the highest concurrency ever observed.
#[derive(Debug, Default)]
pub struct CallTracker {
    current: AtomicUsize,
    peak: AtomicUsize,
    total: AtomicUsize,
}

impl CallTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Mark a call as started; the guard marks it finished when dropped.
    pub fn start(self: &Arc<Self>) -> CallGuard {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.total.fetch_add(1, Ordering::SeqCst);
        CallGuard {
            tracker: Arc::clone(self),
        }
    }

    pub fn current(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn total(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }
}

/// Finishes a tracked call on drop.
pub struct CallGuard {
    tracker: Arc<CallTracker>,
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        self.tracker.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Content store holding every blob in a map.
pub struct InMemoryContentStore {
    blobs: RwLock<HashMap<ContentHash, Files>>,
    tracker: Arc<CallTracker>,
    latency: Duration,
    failing_puts: AtomicUsize,
}

impl InMemoryContentStore {
    pub fn new() -> Self {
        Self::with_tracker(CallTracker::new())
    }

    /// Share a call tracker with other collaborators.
    pub fn with_tracker(tracker: Arc<CallTracker>) -> Self {
        Self {
            blobs: RwLock::new(HashMap::new()),
            tracker,
            latency: Duration::ZERO,
            failing_puts: AtomicUsize::new(0),
        }
    }

    /// Delay every call by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Make the next `count` puts fail.
    pub fn fail_next_puts(&self, count: usize) {
        self.failing_puts.store(count, Ordering::SeqCst);
    }

    /// Store a blob directly, bypassing call tracking.
    pub async fn insert(&self, files: Files) -> ContentHash {
        let hash = ContentHash::of_files(&files);
        self.blobs.write().await.insert(hash, files);
        hash
    }

    /// Read a blob directly, bypassing call tracking.
    pub async fn peek(&self, hash: &ContentHash) -> Option<Files> {
        self.blobs.read().await.get(hash).cloned()
    }

    pub async fn len(&self) -> usize {
        self.blobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.blobs.read().await.is_empty()
    }

    async fn simulate_latency(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

impl Default for InMemoryContentStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContentStore for InMemoryContentStore {
    async fn get(&self, hash: &ContentHash) -> Result<Files, StorageError> {
        let _call = self.tracker.start();
        self.simulate_latency().await;
        self.blobs
            .read()
            .await
            .get(hash)
            .cloned()
            .ok_or_else(|| StorageError::NotFound {
                hash: hash.to_string(),
            })
    }

    async fn put(&self, files: Files) -> Result<ContentHash, StorageError> {
        let _call = self.tracker.start();
        self.simulate_latency().await;
        if files.is_empty() {
            return Err(StorageError::EmptyFileSet);
        }
        let failing = self
            .failing_puts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(StorageError::RequestFailed("injected put failure".into()));
        }
        Ok(self.insert(files).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_get() {
        let store = InMemoryContentStore::new();
        let files = Files::from([("1".to_string(), b"{}".to_vec())]);
        let hash = store.put(files.clone()).await.unwrap();
        assert_eq!(store.get(&hash).await.unwrap(), files);
        assert!(store.get(&ContentHash::of(b"nope")).await.is_err());
    }

    #[tokio::test]
    async fn injected_failures_run_out() {
        let store = InMemoryContentStore::new();
        store.fail_next_puts(1);
        let files = Files::from([("a".to_string(), vec![1])]);
        assert!(store.put(files.clone()).await.is_err());
        assert!(store.put(files).await.is_ok());
    }

    #[tokio::test]
    async fn tracker_counts_calls() {
        let tracker = CallTracker::new();
        let store = InMemoryContentStore::with_tracker(Arc::clone(&tracker));
        let _ = store.get(&ContentHash::of(b"x")).await;
        assert_eq!(tracker.total(), 1);
        assert_eq!(tracker.peak(), 1);
        assert_eq!(tracker.current(), 0);
    }
}
