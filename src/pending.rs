//! Per-uploader staging of files that have not been committed to a bundle.
//!
//! Collections live only in process memory and are lost on restart. Each uploader
//! gets its own slot behind an async mutex: calls for one uploader are serialized,
//! calls for different uploaders never wait on each other. The slot lock is held
//! across the bundle transaction so a collection is cleared in the same critical
//! section that commits it.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;

use crate::bundles::BundleStore;
use crate::error::{AppError, Result};
use crate::models::{Bundle, FileDescriptor};

#[derive(Debug)]
struct PendingState {
    items: Vec<FileDescriptor>,
    touched: Instant,
    last_committed: Option<String>,
    evicted: bool,
}

impl PendingState {
    fn new() -> Self {
        Self {
            items: Vec::new(),
            touched: Instant::now(),
            last_committed: None,
            evicted: false,
        }
    }
}

type Slot = Arc<Mutex<PendingState>>;

#[derive(Clone)]
pub struct PendingCollections {
    slots: Arc<DashMap<String, Slot>>,
    bundles: BundleStore,
    max_items: usize,
}

impl PendingCollections {
    pub fn new(bundles: BundleStore, max_items: usize) -> Self {
        Self {
            slots: Arc::new(DashMap::new()),
            bundles,
            max_items,
        }
    }

    fn slot(&self, uploader: &str) -> Slot {
        let entry = self
            .slots
            .entry(uploader.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(PendingState::new())));
        Arc::clone(entry.value())
    }

    /// Locks the uploader's live slot, creating it if needed.
    async fn lock_live(&self, uploader: &str) -> OwnedMutexGuard<PendingState> {
        loop {
            let state = self.slot(uploader).lock_owned().await;
            if !state.evicted {
                return state;
            }
            // Lost a race with eviction; the map now holds a fresh slot.
        }
    }

    /// Locks the uploader's live slot if one exists.
    async fn lock_existing(&self, uploader: &str) -> Option<OwnedMutexGuard<PendingState>> {
        loop {
            let slot = self.slots.get(uploader).map(|slot| Arc::clone(slot.value()))?;
            let state = slot.lock_owned().await;
            if !state.evicted {
                return Some(state);
            }
        }
    }

    /// Appends a file and returns the new collection length.
    pub async fn add(&self, uploader: &str, descriptor: FileDescriptor) -> Result<usize> {
        let mut state = self.lock_live(uploader).await;
        if state.items.len() >= self.max_items {
            return Err(AppError::CollectionFull {
                limit: self.max_items,
            });
        }
        state.items.push(descriptor);
        state.touched = Instant::now();
        tracing::debug!(uploader, pending = state.items.len(), "file staged");
        Ok(state.items.len())
    }

    /// Drops the staged files. Returns `None` when there was nothing to clear.
    pub async fn clear(&self, uploader: &str) -> Option<usize> {
        let mut state = self.lock_existing(uploader).await?;
        let cleared = std::mem::take(&mut state.items).len();
        state.touched = Instant::now();
        (cleared > 0).then_some(cleared)
    }

    pub async fn items(&self, uploader: &str) -> Vec<FileDescriptor> {
        match self.lock_existing(uploader).await {
            Some(state) => state.items.clone(),
            None => Vec::new(),
        }
    }

    pub async fn last_committed(&self, uploader: &str) -> Option<String> {
        self.lock_existing(uploader).await?.last_committed.clone()
    }

    /// Commits the staged files as a bundle. On failure the collection is left intact.
    pub async fn finalize(
        &self,
        uploader: &str,
        title: Option<&str>,
        description: Option<&str>,
    ) -> Result<Bundle> {
        let mut state = self.lock_live(uploader).await;
        if state.items.is_empty() {
            return Err(AppError::EmptyCollection);
        }

        let bundle = self
            .bundles
            .finalize_bundle(uploader, &state.items, title, description)
            .await?;

        state.items.clear();
        state.touched = Instant::now();
        state.last_committed = Some(bundle.id.clone());
        Ok(bundle)
    }

    /// Removes collections untouched for longer than `ttl`. Busy slots are skipped.
    pub fn evict_stale(&self, ttl: Duration) -> usize {
        let before = self.slots.len();
        self.slots.retain(|uploader, slot| match slot.try_lock() {
            Ok(mut state) if state.touched.elapsed() > ttl => {
                if !state.items.is_empty() {
                    tracing::info!(uploader = %uploader, dropped = state.items.len(), "evicting stale pending collection");
                }
                state.evicted = true;
                false
            }
            _ => true,
        });
        before.saturating_sub(self.slots.len())
    }
}
