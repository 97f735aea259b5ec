//! Switchyard store: an in-RAM mirror of remote objects kept in sync by list+watch.
//!
//! [`Reflector`] owns the mutable [`Cache`] and is the only writer. Readers get
//! a cloneable [`Store`] handle backed by an atomically swapped snapshot.

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use rustc_hash::FxHashMap;
use switchyard_core::{ObjectKey, ResourceVersion, SourceError, WatchedObject};
use tokio::sync::watch;

mod backoff;
mod cache;
mod reflector;

pub use backoff::Backoff;
pub use cache::{Cache, Emitted};
pub use reflector::{Reflector, ReflectorConfig};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("initial list failed after {attempts} attempts: {source}")]
    InitialList {
        attempts: u32,
        #[source]
        source: SourceError,
    },
    #[error("cancelled before initial sync")]
    Cancelled,
}

/// Immutable view of the cache at one point in time.
#[derive(Debug, Default)]
pub struct CacheSnapshot {
    pub epoch: u64,
    pub cursor: Option<ResourceVersion>,
    pub items: FxHashMap<ObjectKey, Arc<WatchedObject>>,
}

/// Read handle for concurrent callers. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    snap: Arc<ArcSwap<CacheSnapshot>>,
    epoch_rx: watch::Receiver<u64>,
    synced: Arc<AtomicBool>,
}

impl Store {
    pub fn current(&self) -> Arc<CacheSnapshot> { self.snap.load_full() }
    pub fn get(&self, key: &ObjectKey) -> Option<Arc<WatchedObject>> { self.snap.load().items.get(key).cloned() }
    pub fn len(&self) -> usize { self.snap.load().items.len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }
    pub fn cursor(&self) -> Option<ResourceVersion> { self.snap.load().cursor }
    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> { self.epoch_rx.clone() }

    /// True once the initial list has been applied. Never flips back.
    pub fn has_synced(&self) -> bool { self.synced.load(Ordering::Acquire) }
}

/// Writer half paired with a [`Store`].
pub(crate) struct Publisher {
    snap: Arc<ArcSwap<CacheSnapshot>>,
    epoch_tx: watch::Sender<u64>,
    synced: Arc<AtomicBool>,
    epoch: u64,
}

impl Publisher {
    pub(crate) fn pair() -> (Publisher, Store) {
        let snap = Arc::new(ArcSwap::from_pointee(CacheSnapshot::default()));
        let (epoch_tx, epoch_rx) = watch::channel(0u64);
        let synced = Arc::new(AtomicBool::new(false));
        let publisher = Publisher { snap: Arc::clone(&snap), epoch_tx, synced: Arc::clone(&synced), epoch: 0 };
        (publisher, Store { snap, epoch_rx, synced })
    }

    pub(crate) fn publish(&mut self, cache: &Cache) {
        self.epoch = self.epoch.saturating_add(1);
        let next = CacheSnapshot { epoch: self.epoch, cursor: cache.cursor(), items: cache.entries().clone() };
        self.snap.store(Arc::new(next));
        let _ = self.epoch_tx.send(self.epoch);
        metrics::gauge!("cache_objects").set(cache.len() as f64);
    }

    pub(crate) fn mark_synced(&self) { self.synced.store(true, Ordering::Release); }
}
