//! Resident-set accounting for the page cache.
//!
//! The page-in and eviction paths bump "moved in" and "moved out" counters
//! for pages and bytes; the in-use figures are the difference. Counters are
//! updated from many threads without a lock, so readers load each one once
//! and clamp the difference at zero.

use crate::config::CacheConfig;
use crate::stats::StatsSink;
use crate::storage::error::BtreeResult;
use log::debug;
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Named lock serialising one of the cache's server paths.
#[derive(Debug)]
pub struct ServerLock {
    name: &'static str,
    mutex: Mutex<()>,
}

impl ServerLock {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            mutex: Mutex::new(()),
        }
    }

    /// Default allocator used by [`CacheAccountant::create`].
    pub fn allocate(name: &'static str) -> BtreeResult<Arc<ServerLock>> {
        Ok(Arc::new(ServerLock::new(name)))
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn lock(&self) -> MutexGuard<'_, ()> {
        self.mutex.lock()
    }
}

/// Process-wide resident page and byte counters.
#[derive(Debug)]
pub struct CacheAccountant {
    pages_in: AtomicU64,
    pages_out: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    bytes_max: u64,
    drain: Option<Arc<ServerLock>>,
    read: Option<Arc<ServerLock>>,
    reconcile: Option<Arc<ServerLock>>,
}

impl CacheAccountant {
    pub fn create(config: &CacheConfig) -> BtreeResult<Self> {
        Self::create_with(config, ServerLock::allocate)
    }

    /// Creates the accountant, obtaining its locks from `allocate`. If any
    /// allocation fails, whatever was already obtained is released before
    /// the error is returned.
    pub fn create_with<F>(config: &CacheConfig, mut allocate: F) -> BtreeResult<Self>
    where
        F: FnMut(&'static str) -> BtreeResult<Arc<ServerLock>>,
    {
        debug!("cache initialization: {} MB", config.cache_size_mb);

        let mut cache = Self {
            pages_in: AtomicU64::new(0),
            pages_out: AtomicU64::new(0),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            bytes_max: config.cache_bytes_max(),
            drain: None,
            read: None,
            reconcile: None,
        };

        let allocated = allocate("cache drain server").and_then(|drain| {
            cache.drain = Some(drain);
            cache.read = Some(allocate("cache read server")?);
            cache.reconcile = Some(allocate("reconciliation")?);
            Ok(())
        });
        if let Err(err) = allocated {
            cache.destroy();
            return Err(err);
        }
        Ok(cache)
    }

    /// Releases the accountant's locks. Safe to call more than once and on
    /// an accountant whose creation stopped partway.
    pub fn destroy(&mut self) {
        if let Some(lock) = self.drain.take() {
            debug!("discarding {}", lock.name());
        }
        if let Some(lock) = self.read.take() {
            debug!("discarding {}", lock.name());
        }
        if let Some(lock) = self.reconcile.take() {
            debug!("discarding {}", lock.name());
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.drain.is_none() && self.read.is_none() && self.reconcile.is_none()
    }

    /// Serialises page reads. `None` once the accountant is destroyed.
    pub fn read_lock(&self) -> Option<MutexGuard<'_, ()>> {
        self.read.as_ref().map(|lock| lock.lock())
    }

    /// Serialises evictions. `None` once the accountant is destroyed.
    pub fn drain_lock(&self) -> Option<MutexGuard<'_, ()>> {
        self.drain.as_ref().map(|lock| lock.lock())
    }

    /// Serialises the hand-off from reconciliation back to the cache.
    pub fn reconcile_lock(&self) -> Option<MutexGuard<'_, ()>> {
        self.reconcile.as_ref().map(|lock| lock.lock())
    }

    pub fn record_page_in(&self, bytes: u64) {
        self.pages_in.fetch_add(1, Ordering::Relaxed);
        self.bytes_in.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_page_out(&self, bytes: u64) {
        self.pages_out.fetch_add(1, Ordering::Relaxed);
        self.bytes_out.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn pages_in_use(&self) -> u64 {
        let pages_in = self.pages_in.load(Ordering::Relaxed);
        let pages_out = self.pages_out.load(Ordering::Relaxed);
        pages_in.saturating_sub(pages_out)
    }

    pub fn bytes_in_use(&self) -> u64 {
        let bytes_in = self.bytes_in.load(Ordering::Relaxed);
        let bytes_out = self.bytes_out.load(Ordering::Relaxed);
        bytes_in.saturating_sub(bytes_out)
    }

    pub fn bytes_max(&self) -> u64 {
        self.bytes_max
    }

    /// Publishes the cache figures for return to the application.
    pub fn snapshot_into(&self, stats: &mut dyn StatsSink) {
        stats.set("cache_bytes_inuse", self.bytes_in_use());
        stats.set("cache_pages_inuse", self.pages_in_use());
        stats.set("cache_bytes_max", self.bytes_max);
        stats.set("cache_pages_in", self.pages_in.load(Ordering::Relaxed));
        stats.set("cache_pages_out", self.pages_out.load(Ordering::Relaxed));
    }
}

impl Drop for CacheAccountant {
    fn drop(&mut self) {
        self.destroy();
    }
}
