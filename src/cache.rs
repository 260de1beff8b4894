//! Discard caches for releasable item payloads.
//!
//! A link whose payload is storage managed, stable and discardable hands its only strong handle
//! to one of these caches. The cache keeps payloads in least-recently-managed order and, once
//! over its byte budget, drops the oldest handles and asks the owning links to release what
//! they can. Links never call in here while holding their own monitor; the cache may briefly
//! take a link monitor while holding its own.

use std::sync::{Arc, Weak};

use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use smallvec::SmallVec;
use tracing::{debug, warn};

use crate::config::CacheOptions;
use crate::error::{Result, StoreError};
use crate::item::Item;
use crate::link::Link;
use crate::types::{LinkId, StorageStrategy};

struct Entry {
    link: Weak<Link>,
    // Owning handle; dropping it lets the link's soft reference die.
    _item: Arc<dyn Item>,
    size: usize,
}

struct CacheInner {
    entries: LruCache<LinkId, Entry>,
    bytes: usize,
    managed: u64,
    unmanaged: u64,
    evictions: u64,
}

/// Counters exposed by [`ItemCache::stats`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Cache name.
    pub name: &'static str,
    /// Byte budget.
    pub capacity: usize,
    /// Bytes currently held.
    pub bytes: usize,
    /// Payloads currently held.
    pub entries: usize,
    /// Payloads ever admitted.
    pub managed: u64,
    /// Payloads withdrawn by their links.
    pub unmanaged: u64,
    /// Payloads dropped for space.
    pub evictions: u64,
}

/// One byte-bounded discard cache.
pub struct ItemCache {
    name: &'static str,
    capacity: usize,
    inner: Mutex<CacheInner>,
}

type Evicted = SmallVec<[Arc<Link>; 4]>;

impl ItemCache {
    /// Creates a cache holding at most `capacity` bytes of payload.
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            capacity,
            inner: Mutex::new(CacheInner {
                entries: LruCache::unbounded(),
                bytes: 0,
                managed: 0,
                unmanaged: 0,
                evictions: 0,
            }),
        }
    }

    /// Cache name, for diagnostics.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Byte budget.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Fails with [`StoreError::OutOfCacheSpace`] when a payload of `size` can never fit.
    pub fn check_fits(&self, size: usize) -> Result<()> {
        if size > self.capacity {
            return Err(StoreError::OutOfCacheSpace {
                requested: size,
                capacity: self.capacity,
            });
        }
        Ok(())
    }

    /// Takes ownership of `item` on behalf of `link`, evicting older payloads if needed.
    pub fn manage(&self, link: &Arc<Link>, item: Arc<dyn Item>) {
        let evicted = {
            let mut inner = self.inner.lock();
            self.admit(&mut inner, link, item);
            self.evict_over_capacity(&mut inner)
        };
        self.release_evicted(evicted);
    }

    /// Withdraws the payload held for `id`, if any.
    pub fn unmanage(&self, id: LinkId) -> bool {
        let mut inner = self.inner.lock();
        self.withdraw(&mut inner, id)
    }

    /// Brings the cache in line with the link's current releasability.
    ///
    /// `keepalive` is the strong handle the link gave up when it became releasable; holding it
    /// until the cache owns the payload keeps the link's soft reference alive.
    pub(crate) fn reconcile(&self, link: &Arc<Link>, keepalive: Option<Arc<dyn Item>>) {
        let evicted = {
            let mut inner = self.inner.lock();
            match link.releasable_payload() {
                Some(item) => {
                    if inner.entries.contains(&link.id()) {
                        inner.entries.promote(&link.id());
                    } else {
                        self.admit(&mut inner, link, item);
                    }
                }
                None => {
                    self.withdraw(&mut inner, link.id());
                }
            }
            self.evict_over_capacity(&mut inner)
        };
        drop(keepalive);
        self.release_evicted(evicted);
    }

    /// Returns `true` while a payload for `id` is held.
    pub fn contains(&self, id: LinkId) -> bool {
        self.inner.lock().entries.contains(&id)
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            name: self.name,
            capacity: self.capacity,
            bytes: inner.bytes,
            entries: inner.entries.len(),
            managed: inner.managed,
            unmanaged: inner.unmanaged,
            evictions: inner.evictions,
        }
    }

    fn admit(&self, inner: &mut CacheInner, link: &Arc<Link>, item: Arc<dyn Item>) {
        let size = link.in_memory_size();
        if let Some(previous) = inner.entries.put(
            link.id(),
            Entry {
                link: Arc::downgrade(link),
                _item: item,
                size,
            },
        ) {
            inner.bytes = inner.bytes.saturating_sub(previous.size);
        }
        inner.bytes += size;
        inner.managed += 1;
        link.set_cache_managed(true);
    }

    fn withdraw(&self, inner: &mut CacheInner, id: LinkId) -> bool {
        match inner.entries.pop(&id) {
            Some(entry) => {
                inner.bytes = inner.bytes.saturating_sub(entry.size);
                inner.unmanaged += 1;
                if let Some(link) = entry.link.upgrade() {
                    link.set_cache_managed(false);
                }
                true
            }
            None => false,
        }
    }

    fn evict_over_capacity(&self, inner: &mut CacheInner) -> Evicted {
        let mut evicted = Evicted::new();
        while inner.bytes > self.capacity {
            let Some((id, entry)) = inner.entries.pop_lru() else {
                break;
            };
            inner.bytes = inner.bytes.saturating_sub(entry.size);
            inner.evictions += 1;
            debug!(cache = self.name, link = %id, size = entry.size, "evicting payload");
            if let Some(link) = entry.link.upgrade() {
                link.set_cache_managed(false);
                evicted.push(link);
            }
        }
        evicted
    }

    fn release_evicted(&self, evicted: Evicted) {
        for link in evicted {
            if let Err(err) = link.release_if_discardable() {
                warn!(cache = self.name, link = %link.id(), error = %err, "release after eviction failed");
            }
        }
    }
}

/// The pair of discard caches shared by a store.
pub struct ManagedCache {
    stored: Arc<ItemCache>,
    unstored: Arc<ItemCache>,
}

impl ManagedCache {
    /// Creates both caches from `options`.
    pub fn new(options: CacheOptions) -> Self {
        Self {
            stored: Arc::new(ItemCache::new("stored", options.stored_bytes)),
            unstored: Arc::new(ItemCache::new("unstored", options.unstored_bytes)),
        }
    }

    /// Returns the cache responsible for items of `strategy`.
    pub fn register(&self, strategy: StorageStrategy) -> Arc<ItemCache> {
        match strategy {
            StorageStrategy::Never => self.unstored.clone(),
            _ => self.stored.clone(),
        }
    }

    /// Counters of both caches.
    pub fn stats(&self) -> [CacheStats; 2] {
        [self.stored.stats(), self.unstored.stats()]
    }
}
