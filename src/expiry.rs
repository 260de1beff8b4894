//! Time-ordered indices of links awaiting expiry or the end of a delivery delay.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::link::Link;
use crate::types::LinkId;

#[derive(Default)]
struct Inner {
    by_time: BTreeMap<(u64, LinkId), Weak<Link>>,
    by_id: FxHashMap<LinkId, u64>,
}

/// Links keyed by a due time in milliseconds.
///
/// Holds weak handles only; a link that disappears is skipped and dropped from the index.
pub struct TimeIndex {
    name: &'static str,
    inner: Mutex<Inner>,
}

/// Index driving expiry.
pub type ExpiryIndex = TimeIndex;
/// Index driving the end of delivery delays.
pub type DeliveryDelayIndex = TimeIndex;

impl TimeIndex {
    /// Creates an empty index.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Index name, for diagnostics.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Registers `link` as due at `due_ms`, replacing an earlier registration.
    pub fn add(&self, link: &Arc<Link>, due_ms: u64) {
        let mut inner = self.inner.lock();
        let id = link.id();
        if let Some(previous) = inner.by_id.insert(id, due_ms) {
            inner.by_time.remove(&(previous, id));
        }
        inner.by_time.insert((due_ms, id), Arc::downgrade(link));
    }

    /// Removes the registration for `id`; returns whether one existed.
    pub fn remove(&self, id: LinkId) -> bool {
        let mut inner = self.inner.lock();
        match inner.by_id.remove(&id) {
            Some(due) => {
                inner.by_time.remove(&(due, id));
                true
            }
            None => false,
        }
    }

    /// Returns `true` while `id` is registered.
    pub fn contains(&self, id: LinkId) -> bool {
        self.inner.lock().by_id.contains_key(&id)
    }

    /// Number of registrations.
    pub fn len(&self) -> usize {
        self.inner.lock().by_id.len()
    }

    /// Returns `true` when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Links due at or before `now_ms`, earliest first. Registrations stay in place.
    pub fn due(&self, now_ms: u64) -> Vec<Arc<Link>> {
        let mut inner = self.inner.lock();
        let mut out = Vec::new();
        let mut dead = Vec::new();
        for (&(due, id), weak) in inner.by_time.range(..=(now_ms, LinkId(u64::MAX))) {
            match weak.upgrade() {
                Some(link) => out.push(link),
                None => dead.push((due, id)),
            }
        }
        for key in dead {
            inner.by_time.remove(&key);
            inner.by_id.remove(&key.1);
        }
        out
    }
}
