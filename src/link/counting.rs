use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::Link;
use crate::error::{Result, StoreError};
use crate::transaction::{CompletionCallback, Transaction};
use crate::types::LinkId;

#[derive(Debug, Default)]
struct Counter {
    count: u64,
    decreasing: bool,
}

/// Reference count of an item link.
///
/// Once the count has started to fall it may not rise again.
#[derive(Debug, Default)]
pub struct RefCount {
    inner: Mutex<Counter>,
}

impl RefCount {
    /// Current count.
    pub fn count(&self) -> u64 {
        self.inner.lock().count
    }

    /// Returns `true` once a decrement has been applied.
    pub fn is_decreasing(&self) -> bool {
        self.inner.lock().decreasing
    }

    pub(crate) fn increment(&self, link: LinkId) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.decreasing {
            return Err(StoreError::ReferenceCount {
                link,
                reason: "increment after the count started decreasing",
            });
        }
        inner.count += 1;
        Ok(())
    }

    /// Undoes an increment whose add was rolled back.
    pub(crate) fn rollback_increment(&self, link: LinkId) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.count == 0 {
            return Err(StoreError::ReferenceCount {
                link,
                reason: "rollback of an increment that never happened",
            });
        }
        inner.count -= 1;
        Ok(())
    }

    /// Decrements the count; returns `true` when it reached zero.
    fn decrement(&self, link: LinkId) -> Result<bool> {
        let mut inner = self.inner.lock();
        if inner.count == 0 {
            return Err(StoreError::ReferenceCount {
                link,
                reason: "decrement below zero",
            });
        }
        inner.count -= 1;
        inner.decreasing = true;
        Ok(inner.count == 0)
    }
}

/// Fires the dropped-to-zero event once the removing transaction has completed.
struct ReferencesDropped {
    link: Weak<Link>,
}

impl CompletionCallback for ReferencesDropped {
    fn after_completion(&self, _tran: &Transaction, _committed: bool) {
        let Some(link) = self.link.upgrade() else {
            return;
        };
        if !link.is_available() {
            return;
        }
        match link.restore_item() {
            Ok(Some(item)) => item.event_references_dropped_to_zero(),
            Ok(None) => {}
            Err(err) => {
                warn!(link = %link.id(), error = %err, "cannot notify dropped references")
            }
        }
    }
}

impl Link {
    /// Decrements this item's reference count under `tran`.
    pub(crate) fn decrement_reference_count(self: &Arc<Self>, tran: &Transaction) -> Result<()> {
        let Some(count) = self.ref_count() else {
            return Err(StoreError::ReferenceCount {
                link: self.id(),
                reason: "link is not reference counted",
            });
        };
        if count.decrement(self.id())? {
            debug!(link = %self.id(), tran = %tran.id(), "references dropped to zero");
            tran.register_callback(Arc::new(ReferencesDropped {
                link: Arc::downgrade(self),
            }));
        }
        Ok(())
    }
}
