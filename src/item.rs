//! The payload side of a link: items, filters, and the factory used to rebuild items from
//! persisted data.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::error::{Result, StoreError};
use crate::stats::WatermarkBreach;
use crate::transaction::Transaction;
use crate::types::{DataSlice, ItemKind, LinkId, StorageStrategy, DEFAULT_PRIORITY};

/// A payload held by a link.
///
/// Implementations are shared between the link, the discard cache and callers, so every method
/// takes `&self`; state that changes after construction needs interior mutability. Event hooks
/// are invoked with no link lock held.
pub trait Item: Send + Sync + 'static {
    /// Registered type name used to rebuild the item from persistence.
    fn type_name(&self) -> &str;

    /// Which link kind this payload becomes.
    fn kind(&self) -> ItemKind {
        ItemKind::Item
    }

    /// How eagerly the item is persisted.
    fn storage_strategy(&self) -> StorageStrategy {
        StorageStrategy::Always
    }

    /// Delivery priority, `0..=9`.
    fn priority(&self) -> u8 {
        DEFAULT_PRIORITY
    }

    /// Milliseconds the item may stay in the store, if bounded.
    fn maximum_time_in_store(&self) -> Option<u64> {
        None
    }

    /// Start of the expiry period; the add time when `None`.
    fn expiry_start_time(&self) -> Option<u64> {
        None
    }

    /// Milliseconds to hold the item locked after it is added.
    fn delivery_delay(&self) -> Option<u64> {
        None
    }

    /// Whether expiry may skip [`Item::event_expiry_notification`].
    fn can_expire_silently(&self) -> bool {
        false
    }

    /// Estimated heap footprint in bytes.
    fn in_memory_size(&self) -> usize;

    /// Encodes the item for persistence.
    fn persistent_data(&self) -> Result<Vec<DataSlice>>;

    /// Rebuilds state from previously encoded data; called on a fresh instance.
    fn restore(&mut self, data: &[DataSlice]) -> Result<()>;

    /// For item references, the id of the referred item.
    fn referred_id(&self) -> Option<LinkId> {
        None
    }

    /// Called once the item is bound to the link with `id`.
    fn membership_assigned(&self, _id: LinkId) {}

    /// Called before the add is written.
    fn event_precommit_add(&self, _tran: &Transaction) -> Result<()> {
        Ok(())
    }

    /// Called before the remove is written.
    fn event_precommit_remove(&self, _tran: &Transaction) -> Result<()> {
        Ok(())
    }

    /// Called before the update is written.
    fn event_precommit_update(&self, _tran: &Transaction) -> Result<()> {
        Ok(())
    }

    /// Called after an add committed.
    fn event_post_commit_add(&self) {}

    /// Called after a remove committed.
    fn event_post_commit_remove(&self) {}

    /// Called after an add rolled back.
    fn event_post_rollback_add(&self) {}

    /// Called after a remove rolled back.
    fn event_post_rollback_remove(&self) {}

    /// Called when an in-memory lock is released.
    fn event_unlocked(&self) {}

    /// Called while the item is locked for expiry; an error vetoes the expiry.
    fn event_expiry_notification(&self, _tran: &Transaction) -> Result<()> {
        Ok(())
    }

    /// Called after the item was rebuilt from persistence.
    fn event_restored(&self) {}

    /// Called once the last reference to the item has been removed.
    fn event_references_dropped_to_zero(&self) {}

    /// Called on a stream payload when its statistics cross a watermark.
    fn event_watermark_breached(&self, _breach: WatermarkBreach) {}

    /// Downcast support.
    fn as_any(&self) -> &dyn Any;
}

impl fmt::Debug for dyn Item {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Item")
            .field("type", &self.type_name())
            .field("kind", &self.kind())
            .finish()
    }
}

/// Predicate used by the matching verbs.
///
/// An error is treated as a non-match.
pub trait Filter: Send + Sync {
    /// Returns whether `item` is selected.
    fn filter_matches(&self, item: &dyn Item) -> Result<bool>;
}

impl<F> Filter for F
where
    F: Fn(&dyn Item) -> Result<bool> + Send + Sync,
{
    fn filter_matches(&self, item: &dyn Item) -> Result<bool> {
        self(item)
    }
}

/// Filter that selects every item.
#[derive(Debug, Default, Clone, Copy)]
pub struct MatchAll;

impl Filter for MatchAll {
    fn filter_matches(&self, _item: &dyn Item) -> Result<bool> {
        Ok(true)
    }
}

/// Builds an empty item ready for [`Item::restore`].
pub type ItemFactory = Arc<dyn Fn() -> Box<dyn Item> + Send + Sync>;

/// Maps persisted type names to item factories.
#[derive(Clone, Default)]
pub struct ItemRegistry {
    factories: FxHashMap<String, ItemFactory>,
}

impl ItemRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `factory` under `type_name`, replacing any previous entry.
    pub fn register<F>(&mut self, type_name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn() -> Box<dyn Item> + Send + Sync + 'static,
    {
        self.factories.insert(type_name.into(), Arc::new(factory));
        self
    }

    /// Returns `true` if `type_name` is known.
    pub fn contains(&self, type_name: &str) -> bool {
        self.factories.contains_key(type_name)
    }

    /// Instantiates the item registered under `type_name`.
    pub fn instantiate(&self, type_name: &str) -> Result<Box<dyn Item>> {
        let factory = self
            .factories
            .get(type_name)
            .ok_or_else(|| StoreError::Severe(format!("no item type registered as {type_name}")))?;
        Ok(factory())
    }

    /// Instantiates and restores an item from `data`.
    pub fn rebuild(&self, type_name: &str, data: &[DataSlice]) -> Result<Arc<dyn Item>> {
        let mut item = self.instantiate(type_name)?;
        item.restore(data)?;
        Ok(Arc::from(item))
    }
}

impl fmt::Debug for ItemRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.factories.keys().collect();
        names.sort();
        f.debug_struct("ItemRegistry").field("types", &names).finish()
    }
}
