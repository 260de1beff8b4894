//! Links that own children: the root, item streams and reference streams.

use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use super::Link;
use crate::config::SpillLimits;
use crate::error::{Result, StoreError};
use crate::item::{Filter, Item};
use crate::state::ItemLinkState;
use crate::stats::{ListStatistics, StatsSnapshot, WatermarkBreach, Watermarks};
use crate::transaction::Transaction;
use crate::tuple::Tuple;
use crate::types::{ItemKind, LinkId, LockId, StorageStrategy};

type ListKey = (Reverse<u8>, u64, LinkId);

/// Non-stream children in delivery order: highest priority first, then by sequence.
#[derive(Default)]
struct ItemList {
    order: BTreeMap<ListKey, Arc<Link>>,
    keys: FxHashMap<LinkId, ListKey>,
}

impl ItemList {
    fn insert(&mut self, link: &Arc<Link>) {
        let key = (Reverse(link.priority()), link.sequence(), link.id());
        if let Some(previous) = self.keys.insert(link.id(), key) {
            self.order.remove(&previous);
        }
        self.order.insert(key, link.clone());
    }

    fn remove(&mut self, id: LinkId) -> bool {
        match self.keys.remove(&id) {
            Some(key) => self.order.remove(&key).is_some(),
            None => false,
        }
    }

    fn snapshot(&self) -> Vec<Arc<Link>> {
        self.order.values().cloned().collect()
    }
}

/// Children, statistics and limits of one owner.
pub struct OwnerState {
    pub(crate) stats: ListStatistics,
    streams: Mutex<BTreeMap<LinkId, Arc<Link>>>,
    items: Mutex<Option<ItemList>>,
    load: Mutex<()>,
    sequence: AtomicU64,
    max_depth: Mutex<Option<u64>>,
    generation: Mutex<u64>,
    available: Condvar,
}

impl OwnerState {
    pub(crate) fn new(spill: SpillLimits) -> Self {
        Self {
            stats: ListStatistics::new(spill),
            streams: Mutex::new(BTreeMap::new()),
            items: Mutex::new(None),
            load: Mutex::new(()),
            sequence: AtomicU64::new(1),
            max_depth: Mutex::new(None),
            generation: Mutex::new(0),
            available: Condvar::new(),
        }
    }

    fn note_sequence(&self, sequence: u64) {
        self.sequence.fetch_max(sequence + 1, Ordering::SeqCst);
    }
}

fn child_kind_allowed(owner: ItemKind, child: ItemKind) -> bool {
    matches!(
        (owner, child),
        (ItemKind::Root, ItemKind::ItemStream)
            | (
                ItemKind::ItemStream,
                ItemKind::Item | ItemKind::ItemStream | ItemKind::ReferenceStream
            )
            | (ItemKind::ReferenceStream, ItemKind::ItemReference)
    )
}

impl Link {
    fn owner_or_err(&self) -> Result<&OwnerState> {
        self.owner_state().ok_or_else(|| {
            StoreError::InvalidAddOperation(format!("link {} does not own children", self.id()))
        })
    }

    /// Adds `item` as a new child under `tran`, locked with `lock_id` unless it is
    /// [`LockId::NONE`].
    ///
    /// Items with a delivery delay added without a lock are locked with
    /// [`LockId::DELIVERY_DELAY`] until the delay ends.
    pub fn add(
        self: &Arc<Self>,
        item: Arc<dyn Item>,
        lock_id: LockId,
        tran: &Transaction,
    ) -> Result<Arc<Link>> {
        self.owner_or_err()?;
        let kind = item.kind();
        if !child_kind_allowed(self.kind(), kind) {
            return Err(StoreError::InvalidAddOperation(format!(
                "a {:?} cannot own a {kind:?}",
                self.kind()
            )));
        }
        if !kind.is_owner() {
            self.ensure_loaded()?;
        }
        self.assert_can_add_child(tran)?;

        let ctx = self.ctx().clone();
        let strategy = item.storage_strategy();
        if strategy == StorageStrategy::Never && kind.is_storage_managed() {
            ctx.caches
                .register(StorageStrategy::Never)
                .check_fits(item.in_memory_size())?;
        }
        let id = ctx.next_link_id();
        let mut tuple = Tuple::new(id, self.id(), kind, item.type_name());
        tuple.strategy = strategy;
        tuple.priority = item.priority();
        if kind == ItemKind::ItemReference {
            let target = self.validate_reference_target(item.referred_id())?;
            tuple.referred_id = Some(target.id());
        }
        let delayed = item.delivery_delay().is_some_and(|d| d > 0);
        let lock_id = if lock_id == LockId::NONE && delayed && ctx.options.delivery_delay_enabled {
            LockId::DELIVERY_DELAY
        } else {
            lock_id
        };

        item.membership_assigned(id);
        let link = Link::new(ctx.clone(), Some(self), tuple, Some(item), strategy == StorageStrategy::Never);
        ctx.register_link(&link);
        if let Err(err) = link.cmd_add(lock_id, tran) {
            ctx.unregister_link(id);
            return Err(err);
        }
        Ok(link)
    }

    /// Reads the owner's non-stream children from persistence on first use.
    pub(crate) fn ensure_loaded(self: &Arc<Self>) -> Result<()> {
        let owner = self.owner_or_err()?;
        if owner.items.lock().is_some() {
            return Ok(());
        }
        let _loading = owner.load.lock();
        if owner.items.lock().is_some() {
            return Ok(());
        }
        let ctx = self.ctx().clone();
        let tuples = ctx.persistence.read_non_stream_items(self.id())?;
        let mut list = ItemList::default();
        let mut restored = 0usize;
        for tuple in tuples {
            if ctx.lookup_link(tuple.id).is_some() {
                continue;
            }
            owner.note_sequence(tuple.sequence);
            let child = Link::new(ctx.clone(), Some(self), tuple, None, true);
            if child.restore_state()? {
                ctx.register_link(&child);
                list.insert(&child);
                restored += 1;
            }
        }
        *owner.items.lock() = Some(list);
        debug!(stream = %self.id(), restored, "children loaded");
        Ok(())
    }

    /// Inserts a child rebuilt by recovery.
    pub(crate) fn insert_restored(&self, child: &Arc<Link>) {
        let Some(owner) = self.owner_state() else {
            return;
        };
        owner.note_sequence(child.sequence());
        if child.kind().is_owner() {
            owner.streams.lock().insert(child.id(), child.clone());
        } else {
            owner.items.lock().get_or_insert_with(ItemList::default).insert(child);
        }
    }

    /// Next sequence number for a child.
    pub(crate) fn next_sequence(&self) -> u64 {
        self.owner_state()
            .map(|o| o.sequence.fetch_add(1, Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Links a child being added into the owner's lists.
    pub(crate) fn append(&self, child: &Arc<Link>) {
        self.insert_restored(child);
    }

    /// Drops a child from the owner's lists.
    pub(crate) fn remove_child(&self, id: LinkId) {
        let Some(owner) = self.owner_state() else {
            return;
        };
        if owner.streams.lock().remove(&id).is_some() {
            return;
        }
        if let Some(list) = owner.items.lock().as_mut() {
            list.remove(id);
        }
    }

    /// Wakes waiters on the availability watch.
    pub(crate) fn link_available(&self, child: &Arc<Link>) {
        let Some(owner) = self.owner_state() else {
            return;
        };
        let mut generation = owner.generation.lock();
        *generation += 1;
        owner.available.notify_all();
        debug!(stream = %self.id(), link = %child.id(), "link available");
    }

    /// Current value of the availability watch.
    pub fn availability_generation(&self) -> u64 {
        self.owner_state().map(|o| *o.generation.lock()).unwrap_or(0)
    }

    /// Waits until a child becomes available after generation `seen`, or `timeout` passes.
    /// Returns the generation observed last.
    pub fn wait_for_available(&self, seen: u64, timeout: Duration) -> u64 {
        let Some(owner) = self.owner_state() else {
            return seen;
        };
        let mut generation = owner.generation.lock();
        if *generation == seen {
            owner.available.wait_for(&mut generation, timeout);
        }
        *generation
    }

    pub(crate) fn deliver_breaches(self: &Arc<Self>, breaches: &[WatermarkBreach]) {
        let item = match self.restore_item() {
            Ok(Some(item)) => item,
            Ok(None) => return,
            Err(err) => {
                warn!(stream = %self.id(), error = %err, "cannot deliver watermark breach");
                return;
            }
        };
        for breach in breaches {
            item.event_watermark_breached(*breach);
        }
    }

    /// Loaded non-stream children in delivery order.
    pub fn item_links(self: &Arc<Self>) -> Result<Vec<Arc<Link>>> {
        self.ensure_loaded()?;
        let owner = self.owner_or_err()?;
        let items = owner.items.lock();
        Ok(items.as_ref().map(ItemList::snapshot).unwrap_or_default())
    }

    /// Stream children by id.
    pub fn stream_links(&self) -> Vec<Arc<Link>> {
        self.owner_state()
            .map(|o| o.streams.lock().values().cloned().collect())
            .unwrap_or_default()
    }

    /// Children currently in memory, without loading.
    pub(crate) fn loaded_children(&self) -> Vec<Arc<Link>> {
        let Some(owner) = self.owner_state() else {
            return Vec::new();
        };
        let mut out: Vec<Arc<Link>> = owner.streams.lock().values().cloned().collect();
        if let Some(list) = owner.items.lock().as_ref() {
            out.extend(list.snapshot());
        }
        out
    }

    /// First available child accepted by `filter`.
    pub fn find_first_matching(self: &Arc<Self>, filter: &dyn Filter) -> Result<Option<Arc<Link>>> {
        for link in self.item_links()? {
            if link.matches(filter)? {
                return Ok(Some(link));
            }
        }
        Ok(None)
    }

    /// Locks and returns the first available child accepted by `filter`.
    pub fn lock_first_matching(
        self: &Arc<Self>,
        filter: &dyn Filter,
        lock_id: LockId,
    ) -> Result<Option<Arc<Link>>> {
        for link in self.item_links()? {
            if link.lock_if_matches(filter, lock_id)? {
                return Ok(Some(link));
            }
        }
        Ok(None)
    }

    /// Starts removing the first available child accepted by `filter`.
    pub fn remove_first_matching(
        self: &Arc<Self>,
        filter: &dyn Filter,
        tran: &Transaction,
    ) -> Result<Option<Arc<Link>>> {
        for link in self.item_links()? {
            if link.remove_if_matches(filter, tran)? {
                return Ok(Some(link));
            }
        }
        Ok(None)
    }

    /// Limits the number of children; `None` falls back to the store default.
    pub fn set_max_depth(&self, depth: Option<u64>) -> Result<()> {
        *self.owner_or_err()?.max_depth.lock() = depth;
        Ok(())
    }

    /// Sets the watermarks reported to this owner's payload.
    pub fn set_watermarks(&self, watermarks: Watermarks) -> Result<()> {
        self.owner_or_err()?.stats.set_watermarks(watermarks);
        Ok(())
    }

    /// Snapshot of the children's statistics.
    pub fn statistics(&self) -> Option<StatsSnapshot> {
        self.owner_state().map(|o| o.stats.snapshot())
    }

    /// Whether the owner was spilling at the last check.
    pub fn is_spilling(&self) -> bool {
        self.owner_state().is_some_and(|o| o.stats.is_spilling())
    }

    /// Re-evaluates spilling against the configured limits.
    pub fn check_spill_limits(&self) -> bool {
        self.owner_state().is_some_and(|o| o.stats.check_spill_limits())
    }

    fn adding_under(&self, state: ItemLinkState, tran: &Transaction) -> bool {
        state.is_adding() && self.tran_id() == Some(tran.persistent_tran_id())
    }

    /// A child may be added while the owner is stored and not being removed, and while the
    /// owner has room.
    pub(crate) fn assert_can_add_child(&self, tran: &Transaction) -> Result<()> {
        let owner = self.owner_or_err()?;
        let state = self.state();
        let ok = self.adding_under(state, tran)
            || matches!(
                state,
                ItemLinkState::UpdatingData
                    | ItemLinkState::Available
                    | ItemLinkState::Locked
                    | ItemLinkState::PersistentlyLocked
                    | ItemLinkState::PersistingLock
                    | ItemLinkState::UnlockingPersistentlyLocked
            );
        if !ok {
            return Err(StoreError::InvalidAddOperation(format!(
                "stream {} is {state}",
                self.id()
            )));
        }
        let limit = owner
            .max_depth
            .lock()
            .or(self.ctx().options.default_max_depth);
        if let Some(limit) = limit {
            let depth = owner.stats.total_count();
            if depth >= limit {
                return Err(StoreError::StreamIsFull {
                    stream: self.id(),
                    depth,
                });
            }
        }
        Ok(())
    }

    /// Checked when the child's add is written.
    pub(crate) fn assert_can_add_child_under(&self, tran: &Transaction) -> Result<()> {
        let state = self.state();
        if self.adding_under(state, tran)
            || matches!(state, ItemLinkState::UpdatingData | ItemLinkState::Available)
        {
            Ok(())
        } else {
            Err(StoreError::InvalidAddOperation(format!(
                "stream {} is {state}",
                self.id()
            )))
        }
    }

    /// Checked when a child's remove is written.
    pub(crate) fn assert_can_remove_child_under(&self, tran: &Transaction) -> Result<()> {
        let state = self.state();
        let removing_under = state.is_removing() && self.tran_id() == Some(tran.persistent_tran_id());
        if removing_under || matches!(state, ItemLinkState::UpdatingData | ItemLinkState::Available)
        {
            Ok(())
        } else {
            Err(StoreError::state(state, "remove child"))
        }
    }

    /// An owner may only be deleted once every child is being removed under the same
    /// transaction.
    pub(crate) fn assert_can_delete(self: &Arc<Self>, tran: &Transaction) -> Result<()> {
        if self.kind() == ItemKind::Root {
            return Err(StoreError::InvalidArgument("the root cannot be deleted".into()));
        }
        self.ensure_loaded()?;
        let remaining = self
            .loaded_children()
            .iter()
            .filter(|child| {
                !(child.is_removing() && child.tran_id() == Some(tran.persistent_tran_id()))
            })
            .count();
        if remaining > 0 {
            return Err(StoreError::StreamNotEmpty {
                stream: self.id(),
                remaining,
            });
        }
        Ok(())
    }
}
