//! Links: the in-memory cache entries wrapping persisted tuples.
//!
//! Every kind of link (root, item stream, reference stream, item, item reference) shares the
//! state machine in [`Link`]; kind-specific data lives in the body enum. Each verb takes the
//! link's own monitor only to check and mutate state, records what must happen next in a
//! [`Deferred`], and performs that work once the monitor is released. Nothing that may call back
//! into another link (the discard cache, the owner, item events) runs under the monitor.

mod counting;
mod dump;
mod owner;
mod recovery;
mod reference;
mod verbs;

pub use counting::RefCount;
pub use owner::OwnerState;

pub(crate) use recovery::initialize_tree;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, error, warn};

use crate::cache::ItemCache;
use crate::error::{Result, StoreError};
use crate::item::Item;
use crate::persistence::PersistOp;
use crate::state::ItemLinkState;
use crate::stats::{Breaches, Bucket, ListStatistics};
use crate::store::StoreContext;
use crate::transaction::{TaskKind, Transaction};
use crate::tuple::Tuple;
use crate::types::{ItemKind, LinkId, LockId, StorageStrategy, TranId, HIGHEST_PRIORITY};

/// Strong handle a link keeps on its payload.
#[derive(Clone, Default)]
pub(crate) enum ItemRef {
    /// Never set; the payload has not been restored since the link was rebuilt.
    #[default]
    Unknown,
    /// Explicitly cleared.
    Absent,
    /// Pinned in memory.
    Present(Arc<dyn Item>),
}

impl ItemRef {
    fn get(&self) -> Option<&Arc<dyn Item>> {
        match self {
            ItemRef::Present(item) => Some(item),
            _ => None,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            ItemRef::Unknown => "unknown",
            ItemRef::Absent => "absent",
            ItemRef::Present(_) => "present",
        }
    }
}

enum Body {
    Item(RefCount),
    Reference,
    Owner(OwnerState),
}

/// Mutable state guarded by the link monitor.
pub(crate) struct LinkState {
    pub(crate) state: ItemLinkState,
    pub(crate) tran_id: Option<TranId>,
    pub(crate) lock_id: LockId,
    pub(crate) backout_count: u32,
    pub(crate) unlock_count: u32,
    storage_managed: bool,
    stable: bool,
    discardable_if_stable: bool,
    pub(crate) encoding_failed: bool,
    strong: ItemRef,
    soft: Option<Weak<dyn Item>>,
    pub(crate) tuple: Tuple,
}

impl LinkState {
    fn releasable(&self) -> bool {
        self.storage_managed && self.stable && self.discardable_if_stable
    }

    pub(crate) fn current_item(&self) -> Option<Arc<dyn Item>> {
        match &self.strong {
            ItemRef::Present(item) => Some(item.clone()),
            _ => self.soft.as_ref().and_then(Weak::upgrade),
        }
    }

    /// Records a change of releasability; the payload moves to the cache's care when it becomes
    /// releasable.
    fn settle(&mut self, was_releasable: bool, deferred: &mut Deferred) {
        let releasable = self.releasable();
        if releasable == was_releasable {
            return;
        }
        deferred.cache = true;
        if releasable {
            if let ItemRef::Present(item) = std::mem::replace(&mut self.strong, ItemRef::Absent) {
                deferred.keepalive = Some(item);
            }
        }
    }

    pub(crate) fn declare_discardable(&mut self, deferred: &mut Deferred) {
        if !self.storage_managed {
            self.discardable_if_stable = false;
            return;
        }
        let was = self.releasable();
        self.discardable_if_stable = true;
        self.settle(was, deferred);
    }

    pub(crate) fn declare_not_discardable(
        &mut self,
        item: Option<Arc<dyn Item>>,
        deferred: &mut Deferred,
    ) {
        let was = self.releasable();
        self.strong = match item {
            Some(item) => ItemRef::Present(item),
            None => ItemRef::Absent,
        };
        self.discardable_if_stable = false;
        self.settle(was, deferred);
    }

    /// Discardable again only for strategies whose persistent lock may be trusted.
    pub(crate) fn declare_discardable_if_persistently_locked(&mut self, deferred: &mut Deferred) {
        if !matches!(
            self.tuple.strategy,
            StorageStrategy::Never | StorageStrategy::Maybe
        ) {
            self.declare_discardable(deferred);
        }
    }

    fn mark_stable(&mut self, deferred: &mut Deferred) {
        if self.stable {
            return;
        }
        let was = self.releasable();
        self.stable = true;
        self.settle(was, deferred);
    }

    fn mark_unstable(&mut self, deferred: &mut Deferred) {
        if !self.stable {
            return;
        }
        if let Some(item) = self.current_item() {
            self.strong = ItemRef::Present(item);
        }
        let was = self.releasable();
        self.stable = false;
        self.settle(was, deferred);
    }

    pub(crate) fn check_tran(&self, tran: &Transaction) -> Result<()> {
        if self.tran_id != Some(tran.persistent_tran_id()) {
            return Err(StoreError::WrongTransaction {
                state: self.state,
                supplied: Some(tran.persistent_tran_id()),
                owner: self.tran_id,
            });
        }
        Ok(())
    }
}

/// Follow-up work decided under the link monitor and performed after it is released.
#[derive(Default)]
pub(crate) struct Deferred {
    cache: bool,
    keepalive: Option<Arc<dyn Item>>,
    pub(crate) available: bool,
    pub(crate) unlocked: Option<Arc<dyn Item>>,
    pub(crate) breaches: Breaches,
    pub(crate) unlink: bool,
}

/// One cache entry of the persisted tree.
pub struct Link {
    id: LinkId,
    kind: ItemKind,
    body: Body,
    owner: Option<Weak<Link>>,
    ctx: Arc<StoreContext>,
    cache: Option<Arc<ItemCache>>,
    inner: Mutex<LinkState>,
    cache_managed: AtomicBool,
    in_memory_size: AtomicUsize,
}

impl Link {
    /// Builds a link around `tuple`. A link built with its payload starts pinned; one built
    /// from persistence starts with its payload unknown.
    pub(crate) fn new(
        ctx: Arc<StoreContext>,
        owner: Option<&Arc<Link>>,
        tuple: Tuple,
        item: Option<Arc<dyn Item>>,
        stable: bool,
    ) -> Arc<Link> {
        let kind = tuple.kind;
        let body = match kind {
            ItemKind::Item => Body::Item(RefCount::default()),
            ItemKind::ItemReference => Body::Reference,
            ItemKind::Root | ItemKind::ItemStream | ItemKind::ReferenceStream => {
                Body::Owner(OwnerState::new(ctx.options.spill))
            }
        };
        let cache = kind
            .is_storage_managed()
            .then(|| ctx.caches.register(tuple.strategy));
        let size = match &item {
            Some(item) => item.in_memory_size(),
            None => tuple.persistent_size * ctx.options.memory_size_multiplier,
        };
        let (strong, soft) = match item {
            Some(item) => {
                let soft = Arc::downgrade(&item);
                (ItemRef::Present(item), Some(soft))
            }
            None => (ItemRef::Unknown, None),
        };
        Arc::new(Link {
            id: tuple.id,
            kind,
            body,
            owner: owner.map(Arc::downgrade),
            ctx,
            cache,
            inner: Mutex::new(LinkState {
                state: ItemLinkState::NotStored,
                tran_id: None,
                lock_id: LockId::NONE,
                backout_count: 0,
                unlock_count: 0,
                storage_managed: kind.is_storage_managed(),
                stable,
                discardable_if_stable: false,
                encoding_failed: false,
                strong,
                soft,
                tuple,
            }),
            cache_managed: AtomicBool::new(false),
            in_memory_size: AtomicUsize::new(size),
        })
    }

    /// Builds the root membership; it is available from the start and never persisted.
    pub(crate) fn new_root(ctx: Arc<StoreContext>) -> Arc<Link> {
        let mut tuple = Tuple::new(LinkId::ROOT, LinkId::ROOT, ItemKind::Root, "root");
        tuple.strategy = StorageStrategy::Never;
        let root = Link::new(ctx, None, tuple, None, true);
        {
            let mut st = root.lock_state();
            st.state = ItemLinkState::Available;
            st.strong = ItemRef::Absent;
        }
        root
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, LinkState> {
        self.inner.lock()
    }

    pub(crate) fn ctx(&self) -> &Arc<StoreContext> {
        &self.ctx
    }

    /// Link id.
    pub fn id(&self) -> LinkId {
        self.id
    }

    /// Link kind.
    pub fn kind(&self) -> ItemKind {
        self.kind
    }

    /// Current transactional state.
    pub fn state(&self) -> ItemLinkState {
        self.inner.lock().state
    }

    /// Returns `true` when the link is committed and unlocked.
    pub fn is_available(&self) -> bool {
        self.state() == ItemLinkState::Available
    }

    /// Returns `true` in any locked state.
    pub fn is_locked(&self) -> bool {
        self.state().is_locked()
    }

    /// Returns `true` while a remove is pending.
    pub fn is_removing(&self) -> bool {
        self.state().is_removing()
    }

    /// Returns `true` while an add is pending.
    pub fn is_adding(&self) -> bool {
        self.state().is_adding()
    }

    /// Returns `true` once the link has been added and not yet removed.
    pub fn is_in_store(&self) -> bool {
        self.state() != ItemLinkState::NotStored
    }

    /// Lock currently held.
    pub fn lock_id(&self) -> LockId {
        self.inner.lock().lock_id
    }

    /// Transaction currently driving the link.
    pub fn tran_id(&self) -> Option<TranId> {
        self.inner.lock().tran_id
    }

    /// Number of rolled back removes.
    pub fn backout_count(&self) -> u32 {
        self.inner.lock().backout_count
    }

    /// Number of unlocks that asked to be counted.
    pub fn unlock_count(&self) -> u32 {
        self.inner.lock().unlock_count
    }

    /// Redelivered count recorded on the tuple.
    pub fn redelivered_count(&self) -> u32 {
        self.inner.lock().tuple.redelivered_count
    }

    /// Copy of the tuple.
    pub fn tuple(&self) -> Tuple {
        self.inner.lock().tuple.clone()
    }

    /// Storage strategy.
    pub fn storage_strategy(&self) -> StorageStrategy {
        self.inner.lock().tuple.strategy
    }

    /// Delivery priority.
    pub fn priority(&self) -> u8 {
        self.inner.lock().tuple.priority
    }

    /// Position within the owner's list.
    pub fn sequence(&self) -> u64 {
        self.inner.lock().tuple.sequence
    }

    /// Absolute expiry time, if any.
    pub fn expiry_time(&self) -> Option<u64> {
        self.inner.lock().tuple.expiry_time
    }

    /// Absolute end of the delivery delay, if any.
    pub fn delivery_delay_time(&self) -> Option<u64> {
        self.inner.lock().tuple.delivery_delay_time
    }

    /// Estimated footprint of the payload.
    pub fn in_memory_size(&self) -> usize {
        self.in_memory_size.load(Ordering::SeqCst)
    }

    /// Returns `true` for links whose payload may be handed to the discard cache.
    pub fn is_storage_managed(&self) -> bool {
        self.inner.lock().storage_managed
    }

    /// Returns `true` when the persisted representation reflects the payload.
    pub fn is_persistent_representation_stable(&self) -> bool {
        self.inner.lock().stable
    }

    /// Returns `true` when the payload may be released once stable.
    pub fn is_discardable_if_stable(&self) -> bool {
        self.inner.lock().discardable_if_stable
    }

    /// Storage managed, stable and discardable.
    pub fn is_releasable(&self) -> bool {
        self.inner.lock().releasable()
    }

    /// Returns `true` while the discard cache holds the payload.
    pub fn is_cache_managed(&self) -> bool {
        self.cache_managed.load(Ordering::SeqCst)
    }

    /// Returns `true` while the link holds a strong handle on its payload.
    pub fn is_pinned(&self) -> bool {
        self.inner.lock().strong.get().is_some()
    }

    /// Owning link; `None` for the root.
    pub fn owner(&self) -> Option<Arc<Link>> {
        self.owner.as_ref().and_then(Weak::upgrade)
    }

    /// Reference count, for item links.
    pub fn reference_count(&self) -> Option<u64> {
        match &self.body {
            Body::Item(count) => Some(count.count()),
            _ => None,
        }
    }

    pub(crate) fn ref_count(&self) -> Option<&RefCount> {
        match &self.body {
            Body::Item(count) => Some(count),
            _ => None,
        }
    }

    pub(crate) fn owner_state(&self) -> Option<&OwnerState> {
        match &self.body {
            Body::Owner(owner) => Some(owner),
            _ => None,
        }
    }

    pub(crate) fn set_cache_managed(&self, managed: bool) {
        self.cache_managed.store(managed, Ordering::SeqCst);
    }

    pub(crate) fn set_in_memory_size(&self, size: usize) {
        self.in_memory_size.store(size, Ordering::SeqCst);
    }

    /// The payload, if the link is releasable and the payload is still reachable.
    pub(crate) fn releasable_payload(&self) -> Option<Arc<dyn Item>> {
        let st = self.inner.lock();
        if st.releasable() {
            st.soft.as_ref().and_then(Weak::upgrade)
        } else {
            None
        }
    }

    pub(crate) fn with_parent_stats<R>(&self, f: impl FnOnce(&ListStatistics) -> R) -> Option<R> {
        let owner = self.owner()?;
        let state = owner.owner_state()?;
        Some(f(&state.stats))
    }

    pub(crate) fn stats_enter(&self, bucket: Bucket, deferred: &mut Deferred) {
        let size = self.in_memory_size();
        if let Some(breaches) = self.with_parent_stats(|s| s.enter(bucket, size)) {
            deferred.breaches.extend(breaches);
        }
    }

    pub(crate) fn stats_leave(&self, bucket: Bucket, deferred: &mut Deferred) {
        let size = self.in_memory_size();
        if let Some(breaches) = self.with_parent_stats(|s| s.leave(bucket, size)) {
            deferred.breaches.extend(breaches);
        }
    }

    pub(crate) fn stats_transfer(&self, from: Bucket, to: Bucket) {
        let size = self.in_memory_size();
        self.with_parent_stats(|s| s.transfer(from, to, size));
    }

    pub(crate) fn check_owner_spill(&self) {
        self.with_parent_stats(|s| s.check_spill_limits());
    }

    /// Performs the follow-up work decided under the monitor.
    pub(crate) fn dispatch(self: &Arc<Self>, deferred: Deferred) {
        let Deferred {
            cache,
            keepalive,
            available,
            unlocked,
            breaches,
            unlink,
        } = deferred;
        if cache {
            if let Some(item_cache) = &self.cache {
                item_cache.reconcile(self, keepalive);
            }
        }
        let owner = self.owner();
        if unlink {
            if let Some(owner) = &owner {
                owner.remove_child(self.id);
            }
        }
        if available && self.is_available() {
            if let Some(owner) = &owner {
                owner.link_available(self);
            }
        }
        if let Some(item) = unlocked {
            item.event_unlocked();
        }
        if !breaches.is_empty() {
            if let Some(owner) = &owner {
                owner.deliver_breaches(&breaches);
            }
        }
    }

    /// The payload, restoring it from persistence if needed.
    ///
    /// Returns `None` for expired links and for links that no longer have any recoverable
    /// representation; the latter unlink themselves.
    pub fn get_item(self: &Arc<Self>) -> Result<Option<Arc<dyn Item>>> {
        if self.kind == ItemKind::Root {
            return Ok(None);
        }
        if self.is_expired()? {
            return Ok(None);
        }
        match self.restore_item() {
            Ok(item) => Ok(item),
            Err(err) => {
                if err.is_severe() {
                    error!(link = %self.id, error = %err, dump = %self.dump(), "payload restore failed");
                }
                Err(err)
            }
        }
    }

    /// The payload without the expiry check.
    pub(crate) fn restore_item(self: &Arc<Self>) -> Result<Option<Arc<dyn Item>>> {
        let (tuple, state, encoding_failed) = {
            let st = self.inner.lock();
            if let Some(item) = st.current_item() {
                return Ok(Some(item));
            }
            (st.tuple.clone(), st.state, st.encoding_failed)
        };
        if self.kind == ItemKind::Root {
            return Ok(None);
        }
        let unrecoverable = tuple.strategy == StorageStrategy::Never
            || (encoding_failed && tuple.strategy == StorageStrategy::Maybe);
        if unrecoverable {
            self.forget_unrecoverable()?;
            return Ok(None);
        }
        if encoding_failed {
            return Err(StoreError::Severe(format!(
                "link {} has no persistent representation",
                self.id
            )));
        }
        if state == ItemLinkState::NotStored {
            return Ok(None);
        }

        // The read happens with no monitor held; the install below re-checks.
        let Some(data) = self.ctx.persistence.read_data_only(&tuple)? else {
            debug!(link = %self.id, "persistent representation no longer exists");
            return Ok(None);
        };
        let item = match self.ctx.registry.rebuild(&tuple.type_name, &data) {
            Ok(item) => item,
            Err(err) if tuple.strategy == StorageStrategy::Maybe => {
                warn!(link = %self.id, error = %err, "decode failed; item is not recoverable");
                self.inner.lock().encoding_failed = true;
                self.forget_unrecoverable()?;
                return Ok(None);
            }
            Err(err) => return Err(err),
        };
        item.membership_assigned(self.id);
        item.event_restored();
        Ok(Some(self.install_restored(item)))
    }

    fn install_restored(self: &Arc<Self>, item: Arc<dyn Item>) -> Arc<dyn Item> {
        let mut deferred = Deferred::default();
        let installed = {
            let mut st = self.inner.lock();
            if let Some(existing) = st.current_item() {
                return existing;
            }
            st.stable = true;
            st.discardable_if_stable = false;
            st.soft = Some(Arc::downgrade(&item));
            st.strong = ItemRef::Present(item.clone());
            let state = st.state;
            match state {
                ItemLinkState::Available => st.declare_discardable(&mut deferred),
                ItemLinkState::PersistentlyLocked => {
                    st.declare_discardable_if_persistently_locked(&mut deferred)
                }
                _ => st.declare_not_discardable(Some(item.clone()), &mut deferred),
            }
            let old = self.in_memory_size();
            let new = item.in_memory_size();
            if old != new {
                if let Some(bucket) = state.bucket() {
                    if let Some(breaches) = self.with_parent_stats(|s| s.resize(bucket, old, new)) {
                        deferred.breaches.extend(breaches);
                    }
                }
                self.set_in_memory_size(new);
            }
            item
        };
        self.dispatch(deferred);
        installed
    }

    /// A link with no recoverable representation leaves the store if it was available.
    fn forget_unrecoverable(self: &Arc<Self>) -> Result<()> {
        let mut deferred = Deferred::default();
        {
            let mut st = self.inner.lock();
            let state = st.state;
            match state {
                ItemLinkState::NotStored => return Ok(()),
                ItemLinkState::Available => {
                    self.stats_leave(Bucket::Available, &mut deferred);
                    st.state = ItemLinkState::NotStored;
                    st.strong = ItemRef::Absent;
                    st.discardable_if_stable = false;
                    deferred.cache = true;
                    deferred.unlink = true;
                    self.ctx.expiry.remove(self.id);
                    self.ctx.delivery_delay.remove(self.id);
                    self.ctx.unregister_link(self.id);
                    debug!(link = %self.id, "unrecoverable link discarded");
                }
                other => return Err(StoreError::state(other, "restore")),
            }
        }
        self.dispatch(deferred);
        Ok(())
    }

    /// Called by the discard cache after it dropped this link's payload.
    ///
    /// Only STORE_NEVER links act on it: their payload is gone for good, so an available link
    /// leaves the store.
    pub fn release_if_discardable(self: &Arc<Self>) -> Result<()> {
        let (never, state) = {
            let st = self.inner.lock();
            (st.tuple.strategy == StorageStrategy::Never, st.state)
        };
        if never && state == ItemLinkState::Available && self.releasable_payload().is_none() {
            self.forget_unrecoverable()?;
        }
        Ok(())
    }

    /// Drops both handles on the payload.
    pub fn release_item(self: &Arc<Self>) {
        let mut deferred = Deferred::default();
        {
            let mut st = self.inner.lock();
            let was = st.releasable();
            st.strong = ItemRef::Absent;
            st.soft = None;
            if was {
                deferred.cache = true;
            }
        }
        self.dispatch(deferred);
    }

    /// Forgets the weak handle; a pinned payload stays reachable through the strong one.
    pub fn clear_soft_reference(&self) {
        self.inner.lock().soft = None;
    }

    /// Marks the persisted representation as reflecting the payload.
    pub fn persistent_representation_is_stable(self: &Arc<Self>) {
        let mut deferred = Deferred::default();
        self.inner.lock().mark_stable(&mut deferred);
        self.dispatch(deferred);
    }

    /// Marks the persisted representation as out of date, pinning the payload.
    pub fn persistent_representation_is_unstable(self: &Arc<Self>) {
        let mut deferred = Deferred::default();
        self.inner.lock().mark_unstable(&mut deferred);
        self.dispatch(deferred);
    }

    /// Finalises priority, expiry, delivery delay and storage strategy before the add is
    /// written.
    pub(crate) fn late_initialize(
        &self,
        item: &dyn Item,
        owner_kind: ItemKind,
        owner_strategy: StorageStrategy,
    ) -> Result<()> {
        let priority = item.priority();
        if priority > HIGHEST_PRIORITY {
            return Err(StoreError::Severe(format!(
                "priority {priority} of link {} is out of range",
                self.id
            )));
        }
        let strategy = item.storage_strategy();
        let now = self.ctx.now();
        let mut st = self.inner.lock();
        if strategy != st.tuple.strategy {
            if strategy == StorageStrategy::Never || st.tuple.strategy == StorageStrategy::Never {
                return Err(StoreError::Severe(format!(
                    "storage strategy of link {} cannot change from {} to {strategy}",
                    self.id, st.tuple.strategy
                )));
            }
            st.tuple.strategy = strategy;
        }
        if owner_kind != ItemKind::Root && strategy > owner_strategy {
            return Err(StoreError::InvalidAddOperation(format!(
                "{strategy} item cannot be added to a {owner_strategy} stream"
            )));
        }
        st.tuple.priority = priority;
        st.tuple.can_expire_silently = item.can_expire_silently();
        if !self.kind.is_owner() {
            let start = item.expiry_start_time().unwrap_or(now);
            st.tuple.expiry_time = item
                .maximum_time_in_store()
                .filter(|&max| max > 0)
                .map(|max| start + max);
            st.tuple.delivery_delay_time = item
                .delivery_delay()
                .filter(|&delay| delay > 0)
                .map(|delay| start + delay);
        }
        Ok(())
    }

    /// The durable change a task of `kind` asks for, if any.
    pub(crate) fn persist_op(self: &Arc<Self>, kind: TaskKind) -> Result<Option<PersistOp>> {
        let (strategy, encoding_failed) = {
            let st = self.inner.lock();
            (st.tuple.strategy, st.encoding_failed)
        };
        if strategy == StorageStrategy::Never {
            return Ok(None);
        }
        match kind {
            TaskKind::Add | TaskKind::Update => {
                let item = self.restore_item()?.ok_or_else(|| {
                    StoreError::Severe(format!("link {} lost its payload before commit", self.id))
                })?;
                let data = match item.persistent_data() {
                    Ok(data) => data,
                    Err(err) if strategy == StorageStrategy::Maybe => {
                        warn!(link = %self.id, error = %err, "encode failed; item will not be persisted");
                        self.inner.lock().encoding_failed = true;
                        return Ok(None);
                    }
                    Err(err) => return Err(StoreError::PersistentDataEncoding(err.to_string())),
                };
                let mut st = self.inner.lock();
                st.tuple.persistent_size = data.iter().map(|s| s.len()).sum();
                let tuple = st.tuple.clone();
                Ok(Some(match kind {
                    TaskKind::Add => PersistOp::Insert { tuple, data },
                    _ => PersistOp::UpdateData { tuple, data },
                }))
            }
            _ if encoding_failed => Ok(None),
            TaskKind::Remove | TaskKind::RemoveLocked => Ok(Some(PersistOp::Delete { id: self.id })),
            TaskKind::PersistLock => {
                let st = self.inner.lock();
                let mut tuple = st.tuple.clone();
                tuple.lock_id = st.lock_id;
                Ok(Some(PersistOp::UpdateTuple { tuple }))
            }
            TaskKind::PersistUnlock => {
                let mut tuple = self.tuple();
                tuple.lock_id = LockId::NONE;
                Ok(Some(PersistOp::UpdateTuple { tuple }))
            }
            TaskKind::PersistRedeliveredCount => Ok(Some(PersistOp::UpdateTuple {
                tuple: self.tuple(),
            })),
        }
    }

    /// Whether the link is currently allowed to expire.
    pub(crate) fn internal_can_expire(&self) -> bool {
        if !self.ctx.options.items_can_expire {
            return false;
        }
        match &self.body {
            Body::Item(count) => count.count() == 0,
            Body::Reference => true,
            Body::Owner(_) => false,
        }
    }
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.inner.lock();
        f.debug_struct("Link")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("state", &st.state)
            .field("lock", &st.lock_id)
            .field("tran", &st.tran_id)
            .field("strong", &st.strong.label())
            .finish()
    }
}
