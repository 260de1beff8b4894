//! The transactional verbs and the callbacks that complete them.
//!
//! Each verb checks and mutates state under the link monitor, then dispatches its [`Deferred`]
//! and enqueues its task after the monitor is released.

use std::sync::Arc;

use tracing::{debug, warn};

use super::{Deferred, Link};
use crate::error::{Result, StoreError};
use crate::item::{Filter, Item, MatchAll};
use crate::state::ItemLinkState;
use crate::stats::Bucket;
use crate::transaction::{Task, TaskKind, Transaction};
use crate::types::{LockId, StorageStrategy};

fn filter_accepts(link: &Link, filter: &dyn Filter, item: &dyn Item) -> bool {
    match filter.filter_matches(item) {
        Ok(matched) => matched,
        Err(err) => {
            debug!(link = %link.id(), error = %err, "filter failed; treating as no match");
            false
        }
    }
}

impl Link {
    fn enqueue(self: &Arc<Self>, kind: TaskKind, tran: &Transaction) -> Result<()> {
        tran.add_work(Task::new(kind, self.clone()))
    }

    /// Starts adding the link under `tran`, locked with `lock_id` unless it is
    /// [`LockId::NONE`].
    pub(crate) fn cmd_add(self: &Arc<Self>, lock_id: LockId, tran: &Transaction) -> Result<()> {
        tran.ensure_active()?;
        self.increment_referred()?;
        let mut deferred = Deferred::default();
        {
            let mut st = self.lock_state();
            if st.state != ItemLinkState::NotStored {
                let state = st.state;
                drop(st);
                self.rollback_referred_increment();
                return Err(StoreError::state(state, "add"));
            }
            st.tran_id = Some(tran.persistent_tran_id());
            st.lock_id = lock_id;
            st.state = if lock_id == LockId::NONE {
                ItemLinkState::AddingUnlocked
            } else {
                ItemLinkState::AddingLocked
            };
            st.tuple.was_spilling = self.with_parent_stats(|s| s.is_spilling()).unwrap_or(false);
            self.stats_enter(Bucket::Adding, &mut deferred);
            debug!(link = %self.id(), tran = %tran.id(), lock = %lock_id, "add started");
        }
        self.dispatch(deferred);
        if let Err(err) = self.enqueue(TaskKind::Add, tran) {
            if let Err(abort) = self.abort_add(tran) {
                warn!(link = %self.id(), error = %abort, "cannot undo add");
            }
            return Err(err);
        }
        Ok(())
    }

    /// Runs the item's precommit hook, finalises the tuple and links into the owner's list.
    pub fn pre_commit_add(self: &Arc<Self>, tran: &Transaction) -> Result<()> {
        {
            let st = self.lock_state();
            if !st.state.is_adding() {
                return Err(StoreError::state(st.state, "pre-commit add"));
            }
            st.check_tran(tran)?;
        }
        let item = self.restore_item()?.ok_or_else(|| {
            StoreError::Severe(format!("link {} lost its payload while adding", self.id()))
        })?;
        item.event_precommit_add(tran)?;
        let owner = self
            .owner()
            .ok_or_else(|| StoreError::Severe(format!("link {} has no owner", self.id())))?;
        owner.assert_can_add_child_under(tran)?;
        self.late_initialize(item.as_ref(), owner.kind(), owner.storage_strategy())?;
        let sequence = owner.next_sequence();
        self.lock_state().tuple.sequence = sequence;
        owner.append(self);
        Ok(())
    }

    pub(super) fn register_with_indices(
        self: &Arc<Self>,
        lock_id: LockId,
        expiry: Option<u64>,
        delay: Option<u64>,
    ) {
        let ctx = self.ctx();
        if ctx.options.expiry_enabled && !self.kind().is_owner() {
            if let Some(due) = expiry {
                ctx.expiry.add(self, due);
            }
        }
        if ctx.options.delivery_delay_enabled && lock_id == LockId::DELIVERY_DELAY {
            if let Some(due) = delay {
                ctx.delivery_delay.add(self, due);
            }
        }
    }

    /// Completes the add: locked adds become `Locked`, others `Available`.
    pub fn commit_add(self: &Arc<Self>, tran: &Transaction) -> Result<()> {
        let mut deferred = Deferred::default();
        {
            let mut st = self.lock_state();
            let state = st.state;
            if !state.is_adding() {
                return Err(StoreError::state(state, "commit add"));
            }
            st.check_tran(tran)?;
            let (expiry, delay) = (st.tuple.expiry_time, st.tuple.delivery_delay_time);
            self.register_with_indices(st.lock_id, expiry, delay);
            self.check_owner_spill();
            if state == ItemLinkState::AddingLocked {
                self.stats_transfer(Bucket::Adding, Bucket::Locked);
                st.state = ItemLinkState::Locked;
            } else {
                self.stats_transfer(Bucket::Adding, Bucket::Available);
                st.declare_discardable(&mut deferred);
                st.state = ItemLinkState::Available;
                deferred.available = true;
            }
            st.tran_id = None;
            debug!(link = %self.id(), state = %st.state, "add committed");
        }
        self.dispatch(deferred);
        Ok(())
    }

    /// Fires the item's post-commit event.
    pub fn post_commit_add(self: &Arc<Self>, _tran: &Transaction) {
        let item = self.lock_state().current_item();
        if let Some(item) = item {
            item.event_post_commit_add();
        }
    }

    /// Undoes an add: the link leaves the statistics, the indices and the tree.
    pub fn abort_add(self: &Arc<Self>, tran: &Transaction) -> Result<()> {
        let mut deferred = Deferred::default();
        {
            let mut st = self.lock_state();
            if !st.state.is_adding() {
                return Err(StoreError::state(st.state, "abort add"));
            }
            st.check_tran(tran)?;
            self.ctx().expiry.remove(self.id());
            self.ctx().delivery_delay.remove(self.id());
            self.stats_leave(Bucket::Adding, &mut deferred);
            st.lock_id = LockId::NONE;
            st.tran_id = None;
            st.state = ItemLinkState::NotStored;
            self.ctx().unregister_link(self.id());
            deferred.unlink = true;
            debug!(link = %self.id(), tran = %tran.id(), "add rolled back");
        }
        self.dispatch(deferred);
        self.rollback_referred_increment();
        Ok(())
    }

    /// Fires the item's post-rollback event.
    pub fn post_abort_add(self: &Arc<Self>, _tran: &Transaction) {
        let item = self.lock_state().current_item();
        if let Some(item) = item {
            item.event_post_rollback_add();
        }
    }

    fn lock_available(self: &Arc<Self>, lock_id: LockId, item: Option<Arc<dyn Item>>) -> Result<bool> {
        let mut deferred = Deferred::default();
        {
            let mut st = self.lock_state();
            if st.state != ItemLinkState::Available {
                return Ok(false);
            }
            self.stats_transfer(Bucket::Available, Bucket::Locked);
            st.lock_id = lock_id;
            st.declare_not_discardable(item, &mut deferred);
            st.state = ItemLinkState::Locked;
        }
        self.dispatch(deferred);
        Ok(true)
    }

    /// Locks an available link with `lock_id`.
    pub fn cmd_lock(self: &Arc<Self>, lock_id: LockId) -> Result<()> {
        if lock_id == LockId::NONE {
            return Err(StoreError::InvalidArgument("cannot lock with NO_LOCK_ID".into()));
        }
        let item = self.restore_item()?;
        if self.lock_available(lock_id, item)? {
            Ok(())
        } else {
            Err(StoreError::state(self.state(), "lock"))
        }
    }

    /// Locks the link if it is available, not expired and accepted by `filter`.
    pub fn lock_if_matches(self: &Arc<Self>, filter: &dyn Filter, lock_id: LockId) -> Result<bool> {
        if lock_id == LockId::NONE {
            return Err(StoreError::InvalidArgument("cannot lock with NO_LOCK_ID".into()));
        }
        if !self.is_available() {
            return Ok(false);
        }
        let Some(item) = self.get_item()? else {
            return Ok(false);
        };
        if !filter_accepts(self, filter, item.as_ref()) {
            return Ok(false);
        }
        self.lock_available(lock_id, Some(item))
    }

    /// Locks the link if it is available and not expired.
    pub fn lock_item_if_available(self: &Arc<Self>, lock_id: LockId) -> Result<bool> {
        self.lock_if_matches(&MatchAll, lock_id)
    }

    /// Returns `true` if the link is available and its payload passes `filter`.
    pub fn matches(self: &Arc<Self>, filter: &dyn Filter) -> Result<bool> {
        self.matches_allow_unavailable(filter, false)
    }

    /// Like [`Link::matches`], optionally ignoring availability.
    pub fn matches_allow_unavailable(
        self: &Arc<Self>,
        filter: &dyn Filter,
        allow_unavailable: bool,
    ) -> Result<bool> {
        if !allow_unavailable && !self.is_available() {
            return Ok(false);
        }
        let Some(item) = self.get_item()? else {
            return Ok(false);
        };
        Ok(filter_accepts(self, filter, item.as_ref()))
    }

    /// Starts persisting the in-memory lock under `tran`.
    pub fn cmd_persist_lock(self: &Arc<Self>, tran: &Transaction) -> Result<()> {
        tran.ensure_active()?;
        let item = self.restore_item()?;
        let mut deferred = Deferred::default();
        {
            let mut st = self.lock_state();
            if st.state != ItemLinkState::Locked {
                return Err(StoreError::state(st.state, "persist lock"));
            }
            st.tran_id = Some(tran.persistent_tran_id());
            st.declare_not_discardable(item, &mut deferred);
            st.state = ItemLinkState::PersistingLock;
        }
        self.dispatch(deferred);
        if let Err(err) = self.enqueue(TaskKind::PersistLock, tran) {
            if let Err(abort) = self.abort_persist_lock(tran) {
                warn!(link = %self.id(), error = %abort, "cannot undo persist lock");
            }
            return Err(err);
        }
        Ok(())
    }

    /// The lock is durable.
    pub fn commit_persist_lock(self: &Arc<Self>, tran: &Transaction) -> Result<()> {
        let mut deferred = Deferred::default();
        {
            let mut st = self.lock_state();
            if st.state != ItemLinkState::PersistingLock {
                return Err(StoreError::state(st.state, "commit persist lock"));
            }
            st.check_tran(tran)?;
            st.tuple.lock_id = st.lock_id;
            st.declare_discardable_if_persistently_locked(&mut deferred);
            st.state = ItemLinkState::PersistentlyLocked;
            st.tran_id = None;
        }
        self.dispatch(deferred);
        Ok(())
    }

    /// The lock stays in memory only.
    pub fn abort_persist_lock(self: &Arc<Self>, tran: &Transaction) -> Result<()> {
        let mut st = self.lock_state();
        if st.state != ItemLinkState::PersistingLock {
            return Err(StoreError::state(st.state, "abort persist lock"));
        }
        st.check_tran(tran)?;
        st.state = ItemLinkState::Locked;
        st.tran_id = None;
        Ok(())
    }

    /// Releases a lock.
    ///
    /// An in-memory lock is released at once and the owner is told the link is available. A
    /// persistent lock needs `tran` and is released when it commits. The payload is read back
    /// first so the item hears about the unlock even when it was not in memory.
    pub fn unlock(
        self: &Arc<Self>,
        lock_id: LockId,
        tran: Option<&Transaction>,
        increment_unlock_count: bool,
    ) -> Result<()> {
        let item = self.restore_item()?;
        let mut deferred = Deferred::default();
        let mut persist_under = None;
        {
            let mut st = self.lock_state();
            let state = st.state;
            match state {
                ItemLinkState::Locked => {
                    if st.lock_id != lock_id {
                        return Err(StoreError::LockIdMismatch {
                            expected: st.lock_id,
                            supplied: lock_id,
                        });
                    }
                    self.stats_transfer(Bucket::Locked, Bucket::Available);
                    if increment_unlock_count {
                        st.unlock_count += 1;
                    }
                    st.lock_id = LockId::NONE;
                    st.tuple.lock_id = LockId::NONE;
                    deferred.unlocked = st.current_item().or(item);
                    st.declare_discardable(&mut deferred);
                    st.state = ItemLinkState::Available;
                    deferred.available = true;
                }
                ItemLinkState::PersistentlyLocked => {
                    if st.lock_id != lock_id {
                        return Err(StoreError::LockIdMismatch {
                            expected: st.lock_id,
                            supplied: lock_id,
                        });
                    }
                    let Some(tran) = tran else {
                        return Err(StoreError::state(st.state, "unlock without transaction"));
                    };
                    tran.ensure_active()?;
                    st.tran_id = Some(tran.persistent_tran_id());
                    let item = st.current_item().or(item);
                    st.declare_not_discardable(item, &mut deferred);
                    st.state = ItemLinkState::UnlockingPersistentlyLocked;
                    persist_under = Some(tran);
                }
                other => return Err(StoreError::state(other, "unlock")),
            }
            debug!(link = %self.id(), lock = %lock_id, state = %st.state, "unlock");
        }
        self.dispatch(deferred);
        if let Some(tran) = persist_under {
            if let Err(err) = self.enqueue(TaskKind::PersistUnlock, tran) {
                if let Err(abort) = self.abort_persist_unlock(tran) {
                    warn!(link = %self.id(), error = %abort, "cannot undo persistent unlock");
                }
                return Err(err);
            }
        }
        Ok(())
    }

    /// The persistent lock is gone; the link is available.
    pub fn commit_persist_unlock(self: &Arc<Self>, tran: &Transaction) -> Result<()> {
        let mut deferred = Deferred::default();
        {
            let mut st = self.lock_state();
            if st.state != ItemLinkState::UnlockingPersistentlyLocked {
                return Err(StoreError::state(st.state, "commit persist unlock"));
            }
            st.check_tran(tran)?;
            self.stats_transfer(Bucket::Locked, Bucket::Available);
            st.lock_id = LockId::NONE;
            st.tuple.lock_id = LockId::NONE;
            st.unlock_count += 1;
            st.declare_discardable(&mut deferred);
            st.state = ItemLinkState::Available;
            st.tran_id = None;
            deferred.available = true;
        }
        self.dispatch(deferred);
        Ok(())
    }

    /// The persistent lock stays.
    pub fn abort_persist_unlock(self: &Arc<Self>, tran: &Transaction) -> Result<()> {
        let mut deferred = Deferred::default();
        {
            let mut st = self.lock_state();
            if st.state != ItemLinkState::UnlockingPersistentlyLocked {
                return Err(StoreError::state(st.state, "abort persist unlock"));
            }
            st.check_tran(tran)?;
            st.declare_discardable_if_persistently_locked(&mut deferred);
            st.state = ItemLinkState::PersistentlyLocked;
            st.tran_id = None;
        }
        self.dispatch(deferred);
        Ok(())
    }

    /// Starts removing the link under `tran`.
    ///
    /// An available link must be removed with [`LockId::NONE`]; a locked one with its lock.
    /// Removing a STORE_NEVER link that already left the store does nothing.
    pub fn cmd_remove(self: &Arc<Self>, lock_id: LockId, tran: &Transaction) -> Result<()> {
        tran.ensure_active()?;
        let item = self.restore_item()?;
        let mut deferred = Deferred::default();
        let task = {
            let mut st = self.lock_state();
            let (next, task, from) = match st.state {
                ItemLinkState::Available => {
                    if lock_id != LockId::NONE {
                        return Err(StoreError::LockIdMismatch {
                            expected: LockId::NONE,
                            supplied: lock_id,
                        });
                    }
                    (ItemLinkState::RemovingWithoutLock, TaskKind::Remove, Bucket::Available)
                }
                ItemLinkState::Locked => {
                    if st.lock_id != lock_id && st.lock_id != LockId::DELIVERY_DELAY {
                        return Err(StoreError::LockIdMismatch {
                            expected: st.lock_id,
                            supplied: lock_id,
                        });
                    }
                    (ItemLinkState::RemovingLocked, TaskKind::RemoveLocked, Bucket::Locked)
                }
                ItemLinkState::PersistentlyLocked => {
                    if st.lock_id != lock_id {
                        return Err(StoreError::LockIdMismatch {
                            expected: st.lock_id,
                            supplied: lock_id,
                        });
                    }
                    (
                        ItemLinkState::RemovingPersistentlyLocked,
                        TaskKind::RemoveLocked,
                        Bucket::Locked,
                    )
                }
                ItemLinkState::NotStored if st.tuple.strategy == StorageStrategy::Never => {
                    return Ok(());
                }
                other => return Err(StoreError::state(other, "remove")),
            };
            self.stats_transfer(from, Bucket::Removing);
            st.tran_id = Some(tran.persistent_tran_id());
            st.declare_not_discardable(item, &mut deferred);
            st.state = next;
            debug!(link = %self.id(), tran = %tran.id(), state = %next, "remove started");
            task
        };
        self.dispatch(deferred);
        if let Err(err) = self.enqueue(task, tran) {
            if let Err(abort) = self.abort_remove(tran) {
                warn!(link = %self.id(), error = %abort, "cannot undo remove");
            }
            return Err(err);
        }
        Ok(())
    }

    /// Starts removing a link that is locked for expiry.
    pub fn cmd_remove_expiring(self: &Arc<Self>, lock_id: LockId, tran: &Transaction) -> Result<()> {
        tran.ensure_active()?;
        {
            let mut st = self.lock_state();
            if st.state != ItemLinkState::LockedForExpiry {
                return Err(StoreError::state(st.state, "remove expiring"));
            }
            if st.lock_id != lock_id {
                return Err(StoreError::LockIdMismatch {
                    expected: st.lock_id,
                    supplied: lock_id,
                });
            }
            self.stats_transfer(Bucket::Expiring, Bucket::Removing);
            st.tran_id = Some(tran.persistent_tran_id());
            st.state = ItemLinkState::RemovingExpiring;
        }
        if let Err(err) = self.enqueue(TaskKind::RemoveLocked, tran) {
            if let Err(abort) = self.abort_remove(tran) {
                warn!(link = %self.id(), error = %abort, "cannot undo expiring remove");
            }
            return Err(err);
        }
        Ok(())
    }

    /// Removes the link if it is available (or only held by its delivery delay) and accepted
    /// by `filter`.
    pub fn remove_if_matches(self: &Arc<Self>, filter: &dyn Filter, tran: &Transaction) -> Result<bool> {
        tran.ensure_active()?;
        let Some(item) = self.restore_item()? else {
            return Ok(false);
        };
        if !filter_accepts(self, filter, item.as_ref()) {
            return Ok(false);
        }
        let mut deferred = Deferred::default();
        let task = {
            let mut st = self.lock_state();
            let (next, task, from) = match st.state {
                ItemLinkState::Available => {
                    (ItemLinkState::RemovingWithoutLock, TaskKind::Remove, Bucket::Available)
                }
                ItemLinkState::Locked if st.lock_id == LockId::DELIVERY_DELAY => {
                    (ItemLinkState::RemovingLocked, TaskKind::RemoveLocked, Bucket::Locked)
                }
                _ => return Ok(false),
            };
            self.stats_transfer(from, Bucket::Removing);
            st.tran_id = Some(tran.persistent_tran_id());
            st.declare_not_discardable(Some(item), &mut deferred);
            st.state = next;
            task
        };
        self.dispatch(deferred);
        if let Err(err) = self.enqueue(task, tran) {
            if let Err(abort) = self.abort_remove(tran) {
                warn!(link = %self.id(), error = %abort, "cannot undo remove");
            }
            return Err(err);
        }
        Ok(true)
    }

    /// Checks that the remove may be written and runs the item's precommit hook.
    pub fn pre_commit_remove(self: &Arc<Self>, tran: &Transaction) -> Result<()> {
        {
            let st = self.lock_state();
            if !st.state.is_removing() {
                return Err(StoreError::state(st.state, "pre-commit remove"));
            }
            st.check_tran(tran)?;
        }
        if self.kind().is_owner() {
            self.assert_can_delete(tran)?;
        }
        if let Some(owner) = self.owner() {
            owner.assert_can_remove_child_under(tran)?;
        }
        if let Some(item) = self.restore_item()? {
            item.event_precommit_remove(tran)?;
        }
        Ok(())
    }

    /// Completes the remove: the link leaves the indices, the statistics and the tree.
    pub fn commit_remove(self: &Arc<Self>, tran: &Transaction) -> Result<()> {
        let mut deferred = Deferred::default();
        {
            let mut st = self.lock_state();
            let state = st.state;
            if !state.is_removing() {
                return Err(StoreError::state(state, "commit remove"));
            }
            st.check_tran(tran)?;
            self.check_owner_spill();
            self.stats_leave(Bucket::Removing, &mut deferred);
            if state != ItemLinkState::RemovingExpiring {
                self.ctx().expiry.remove(self.id());
            }
            self.ctx().delivery_delay.remove(self.id());
            st.lock_id = LockId::NONE;
            st.state = ItemLinkState::NotStored;
            st.tran_id = None;
            self.ctx().unregister_link(self.id());
            deferred.unlink = true;
            debug!(link = %self.id(), tran = %tran.id(), "remove committed");
        }
        self.dispatch(deferred);
        self.decrement_referred(tran);
        Ok(())
    }

    /// Fires the item's post-commit event and lets go of the payload.
    pub fn post_commit_remove(self: &Arc<Self>, _tran: &Transaction) {
        let item = self.lock_state().current_item();
        if let Some(item) = item {
            item.event_post_commit_remove();
        }
        self.release_item();
    }

    /// Undoes a remove, restoring the state the link was removed from.
    pub fn abort_remove(self: &Arc<Self>, tran: &Transaction) -> Result<()> {
        let mut deferred = Deferred::default();
        {
            let mut st = self.lock_state();
            st.check_tran(tran)?;
            let state = st.state;
            match state {
                ItemLinkState::RemovingExpiring | ItemLinkState::RemovingWithoutLock => {
                    self.stats_transfer(Bucket::Removing, Bucket::Available);
                    st.lock_id = LockId::NONE;
                    st.declare_discardable(&mut deferred);
                    st.state = ItemLinkState::Available;
                    deferred.available = true;
                }
                ItemLinkState::RemovingLocked => {
                    self.stats_transfer(Bucket::Removing, Bucket::Locked);
                    st.state = ItemLinkState::Locked;
                }
                ItemLinkState::RemovingPersistentlyLocked => {
                    self.stats_transfer(Bucket::Removing, Bucket::Locked);
                    st.declare_discardable_if_persistently_locked(&mut deferred);
                    st.state = ItemLinkState::PersistentlyLocked;
                }
                other => return Err(StoreError::state(other, "abort remove")),
            }
            st.backout_count += 1;
            st.tran_id = None;
            debug!(link = %self.id(), tran = %tran.id(), state = %st.state, "remove rolled back");
        }
        self.dispatch(deferred);
        Ok(())
    }

    /// Fires the item's post-rollback event.
    pub fn post_abort_remove(self: &Arc<Self>, _tran: &Transaction) {
        let item = self.lock_state().current_item();
        if let Some(item) = item {
            item.event_post_rollback_remove();
        }
    }

    /// Starts rewriting the link's data under `tran`.
    pub fn cmd_request_update(self: &Arc<Self>, tran: &Transaction) -> Result<()> {
        tran.ensure_active()?;
        let item = self.restore_item()?;
        let mut deferred = Deferred::default();
        {
            let mut st = self.lock_state();
            if st.state != ItemLinkState::Available {
                return Err(StoreError::state(st.state, "request update"));
            }
            self.stats_transfer(Bucket::Available, Bucket::Updating);
            st.tran_id = Some(tran.persistent_tran_id());
            st.declare_not_discardable(item, &mut deferred);
            if st.tuple.strategy != StorageStrategy::Never {
                st.mark_unstable(&mut deferred);
            }
            st.state = ItemLinkState::UpdatingData;
        }
        self.dispatch(deferred);
        if let Err(err) = self.enqueue(TaskKind::Update, tran) {
            if let Err(abort) = self.abort_update(tran) {
                warn!(link = %self.id(), error = %abort, "cannot undo update");
            }
            return Err(err);
        }
        Ok(())
    }

    /// Runs the item's precommit hook for an update.
    pub fn pre_commit_update(self: &Arc<Self>, tran: &Transaction) -> Result<()> {
        let item = {
            let st = self.lock_state();
            if st.state != ItemLinkState::UpdatingData {
                return Err(StoreError::state(st.state, "pre-commit update"));
            }
            st.check_tran(tran)?;
            st.current_item()
        };
        if let Some(item) = item {
            item.event_precommit_update(tran)?;
        }
        Ok(())
    }

    /// The new data is durable; the link is available again.
    pub fn commit_update(self: &Arc<Self>, tran: &Transaction) -> Result<()> {
        let mut deferred = Deferred::default();
        {
            let mut st = self.lock_state();
            if st.state != ItemLinkState::UpdatingData {
                return Err(StoreError::state(st.state, "commit update"));
            }
            st.check_tran(tran)?;
            self.stats_transfer(Bucket::Updating, Bucket::Available);
            if let Some(item) = st.current_item() {
                let (old, new) = (self.in_memory_size(), item.in_memory_size());
                if old != new {
                    if let Some(breaches) =
                        self.with_parent_stats(|s| s.resize(Bucket::Available, old, new))
                    {
                        deferred.breaches.extend(breaches);
                    }
                    self.set_in_memory_size(new);
                }
            }
            st.declare_discardable(&mut deferred);
            st.state = ItemLinkState::Available;
            st.tran_id = None;
        }
        self.dispatch(deferred);
        Ok(())
    }

    /// The old data stands; the link is available again.
    pub fn abort_update(self: &Arc<Self>, tran: &Transaction) -> Result<()> {
        let mut deferred = Deferred::default();
        {
            let mut st = self.lock_state();
            if st.state != ItemLinkState::UpdatingData {
                return Err(StoreError::state(st.state, "abort update"));
            }
            st.check_tran(tran)?;
            self.stats_transfer(Bucket::Updating, Bucket::Available);
            st.declare_discardable(&mut deferred);
            st.mark_stable(&mut deferred);
            st.state = ItemLinkState::Available;
            st.tran_id = None;
        }
        self.dispatch(deferred);
        Ok(())
    }

    /// Returns `true` once the link is locked for expiry, locking it first if it is available
    /// and past its expiry time.
    pub fn is_expired(self: &Arc<Self>) -> Result<bool> {
        let now = self.ctx().now();
        let due = {
            let st = self.lock_state();
            match st.state {
                ItemLinkState::LockedForExpiry => return Ok(true),
                ItemLinkState::Available => st.tuple.expiry_time.is_some_and(|t| t <= now),
                _ => return Ok(false),
            }
        };
        if !due || !self.internal_can_expire() {
            return Ok(false);
        }
        let item = self.restore_item()?;
        if item.is_none() {
            return Ok(false);
        }
        let mut deferred = Deferred::default();
        let expired = {
            let mut st = self.lock_state();
            if st.state == ItemLinkState::Available {
                self.stats_transfer(Bucket::Available, Bucket::Expiring);
                st.lock_id = LockId::EXPIRY;
                st.declare_not_discardable(item, &mut deferred);
                st.state = ItemLinkState::LockedForExpiry;
                debug!(link = %self.id(), "locked for expiry");
            }
            st.state == ItemLinkState::LockedForExpiry
        };
        self.dispatch(deferred);
        Ok(expired)
    }

    /// Releases the expiry lock, leaving the link available.
    pub fn cmd_remove_expiry_lock(self: &Arc<Self>) -> Result<()> {
        let mut deferred = Deferred::default();
        {
            let mut st = self.lock_state();
            if st.state != ItemLinkState::LockedForExpiry {
                return Err(StoreError::state(st.state, "remove expiry lock"));
            }
            self.stats_transfer(Bucket::Expiring, Bucket::Available);
            st.lock_id = LockId::NONE;
            st.declare_discardable(&mut deferred);
            st.state = ItemLinkState::Available;
            deferred.available = true;
        }
        self.dispatch(deferred);
        Ok(())
    }

    /// Expires the link under `tran` if it is due.
    ///
    /// Returns `true` when the link should leave the expiry index: it is being removed, or it
    /// is no longer in the store. A failed expiry notification releases the expiry lock and
    /// keeps the link indexed so that expiry is retried.
    pub fn expirable_expire(self: &Arc<Self>, tran: &Transaction) -> Result<bool> {
        if self.is_expired()? {
            let (silent, item) = {
                let st = self.lock_state();
                (st.tuple.can_expire_silently, st.current_item())
            };
            if !silent {
                if let Some(item) = item {
                    if let Err(err) = item.event_expiry_notification(tran) {
                        warn!(link = %self.id(), error = %err, "expiry notification failed");
                        self.cmd_remove_expiry_lock()?;
                        return Ok(false);
                    }
                }
            }
            if let Err(err) = self.cmd_remove_expiring(LockId::EXPIRY, tran) {
                warn!(link = %self.id(), error = %err, "cannot remove expiring link");
                self.cmd_remove_expiry_lock()?;
                return Ok(false);
            }
            self.ctx().delivery_delay.remove(self.id());
            debug!(link = %self.id(), tran = %tran.id(), "expiring");
            return Ok(true);
        }
        Ok(!self.is_in_store())
    }

    /// Ends a delivery delay by unlocking the link.
    ///
    /// Returns `true` when the link should leave the delivery-delay index; `false` asks for a
    /// retry.
    pub fn delivery_delayable_unlock(
        self: &Arc<Self>,
        tran: Option<&Transaction>,
        lock_id: LockId,
    ) -> bool {
        let result = self.is_expired().and_then(|expired| {
            if !expired && self.state() == ItemLinkState::Locked {
                self.unlock(lock_id, tran, false)
            } else {
                Ok(())
            }
        });
        match result {
            Ok(()) => true,
            Err(err) => {
                warn!(link = %self.id(), error = %err, "delivery delay unlock failed");
                false
            }
        }
    }

    /// Records and persists the redelivered count on an auto-commit transaction.
    pub fn persist_redelivered_count(self: &Arc<Self>, count: u32) -> Result<()> {
        self.lock_state().tuple.redelivered_count = count;
        let tran = self.ctx().transactions.auto_commit();
        self.enqueue(TaskKind::PersistRedeliveredCount, &tran)?;
        tran.commit()
    }
}
