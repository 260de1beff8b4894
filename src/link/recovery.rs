//! Rebuilding link state from persisted tuples after a restart.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::{Deferred, Link};
use crate::error::Result;
use crate::state::ItemLinkState;
use crate::store::StoreContext;
use crate::transaction::{Task, TaskKind};
use crate::tuple::Tuple;
use crate::types::{ItemKind, LinkId, LockId};

impl Link {
    /// Derives the in-memory state from the tuple this link was built from.
    ///
    /// Returns `false` for a tuple that was deleted by a completed transaction; such a link is
    /// dropped. Tuples written by an in-doubt transaction rejoin that transaction as an add or
    /// remove task, so that the eventual commit or rollback completes them.
    pub(crate) fn restore_state(self: &Arc<Self>) -> Result<bool> {
        let ctx = self.ctx().clone();
        let now = ctx.now();
        let tuple = self.tuple();
        let tran = tuple.tran_id.and_then(|id| ctx.transactions.lookup(id));
        if tran.is_none() && tuple.logically_deleted {
            debug!(link = %self.id(), "deleted tuple skipped");
            return Ok(false);
        }
        let delayed = ctx.options.delivery_delay_enabled
            && tuple.delivery_delay_time.is_some_and(|due| due > now);

        let mut deferred = Deferred::default();
        let task = {
            let mut st = self.lock_state();
            let task = match &tran {
                None => {
                    st.tran_id = None;
                    if tuple.lock_id != LockId::NONE {
                        st.lock_id = tuple.lock_id;
                        st.state = ItemLinkState::PersistentlyLocked;
                        st.declare_discardable_if_persistently_locked(&mut deferred);
                    } else if delayed {
                        st.lock_id = LockId::DELIVERY_DELAY;
                        st.state = ItemLinkState::Locked;
                    } else {
                        st.state = ItemLinkState::Available;
                        st.declare_discardable(&mut deferred);
                        deferred.available = true;
                    }
                    None
                }
                Some(tx) => {
                    st.tran_id = Some(tx.persistent_tran_id());
                    if tuple.logically_deleted {
                        if tuple.lock_id != LockId::NONE {
                            st.lock_id = tuple.lock_id;
                            st.state = ItemLinkState::RemovingPersistentlyLocked;
                            Some(TaskKind::RemoveLocked)
                        } else {
                            st.state = ItemLinkState::RemovingWithoutLock;
                            Some(TaskKind::Remove)
                        }
                    } else if delayed {
                        st.lock_id = LockId::DELIVERY_DELAY;
                        st.state = ItemLinkState::AddingLocked;
                        Some(TaskKind::Add)
                    } else {
                        st.state = ItemLinkState::AddingUnlocked;
                        Some(TaskKind::Add)
                    }
                }
            };
            if let Some(bucket) = st.state.bucket() {
                self.stats_enter(bucket, &mut deferred);
            }
            task
        };
        self.dispatch(deferred);

        let state = self.state();
        if matches!(
            state,
            ItemLinkState::Available | ItemLinkState::Locked | ItemLinkState::PersistentlyLocked
        ) {
            self.register_with_indices(self.lock_id(), tuple.expiry_time, tuple.delivery_delay_time);
        }
        if let (Some(tx), Some(kind)) = (tran, task) {
            tx.add_restored_work(Task::new(kind, self.clone()));
            tx.declare_already_precommitted();
            debug!(link = %self.id(), tran = %tx.id(), state = %state, "rejoined in-doubt transaction");
        }
        if let Err(err) = self.increment_referred() {
            warn!(link = %self.id(), error = %err, "cannot restore reference count");
        }
        Ok(true)
    }
}

fn group_by_owner(tuples: Vec<Tuple>) -> BTreeMap<LinkId, Vec<Tuple>> {
    let mut grouped: BTreeMap<LinkId, Vec<Tuple>> = BTreeMap::new();
    for tuple in tuples {
        grouped.entry(tuple.stream_id).or_default().push(tuple);
    }
    for children in grouped.values_mut() {
        children.sort_by_key(|t| (t.sequence, t.id));
    }
    grouped
}

fn build_streams(
    ctx: &Arc<StoreContext>,
    owner: &Arc<Link>,
    pending: &mut BTreeMap<LinkId, Vec<Tuple>>,
    built: &mut Vec<Arc<Link>>,
) -> Result<()> {
    let Some(children) = pending.remove(&owner.id()) else {
        return Ok(());
    };
    for tuple in children {
        let stream = Link::new(ctx.clone(), Some(owner), tuple, None, true);
        if !stream.restore_state()? {
            continue;
        }
        ctx.register_link(&stream);
        owner.insert_restored(&stream);
        built.push(stream.clone());
        build_streams(ctx, &stream, pending, built)?;
    }
    Ok(())
}

/// Rebuilds the stream tree under `root`.
///
/// Item streams keep their items unloaded until first use. Reference streams, and streams with
/// children written by an in-doubt transaction, load their children straight away so that
/// reference counts and pending transactions are complete once this returns.
pub(crate) fn initialize_tree(ctx: &Arc<StoreContext>, root: &Arc<Link>) -> Result<()> {
    let mut pending = group_by_owner(ctx.persistence.read_all_streams()?);
    let mut streams = Vec::new();
    build_streams(ctx, root, &mut pending, &mut streams)?;
    for (owner, orphans) in &pending {
        warn!(owner = %owner, count = orphans.len(), "streams without an owner ignored");
    }

    for stream in streams.iter().filter(|s| s.kind() == ItemKind::ReferenceStream) {
        stream.ensure_loaded()?;
    }
    for id in ctx.persistence.identify_streams_with_indoubt_items()? {
        match ctx.lookup_link(id) {
            Some(stream) => stream.ensure_loaded()?,
            None => warn!(stream = %id, "in-doubt items belong to an unknown stream"),
        }
    }
    info!(streams = streams.len(), "link tree restored");
    Ok(())
}
