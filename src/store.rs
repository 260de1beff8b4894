//! The store context shared by every link, and the [`MessageStore`] facade.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cache::{CacheStats, ManagedCache};
use crate::config::StoreOptions;
use crate::error::Result;
use crate::expiry::{DeliveryDelayIndex, ExpiryIndex};
use crate::item::ItemRegistry;
use crate::link::{initialize_tree, Link};
use crate::persistence::PersistentStore;
use crate::stats::StatsSnapshot;
use crate::transaction::{Transaction, TransactionTable};
use crate::types::{LinkId, LockId};

/// Collaborators every link reaches through its context.
pub struct StoreContext {
    pub(crate) options: StoreOptions,
    pub(crate) persistence: Arc<dyn PersistentStore>,
    pub(crate) registry: ItemRegistry,
    pub(crate) caches: ManagedCache,
    pub(crate) expiry: ExpiryIndex,
    pub(crate) delivery_delay: DeliveryDelayIndex,
    pub(crate) transactions: Arc<TransactionTable>,
    links: Mutex<FxHashMap<LinkId, Weak<Link>>>,
    next_id: AtomicU64,
}

impl StoreContext {
    fn new(
        options: StoreOptions,
        persistence: Arc<dyn PersistentStore>,
        registry: ItemRegistry,
    ) -> Result<Self> {
        let transactions = TransactionTable::new(persistence.clone())?;
        let next_id = persistence.highest_unique_id()? + 1;
        Ok(Self {
            caches: ManagedCache::new(options.cache),
            options,
            persistence,
            registry,
            expiry: ExpiryIndex::new("expiry"),
            delivery_delay: DeliveryDelayIndex::new("delivery-delay"),
            transactions,
            links: Mutex::new(FxHashMap::default()),
            next_id: AtomicU64::new(next_id),
        })
    }

    /// Current time in milliseconds from the configured clock.
    pub(crate) fn now(&self) -> u64 {
        self.options.clock.now_millis()
    }

    pub(crate) fn next_link_id(&self) -> LinkId {
        LinkId(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    pub(crate) fn register_link(&self, link: &Arc<Link>) {
        self.links.lock().insert(link.id(), Arc::downgrade(link));
    }

    pub(crate) fn unregister_link(&self, id: LinkId) {
        self.links.lock().remove(&id);
    }

    /// A link that is currently in memory.
    pub(crate) fn lookup_link(&self, id: LinkId) -> Option<Arc<Link>> {
        let mut links = self.links.lock();
        match links.get(&id).map(Weak::upgrade) {
            Some(Some(link)) => Some(link),
            Some(None) => {
                links.remove(&id);
                None
            }
            None => None,
        }
    }

    /// A link by id, loading its owner's children if the link is persisted but not yet in
    /// memory.
    pub(crate) fn resolve_link(&self, id: LinkId) -> Result<Option<Arc<Link>>> {
        if let Some(link) = self.lookup_link(id) {
            return Ok(Some(link));
        }
        let Some(tuple) = self.persistence.read_tuple(id)? else {
            return Ok(None);
        };
        let Some(owner) = self.lookup_link(tuple.stream_id) else {
            debug!(link = %id, stream = %tuple.stream_id, "owner of persisted link is not loaded");
            return Ok(None);
        };
        owner.ensure_loaded()?;
        Ok(self.lookup_link(id))
    }
}

/// Counters reported by [`MessageStore::statistics_json`].
#[derive(Debug, Serialize)]
struct StoreReport {
    links: usize,
    expiry_pending: usize,
    delivery_delay_pending: usize,
    indoubt_transactions: usize,
    caches: [CacheStats; 2],
    streams: Vec<StreamReport>,
}

#[derive(Debug, Serialize)]
struct StreamReport {
    id: LinkId,
    kind: &'static str,
    stats: StatsSnapshot,
}

/// An opened message store: the link tree over a persistence tier.
pub struct MessageStore {
    ctx: Arc<StoreContext>,
    root: Arc<Link>,
}

impl MessageStore {
    /// Opens the store, rebuilding the link tree from `persistence`.
    ///
    /// Prepared transactions found in the persistence tier come back in doubt; their links
    /// rejoin them and stay in their adding or removing states until they are committed or
    /// rolled back.
    pub fn open(
        options: StoreOptions,
        persistence: Arc<dyn PersistentStore>,
        registry: ItemRegistry,
    ) -> Result<Self> {
        options.validate()?;
        let ctx = Arc::new(StoreContext::new(options, persistence, registry)?);
        let root = Link::new_root(ctx.clone());
        ctx.register_link(&root);
        let indoubt = ctx.transactions.recover_indoubt()?;
        initialize_tree(&ctx, &root)?;
        info!(indoubt, next_id = ctx.next_id.load(Ordering::SeqCst), "message store open");
        Ok(Self { ctx, root })
    }

    /// The root membership; item streams are added here.
    pub fn root(&self) -> &Arc<Link> {
        &self.root
    }

    /// Options the store was opened with.
    pub fn options(&self) -> &StoreOptions {
        &self.ctx.options
    }

    /// Starts a two-phase capable transaction.
    pub fn begin(&self) -> Transaction {
        self.ctx.transactions.begin()
    }

    /// Starts a one-phase transaction.
    pub fn auto_commit(&self) -> Transaction {
        self.ctx.transactions.auto_commit()
    }

    /// A link by id, loading its stream's children if needed.
    pub fn find_link(&self, id: LinkId) -> Result<Option<Arc<Link>>> {
        self.ctx.resolve_link(id)
    }

    /// Transactions recovered in doubt that have not completed yet.
    pub fn indoubt_transactions(&self) -> Vec<Arc<Transaction>> {
        self.ctx.transactions.indoubt()
    }

    /// Expires every link whose expiry time has passed; returns how many were removed.
    ///
    /// Each link expires under its own transaction. A link whose notification or commit fails
    /// stays registered and is retried on the next run.
    pub fn run_expiry(&self) -> Result<usize> {
        let now = self.ctx.now();
        let mut expired = 0;
        for link in self.ctx.expiry.due(now) {
            let tran = self.ctx.transactions.auto_commit();
            let done = match link.expirable_expire(&tran) {
                Ok(done) => done,
                Err(err) => {
                    warn!(link = %link.id(), error = %err, "expiry failed");
                    tran.rollback()?;
                    continue;
                }
            };
            if tran.task_count() == 0 {
                if done {
                    self.ctx.expiry.remove(link.id());
                }
                continue;
            }
            match tran.commit() {
                Ok(()) => {
                    self.ctx.expiry.remove(link.id());
                    expired += 1;
                }
                Err(err) => warn!(link = %link.id(), error = %err, "expiry commit failed"),
            }
        }
        if expired > 0 {
            debug!(expired, "expiry run complete");
        }
        Ok(expired)
    }

    /// Unlocks every link whose delivery delay has ended; returns how many were released.
    pub fn run_delivery_delay(&self) -> usize {
        let now = self.ctx.now();
        let mut released = 0;
        for link in self.ctx.delivery_delay.due(now) {
            if link.delivery_delayable_unlock(None, LockId::DELIVERY_DELAY) {
                self.ctx.delivery_delay.remove(link.id());
                released += 1;
            }
        }
        released
    }

    /// Counters of the stored and unstored discard caches.
    pub fn cache_stats(&self) -> [CacheStats; 2] {
        self.ctx.caches.stats()
    }

    fn collect_streams(link: &Arc<Link>, out: &mut Vec<StreamReport>) {
        for stream in link.stream_links() {
            if let Some(stats) = stream.statistics() {
                out.push(StreamReport {
                    id: stream.id(),
                    kind: stream.kind().tag(),
                    stats,
                });
            }
            Self::collect_streams(&stream, out);
        }
    }

    /// Store-wide counters and per-stream statistics as JSON.
    pub fn statistics_json(&self) -> Result<String> {
        let mut streams = Vec::new();
        Self::collect_streams(&self.root, &mut streams);
        let report = StoreReport {
            links: self.ctx.links.lock().len(),
            expiry_pending: self.ctx.expiry.len(),
            delivery_delay_pending: self.ctx.delivery_delay.len(),
            indoubt_transactions: self.ctx.transactions.indoubt().len(),
            caches: self.cache_stats(),
            streams,
        };
        Ok(serde_json::to_string_pretty(&report)?)
    }

    /// Text dump of the loaded tree.
    pub fn dump(&self) -> String {
        self.root.dump()
    }
}
