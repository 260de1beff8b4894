use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::info;

use super::{Transaction, TxState};
use crate::error::Result;
use crate::persistence::PersistentStore;
use crate::types::TranId;

/// Hands out transaction ids and resolves persisted ids to in-doubt transactions.
pub struct TransactionTable {
    persistence: Arc<dyn PersistentStore>,
    next_tran: AtomicU64,
    indoubt: Mutex<FxHashMap<TranId, Arc<Transaction>>>,
}

impl TransactionTable {
    /// Creates a table whose ids continue after the highest id the persistence tier has seen.
    pub fn new(persistence: Arc<dyn PersistentStore>) -> Result<Arc<Self>> {
        let next = persistence.highest_tran_id()? + 1;
        Ok(Arc::new(Self {
            persistence,
            next_tran: AtomicU64::new(next),
            indoubt: Mutex::new(FxHashMap::default()),
        }))
    }

    /// Starts a transaction.
    pub fn begin(self: &Arc<Self>) -> Transaction {
        self.create(false)
    }

    /// Starts an auto-commit transaction.
    pub fn auto_commit(self: &Arc<Self>) -> Transaction {
        self.create(true)
    }

    fn create(self: &Arc<Self>, auto_commit: bool) -> Transaction {
        let id = TranId(self.next_tran.fetch_add(1, Ordering::SeqCst));
        Transaction::new(
            id,
            TxState::Active,
            auto_commit,
            self.persistence.clone(),
            Arc::downgrade(self),
        )
    }

    /// Registers every transaction the persistence tier reports as in doubt.
    pub(crate) fn recover_indoubt(self: &Arc<Self>) -> Result<usize> {
        let ids = self.persistence.indoubt_transactions()?;
        let mut indoubt = self.indoubt.lock();
        for id in &ids {
            indoubt.entry(*id).or_insert_with(|| {
                Arc::new(Transaction::new(
                    *id,
                    TxState::InDoubt,
                    false,
                    self.persistence.clone(),
                    Arc::downgrade(self),
                ))
            });
        }
        if !ids.is_empty() {
            info!(count = ids.len(), "in-doubt transactions recovered");
        }
        Ok(ids.len())
    }

    /// The live in-doubt transaction persisted as `id`, if any.
    pub fn lookup(&self, id: TranId) -> Option<Arc<Transaction>> {
        self.indoubt.lock().get(&id).cloned()
    }

    /// In-doubt transactions still awaiting an outcome, by id.
    pub fn indoubt(&self) -> Vec<Arc<Transaction>> {
        let mut out: Vec<Arc<Transaction>> = self.indoubt.lock().values().cloned().collect();
        out.sort_by_key(|t| t.id());
        out
    }

    pub(super) fn forget(&self, id: TranId) {
        self.indoubt.lock().remove(&id);
    }
}
