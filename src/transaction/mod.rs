//! Transactions driving link verbs to completion.
//!
//! A verb on a link stages its in-memory change and enqueues a [`Task`]. Commit runs every
//! task's precommit hook, hands the resulting [`PersistOp`]s to the persistence tier, then calls
//! back into each link to finalise its state. Rollback calls the abort hooks in reverse order.

mod table;

pub use table::TransactionTable;

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::error::{Result, StoreError};
use crate::link::Link;
use crate::persistence::{PersistOp, PersistentStore};
use crate::types::TranId;

/// The state of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    /// Accepting work.
    Active,
    /// Prepared in this process; awaiting commit or rollback.
    Prepared,
    /// Prepared before a restart; awaiting commit or rollback.
    InDoubt,
    /// Committed.
    Committed,
    /// Rolled back.
    RolledBack,
}

impl TxState {
    fn name(self) -> &'static str {
        match self {
            TxState::Active => "active",
            TxState::Prepared => "prepared",
            TxState::InDoubt => "in doubt",
            TxState::Committed => "committed",
            TxState::RolledBack => "rolled back",
        }
    }
}

/// What a task asks of its link at each phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    /// Add the link.
    Add,
    /// Remove an unlocked link.
    Remove,
    /// Remove a locked link.
    RemoveLocked,
    /// Persist an in-memory lock.
    PersistLock,
    /// Release a persistent lock.
    PersistUnlock,
    /// Rewrite the link's data.
    Update,
    /// Persist the redelivered count.
    PersistRedeliveredCount,
}

/// One unit of work enqueued on a transaction.
#[derive(Clone)]
pub struct Task {
    kind: TaskKind,
    link: Arc<Link>,
}

impl Task {
    /// Creates a task for `link`.
    pub fn new(kind: TaskKind, link: Arc<Link>) -> Self {
        Self { kind, link }
    }

    /// Task kind.
    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    /// Link the task acts on.
    pub fn link(&self) -> &Arc<Link> {
        &self.link
    }

    fn pre_commit(&self, tran: &Transaction) -> Result<()> {
        match self.kind {
            TaskKind::Add => self.link.pre_commit_add(tran),
            TaskKind::Remove | TaskKind::RemoveLocked => self.link.pre_commit_remove(tran),
            TaskKind::Update => self.link.pre_commit_update(tran),
            TaskKind::PersistLock | TaskKind::PersistUnlock | TaskKind::PersistRedeliveredCount => {
                Ok(())
            }
        }
    }

    fn commit(&self, tran: &Transaction) -> Result<()> {
        match self.kind {
            TaskKind::Add => {
                self.link.commit_add(tran)?;
                self.link.persistent_representation_is_stable();
                Ok(())
            }
            TaskKind::Remove | TaskKind::RemoveLocked => self.link.commit_remove(tran),
            TaskKind::PersistLock => self.link.commit_persist_lock(tran),
            TaskKind::PersistUnlock => self.link.commit_persist_unlock(tran),
            TaskKind::Update => {
                self.link.commit_update(tran)?;
                self.link.persistent_representation_is_stable();
                Ok(())
            }
            TaskKind::PersistRedeliveredCount => Ok(()),
        }
    }

    fn post_commit(&self, tran: &Transaction) {
        match self.kind {
            TaskKind::Add => self.link.post_commit_add(tran),
            TaskKind::Remove | TaskKind::RemoveLocked => self.link.post_commit_remove(tran),
            _ => {}
        }
    }

    fn abort(&self, tran: &Transaction) -> Result<()> {
        match self.kind {
            TaskKind::Add => self.link.abort_add(tran),
            TaskKind::Remove | TaskKind::RemoveLocked => self.link.abort_remove(tran),
            TaskKind::PersistLock => self.link.abort_persist_lock(tran),
            TaskKind::PersistUnlock => self.link.abort_persist_unlock(tran),
            TaskKind::Update => self.link.abort_update(tran),
            TaskKind::PersistRedeliveredCount => Ok(()),
        }
    }

    fn post_abort(&self, tran: &Transaction) {
        match self.kind {
            TaskKind::Add => self.link.post_abort_add(tran),
            TaskKind::Remove | TaskKind::RemoveLocked => self.link.post_abort_remove(tran),
            _ => {}
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("kind", &self.kind)
            .field("link", &self.link.id())
            .finish()
    }
}

/// Notified when a transaction completes.
pub trait CompletionCallback: Send + Sync {
    /// Called before the transaction's precommit phase.
    fn before_completion(&self, _tran: &Transaction) {}

    /// Called once the outcome is final.
    fn after_completion(&self, tran: &Transaction, committed: bool);
}

struct TxInner {
    state: TxState,
    tasks: Vec<Task>,
    callbacks: Vec<Arc<dyn CompletionCallback>>,
    precommitted: bool,
}

/// A unit of work spanning any number of link verbs.
///
/// Commit and rollback take `&self` so that in-doubt transactions can be shared between the
/// recovery pass and the caller that resolves them.
pub struct Transaction {
    id: TranId,
    auto_commit: bool,
    persistence: Arc<dyn PersistentStore>,
    table: Weak<TransactionTable>,
    inner: Mutex<TxInner>,
}

impl Transaction {
    pub(crate) fn new(
        id: TranId,
        state: TxState,
        auto_commit: bool,
        persistence: Arc<dyn PersistentStore>,
        table: Weak<TransactionTable>,
    ) -> Self {
        debug!(tran = %id, ?state, auto_commit, "transaction started");
        Self {
            id,
            auto_commit,
            persistence,
            table,
            inner: Mutex::new(TxInner {
                state,
                tasks: Vec::new(),
                callbacks: Vec::new(),
                precommitted: false,
            }),
        }
    }

    /// Transaction id as persisted on tuples.
    pub fn persistent_tran_id(&self) -> TranId {
        self.id
    }

    /// Alias of [`Transaction::persistent_tran_id`].
    pub fn id(&self) -> TranId {
        self.id
    }

    /// Returns `true` for transactions that carry single internal tasks.
    pub fn is_auto_commit(&self) -> bool {
        self.auto_commit
    }

    /// Current state.
    pub fn state(&self) -> TxState {
        self.inner.lock().state
    }

    /// Number of enqueued tasks.
    pub fn task_count(&self) -> usize {
        self.inner.lock().tasks.len()
    }

    /// Fails unless the transaction still accepts work.
    pub fn ensure_active(&self) -> Result<()> {
        self.ensure_state(&[TxState::Active]).map(|_| ())
    }

    /// Enqueues `task`; only an active transaction accepts work.
    pub fn add_work(&self, task: Task) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state != TxState::Active {
            return Err(StoreError::TransactionState {
                tran: self.id,
                phase: inner.state.name(),
            });
        }
        inner.tasks.push(task);
        Ok(())
    }

    /// Enqueues work rebuilt by recovery onto an in-doubt transaction.
    pub(crate) fn add_restored_work(&self, task: Task) {
        self.inner.lock().tasks.push(task);
    }

    /// Registers a completion callback.
    pub fn register_callback(&self, callback: Arc<dyn CompletionCallback>) {
        self.inner.lock().callbacks.push(callback);
    }

    /// Marks the precommit phase as already run, as it was before a restart.
    pub fn declare_already_precommitted(&self) {
        self.inner.lock().precommitted = true;
    }

    /// Runs precommit and makes the work durable but undecided.
    pub fn prepare(&self) -> Result<()> {
        self.ensure_state(&[TxState::Active])?;
        let ops = match self.run_precommit().and_then(|_| self.collect_ops()) {
            Ok(ops) => ops,
            Err(err) => {
                self.abort_tasks();
                return Err(err);
            }
        };
        if let Err(err) = self.persistence.prepare(self.id, ops) {
            error!(tran = %self.id, error = %err, "prepare failed");
            self.abort_tasks();
            return Err(err);
        }
        self.inner.lock().state = TxState::Prepared;
        info!(tran = %self.id, "transaction prepared");
        Ok(())
    }

    /// Commits the transaction.
    ///
    /// A failed precommit or persistence write rolls the transaction back and returns the error.
    pub fn commit(&self) -> Result<()> {
        let state = self.ensure_state(&[TxState::Active, TxState::Prepared, TxState::InDoubt])?;
        if state == TxState::Active {
            let ops = match self.run_precommit().and_then(|_| self.collect_ops()) {
                Ok(ops) => ops,
                Err(err) => {
                    warn!(tran = %self.id, error = %err, "precommit failed; rolling back");
                    self.abort_tasks();
                    return Err(err);
                }
            };
            if let Err(err) = self.persistence.commit(self.id, ops) {
                error!(tran = %self.id, error = %err, "commit write failed; rolling back");
                self.abort_tasks();
                return Err(err);
            }
        } else {
            self.persistence.commit(self.id, Vec::new())?;
        }

        let tasks = self.inner.lock().tasks.clone();
        let mut first_error = None;
        for task in &tasks {
            if let Err(err) = task.commit(self) {
                error!(tran = %self.id, ?task, error = %err, "commit callback failed");
                first_error.get_or_insert(err);
            }
        }
        for task in &tasks {
            task.post_commit(self);
        }
        self.complete(TxState::Committed);
        info!(tran = %self.id, tasks = tasks.len(), "transaction committed");
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Rolls the transaction back.
    pub fn rollback(&self) -> Result<()> {
        let state = self.ensure_state(&[TxState::Active, TxState::Prepared, TxState::InDoubt])?;
        if state != TxState::Active {
            self.persistence.rollback(self.id)?;
        }
        self.abort_tasks();
        warn!(tran = %self.id, "transaction rolled back");
        Ok(())
    }

    fn ensure_state(&self, allowed: &[TxState]) -> Result<TxState> {
        let state = self.inner.lock().state;
        if allowed.contains(&state) {
            Ok(state)
        } else {
            Err(StoreError::TransactionState {
                tran: self.id,
                phase: state.name(),
            })
        }
    }

    fn run_precommit(&self) -> Result<()> {
        let callbacks = {
            let inner = self.inner.lock();
            if inner.precommitted {
                return Ok(());
            }
            inner.callbacks.clone()
        };
        for callback in &callbacks {
            callback.before_completion(self);
        }
        // Precommit hooks may enqueue further work, so walk by index.
        let mut index = 0;
        loop {
            let task = {
                let inner = self.inner.lock();
                match inner.tasks.get(index) {
                    Some(task) => task.clone(),
                    None => break,
                }
            };
            task.pre_commit(self)?;
            index += 1;
        }
        self.inner.lock().precommitted = true;
        Ok(())
    }

    fn collect_ops(&self) -> Result<Vec<PersistOp>> {
        let tasks = self.inner.lock().tasks.clone();
        let mut ops = Vec::with_capacity(tasks.len());
        for task in &tasks {
            if let Some(op) = task.link.persist_op(task.kind)? {
                ops.push(op);
            }
        }
        Ok(ops)
    }

    fn abort_tasks(&self) {
        let tasks = self.inner.lock().tasks.clone();
        for task in tasks.iter().rev() {
            if let Err(err) = task.abort(self) {
                error!(tran = %self.id, ?task, error = %err, "abort callback failed");
            }
        }
        for task in tasks.iter().rev() {
            task.post_abort(self);
        }
        self.complete(TxState::RolledBack);
    }

    fn complete(&self, outcome: TxState) {
        let callbacks = {
            let mut inner = self.inner.lock();
            inner.state = outcome;
            inner.tasks.clear();
            std::mem::take(&mut inner.callbacks)
        };
        if let Some(table) = self.table.upgrade() {
            table.forget(self.id);
        }
        for callback in callbacks {
            callback.after_completion(self, outcome == TxState::Committed);
        }
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("state", &inner.state)
            .field("tasks", &inner.tasks.len())
            .finish()
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        let pending = {
            let inner = self.inner.lock();
            inner.state == TxState::Active && !inner.tasks.is_empty()
        };
        if pending {
            warn!(tran = %self.id, "transaction dropped without commit or rollback");
            self.abort_tasks();
        }
    }
}
