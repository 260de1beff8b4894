//! Error type shared by every store operation.

use std::io;

use thiserror::Error;

use crate::state::ItemLinkState;
use crate::types::{LinkId, LockId, TranId};

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors raised by the link cache and its collaborators.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A verb was invoked while the link was in an incompatible state.
    #[error("invalid transition: {verb} not permitted in state {state}")]
    State {
        /// State the link was in when the verb arrived.
        state: ItemLinkState,
        /// Name of the rejected verb.
        verb: &'static str,
    },
    /// The lock token supplied does not match the link's current lock.
    #[error("lock id mismatch: link holds {expected}, caller supplied {supplied}")]
    LockIdMismatch {
        /// Lock currently held on the link.
        expected: LockId,
        /// Lock supplied by the caller.
        supplied: LockId,
    },
    /// The owning stream has reached its configured depth.
    #[error("stream {stream} is full ({depth} items)")]
    StreamIsFull {
        /// Owner that refused the add.
        stream: LinkId,
        /// Depth at the time of the add.
        depth: u64,
    },
    /// The add is structurally invalid (wrong owner state, kind or storage strategy).
    #[error("invalid add operation: {0}")]
    InvalidAddOperation(String),
    /// A STORE_NEVER payload cannot fit the unstored cache.
    #[error("out of cache space: {requested} bytes requested, capacity {capacity}")]
    OutOfCacheSpace {
        /// Size of the payload being admitted.
        requested: usize,
        /// Total capacity of the cache.
        capacity: usize,
    },
    /// The verb was driven by a transaction other than the one that owns the link.
    #[error("wrong transaction {supplied:?} in state {state} (link owned by {owner:?})")]
    WrongTransaction {
        /// State of the link.
        state: ItemLinkState,
        /// Transaction presented by the caller.
        supplied: Option<TranId>,
        /// Transaction recorded on the link.
        owner: Option<TranId>,
    },
    /// An owner still has children that are not being removed under the deleting transaction.
    #[error("stream {stream} cannot be deleted: {remaining} children outstanding")]
    StreamNotEmpty {
        /// Owner being deleted.
        stream: LinkId,
        /// Children that block the delete.
        remaining: usize,
    },
    /// Reference count protocol violation.
    #[error("reference count violation on {link}: {reason}")]
    ReferenceCount {
        /// Item link whose count was touched.
        link: LinkId,
        /// What went wrong.
        reason: &'static str,
    },
    /// Internal invariant broken; not recoverable by the caller.
    #[error("severe message store error: {0}")]
    Severe(String),
    /// An item could not encode or decode its persistent data.
    #[error("persistent data encoding failed: {0}")]
    PersistentDataEncoding(String),
    /// The persistence tier failed.
    #[error("persistence failure: {0}")]
    Persistence(String),
    /// A transaction was used after it completed, or in the wrong phase.
    #[error("transaction {tran} is {phase}")]
    TransactionState {
        /// Transaction id.
        tran: TranId,
        /// Phase the transaction is in.
        phase: &'static str,
    },
    /// Invalid caller-supplied argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// JSON (de)serialisation error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub(crate) fn state(state: ItemLinkState, verb: &'static str) -> Self {
        StoreError::State { state, verb }
    }

    /// Returns `true` for the persistence and decode family that triggers diagnostic capture.
    pub fn is_severe(&self) -> bool {
        matches!(
            self,
            StoreError::Severe(_)
                | StoreError::PersistentDataEncoding(_)
                | StoreError::Persistence(_)
        )
    }
}
