//! Contract with the durable tier.
//!
//! The link cache never performs I/O of its own. It reads tuples and data slices through
//! [`PersistentStore`] and hands the work of a transaction over as a batch of [`PersistOp`]s.

mod memory;

pub use memory::MemoryStore;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::tuple::Tuple;
use crate::types::{DataSlice, LinkId, TranId};

/// One durable change produced by a transaction task.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PersistOp {
    /// Writes a new tuple together with its data.
    Insert {
        /// Tuple to write.
        tuple: Tuple,
        /// Encoded item data.
        data: Vec<DataSlice>,
    },
    /// Deletes a tuple and its data.
    Delete {
        /// Tuple to delete.
        id: LinkId,
    },
    /// Rewrites tuple fields only (lock, redelivered count).
    UpdateTuple {
        /// New tuple contents.
        tuple: Tuple,
    },
    /// Rewrites the tuple and replaces the data.
    UpdateData {
        /// New tuple contents.
        tuple: Tuple,
        /// New encoded data.
        data: Vec<DataSlice>,
    },
}

impl PersistOp {
    /// Id of the tuple the op touches.
    pub fn id(&self) -> LinkId {
        match self {
            PersistOp::Insert { tuple, .. }
            | PersistOp::UpdateTuple { tuple }
            | PersistOp::UpdateData { tuple, .. } => tuple.id,
            PersistOp::Delete { id } => *id,
        }
    }
}

/// Durable storage of tuples and item data.
///
/// Two-phase work is expressed with [`PersistentStore::prepare`] followed by
/// [`PersistentStore::commit`] or [`PersistentStore::rollback`]; one-phase work passes its ops
/// straight to `commit`. Prepared work that survives a restart is reported as in doubt.
pub trait PersistentStore: Send + Sync {
    /// Every persisted stream tuple.
    fn read_all_streams(&self) -> Result<Vec<Tuple>>;

    /// Non-stream children of `stream`, including prepared and logically deleted ones.
    fn read_non_stream_items(&self, stream: LinkId) -> Result<Vec<Tuple>>;

    /// Encoded data of `tuple`; `None` once the record no longer exists.
    fn read_data_only(&self, tuple: &Tuple) -> Result<Option<Vec<DataSlice>>>;

    /// The tuple with `id`, if persisted.
    fn read_tuple(&self, id: LinkId) -> Result<Option<Tuple>>;

    /// Streams owning at least one child written by an in-doubt transaction.
    fn identify_streams_with_indoubt_items(&self) -> Result<Vec<LinkId>>;

    /// Transactions prepared but not completed.
    fn indoubt_transactions(&self) -> Result<Vec<TranId>>;

    /// Highest link id ever written.
    fn highest_unique_id(&self) -> Result<u64>;

    /// Highest transaction id ever written.
    fn highest_tran_id(&self) -> Result<u64>;

    /// Makes `ops` durable but undecided under `tran`.
    fn prepare(&self, tran: TranId, ops: Vec<PersistOp>) -> Result<()>;

    /// Completes `tran`: finalises prepared work and applies `ops`.
    fn commit(&self, tran: TranId, ops: Vec<PersistOp>) -> Result<()>;

    /// Discards prepared work of `tran`.
    fn rollback(&self, tran: TranId) -> Result<()>;
}
