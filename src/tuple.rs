//! The persisted tuple behind each link.

use serde::{Deserialize, Serialize};

use crate::types::{ItemKind, LinkId, LockId, StorageStrategy, TranId, DEFAULT_PRIORITY};

/// The persisted representation of one link.
///
/// Everything the recovery pass needs to rebuild a link's state lives here; the item's own
/// encoded data is stored alongside it by the persistence tier.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tuple {
    /// Link id.
    pub id: LinkId,
    /// Owning stream; `LinkId::ROOT` for top-level streams.
    pub stream_id: LinkId,
    /// Link kind.
    pub kind: ItemKind,
    /// Registered item type name.
    pub type_name: String,
    /// Storage strategy fixed at add time.
    pub strategy: StorageStrategy,
    /// Delivery priority.
    pub priority: u8,
    /// Order within the owner's list.
    pub sequence: u64,
    /// Persisted lock.
    pub lock_id: LockId,
    /// Transaction that wrote the tuple and has not yet completed.
    pub tran_id: Option<TranId>,
    /// Set when a remove has been prepared but not yet completed.
    pub logically_deleted: bool,
    /// Size of the encoded data.
    pub persistent_size: usize,
    /// Absolute expiry time in milliseconds.
    pub expiry_time: Option<u64>,
    /// Absolute time until which delivery is delayed.
    pub delivery_delay_time: Option<u64>,
    /// Whether expiry skips notification.
    pub can_expire_silently: bool,
    /// Redelivery count persisted so far.
    pub redelivered_count: u32,
    /// Referred item, for item references.
    pub referred_id: Option<LinkId>,
    /// Whether the owner was spilling when this link was added.
    pub was_spilling: bool,
}

impl Tuple {
    /// Creates a tuple for a link that has not yet been initialised.
    pub fn new(id: LinkId, stream_id: LinkId, kind: ItemKind, type_name: impl Into<String>) -> Self {
        Self {
            id,
            stream_id,
            kind,
            type_name: type_name.into(),
            strategy: StorageStrategy::Always,
            priority: DEFAULT_PRIORITY,
            sequence: 0,
            lock_id: LockId::NONE,
            tran_id: None,
            logically_deleted: false,
            persistent_size: 0,
            expiry_time: None,
            delivery_delay_time: None,
            can_expire_silently: false,
            redelivered_count: 0,
            referred_id: None,
            was_spilling: false,
        }
    }

    /// Returns `true` when the tuple is ever written.
    pub fn is_persisted(&self) -> bool {
        self.strategy != StorageStrategy::Never
    }
}
