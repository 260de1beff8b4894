//! Identifiers and small value types shared by every layer.

use std::fmt;

use serde::{Deserialize, Serialize};

/// One slice of an item's persistent data.
pub type DataSlice = bytes::Bytes;

/// Unique id of a link (and of the tuple that persists it).
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub struct LinkId(pub u64);

impl LinkId {
    /// Id reserved for the root membership; never persisted.
    pub const ROOT: LinkId = LinkId(0);
}

/// Persistent transaction id.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub struct TranId(pub u64);

/// Lock token held on a link.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub struct LockId(pub i64);

impl LockId {
    /// No lock held.
    pub const NONE: LockId = LockId(-1);
    /// Lock taken internally while an item expires.
    pub const EXPIRY: LockId = LockId(-2);
    /// Lock held on an item whose delivery is delayed.
    pub const DELIVERY_DELAY: LockId = LockId(-3);

    /// Returns `true` for the internal sentinel values.
    pub fn is_sentinel(self) -> bool {
        self == Self::NONE || self == Self::EXPIRY || self == Self::DELIVERY_DELAY
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for TranId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx{}", self.0)
    }
}

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            LockId::NONE => f.write_str("NO_LOCK_ID"),
            LockId::EXPIRY => f.write_str("EXPIRY_LOCK_ID"),
            LockId::DELIVERY_DELAY => f.write_str("DELIVERY_DELAY_LOCK_ID"),
            LockId(raw) => write!(f, "{raw}"),
        }
    }
}

impl From<u64> for LinkId {
    fn from(value: u64) -> Self {
        LinkId(value)
    }
}

impl From<i64> for LockId {
    fn from(value: i64) -> Self {
        LockId(value)
    }
}

/// How eagerly an item must reach the persistence tier.
///
/// Ordered from weakest to strongest; an item may never be stronger than its stream.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub enum StorageStrategy {
    /// Never written; lost when evicted from the unstored cache.
    Never = 1,
    /// Written when convenient; a failed encode degrades to "not recoverable".
    Maybe = 2,
    /// Written, but not necessarily before commit returns.
    Eventually = 3,
    /// Written as part of the commit.
    Always = 4,
}

impl fmt::Display for StorageStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StorageStrategy::Never => "STORE_NEVER",
            StorageStrategy::Maybe => "STORE_MAYBE",
            StorageStrategy::Eventually => "STORE_EVENTUALLY",
            StorageStrategy::Always => "STORE_ALWAYS",
        };
        f.write_str(name)
    }
}

/// The closed set of link kinds that make up the persisted tree.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Serialize, Deserialize)]
pub enum ItemKind {
    /// Tree root; owns item streams.
    Root,
    /// Stream owning items, item streams and reference streams.
    ItemStream,
    /// Stream owning item references.
    ReferenceStream,
    /// Leaf payload; reference counted.
    Item,
    /// Leaf that refers to an item by id.
    ItemReference,
}

impl ItemKind {
    /// Returns `true` for kinds that own children.
    pub fn is_owner(self) -> bool {
        matches!(
            self,
            ItemKind::Root | ItemKind::ItemStream | ItemKind::ReferenceStream
        )
    }

    /// Returns `true` for kinds whose payload participates in the discard cache.
    pub fn is_storage_managed(self) -> bool {
        matches!(self, ItemKind::Item | ItemKind::ItemReference)
    }

    pub(crate) fn tag(self) -> &'static str {
        match self {
            ItemKind::Root => "root",
            ItemKind::ItemStream => "item-stream",
            ItemKind::ReferenceStream => "reference-stream",
            ItemKind::Item => "item",
            ItemKind::ItemReference => "item-reference",
        }
    }
}

/// Highest permitted message priority.
pub const HIGHEST_PRIORITY: u8 = 9;
/// Lowest permitted message priority.
pub const LOWEST_PRIORITY: u8 = 0;
/// Priority used when an item does not choose one.
pub const DEFAULT_PRIORITY: u8 = 5;
