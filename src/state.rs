//! Lifecycle states of a link.

use std::fmt;

use serde::Serialize;

use crate::stats::Bucket;

/// Transactional lifecycle state of a link.
///
/// Links are created `NotStored`, move through the verbs on [`crate::Link`], and end
/// `NotStored` again once removed or rolled back.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize)]
pub enum ItemLinkState {
    /// Not part of the store.
    NotStored,
    /// Being added under a transaction, locked once committed.
    AddingLocked,
    /// Being added under a transaction, available once committed.
    AddingUnlocked,
    /// Committed and free for consumers.
    Available,
    /// Locked in memory by a consumer.
    Locked,
    /// Locked internally while it expires.
    LockedForExpiry,
    /// Lock persisted to the store.
    PersistentlyLocked,
    /// Lock being persisted under a transaction.
    PersistingLock,
    /// Persistent lock being released under a transaction.
    UnlockingPersistentlyLocked,
    /// Data being updated under a transaction.
    UpdatingData,
    /// Being removed without a lock.
    RemovingWithoutLock,
    /// Being removed under an in-memory lock.
    RemovingLocked,
    /// Being removed under a persistent lock.
    RemovingPersistentlyLocked,
    /// Being removed because it expired.
    RemovingExpiring,
}

impl ItemLinkState {
    /// Returns `true` while an add is pending.
    pub fn is_adding(self) -> bool {
        matches!(self, Self::AddingLocked | Self::AddingUnlocked)
    }

    /// Returns `true` for any locked state.
    pub fn is_locked(self) -> bool {
        matches!(
            self,
            Self::Locked
                | Self::LockedForExpiry
                | Self::PersistentlyLocked
                | Self::PersistingLock
                | Self::UnlockingPersistentlyLocked
        )
    }

    /// Returns `true` while a remove is pending.
    pub fn is_removing(self) -> bool {
        matches!(
            self,
            Self::RemovingExpiring
                | Self::RemovingLocked
                | Self::RemovingPersistentlyLocked
                | Self::RemovingWithoutLock
        )
    }

    /// Statistics bucket that counts a link in this state, if any.
    pub fn bucket(self) -> Option<Bucket> {
        match self {
            Self::NotStored => None,
            Self::AddingLocked | Self::AddingUnlocked => Some(Bucket::Adding),
            Self::Available => Some(Bucket::Available),
            Self::Locked
            | Self::PersistentlyLocked
            | Self::PersistingLock
            | Self::UnlockingPersistentlyLocked => Some(Bucket::Locked),
            Self::LockedForExpiry => Some(Bucket::Expiring),
            Self::UpdatingData => Some(Bucket::Updating),
            Self::RemovingWithoutLock
            | Self::RemovingLocked
            | Self::RemovingPersistentlyLocked
            | Self::RemovingExpiring => Some(Bucket::Removing),
        }
    }
}

impl fmt::Display for ItemLinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NotStored => "NotStored",
            Self::AddingLocked => "AddingLocked",
            Self::AddingUnlocked => "AddingUnlocked",
            Self::Available => "Available",
            Self::Locked => "Locked",
            Self::LockedForExpiry => "LockedForExpiry",
            Self::PersistentlyLocked => "PersistentlyLocked",
            Self::PersistingLock => "PersistingLock",
            Self::UnlockingPersistentlyLocked => "UnlockingPersistentlyLocked",
            Self::UpdatingData => "UpdatingData",
            Self::RemovingWithoutLock => "RemovingWithoutLock",
            Self::RemovingLocked => "RemovingLocked",
            Self::RemovingPersistentlyLocked => "RemovingPersistentlyLocked",
            Self::RemovingExpiring => "RemovingExpiring",
        };
        f.write_str(name)
    }
}
