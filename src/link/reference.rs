use std::sync::Arc;

use tracing::warn;

use super::Link;
use crate::error::{Result, StoreError};
use crate::transaction::Transaction;
use crate::types::{ItemKind, LinkId};

impl Link {
    /// Id of the referred item, for item references.
    pub fn referred_id(&self) -> Option<LinkId> {
        self.lock_state().tuple.referred_id
    }

    /// Checks that `target` names a live item link a reference may point at.
    pub(crate) fn validate_reference_target(&self, target: Option<LinkId>) -> Result<Arc<Link>> {
        let id = target.ok_or_else(|| {
            StoreError::InvalidAddOperation("item reference does not name an item".into())
        })?;
        let link = self.ctx().resolve_link(id)?.ok_or_else(|| {
            StoreError::InvalidAddOperation(format!("referred item {id} does not exist"))
        })?;
        if link.kind() != ItemKind::Item {
            return Err(StoreError::InvalidAddOperation(format!(
                "a reference may only refer to an item, not to a {:?}",
                link.kind()
            )));
        }
        Ok(link)
    }

    /// The referred item's link; a dangling target is logged and tolerated.
    fn referred_link(&self) -> Option<Arc<Link>> {
        let id = self.referred_id()?;
        match self.ctx().resolve_link(id) {
            Ok(Some(link)) if link.ref_count().is_some() => Some(link),
            Ok(_) => {
                warn!(link = %self.id(), referred = %id, "referred item no longer exists");
                None
            }
            Err(err) => {
                warn!(link = %self.id(), referred = %id, error = %err, "cannot resolve referred item");
                None
            }
        }
    }

    pub(crate) fn increment_referred(&self) -> Result<()> {
        if self.kind() != ItemKind::ItemReference {
            return Ok(());
        }
        match self.referred_link() {
            Some(target) => match target.ref_count() {
                Some(count) => count.increment(target.id()),
                None => Ok(()),
            },
            None => Ok(()),
        }
    }

    pub(crate) fn rollback_referred_increment(&self) {
        if self.kind() != ItemKind::ItemReference {
            return;
        }
        if let Some(target) = self.referred_link() {
            if let Some(count) = target.ref_count() {
                if let Err(err) = count.rollback_increment(target.id()) {
                    warn!(link = %self.id(), error = %err, "reference count rollback failed");
                }
            }
        }
    }

    pub(crate) fn decrement_referred(&self, tran: &Transaction) {
        if self.kind() != ItemKind::ItemReference {
            return;
        }
        if let Some(target) = self.referred_link() {
            if let Err(err) = target.decrement_reference_count(tran) {
                warn!(link = %self.id(), error = %err, "reference count decrement failed");
            }
        }
    }
}
