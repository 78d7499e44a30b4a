//! Replacement chains shadowing on-disk cells.
//!
//! Each modified slot owns one chain in the page's [`OverlayArena`]. Chains
//! are newest-first and grow only at the head; a reader holding an older
//! head keeps seeing that consistent, slightly stale value.

use crate::storage::error::{BtreeError, BtreeResult};
use bytes::Bytes;
use parking_lot::RwLock;
use std::sync::Arc;

/// A pending write to one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Update {
    Value(Bytes),
    Delete,
}

/// One record of a replacement chain.
#[derive(Debug)]
pub struct Replacement {
    value: Option<Bytes>,
    next: Option<Arc<Replacement>>,
}

impl Replacement {
    fn new(update: Update, next: Option<Arc<Replacement>>) -> Self {
        let value = match update {
            Update::Value(value) => Some(value),
            Update::Delete => None,
        };
        Self { value, next }
    }

    /// Tombstone: the record is logically deleted.
    pub fn is_deleted(&self) -> bool {
        self.value.is_none()
    }

    pub fn value(&self) -> Option<&Bytes> {
        self.value.as_ref()
    }

    /// The replacement this one superseded.
    pub fn older(&self) -> Option<&Replacement> {
        self.next.as_deref()
    }

    /// Walks the chain from this record to the oldest.
    pub fn history(&self) -> impl Iterator<Item = &Replacement> {
        std::iter::successors(Some(self), |r| r.older())
    }
}

/// Handle of a chain inside an [`OverlayArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OverlayId(pub(crate) u32);

/// Arena of replacement chains for one page. A cleared chain's handle is
/// retired and never handed out again, so a reader holding it sees `None`.
#[derive(Debug, Default)]
pub struct OverlayArena {
    heads: RwLock<Vec<Option<Arc<Replacement>>>>,
}

impl OverlayArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a new chain holding `update`.
    pub fn create(&self, update: Update) -> BtreeResult<OverlayId> {
        let mut heads = self.heads.write();
        heads.try_reserve(1).map_err(|_| BtreeError::Exhausted {
            what: "overlay chain",
        })?;
        let id = u32::try_from(heads.len()).map_err(|_| BtreeError::Exhausted {
            what: "overlay handle",
        })?;
        heads.push(Some(Arc::new(Replacement::new(update, None))));
        Ok(OverlayId(id))
    }

    /// Links `update` in front of the chain's current head.
    pub fn push(&self, id: OverlayId, update: Update) -> BtreeResult<()> {
        let mut heads = self.heads.write();
        let head = heads
            .get_mut(id.0 as usize)
            .filter(|head| head.is_some())
            .ok_or_else(|| BtreeError::InvalidOperation(format!("unknown overlay {:?}", id)))?;
        let next = head.take();
        *head = Some(Arc::new(Replacement::new(update, next)));
        Ok(())
    }

    /// Current head of a chain; `None` once the arena has been discarded.
    pub fn head(&self, id: OverlayId) -> Option<Arc<Replacement>> {
        self.heads.read().get(id.0 as usize).cloned().flatten()
    }

    /// Number of live chains.
    pub fn len(&self) -> usize {
        self.heads.read().iter().filter(|head| head.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every chain. Readers holding a head keep it alive.
    pub fn clear(&self) {
        for head in self.heads.write().iter_mut() {
            *head = None;
        }
    }
}
