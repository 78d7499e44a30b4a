//! Per-record overlays inside run-length-compressed cells.
//!
//! A run cell stands for many identical records. When one of them is
//! modified, the cell gets an expansion list: `(offset, overlay)` pairs kept
//! sorted by offset, one pair per modified record. A record whose offset is
//! not listed still reads as the run's base value.

use super::overlay::OverlayId;
use crate::storage::error::{BtreeError, BtreeResult};
use parking_lot::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunEntry {
    pub offset: u32,
    pub overlay: OverlayId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExpansionId(pub(crate) u32);

/// Arena of expansion lists for one page. A cleared list stays retired: its
/// handle is never handed out again.
#[derive(Debug, Default)]
pub struct ExpansionArena {
    lists: RwLock<Vec<Option<Vec<RunEntry>>>>,
}

/// Storage for a new list, obtained before its first entry exists.
#[derive(Debug)]
pub struct PendingList {
    id: ExpansionId,
    list: Vec<RunEntry>,
}

impl PendingList {
    pub fn id(&self) -> ExpansionId {
        self.id
    }
}

fn exhausted() -> BtreeError {
    BtreeError::Exhausted {
        what: "run expansion",
    }
}

impl ExpansionArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates everything a new list needs. Reservations and installs
    /// must be serialised by the caller.
    pub fn reserve_list(&self) -> BtreeResult<PendingList> {
        let mut lists = self.lists.write();
        let id = u32::try_from(lists.len()).map_err(|_| exhausted())?;
        lists.try_reserve(1).map_err(|_| exhausted())?;
        let mut list = Vec::new();
        list.try_reserve(1).map_err(|_| exhausted())?;
        Ok(PendingList {
            id: ExpansionId(id),
            list,
        })
    }

    /// Links a reserved list holding `first`. Cannot fail.
    pub fn install(&self, pending: PendingList, first: RunEntry) -> ExpansionId {
        let PendingList { id, mut list } = pending;
        list.push(first);
        let mut lists = self.lists.write();
        debug_assert_eq!(lists.len(), id.0 as usize);
        lists.push(Some(list));
        id
    }

    /// Makes room for one more entry in `id`.
    pub fn reserve(&self, id: ExpansionId) -> BtreeResult<()> {
        let mut lists = self.lists.write();
        lists
            .get_mut(id.0 as usize)
            .and_then(Option::as_mut)
            .ok_or_else(|| unknown(id))?
            .try_reserve(1)
            .map_err(|_| exhausted())
    }

    /// Adds an entry for an offset not yet in the list.
    pub fn insert(&self, id: ExpansionId, entry: RunEntry) -> BtreeResult<()> {
        let mut lists = self.lists.write();
        let list = lists
            .get_mut(id.0 as usize)
            .and_then(Option::as_mut)
            .ok_or_else(|| unknown(id))?;
        match list.binary_search_by_key(&entry.offset, |e| e.offset) {
            Ok(_) => Err(BtreeError::InvalidOperation(format!(
                "offset {} already expanded",
                entry.offset
            ))),
            Err(pos) => {
                list.try_reserve(1).map_err(|_| exhausted())?;
                list.insert(pos, entry);
                Ok(())
            }
        }
    }

    pub fn find(&self, id: ExpansionId, offset: u32) -> Option<OverlayId> {
        let lists = self.lists.read();
        let list = lists.get(id.0 as usize)?.as_ref()?;
        list.binary_search_by_key(&offset, |e| e.offset)
            .ok()
            .map(|pos| list[pos].overlay)
    }

    /// Snapshot of a list in offset order.
    pub fn entries(&self, id: ExpansionId) -> Vec<RunEntry> {
        self.lists
            .read()
            .get(id.0 as usize)
            .cloned()
            .flatten()
            .unwrap_or_default()
    }

    /// Retires every list.
    pub fn clear(&self) {
        for list in self.lists.write().iter_mut() {
            *list = None;
        }
    }
}

fn unknown(id: ExpansionId) -> BtreeError {
    BtreeError::InvalidOperation(format!("unknown expansion {:?}", id))
}
