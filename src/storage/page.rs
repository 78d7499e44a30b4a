pub mod expansion;
pub mod image;
pub mod overlay;
pub mod view;

use crate::storage::error::{BtreeError, BtreeResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

pub use expansion::{ExpansionArena, ExpansionId, PendingList, RunEntry};
pub use image::{
    ColChild, DupItem, FixCell, PageImage, PageKind, RowCell, RowChild, RowItem, RowKey, RunCell,
    VarItem,
};
pub use overlay::{OverlayArena, OverlayId, Replacement, Update};
pub use view::{ItemValue, KeyMaterial, PageView, ResolvedItem};

/// On-disk location of a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PageId(pub u32);

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Slot handle value meaning "no overlay attached".
const NO_HANDLE: u32 = 0;

/// Mutable side of a page: per-slot handles into the page's overlay and
/// expansion arenas. Handles are published with release ordering after the
/// chain they name is fully linked.
#[derive(Debug)]
struct PageModify {
    handles: Box<[AtomicU32]>,
    overlays: OverlayArena,
    expansions: ExpansionArena,
    write: Mutex<()>,
}

impl PageModify {
    fn new(slots: usize) -> Self {
        Self {
            handles: (0..slots).map(|_| AtomicU32::new(NO_HANDLE)).collect(),
            overlays: OverlayArena::new(),
            expansions: ExpansionArena::new(),
            write: Mutex::new(()),
        }
    }

    fn handle(&self, slot: usize) -> Option<u32> {
        match self.handles.get(slot)?.load(Ordering::Acquire) {
            NO_HANDLE => None,
            h => Some(h - 1),
        }
    }

    fn publish(&self, slot: usize, handle: u32) {
        self.handles[slot].store(handle + 1, Ordering::Release);
    }
}

/// An in-memory page: the immutable image plus any pending modifications.
#[derive(Debug)]
pub struct Page {
    id: PageId,
    image: PageImage,
    modify: PageModify,
    footprint: u64,
}

impl Page {
    pub fn new(id: PageId, image: PageImage) -> BtreeResult<Self> {
        image.validate(id)?;
        let footprint = image.footprint();
        let modify = PageModify::new(image.slot_count());
        Ok(Self {
            id,
            image,
            modify,
            footprint,
        })
    }

    pub fn id(&self) -> PageId {
        self.id
    }

    pub fn kind(&self) -> PageKind {
        self.image.kind()
    }

    pub fn image(&self) -> &PageImage {
        &self.image
    }

    pub fn slot_count(&self) -> usize {
        self.image.slot_count()
    }

    /// Bytes charged to the cache while this page is resident.
    pub fn footprint(&self) -> u64 {
        self.footprint
    }

    pub fn view(&self) -> PageView<'_> {
        PageView::new(self)
    }

    /// Head of the replacement chain attached to `slot`, if any.
    pub fn overlay(&self, slot: usize) -> Option<Arc<Replacement>> {
        if self.kind() == PageKind::ColumnRcc {
            return None;
        }
        let handle = self.modify.handle(slot)?;
        self.modify.overlays.head(OverlayId(handle))
    }

    /// Expansion entries of a run cell, with each entry's chain head.
    pub fn expansion(&self, slot: usize) -> Vec<(u32, Arc<Replacement>)> {
        if self.kind() != PageKind::ColumnRcc {
            return Vec::new();
        }
        let Some(handle) = self.modify.handle(slot) else {
            return Vec::new();
        };
        self.modify
            .expansions
            .entries(ExpansionId(handle))
            .into_iter()
            .filter_map(|e| Some((e.offset, self.modify.overlays.head(e.overlay)?)))
            .collect()
    }

    /// Chain head for one record of a run cell.
    pub fn run_overlay(&self, slot: usize, offset: u32) -> Option<Arc<Replacement>> {
        if self.kind() != PageKind::ColumnRcc {
            return None;
        }
        let handle = self.modify.handle(slot)?;
        let overlay = self.modify.expansions.find(ExpansionId(handle), offset)?;
        self.modify.overlays.head(overlay)
    }

    /// Links a replacement at the head of `slot`'s chain.
    pub fn update(&self, slot: usize, update: Update) -> BtreeResult<()> {
        self.check_slot(slot)?;
        let replaceable = match &self.image {
            PageImage::ColumnFixed { .. } | PageImage::DupLeaf(_) => true,
            PageImage::ColumnVariable { cells, .. } => !matches!(cells[slot], VarItem::Del),
            PageImage::RowLeaf(cells) => !matches!(cells[slot].item, RowItem::OffPage(_)),
            PageImage::ColumnRcc { .. } => {
                return Err(BtreeError::InvalidOperation(
                    "run-length cells are updated per record".to_string(),
                ));
            }
            _ => false,
        };
        if !replaceable {
            return Err(BtreeError::InvalidOperation(format!(
                "slot {} of {} page {} cannot be replaced",
                slot,
                self.kind(),
                self.id
            )));
        }

        let _write = self.modify.write.lock();
        match self.modify.handle(slot) {
            Some(handle) => self.modify.overlays.push(OverlayId(handle), update),
            None => {
                let id = self.modify.overlays.create(update)?;
                self.modify.publish(slot, id.0);
                Ok(())
            }
        }
    }

    /// Links a replacement for record `offset` of the run cell in `slot`.
    pub fn update_run(&self, slot: usize, offset: u32, update: Update) -> BtreeResult<()> {
        let PageImage::ColumnRcc { cells, .. } = &self.image else {
            return Err(BtreeError::InvalidOperation(format!(
                "{} page {} has no run-length cells",
                self.kind(),
                self.id
            )));
        };
        self.check_slot(slot)?;
        if offset >= cells[slot].count {
            return Err(BtreeError::InvalidOperation(format!(
                "offset {} outside run of {} records",
                offset, cells[slot].count
            )));
        }

        let _write = self.modify.write.lock();
        let expansion = self.modify.handle(slot).map(ExpansionId);
        if let Some(existing) = expansion.and_then(|id| self.modify.expansions.find(id, offset)) {
            return self.modify.overlays.push(existing, update);
        }

        // Entry storage is allocated before the chain, so running out of
        // memory links nothing.
        match expansion {
            Some(id) => {
                self.modify.expansions.reserve(id)?;
                let overlay = self.modify.overlays.create(update)?;
                self.modify.expansions.insert(id, RunEntry { offset, overlay })
            }
            None => {
                let pending = self.modify.expansions.reserve_list()?;
                let overlay = self.modify.overlays.create(update)?;
                let id = self
                    .modify
                    .expansions
                    .install(pending, RunEntry { offset, overlay });
                self.modify.publish(slot, id.0);
                Ok(())
            }
        }
    }

    /// Forgets every pending modification once reconciliation has written
    /// them back. Arena handles are retired rather than reused, so a reader
    /// that loaded a slot's handle before the discard finds nothing instead
    /// of another slot's chain.
    pub fn discard_overlays(&self) {
        let _write = self.modify.write.lock();
        for handle in self.modify.handles.iter() {
            handle.store(NO_HANDLE, Ordering::Release);
        }
        self.modify.expansions.clear();
        self.modify.overlays.clear();
    }

    /// True while any slot has a replacement chain or run expansion that
    /// reconciliation has not yet written back.
    pub fn is_modified(&self) -> bool {
        self.modify
            .handles
            .iter()
            .any(|handle| handle.load(Ordering::Acquire) != NO_HANDLE)
    }

    /// Number of replacement chains currently attached.
    pub fn overlay_count(&self) -> usize {
        self.modify.overlays.len()
    }

    /// Maps a record number to `(slot, offset within run)` on a column leaf.
    pub fn locate_recno(&self, recno: u64) -> Option<(usize, u32)> {
        let start = self.image.start_recno()?;
        let delta = recno.checked_sub(start)?;
        match &self.image {
            PageImage::ColumnRcc { cells, .. } => {
                let mut first = 0u64;
                for (slot, cell) in cells.iter().enumerate() {
                    let count = u64::from(cell.count);
                    if delta < first + count {
                        return Some((slot, (delta - first) as u32));
                    }
                    first += count;
                }
                None
            }
            _ => {
                let slot = usize::try_from(delta).ok()?;
                (slot < self.slot_count()).then_some((slot, 0))
            }
        }
    }

    fn check_slot(&self, slot: usize) -> BtreeResult<()> {
        if slot >= self.slot_count() {
            return Err(BtreeError::InvalidOperation(format!(
                "slot {} out of range for page {} ({} slots)",
                slot,
                self.id,
                self.slot_count()
            )));
        }
        Ok(())
    }
}
