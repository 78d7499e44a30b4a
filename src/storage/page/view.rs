//! Logical content of a page.
//!
//! [`PageView`] combines a page's immutable cells with whatever replacement
//! chains and run expansions are attached right now. The item sequence is
//! lazy and single-pass: the page is live, so a second pass may see
//! different content.

use super::{
    DupItem, Page, PageId, PageImage, Replacement, RowItem, RowKey, RunCell, VarItem,
};
use bytes::Bytes;
use std::sync::Arc;

/// Current state of one logical record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemValue {
    Data(Bytes),
    Overflow(PageId),
    Dup(Bytes),
    DupOverflow(PageId),
    OffPageDup(PageId),
    Deleted,
}

/// Key of a row-leaf item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyMaterial {
    pub bytes: Bytes,
    /// `None` when the key was instantiated and the flag is lost.
    pub overflow: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedItem {
    pub slot: usize,
    /// Record number, for column leaf pages.
    pub recno: Option<u64>,
    pub key: Option<KeyMaterial>,
    pub value: ItemValue,
}

fn replaced(head: &Replacement, dup: bool) -> ItemValue {
    match head.value() {
        None => ItemValue::Deleted,
        Some(value) if dup => ItemValue::Dup(value.clone()),
        Some(value) => ItemValue::Data(value.clone()),
    }
}

#[derive(Clone, Copy)]
pub struct PageView<'p> {
    page: &'p Page,
}

impl<'p> PageView<'p> {
    pub fn new(page: &'p Page) -> Self {
        Self { page }
    }

    pub fn page(&self) -> &'p Page {
        self.page
    }

    /// Resolves record `offset` of `slot`. The offset is only meaningful for
    /// run-length cells; everywhere else it must be zero.
    pub fn resolve(&self, slot: usize, offset: u32) -> Option<ResolvedItem> {
        let page = self.page;
        let recno = page.image().start_recno();
        let (value, key) = match page.image() {
            PageImage::ColumnFixed { cells, .. } => {
                let cell = cells.get(slot)?;
                if offset != 0 {
                    return None;
                }
                let value = match page.overlay(slot) {
                    Some(head) => replaced(&head, false),
                    None if cell.deleted => ItemValue::Deleted,
                    None => ItemValue::Data(cell.data.clone()),
                };
                (value, None)
            }
            PageImage::ColumnRcc { cells, .. } => {
                let cell = cells.get(slot)?;
                if offset >= cell.count {
                    return None;
                }
                (resolve_run(cell, page.run_overlay(slot, offset)), None)
            }
            PageImage::ColumnVariable { cells, .. } => {
                let cell = cells.get(slot)?;
                if offset != 0 {
                    return None;
                }
                let value = match (cell, page.overlay(slot)) {
                    (VarItem::Del, _) => ItemValue::Deleted,
                    (_, Some(head)) => replaced(&head, false),
                    (VarItem::Data(data), None) => ItemValue::Data(data.clone()),
                    (VarItem::DataOvfl(id), None) => ItemValue::Overflow(*id),
                };
                (value, None)
            }
            PageImage::DupLeaf(items) => {
                let item = items.get(slot)?;
                if offset != 0 {
                    return None;
                }
                let value = match (item, page.overlay(slot)) {
                    (_, Some(head)) => replaced(&head, true),
                    (DupItem::Dup(data), None) => ItemValue::Dup(data.clone()),
                    (DupItem::DupOvfl(id), None) => ItemValue::DupOverflow(*id),
                };
                (value, None)
            }
            PageImage::RowLeaf(cells) => {
                let cell = cells.get(slot)?;
                if offset != 0 {
                    return None;
                }
                // Off-page references are replaced whole, never overlaid.
                let value = match (&cell.item, page.overlay(slot)) {
                    (RowItem::OffPage(root), _) => ItemValue::OffPageDup(*root),
                    (RowItem::Dup(_) | RowItem::DupOvfl(_), Some(head)) => replaced(&head, true),
                    (_, Some(head)) => replaced(&head, false),
                    (RowItem::Data(data), None) => ItemValue::Data(data.clone()),
                    (RowItem::DataOvfl(id), None) => ItemValue::Overflow(*id),
                    (RowItem::Dup(data), None) => ItemValue::Dup(data.clone()),
                    (RowItem::DupOvfl(id), None) => ItemValue::DupOverflow(*id),
                };
                let key = match &cell.key {
                    RowKey::Cell { bytes, overflow } => KeyMaterial {
                        bytes: bytes.clone(),
                        overflow: Some(*overflow),
                    },
                    RowKey::Instantiated(bytes) => KeyMaterial {
                        bytes: bytes.clone(),
                        overflow: None,
                    },
                };
                (value, Some(key))
            }
            _ => return None,
        };

        let recno = recno.and_then(|start| {
            start
                .checked_add(self.records_before(slot))?
                .checked_add(u64::from(offset))
        });
        Some(ResolvedItem {
            slot,
            recno,
            key,
            value,
        })
    }

    /// Lazily resolves every logical record in slot order. A run cell yields
    /// one item per record it represents.
    pub fn items(&self) -> Items<'p> {
        Items {
            view: *self,
            slot: 0,
            offset: 0,
            recno: self.page.image().start_recno(),
            run: None,
        }
    }

    fn records_before(&self, slot: usize) -> u64 {
        match self.page.image() {
            PageImage::ColumnRcc { cells, .. } => {
                cells[..slot].iter().map(|c| u64::from(c.count)).sum()
            }
            _ => slot as u64,
        }
    }
}

fn resolve_run(cell: &RunCell, expanded: Option<Arc<Replacement>>) -> ItemValue {
    match expanded {
        Some(head) => replaced(&head, false),
        None if cell.deleted => ItemValue::Deleted,
        None => ItemValue::Data(cell.data.clone()),
    }
}

/// Iterator returned by [`PageView::items`].
pub struct Items<'p> {
    view: PageView<'p>,
    slot: usize,
    offset: u32,
    recno: Option<u64>,
    /// Expansion snapshot of the run cell being walked.
    run: Option<Vec<(u32, Arc<Replacement>)>>,
}

impl Iterator for Items<'_> {
    type Item = ResolvedItem;

    fn next(&mut self) -> Option<ResolvedItem> {
        let page = self.view.page;
        if self.slot >= page.slot_count() {
            return None;
        }

        let item = match page.image() {
            PageImage::ColumnRcc { cells, .. } => {
                let cell = &cells[self.slot];
                let slot = self.slot;
                let run = self.run.get_or_insert_with(|| page.expansion(slot));
                let expanded = run
                    .binary_search_by_key(&self.offset, |(offset, _)| *offset)
                    .ok()
                    .map(|pos| Arc::clone(&run[pos].1));
                let item = ResolvedItem {
                    slot,
                    recno: self.recno,
                    key: None,
                    value: resolve_run(cell, expanded),
                };
                self.offset += 1;
                if self.offset >= cell.count {
                    self.slot += 1;
                    self.offset = 0;
                    self.run = None;
                }
                item
            }
            PageImage::ColumnInternal(_)
            | PageImage::DupInternal(_)
            | PageImage::RowInternal(_)
            | PageImage::Overflow(_) => return None,
            _ => {
                let mut item = self.view.resolve(self.slot, 0)?;
                item.recno = self.recno;
                self.slot += 1;
                item
            }
        };
        self.recno = self.recno.and_then(|recno| recno.checked_add(1));
        Some(item)
    }
}
