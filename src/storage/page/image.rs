//! Immutable, on-disk-derived content of a page.
//!
//! A [`PageImage`] is what the page-in collaborator hands to the cache. Each
//! page kind has its own cell type, so a cell that is illegal for a page kind
//! cannot be represented at all.

use super::PageId;
use crate::storage::error::{BtreeError, BtreeResult};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::mem::size_of;

/// Per-page bookkeeping charged to the cache in addition to cell bytes.
const PAGE_OVERHEAD: u64 = 64;

/// The nine kinds of page that make up a tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PageKind {
    ColumnFixed,
    ColumnInternal,
    ColumnRcc,
    ColumnVariable,
    DupInternal,
    DupLeaf,
    Overflow,
    RowInternal,
    RowLeaf,
}

impl PageKind {
    pub fn is_internal(self) -> bool {
        matches!(
            self,
            PageKind::ColumnInternal | PageKind::DupInternal | PageKind::RowInternal
        )
    }

    pub fn is_column(self) -> bool {
        matches!(
            self,
            PageKind::ColumnFixed
                | PageKind::ColumnInternal
                | PageKind::ColumnRcc
                | PageKind::ColumnVariable
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            PageKind::ColumnFixed => "column-fixed",
            PageKind::ColumnInternal => "column-internal",
            PageKind::ColumnRcc => "column-rcc",
            PageKind::ColumnVariable => "column-variable",
            PageKind::DupInternal => "dup-internal",
            PageKind::DupLeaf => "dup-leaf",
            PageKind::Overflow => "overflow",
            PageKind::RowInternal => "row-internal",
            PageKind::RowLeaf => "row-leaf",
        }
    }
}

impl fmt::Display for PageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Fixed-length column cell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixCell {
    pub deleted: bool,
    pub data: Bytes,
}

/// Run-length-compressed column cell standing for `count` identical records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCell {
    pub count: u32,
    pub deleted: bool,
    pub data: Bytes,
}

/// Variable-length column item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum VarItem {
    Data(Bytes),
    DataOvfl(PageId),
    /// Deletion marker; never overlaid.
    Del,
}

/// Item on a duplicate leaf page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DupItem {
    Dup(Bytes),
    DupOvfl(PageId),
}

/// Data item on a row-store leaf page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RowItem {
    Data(Bytes),
    DataOvfl(PageId),
    Dup(Bytes),
    DupOvfl(PageId),
    /// Root of an off-page duplicate tree.
    OffPage(PageId),
}

/// Key of a row-store leaf slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RowKey {
    /// Key still described by its cell; the overflow flag is known.
    Cell { bytes: Bytes, overflow: bool },
    /// Key already instantiated for search; whether it came from an
    /// overflow item is no longer known.
    Instantiated(Bytes),
}

impl RowKey {
    pub fn bytes(&self) -> &Bytes {
        match self {
            RowKey::Cell { bytes, .. } | RowKey::Instantiated(bytes) => bytes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowCell {
    pub key: RowKey,
    pub item: RowItem,
}

/// Column-internal entry: the subtree holding records from `recno` on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColChild {
    pub recno: u64,
    pub child: PageId,
}

/// Row or duplicate internal entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowChild {
    pub key: Bytes,
    pub child: PageId,
}

/// Decoded on-disk content of one page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PageImage {
    ColumnFixed { recno: u64, cells: Vec<FixCell> },
    ColumnInternal(Vec<ColChild>),
    ColumnRcc { recno: u64, cells: Vec<RunCell> },
    ColumnVariable { recno: u64, cells: Vec<VarItem> },
    DupInternal(Vec<RowChild>),
    DupLeaf(Vec<DupItem>),
    Overflow(Bytes),
    RowInternal(Vec<RowChild>),
    RowLeaf(Vec<RowCell>),
}

impl PageImage {
    pub fn kind(&self) -> PageKind {
        match self {
            PageImage::ColumnFixed { .. } => PageKind::ColumnFixed,
            PageImage::ColumnInternal(_) => PageKind::ColumnInternal,
            PageImage::ColumnRcc { .. } => PageKind::ColumnRcc,
            PageImage::ColumnVariable { .. } => PageKind::ColumnVariable,
            PageImage::DupInternal(_) => PageKind::DupInternal,
            PageImage::DupLeaf(_) => PageKind::DupLeaf,
            PageImage::Overflow(_) => PageKind::Overflow,
            PageImage::RowInternal(_) => PageKind::RowInternal,
            PageImage::RowLeaf(_) => PageKind::RowLeaf,
        }
    }

    /// Number of index entries. An overflow page has none.
    pub fn slot_count(&self) -> usize {
        match self {
            PageImage::ColumnFixed { cells, .. } => cells.len(),
            PageImage::ColumnInternal(children) => children.len(),
            PageImage::ColumnRcc { cells, .. } => cells.len(),
            PageImage::ColumnVariable { cells, .. } => cells.len(),
            PageImage::DupInternal(children) | PageImage::RowInternal(children) => {
                children.len()
            }
            PageImage::DupLeaf(items) => items.len(),
            PageImage::Overflow(_) => 0,
            PageImage::RowLeaf(cells) => cells.len(),
        }
    }

    /// First record number held by a column leaf page.
    pub fn start_recno(&self) -> Option<u64> {
        match self {
            PageImage::ColumnFixed { recno, .. }
            | PageImage::ColumnRcc { recno, .. }
            | PageImage::ColumnVariable { recno, .. } => Some(*recno),
            _ => None,
        }
    }

    /// Approximate in-memory size charged to the cache.
    pub fn footprint(&self) -> u64 {
        let cells: usize = match self {
            PageImage::ColumnFixed { cells, .. } => cells
                .iter()
                .map(|c| size_of::<FixCell>() + c.data.len())
                .sum(),
            PageImage::ColumnInternal(children) => children.len() * size_of::<ColChild>(),
            PageImage::ColumnRcc { cells, .. } => cells
                .iter()
                .map(|c| size_of::<RunCell>() + c.data.len())
                .sum(),
            PageImage::ColumnVariable { cells, .. } => cells
                .iter()
                .map(|c| match c {
                    VarItem::Data(data) => size_of::<VarItem>() + data.len(),
                    _ => size_of::<VarItem>(),
                })
                .sum(),
            PageImage::DupInternal(children) | PageImage::RowInternal(children) => children
                .iter()
                .map(|c| size_of::<RowChild>() + c.key.len())
                .sum(),
            PageImage::DupLeaf(items) => items
                .iter()
                .map(|i| match i {
                    DupItem::Dup(data) => size_of::<DupItem>() + data.len(),
                    DupItem::DupOvfl(_) => size_of::<DupItem>(),
                })
                .sum(),
            PageImage::Overflow(data) => data.len(),
            PageImage::RowLeaf(cells) => cells
                .iter()
                .map(|c| {
                    let data = match &c.item {
                        RowItem::Data(data) | RowItem::Dup(data) => data.len(),
                        _ => 0,
                    };
                    size_of::<RowCell>() + c.key.bytes().len() + data
                })
                .sum(),
        };
        PAGE_OVERHEAD + cells as u64
    }

    /// Rejects images no page of this kind may hold.
    pub fn validate(&self, page_id: PageId) -> BtreeResult<()> {
        match self {
            PageImage::ColumnInternal(children) => {
                if children.is_empty() {
                    return Err(BtreeError::format(page_id, "internal page has no children"));
                }
                if children.windows(2).any(|w| w[0].recno >= w[1].recno) {
                    return Err(BtreeError::format(
                        page_id,
                        "column-internal record numbers out of order",
                    ));
                }
            }
            PageImage::DupInternal(children) | PageImage::RowInternal(children) => {
                if children.is_empty() {
                    return Err(BtreeError::format(page_id, "internal page has no children"));
                }
            }
            PageImage::ColumnRcc { cells, .. } => {
                if let Some(slot) = cells.iter().position(|c| c.count == 0) {
                    return Err(BtreeError::format(
                        page_id,
                        format!("run-length cell {} has a zero repeat count", slot),
                    ));
                }
            }
            _ => {}
        }
        if let Some(recno) = self.start_recno() {
            let records = match self {
                PageImage::ColumnRcc { cells, .. } => {
                    cells.iter().map(|c| u64::from(c.count)).sum::<u64>()
                }
                _ => self.slot_count() as u64,
            };
            // One past the last record must still be a record number.
            if recno.checked_add(records).is_none() {
                return Err(BtreeError::format(
                    page_id,
                    format!(
                        "{} records starting at {} overflow the record space",
                        records, recno
                    ),
                ));
            }
        }
        Ok(())
    }

    pub fn encode(&self) -> BtreeResult<Vec<u8>> {
        bincode::serialize(self).map_err(|e| BtreeError::InvalidOperation(e.to_string()))
    }

    pub fn decode(page_id: PageId, data: &[u8]) -> BtreeResult<Self> {
        let image: PageImage =
            bincode::deserialize(data).map_err(|e| BtreeError::format(page_id, e.to_string()))?;
        image.validate(page_id)?;
        Ok(image)
    }
}
