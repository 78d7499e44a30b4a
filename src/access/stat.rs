//! Tree statistics.
//!
//! [`StatisticsVisitor`] counts pages by kind and items by state over a whole
//! tree, nested off-page duplicate trees included. It never modifies a page
//! and fails only when descending into an off-page tree fails.
//!
//! Two known skews are kept as-is because they are observable:
//!
//! - A run-length cell is counted in bulk from its base cell, and then every
//!   expansion entry is counted again on top, so a modified record inside a
//!   run is counted twice.
//! - Column-variable and duplicate leaves count a deletion marker as deleted
//!   regardless of any overlay; row leaves have no deletion marker and skip a
//!   tombstoned item (and its key) without counting it as deleted.

use super::walk::{PageVisitor, TreeWalker};
use crate::stats::StatsSink;
use crate::storage::error::BtreeResult;
use crate::storage::page::{DupItem, Page, PageImage, RowItem, RowKey, VarItem};
use serde::Serialize;

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct BtreeStats {
    pub page_col_fix: u64,
    pub page_col_internal: u64,
    pub page_col_rcc: u64,
    pub page_col_variable: u64,
    pub page_dup_internal: u64,
    pub page_dup_leaf: u64,
    pub page_overflow: u64,
    pub page_row_internal: u64,
    pub page_row_leaf: u64,
    pub item_col_deleted: u64,
    pub item_total_data: u64,
    pub item_data_ovfl: u64,
    pub item_dup_data: u64,
    pub item_key_ovfl: u64,
    pub item_total_key: u64,
    pub dup_tree: u64,
}

impl BtreeStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes every counter into `sink` under its field name.
    pub fn publish(&self, sink: &mut dyn StatsSink) {
        sink.set("page_col_fix", self.page_col_fix);
        sink.set("page_col_internal", self.page_col_internal);
        sink.set("page_col_rcc", self.page_col_rcc);
        sink.set("page_col_variable", self.page_col_variable);
        sink.set("page_dup_internal", self.page_dup_internal);
        sink.set("page_dup_leaf", self.page_dup_leaf);
        sink.set("page_overflow", self.page_overflow);
        sink.set("page_row_internal", self.page_row_internal);
        sink.set("page_row_leaf", self.page_row_leaf);
        sink.set("item_col_deleted", self.item_col_deleted);
        sink.set("item_total_data", self.item_total_data);
        sink.set("item_data_ovfl", self.item_data_ovfl);
        sink.set("item_dup_data", self.item_dup_data);
        sink.set("item_key_ovfl", self.item_key_ovfl);
        sink.set("item_total_key", self.item_total_key);
        sink.set("dup_tree", self.dup_tree);
    }
}

/// Accumulates [`BtreeStats`] for every page it visits.
pub struct StatisticsVisitor<'s> {
    stats: &'s mut BtreeStats,
}

impl<'s> StatisticsVisitor<'s> {
    pub fn new(stats: &'s mut BtreeStats) -> Self {
        Self { stats }
    }

    fn deleted_or_data(&mut self, deleted: bool, n: u64) {
        if deleted {
            self.stats.item_col_deleted += n;
        } else {
            self.stats.item_total_data += n;
        }
    }

    fn col_fix(&mut self, page: &Page, deleted: impl Iterator<Item = bool>) {
        for (slot, on_disk) in deleted.enumerate() {
            let deleted = match page.overlay(slot) {
                Some(head) => head.is_deleted(),
                None => on_disk,
            };
            self.deleted_or_data(deleted, 1);
        }
    }

    fn col_rcc(&mut self, page: &Page) {
        let PageImage::ColumnRcc { cells, .. } = page.image() else {
            return;
        };
        for (slot, cell) in cells.iter().enumerate() {
            self.deleted_or_data(cell.deleted, u64::from(cell.count));

            // Corrections are added on top of the bulk count; a record that
            // was modified is counted by both.
            for (_, head) in page.expansion(slot) {
                self.deleted_or_data(head.is_deleted(), 1);
            }
        }
    }

    fn col_var(&mut self, page: &Page, cells: &[VarItem]) {
        for (slot, cell) in cells.iter().enumerate() {
            let ovfl = match cell {
                VarItem::Del => {
                    self.stats.item_col_deleted += 1;
                    continue;
                }
                VarItem::Data(_) => false,
                VarItem::DataOvfl(_) => true,
            };
            if page.overlay(slot).is_some_and(|head| head.is_deleted()) {
                continue;
            }
            if ovfl {
                self.stats.item_data_ovfl += 1;
            }
            self.stats.item_total_data += 1;
        }
    }

    fn dup_leaf(&mut self, page: &Page, items: &[DupItem]) {
        for (slot, item) in items.iter().enumerate() {
            if page.overlay(slot).is_some_and(|head| head.is_deleted()) {
                continue;
            }
            if let DupItem::DupOvfl(_) = item {
                self.stats.item_data_ovfl += 1;
            }
            self.stats.item_dup_data += 1;
            self.stats.item_total_data += 1;
        }
    }

    fn row_leaf(&mut self, walker: &TreeWalker<'_>, page: &Page) -> BtreeResult<()> {
        let PageImage::RowLeaf(cells) = page.image() else {
            return Ok(());
        };
        for (slot, cell) in cells.iter().enumerate() {
            match &cell.item {
                RowItem::OffPage(root) => {
                    // Statistics are cumulative across nested duplicate trees.
                    let pin = walker.cache().page_in(*root)?;
                    walker.walk(Some(&pin), false, self)?;
                    self.stats.dup_tree += 1;
                }
                item => {
                    let live = match page.overlay(slot) {
                        None => true,
                        Some(head) => !head.is_deleted(),
                    };
                    if !live {
                        continue;
                    }
                    match item {
                        RowItem::DataOvfl(_) => self.stats.item_data_ovfl += 1,
                        RowItem::Dup(_) => self.stats.item_dup_data += 1,
                        RowItem::DupOvfl(_) => {
                            self.stats.item_dup_data += 1;
                            self.stats.item_data_ovfl += 1;
                        }
                        _ => {}
                    }
                    self.stats.item_total_data += 1;
                }
            }

            match &cell.key {
                RowKey::Cell { overflow, .. } => {
                    if *overflow {
                        self.stats.item_key_ovfl += 1;
                    }
                    self.stats.item_total_key += 1;
                }
                // Instantiated keys no longer say whether they overflowed.
                RowKey::Instantiated(_) => self.stats.item_total_key += 1,
            }
        }
        Ok(())
    }
}

impl PageVisitor for StatisticsVisitor<'_> {
    fn visit(&mut self, walker: &TreeWalker<'_>, page: &Page) -> BtreeResult<()> {
        match page.image() {
            PageImage::ColumnFixed { cells, .. } => {
                self.stats.page_col_fix += 1;
                self.col_fix(page, cells.iter().map(|c| c.deleted));
            }
            PageImage::ColumnInternal(_) => self.stats.page_col_internal += 1,
            PageImage::ColumnRcc { .. } => {
                self.stats.page_col_rcc += 1;
                self.col_rcc(page);
            }
            PageImage::ColumnVariable { cells, .. } => {
                self.stats.page_col_variable += 1;
                self.col_var(page, cells);
            }
            PageImage::DupInternal(_) => self.stats.page_dup_internal += 1,
            PageImage::DupLeaf(items) => {
                self.stats.page_dup_leaf += 1;
                self.dup_leaf(page, items);
            }
            PageImage::Overflow(_) => self.stats.page_overflow += 1,
            PageImage::RowInternal(_) => self.stats.page_row_internal += 1,
            PageImage::RowLeaf(_) => {
                self.stats.page_row_leaf += 1;
                self.row_leaf(walker, page)?;
            }
        }
        Ok(())
    }
}
