use super::stat::{BtreeStats, StatisticsVisitor};
use super::walk::{PageVisitor, TreeWalker};
use crate::stats::StatsSink;
use crate::storage::buffer::{PageCache, Pin};
use crate::storage::error::{BtreeError, BtreeResult};
use crate::storage::page::{ItemValue, PageId, PageImage, PageKind};
use bytes::Bytes;
use log::{debug, trace};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeOrganization {
    Row,
    Column,
}

/// Handle on one tree living in a page cache.
pub struct Btree {
    cache: Arc<PageCache>,
    root: PageId,
    organization: TreeOrganization,
}

impl Btree {
    /// Opens the tree rooted at `root`. The root page decides whether the
    /// tree is row- or column-organised.
    pub fn open(cache: Arc<PageCache>, root: PageId) -> BtreeResult<Self> {
        let organization = {
            let pin = cache.page_in(root)?;
            match pin.kind() {
                PageKind::RowInternal | PageKind::RowLeaf => TreeOrganization::Row,
                kind if kind.is_column() => TreeOrganization::Column,
                kind => {
                    return Err(BtreeError::format(
                        root,
                        format!("{} page cannot be a tree root", kind),
                    ))
                }
            }
        };
        debug!("opened {:?} tree at page {}", organization, root);
        Ok(Self {
            cache,
            root,
            organization,
        })
    }

    pub fn root(&self) -> PageId {
        self.root
    }

    pub fn organization(&self) -> TreeOrganization {
        self.organization
    }

    pub fn cache(&self) -> &Arc<PageCache> {
        &self.cache
    }

    pub fn walker(&self) -> TreeWalker<'_> {
        TreeWalker::new(&self.cache, self.root)
    }

    pub fn walk(&self, offdup: bool, visitor: &mut dyn PageVisitor) -> BtreeResult<()> {
        self.walker().walk(None, offdup, visitor)
    }

    /// Collects statistics over the whole tree, duplicate trees included.
    pub fn stat(&self) -> BtreeResult<BtreeStats> {
        let mut stats = BtreeStats::new();
        self.walk(false, &mut StatisticsVisitor::new(&mut stats))?;
        Ok(stats)
    }

    /// Publishes tree statistics followed by the cache's counters.
    pub fn stat_into(&self, sink: &mut dyn StatsSink) -> BtreeResult<()> {
        self.stat()?.publish(sink);
        self.cache.accountant().snapshot_into(sink);
        Ok(())
    }

    /// Returns the value stored under `recno`, or `None` if the record is
    /// deleted or does not exist.
    pub fn col_get(&self, recno: u64) -> BtreeResult<Option<Bytes>> {
        if self.organization != TreeOrganization::Column {
            return Err(BtreeError::InvalidOperation(
                "row trees cannot be searched by record number".into(),
            ));
        }

        let Some(leaf) = self.search_col(recno)? else {
            return Ok(None);
        };
        let Some((slot, offset)) = leaf.locate_recno(recno) else {
            return Ok(None);
        };
        let Some(item) = leaf.view().resolve(slot, offset) else {
            return Ok(None);
        };

        match item.value {
            ItemValue::Data(data) => Ok(Some(data)),
            ItemValue::Overflow(page_id) => self.read_overflow(page_id).map(Some),
            ItemValue::Deleted => Ok(None),
            other => Err(BtreeError::format(
                leaf.id(),
                format!("unexpected item {:?} on a column leaf", other),
            )),
        }
    }

    /// Descends to the leaf covering `recno`, pinning each child before the
    /// parent is released.
    fn search_col(&self, recno: u64) -> BtreeResult<Option<Pin<'_>>> {
        let mut pin = self.cache.page_in(self.root)?;
        loop {
            let child = match pin.image() {
                PageImage::ColumnInternal(children) => {
                    let after = children.partition_point(|c| c.recno <= recno);
                    if after == 0 {
                        return Ok(None);
                    }
                    Some(children[after - 1].child)
                }
                PageImage::ColumnFixed { .. }
                | PageImage::ColumnRcc { .. }
                | PageImage::ColumnVariable { .. } => None,
                other => {
                    return Err(BtreeError::format(
                        pin.id(),
                        format!("{} page inside a column tree", other.kind()),
                    ))
                }
            };
            let Some(child) = child else {
                return Ok(Some(pin));
            };
            trace!("recno {} descends from page {} to {}", recno, pin.id(), child);
            let next = self.cache.page_in(child)?;
            pin = next;
        }
    }

    fn read_overflow(&self, page_id: PageId) -> BtreeResult<Bytes> {
        let pin = self.cache.page_in(page_id)?;
        match pin.image() {
            PageImage::Overflow(data) => Ok(data.clone()),
            other => Err(BtreeError::format(
                page_id,
                format!("expected an overflow page, found {}", other.kind()),
            )),
        }
    }
}
