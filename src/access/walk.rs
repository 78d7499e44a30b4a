//! Depth-first tree walk.
//!
//! Every child is pinned before it is descended into and unpinned as soon
//! as its subtree returns, on success or failure. The visitor sees a page
//! only after all of its children have been visited, so a reconciling
//! visitor can rely on children being finished before their parent.

use crate::storage::buffer::{PageCache, Pin};
use crate::storage::error::BtreeResult;
use crate::storage::page::{Page, PageId, PageImage, RowItem};
use log::debug;

/// Per-page work done by a walk.
pub trait PageVisitor {
    fn visit(&mut self, walker: &TreeWalker<'_>, page: &Page) -> BtreeResult<()>;
}

impl<F> PageVisitor for F
where
    F: FnMut(&TreeWalker<'_>, &Page) -> BtreeResult<()>,
{
    fn visit(&mut self, walker: &TreeWalker<'_>, page: &Page) -> BtreeResult<()> {
        self(walker, page)
    }
}

pub struct TreeWalker<'c> {
    cache: &'c PageCache,
    root: PageId,
}

impl<'c> TreeWalker<'c> {
    pub fn new(cache: &'c PageCache, root: PageId) -> Self {
        Self { cache, root }
    }

    pub fn cache(&self) -> &'c PageCache {
        self.cache
    }

    pub fn root(&self) -> PageId {
        self.root
    }

    /// Walks the subtree under `start`, or the whole tree when `start` is
    /// `None`. With `offdup` set, off-page duplicate trees hanging off row
    /// leaves are walked too. Returns the first error encountered.
    pub fn walk(
        &self,
        start: Option<&Pin<'_>>,
        offdup: bool,
        visitor: &mut dyn PageVisitor,
    ) -> BtreeResult<()> {
        match start {
            Some(pin) => self.walk_page(pin.page(), offdup, visitor),
            None => {
                let root = self.cache.page_in(self.root)?;
                self.walk_page(root.page(), offdup, visitor)
            }
        }
    }

    fn walk_page(
        &self,
        page: &Page,
        offdup: bool,
        visitor: &mut dyn PageVisitor,
    ) -> BtreeResult<()> {
        match page.image() {
            PageImage::ColumnInternal(children) => {
                for child in children {
                    self.descend(child.child, offdup, visitor)?;
                }
            }
            PageImage::DupInternal(children) | PageImage::RowInternal(children) => {
                for child in children {
                    self.descend(child.child, offdup, visitor)?;
                }
            }
            // Off-page duplicate references sort first on a row leaf.
            PageImage::RowLeaf(cells) if offdup => {
                for cell in cells {
                    let RowItem::OffPage(root) = cell.item else {
                        break;
                    };
                    self.descend(root, offdup, visitor)?;
                }
            }
            _ => {}
        }

        visitor.visit(self, page)
    }

    fn descend(
        &self,
        page_id: PageId,
        offdup: bool,
        visitor: &mut dyn PageVisitor,
    ) -> BtreeResult<()> {
        let pin = self.cache.page_in(page_id)?;
        let result = self.walk_page(pin.page(), offdup, visitor);
        if let Err(err) = &result {
            debug!("walk aborted below page {}: {}", page_id, err);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::storage::cache::CacheAccountant;
    use crate::storage::error::BtreeError;
    use crate::storage::page::{DupItem, FixCell, RowCell, RowChild, RowKey};
    use crate::storage::source::MemorySource;
    use bytes::Bytes;
    use std::sync::Arc;

    /// Records visit order, optionally failing on one page.
    #[derive(Default)]
    struct Recorder {
        order: Vec<u32>,
        fail_on: Option<u32>,
    }

    impl PageVisitor for Recorder {
        fn visit(&mut self, _walker: &TreeWalker<'_>, page: &Page) -> BtreeResult<()> {
            self.order.push(page.id().0);
            if self.fail_on == Some(page.id().0) {
                return Err(BtreeError::InvalidOperation("stop".into()));
            }
            Ok(())
        }
    }

    fn key(s: &'static str) -> Bytes {
        Bytes::from_static(s.as_bytes())
    }

    fn leaf() -> PageImage {
        PageImage::ColumnFixed {
            recno: 1,
            cells: vec![FixCell {
                deleted: false,
                data: key("v"),
            }],
        }
    }

    fn internal(children: &[u32]) -> PageImage {
        PageImage::RowInternal(
            children
                .iter()
                .map(|&c| RowChild {
                    key: key("k"),
                    child: PageId(c),
                })
                .collect(),
        )
    }

    fn row(key_text: &'static str, item: RowItem) -> RowCell {
        RowCell {
            key: RowKey::Instantiated(key(key_text)),
            item,
        }
    }

    fn cache_with(pages: &[(u32, PageImage)]) -> anyhow::Result<(PageCache, Arc<MemorySource>)> {
        let source = Arc::new(MemorySource::new());
        for (id, image) in pages {
            source.put(PageId(*id), image)?;
        }
        let config = CacheConfig::default();
        let accountant = Arc::new(CacheAccountant::create(&config)?);
        Ok((
            PageCache::new(Box::new(Arc::clone(&source)), accountant, config),
            source,
        ))
    }

    fn visit_order(cache: &PageCache, root: u32, offdup: bool) -> BtreeResult<Vec<u32>> {
        let mut recorder = Recorder::default();
        TreeWalker::new(cache, PageId(root)).walk(None, offdup, &mut recorder)?;
        Ok(recorder.order)
    }

    #[test]
    fn test_children_before_parent() -> anyhow::Result<()> {
        let (cache, _) = cache_with(&[
            (1, internal(&[2, 3])),
            (2, internal(&[4, 5])),
            (3, leaf()),
            (4, leaf()),
            (5, leaf()),
        ])?;
        assert_eq!(visit_order(&cache, 1, false)?, vec![4, 5, 2, 3, 1]);
        assert_eq!(cache.active_pins(), 0);
        assert_eq!(cache.pins_acquired(), 5);
        Ok(())
    }

    #[test]
    fn test_offpage_trees_only_when_requested() -> anyhow::Result<()> {
        let row_leaf = PageImage::RowLeaf(vec![
            row("a", RowItem::OffPage(PageId(3))),
            row("b", RowItem::Data(key("x"))),
            row("c", RowItem::OffPage(PageId(4))),
        ]);
        let dup_leaf = PageImage::DupLeaf(vec![DupItem::Dup(key("d"))]);
        let (cache, _) = cache_with(&[(1, row_leaf), (3, dup_leaf.clone()), (4, dup_leaf)])?;

        assert_eq!(visit_order(&cache, 1, false)?, vec![1]);
        // The scan stops at the first item that is not an off-page reference.
        assert_eq!(visit_order(&cache, 1, true)?, vec![3, 1]);
        assert_eq!(cache.active_pins(), 0);
        Ok(())
    }

    #[test]
    fn test_nested_offpage_tree() -> anyhow::Result<()> {
        let row_leaf = PageImage::RowLeaf(vec![row("a", RowItem::OffPage(PageId(3)))]);
        let dup_internal = PageImage::DupInternal(vec![
            RowChild {
                key: key("d1"),
                child: PageId(4),
            },
            RowChild {
                key: key("d2"),
                child: PageId(5),
            },
        ]);
        let dup_leaf = PageImage::DupLeaf(vec![DupItem::Dup(key("d"))]);
        let (cache, _) = cache_with(&[
            (1, internal(&[2])),
            (2, row_leaf),
            (3, dup_internal),
            (4, dup_leaf.clone()),
            (5, dup_leaf),
        ])?;

        assert_eq!(visit_order(&cache, 1, true)?, vec![4, 5, 3, 2, 1]);
        assert_eq!(cache.pins_acquired(), cache.pins_released());
        Ok(())
    }

    #[test]
    fn test_page_in_failure_stops_walk_and_releases_pins() -> anyhow::Result<()> {
        let (cache, source) = cache_with(&[
            (1, internal(&[2, 3, 4])),
            (2, leaf()),
            (3, internal(&[5])),
            (4, leaf()),
            (5, leaf()),
        ])?;
        source.fail_on(PageId(5));

        let mut recorder = Recorder::default();
        let result = TreeWalker::new(&cache, PageId(1)).walk(None, false, &mut recorder);

        assert!(matches!(result, Err(BtreeError::Io(_))));
        assert_eq!(recorder.order, vec![2]);
        assert_eq!(cache.pins_acquired(), cache.pins_released());
        assert!(!cache.is_resident(PageId(4)));
        Ok(())
    }

    #[test]
    fn test_visitor_failure_propagates() -> anyhow::Result<()> {
        let (cache, _) = cache_with(&[(1, internal(&[2, 3])), (2, leaf()), (3, leaf())])?;

        let mut recorder = Recorder {
            fail_on: Some(2),
            ..Recorder::default()
        };
        let result = TreeWalker::new(&cache, PageId(1)).walk(None, false, &mut recorder);

        assert!(matches!(result, Err(BtreeError::InvalidOperation(_))));
        assert_eq!(recorder.order, vec![2]);
        assert_eq!(cache.active_pins(), 0);
        Ok(())
    }

    #[test]
    fn test_walk_from_pinned_subtree() -> anyhow::Result<()> {
        let (cache, _) = cache_with(&[(1, internal(&[2])), (2, internal(&[3])), (3, leaf())])?;
        let start = cache.page_in(PageId(2))?;

        let mut recorder = Recorder::default();
        TreeWalker::new(&cache, PageId(1)).walk(Some(&start), false, &mut recorder)?;

        assert_eq!(recorder.order, vec![3, 2]);
        assert_eq!(cache.active_pins(), 1);
        drop(start);
        assert_eq!(cache.active_pins(), 0);
        Ok(())
    }

    fn reject_leaves(_walker: &TreeWalker<'_>, page: &Page) -> BtreeResult<()> {
        if page.kind().is_internal() {
            Ok(())
        } else {
            Err(BtreeError::InvalidOperation(format!("leaf {}", page.id())))
        }
    }

    #[test]
    fn test_function_visitor() -> anyhow::Result<()> {
        let (cache, _) = cache_with(&[(1, internal(&[2])), (2, leaf())])?;
        let mut visitor = reject_leaves;
        let result = TreeWalker::new(&cache, PageId(1)).walk(None, false, &mut visitor);
        assert!(matches!(result, Err(BtreeError::InvalidOperation(_))));
        assert_eq!(cache.active_pins(), 0);
        Ok(())
    }
}
