use btcore::access::{Btree, PageVisitor, TreeWalker};
use btcore::storage::page::{
    ColChild, DupItem, FixCell, ItemValue, RowCell, RowChild, RowItem, RowKey, RunCell, VarItem,
};
use btcore::storage::{
    CacheAccountant, FileSource, MemorySource, Page, PageCache, PageId, PageImage, PageKind,
    PageSource, Update,
};
use btcore::{BtreeError, BtreeResult, CacheConfig};
use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A column tree plus the value every record number should have.
struct ColumnTree {
    pages: Vec<(PageId, PageImage)>,
    leaves: Vec<PageId>,
    records: Vec<Option<Bytes>>,
    overflow_items: u64,
}

impl ColumnTree {
    fn random(seed: u64, leaves: usize) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut pages = Vec::new();
        let mut children = Vec::new();
        let mut leaf_ids = Vec::new();
        let mut records: Vec<Option<Bytes>> = Vec::new();
        let mut overflow_items = 0;
        let mut next_id = 2u32;

        for _ in 0..leaves {
            let leaf_id = PageId(next_id);
            next_id += 1;
            let recno = records.len() as u64 + 1;
            children.push(ColChild {
                recno,
                child: leaf_id,
            });

            let image = match rng.gen_range(0..3) {
                0 => {
                    let cells = (0..rng.gen_range(1..=8))
                        .map(|_| {
                            let data = Bytes::from(format!("r{}", records.len() + 1));
                            let deleted = rng.gen_bool(0.2);
                            records.push((!deleted).then(|| data.clone()));
                            FixCell { deleted, data }
                        })
                        .collect();
                    PageImage::ColumnFixed { recno, cells }
                }
                1 => {
                    let mut cells = Vec::new();
                    for _ in 0..rng.gen_range(1..=8) {
                        let data = Bytes::from(format!("r{}", records.len() + 1));
                        match rng.gen_range(0..5) {
                            0 => {
                                records.push(None);
                                cells.push(VarItem::Del);
                            }
                            1 => {
                                let ovfl = PageId(next_id);
                                next_id += 1;
                                pages.push((ovfl, PageImage::Overflow(data.clone())));
                                overflow_items += 1;
                                records.push(Some(data));
                                cells.push(VarItem::DataOvfl(ovfl));
                            }
                            _ => {
                                records.push(Some(data.clone()));
                                cells.push(VarItem::Data(data));
                            }
                        }
                    }
                    PageImage::ColumnVariable { recno, cells }
                }
                _ => {
                    let cells = (0..rng.gen_range(1..=4))
                        .map(|run| {
                            let count = rng.gen_range(1..=5u32);
                            let deleted = rng.gen_bool(0.2);
                            let data = Bytes::from(format!("run{}@{}", run, recno));
                            for _ in 0..count {
                                records.push((!deleted).then(|| data.clone()));
                            }
                            RunCell {
                                count,
                                deleted,
                                data,
                            }
                        })
                        .collect();
                    PageImage::ColumnRcc { recno, cells }
                }
            };
            pages.push((leaf_id, image));
            leaf_ids.push(leaf_id);
        }

        pages.push((PageId(1), PageImage::ColumnInternal(children)));
        Self {
            pages,
            leaves: leaf_ids,
            records,
            overflow_items,
        }
    }

    fn live(&self) -> u64 {
        self.records.iter().filter(|r| r.is_some()).count() as u64
    }

    fn deleted(&self) -> u64 {
        self.records.len() as u64 - self.live()
    }

    fn memory_source(&self) -> anyhow::Result<MemorySource> {
        let source = MemorySource::new();
        for (id, image) in &self.pages {
            source.put(*id, image)?;
        }
        Ok(source)
    }
}

fn open_tree(source: impl PageSource + 'static, config: CacheConfig) -> anyhow::Result<Btree> {
    let accountant = Arc::new(CacheAccountant::create(&config)?);
    let cache = Arc::new(PageCache::new(Box::new(source), accountant, config));
    Ok(Btree::open(cache, PageId(1))?)
}

fn check_records(tree: &Btree, expected: &[Option<Bytes>]) -> anyhow::Result<()> {
    for (i, value) in expected.iter().enumerate() {
        let recno = i as u64 + 1;
        assert_eq!(&tree.col_get(recno)?, value, "record {}", recno);
    }
    assert_eq!(tree.col_get(expected.len() as u64 + 1)?, None);
    Ok(())
}

#[test]
fn test_random_column_trees() -> anyhow::Result<()> {
    init_logging();
    for seed in 0..8 {
        let shape = ColumnTree::random(seed, 12);
        let tree = open_tree(shape.memory_source()?, CacheConfig::default())?;

        check_records(&tree, &shape.records)?;

        let stats = tree.stat()?;
        assert_eq!(stats.page_col_internal, 1);
        assert_eq!(
            stats.page_col_fix + stats.page_col_variable + stats.page_col_rcc,
            shape.leaves.len() as u64
        );
        // Overflow pages hang off items, not the tree.
        assert_eq!(stats.page_overflow, 0);
        assert_eq!(stats.item_total_data, shape.live());
        assert_eq!(stats.item_col_deleted, shape.deleted());
        assert_eq!(stats.item_data_ovfl, shape.overflow_items);
        assert_eq!(tree.cache().active_pins(), 0);
    }
    Ok(())
}

/// Tombstones every third live record, tallying the deletions by leaf kind.
#[derive(Default)]
struct ThirdDeleter {
    deleted: Vec<u64>,
    by_kind: BTreeMap<&'static str, u64>,
}

impl PageVisitor for ThirdDeleter {
    fn visit(&mut self, _walker: &TreeWalker<'_>, page: &Page) -> BtreeResult<()> {
        if page.kind().is_internal() {
            return Ok(());
        }
        let targets: Vec<u64> = page
            .view()
            .items()
            .filter(|item| item.value != ItemValue::Deleted)
            .filter_map(|item| item.recno)
            .filter(|recno| recno % 3 == 0)
            .collect();

        for recno in targets {
            let Some((slot, offset)) = page.locate_recno(recno) else {
                continue;
            };
            if page.kind() == PageKind::ColumnRcc {
                page.update_run(slot, offset, Update::Delete)?;
            } else {
                page.update(slot, Update::Delete)?;
            }
            self.deleted.push(recno);
            *self.by_kind.entry(page.kind().name()).or_default() += 1;
        }
        Ok(())
    }
}

#[test]
fn test_tombstones_seen_by_lookups_and_stats() -> anyhow::Result<()> {
    init_logging();
    let shape = ColumnTree::random(42, 16);
    let tree = open_tree(shape.memory_source()?, CacheConfig::default())?;

    let mut deleter = ThirdDeleter::default();
    tree.walk(false, &mut deleter)?;
    assert!(!deleter.deleted.is_empty());

    let mut expected = shape.records.clone();
    for recno in &deleter.deleted {
        expected[*recno as usize - 1] = None;
    }
    check_records(&tree, &expected)?;

    let count = |kind: PageKind| deleter.by_kind.get(kind.name()).copied().unwrap_or(0);
    let fixed = count(PageKind::ColumnFixed);
    let var = count(PageKind::ColumnVariable);
    let runs = count(PageKind::ColumnRcc);

    let stats = tree.stat()?;
    // Fixed cells switch from data to deleted. Variable items are skipped.
    // Run records keep their bulk count and gain a deleted correction.
    assert_eq!(stats.item_total_data, shape.live() - fixed - var);
    assert_eq!(stats.item_col_deleted, shape.deleted() + fixed + runs);
    Ok(())
}

#[test]
fn test_file_backed_tree() -> anyhow::Result<()> {
    init_logging();
    let dir = tempfile::tempdir()?;
    let config = CacheConfig::default();
    let shape = ColumnTree::random(3, 10);

    let source = FileSource::create(&dir.path().join("tree.db"), &config)?;
    for (id, image) in &shape.pages {
        source.write_image(*id, image)?;
    }
    drop(source);

    let source = FileSource::open(&dir.path().join("tree.db"), &config)?;
    let tree = open_tree(source, config)?;
    check_records(&tree, &shape.records)?;
    assert_eq!(tree.stat()?.item_total_data, shape.live());

    // Unwritten blocks in the middle of the file are not valid pages.
    assert!(matches!(
        tree.cache().page_in(PageId(0)),
        Err(BtreeError::Format { .. })
    ));
    Ok(())
}

fn row_tree() -> anyhow::Result<Btree> {
    let key = |s: &'static str| Bytes::from_static(s.as_bytes());
    let source = MemorySource::new();
    source.put(
        PageId(1),
        &PageImage::RowInternal(vec![
            RowChild {
                key: key("a"),
                child: PageId(2),
            },
            RowChild {
                key: key("m"),
                child: PageId(3),
            },
        ]),
    )?;
    source.put(
        PageId(2),
        &PageImage::RowLeaf(vec![
            RowCell {
                key: RowKey::Instantiated(key("a")),
                item: RowItem::OffPage(PageId(4)),
            },
            RowCell {
                key: RowKey::Cell {
                    bytes: key("b"),
                    overflow: true,
                },
                item: RowItem::Data(key("1")),
            },
        ]),
    )?;
    source.put(
        PageId(3),
        &PageImage::RowLeaf(vec![RowCell {
            key: RowKey::Cell {
                bytes: key("m"),
                overflow: false,
            },
            item: RowItem::DataOvfl(PageId(9)),
        }]),
    )?;
    source.put(
        PageId(4),
        &PageImage::DupInternal(vec![
            RowChild {
                key: key("x"),
                child: PageId(5),
            },
            RowChild {
                key: key("y"),
                child: PageId(6),
            },
        ]),
    )?;
    source.put(
        PageId(5),
        &PageImage::DupLeaf(vec![DupItem::Dup(key("x1")), DupItem::Dup(key("x2"))]),
    )?;
    source.put(
        PageId(6),
        &PageImage::DupLeaf(vec![DupItem::DupOvfl(PageId(10))]),
    )?;
    open_tree(source, CacheConfig::default())
}

#[derive(Default)]
struct Order(Vec<u32>);

impl PageVisitor for Order {
    fn visit(&mut self, _walker: &TreeWalker<'_>, page: &Page) -> BtreeResult<()> {
        self.0.push(page.id().0);
        Ok(())
    }
}

#[test]
fn test_row_tree_with_duplicate_tree() -> anyhow::Result<()> {
    init_logging();
    let tree = row_tree()?;

    let mut order = Order::default();
    tree.walk(true, &mut order)?;
    assert_eq!(order.0, vec![5, 6, 4, 2, 3, 1]);

    let mut order = Order::default();
    tree.walk(false, &mut order)?;
    assert_eq!(order.0, vec![2, 3, 1]);

    let stats = tree.stat()?;
    assert_eq!(stats.page_row_internal, 1);
    assert_eq!(stats.page_row_leaf, 2);
    assert_eq!(stats.page_dup_internal, 1);
    assert_eq!(stats.page_dup_leaf, 2);
    assert_eq!(stats.dup_tree, 1);
    assert_eq!(stats.item_dup_data, 3);
    assert_eq!(stats.item_total_data, 5);
    assert_eq!(stats.item_data_ovfl, 2);
    assert_eq!(stats.item_total_key, 3);
    assert_eq!(stats.item_key_ovfl, 1);

    assert!(matches!(
        tree.col_get(1),
        Err(BtreeError::InvalidOperation(_))
    ));
    assert_eq!(tree.cache().active_pins(), 0);
    Ok(())
}

#[test]
fn test_updates_survive_eviction_until_reconciled() -> anyhow::Result<()> {
    init_logging();
    let leaf = PageId(2);
    let image = PageImage::ColumnFixed {
        recno: 1,
        cells: vec![FixCell {
            deleted: false,
            data: Bytes::from_static(b"old"),
        }],
    };
    let source = Arc::new(MemorySource::new());
    source.put(
        PageId(1),
        &PageImage::ColumnInternal(vec![ColChild {
            recno: 1,
            child: leaf,
        }]),
    )?;
    source.put(leaf, &image)?;
    let tree = open_tree(Arc::clone(&source), CacheConfig::default())?;

    tree.cache()
        .page_in(leaf)?
        .update(0, Update::Value(Bytes::from_static(b"new")))?;
    assert_eq!(tree.col_get(1)?, Some(Bytes::from_static(b"new")));

    assert!(matches!(
        tree.cache().evict(leaf),
        Err(BtreeError::Busy { .. })
    ));
    assert!(tree.cache().is_resident(leaf));
    assert_eq!(tree.col_get(1)?, Some(Bytes::from_static(b"new")));

    // Write the reconciled image back, then hand the page back to the cache.
    let reconciled = PageImage::ColumnFixed {
        recno: 1,
        cells: vec![FixCell {
            deleted: false,
            data: Bytes::from_static(b"new"),
        }],
    };
    source.put(leaf, &reconciled)?;
    tree.cache().reconciled(leaf)?;
    tree.cache().evict(leaf)?;
    assert!(!tree.cache().is_resident(leaf));
    assert_eq!(tree.col_get(1)?, Some(Bytes::from_static(b"new")));
    Ok(())
}

#[test]
fn test_concurrent_stats_updates_and_evictions() -> anyhow::Result<()> {
    init_logging();
    let shape = ColumnTree::random(11, 24);
    let tree = Arc::new(open_tree(shape.memory_source()?, CacheConfig::default())?);
    let leaves = Arc::new(shape.leaves.clone());

    let mut writers = Vec::new();
    for t in 0..2u64 {
        let tree = Arc::clone(&tree);
        let leaves = Arc::clone(&leaves);
        writers.push(thread::spawn(move || {
            let mut written = Vec::new();
            let mut rng = StdRng::seed_from_u64(100 + t);
            for i in 0..300 {
                let leaf = leaves[rng.gen_range(0..leaves.len())];
                let pin = match tree.cache().page_in(leaf) {
                    Ok(pin) => pin,
                    Err(err) => {
                        assert!(err.is_retryable(), "{}", err);
                        continue;
                    }
                };
                let update = if i % 4 == 0 {
                    Update::Delete
                } else {
                    Update::Value(Bytes::from(format!("w{}-{}", t, i)))
                };
                let result = match pin.image() {
                    PageImage::ColumnRcc { cells, .. } => {
                        let slot = rng.gen_range(0..cells.len());
                        let offset = rng.gen_range(0..cells[slot].count);
                        pin.update_run(slot, offset, update)
                    }
                    PageImage::ColumnVariable { cells, .. } => {
                        let slot = rng.gen_range(0..cells.len());
                        if cells[slot] == VarItem::Del {
                            continue;
                        }
                        pin.update(slot, update)
                    }
                    _ => pin.update(rng.gen_range(0..pin.slot_count()), update),
                };
                result.expect("overlay write on a pinned leaf");
                written.push(leaf);
            }
            written
        }));
    }

    let mut handles = Vec::new();
    {
        let tree = Arc::clone(&tree);
        let leaves = Arc::clone(&leaves);
        handles.push(thread::spawn(move || {
            let mut rng = StdRng::seed_from_u64(7);
            for _ in 0..600 {
                let leaf = leaves[rng.gen_range(0..leaves.len())];
                match tree.cache().evict(leaf) {
                    Ok(()) | Err(BtreeError::Busy { .. }) | Err(BtreeError::PageNotFound(_)) => {}
                    Err(err) => panic!("unexpected eviction error: {}", err),
                }
            }
        }));
    }

    let leaf_count = shape.leaves.len() as u64;
    for _ in 0..2 {
        let tree = Arc::clone(&tree);
        handles.push(thread::spawn(move || {
            for _ in 0..50 {
                match tree.stat() {
                    Ok(stats) => {
                        assert_eq!(stats.page_col_internal, 1);
                        assert_eq!(
                            stats.page_col_fix + stats.page_col_variable + stats.page_col_rcc,
                            leaf_count
                        );
                    }
                    Err(err) => assert!(err.is_retryable(), "{}", err),
                }
            }
        }));
    }

    let mut written = Vec::new();
    for writer in writers {
        written.extend(writer.join().expect("writer panicked"));
    }
    for handle in handles {
        handle.join().expect("worker panicked");
    }

    // A leaf carrying overlays is never evicted out from under them.
    let cache = tree.cache();
    for leaf in written {
        let pin = cache
            .pin_resident(leaf)?
            .expect("written leaf stays resident");
        assert!(pin.is_modified(), "page {}", leaf);
    }
    assert_eq!(cache.active_pins(), 0);
    assert_eq!(cache.pins_acquired(), cache.pins_released());
    assert_eq!(
        cache.accountant().pages_in_use(),
        cache.resident_pages() as u64
    );
    Ok(())
}
