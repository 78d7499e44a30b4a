//! Page-in and page-out collaborators.

use crate::storage::error::{BtreeError, BtreeResult};
use crate::storage::page::{Page, PageId, PageImage};
use dashmap::{DashMap, DashSet};
use std::fmt::Debug;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};

/// Where the cache gets pages from, and whom it tells about evictions.
pub trait PageSource: Send + Sync + Debug {
    /// Materializes the image stored at `page_id`.
    fn read(&self, page_id: PageId) -> BtreeResult<PageImage>;

    /// Called after `page` has left the cache. No pin is held on it.
    fn page_out(&self, _page: &Page) {}
}

/// Page source holding encoded images in memory.
#[derive(Debug, Default)]
pub struct MemorySource {
    images: DashMap<PageId, Vec<u8>>,
    failing: DashSet<PageId>,
    reads: AtomicU64,
    page_outs: AtomicU64,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, page_id: PageId, image: &PageImage) -> BtreeResult<()> {
        self.images.insert(page_id, image.encode()?);
        Ok(())
    }

    /// Stores bytes as-is, whether or not they decode.
    pub fn put_raw(&self, page_id: PageId, data: Vec<u8>) {
        self.images.insert(page_id, data);
    }

    /// Makes every later read of `page_id` fail with an I/O error.
    pub fn fail_on(&self, page_id: PageId) {
        self.failing.insert(page_id);
    }

    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn page_outs(&self) -> u64 {
        self.page_outs.load(Ordering::Relaxed)
    }
}

impl PageSource for MemorySource {
    fn read(&self, page_id: PageId) -> BtreeResult<PageImage> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        if self.failing.contains(&page_id) {
            return Err(BtreeError::Io(io::Error::new(
                io::ErrorKind::Other,
                format!("read of page {} failed", page_id),
            )));
        }
        let data = self
            .images
            .get(&page_id)
            .ok_or(BtreeError::PageNotFound(page_id))?;
        PageImage::decode(page_id, data.value())
    }

    fn page_out(&self, _page: &Page) {
        self.page_outs.fetch_add(1, Ordering::Relaxed);
    }
}

impl<S: PageSource + ?Sized> PageSource for std::sync::Arc<S> {
    fn read(&self, page_id: PageId) -> BtreeResult<PageImage> {
        (**self).read(page_id)
    }

    fn page_out(&self, page: &Page) {
        (**self).page_out(page)
    }
}
