use crate::config::CacheConfig;
use crate::storage::cache::CacheAccountant;
use crate::storage::error::{BtreeError, BtreeResult};
use crate::storage::page::{Page, PageId};
use crate::storage::source::PageSource;
use dashmap::DashMap;
use log::{debug, trace, warn};
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::thread;

const RESIDENT: u8 = 0;
const EVICTING: u8 = 1;

struct Frame {
    page: Page,
    pins: AtomicU32,
    state: AtomicU8,
}

impl Frame {
    fn new(page: Page) -> Self {
        Self {
            page,
            pins: AtomicU32::new(0),
            state: AtomicU8::new(RESIDENT),
        }
    }
}

/// Arena of resident pages keyed by location.
///
/// A page may only be dereferenced through a [`Pin`]. Pinning publishes a
/// hazard (the frame's pin count) and then checks that the frame is not being
/// evicted; eviction marks the frame first and then checks for hazards. With
/// both sides sequentially consistent, at least one of them backs off.
pub struct PageCache {
    page_table: DashMap<PageId, Arc<Frame>>,
    source: Box<dyn PageSource>,
    accountant: Arc<CacheAccountant>,
    config: CacheConfig,
    pins_acquired: AtomicU64,
    pins_released: AtomicU64,
}

impl PageCache {
    pub fn new(
        source: Box<dyn PageSource>,
        accountant: Arc<CacheAccountant>,
        config: CacheConfig,
    ) -> Self {
        Self {
            page_table: DashMap::new(),
            source,
            accountant,
            config,
            pins_acquired: AtomicU64::new(0),
            pins_released: AtomicU64::new(0),
        }
    }

    pub fn accountant(&self) -> &Arc<CacheAccountant> {
        &self.accountant
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Pins `page_id`, reading it from the source first if it is not
    /// resident. A pin that loses a race with eviction is retried up to
    /// `pin_retries` times before Busy is returned.
    pub fn page_in(&self, page_id: PageId) -> BtreeResult<Pin<'_>> {
        let mut retries = 0;
        loop {
            match self.pin_resident(page_id) {
                Ok(Some(pin)) => return Ok(pin),
                Ok(None) => self.read_page(page_id)?,
                Err(err) if err.is_retryable() && retries < self.config.pin_retries => {
                    retries += 1;
                    trace!("page {} busy, retry {}", page_id, retries);
                    thread::yield_now();
                }
                Err(err) => {
                    if err.is_retryable() {
                        warn!("page {} still busy after {} retries", page_id, retries);
                    }
                    return Err(err);
                }
            }
        }
    }

    /// Pins `page_id` only if it is already resident.
    pub fn pin_resident(&self, page_id: PageId) -> BtreeResult<Option<Pin<'_>>> {
        let frame = match self.page_table.get(&page_id) {
            Some(entry) => Arc::clone(entry.value()),
            None => return Ok(None),
        };

        frame.pins.fetch_add(1, Ordering::SeqCst);
        if frame.state.load(Ordering::SeqCst) == EVICTING {
            frame.pins.fetch_sub(1, Ordering::SeqCst);
            return Err(BtreeError::Busy { page_id });
        }

        self.pins_acquired.fetch_add(1, Ordering::Relaxed);
        Ok(Some(Pin { cache: self, frame }))
    }

    fn read_page(&self, page_id: PageId) -> BtreeResult<()> {
        let _read = self.accountant.read_lock();
        // Another reader may have finished while we waited for the lock.
        if self.page_table.contains_key(&page_id) {
            return Ok(());
        }

        let image = self.source.read(page_id)?;
        let page = Page::new(page_id, image)?;
        let bytes = page.footprint();
        debug!("page in {} ({}, {} bytes)", page_id, page.kind(), bytes);

        self.page_table.insert(page_id, Arc::new(Frame::new(page)));
        self.accountant.record_page_in(bytes);
        Ok(())
    }

    /// Removes an unpinned, unmodified page from the cache and tells the
    /// source. A page carrying overlays that reconciliation has not written
    /// back stays resident and Busy is returned.
    pub fn evict(&self, page_id: PageId) -> BtreeResult<()> {
        let _drain = self.accountant.drain_lock();
        let frame = match self.page_table.get(&page_id) {
            Some(entry) => Arc::clone(entry.value()),
            None => return Err(BtreeError::PageNotFound(page_id)),
        };

        if frame
            .state
            .compare_exchange(RESIDENT, EVICTING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(BtreeError::Busy { page_id });
        }
        if frame.pins.load(Ordering::SeqCst) > 0 {
            frame.state.store(RESIDENT, Ordering::SeqCst);
            return Err(BtreeError::Busy { page_id });
        }
        // Writers need a pin, so with none live the modified state is stable.
        if frame.page.is_modified() {
            frame.state.store(RESIDENT, Ordering::SeqCst);
            debug!("page {} has unreconciled overlays, not evicting", page_id);
            return Err(BtreeError::Busy { page_id });
        }

        self.page_table.remove(&page_id);
        self.accountant.record_page_out(frame.page.footprint());
        debug!("evicted page {}", page_id);
        self.source.page_out(&frame.page);
        Ok(())
    }

    /// Called by reconciliation once a page's overlays are durably written.
    /// Drops them, which makes the page evictable again.
    pub fn reconciled(&self, page_id: PageId) -> BtreeResult<()> {
        let _reconcile = self.accountant.reconcile_lock();
        let pin = self
            .pin_resident(page_id)?
            .ok_or(BtreeError::PageNotFound(page_id))?;
        pin.discard_overlays();
        debug!("page {} reconciled", page_id);
        Ok(())
    }

    pub fn is_resident(&self, page_id: PageId) -> bool {
        self.page_table.contains_key(&page_id)
    }

    pub fn resident_pages(&self) -> usize {
        self.page_table.len()
    }

    pub fn pins_acquired(&self) -> u64 {
        self.pins_acquired.load(Ordering::Relaxed)
    }

    pub fn pins_released(&self) -> u64 {
        self.pins_released.load(Ordering::Relaxed)
    }

    pub fn active_pins(&self) -> u64 {
        self.pins_acquired().saturating_sub(self.pins_released())
    }
}

/// Hazard pin on a resident page. The page cannot be evicted until the pin
/// is dropped.
pub struct Pin<'c> {
    cache: &'c PageCache,
    frame: Arc<Frame>,
}

impl Pin<'_> {
    pub fn page(&self) -> &Page {
        &self.frame.page
    }
}

impl Deref for Pin<'_> {
    type Target = Page;

    fn deref(&self) -> &Page {
        &self.frame.page
    }
}

impl Drop for Pin<'_> {
    fn drop(&mut self) {
        self.frame.pins.fetch_sub(1, Ordering::SeqCst);
        self.cache.pins_released.fetch_add(1, Ordering::Relaxed);
    }
}
