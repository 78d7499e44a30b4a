//! File-backed page source.
//!
//! Each page occupies one fixed-size block at `page_id * block_size`. A
//! block holds a little-endian `u32` length followed by the bincode-encoded
//! [`PageImage`]; the rest of the block is zero.

use crate::config::CacheConfig;
use crate::storage::error::{BtreeError, BtreeResult};
use crate::storage::page::{PageId, PageImage};
use crate::storage::source::PageSource;
use byteorder::{ByteOrder, LittleEndian};
use log::trace;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

const LENGTH_PREFIX: usize = 4;

#[derive(Debug)]
pub struct FileSource {
    file: Mutex<File>,
    block_size: usize,
}

impl FileSource {
    pub fn create(path: &Path, config: &CacheConfig) -> BtreeResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Self::with_file(file, config)
    }

    pub fn open(path: &Path, config: &CacheConfig) -> BtreeResult<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Self::with_file(file, config)
    }

    fn with_file(file: File, config: &CacheConfig) -> BtreeResult<Self> {
        if config.block_size <= LENGTH_PREFIX {
            return Err(BtreeError::InvalidOperation(format!(
                "block size {} is too small",
                config.block_size
            )));
        }
        Ok(Self {
            file: Mutex::new(file),
            block_size: config.block_size,
        })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn num_pages(&self) -> BtreeResult<u32> {
        let file_size = self.file.lock().metadata()?.len();
        block_count(file_size, self.block_size)
    }

    /// Reserves the next block and returns its location.
    pub fn allocate_page(&self) -> BtreeResult<PageId> {
        let file = self.file.lock();
        let current = block_count(file.metadata()?.len(), self.block_size)?;
        file.set_len((u64::from(current) + 1) * self.block_size as u64)?;
        Ok(PageId(current))
    }

    pub fn write_image(&self, page_id: PageId, image: &PageImage) -> BtreeResult<()> {
        let encoded = image.encode()?;
        if LENGTH_PREFIX + encoded.len() > self.block_size {
            return Err(BtreeError::InvalidOperation(format!(
                "image of {} bytes does not fit a {} byte block",
                encoded.len(),
                self.block_size
            )));
        }

        let mut block = vec![0u8; self.block_size];
        LittleEndian::write_u32(&mut block[..LENGTH_PREFIX], encoded.len() as u32);
        block[LENGTH_PREFIX..LENGTH_PREFIX + encoded.len()].copy_from_slice(&encoded);

        let offset = self.block_offset(page_id);
        let mut file = self.file.lock();
        if offset + self.block_size as u64 > file.metadata()?.len() {
            file.set_len(offset + self.block_size as u64)?;
        }
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(&block)?;
        file.sync_all()?;
        Ok(())
    }

    fn block_offset(&self, page_id: PageId) -> u64 {
        u64::from(page_id.0) * self.block_size as u64
    }
}

/// Whole blocks in a file of `len` bytes. Page ids are `u32`, so larger
/// files cannot be addressed.
fn block_count(len: u64, block_size: usize) -> BtreeResult<u32> {
    u32::try_from(len / block_size as u64)
        .map_err(|_| BtreeError::Exhausted { what: "page ids" })
}

impl PageSource for FileSource {
    fn read(&self, page_id: PageId) -> BtreeResult<PageImage> {
        let offset = self.block_offset(page_id);
        let mut block = vec![0u8; self.block_size];
        {
            let mut file = self.file.lock();
            if offset >= file.metadata()?.len() {
                return Err(BtreeError::PageNotFound(page_id));
            }
            file.seek(SeekFrom::Start(offset))?;
            file.read_exact(&mut block)?;
        }
        trace!("read block for page {}", page_id);

        let len = LittleEndian::read_u32(&block[..LENGTH_PREFIX]) as usize;
        if len == 0 || LENGTH_PREFIX + len > self.block_size {
            return Err(BtreeError::format(
                page_id,
                format!("bad image length {}", len),
            ));
        }
        PageImage::decode(page_id, &block[LENGTH_PREFIX..LENGTH_PREFIX + len])
    }
}
