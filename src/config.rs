//! Cache configuration.

use serde::{Deserialize, Serialize};

pub const MEGABYTE: u64 = 1024 * 1024;

/// Settings for a page cache and the sources that feed it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Target cache size in megabytes, published as `cache_bytes_max`.
    pub cache_size_mb: u64,
    /// How many times page-in retries a Busy pin before giving up.
    pub pin_retries: u32,
    /// Block size of file-backed page sources.
    pub block_size: usize,
}

impl CacheConfig {
    pub fn cache_bytes_max(&self) -> u64 {
        self.cache_size_mb.saturating_mul(MEGABYTE)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_size_mb: 20,
            pin_retries: 64,
            block_size: 8192,
        }
    }
}
