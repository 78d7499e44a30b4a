pub mod access;
pub mod config;
pub mod stats;
pub mod storage;

pub use config::CacheConfig;
pub use storage::error::{BtreeError, BtreeResult};
