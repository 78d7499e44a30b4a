//! Page-resident storage core.
//!
//! - **Page**: immutable on-disk cells plus pending overlays and run expansions
//! - **PageView**: the logical item sequence of one page
//! - **PageCache**: resident pages keyed by location, dereferenced through hazard pins
//! - **CacheAccountant**: moved-in/moved-out page and byte counters
//! - **PageSource**: the page-in/page-out collaborator, in memory or file-backed

pub mod buffer;
pub mod cache;
pub mod disk;
pub mod error;
pub mod page;
pub mod source;

pub use buffer::{PageCache, Pin};
pub use cache::{CacheAccountant, ServerLock};
pub use disk::FileSource;
pub use error::{BtreeError, BtreeResult};
pub use page::{Page, PageId, PageImage, PageKind, PageView, Update};
pub use source::{MemorySource, PageSource};
