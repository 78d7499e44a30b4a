//! Tree-level operations built on the page cache.
//!
//! - **TreeWalker**: post-order traversal that pins each page before
//!   descending into it
//! - **StatisticsVisitor**: per-kind page and item counts
//! - **Btree**: handle on one tree, with record-number lookup

pub mod btree;
pub mod stat;
pub mod walk;

pub use btree::{Btree, TreeOrganization};
pub use stat::{BtreeStats, StatisticsVisitor};
pub use walk::{PageVisitor, TreeWalker};
