//! Storage layer error types.

use crate::storage::page::PageId;
use thiserror::Error;

/// Errors that can occur in the page-resident core.
#[derive(Error, Debug)]
pub enum BtreeError {
    #[error("Page {page_id} is busy: eviction in progress")]
    Busy { page_id: PageId },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid page format for page {page_id}: {reason}")]
    Format { page_id: PageId, reason: String },

    #[error("Page not found: {0}")]
    PageNotFound(PageId),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Memory exhausted while allocating {what}")]
    Exhausted { what: &'static str },
}

impl BtreeError {
    /// Busy is the only class a caller may resolve by retrying the pin.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BtreeError::Busy { .. })
    }

    pub(crate) fn format(page_id: PageId, reason: impl Into<String>) -> Self {
        BtreeError::Format {
            page_id,
            reason: reason.into(),
        }
    }
}

/// Result type for core operations.
pub type BtreeResult<T> = Result<T, BtreeError>;
