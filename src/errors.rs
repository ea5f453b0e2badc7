//! Error types shared across the store.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// A page-lock acquisition exceeded its randomized deadline. The caller
    /// is expected to abort the transaction and may retry it.
    #[error("transaction aborted: lock wait timed out")]
    TxnAborted,

    /// I/O failure reading or writing a page or the log.
    #[error("storage fault: {0}")]
    Storage(#[from] std::io::Error),

    /// Mismatched tuple descriptor, bad field value, or other schema-level
    /// disagreement between caller and table.
    #[error("schema violation: {0}")]
    Schema(String),

    /// Programmer error: wrong table id for a page, page beyond EOF,
    /// operating on a closed cursor.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;
