//! Dictionary client errors. All of these make the caller fall back to a
//! dense fetch for the current cycle; none are fatal.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DictionaryError {
    #[error("dictionary unavailable: {0}")]
    Unavailable(String),

    #[error("dictionary behind: processed up to {last_processed}, need {start}")]
    Behind { last_processed: u64, start: u64 },

    #[error("dictionary response malformed: {0}")]
    Malformed(String),

    #[error("dictionary serves a different chain: {field} is {actual}, expected {expected}")]
    ChainMismatch {
        field: &'static str,
        expected: String,
        actual: String,
    },

    #[error("dictionary query timed out")]
    Timeout,
}
