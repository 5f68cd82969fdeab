//! Error types for the indexing pipeline.
//!
//! Transient errors are recovered where the remedy is known (transport
//! retries in the RPC layer, dictionary fallback in the fetcher); only fatal
//! errors propagate to the process top.

use thiserror::Error;

use ethindexer_chain::ChainError;
use ethindexer_rpc::RpcError;

#[derive(Debug, Error)]
pub enum IndexerError {
    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error("store error: {0}")]
    Store(String),

    /// Unfinalized records arrived out of order — an upstream ordering bug.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// A worker exhausted its retries; the loop cannot skip a height.
    #[error("handler failed at block {height}: {reason}")]
    Handler { height: u64, reason: String },

    #[error("shutting down")]
    Shutdown,
}

impl IndexerError {
    /// Returns `true` if the process must stop.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::InvariantViolation(_) | Self::Handler { .. } => true,
            Self::Rpc(e) => e.is_fatal(),
            Self::Chain(ChainError::Rpc(e)) => e.is_fatal(),
            _ => false,
        }
    }
}
