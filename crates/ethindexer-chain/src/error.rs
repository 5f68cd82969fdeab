//! Chain-facade error types.

use thiserror::Error;

use ethindexer_rpc::RpcError;

#[derive(Debug, Error)]
pub enum ChainError {
    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error("block {0} not found")]
    BlockNotFound(u64),

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("ABI error: {0}")]
    Abi(String),
}

impl ChainError {
    /// Returns `true` if retrying against another endpoint may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Rpc(e) => e.is_retryable(),
            Self::BlockNotFound(_) | Self::Malformed(_) | Self::Abi(_) => false,
        }
    }
}
