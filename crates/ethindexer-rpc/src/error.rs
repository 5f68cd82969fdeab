//! Transport-level error types.

use thiserror::Error;

use crate::request::JsonRpcError;

/// Errors that can occur during an RPC transport operation.
#[derive(Debug, Error)]
pub enum RpcError {
    /// Connection-level failure with no HTTP response (refused, reset, DNS).
    #[error("server error: {0}")]
    Server(String),

    /// Non-2xx HTTP response that was not passed through to the caller.
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// JSON-RPC protocol-level error returned by the node.
    #[error("RPC error {}: {}", .0.code, .0.message)]
    Rpc(JsonRpcError),

    /// All throttle attempts exhausted against a rate-limiting endpoint.
    #[error("rate limit exceeded after {attempts} attempts (endpoint: {endpoint})")]
    RateLimited { endpoint: String, attempts: u32 },

    /// The wall-clock timeout elapsed before any attempt succeeded.
    #[error("request timed out after {ms}ms")]
    Timeout { ms: u64 },

    /// A batch response was not a JSON array or its length did not match.
    #[error("malformed batch response: {0}")]
    MalformedBatch(String),

    /// Endpoint reports a different chain than the first-joined connection.
    #[error("endpoint {endpoint} network mismatch: {field} is {actual}, expected {expected}")]
    NetworkMismatch {
        endpoint: String,
        field: &'static str,
        expected: String,
        actual: String,
    },

    /// Every connection in the pool is unhealthy.
    #[error("no healthy endpoints available")]
    AllEndpointsUnhealthy,

    /// Response could not be deserialized.
    #[error("deserialization error: {0}")]
    Deserialization(#[from] serde_json::Error),

    /// Internal channel to the batcher task is gone.
    #[error("{0}")]
    Internal(String),
}

impl RpcError {
    /// Returns `true` if failing over to another endpoint may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Server(_)
                | Self::Http { .. }
                | Self::Timeout { .. }
                | Self::RateLimited { .. }
                | Self::MalformedBatch(_)
        )
    }

    /// Returns `true` if this is a configuration error that must stop the process.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::NetworkMismatch { .. })
    }
}
