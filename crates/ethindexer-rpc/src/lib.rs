//! ethindexer-rpc — batched JSON-RPC transport for the indexing node.
//!
//! # Overview
//!
//! - [`RpcClient`] — single-endpoint client with request coalescing and an
//!   adaptive batch-size probe
//! - [`ConnectionPool`] — verified multi-endpoint pool with round-robin
//!   selection and background reconnection
//! - [`CircuitBreaker`] — per-endpoint three-state health tracking
//! - [`JsonRpcRequest`] / [`JsonRpcResponse`] — wire types
//! - [`RpcError`] — structured transport error

pub mod batch;
pub mod circuit;
pub mod client;
pub mod error;
pub mod pool;
pub mod request;

pub use circuit::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use client::{ProcessorAction, RequestOptions, RpcClient, RpcClientConfig};
pub use error::RpcError;
pub use pool::{Connection, ConnectionPool, Endpoint, NetworkInfo, MAX_RECONNECT_ATTEMPTS};
pub use request::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, RpcId};
