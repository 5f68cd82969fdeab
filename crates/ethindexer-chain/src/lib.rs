//! ethindexer-chain — Ethereum-semantics layer for the indexing node.
//!
//! # Overview
//!
//! - [`ChainApi`] — facade over the connection pool: finalized tip, block +
//!   log fetches, lazy receipts
//! - [`types`] — block / transaction / log wire and parsed types
//! - [`datasource`] — user data sources, handler filters, [`BlockHeightMap`]
//! - [`abi`] — ABI decoding with a process-wide interface cache

pub mod abi;
pub mod api;
pub mod datasource;
pub mod error;
pub mod types;

pub use api::{BlockRef, ChainApi, HeaderLookup, FINALIZATION_DEPTH_FALLBACK};
pub use datasource::{BlockHeightMap, DataSource, HandlerDef, HandlerFilter, HandlerKind};
pub use error::ChainError;
pub use types::{BlockHeader, EthBlock, EthLog, EthTransaction};
