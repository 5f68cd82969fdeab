//! ethindexer-dictionary — pre-indexed filter acceleration for catch-up.
//!
//! A dictionary is an external service that, given address/topic/selector
//! conditions, returns only the heights (v1) or full payloads (v2) of
//! matching blocks, letting the fetcher skip irrelevant ranges in bulk.
//!
//! # Overview
//!
//! - [`entry`] — query entries projected from the active data-source set
//! - [`V1Dictionary`] — GraphQL endpoint returning sparse heights
//! - [`V2Dictionary`] — `subql_filterBlocks` endpoint returning payloads
//! - [`DictionaryService`] — per-endpoint version negotiation and fallback

pub mod client;
pub mod entry;
pub mod error;
pub mod service;
pub mod v1;
pub mod v2;

pub use client::{DictionaryClient, DictionaryMetadata, DictionaryResponse, DictionaryVersion};
pub use entry::{
    build_queries_map, build_queries_map_with_limit, build_query_entry, LogCondition, QueryEntry,
    TxCondition,
};
pub use error::DictionaryError;
pub use service::DictionaryService;
pub use v1::V1Dictionary;
pub use v2::V2Dictionary;
