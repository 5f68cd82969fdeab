//! ethindexer-core — the indexing pipeline.
//!
//! # Architecture
//!
//! ```text
//! Indexer
//!   ├── FetchService              (cursor, dictionary window, modulo, bypass)
//!   │     └── tip monitor         (finalized/best polling)
//!   ├── BlockDispatcher           (bounded queue, workers, in-order commit)
//!   │     └── FetchingWorker      (chain fetch + handler matching)
//!   ├── UnfinalizedBlocksService  (fork detection, rewind computation)
//!   └── MetadataStore             (transactional keyed state)
//! ```

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod fetch;
pub mod indexer;
pub mod metadata;
pub mod unfinalized;
pub mod worker;

pub use config::{parse_bypass_blocks, NodeConfig};
pub use dispatcher::{
    BlockDispatcher, BlockWorker, DispatcherConfig, DispatcherEvent, WorkerBlockResponse,
    WorkerRequest,
};
pub use error::IndexerError;
pub use fetch::{compute_batch, ChainTipSource, DictionarySource, FetchService, FetchStep};
pub use indexer::Indexer;
pub use metadata::{InMemoryMetadataStore, MetadataStore, MetadataTx, ReindexCallback};
pub use unfinalized::{UnfinalizedBlocksService, UNFINALIZED_WALK_THRESHOLD};
pub use worker::{FetchingWorker, HandlerMatch, HandlerSink, NoopHandlerSink};

/// Package version, resolved once at compile time.
pub fn package_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
