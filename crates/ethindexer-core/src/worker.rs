//! Default block worker: fetches through the chain API (or accepts the
//! dictionary payload) and resolves which handlers each block must see.
//!
//! Handler execution itself lives behind [`HandlerSink`] — the sandbox that
//! runs user code is an external collaborator.

use std::sync::Arc;

use async_trait::async_trait;

use ethindexer_chain::{ChainApi, DataSource, EthBlock, HandlerKind};

use crate::dispatcher::{BlockWorker, WorkerBlockResponse};
use crate::error::IndexerError;

/// One handler invocation owed for a block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerMatch {
    pub handler: String,
    pub kind: HandlerKind,
}

/// Receives matched handler work. The sandboxed runtime implements this.
#[async_trait]
pub trait HandlerSink: Send + Sync {
    /// Run the matched handlers for `block`. Returns data sources created
    /// dynamically by the handlers, if any.
    async fn run(
        &self,
        block: &EthBlock,
        matches: Vec<HandlerMatch>,
    ) -> Result<Vec<DataSource>, IndexerError>;
}

/// Sink that runs nothing — used when indexing only maintains chain state.
pub struct NoopHandlerSink;

#[async_trait]
impl HandlerSink for NoopHandlerSink {
    async fn run(
        &self,
        _block: &EthBlock,
        _matches: Vec<HandlerMatch>,
    ) -> Result<Vec<DataSource>, IndexerError> {
        Ok(vec![])
    }
}

/// Resolve the handler invocations `block` owes under `data_sources`.
///
/// Block handlers match every delivered block (their modulo schedule is
/// enforced upstream by the fetcher). Event and Call handlers match per log /
/// transaction, restricted to the data source's pinned address when set.
pub fn matching_handlers(block: &EthBlock, data_sources: &[DataSource]) -> Vec<HandlerMatch> {
    let mut matches = Vec::new();
    let height = block.height();

    for ds in data_sources {
        if !ds.active_at(height) {
            continue;
        }
        let pinned = ds.options.address.as_deref();

        for handler in &ds.mapping.handlers {
            let hit = match handler.kind {
                HandlerKind::Block => true,
                HandlerKind::Event => block.logs.iter().any(|log| {
                    pinned.map_or(true, |addr| addr.eq_ignore_ascii_case(&log.address))
                        && handler
                            .filter
                            .as_ref()
                            .map_or(true, |filter| filter.matches_log(log))
                }),
                HandlerKind::Call => block.transactions.iter().any(|tx| {
                    pinned.map_or(true, |addr| {
                        tx.to.as_deref().is_some_and(|to| addr.eq_ignore_ascii_case(to))
                    }) && handler
                        .filter
                        .as_ref()
                        .map_or(true, |filter| filter.matches_transaction(tx))
                }),
            };
            if hit {
                matches.push(HandlerMatch {
                    handler: handler.handler.clone(),
                    kind: handler.kind,
                });
            }
        }
    }
    matches
}

/// Worker backed by the chain API and a handler sink.
pub struct FetchingWorker {
    api: Arc<ChainApi>,
    sink: Arc<dyn HandlerSink>,
}

impl FetchingWorker {
    pub fn new(api: Arc<ChainApi>, sink: Arc<dyn HandlerSink>) -> Self {
        Self { api, sink }
    }
}

#[async_trait]
impl BlockWorker for FetchingWorker {
    async fn process_block(
        &self,
        height: u64,
        data_sources: Vec<DataSource>,
        payload: Option<EthBlock>,
    ) -> Result<WorkerBlockResponse, IndexerError> {
        let block = match payload {
            Some(block) => block,
            None => self.api.fetch_block(height, true).await?,
        };

        let matches = matching_handlers(&block, &data_sources);
        let dynamic_data_sources = self.sink.run(&block, matches).await?;

        Ok(WorkerBlockResponse {
            height,
            hash: block.header.hash.clone(),
            parent_hash: block.header.parent_hash.clone(),
            dynamic_data_sources,
        })
    }
}
