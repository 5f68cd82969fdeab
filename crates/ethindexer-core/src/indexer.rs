//! Root assembly: wires the pool, chain API, dictionary, tracker,
//! dispatcher, and fetch loop into one owned value.
//!
//! Everything hangs off this value and is dropped at shutdown; the only
//! process-wide state is the package version and the ABI interface cache.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::mpsc;

use ethindexer_chain::{BlockHeightMap, ChainApi, DataSource};
use ethindexer_dictionary::{build_queries_map_with_limit, DictionaryService};
use ethindexer_rpc::{ConnectionPool, RpcClient, RpcClientConfig};

use crate::config::NodeConfig;
use crate::dispatcher::{BlockDispatcher, DispatcherConfig};
use crate::error::IndexerError;
use crate::fetch::{ChainTipSource, DictionarySource, FetchService};
use crate::metadata::{keys, MetadataStore, ReindexCallback};
use crate::unfinalized::UnfinalizedBlocksService;
use crate::worker::{FetchingWorker, HandlerSink};

/// A running indexing node.
pub struct Indexer {
    fetch: Arc<FetchService>,
    dispatcher: Arc<BlockDispatcher>,
}

impl Indexer {
    /// Connect to the configured endpoints, replay fork verification, and
    /// assemble the pipeline. Fails fast on endpoint identity mismatches.
    pub async fn connect(
        config: NodeConfig,
        data_sources: Vec<DataSource>,
        store: Arc<dyn MetadataStore>,
        sink: Arc<dyn HandlerSink>,
        reindex: ReindexCallback,
    ) -> Result<Self, IndexerError> {
        let pool = Arc::new(ConnectionPool::new());
        for endpoint in &config.network_endpoints {
            let client = Arc::new(RpcClient::new(endpoint, RpcClientConfig::default()));
            pool.add_connection(client).await?;
        }
        let network = pool
            .network_info()
            .ok_or_else(|| IndexerError::Store("no endpoints configured".into()))?;
        let api = Arc::new(ChainApi::new(pool));

        // Persist chain identity so later runs can refuse a different chain.
        let tx = store.begin().await?;
        store.upsert(keys::GENESIS_HASH, &network.genesis_hash, tx).await?;
        store.upsert(keys::CHAIN, &network.chain_id, tx).await?;
        store.upsert(keys::SPEC_NAME, &network.runtime_chain, tx).await?;
        store.commit(tx).await?;

        let ds_map = Arc::new(RwLock::new(BlockHeightMap::from_data_sources(&data_sources)));

        let dictionary: Option<Arc<dyn DictionarySource>> =
            if config.network_dictionaries.is_empty() {
                None
            } else {
                let service = DictionaryService::connect(
                    config.network_dictionaries.clone(),
                    network.chain_id.clone(),
                    network.genesis_hash.clone(),
                    Duration::from_secs(config.dictionary_timeout_secs),
                )
                .await;
                service.update_queries_map(build_queries_map_with_limit(
                    &ds_map.read().unwrap(),
                    config.query_address_limit,
                ));
                Some(Arc::new(service))
            };

        let unfinalized = Arc::new(UnfinalizedBlocksService::new(
            api.clone(),
            store.clone(),
            config.unfinalized_blocks,
        ));

        // Cold start: replay verification before any block is fetched.
        let finalized = api.get_finalized_header().await?;
        let rewind = unfinalized.init(finalized).await?;
        if let Some(height) = rewind {
            tracing::warn!(height, "chain forked while offline, reindexing");
            reindex(height).await?;
            let tx = store.begin().await?;
            unfinalized.rewind_to(height, tx).await?;
            store
                .upsert(keys::LAST_PROCESSED_HEIGHT, &height.to_string(), tx)
                .await?;
            store.commit(tx).await?;
        }

        let last_processed: Option<u64> = store
            .read(keys::LAST_PROCESSED_HEIGHT)
            .await?
            .and_then(|raw| raw.parse().ok());
        let first_ds = ds_map.read().unwrap().first_height().unwrap_or(1);
        let start_height = match (rewind, last_processed) {
            (Some(rewound), _) => rewound + 1,
            (None, Some(last)) => (last + 1).max(first_ds),
            (None, None) => first_ds,
        };

        let worker = Arc::new(FetchingWorker::new(api.clone(), sink));
        let dispatcher = BlockDispatcher::new(
            DispatcherConfig {
                capacity: config.batch_size * 2,
                workers: config.worker_count(),
                worker_retries: 3,
            },
            worker,
            store,
            unfinalized.clone(),
            ds_map.clone(),
            reindex,
        );

        let chain: Arc<dyn ChainTipSource> = api;
        let fetch = FetchService::new(
            config,
            chain,
            dictionary,
            dispatcher.clone(),
            unfinalized,
            ds_map,
            start_height,
        )?;

        tracing::info!(start_height, "indexer assembled");
        Ok(Self { fetch, dispatcher })
    }

    /// Run until shutdown or a fatal error.
    pub async fn run(self) -> Result<(), IndexerError> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        self.dispatcher.start(events_tx);
        self.fetch.run(events_rx).await
    }

    /// Graceful stop: no new work is issued, in-flight commits finish.
    pub fn shutdown(&self) {
        self.fetch.shutdown();
        self.dispatcher.shutdown();
    }
}
