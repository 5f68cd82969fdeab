//! The fetch loop: decides which heights to process next and feeds the
//! dispatcher.
//!
//! Each iteration scans the dictionary window ahead of the cursor (falling
//! back to dense enumeration when the dictionary is behind, empty, or
//! unavailable), overlays modulo schedules, subtracts bypassed heights,
//! truncates to the dispatcher's free capacity, and enqueues. A chain-tip
//! monitor polls the finalized and best heights at
//! `min(BLOCK_TIME_VARIANCE, 0.9 × measured block interval)` and feeds the
//! unfinalized tracker.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};

use ethindexer_chain::{BlockHeightMap, ChainApi, DataSource};
use ethindexer_dictionary::{
    build_queries_map_with_limit, DictionaryResponse, DictionaryService, QueryEntry,
};

use crate::config::NodeConfig;
use crate::dispatcher::{BlockDispatcher, DispatcherEvent};
use crate::error::IndexerError;
use crate::unfinalized::UnfinalizedBlocksService;

/// Upper bound on the tip-poll interval.
pub const BLOCK_TIME_VARIANCE: Duration = Duration::from_secs(5);

/// Chain-tip reads the fetch loop depends on. Implemented by [`ChainApi`].
#[async_trait]
pub trait ChainTipSource: Send + Sync {
    async fn finalized_header(&self) -> Result<ethindexer_chain::BlockHeader, IndexerError>;
    async fn best_height(&self) -> Result<u64, IndexerError>;
}

#[async_trait]
impl ChainTipSource for ChainApi {
    async fn finalized_header(&self) -> Result<ethindexer_chain::BlockHeader, IndexerError> {
        Ok(self.get_finalized_header().await?)
    }

    async fn best_height(&self) -> Result<u64, IndexerError> {
        Ok(self.get_best_block_height().await?)
    }
}

/// The dictionary surface the fetch loop uses. Implemented by
/// [`DictionaryService`]; `None` from `scan` means "dense fetch this cycle".
#[async_trait]
pub trait DictionarySource: Send + Sync {
    async fn scan(
        &self,
        start: u64,
        end: u64,
        limit: usize,
        finalized: u64,
    ) -> Option<DictionaryResponse>;

    fn update_queries(&self, map: BTreeMap<u64, QueryEntry>);
}

#[async_trait]
impl DictionarySource for DictionaryService {
    async fn scan(
        &self,
        start: u64,
        end: u64,
        limit: usize,
        finalized: u64,
    ) -> Option<DictionaryResponse> {
        if !self.has_clients() {
            return None;
        }
        self.get_data(start, end, limit, finalized).await
    }

    fn update_queries(&self, map: BTreeMap<u64, QueryEntry>) {
        self.update_queries_map(map);
    }
}

// ─── Batch computation ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledBatch {
    pub heights: Vec<u64>,
    pub last_buffered: u64,
}

/// Compute one batch from the cursor, the finalized target, and an optional
/// dictionary result.
pub fn compute_batch(
    next: u64,
    target: u64,
    dictionary: Option<&DictionaryResponse>,
    modulos: &[u64],
    bypass: &HashSet<u64>,
    batch_size: usize,
) -> ScheduledBatch {
    let (mut heights, base_last) = match dictionary {
        Some(response) => (
            response.batch_blocks.clone(),
            response.last_buffered_height,
        ),
        None => {
            let end = next.saturating_add(batch_size as u64 - 1).min(target);
            ((next..=end).collect(), end)
        }
    };

    // Overlay modulo schedules across the buffered window.
    for &modulo in modulos {
        if modulo == 0 {
            continue;
        }
        let mut k = next.div_ceil(modulo) * modulo;
        while k <= base_last {
            heights.push(k);
            k += modulo;
        }
    }

    heights.sort_unstable();
    heights.dedup();
    heights.retain(|h| *h >= next && *h <= base_last && !bypass.contains(h));

    let last_buffered = if heights.len() > batch_size {
        heights.truncate(batch_size);
        *heights.last().expect("batch_size > 0")
    } else {
        base_last
    };

    ScheduledBatch {
        heights,
        last_buffered,
    }
}

// ─── Fetch service ────────────────────────────────────────────────────────────

/// Outcome of one loop iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStep {
    /// A batch (possibly empty) was handed to the dispatcher.
    Enqueued(usize),
    /// The dispatcher has no free capacity.
    Backpressured,
    /// The cursor is past the finalized target.
    CaughtUp,
}

pub struct FetchService {
    config: NodeConfig,
    chain: Arc<dyn ChainTipSource>,
    dictionary: Option<Arc<dyn DictionarySource>>,
    dispatcher: Arc<BlockDispatcher>,
    unfinalized: Arc<UnfinalizedBlocksService>,
    ds_map: Arc<RwLock<BlockHeightMap<DataSource>>>,
    modulos: RwLock<Vec<u64>>,
    bypass: HashSet<u64>,
    next_height: AtomicU64,
    finalized_height: AtomicU64,
    best_height: AtomicU64,
    tip_notify: Notify,
    shutdown: AtomicBool,
}

impl FetchService {
    pub fn new(
        config: NodeConfig,
        chain: Arc<dyn ChainTipSource>,
        dictionary: Option<Arc<dyn DictionarySource>>,
        dispatcher: Arc<BlockDispatcher>,
        unfinalized: Arc<UnfinalizedBlocksService>,
        ds_map: Arc<RwLock<BlockHeightMap<DataSource>>>,
        start_height: u64,
    ) -> Result<Arc<Self>, IndexerError> {
        let bypass = config.bypass_set()?;
        let modulos = collect_modulos(&ds_map.read().unwrap());
        Ok(Arc::new(Self {
            config,
            chain,
            dictionary,
            dispatcher,
            unfinalized,
            ds_map,
            modulos: RwLock::new(modulos),
            bypass,
            next_height: AtomicU64::new(start_height),
            finalized_height: AtomicU64::new(0),
            best_height: AtomicU64::new(0),
            tip_notify: Notify::new(),
            shutdown: AtomicBool::new(false),
        }))
    }

    pub fn next_height(&self) -> u64 {
        self.next_height.load(Ordering::Acquire)
    }

    pub fn best_height(&self) -> u64 {
        self.best_height.load(Ordering::Acquire)
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.tip_notify.notify_waiters();
    }

    /// One scheduling pass. Public for tests; `run` loops it.
    pub async fn iteration(&self) -> Result<FetchStep, IndexerError> {
        if self.dispatcher.free_size() == 0 {
            return Ok(FetchStep::Backpressured);
        }

        let target = self.finalized_height.load(Ordering::Acquire);
        let next = self.next_height.load(Ordering::Acquire);
        if target == 0 || next > target {
            return Ok(FetchStep::CaughtUp);
        }

        let window_end = next
            .saturating_add(self.config.dictionary_query_size)
            .min(target);
        let dictionary_result = match &self.dictionary {
            Some(dictionary) => {
                dictionary
                    .scan(next, window_end, self.config.batch_size, target)
                    .await
            }
            None => None,
        };

        if let Some(response) = &dictionary_result {
            for block in &response.blocks {
                self.dispatcher.stash_payload(block.clone());
            }
        }

        let mut batch = compute_batch(
            next,
            target,
            dictionary_result.as_ref(),
            &self.modulos.read().unwrap(),
            &self.bypass,
            self.config.batch_size,
        );

        // Defer whatever exceeds the dispatcher's free capacity.
        let free = self.dispatcher.free_size();
        if batch.heights.len() > free {
            batch.heights.truncate(free);
            batch.last_buffered = *batch.heights.last().expect("free > 0");
        }

        self.dispatcher
            .enqueue_blocks(&batch.heights, batch.last_buffered)?;
        // The cursor only moves forward, whatever the dictionary claimed.
        let resume = batch.last_buffered.saturating_add(1).max(next);
        self.next_height.store(resume, Ordering::Release);
        Ok(FetchStep::Enqueued(batch.heights.len()))
    }

    /// Drive the loop until shutdown or a fatal dispatcher event.
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<DispatcherEvent>,
    ) -> Result<(), IndexerError> {
        self.clone().spawn_tip_monitor();

        loop {
            if self.shutdown.load(Ordering::Acquire) {
                return Ok(());
            }

            while let Ok(event) = events.try_recv() {
                match event {
                    DispatcherEvent::Rewound { height } => {
                        tracing::info!(height, "rewound, resuming above the fork point");
                        self.next_height.store(height + 1, Ordering::Release);
                    }
                    DispatcherEvent::DynamicDsCreated { start_block } => {
                        self.reset_for_new_ds(start_block);
                    }
                    DispatcherEvent::Fatal(e) => {
                        self.shutdown();
                        return Err(e);
                    }
                }
            }

            match self.iteration().await? {
                FetchStep::Enqueued(_) => {}
                FetchStep::Backpressured => {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                FetchStep::CaughtUp => {
                    tokio::select! {
                        _ = self.tip_notify.notified() => {}
                        _ = tokio::time::sleep(BLOCK_TIME_VARIANCE) => {}
                    }
                }
            }
        }
    }

    /// Handlers created data sources: flush queued work at and above their
    /// lowest start, rebuild the dictionary queries, rewind the cursor.
    pub fn reset_for_new_ds(&self, height: u64) {
        tracing::info!(height, "dynamic data sources created, resetting");
        self.dispatcher.flush_queue(height);
        let map = self.ds_map.read().unwrap();
        if let Some(dictionary) = &self.dictionary {
            dictionary.update_queries(build_queries_map_with_limit(
                &map,
                self.config.query_address_limit,
            ));
        }
        *self.modulos.write().unwrap() = collect_modulos(&map);
        drop(map);

        let current = self.next_height.load(Ordering::Acquire);
        self.next_height
            .store(current.min(height), Ordering::Release);
    }

    fn spawn_tip_monitor(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut last_best: Option<(Instant, u64)> = None;
            let mut poll_interval = BLOCK_TIME_VARIANCE;

            while !self.shutdown.load(Ordering::Acquire) {
                match self.chain.finalized_header().await {
                    Ok(header) => {
                        let known = self.finalized_height.load(Ordering::Acquire);
                        if header.height > known {
                            self.finalized_height.store(header.height, Ordering::Release);
                            self.unfinalized.register_finalized(header).await;
                            self.tip_notify.notify_waiters();
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "finalized tip poll failed"),
                }

                match self.chain.best_height().await {
                    Ok(best) => {
                        if let Some((at, height)) = last_best {
                            if best > height {
                                let measured = at.elapsed() / (best - height) as u32;
                                poll_interval = measured
                                    .mul_f64(0.9)
                                    .min(BLOCK_TIME_VARIANCE)
                                    .max(Duration::from_millis(500));
                            }
                        }
                        if last_best.map_or(true, |(_, height)| best > height) {
                            last_best = Some((Instant::now(), best));
                        }
                        self.best_height.store(best, Ordering::Release);
                    }
                    Err(e) => tracing::warn!(error = %e, "best tip poll failed"),
                }

                tokio::time::sleep(poll_interval).await;
            }
        });
    }
}

fn collect_modulos(map: &BlockHeightMap<DataSource>) -> Vec<u64> {
    let mut modulos: Vec<u64> = map
        .get_all()
        .values()
        .flatten()
        .flat_map(DataSource::modulos)
        .collect();
    modulos.sort_unstable();
    modulos.dedup();
    modulos
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dict(batch_blocks: Vec<u64>, last_buffered: u64) -> DictionaryResponse {
        DictionaryResponse {
            batch_blocks,
            last_buffered_height: last_buffered,
            blocks: vec![],
        }
    }

    fn no_bypass() -> HashSet<u64> {
        HashSet::new()
    }

    #[test]
    fn catch_up_with_dictionary() {
        // batchSize=10, finalized=1000, dictionary [2,4,6,8,10] buffered to 1000.
        let response = dict(vec![2, 4, 6, 8, 10], 1000);
        let batch = compute_batch(1, 1000, Some(&response), &[], &no_bypass(), 10);
        assert_eq!(batch.heights, vec![2, 4, 6, 8, 10]);
        assert_eq!(batch.last_buffered, 1000);
    }

    #[test]
    fn dense_fallback_without_dictionary() {
        let batch = compute_batch(1, 1000, None, &[], &no_bypass(), 10);
        assert_eq!(batch.heights, (1..=10).collect::<Vec<_>>());
        assert_eq!(batch.last_buffered, 10);
    }

    #[test]
    fn dense_fallback_clamped_to_target() {
        let batch = compute_batch(995, 1000, None, &[], &no_bypass(), 10);
        assert_eq!(batch.heights, (995..=1000).collect::<Vec<_>>());
        assert_eq!(batch.last_buffered, 1000);
    }

    #[test]
    fn empty_dictionary_response_advances() {
        let response = dict(vec![], 1000);
        let batch = compute_batch(1, 1000, Some(&response), &[], &no_bypass(), 10);
        assert!(batch.heights.is_empty());
        assert_eq!(batch.last_buffered, 1000);
    }

    #[test]
    fn modulo_union_with_dictionary() {
        // modulo=[3] ∪ dictionary [2,4,6,8,10]: truncation to batch size
        // extends the batch past the dictionary matches.
        let response = dict(vec![2, 4, 6, 8, 10], 1000);
        let batch = compute_batch(1, 1000, Some(&response), &[3], &no_bypass(), 10);
        assert_eq!(batch.heights, vec![2, 3, 4, 6, 8, 9, 10, 12, 15, 18]);
        assert_eq!(batch.last_buffered, 18);
    }

    #[test]
    fn modulo_overlays_empty_dictionary_result() {
        let response = dict(vec![], 100);
        let batch = compute_batch(1, 1000, Some(&response), &[25], &no_bypass(), 10);
        assert_eq!(batch.heights, vec![25, 50, 75, 100]);
        assert_eq!(batch.last_buffered, 100);
    }

    #[test]
    fn bypass_removed_from_batch() {
        let bypass: HashSet<u64> = [2, 3, 4, 5].into_iter().collect();
        let batch = compute_batch(1, 1000, None, &[], &bypass, 10);
        assert_eq!(batch.heights, vec![1, 6, 7, 8, 9, 10]);
        assert_eq!(batch.last_buffered, 10);
    }

    #[test]
    fn truncation_adjusts_last_buffered() {
        let batch = compute_batch(1, 1000, None, &[], &no_bypass(), 5);
        assert_eq!(batch.heights, vec![1, 2, 3, 4, 5]);
        assert_eq!(batch.last_buffered, 5);

        // Dictionary matches above the batch size are deferred.
        let response = dict((1..=20).collect(), 500);
        let batch = compute_batch(1, 1000, Some(&response), &[], &no_bypass(), 5);
        assert_eq!(batch.heights, vec![1, 2, 3, 4, 5]);
        assert_eq!(batch.last_buffered, 5);
    }

    #[test]
    fn stale_dictionary_heights_dropped() {
        // Heights below the cursor (already processed) are discarded.
        let response = dict(vec![1, 2, 50, 60], 100);
        let batch = compute_batch(40, 1000, Some(&response), &[], &no_bypass(), 10);
        assert_eq!(batch.heights, vec![50, 60]);
    }

    mod service {
        use super::*;
        use crate::dispatcher::{
            BlockWorker, DispatcherConfig, WorkerBlockResponse,
        };
        use crate::metadata::{InMemoryMetadataStore, ReindexCallback};
        use ethindexer_chain::{BlockHeader, ChainError, HeaderLookup};
        use std::sync::atomic::AtomicU32;

        struct StubTip {
            finalized: u64,
        }

        #[async_trait]
        impl ChainTipSource for StubTip {
            async fn finalized_header(&self) -> Result<BlockHeader, IndexerError> {
                Ok(header(self.finalized))
            }
            async fn best_height(&self) -> Result<u64, IndexerError> {
                Ok(self.finalized + 15)
            }
        }

        struct StubDictionary {
            start_height: u64,
            batch_blocks: Vec<u64>,
            scans: AtomicU32,
        }

        #[async_trait]
        impl DictionarySource for StubDictionary {
            async fn scan(
                &self,
                start: u64,
                end: u64,
                _limit: usize,
                _finalized: u64,
            ) -> Option<DictionaryResponse> {
                if start < self.start_height {
                    return None;
                }
                self.scans.fetch_add(1, Ordering::Relaxed);
                Some(DictionaryResponse {
                    batch_blocks: self
                        .batch_blocks
                        .iter()
                        .copied()
                        .filter(|h| *h >= start && *h <= end)
                        .collect(),
                    last_buffered_height: end,
                    blocks: vec![],
                })
            }

            fn update_queries(&self, _map: BTreeMap<u64, QueryEntry>) {}
        }

        struct NullChain;

        #[async_trait]
        impl HeaderLookup for NullChain {
            async fn header_by_height(&self, height: u64) -> Result<BlockHeader, ChainError> {
                Ok(header(height))
            }
            async fn header_by_hash(&self, hash: &str) -> Result<BlockHeader, ChainError> {
                Err(ChainError::Malformed(hash.into()))
            }
        }

        struct NullWorker;

        #[async_trait]
        impl BlockWorker for NullWorker {
            async fn process_block(
                &self,
                height: u64,
                _ds: Vec<DataSource>,
                _payload: Option<ethindexer_chain::EthBlock>,
            ) -> Result<WorkerBlockResponse, IndexerError> {
                Ok(WorkerBlockResponse {
                    height,
                    hash: format!("0xc{height}"),
                    parent_hash: format!("0xc{}", height - 1),
                    dynamic_data_sources: vec![],
                })
            }
        }

        fn header(height: u64) -> BlockHeader {
            BlockHeader {
                height,
                hash: format!("0xc{height}"),
                parent_hash: format!("0xc{}", height.saturating_sub(1)),
                timestamp: height * 12,
                state_root: "0xs".into(),
                logs_bloom: "0x0".into(),
                gas_limit: 0,
                gas_used: 0,
                base_fee_per_gas: None,
            }
        }

        fn build(
            dictionary: Option<Arc<dyn DictionarySource>>,
            batch_size: usize,
            finalized: u64,
        ) -> (Arc<FetchService>, Arc<BlockDispatcher>) {
            let store = Arc::new(InMemoryMetadataStore::new());
            let unfinalized = Arc::new(UnfinalizedBlocksService::new(
                Arc::new(NullChain),
                store.clone(),
                true,
            ));
            let reindex: ReindexCallback = Arc::new(|_| Box::pin(async { Ok(()) }));
            let ds_map = Arc::new(RwLock::new(BlockHeightMap::from_data_sources(&[])));
            let dispatcher = BlockDispatcher::new(
                DispatcherConfig {
                    capacity: batch_size * 2,
                    workers: 1,
                    worker_retries: 0,
                },
                Arc::new(NullWorker),
                store,
                unfinalized.clone(),
                ds_map.clone(),
                reindex,
            );
            // Dispatcher intentionally not started: iteration tests only
            // exercise scheduling, not processing.
            let config = NodeConfig {
                batch_size,
                ..Default::default()
            };
            let service = FetchService::new(
                config,
                Arc::new(StubTip { finalized }),
                dictionary,
                dispatcher.clone(),
                unfinalized,
                ds_map,
                1,
            )
            .unwrap();
            service.finalized_height.store(finalized, Ordering::Release);
            (service, dispatcher)
        }

        #[tokio::test]
        async fn iteration_advances_cursor_with_dictionary() {
            let dictionary = Arc::new(StubDictionary {
                start_height: 1,
                batch_blocks: vec![2, 4, 6, 8, 10],
                scans: AtomicU32::new(0),
            });
            let (service, dispatcher) = build(Some(dictionary), 10, 1000);

            let step = service.iteration().await.unwrap();
            assert_eq!(step, FetchStep::Enqueued(5));
            assert_eq!(dispatcher.latest_buffered_height(), 1000);
            assert_eq!(service.next_height(), 1001);

            // Past the target now.
            assert_eq!(service.iteration().await.unwrap(), FetchStep::CaughtUp);
        }

        #[tokio::test]
        async fn dictionary_behind_start_falls_back_dense() {
            let dictionary = Arc::new(StubDictionary {
                start_height: 100,
                batch_blocks: vec![200],
                scans: AtomicU32::new(0),
            });
            let (service, dispatcher) = build(Some(dictionary.clone()), 10, 1000);

            let step = service.iteration().await.unwrap();
            assert_eq!(step, FetchStep::Enqueued(10));
            assert_eq!(dispatcher.latest_buffered_height(), 10);
            assert_eq!(service.next_height(), 11);
            assert_eq!(dictionary.scans.load(Ordering::Relaxed), 0);
        }

        #[tokio::test]
        async fn backpressure_when_queue_full() {
            let (service, dispatcher) = build(None, 5, 1000);
            // Fill the queue to capacity (10 slots at batch size 5).
            dispatcher
                .enqueue_blocks(&(1..=10).collect::<Vec<_>>(), 10)
                .unwrap();
            assert_eq!(dispatcher.free_size(), 0);
            assert_eq!(service.iteration().await.unwrap(), FetchStep::Backpressured);
        }

        #[tokio::test]
        async fn free_size_truncates_batch() {
            let (service, dispatcher) = build(None, 5, 1000);
            dispatcher.enqueue_blocks(&[1, 2, 3, 4, 5, 6, 7], 7).unwrap();
            service.next_height.store(8, Ordering::Release);

            // Only 3 slots remain; the dense batch of 5 is clipped.
            let step = service.iteration().await.unwrap();
            assert_eq!(step, FetchStep::Enqueued(3));
            assert_eq!(service.next_height(), 11);
        }
    }
}
