//! Bounded work queue feeding block-processing workers.
//!
//! The fetch service enqueues heights; a small worker pool pulls them in
//! ascending order, fetches/processes each block, and hands results to a
//! single committer. Heights are handed out ascending and commits also
//! complete ascending — a completed-but-not-committed block waits for its
//! predecessor. Each commit registers the block with the unfinalized tracker
//! and persists the new last-processed height in the same transaction; a
//! detected fork flushes the queue, reindexes durable state, and surfaces a
//! rewind event to the fetcher. A worker failure after its internal retries
//! is fatal — the loop is not allowed to skip a height.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use ethindexer_chain::{BlockHeightMap, DataSource, EthBlock};

use crate::error::IndexerError;
use crate::metadata::{keys, MetadataStore, ReindexCallback};
use crate::unfinalized::UnfinalizedBlocksService;

/// Messages exchanged with a block worker. Values cross the boundary, never
/// handles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WorkerRequest {
    FetchBlock { height: u64 },
    ProcessBlock { height: u64, data_sources: Vec<DataSource> },
}

/// A worker's answer to `ProcessBlock`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerBlockResponse {
    pub height: u64,
    pub hash: String,
    pub parent_hash: String,
    /// Data sources created by handlers while processing this block.
    #[serde(default)]
    pub dynamic_data_sources: Vec<DataSource>,
}

/// The in-process worker seam.
#[async_trait]
pub trait BlockWorker: Send + Sync {
    /// Fetch (or accept the dictionary payload of) and process one block.
    async fn process_block(
        &self,
        height: u64,
        data_sources: Vec<DataSource>,
        payload: Option<EthBlock>,
    ) -> Result<WorkerBlockResponse, IndexerError>;
}

/// Events the dispatcher surfaces to the fetch service.
#[derive(Debug)]
pub enum DispatcherEvent {
    /// A fork was handled; the fetcher must resume from `height + 1`.
    Rewound { height: u64 },
    /// Handlers created new data sources starting at `start_block`.
    DynamicDsCreated { start_block: u64 },
    /// Unrecoverable failure; the process must stop.
    Fatal(IndexerError),
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Queue capacity; ≈ 2 × batch size.
    pub capacity: usize,
    pub workers: usize,
    /// Internal retries per block before the failure is fatal.
    pub worker_retries: u32,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            capacity: 60,
            workers: 2,
            worker_retries: 3,
        }
    }
}

struct QueueState {
    pending: VecDeque<u64>,
    /// Heights handed to workers, in hand-out (= commit) order.
    issued: VecDeque<u64>,
    in_flight: usize,
    /// Bumped on flush so stale worker results are discarded.
    epoch: u64,
}

struct Shared {
    queue: Mutex<QueueState>,
    payloads: Mutex<HashMap<u64, EthBlock>>,
    latest_buffered: AtomicU64,
    latest_processed: AtomicU64,
    shutdown: AtomicBool,
    work_ready: Notify,
}

type WorkerResult = (u64, Result<WorkerBlockResponse, IndexerError>);

pub struct BlockDispatcher {
    config: DispatcherConfig,
    shared: Arc<Shared>,
    worker: Arc<dyn BlockWorker>,
    store: Arc<dyn MetadataStore>,
    unfinalized: Arc<UnfinalizedBlocksService>,
    ds_map: Arc<RwLock<BlockHeightMap<DataSource>>>,
    reindex: ReindexCallback,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BlockDispatcher {
    pub fn new(
        config: DispatcherConfig,
        worker: Arc<dyn BlockWorker>,
        store: Arc<dyn MetadataStore>,
        unfinalized: Arc<UnfinalizedBlocksService>,
        ds_map: Arc<RwLock<BlockHeightMap<DataSource>>>,
        reindex: ReindexCallback,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            shared: Arc::new(Shared {
                queue: Mutex::new(QueueState {
                    pending: VecDeque::new(),
                    issued: VecDeque::new(),
                    in_flight: 0,
                    epoch: 0,
                }),
                payloads: Mutex::new(HashMap::new()),
                latest_buffered: AtomicU64::new(0),
                latest_processed: AtomicU64::new(0),
                shutdown: AtomicBool::new(false),
                work_ready: Notify::new(),
            }),
            worker,
            store,
            unfinalized,
            ds_map,
            reindex,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Remaining queue slots. Never negative.
    pub fn free_size(&self) -> usize {
        let queue = self.shared.queue.lock().unwrap();
        self.config
            .capacity
            .saturating_sub(queue.pending.len() + queue.in_flight)
    }

    pub fn latest_buffered_height(&self) -> u64 {
        self.shared.latest_buffered.load(Ordering::Acquire)
    }

    pub fn latest_processed_height(&self) -> u64 {
        self.shared.latest_processed.load(Ordering::Acquire)
    }

    /// Record a dictionary-provided payload so the worker can skip the fetch.
    pub fn stash_payload(&self, block: EthBlock) {
        self.shared
            .payloads
            .lock()
            .unwrap()
            .insert(block.height(), block);
    }

    /// Non-blocking enqueue. `heights` must fit in `free_size`; an empty list
    /// still advances the buffered cursor to `last_buffered`.
    pub fn enqueue_blocks(&self, heights: &[u64], last_buffered: u64) -> Result<(), IndexerError> {
        let mut queue = self.shared.queue.lock().unwrap();
        let free = self
            .config
            .capacity
            .saturating_sub(queue.pending.len() + queue.in_flight);
        if heights.len() > free {
            return Err(IndexerError::InvariantViolation(format!(
                "enqueue of {} blocks exceeds free size {free}",
                heights.len()
            )));
        }
        queue.pending.extend(heights.iter().copied());
        let idle = queue.pending.is_empty() && queue.in_flight == 0;
        drop(queue);

        self.shared
            .latest_buffered
            .store(last_buffered, Ordering::Release);
        if heights.is_empty() && idle {
            // Nothing will ever be processed in this window; the cursor
            // advances so progress is still recorded.
            self.shared
                .latest_processed
                .store(last_buffered, Ordering::Release);
        }
        self.shared.work_ready.notify_waiters();
        Ok(())
    }

    /// Drop queued heights strictly above `height` and invalidate in-flight
    /// work. Used on fork rewind.
    pub fn flush_queue(&self, height: u64) {
        let mut queue = self.shared.queue.lock().unwrap();
        queue.pending.retain(|h| *h <= height);
        queue.issued.clear();
        queue.in_flight = 0;
        queue.epoch += 1;
        drop(queue);

        self.shared
            .payloads
            .lock()
            .unwrap()
            .retain(|h, _| *h <= height);
        self.shared
            .latest_buffered
            .store(height, Ordering::Release);
    }

    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.work_ready.notify_waiters();
    }

    /// Spawn the worker pool and the committer.
    pub fn start(self: &Arc<Self>, events: mpsc::UnboundedSender<DispatcherEvent>) {
        let (results_tx, results_rx) = mpsc::unbounded_channel::<WorkerResult>();

        let mut tasks = self.tasks.lock().unwrap();
        for worker_id in 0..self.config.workers.max(1) {
            let dispatcher = self.clone();
            let results = results_tx.clone();
            tasks.push(tokio::spawn(async move {
                dispatcher.worker_loop(worker_id, results).await;
            }));
        }
        let dispatcher = self.clone();
        tasks.push(tokio::spawn(async move {
            dispatcher.commit_loop(results_rx, events).await;
        }));
    }

    fn take_next(&self) -> Option<(u64, u64)> {
        let mut queue = self.shared.queue.lock().unwrap();
        let height = queue.pending.pop_front()?;
        queue.issued.push_back(height);
        queue.in_flight += 1;
        Some((queue.epoch, height))
    }

    async fn worker_loop(&self, worker_id: usize, results: mpsc::UnboundedSender<WorkerResult>) {
        loop {
            if self.shared.shutdown.load(Ordering::Acquire) {
                break;
            }
            // Register interest before checking the queue so an enqueue
            // between the check and the await is not lost.
            let notified = self.shared.work_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let Some((epoch, height)) = self.take_next() else {
                notified.await;
                continue;
            };

            let payload = self.shared.payloads.lock().unwrap().remove(&height);
            let data_sources = self.ds_map.read().unwrap().get(height).to_vec();

            let mut attempt = 0;
            let result = loop {
                match self
                    .worker
                    .process_block(height, data_sources.clone(), payload.clone())
                    .await
                {
                    Ok(response) => break Ok(response),
                    Err(e) if e.is_fatal() => break Err(e),
                    Err(e) if attempt < self.config.worker_retries => {
                        attempt += 1;
                        tracing::warn!(
                            worker_id,
                            height,
                            attempt,
                            error = %e,
                            "block processing failed, retrying"
                        );
                        tokio::time::sleep(Duration::from_millis(200)).await;
                    }
                    Err(e) => {
                        break Err(IndexerError::Handler {
                            height,
                            reason: e.to_string(),
                        })
                    }
                }
            };

            let failed = result.is_err();
            if results.send((epoch, result)).is_err() || failed {
                break; // committer gone or fatal failure queued
            }
        }
    }

    async fn commit_loop(
        &self,
        mut results: mpsc::UnboundedReceiver<WorkerResult>,
        events: mpsc::UnboundedSender<DispatcherEvent>,
    ) {
        let mut completed: BTreeMap<u64, WorkerBlockResponse> = BTreeMap::new();

        while let Some((epoch, result)) = results.recv().await {
            {
                let queue = self.shared.queue.lock().unwrap();
                if epoch != queue.epoch {
                    continue; // flushed while in flight
                }
            }

            let response = match result {
                Ok(response) => response,
                Err(e) => {
                    tracing::error!(error = %e, "worker failed, stopping dispatcher");
                    self.shutdown();
                    let _ = events.send(DispatcherEvent::Fatal(e));
                    return;
                }
            };
            completed.insert(response.height, response);

            // Commit every completed block at the front of the issue order.
            loop {
                let next = {
                    let queue = self.shared.queue.lock().unwrap();
                    queue.issued.front().copied()
                };
                let Some(next) = next else { break };
                let Some(response) = completed.remove(&next) else {
                    break; // predecessor still running
                };

                match self.commit_block(&response).await {
                    Ok(None) => {
                        let mut queue = self.shared.queue.lock().unwrap();
                        queue.issued.pop_front();
                        queue.in_flight = queue.in_flight.saturating_sub(1);
                        let idle = queue.pending.is_empty() && queue.in_flight == 0;
                        drop(queue);
                        if idle {
                            // Queue drained: progress is the buffered cursor.
                            let buffered =
                                self.shared.latest_buffered.load(Ordering::Acquire);
                            if buffered > response.height {
                                self.shared
                                    .latest_processed
                                    .store(buffered, Ordering::Release);
                            }
                        }
                        self.shared.work_ready.notify_waiters();
                    }
                    Ok(Some(rewind)) => {
                        completed.clear();
                        let _ = events.send(DispatcherEvent::Rewound { height: rewind });
                        break;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "commit failed, stopping dispatcher");
                        self.shutdown();
                        let _ = events.send(DispatcherEvent::Fatal(e));
                        return;
                    }
                }

                if !response.dynamic_data_sources.is_empty() {
                    let start = response
                        .dynamic_data_sources
                        .iter()
                        .map(|ds| ds.start_block)
                        .min()
                        .unwrap_or(response.height);
                    let _ = events.send(DispatcherEvent::DynamicDsCreated { start_block: start });
                }
            }
        }
    }

    /// Register the block with the tracker and persist progress in one
    /// transaction. Returns the rewind height when a fork was handled.
    async fn commit_block(
        &self,
        response: &WorkerBlockResponse,
    ) -> Result<Option<u64>, IndexerError> {
        let tx = self.store.begin().await?;
        let rewind = self
            .unfinalized
            .process_unfinalized_blocks(Some((response.height, &response.hash)), tx)
            .await?;

        if let Some(rewind) = rewind {
            self.flush_queue(rewind);
            (self.reindex)(rewind).await?;
            self.unfinalized.rewind_to(rewind, tx).await?;
            self.store
                .upsert(keys::LAST_PROCESSED_HEIGHT, &rewind.to_string(), tx)
                .await?;
            self.store.commit(tx).await?;
            self.shared
                .latest_processed
                .store(rewind, Ordering::Release);
            return Ok(Some(rewind));
        }

        self.store
            .upsert(keys::LAST_PROCESSED_HEIGHT, &response.height.to_string(), tx)
            .await?;
        self.store
            .upsert(
                keys::LAST_PROCESSED_TIMESTAMP,
                &chrono::Utc::now().timestamp_millis().to_string(),
                tx,
            )
            .await?;
        self.store.commit(tx).await?;
        self.shared
            .latest_processed
            .store(response.height, Ordering::Release);
        Ok(None)
    }
}
