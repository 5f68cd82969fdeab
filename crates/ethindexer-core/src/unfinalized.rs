//! Unfinalized block tracking and fork recovery.
//!
//! Every block above the finalized tip is remembered as a `(height, hash)`
//! pair. When the tip advances, the tracked hash at (or below) the new tip is
//! compared against the canonical chain; a mismatch is a fork and yields a
//! rewind height consistent with durable state. The whole list plus
//! `lastFinalizedVerifiedHeight` persists under a single metadata
//! transaction, so a cold start can replay the same verification before
//! indexing resumes.

use std::sync::Arc;

use tokio::sync::Mutex;

use ethindexer_chain::{BlockHeader, HeaderLookup};

use crate::error::IndexerError;
use crate::metadata::{keys, MetadataStore, MetadataTx};

/// Above this gap the verifiable block is fetched by height directly instead
/// of walking the parent-hash chain.
pub const UNFINALIZED_WALK_THRESHOLD: u64 = 200;

#[derive(Debug, Default)]
struct TrackerState {
    /// `(height, hash)` pairs, ascending and consecutive.
    unfinalized: Vec<(u64, String)>,
    finalized: Option<BlockHeader>,
    /// Highest height verified to match the canonical chain.
    last_checked_height: u64,
}

pub struct UnfinalizedBlocksService {
    chain: Arc<dyn HeaderLookup>,
    store: Arc<dyn MetadataStore>,
    enabled: bool,
    state: Mutex<TrackerState>,
}

impl UnfinalizedBlocksService {
    pub fn new(chain: Arc<dyn HeaderLookup>, store: Arc<dyn MetadataStore>, enabled: bool) -> Self {
        Self {
            chain,
            store,
            enabled,
            state: Mutex::new(TrackerState::default()),
        }
    }

    /// Load persisted state and replay verification against `finalized`.
    /// Returns the rewind height if the chain forked while we were down; the
    /// caller must trigger the reindex callback with it before indexing.
    pub async fn init(&self, finalized: BlockHeader) -> Result<Option<u64>, IndexerError> {
        {
            let mut state = self.state.lock().await;
            if let Some(raw) = self.store.read(keys::UNFINALIZED_BLOCKS).await? {
                state.unfinalized = serde_json::from_str(&raw)
                    .map_err(|e| IndexerError::Store(format!("bad unfinalizedBlocks: {e}")))?;
            }
            if let Some(raw) = self.store.read(keys::LAST_FINALIZED_VERIFIED_HEIGHT).await? {
                state.last_checked_height = raw
                    .parse()
                    .map_err(|e| IndexerError::Store(format!("bad lastFinalizedVerifiedHeight: {e}")))?;
            }
        }
        self.register_finalized(finalized).await;

        let tx = self.store.begin().await?;
        let rewind = self.process_unfinalized_blocks(None, tx).await?;
        if rewind.is_none() {
            self.store.commit(tx).await?;
        } else {
            // Leave durable state untouched; the reindex will rewrite it.
            self.store.rollback(tx).await?;
        }
        Ok(rewind)
    }

    /// Monotonic update of the finalized tip; stale updates are ignored.
    pub async fn register_finalized(&self, header: BlockHeader) {
        let mut state = self.state.lock().await;
        match &state.finalized {
            Some(current) if header.height <= current.height => {}
            _ => state.finalized = Some(header),
        }
    }

    pub async fn finalized_height(&self) -> Option<u64> {
        self.state.lock().await.finalized.as_ref().map(|h| h.height)
    }

    /// Heights currently tracked (test and observability hook).
    pub async fn unfinalized_heights(&self) -> Vec<u64> {
        self.state
            .lock()
            .await
            .unfinalized
            .iter()
            .map(|(h, _)| *h)
            .collect()
    }

    /// Register a processed block and verify the chain against the finalized
    /// tip. Returns the rewind height when a fork is detected; otherwise
    /// confirmed records are dropped and verification progress is persisted
    /// under `tx`.
    pub async fn process_unfinalized_blocks(
        &self,
        new_block: Option<(u64, &str)>,
        tx: MetadataTx,
    ) -> Result<Option<u64>, IndexerError> {
        let mut state = self.state.lock().await;

        if let Some((height, hash)) = new_block {
            register(&mut state, height, hash)?;
        }
        if !self.enabled {
            self.save(&state, tx).await?;
            return Ok(None);
        }
        let Some(finalized) = state.finalized.clone() else {
            self.save(&state, tx).await?;
            return Ok(None);
        };

        if self.has_forked(&state, &finalized).await? {
            let rewind = self.last_correct_finalized_block(&state, &finalized).await?;
            tracing::warn!(
                finalized = finalized.height,
                rewind,
                "fork detected below the finalized tip"
            );
            return Ok(Some(rewind));
        }

        // Verified: everything at or below the tip is confirmed.
        state.unfinalized.retain(|(h, _)| *h > finalized.height);
        state.last_checked_height = finalized.height;
        self.save(&state, tx).await?;
        Ok(None)
    }

    /// Truncate records above `height` after a rewind and persist under `tx`.
    pub async fn rewind_to(&self, height: u64, tx: MetadataTx) -> Result<(), IndexerError> {
        let mut state = self.state.lock().await;
        state.unfinalized.retain(|(h, _)| *h <= height);
        state.last_checked_height = state.last_checked_height.min(height);
        self.save(&state, tx).await?;
        Ok(())
    }

    async fn has_forked(
        &self,
        state: &TrackerState,
        finalized: &BlockHeader,
    ) -> Result<bool, IndexerError> {
        // The newest record the canonical chain can confirm or refute.
        let Some((height, hash)) = state
            .unfinalized
            .iter()
            .rev()
            .find(|(h, _)| *h <= finalized.height)
            .cloned()
        else {
            return Ok(false);
        };

        if height == finalized.height {
            return Ok(!hash.eq_ignore_ascii_case(&finalized.hash));
        }

        let gap = finalized.height - height;
        let canonical_hash = if gap > UNFINALIZED_WALK_THRESHOLD {
            self.chain.header_by_height(height).await?.hash
        } else {
            // Walk the parent chain down from the finalized header.
            let mut current = finalized.clone();
            while current.height > height + 1 {
                current = self.chain.header_by_hash(&current.parent_hash).await?;
            }
            current.parent_hash.clone()
        };

        Ok(!canonical_hash.eq_ignore_ascii_case(&hash))
    }

    /// Walk tracked records newest-first and return the highest height whose
    /// hash still matches the canonical chain. Falls back to the last height
    /// verified before the fork.
    async fn last_correct_finalized_block(
        &self,
        state: &TrackerState,
        finalized: &BlockHeader,
    ) -> Result<u64, IndexerError> {
        for (height, hash) in state
            .unfinalized
            .iter()
            .rev()
            .filter(|(h, _)| *h <= finalized.height)
        {
            if *height + 1 == finalized.height && finalized.parent_hash.eq_ignore_ascii_case(hash)
            {
                return Ok(*height);
            }
            let canonical = self.chain.header_by_height(*height).await?;
            if canonical.hash.eq_ignore_ascii_case(hash) {
                return Ok(*height);
            }
        }
        Ok(state.last_checked_height)
    }

    async fn save(&self, state: &TrackerState, tx: MetadataTx) -> Result<(), IndexerError> {
        let encoded = serde_json::to_string(&state.unfinalized)
            .map_err(|e| IndexerError::Store(e.to_string()))?;
        self.store.upsert(keys::UNFINALIZED_BLOCKS, &encoded, tx).await?;
        self.store
            .upsert(
                keys::LAST_FINALIZED_VERIFIED_HEIGHT,
                &state.last_checked_height.to_string(),
                tx,
            )
            .await?;
        Ok(())
    }
}

/// Append a record, enforcing the consecutive-height invariant.
fn register(state: &mut TrackerState, height: u64, hash: &str) -> Result<(), IndexerError> {
    if let Some(finalized) = &state.finalized {
        if height <= finalized.height {
            return Ok(()); // already final, nothing to track
        }
    }
    if let Some((last, _)) = state.unfinalized.last() {
        if height != last + 1 {
            return Err(IndexerError::InvariantViolation(format!(
                "unfinalized block {height} does not follow {last}"
            )));
        }
    }
    state.unfinalized.push((height, hash.to_lowercase()));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use ethindexer_chain::ChainError;
    use std::collections::HashMap;

    use crate::metadata::InMemoryMetadataStore;

    /// Canonical chain fixture addressable by height and hash.
    struct MockChain {
        by_height: HashMap<u64, BlockHeader>,
    }

    impl MockChain {
        /// Build heights `[from, to]` with hashes `0xc{height}`.
        fn canonical(from: u64, to: u64) -> Arc<Self> {
            let mut by_height = HashMap::new();
            for height in from..=to {
                by_height.insert(height, header(height, &ch(height), &ch(height - 1)));
            }
            Arc::new(Self { by_height })
        }
    }

    fn ch(height: u64) -> String {
        format!("0xc{height}")
    }

    fn header(height: u64, hash: &str, parent: &str) -> BlockHeader {
        BlockHeader {
            height,
            hash: hash.into(),
            parent_hash: parent.into(),
            timestamp: height * 12,
            state_root: "0xs".into(),
            logs_bloom: "0x0".into(),
            gas_limit: 0,
            gas_used: 0,
            base_fee_per_gas: None,
        }
    }

    #[async_trait]
    impl HeaderLookup for MockChain {
        async fn header_by_height(&self, height: u64) -> Result<BlockHeader, ChainError> {
            self.by_height
                .get(&height)
                .cloned()
                .ok_or(ChainError::BlockNotFound(height))
        }

        async fn header_by_hash(&self, hash: &str) -> Result<BlockHeader, ChainError> {
            self.by_height
                .values()
                .find(|h| h.hash == hash)
                .cloned()
                .ok_or_else(|| ChainError::Malformed(format!("unknown hash {hash}")))
        }
    }

    fn service(chain: Arc<MockChain>) -> (UnfinalizedBlocksService, Arc<InMemoryMetadataStore>) {
        let store = Arc::new(InMemoryMetadataStore::new());
        (
            UnfinalizedBlocksService::new(chain, store.clone(), true),
            store,
        )
    }

    #[tokio::test]
    async fn consecutive_invariant_enforced() {
        let (svc, store) = service(MockChain::canonical(1, 10));
        let tx = store.begin().await.unwrap();

        svc.process_unfinalized_blocks(Some((100, "0xa")), tx).await.unwrap();
        svc.process_unfinalized_blocks(Some((101, "0xb")), tx).await.unwrap();

        let err = svc
            .process_unfinalized_blocks(Some((103, "0xd")), tx)
            .await
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn heights_at_or_below_finalized_dropped() {
        let chain = MockChain::canonical(95, 110);
        let (svc, store) = service(chain.clone());
        svc.register_finalized(chain.by_height[&100].clone()).await;

        let tx = store.begin().await.unwrap();
        svc.process_unfinalized_blocks(Some((99, "0xstale")), tx).await.unwrap();
        assert!(svc.unfinalized_heights().await.is_empty());
    }

    #[tokio::test]
    async fn clean_advance_confirms_records() {
        let chain = MockChain::canonical(95, 110);
        let (svc, store) = service(chain.clone());
        svc.register_finalized(chain.by_height[&100].clone()).await;

        let tx = store.begin().await.unwrap();
        for height in 101..=105 {
            let hash = ch(height);
            let rewind = svc
                .process_unfinalized_blocks(Some((height, &hash)), tx)
                .await
                .unwrap();
            assert!(rewind.is_none());
        }
        store.commit(tx).await.unwrap();

        // Tip advances to 103 on the canonical chain: 101..=103 confirmed.
        svc.register_finalized(chain.by_height[&103].clone()).await;
        let tx = store.begin().await.unwrap();
        let rewind = svc.process_unfinalized_blocks(None, tx).await.unwrap();
        store.commit(tx).await.unwrap();

        assert!(rewind.is_none());
        assert_eq!(svc.unfinalized_heights().await, vec![104, 105]);
        assert_eq!(
            store
                .read(keys::LAST_FINALIZED_VERIFIED_HEIGHT)
                .await
                .unwrap()
                .as_deref(),
            Some("103")
        );
    }

    #[tokio::test]
    async fn fork_at_finalized_height_rewinds() {
        // Canonical chain at 100 is 0xc100; we processed 0xa at 100.
        let chain = MockChain::canonical(95, 110);
        let (svc, store) = service(chain.clone());
        svc.register_finalized(chain.by_height[&99].clone()).await;

        // Verify once at 99 so last_checked_height is meaningful.
        let tx = store.begin().await.unwrap();
        svc.process_unfinalized_blocks(None, tx).await.unwrap();
        store.commit(tx).await.unwrap();

        let tx = store.begin().await.unwrap();
        svc.process_unfinalized_blocks(Some((100, "0xa")), tx).await.unwrap();
        svc.process_unfinalized_blocks(Some((101, "0xb")), tx).await.unwrap();
        svc.process_unfinalized_blocks(Some((102, "0xc")), tx).await.unwrap();
        store.commit(tx).await.unwrap();

        // Finalized advances to 101 with a canonical hash ≠ 0xb.
        svc.register_finalized(chain.by_height[&101].clone()).await;
        let tx = store.begin().await.unwrap();
        let rewind = svc.process_unfinalized_blocks(None, tx).await.unwrap();

        // Nothing we tracked matches canonical — fall back to last verified.
        assert_eq!(rewind, Some(99));
    }

    #[tokio::test]
    async fn fork_rewinds_to_last_matching_record() {
        let chain = MockChain::canonical(95, 110);
        let (svc, store) = service(chain.clone());
        svc.register_finalized(chain.by_height[&99].clone()).await;

        let tx = store.begin().await.unwrap();
        // 100 matches canonical, 101 does not.
        svc.process_unfinalized_blocks(Some((100, &ch(100))), tx).await.unwrap();
        svc.process_unfinalized_blocks(Some((101, "0xforked")), tx).await.unwrap();
        svc.process_unfinalized_blocks(Some((102, "0xforked2")), tx).await.unwrap();
        store.commit(tx).await.unwrap();

        svc.register_finalized(chain.by_height[&101].clone()).await;
        let tx = store.begin().await.unwrap();
        let rewind = svc.process_unfinalized_blocks(None, tx).await.unwrap();
        assert_eq!(rewind, Some(100));

        // A rewind never advances the cursor.
        assert!(rewind.unwrap() <= 101);
    }

    #[tokio::test]
    async fn parent_walk_verifies_below_tip() {
        let chain = MockChain::canonical(90, 120);
        let (svc, store) = service(chain.clone());
        svc.register_finalized(chain.by_height[&100].clone()).await;

        let tx = store.begin().await.unwrap();
        svc.process_unfinalized_blocks(Some((101, &ch(101))), tx).await.unwrap();
        svc.process_unfinalized_blocks(Some((102, &ch(102))), tx).await.unwrap();
        store.commit(tx).await.unwrap();

        // Tip jumps to 110; the verifiable record (102) is below it, so the
        // parent chain is walked down from 110.
        svc.register_finalized(chain.by_height[&110].clone()).await;
        let tx = store.begin().await.unwrap();
        let rewind = svc.process_unfinalized_blocks(None, tx).await.unwrap();
        store.commit(tx).await.unwrap();

        assert!(rewind.is_none());
        assert!(svc.unfinalized_heights().await.is_empty());
    }

    #[tokio::test]
    async fn persisted_list_roundtrips_on_init() {
        let chain = MockChain::canonical(95, 110);
        let (svc, store) = service(chain.clone());
        svc.register_finalized(chain.by_height[&100].clone()).await;

        let tx = store.begin().await.unwrap();
        svc.process_unfinalized_blocks(Some((101, &ch(101))), tx).await.unwrap();
        svc.process_unfinalized_blocks(Some((102, &ch(102))), tx).await.unwrap();
        store.commit(tx).await.unwrap();

        // Fresh service over the same store: cold-start replay.
        let restarted = UnfinalizedBlocksService::new(chain.clone(), store.clone(), true);
        let rewind = restarted.init(chain.by_height[&101].clone()).await.unwrap();
        assert!(rewind.is_none());
        assert_eq!(restarted.unfinalized_heights().await, vec![102]);
    }

    #[tokio::test]
    async fn disabled_service_never_forks() {
        let chain = MockChain::canonical(95, 110);
        let store = Arc::new(InMemoryMetadataStore::new());
        let svc = UnfinalizedBlocksService::new(chain.clone(), store.clone(), false);
        svc.register_finalized(chain.by_height[&101].clone()).await;

        let tx = store.begin().await.unwrap();
        // A hash that would fork if tracking were enabled.
        svc.process_unfinalized_blocks(Some((102, "0xwild")), tx).await.unwrap();
        svc.register_finalized(chain.by_height[&102].clone()).await;
        let rewind = svc.process_unfinalized_blocks(None, tx).await.unwrap();
        assert!(rewind.is_none());
    }
}
