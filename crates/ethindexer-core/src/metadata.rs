//! The metadata store contract: keyed text values with transactional upserts.
//!
//! The relational store behind it is external; the pipeline only relies on
//! this interface plus the guarantee that all upserts within one transaction
//! land atomically with respect to the reindex callback.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use futures::future::BoxFuture;
use std::sync::Arc;

use crate::error::IndexerError;

/// Well-known metadata keys.
pub mod keys {
    pub const UNFINALIZED_BLOCKS: &str = "unfinalizedBlocks";
    pub const LAST_FINALIZED_VERIFIED_HEIGHT: &str = "lastFinalizedVerifiedHeight";
    pub const LAST_PROCESSED_HEIGHT: &str = "lastProcessedHeight";
    pub const LAST_PROCESSED_TIMESTAMP: &str = "lastProcessedTimestamp";
    pub const GENESIS_HASH: &str = "genesisHash";
    pub const CHAIN: &str = "chain";
    pub const SPEC_NAME: &str = "specName";
}

/// Opaque transaction handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MetadataTx(u64);

/// Callback invoked when a fork rewind requires the durable store to roll
/// back to `height`. Runs within the same transaction as the metadata writes.
pub type ReindexCallback =
    Arc<dyn Fn(u64) -> BoxFuture<'static, Result<(), IndexerError>> + Send + Sync>;

/// Keyed text storage with transactional writes.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn begin(&self) -> Result<MetadataTx, IndexerError>;

    /// Stage `key = value` inside `tx`.
    async fn upsert(&self, key: &str, value: &str, tx: MetadataTx) -> Result<(), IndexerError>;

    /// Atomically apply everything staged in `tx`.
    async fn commit(&self, tx: MetadataTx) -> Result<(), IndexerError>;

    /// Discard everything staged in `tx`.
    async fn rollback(&self, tx: MetadataTx) -> Result<(), IndexerError>;

    /// Read the committed value of `key`.
    async fn read(&self, key: &str) -> Result<Option<String>, IndexerError>;
}

/// In-memory store for tests and ephemeral runs. All data is lost when the
/// process exits.
#[derive(Default)]
pub struct InMemoryMetadataStore {
    committed: Mutex<HashMap<String, String>>,
    staged: Mutex<HashMap<u64, Vec<(String, String)>>>,
    next_tx: AtomicU64,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn begin(&self) -> Result<MetadataTx, IndexerError> {
        let id = self.next_tx.fetch_add(1, Ordering::Relaxed);
        self.staged.lock().unwrap().insert(id, Vec::new());
        Ok(MetadataTx(id))
    }

    async fn upsert(&self, key: &str, value: &str, tx: MetadataTx) -> Result<(), IndexerError> {
        let mut staged = self.staged.lock().unwrap();
        let entries = staged
            .get_mut(&tx.0)
            .ok_or_else(|| IndexerError::Store(format!("unknown tx {}", tx.0)))?;
        entries.push((key.to_string(), value.to_string()));
        Ok(())
    }

    async fn commit(&self, tx: MetadataTx) -> Result<(), IndexerError> {
        let entries = self
            .staged
            .lock()
            .unwrap()
            .remove(&tx.0)
            .ok_or_else(|| IndexerError::Store(format!("unknown tx {}", tx.0)))?;
        let mut committed = self.committed.lock().unwrap();
        for (key, value) in entries {
            committed.insert(key, value);
        }
        Ok(())
    }

    async fn rollback(&self, tx: MetadataTx) -> Result<(), IndexerError> {
        self.staged.lock().unwrap().remove(&tx.0);
        Ok(())
    }

    async fn read(&self, key: &str) -> Result<Option<String>, IndexerError> {
        Ok(self.committed.lock().unwrap().get(key).cloned())
    }
}
