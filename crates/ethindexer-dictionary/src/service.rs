//! Dictionary endpoint selection and fallback policy.
//!
//! Each configured endpoint is probed for v2 at startup and falls back to v1;
//! v2 endpoints are preferred in scheduling order. Every scan revalidates the
//! endpoint's metadata against the indexed chain, clamps the query end to
//! what the dictionary and the chain have seen, and turns any failure into
//! `None` so the fetcher can fall back to dense enumeration for the cycle.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::client::{
    clamp_query_end, DictionaryClient, DictionaryResponse, DictionaryVersion,
};
use crate::entry::QueryEntry;
use crate::v1::V1Dictionary;
use crate::v2::V2Dictionary;

pub struct DictionaryService {
    clients: Vec<Arc<dyn DictionaryClient>>,
    current: AtomicUsize,
    timeout: Duration,
    chain_id: String,
    genesis_hash: String,
}

impl DictionaryService {
    pub fn new(
        clients: Vec<Arc<dyn DictionaryClient>>,
        chain_id: impl Into<String>,
        genesis_hash: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            clients,
            current: AtomicUsize::new(0),
            timeout,
            chain_id: chain_id.into(),
            genesis_hash: genesis_hash.into(),
        }
    }

    /// Negotiate a client per endpoint: try v2 `create()`, fall back to v1.
    /// v2 endpoints are scheduled first.
    pub async fn connect(
        endpoints: Vec<String>,
        chain_id: impl Into<String>,
        genesis_hash: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        let mut v2: Vec<Arc<dyn DictionaryClient>> = Vec::new();
        let mut v1: Vec<Arc<dyn DictionaryClient>> = Vec::new();

        for endpoint in endpoints {
            match V2Dictionary::create(&endpoint).await {
                Ok(client) => {
                    tracing::info!(endpoint = %endpoint, "dictionary speaks v2");
                    v2.push(Arc::new(client));
                }
                Err(e) => {
                    tracing::debug!(endpoint = %endpoint, error = %e, "not a v2 dictionary, using v1");
                    v1.push(Arc::new(V1Dictionary::new(&endpoint)));
                }
            }
        }

        v2.extend(v1);
        Self::new(v2, chain_id, genesis_hash, timeout)
    }

    pub fn has_clients(&self) -> bool {
        !self.clients.is_empty()
    }

    pub fn current_version(&self) -> Option<DictionaryVersion> {
        let idx = self.current.load(Ordering::Relaxed);
        self.clients.get(idx % self.clients.len().max(1)).map(|c| c.version())
    }

    /// Push a rebuilt query map to every endpoint.
    pub fn update_queries_map(&self, map: BTreeMap<u64, QueryEntry>) {
        for client in &self.clients {
            client.update_queries_map(map.clone());
        }
    }

    fn advance(&self, from: usize) {
        self.current
            .store((from + 1) % self.clients.len().max(1), Ordering::Relaxed);
    }

    /// Scan `[start, end]` through the current endpoint.
    ///
    /// `None` means "fall back to a dense fetch for this cycle": the
    /// dictionary is behind, serves the wrong chain, timed out, or errored.
    /// The next cycle retries — it may have caught up.
    pub async fn get_data(
        &self,
        start: u64,
        end: u64,
        limit: usize,
        finalized_height: u64,
    ) -> Option<DictionaryResponse> {
        if self.clients.is_empty() {
            return None;
        }

        let first = self.current.load(Ordering::Relaxed) % self.clients.len();
        for step in 0..self.clients.len() {
            let idx = (first + step) % self.clients.len();
            let client = &self.clients[idx];

            let metadata =
                match tokio::time::timeout(self.timeout, client.init_metadata()).await {
                    Ok(Ok(meta)) => meta,
                    Ok(Err(e)) => {
                        tracing::warn!(endpoint = %client.endpoint(), error = %e, "dictionary metadata failed");
                        self.advance(idx);
                        continue;
                    }
                    Err(_) => {
                        tracing::warn!(endpoint = %client.endpoint(), "dictionary metadata timed out");
                        self.advance(idx);
                        continue;
                    }
                };

            if let Err(e) = metadata.validate(&self.chain_id, &self.genesis_hash) {
                tracing::warn!(endpoint = %client.endpoint(), error = %e, "dictionary serves wrong chain");
                self.advance(idx);
                continue;
            }

            // Below its indexed window: dense fetch, don't issue a scan.
            if start < metadata.start_height {
                tracing::debug!(
                    start,
                    dictionary_start = metadata.start_height,
                    "dictionary starts above requested height"
                );
                return None;
            }
            // Behind the cursor: skip for this cycle, retry next.
            if metadata.last_processed_height < start {
                tracing::debug!(
                    start,
                    last_processed = metadata.last_processed_height,
                    "dictionary behind, falling back for this cycle"
                );
                return None;
            }

            let query_end = clamp_query_end(end, metadata.last_processed_height, finalized_height);
            match tokio::time::timeout(self.timeout, client.get_data(start, query_end, limit)).await
            {
                Ok(Ok(response)) => return Some(response),
                Ok(Err(e)) => {
                    tracing::warn!(endpoint = %client.endpoint(), error = %e, "dictionary scan failed");
                    self.advance(idx);
                }
                Err(_) => {
                    tracing::warn!(endpoint = %client.endpoint(), timeout_ms = self.timeout.as_millis() as u64, "dictionary scan timed out");
                    return None;
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::DictionaryMetadata;
    use crate::error::DictionaryError;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    struct StubDictionary {
        metadata: DictionaryMetadata,
        heights: Vec<u64>,
        scans: AtomicU32,
        fail_scans: bool,
    }

    impl StubDictionary {
        fn client(metadata: DictionaryMetadata, heights: Vec<u64>) -> Arc<Self> {
            Arc::new(Self {
                metadata,
                heights,
                scans: AtomicU32::new(0),
                fail_scans: false,
            })
        }
    }

    #[async_trait]
    impl DictionaryClient for StubDictionary {
        fn version(&self) -> DictionaryVersion {
            DictionaryVersion::V1
        }

        fn endpoint(&self) -> &str {
            "stub://dictionary"
        }

        async fn init_metadata(&self) -> Result<DictionaryMetadata, DictionaryError> {
            Ok(self.metadata.clone())
        }

        fn update_queries_map(&self, _map: BTreeMap<u64, QueryEntry>) {}

        async fn get_data(
            &self,
            start: u64,
            end: u64,
            limit: usize,
        ) -> Result<DictionaryResponse, DictionaryError> {
            self.scans.fetch_add(1, Ordering::Relaxed);
            if self.fail_scans {
                return Err(DictionaryError::Unavailable("stub failure".into()));
            }
            let batch: Vec<u64> = self
                .heights
                .iter()
                .copied()
                .filter(|h| *h >= start && *h <= end)
                .take(limit)
                .collect();
            Ok(DictionaryResponse {
                batch_blocks: batch,
                last_buffered_height: end,
                blocks: vec![],
            })
        }
    }

    fn meta(start: u64, last: u64) -> DictionaryMetadata {
        DictionaryMetadata {
            chain: Some("0x1".into()),
            genesis_hash: Some("0xgen".into()),
            last_processed_height: last,
            start_height: start,
        }
    }

    fn service(clients: Vec<Arc<dyn DictionaryClient>>) -> DictionaryService {
        DictionaryService::new(clients, "0x1", "0xgen", Duration::from_secs(1))
    }

    #[tokio::test]
    async fn scan_returns_matching_heights() {
        let stub = StubDictionary::client(meta(1, 10_000), vec![2, 4, 6, 8, 10]);
        let svc = service(vec![stub]);
        let response = svc.get_data(1, 1000, 10, 1000).await.unwrap();
        assert_eq!(response.batch_blocks, vec![2, 4, 6, 8, 10]);
    }

    #[tokio::test]
    async fn start_below_dictionary_window_is_dense() {
        let stub = StubDictionary::client(meta(100, 10_000), vec![200]);
        let svc = service(vec![stub.clone()]);
        assert!(svc.get_data(1, 1000, 10, 1000).await.is_none());
        // No scan was issued.
        assert_eq!(stub.scans.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn behind_dictionary_skipped_for_cycle() {
        let stub = StubDictionary::client(meta(1, 50), vec![]);
        let svc = service(vec![stub.clone()]);
        assert!(svc.get_data(100, 1000, 10, 1000).await.is_none());
        assert_eq!(stub.scans.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn wrong_chain_rotates_to_next_client() {
        let wrong = Arc::new(StubDictionary {
            metadata: DictionaryMetadata {
                chain: Some("0x5".into()),
                genesis_hash: Some("0xother".into()),
                last_processed_height: 10_000,
                start_height: 1,
            },
            heights: vec![1],
            scans: AtomicU32::new(0),
            fail_scans: false,
        });
        let right = StubDictionary::client(meta(1, 10_000), vec![7]);
        let svc = service(vec![wrong.clone(), right.clone()]);

        let response = svc.get_data(1, 1000, 10, 1000).await.unwrap();
        assert_eq!(response.batch_blocks, vec![7]);
        assert_eq!(wrong.scans.load(Ordering::Relaxed), 0);
        assert_eq!(right.scans.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn scan_failure_falls_back() {
        let failing = Arc::new(StubDictionary {
            metadata: meta(1, 10_000),
            heights: vec![],
            scans: AtomicU32::new(0),
            fail_scans: true,
        });
        let svc = service(vec![failing]);
        assert!(svc.get_data(1, 1000, 10, 1000).await.is_none());
    }

    #[tokio::test]
    async fn query_end_clamped_to_finalized() {
        let stub = StubDictionary::client(meta(1, 10_000), vec![500, 1500]);
        let svc = service(vec![stub]);
        // finalized at 1000 clips the second match
        let response = svc.get_data(1, 5000, 10, 1000).await.unwrap();
        assert_eq!(response.batch_blocks, vec![500]);
        assert_eq!(response.last_buffered_height, 1000);
    }
}
