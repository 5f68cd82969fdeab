//! Ethereum-semantics facade over the connection pool.
//!
//! Finalization prefers the `finalized` block tag; endpoints that reject it
//! (pre-merge chains) are downgraded permanently to `best − 15` for the life
//! of the process. `fetch_block` composes `eth_getBlockByNumber` (full tx
//! bodies) and `eth_getLogs` for the same height in parallel. Receipts are
//! deferred and memoized per transaction hash.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};

use ethindexer_rpc::{ConnectionPool, RpcError};

use crate::error::ChainError;
use crate::types::{parse_hex_u64, to_hex, BlockHeader, EthBlock, RawBlock, RawLog};

/// Depth subtracted from the best height when the endpoint has no
/// `finalized` tag.
pub const FINALIZATION_DEPTH_FALLBACK: u64 = 15;

/// A block addressed by height or hash.
#[derive(Debug, Clone)]
pub enum BlockRef {
    Height(u64),
    Hash(String),
}

/// Header reads needed by fork detection. Implemented by [`ChainApi`] and
/// mocked in tests.
#[async_trait]
pub trait HeaderLookup: Send + Sync {
    async fn header_by_height(&self, height: u64) -> Result<BlockHeader, ChainError>;
    async fn header_by_hash(&self, hash: &str) -> Result<BlockHeader, ChainError>;
}

/// The chain facade.
pub struct ChainApi {
    pool: Arc<ConnectionPool>,
    /// Cleared permanently the first time an endpoint rejects the tag.
    finalized_tag_supported: AtomicBool,
    receipts: Mutex<HashMap<String, Arc<Value>>>,
}

impl ChainApi {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self {
            pool,
            finalized_tag_supported: AtomicBool::new(true),
            receipts: Mutex::new(HashMap::new()),
        }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, ChainError> {
        let conn = self.pool.api()?;
        Ok(conn.api.call(method, params).await?)
    }

    /// Current best (head) block height.
    pub async fn get_best_block_height(&self) -> Result<u64, ChainError> {
        let raw = self.call("eth_blockNumber", vec![]).await?;
        raw.as_str()
            .map(parse_hex_u64)
            .ok_or_else(|| ChainError::Malformed("eth_blockNumber returned non-string".into()))
    }

    /// Header of the finalized tip (or the `best − 15` approximation).
    pub async fn get_finalized_header(&self) -> Result<BlockHeader, ChainError> {
        if self.finalized_tag_supported.load(Ordering::Acquire) {
            match self
                .call("eth_getBlockByNumber", vec![json!("finalized"), json!(false)])
                .await
            {
                Ok(raw) if !raw.is_null() => {
                    let block: RawBlock = serde_json::from_value(raw)
                        .map_err(|e| ChainError::Malformed(e.to_string()))?;
                    return Ok(block.header());
                }
                Ok(_) | Err(ChainError::Rpc(RpcError::Rpc(_))) => {
                    // Pre-merge chain: remember and approximate from now on.
                    self.finalized_tag_supported.store(false, Ordering::Release);
                    tracing::info!(
                        depth = FINALIZATION_DEPTH_FALLBACK,
                        "endpoint has no `finalized` tag — using best-height offset"
                    );
                }
                Err(e) => return Err(e),
            }
        }

        let best = self.get_best_block_height().await?;
        self.header_by_height(best.saturating_sub(FINALIZATION_DEPTH_FALLBACK))
            .await
    }

    /// Height of the finalized tip.
    pub async fn get_finalized_block_height(&self) -> Result<u64, ChainError> {
        Ok(self.get_finalized_header().await?.height)
    }

    /// Header by height or hash.
    pub async fn get_block_by_height_or_hash(
        &self,
        block: BlockRef,
    ) -> Result<BlockHeader, ChainError> {
        match block {
            BlockRef::Height(height) => self.header_by_height(height).await,
            BlockRef::Hash(hash) => self.header_by_hash(&hash).await,
        }
    }

    /// All logs in `[from, to]`, unfiltered.
    pub async fn get_logs(&self, from: u64, to: u64) -> Result<Vec<crate::types::EthLog>, ChainError> {
        let raw = self
            .call(
                "eth_getLogs",
                vec![json!({ "fromBlock": to_hex(from), "toBlock": to_hex(to) })],
            )
            .await?;
        let logs: Vec<RawLog> =
            serde_json::from_value(raw).map_err(|e| ChainError::Malformed(e.to_string()))?;
        Ok(logs.iter().map(RawLog::parsed).collect())
    }

    /// Receipt for `tx_hash`, fetched once and memoized.
    pub async fn get_transaction_receipt(&self, tx_hash: &str) -> Result<Arc<Value>, ChainError> {
        let key = tx_hash.to_lowercase();
        if let Some(cached) = self.receipts.lock().unwrap().get(&key) {
            return Ok(cached.clone());
        }
        let raw = self
            .call("eth_getTransactionReceipt", vec![json!(key)])
            .await?;
        let receipt = Arc::new(raw);
        self.receipts
            .lock()
            .unwrap()
            .entry(key)
            .or_insert_with(|| receipt.clone());
        Ok(receipt)
    }

    /// Fetch one block and its logs in parallel from the same connection.
    pub async fn fetch_block(&self, height: u64, include_tx: bool) -> Result<EthBlock, ChainError> {
        let conn = self.pool.api()?;
        let height_hex = to_hex(height);

        let block_fut = conn.api.call(
            "eth_getBlockByNumber",
            vec![json!(height_hex), json!(include_tx)],
        );
        let logs_fut = conn.api.call(
            "eth_getLogs",
            vec![json!({ "fromBlock": height_hex, "toBlock": height_hex })],
        );
        let (block_raw, logs_raw) = futures::join!(block_fut, logs_fut);

        let block_raw = block_raw?;
        if block_raw.is_null() {
            return Err(ChainError::BlockNotFound(height));
        }
        let raw: RawBlock = serde_json::from_value(block_raw)
            .map_err(|e| ChainError::Malformed(e.to_string()))?;
        let logs: Vec<RawLog> = serde_json::from_value(logs_raw?)
            .map_err(|e| ChainError::Malformed(e.to_string()))?;

        Ok(EthBlock {
            header: raw.header(),
            transactions: raw.parsed_transactions(),
            logs: logs.iter().map(RawLog::parsed).collect(),
        })
    }

    /// Fetch many blocks, failing over across the pool. Calls against one
    /// connection coalesce into batch requests at the transport layer.
    pub async fn fetch_blocks(
        &self,
        heights: Vec<u64>,
        include_tx: bool,
    ) -> Result<Vec<EthBlock>, ChainError> {
        let result = self
            .pool
            .first_available(move |conn| {
                let heights = heights.clone();
                Box::pin(async move {
                    let futures = heights.iter().map(|height| {
                        let conn = conn.clone();
                        let height = *height;
                        async move {
                            let raw = conn
                                .api
                                .call(
                                    "eth_getBlockByNumber",
                                    vec![json!(to_hex(height)), json!(include_tx)],
                                )
                                .await?;
                            if raw.is_null() {
                                // Endpoint is behind — worth another endpoint.
                                return Err(RpcError::Server(format!(
                                    "block {height} not available"
                                )));
                            }
                            serde_json::from_value::<RawBlock>(raw)
                                .map_err(RpcError::Deserialization)
                        }
                    });
                    futures::future::try_join_all(futures).await
                })
            })
            .await?;

        Ok(result
            .into_iter()
            .map(|raw| EthBlock {
                header: raw.header(),
                transactions: raw.parsed_transactions(),
                logs: vec![],
            })
            .collect())
    }
}

#[async_trait]
impl HeaderLookup for ChainApi {
    async fn header_by_height(&self, height: u64) -> Result<BlockHeader, ChainError> {
        let raw = self
            .call(
                "eth_getBlockByNumber",
                vec![json!(to_hex(height)), json!(false)],
            )
            .await?;
        if raw.is_null() {
            return Err(ChainError::BlockNotFound(height));
        }
        let block: RawBlock =
            serde_json::from_value(raw).map_err(|e| ChainError::Malformed(e.to_string()))?;
        Ok(block.header())
    }

    async fn header_by_hash(&self, hash: &str) -> Result<BlockHeader, ChainError> {
        let raw = self
            .call("eth_getBlockByHash", vec![json!(hash), json!(false)])
            .await?;
        if raw.is_null() {
            return Err(ChainError::Malformed(format!("block {hash} not found")));
        }
        let block: RawBlock =
            serde_json::from_value(raw).map_err(|e| ChainError::Malformed(e.to_string()))?;
        Ok(block.header())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethindexer_rpc::Endpoint;
    use std::sync::atomic::AtomicU32;

    struct MockNode {
        url: String,
        /// Whether the node understands the `finalized` tag.
        has_finalized_tag: bool,
        finalized_tag_calls: AtomicU32,
        receipt_calls: AtomicU32,
    }

    impl MockNode {
        fn new(has_finalized_tag: bool) -> Arc<Self> {
            Arc::new(Self {
                url: "https://node.example".into(),
                has_finalized_tag,
                finalized_tag_calls: AtomicU32::new(0),
                receipt_calls: AtomicU32::new(0),
            })
        }

        fn block_json(height: u64) -> Value {
            json!({
                "number": to_hex(height),
                "hash": format!("0xh{height}"),
                "parentHash": format!("0xh{}", height.saturating_sub(1)),
                "timestamp": to_hex(height * 12),
                "stateRoot": "0xs",
                "logsBloom": "0x0",
                "gasLimit": "0x1c9c380",
                "gasUsed": "0x5208",
                "transactions": []
            })
        }
    }

    #[async_trait]
    impl Endpoint for MockNode {
        fn url(&self) -> &str {
            &self.url
        }

        async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, RpcError> {
            match method {
                "eth_chainId" => Ok(json!("0x1")),
                "web3_clientVersion" => Ok(json!("mock/v1")),
                "eth_blockNumber" => Ok(json!(to_hex(1000))),
                "eth_getTransactionReceipt" => {
                    self.receipt_calls.fetch_add(1, Ordering::Relaxed);
                    Ok(json!({ "status": "0x1" }))
                }
                "eth_getBlockByNumber" => {
                    let tag = params[0].as_str().unwrap();
                    if tag == "finalized" {
                        self.finalized_tag_calls.fetch_add(1, Ordering::Relaxed);
                        if self.has_finalized_tag {
                            return Ok(Self::block_json(990));
                        }
                        return Err(RpcError::Rpc(ethindexer_rpc::JsonRpcError {
                            code: -32602,
                            message: "invalid block tag".into(),
                            data: None,
                        }));
                    }
                    if tag == "0x0" {
                        return Ok(json!({ "hash": "0xgen" }));
                    }
                    Ok(Self::block_json(parse_hex_u64(tag)))
                }
                "eth_getLogs" => Ok(json!([])),
                other => Err(RpcError::Internal(format!("unexpected method {other}"))),
            }
        }
    }

    async fn api_with(node: Arc<MockNode>) -> ChainApi {
        let pool = Arc::new(ConnectionPool::new());
        pool.add_connection(node).await.unwrap();
        ChainApi::new(pool)
    }

    #[tokio::test]
    async fn finalized_tag_preferred() {
        let node = MockNode::new(true);
        let api = api_with(node).await;
        assert_eq!(api.get_finalized_block_height().await.unwrap(), 990);
    }

    #[tokio::test]
    async fn finalized_fallback_is_cached() {
        let node = MockNode::new(false);
        let api = api_with(node.clone()).await;

        // best = 1000, fallback = 985
        assert_eq!(api.get_finalized_block_height().await.unwrap(), 985);
        assert_eq!(api.get_finalized_block_height().await.unwrap(), 985);

        // The tag was only probed once.
        assert_eq!(node.finalized_tag_calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn fetch_block_composes_block_and_logs() {
        let api = api_with(MockNode::new(true)).await;
        let block = api.fetch_block(100, true).await.unwrap();
        assert_eq!(block.height(), 100);
        assert_eq!(block.header.hash, "0xh100");
        assert!(block.logs.is_empty());
    }

    #[tokio::test]
    async fn receipts_memoized_by_hash() {
        let node = MockNode::new(true);
        let api = api_with(node.clone()).await;

        api.get_transaction_receipt("0xAB").await.unwrap();
        api.get_transaction_receipt("0xab").await.unwrap();
        assert_eq!(node.receipt_calls.load(Ordering::Relaxed), 1);
    }
}
