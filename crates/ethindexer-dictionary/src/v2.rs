//! Protocol v2: a JSON-RPC dictionary returning complete block payloads.
//!
//! `subql_filterBlocks(startBlock, endBlock, limit, conditions,
//! fieldSelection)` answers with `{ blocks, blockRange }`;
//! `subql_filterBlocksCapabilities` advertises the served height ranges and
//! doubles as the create-time probe — an endpoint that cannot answer it is
//! not a v2 dictionary.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use ethindexer_chain::types::{parse_hex_u64, RawBlock, RawLog, RawTransaction};
use ethindexer_chain::EthBlock;
use ethindexer_rpc::{RpcClient, RpcClientConfig};

use crate::client::{
    entry_at, DictionaryClient, DictionaryMetadata, DictionaryResponse, DictionaryVersion,
};
use crate::entry::QueryEntry;
use crate::error::DictionaryError;

pub struct V2Dictionary {
    endpoint: String,
    client: RpcClient,
    queries: Mutex<BTreeMap<u64, QueryEntry>>,
    metadata: Mutex<Option<DictionaryMetadata>>,
}

impl V2Dictionary {
    /// Probe `endpoint` for v2 support. Failure means the caller should fall
    /// back to v1 for this endpoint.
    pub async fn create(endpoint: impl Into<String>) -> Result<Self, DictionaryError> {
        let endpoint = endpoint.into();
        let client = RpcClient::new(&endpoint, RpcClientConfig::default());
        let dictionary = Self {
            endpoint,
            client,
            queries: Mutex::new(BTreeMap::new()),
            metadata: Mutex::new(None),
        };
        dictionary.init_metadata().await?;
        Ok(dictionary)
    }

    async fn capabilities(&self) -> Result<DictionaryMetadata, DictionaryError> {
        let raw = self
            .client
            .call("subql_filterBlocksCapabilities", vec![])
            .await
            .map_err(|e| DictionaryError::Unavailable(e.to_string()))?;
        parse_capabilities(&raw)
    }
}

#[async_trait]
impl DictionaryClient for V2Dictionary {
    fn version(&self) -> DictionaryVersion {
        DictionaryVersion::V2
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn init_metadata(&self) -> Result<DictionaryMetadata, DictionaryError> {
        let metadata = self.capabilities().await?;
        *self.metadata.lock().unwrap() = Some(metadata.clone());
        Ok(metadata)
    }

    fn update_queries_map(&self, map: BTreeMap<u64, QueryEntry>) {
        *self.queries.lock().unwrap() = map;
    }

    async fn get_data(
        &self,
        start: u64,
        end: u64,
        limit: usize,
    ) -> Result<DictionaryResponse, DictionaryError> {
        let (entry, range_end) = {
            let queries = self.queries.lock().unwrap();
            let Some((entry, range_end)) = entry_at(&queries, start) else {
                return Err(DictionaryError::Unavailable(
                    "no query entry for this range".into(),
                ));
            };
            (entry.clone(), range_end)
        };
        if entry.is_unfiltered() {
            return Err(DictionaryError::Unavailable(
                "unfiltered range cannot be accelerated".into(),
            ));
        }
        let end = range_end.map_or(end, |boundary| end.min(boundary));

        let conditions =
            serde_json::to_value(&entry).map_err(|e| DictionaryError::Malformed(e.to_string()))?;
        let raw = self
            .client
            .call(
                "subql_filterBlocks",
                vec![
                    json!(start),
                    json!(end),
                    json!(limit),
                    conditions,
                    json!({ "blockHeader": true, "logs": true, "transactions": true }),
                ],
            )
            .await
            .map_err(|e| DictionaryError::Unavailable(e.to_string()))?;

        parse_filter_blocks(&raw, end)
    }
}

// ─── Response parsing ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RawCapabilities {
    #[serde(default, rename = "availableBlocks")]
    available_blocks: Vec<RawBlockRange>,
    #[serde(default, rename = "genesisHash")]
    genesis_hash: Option<String>,
    #[serde(default)]
    chain: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawBlockRange {
    #[serde(rename = "startHeight")]
    start_height: u64,
    #[serde(rename = "endHeight")]
    end_height: u64,
}

fn parse_capabilities(raw: &Value) -> Result<DictionaryMetadata, DictionaryError> {
    let caps: RawCapabilities = serde_json::from_value(raw.clone())
        .map_err(|e| DictionaryError::Malformed(e.to_string()))?;
    if caps.available_blocks.is_empty() {
        return Err(DictionaryError::Malformed(
            "capabilities advertise no block ranges".into(),
        ));
    }
    let start_height = caps
        .available_blocks
        .iter()
        .map(|r| r.start_height)
        .min()
        .unwrap_or(1);
    let last_processed_height = caps
        .available_blocks
        .iter()
        .map(|r| r.end_height)
        .max()
        .unwrap_or(0);

    Ok(DictionaryMetadata {
        chain: caps.chain,
        genesis_hash: caps.genesis_hash,
        last_processed_height,
        start_height,
    })
}

#[derive(Debug, Deserialize)]
struct RawFilterResult {
    #[serde(default)]
    blocks: Vec<V2Block>,
    #[serde(default, rename = "blockRange")]
    block_range: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct V2Block {
    header: RawBlock,
    #[serde(default)]
    logs: Vec<RawLog>,
    #[serde(default)]
    transactions: Vec<RawTransaction>,
}

fn parse_filter_blocks(raw: &Value, end: u64) -> Result<DictionaryResponse, DictionaryError> {
    let result: RawFilterResult = serde_json::from_value(raw.clone())
        .map_err(|e| DictionaryError::Malformed(e.to_string()))?;

    let blocks: Vec<EthBlock> = result
        .blocks
        .into_iter()
        .map(|b| {
            let header = b.header.header();
            let height = header.height;
            EthBlock {
                header,
                transactions: b.transactions.iter().map(|tx| tx.parsed(height)).collect(),
                logs: b.logs.iter().map(RawLog::parsed).collect(),
            }
        })
        .collect();

    let mut batch_blocks: Vec<u64> = blocks.iter().map(EthBlock::height).collect();
    batch_blocks.sort_unstable();
    batch_blocks.dedup();

    let range_end = result
        .block_range
        .get(1)
        .and_then(lenient_height)
        .unwrap_or(end);
    let last_buffered = range_end.max(batch_blocks.last().copied().unwrap_or(0));

    Ok(DictionaryResponse {
        batch_blocks,
        last_buffered_height: last_buffered,
        blocks,
    })
}

/// Heights arrive as numbers or hex strings depending on the server.
fn lenient_height(v: &Value) -> Option<u64> {
    v.as_u64().or_else(|| {
        let s = v.as_str()?;
        if s.starts_with("0x") {
            Some(parse_hex_u64(s))
        } else {
            s.parse().ok()
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capabilities_span_ranges() {
        let meta = parse_capabilities(&json!({
            "availableBlocks": [
                { "startHeight": 100, "endHeight": 5000 },
                { "startHeight": 6000, "endHeight": 9000 },
            ],
            "genesisHash": "0xgen",
            "chain": "0x1",
        }))
        .unwrap();
        assert_eq!(meta.start_height, 100);
        assert_eq!(meta.last_processed_height, 9000);
        assert_eq!(meta.chain.as_deref(), Some("0x1"));
    }

    #[test]
    fn empty_capabilities_rejected() {
        assert!(parse_capabilities(&json!({ "availableBlocks": [] })).is_err());
    }

    #[test]
    fn filter_blocks_payloads_parsed() {
        let raw = json!({
            "blocks": [{
                "header": {
                    "number": "0x64",
                    "hash": "0xh100",
                    "parentHash": "0xh99",
                    "timestamp": "0x4b0",
                    "stateRoot": "0xs",
                    "logsBloom": "0x0",
                    "gasLimit": "0x1c9c380",
                    "gasUsed": "0x5208",
                },
                "logs": [{
                    "address": "0xC",
                    "topics": ["0xT0"],
                    "data": "0x",
                    "blockNumber": "0x64",
                    "blockHash": "0xh100",
                    "transactionHash": "0xt1",
                    "logIndex": "0x0",
                }],
                "transactions": [{
                    "hash": "0xt1",
                    "from": "0xF",
                    "to": "0xD",
                    "input": "0x",
                    "value": "0x0",
                    "nonce": "0x1",
                }],
            }],
            "blockRange": [100, 200],
        });

        let response = parse_filter_blocks(&raw, 200).unwrap();
        assert_eq!(response.batch_blocks, vec![100]);
        assert_eq!(response.last_buffered_height, 200);
        assert_eq!(response.blocks.len(), 1);
        let block = &response.blocks[0];
        assert_eq!(block.height(), 100);
        assert_eq!(block.logs[0].address, "0xc"); // lowercased
        assert_eq!(block.transactions[0].block_height, 100);
    }

    #[test]
    fn hex_block_range_accepted() {
        let raw = json!({ "blocks": [], "blockRange": ["0x64", "0xc8"] });
        let response = parse_filter_blocks(&raw, 300).unwrap();
        assert!(response.batch_blocks.is_empty());
        assert_eq!(response.last_buffered_height, 200);
    }
}
