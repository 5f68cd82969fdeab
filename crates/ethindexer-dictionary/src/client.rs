//! The dictionary capability set, shared by both protocol versions.

use std::collections::BTreeMap;

use async_trait::async_trait;

use ethindexer_chain::EthBlock;

use crate::entry::QueryEntry;
use crate::error::DictionaryError;

/// Dictionary protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DictionaryVersion {
    V1,
    V2,
}

impl std::fmt::Display for DictionaryVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::V1 => write!(f, "v1"),
            Self::V2 => write!(f, "v2"),
        }
    }
}

/// Metadata advertised by a dictionary endpoint.
#[derive(Debug, Clone, Default)]
pub struct DictionaryMetadata {
    /// Chain identifier (v1 `chain`, v2 `chainId`).
    pub chain: Option<String>,
    pub genesis_hash: Option<String>,
    /// Height the dictionary has indexed up to.
    pub last_processed_height: u64,
    /// First height the dictionary can serve.
    pub start_height: u64,
}

impl DictionaryMetadata {
    /// Validate against the indexed chain. Either the chain id or the
    /// genesis hash must match.
    pub fn validate(&self, chain_id: &str, genesis_hash: &str) -> Result<(), DictionaryError> {
        if let Some(chain) = &self.chain {
            if chain.eq_ignore_ascii_case(chain_id) || chain.eq_ignore_ascii_case(genesis_hash) {
                return Ok(());
            }
        }
        if let Some(genesis) = &self.genesis_hash {
            if genesis.eq_ignore_ascii_case(genesis_hash) {
                return Ok(());
            }
        }
        Err(DictionaryError::ChainMismatch {
            field: "chain",
            expected: chain_id.to_string(),
            actual: self
                .chain
                .clone()
                .or_else(|| self.genesis_hash.clone())
                .unwrap_or_default(),
        })
    }
}

/// Result of one dictionary scan.
#[derive(Debug, Clone, Default)]
pub struct DictionaryResponse {
    /// Matching heights, ascending.
    pub batch_blocks: Vec<u64>,
    /// The height the scan is complete up to — the caller may advance its
    /// cursor here even when `batch_blocks` is empty.
    pub last_buffered_height: u64,
    /// Full block payloads (v2 only; empty for v1).
    pub blocks: Vec<EthBlock>,
}

/// One dictionary endpoint: query-map updates, scans, metadata.
#[async_trait]
pub trait DictionaryClient: Send + Sync {
    fn version(&self) -> DictionaryVersion;

    fn endpoint(&self) -> &str;

    /// Fetch (and cache) the endpoint's metadata.
    async fn init_metadata(&self) -> Result<DictionaryMetadata, DictionaryError>;

    /// Replace the per-range query entries after the data-source set changed.
    fn update_queries_map(&self, map: BTreeMap<u64, QueryEntry>);

    /// Scan `[start, end]` for matching heights, returning at most `limit`.
    async fn get_data(
        &self,
        start: u64,
        end: u64,
        limit: usize,
    ) -> Result<DictionaryResponse, DictionaryError>;
}

/// Clamp a requested query end to what the dictionary and the chain have
/// actually seen.
pub fn clamp_query_end(requested: u64, last_processed: u64, finalized: u64) -> u64 {
    requested.min(last_processed).min(finalized)
}

/// The query entry active at `height`, with the end of its validity range.
pub fn entry_at(
    map: &BTreeMap<u64, QueryEntry>,
    height: u64,
) -> Option<(&QueryEntry, Option<u64>)> {
    let (start, entry) = map.range(..=height).next_back()?;
    let range_end = map
        .range(start + 1..)
        .next()
        .map(|(next_start, _)| next_start - 1);
    Some((entry, range_end))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_validation() {
        let meta = DictionaryMetadata {
            chain: Some("0x1".into()),
            genesis_hash: None,
            last_processed_height: 100,
            start_height: 0,
        };
        assert!(meta.validate("0x1", "0xgen").is_ok());
        assert!(meta.validate("0x5", "0xgen").is_err());
    }

    #[test]
    fn metadata_accepts_genesis_match() {
        let meta = DictionaryMetadata {
            chain: None,
            genesis_hash: Some("0xGEN".into()),
            last_processed_height: 100,
            start_height: 0,
        };
        assert!(meta.validate("0x1", "0xgen").is_ok());
    }

    #[test]
    fn clamp_takes_minimum() {
        assert_eq!(clamp_query_end(1000, 500, 800), 500);
        assert_eq!(clamp_query_end(1000, 1500, 800), 800);
        assert_eq!(clamp_query_end(300, 500, 800), 300);
    }

    #[test]
    fn entry_at_respects_ranges() {
        let mut map = BTreeMap::new();
        map.insert(100u64, QueryEntry::default());
        map.insert(500u64, QueryEntry::default());

        assert!(entry_at(&map, 50).is_none());
        assert_eq!(entry_at(&map, 100).unwrap().1, Some(499));
        assert_eq!(entry_at(&map, 499).unwrap().1, Some(499));
        assert_eq!(entry_at(&map, 500).unwrap().1, None);
    }
}
