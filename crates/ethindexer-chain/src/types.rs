//! Block, transaction, and log types shared by the indexing pipeline.
//!
//! Wire structs (`Raw*`) mirror the JSON-RPC hex-string encoding; parsed
//! structs carry native integers. Logs reference their transaction logically
//! by `(tx_hash, log_index)` — the block owns both lists, nothing owns twice.

use serde::{Deserialize, Serialize};

// ─── Hex helpers ──────────────────────────────────────────────────────────────

/// Parse a hex-encoded quantity (with or without `0x`) to u64.
pub fn parse_hex_u64(s: &str) -> u64 {
    let s = s.strip_prefix("0x").unwrap_or(s);
    u64::from_str_radix(s, 16).unwrap_or(0)
}

/// Format a u64 as a `0x`-prefixed hex quantity.
pub fn to_hex(n: u64) -> String {
    format!("{n:#x}")
}

// ─── Wire structs ─────────────────────────────────────────────────────────────

/// A block as returned by `eth_getBlockByNumber`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawBlock {
    pub number: String,
    pub hash: String,
    pub parent_hash: String,
    pub timestamp: String,
    pub state_root: String,
    pub logs_bloom: String,
    pub gas_limit: String,
    pub gas_used: String,
    #[serde(default)]
    pub base_fee_per_gas: Option<String>,
    #[serde(default)]
    pub transactions: Vec<RawTxEntry>,
}

/// `transactions` holds full bodies or bare hashes depending on the request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawTxEntry {
    Full(RawTransaction),
    Hash(String),
}

/// A transaction body as returned inside a block.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawTransaction {
    pub hash: String,
    pub from: String,
    /// Absent for contract-creation transactions.
    #[serde(default)]
    pub to: Option<String>,
    pub input: String,
    pub value: String,
    pub nonce: String,
    #[serde(default)]
    pub transaction_index: Option<String>,
    #[serde(default)]
    pub gas: Option<String>,
    #[serde(default)]
    pub gas_price: Option<String>,
}

/// A raw log as returned by `eth_getLogs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawLog {
    pub address: String,
    pub topics: Vec<String>,
    pub data: String,
    pub block_number: String,
    pub block_hash: String,
    pub transaction_hash: String,
    #[serde(default)]
    pub transaction_index: Option<String>,
    pub log_index: String,
    #[serde(default)]
    pub removed: Option<bool>,
}

// ─── Parsed types ─────────────────────────────────────────────────────────────

/// Block identity and parent linkage, immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub height: u64,
    pub hash: String,
    pub parent_hash: String,
    pub timestamp: u64,
    pub state_root: String,
    pub logs_bloom: String,
    pub gas_limit: u64,
    pub gas_used: u64,
    pub base_fee_per_gas: Option<u64>,
}

impl BlockHeader {
    /// Returns `true` if `parent` is the direct parent of `self`.
    pub fn extends(&self, parent: &BlockHeader) -> bool {
        self.height == parent.height + 1 && self.parent_hash == parent.hash
    }
}

/// A transaction with parsed positions. Receipts are fetched lazily through
/// the chain API and memoized there by hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EthTransaction {
    pub hash: String,
    pub from: String,
    /// `None` for contract-creation transactions.
    pub to: Option<String>,
    pub input: String,
    pub value: String,
    pub nonce: u64,
    pub block_height: u64,
    pub transaction_index: u64,
}

impl EthTransaction {
    /// The 4-byte function selector of the call data, if present.
    pub fn selector(&self) -> Option<&str> {
        let stripped = self.input.strip_prefix("0x").unwrap_or(&self.input);
        if stripped.len() >= 8 {
            Some(&self.input[..self.input.len() - stripped.len() + 8])
        } else {
            None
        }
    }
}

/// A log with its logical back-reference to the emitting transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EthLog {
    pub address: String,
    pub topics: Vec<String>,
    pub data: String,
    pub block_height: u64,
    pub block_hash: String,
    pub transaction_hash: String,
    pub transaction_index: u64,
    pub log_index: u32,
    pub removed: bool,
}

/// A fully fetched block: header plus transaction and log lists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EthBlock {
    pub header: BlockHeader,
    pub transactions: Vec<EthTransaction>,
    pub logs: Vec<EthLog>,
}

impl EthBlock {
    pub fn height(&self) -> u64 {
        self.header.height
    }

    /// Resolve a log's transaction by its logical reference.
    pub fn transaction_for_log(&self, log: &EthLog) -> Option<&EthTransaction> {
        self.transactions
            .iter()
            .find(|tx| tx.hash == log.transaction_hash)
    }
}

// ─── Wire → parsed conversions ────────────────────────────────────────────────

impl RawBlock {
    pub fn header(&self) -> BlockHeader {
        BlockHeader {
            height: parse_hex_u64(&self.number),
            hash: self.hash.to_lowercase(),
            parent_hash: self.parent_hash.to_lowercase(),
            timestamp: parse_hex_u64(&self.timestamp),
            state_root: self.state_root.clone(),
            logs_bloom: self.logs_bloom.clone(),
            gas_limit: parse_hex_u64(&self.gas_limit),
            gas_used: parse_hex_u64(&self.gas_used),
            base_fee_per_gas: self.base_fee_per_gas.as_deref().map(parse_hex_u64),
        }
    }

    pub fn parsed_transactions(&self) -> Vec<EthTransaction> {
        let height = parse_hex_u64(&self.number);
        self.transactions
            .iter()
            .filter_map(|entry| match entry {
                RawTxEntry::Full(raw) => Some(raw.parsed(height)),
                RawTxEntry::Hash(_) => None,
            })
            .collect()
    }
}

impl RawTransaction {
    pub fn parsed(&self, block_height: u64) -> EthTransaction {
        EthTransaction {
            hash: self.hash.to_lowercase(),
            from: self.from.to_lowercase(),
            to: self.to.as_ref().map(|t| t.to_lowercase()),
            input: self.input.clone(),
            value: self.value.clone(),
            nonce: parse_hex_u64(&self.nonce),
            block_height,
            transaction_index: self.transaction_index.as_deref().map(parse_hex_u64).unwrap_or(0),
        }
    }
}

impl RawLog {
    pub fn parsed(&self) -> EthLog {
        EthLog {
            address: self.address.to_lowercase(),
            topics: self.topics.iter().map(|t| t.to_lowercase()).collect(),
            data: self.data.clone(),
            block_height: parse_hex_u64(&self.block_number),
            block_hash: self.block_hash.to_lowercase(),
            transaction_hash: self.transaction_hash.to_lowercase(),
            transaction_index: self.transaction_index.as_deref().map(parse_hex_u64).unwrap_or(0),
            log_index: parse_hex_u64(&self.log_index) as u32,
            removed: self.removed.unwrap_or(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_hex_u64_basic() {
        assert_eq!(parse_hex_u64("0x1"), 1);
        assert_eq!(parse_hex_u64("0xff"), 255);
        assert_eq!(parse_hex_u64("1234"), 0x1234);
    }

    #[test]
    fn header_extends_parent() {
        let parent = header(100, "0xaaa", "0x000");
        let child = header(101, "0xbbb", "0xaaa");
        assert!(child.extends(&parent));
        assert!(!parent.extends(&child));
    }

    #[test]
    fn header_extends_false_on_gap() {
        let a = header(100, "0xaaa", "0x000");
        let b = header(102, "0xccc", "0xaaa"); // gap
        assert!(!b.extends(&a));
    }

    #[test]
    fn log_back_reference_resolves() {
        let block = EthBlock {
            header: header(10, "0xb", "0xa"),
            transactions: vec![tx("0xt1"), tx("0xt2")],
            logs: vec![log("0xt2", 0)],
        };
        let found = block.transaction_for_log(&block.logs[0]).unwrap();
        assert_eq!(found.hash, "0xt2");
    }

    #[test]
    fn selector_from_input() {
        let mut t = tx("0xt1");
        t.input = "0xa9059cbb000000".into();
        assert_eq!(t.selector(), Some("0xa9059cbb"));
        t.input = "0x".into();
        assert_eq!(t.selector(), None);
    }

    #[test]
    fn raw_block_deserializes_with_hash_only_txs() {
        let json = serde_json::json!({
            "number": "0x64",
            "hash": "0xB",
            "parentHash": "0xA",
            "timestamp": "0x5f5e100",
            "stateRoot": "0xs",
            "logsBloom": "0x0",
            "gasLimit": "0x1c9c380",
            "gasUsed": "0x5208",
            "transactions": ["0xt1", "0xt2"]
        });
        let raw: RawBlock = serde_json::from_value(json).unwrap();
        let head = raw.header();
        assert_eq!(head.height, 100);
        assert_eq!(head.hash, "0xb"); // lowercased
        assert!(raw.parsed_transactions().is_empty());
    }

    fn header(height: u64, hash: &str, parent: &str) -> BlockHeader {
        BlockHeader {
            height,
            hash: hash.into(),
            parent_hash: parent.into(),
            timestamp: height * 12,
            state_root: "0xs".into(),
            logs_bloom: "0x0".into(),
            gas_limit: 30_000_000,
            gas_used: 21_000,
            base_fee_per_gas: None,
        }
    }

    fn tx(hash: &str) -> EthTransaction {
        EthTransaction {
            hash: hash.into(),
            from: "0xf".into(),
            to: Some("0xd".into()),
            input: "0x".into(),
            value: "0x0".into(),
            nonce: 0,
            block_height: 10,
            transaction_index: 0,
        }
    }

    fn log(tx_hash: &str, index: u32) -> EthLog {
        EthLog {
            address: "0xc".into(),
            topics: vec![],
            data: "0x".into(),
            block_height: 10,
            block_hash: "0xb".into(),
            transaction_hash: tx_hash.into(),
            transaction_index: 0,
            log_index: index,
            removed: false,
        }
    }
}
