//! Node configuration surface.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::IndexerError;

/// Configuration for an indexing node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// JSON-RPC endpoints; all must serve the same chain.
    pub network_endpoints: Vec<String>,
    /// Dictionary endpoints, tried v2-then-v1 each.
    #[serde(default)]
    pub network_dictionaries: Vec<String>,
    /// Resolver service that maps a chain id to dictionary endpoints,
    /// consulted when `network_dictionaries` is empty.
    #[serde(default)]
    pub dictionary_resolver: Option<String>,
    /// Per-scan dictionary timeout in seconds.
    #[serde(default = "default_dictionary_timeout")]
    pub dictionary_timeout_secs: u64,
    /// Width of one dictionary scan window in blocks.
    #[serde(default = "default_dictionary_query_size")]
    pub dictionary_query_size: u64,
    /// Blocks handed to the dispatcher per iteration.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Worker count; 0 means `endpoints × 2`.
    #[serde(default)]
    pub workers: usize,
    /// Track unfinalized blocks and recover from forks.
    #[serde(default = "default_true")]
    pub unfinalized_blocks: bool,
    /// Maximum addresses per dictionary condition group.
    #[serde(default = "default_query_address_limit")]
    pub query_address_limit: usize,
    /// Heights to skip entirely: integers or `"a-b"` ranges.
    #[serde(default)]
    pub bypass_blocks: Vec<String>,
}

fn default_dictionary_timeout() -> u64 {
    30
}

fn default_dictionary_query_size() -> u64 {
    10_000
}

fn default_batch_size() -> usize {
    30
}

fn default_query_address_limit() -> usize {
    100
}

fn default_true() -> bool {
    true
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            network_endpoints: vec![],
            network_dictionaries: vec![],
            dictionary_resolver: None,
            dictionary_timeout_secs: default_dictionary_timeout(),
            dictionary_query_size: default_dictionary_query_size(),
            batch_size: default_batch_size(),
            workers: 0,
            unfinalized_blocks: true,
            query_address_limit: default_query_address_limit(),
            bypass_blocks: vec![],
        }
    }
}

impl NodeConfig {
    /// Effective worker-pool size.
    pub fn worker_count(&self) -> usize {
        if self.workers > 0 {
            self.workers
        } else {
            (self.network_endpoints.len() * 2).max(1)
        }
    }

    /// Expand `bypass_blocks` entries into a height set.
    pub fn bypass_set(&self) -> Result<HashSet<u64>, IndexerError> {
        parse_bypass_blocks(&self.bypass_blocks)
    }
}

/// Expand a list of `"n"` and `"a-b"` entries into concrete heights.
pub fn parse_bypass_blocks(entries: &[String]) -> Result<HashSet<u64>, IndexerError> {
    let mut set = HashSet::new();
    for entry in entries {
        let entry = entry.trim();
        if let Some((a, b)) = entry.split_once('-') {
            let start: u64 = a.trim().parse().map_err(|_| bad_entry(entry))?;
            let end: u64 = b.trim().parse().map_err(|_| bad_entry(entry))?;
            if end < start {
                return Err(bad_entry(entry));
            }
            set.extend(start..=end);
        } else {
            set.insert(entry.parse().map_err(|_| bad_entry(entry))?);
        }
    }
    Ok(set)
}

fn bad_entry(entry: &str) -> IndexerError {
    IndexerError::Store(format!("invalid bypassBlocks entry `{entry}`"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bypass_range_expands() {
        let set = parse_bypass_blocks(&["2-5".into()]).unwrap();
        assert_eq!(set, HashSet::from([2, 3, 4, 5]));
    }

    #[test]
    fn bypass_mixed_entries() {
        let set = parse_bypass_blocks(&["7".into(), "10-12".into(), "7".into()]).unwrap();
        assert_eq!(set, HashSet::from([7, 10, 11, 12]));
    }

    #[test]
    fn bypass_rejects_garbage() {
        assert!(parse_bypass_blocks(&["x".into()]).is_err());
        assert!(parse_bypass_blocks(&["9-2".into()]).is_err());
    }

    #[test]
    fn worker_count_defaults_to_twice_endpoints() {
        let config = NodeConfig {
            network_endpoints: vec!["a".into(), "b".into(), "c".into()],
            ..Default::default()
        };
        assert_eq!(config.worker_count(), 6);

        let pinned = NodeConfig {
            workers: 4,
            ..config
        };
        assert_eq!(pinned.worker_count(), 4);
    }
}
