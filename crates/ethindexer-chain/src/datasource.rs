//! User-supplied data sources: handler declarations, filters, and the
//! height-indexed map that answers "which data sources are active at H?".

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::abi::{event_topic, function_selector};
use crate::types::{EthLog, EthTransaction};

/// Sentinel in a topic slot meaning "present with any value".
pub const TOPIC_NOT_NULL: &str = "!null";

/// What a handler reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandlerKind {
    Block,
    Call,
    Event,
}

/// Filter attached to a handler. Which fields apply depends on the kind.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HandlerFilter {
    /// Event: topic slots 0–3. `None` in a slot skips it; the literal
    /// `"!null"` requires the slot to be present with any value.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub topics: Vec<Option<String>>,
    /// Call: sender address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    /// Call: recipient. The outer `None` means "do not filter"; an explicit
    /// inner `None` matches contract-creation transactions.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "double_option"
    )]
    pub to: Option<Option<String>>,
    /// Call: function signature or `0x`-prefixed 4-byte selector.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
    /// Block: process every N-th block.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modulo: Option<u64>,
}

/// Serde adapter distinguishing an absent `to` from an explicit `to: null`.
mod double_option {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Option<String>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(inner) => inner.serialize(serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Option<String>>, D::Error> {
        Option::<String>::deserialize(deserializer).map(Some)
    }
}

impl HandlerFilter {
    /// Normalize a topic slot entry to a `0x` topic hash (signatures are
    /// hashed, hashes pass through lowercased).
    pub fn normalized_topic(raw: &str) -> String {
        if raw.starts_with("0x") {
            raw.to_lowercase()
        } else {
            event_topic(raw)
        }
    }

    /// Normalize the function filter to a `0x` 4-byte selector.
    pub fn normalized_selector(raw: &str) -> String {
        if raw.starts_with("0x") {
            raw.to_lowercase()
        } else {
            function_selector(raw)
        }
    }

    /// Returns `true` if `log` satisfies the topic slots of this filter.
    pub fn matches_log(&self, log: &EthLog) -> bool {
        for (i, slot) in self.topics.iter().enumerate() {
            let Some(wanted) = slot else { continue };
            let Some(actual) = log.topics.get(i) else {
                return false;
            };
            if wanted == TOPIC_NOT_NULL {
                continue;
            }
            if Self::normalized_topic(wanted) != actual.to_lowercase() {
                return false;
            }
        }
        true
    }

    /// Returns `true` if `tx` satisfies the from/to/function filter.
    pub fn matches_transaction(&self, tx: &EthTransaction) -> bool {
        if let Some(from) = &self.from {
            if !from.eq_ignore_ascii_case(&tx.from) {
                return false;
            }
        }
        match &self.to {
            None => {}
            // Explicit null matches contract-creation transactions.
            Some(None) => {
                if tx.to.is_some() {
                    return false;
                }
            }
            Some(Some(to)) => match &tx.to {
                Some(actual) => {
                    if !to.eq_ignore_ascii_case(actual) {
                        return false;
                    }
                }
                None => return false,
            },
        }
        if let Some(function) = &self.function {
            let selector = Self::normalized_selector(function);
            match tx.selector() {
                Some(actual) => {
                    if !selector.eq_ignore_ascii_case(actual) {
                        return false;
                    }
                }
                None => return false,
            }
        }
        true
    }
}

/// A handler declaration inside a data source mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerDef {
    pub kind: HandlerKind,
    pub handler: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<HandlerFilter>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Mapping {
    pub handlers: Vec<HandlerDef>,
}

/// Per-data-source options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DataSourceOptions {
    /// Name of the ABI to decode with (keyed into the interface cache).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abi: Option<String>,
    /// Contract address this data source is pinned to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

/// A user-supplied data source: a group of handlers active from
/// `start_block` (until `end_block`, if set).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSource {
    pub kind: String,
    pub start_block: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_block: Option<u64>,
    #[serde(default)]
    pub options: DataSourceOptions,
    pub mapping: Mapping,
}

impl DataSource {
    /// Returns `true` if this data source is active at `height`.
    pub fn active_at(&self, height: u64) -> bool {
        height >= self.start_block && self.end_block.map_or(true, |end| height <= end)
    }

    /// Returns `true` if any handler is a Block handler without a modulo
    /// filter — every block must then be delivered.
    pub fn needs_every_block(&self) -> bool {
        self.mapping.handlers.iter().any(|h| {
            h.kind == HandlerKind::Block
                && h.filter.as_ref().and_then(|f| f.modulo).is_none()
        })
    }

    /// Modulo strides declared by Block handlers of this data source.
    pub fn modulos(&self) -> Vec<u64> {
        self.mapping
            .handlers
            .iter()
            .filter(|h| h.kind == HandlerKind::Block)
            .filter_map(|h| h.filter.as_ref().and_then(|f| f.modulo))
            .collect()
    }
}

/// Ordered map from start height to the data-source set active from there.
///
/// Built from the full data-source list; lookup is O(log N) over the range
/// boundaries (every `start_block` and every `end_block + 1`).
#[derive(Debug, Clone, Default)]
pub struct BlockHeightMap<T> {
    map: BTreeMap<u64, Vec<T>>,
}

impl<T: Clone> BlockHeightMap<T> {
    pub fn new(map: BTreeMap<u64, Vec<T>>) -> Self {
        Self { map }
    }

    pub fn get_all(&self) -> &BTreeMap<u64, Vec<T>> {
        &self.map
    }

    /// The set active at `height` (empty slice before the first boundary).
    pub fn get(&self, height: u64) -> &[T] {
        self.map
            .range(..=height)
            .next_back()
            .map(|(_, v)| v.as_slice())
            .unwrap_or(&[])
    }

    /// The boundary range containing `height`: `(start, end_exclusive?)`.
    pub fn range_of(&self, height: u64) -> Option<(u64, Option<u64>)> {
        let start = *self.map.range(..=height).next_back()?.0;
        let end = self.map.range(height + 1..).next().map(|(k, _)| *k);
        Some((start, end))
    }

    /// The lowest boundary height, if any.
    pub fn first_height(&self) -> Option<u64> {
        self.map.keys().next().copied()
    }
}

impl BlockHeightMap<DataSource> {
    /// Project a data-source list onto its height boundaries.
    pub fn from_data_sources(sources: &[DataSource]) -> Self {
        let mut boundaries: Vec<u64> = sources
            .iter()
            .flat_map(|ds| {
                std::iter::once(ds.start_block).chain(ds.end_block.map(|end| end + 1))
            })
            .collect();
        boundaries.sort_unstable();
        boundaries.dedup();

        let map = boundaries
            .into_iter()
            .map(|height| {
                let active: Vec<DataSource> = sources
                    .iter()
                    .filter(|ds| ds.active_at(height))
                    .cloned()
                    .collect();
                (height, active)
            })
            .collect();
        Self { map }
    }
}
