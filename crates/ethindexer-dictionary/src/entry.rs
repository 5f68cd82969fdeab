//! Dictionary query entries, projected from the active data-source set.
//!
//! An entry collects every handler filter into address/topic/selector sets.
//! Empty sub-arrays mean "present with any value"; absent keys mean "do not
//! filter". A Block handler without a modulo voids the entry — the dictionary
//! cannot accelerate a range where every block must be delivered.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use ethindexer_chain::datasource::{BlockHeightMap, DataSource, HandlerKind, TOPIC_NOT_NULL};
use ethindexer_chain::HandlerFilter;

/// Log-side filter group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogCondition {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub address: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topics0: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topics1: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topics2: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topics3: Option<Vec<String>>,
}

/// Transaction-side filter group. A `None` inside `to` matches
/// contract-creation transactions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxCondition {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub from: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<Vec<Option<String>>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub function: Vec<String>,
}

/// The query entry for one height range.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryEntry {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub logs: Vec<LogCondition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transactions: Vec<TxCondition>,
}

impl QueryEntry {
    /// An empty entry carries no conditions — every block matches, so the
    /// dictionary cannot skip anything.
    pub fn is_unfiltered(&self) -> bool {
        self.logs.is_empty() && self.transactions.is_empty()
    }
}

/// Project one active data-source set into a query entry.
pub fn build_query_entry(sources: &[DataSource]) -> QueryEntry {
    // Any unconditional Block handler forces full delivery.
    if sources.iter().any(DataSource::needs_every_block) {
        return QueryEntry::default();
    }

    let mut entry = QueryEntry::default();

    for ds in sources {
        let address = ds.options.address.as_deref().map(str::to_lowercase);

        for handler in &ds.mapping.handlers {
            let filter = handler.filter.clone().unwrap_or_default();
            match handler.kind {
                HandlerKind::Block => {} // modulo strides are overlaid by the fetcher
                HandlerKind::Event => {
                    let mut condition = LogCondition {
                        address: address.clone().into_iter().collect(),
                        ..Default::default()
                    };
                    let slots = [
                        &mut condition.topics0,
                        &mut condition.topics1,
                        &mut condition.topics2,
                        &mut condition.topics3,
                    ];
                    for (slot, raw) in slots.into_iter().zip(filter.topics.iter()) {
                        match raw.as_deref() {
                            None => {}
                            // "!null" — present with any value.
                            Some(TOPIC_NOT_NULL) => *slot = Some(vec![]),
                            Some(topic) => {
                                *slot = Some(vec![HandlerFilter::normalized_topic(topic)]);
                            }
                        }
                    }
                    push_unique(&mut entry.logs, condition);
                }
                HandlerKind::Call => {
                    let to = match (&address, &filter.to) {
                        (Some(addr), Some(filter_to)) => {
                            // The data source is pinned to a contract; a
                            // conflicting explicit `to` cannot widen it.
                            let normalized = filter_to.as_deref().map(str::to_lowercase);
                            if normalized.as_deref() != Some(addr.as_str()) {
                                tracing::warn!(
                                    address = %addr,
                                    filter_to = ?filter_to,
                                    "call filter `to` conflicts with data source address, ignoring filter"
                                );
                            }
                            Some(vec![Some(addr.clone())])
                        }
                        (Some(addr), None) => Some(vec![Some(addr.clone())]),
                        (None, Some(filter_to)) => {
                            Some(vec![filter_to.as_deref().map(str::to_lowercase)])
                        }
                        (None, None) => None,
                    };
                    let condition = TxCondition {
                        from: filter
                            .from
                            .as_deref()
                            .map(str::to_lowercase)
                            .into_iter()
                            .collect(),
                        to,
                        function: filter
                            .function
                            .as_deref()
                            .map(HandlerFilter::normalized_selector)
                            .into_iter()
                            .collect(),
                    };
                    push_unique(&mut entry.transactions, condition);
                }
            }
        }
    }

    entry
}

/// Rebuild the per-range query map from the active data-source map.
pub fn build_queries_map(map: &BlockHeightMap<DataSource>) -> BTreeMap<u64, QueryEntry> {
    build_queries_map_with_limit(map, usize::MAX)
}

/// Like [`build_queries_map`], but an entry whose address count exceeds
/// `address_limit` is voided — a query that large would be rejected or time
/// out server-side, so the range falls back to dense fetching instead.
pub fn build_queries_map_with_limit(
    map: &BlockHeightMap<DataSource>,
    address_limit: usize,
) -> BTreeMap<u64, QueryEntry> {
    map.get_all()
        .iter()
        .map(|(height, sources)| {
            let entry = build_query_entry(sources);
            let addresses: usize = entry.logs.iter().map(|l| l.address.len()).sum::<usize>()
                + entry
                    .transactions
                    .iter()
                    .map(|t| t.to.as_ref().map_or(0, Vec::len))
                    .sum::<usize>();
            if addresses > address_limit {
                tracing::warn!(
                    height,
                    addresses,
                    address_limit,
                    "too many addresses for a dictionary query, range will fetch densely"
                );
                (*height, QueryEntry::default())
            } else {
                (*height, entry)
            }
        })
        .collect()
}

fn push_unique<T: PartialEq>(list: &mut Vec<T>, item: T) {
    if !list.contains(&item) {
        list.push(item);
    }
}
