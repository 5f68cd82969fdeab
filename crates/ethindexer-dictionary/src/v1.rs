//! Protocol v1: a GraphQL dictionary returning sparse matching heights.
//!
//! One aliased entity set is emitted per condition group (`logs` /
//! `evmTransactions`), each returning `{ nodes { blockHeight } }`, plus a
//! `_metadata` block. The `distinct` argument and the `startHeight` metadata
//! field are attempted optimistically and disabled for the session when the
//! server rejects them as unknown, so old dictionary deployments keep
//! working.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::client::{
    entry_at, DictionaryClient, DictionaryMetadata, DictionaryResponse, DictionaryVersion,
};
use crate::entry::{LogCondition, QueryEntry, TxCondition};
use crate::error::DictionaryError;

pub struct V1Dictionary {
    endpoint: String,
    http: reqwest::Client,
    queries: Mutex<BTreeMap<u64, QueryEntry>>,
    metadata: Mutex<Option<DictionaryMetadata>>,
    supports_distinct: AtomicBool,
    supports_start_height: AtomicBool,
}

impl V1Dictionary {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            http: reqwest::Client::new(),
            queries: Mutex::new(BTreeMap::new()),
            metadata: Mutex::new(None),
            supports_distinct: AtomicBool::new(true),
            supports_start_height: AtomicBool::new(true),
        }
    }

    async fn post(&self, query: &str) -> Result<Value, DictionaryError> {
        let response = self
            .http
            .post(&self.endpoint)
            .json(&json!({ "query": query }))
            .send()
            .await
            .map_err(|e| DictionaryError::Unavailable(e.to_string()))?;
        response
            .json::<Value>()
            .await
            .map_err(|e| DictionaryError::Malformed(e.to_string()))
    }

    /// Execute `build`, disabling optional capabilities the server rejects
    /// and retrying, until the response has no unknown-argument errors.
    async fn query_with_feature_detection<F>(&self, build: F) -> Result<Value, DictionaryError>
    where
        F: Fn(bool, bool) -> String,
    {
        for _ in 0..3 {
            let doc = build(
                self.supports_distinct.load(Ordering::Relaxed),
                self.supports_start_height.load(Ordering::Relaxed),
            );
            let response = self.post(&doc).await?;

            let Some(errors) = response["errors"].as_array().filter(|e| !e.is_empty()) else {
                return Ok(response);
            };
            let messages: Vec<&str> = errors
                .iter()
                .filter_map(|e| e["message"].as_str())
                .collect();

            if messages.iter().any(|m| m.contains("distinct"))
                && self.supports_distinct.swap(false, Ordering::Relaxed)
            {
                tracing::info!(endpoint = %self.endpoint, "dictionary does not support distinct");
                continue;
            }
            if messages.iter().any(|m| m.contains("startHeight"))
                && self.supports_start_height.swap(false, Ordering::Relaxed)
            {
                tracing::info!(endpoint = %self.endpoint, "dictionary does not expose startHeight");
                continue;
            }
            return Err(DictionaryError::Malformed(messages.join("; ")));
        }
        Err(DictionaryError::Malformed(
            "feature detection did not converge".into(),
        ))
    }

    fn store_metadata(&self, meta: &Value) -> DictionaryMetadata {
        let parsed = parse_metadata(meta);
        *self.metadata.lock().unwrap() = Some(parsed.clone());
        parsed
    }
}

#[async_trait]
impl DictionaryClient for V1Dictionary {
    fn version(&self) -> DictionaryVersion {
        DictionaryVersion::V1
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn init_metadata(&self) -> Result<DictionaryMetadata, DictionaryError> {
        let response = self
            .query_with_feature_detection(|_, start_height| render_metadata_query(start_height))
            .await?;
        if response["data"]["_metadata"].is_null() {
            return Err(DictionaryError::Malformed("no _metadata in response".into()));
        }
        Ok(self.store_metadata(&response["data"]["_metadata"]))
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
        // A data-source boundary inside [start, end] clips the scan.
        let end = range_end.map_or(end, |boundary| end.min(boundary));

        let response = self
            .query_with_feature_detection(|distinct, start_height| {
                render_scan_query(&entry, start, end, limit, distinct, start_height)
            })
            .await?;

        let data = &response["data"];
        if data.is_null() {
            return Err(DictionaryError::Malformed("no data in response".into()));
        }
        let metadata = self.store_metadata(&data["_metadata"]);

        let mut heights = parse_group_heights(data);
        heights.retain(|h| *h >= start && *h <= end);
        heights.sort_unstable();
        heights.dedup();

        // A full page means there may be more matches before `end`.
        let last_buffered = if heights.len() >= limit {
            heights.truncate(limit);
            *heights.last().expect("limit > 0")
        } else {
            end.min(metadata.last_processed_height)
        };

        Ok(DictionaryResponse {
            batch_blocks: heights,
            last_buffered_height: last_buffered,
            blocks: vec![],
        })
    }
}

// ─── Query rendering ──────────────────────────────────────────────────────────

fn render_metadata_fields(with_start_height: bool) -> String {
    let start_height = if with_start_height { " startHeight" } else { "" };
    format!("_metadata {{ lastProcessedHeight genesisHash chain{start_height} }}")
}

fn render_metadata_query(with_start_height: bool) -> String {
    format!("{{ {} }}", render_metadata_fields(with_start_height))
}

fn render_scan_query(
    entry: &QueryEntry,
    start: u64,
    end: u64,
    limit: usize,
    distinct: bool,
    with_start_height: bool,
) -> String {
    let mut doc = format!("{{ {}", render_metadata_fields(with_start_height));

    let distinct_arg = if distinct { ", distinct: [BLOCK_HEIGHT]" } else { "" };

    for (i, log) in entry.logs.iter().enumerate() {
        doc.push_str(&format!(
            " logs{i}: logs(filter: {{and: [{}]}}, orderBy: BLOCK_HEIGHT_ASC, first: {limit}{distinct_arg}) {{ nodes {{ blockHeight }} }}",
            render_log_filter(log, start, end)
        ));
    }
    for (i, tx) in entry.transactions.iter().enumerate() {
        doc.push_str(&format!(
            " transactions{i}: evmTransactions(filter: {{and: [{}]}}, orderBy: BLOCK_HEIGHT_ASC, first: {limit}{distinct_arg}) {{ nodes {{ blockHeight }} }}",
            render_tx_filter(tx, start, end)
        ));
    }
    doc.push_str(" }");
    doc
}

fn render_range(start: u64, end: u64) -> String {
    format!(
        "{{blockHeight: {{greaterThanOrEqualTo: \"{start}\"}}}}, {{blockHeight: {{lessThanOrEqualTo: \"{end}\"}}}}"
    )
}

fn render_log_filter(log: &LogCondition, start: u64, end: u64) -> String {
    let mut parts = vec![render_range(start, end)];
    if !log.address.is_empty() {
        parts.push(format!("{{address: {{in: {}}}}}", quote_list(&log.address)));
    }
    for (slot, topics) in [
        ("topics0", &log.topics0),
        ("topics1", &log.topics1),
        ("topics2", &log.topics2),
        ("topics3", &log.topics3),
    ] {
        if let Some(topics) = topics {
            if topics.is_empty() {
                // "present with any value"
                parts.push(format!("{{{slot}: {{isNull: false}}}}"));
            } else {
                parts.push(format!("{{{slot}: {{in: {}}}}}", quote_list(topics)));
            }
        }
    }
    parts.join(", ")
}

fn render_tx_filter(tx: &TxCondition, start: u64, end: u64) -> String {
    let mut parts = vec![render_range(start, end)];
    if !tx.from.is_empty() {
        parts.push(format!("{{from: {{in: {}}}}}", quote_list(&tx.from)));
    }
    if let Some(to) = &tx.to {
        let concrete: Vec<String> = to.iter().flatten().cloned().collect();
        let has_null = to.iter().any(Option::is_none);
        if has_null {
            // Explicit null matches contract-creation transactions.
            parts.push("{to: {isNull: true}}".into());
        }
        if !concrete.is_empty() {
            parts.push(format!("{{to: {{in: {}}}}}", quote_list(&concrete)));
        }
    }
    if !tx.function.is_empty() {
        parts.push(format!("{{func: {{in: {}}}}}", quote_list(&tx.function)));
    }
    parts.join(", ")
}

fn quote_list(items: &[String]) -> String {
    let quoted: Vec<String> = items.iter().map(|s| format!("\"{s}\"")).collect();
    format!("[{}]", quoted.join(", "))
}

// ─── Response parsing ─────────────────────────────────────────────────────────

fn parse_metadata(meta: &Value) -> DictionaryMetadata {
    DictionaryMetadata {
        chain: meta["chain"].as_str().map(Into::into),
        genesis_hash: meta["genesisHash"].as_str().map(Into::into),
        last_processed_height: lenient_u64(&meta["lastProcessedHeight"]).unwrap_or(0),
        start_height: lenient_u64(&meta["startHeight"]).unwrap_or(1),
    }
}

/// Collect `nodes[].blockHeight` from every aliased group in `data`.
fn parse_group_heights(data: &Value) -> Vec<u64> {
    let Some(object) = data.as_object() else {
        return vec![];
    };
    object
        .iter()
        .filter(|(key, _)| *key != "_metadata")
        .filter_map(|(_, group)| group["nodes"].as_array())
        .flatten()
        .filter_map(|node| lenient_u64(&node["blockHeight"]))
        .collect()
}

/// Postgraphile renders BigInt as a string; accept both.
fn lenient_u64(v: &Value) -> Option<u64> {
    v.as_u64().or_else(|| v.as_str()?.parse().ok())
}
