//! Request coalescing: concurrent calls arriving within the batch window are
//! flushed as a single JSON array request.
//!
//! Each caller gets its response back through a `oneshot` channel. Batch
//! responses are matched to callers by request id, not position — nodes may
//! answer out of order. A non-array response (or a length mismatch) freezes
//! the adaptive batch size and the affected requests are replayed one by one.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::client::{ClientInner, RequestOptions};
use crate::error::RpcError;
use crate::request::{JsonRpcRequest, JsonRpcResponse};

pub(crate) struct PendingCall {
    pub req: JsonRpcRequest,
    pub tx: oneshot::Sender<Result<Value, RpcError>>,
}

/// Background task: collect pending calls and flush them in batches.
pub(crate) async fn flush_loop(
    inner: Arc<ClientInner>,
    mut rx: mpsc::UnboundedReceiver<PendingCall>,
) {
    loop {
        let first = match rx.recv().await {
            Some(item) => item,
            None => break, // client dropped
        };

        let mut pending = vec![first];
        let limit = inner.batch_size.lock().unwrap().current();

        let deadline = tokio::time::sleep(inner.config.batch_window);
        tokio::pin!(deadline);

        while pending.len() < limit {
            tokio::select! {
                _ = &mut deadline => break,
                item = rx.recv() => match item {
                    Some(i) => pending.push(i),
                    None => break,
                },
            }
        }

        let requests: Vec<JsonRpcRequest> = pending.iter().map(|p| p.req.clone()).collect();
        let results = send_chunk(&inner, requests).await;
        for (call, result) in pending.into_iter().zip(results) {
            let _ = call.tx.send(result);
        }
    }
}

/// Send one chunk of requests and return per-request results in order.
pub(crate) async fn send_chunk(
    inner: &Arc<ClientInner>,
    requests: Vec<JsonRpcRequest>,
) -> Vec<Result<Value, RpcError>> {
    if requests.is_empty() {
        return vec![];
    }
    if requests.len() == 1 {
        let result = send_single(inner, &requests[0]).await;
        return vec![result];
    }

    let body = match serde_json::to_string(&requests) {
        Ok(b) => b,
        Err(e) => {
            let msg = e.to_string();
            return requests
                .iter()
                .map(|_| Err(RpcError::Internal(msg.clone())))
                .collect();
        }
    };

    let sent = requests.len();
    match inner.fetch_json(Some(body), &RequestOptions::default()).await {
        Ok(Value::Array(items)) if items.len() == sent => {
            inner.batch_size.lock().unwrap().record_success(sent);
            route_by_id(requests, items)
        }
        Ok(other) => {
            // Non-array (or wrong length): the provider rejected this batch
            // size. Freeze the probe and replay the calls individually.
            inner.batch_size.lock().unwrap().record_failure();
            tracing::warn!(
                sent,
                got = %summarize(&other),
                url = %inner.url,
                "malformed batch response — replaying individually"
            );
            let mut results = Vec::with_capacity(sent);
            for req in &requests {
                results.push(send_single(inner, req).await);
            }
            results
        }
        Err(e) => {
            inner.batch_size.lock().unwrap().record_failure();
            let msg = e.to_string();
            requests
                .iter()
                .map(|_| Err(RpcError::Server(msg.clone())))
                .collect()
        }
    }
}

async fn send_single(
    inner: &Arc<ClientInner>,
    req: &JsonRpcRequest,
) -> Result<Value, RpcError> {
    let body = serde_json::to_string(req).map_err(RpcError::Deserialization)?;
    let raw = inner.fetch_json(Some(body), &RequestOptions::default()).await?;
    let resp: JsonRpcResponse = serde_json::from_value(raw)?;
    resp.into_result().map_err(RpcError::Rpc)
}

/// Match batch responses to requests by id.
fn route_by_id(
    requests: Vec<JsonRpcRequest>,
    items: Vec<Value>,
) -> Vec<Result<Value, RpcError>> {
    let mut by_id: HashMap<String, JsonRpcResponse> = HashMap::with_capacity(items.len());
    for item in items {
        match serde_json::from_value::<JsonRpcResponse>(item) {
            Ok(resp) => {
                by_id.insert(resp.id.to_string(), resp);
            }
            Err(e) => {
                tracing::warn!(error = %e, "unparseable entry in batch response");
            }
        }
    }

    requests
        .into_iter()
        .map(|req| match by_id.remove(&req.id.to_string()) {
            Some(resp) => resp.into_result().map_err(RpcError::Rpc),
            None => Err(RpcError::MalformedBatch(format!(
                "no response for request id {}",
                req.id
            ))),
        })
        .collect()
}

fn summarize(v: &Value) -> String {
    match v {
        Value::Array(a) => format!("array[{}]", a.len()),
        Value::Object(_) => "object".into(),
        other => other.to_string().chars().take(60).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::RpcId;

    fn resp(id: u64, result: Value) -> Value {
        serde_json::to_value(JsonRpcResponse {
            jsonrpc: "2.0".into(),
            id: RpcId::Number(id),
            result: Some(result),
            error: None,
        })
        .unwrap()
    }

    #[test]
    fn routes_out_of_order_responses() {
        let requests = vec![
            JsonRpcRequest::new(1, "eth_blockNumber", vec![]),
            JsonRpcRequest::new(2, "eth_chainId", vec![]),
        ];
        let items = vec![resp(2, Value::String("0x1".into())), resp(1, Value::String("0x64".into()))];

        let results = route_by_id(requests, items);
        assert_eq!(results[0].as_ref().unwrap(), &Value::String("0x64".into()));
        assert_eq!(results[1].as_ref().unwrap(), &Value::String("0x1".into()));
    }

    #[test]
    fn missing_id_is_an_error() {
        let requests = vec![
            JsonRpcRequest::new(1, "eth_blockNumber", vec![]),
            JsonRpcRequest::new(2, "eth_chainId", vec![]),
        ];
        let items = vec![resp(1, Value::Null)];

        let results = route_by_id(requests, items);
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(RpcError::MalformedBatch(_))));
    }
}
