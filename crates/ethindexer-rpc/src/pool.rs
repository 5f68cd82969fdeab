//! Multi-endpoint connection pool with round-robin selection, chain-identity
//! verification on join, and background reconnection.
//!
//! Health is tracked per endpoint by a three-state circuit breaker: sustained
//! failures (or a disconnect event) open the circuit, taking the endpoint out
//! of rotation while a background task probes it with exponential backoff;
//! the first successful probe closes the circuit again.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::{json, Value};

use crate::circuit::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use crate::client::RpcClient;
use crate::error::RpcError;

/// How many times a failed call may walk the pool before surfacing, and how
/// many background reconnect attempts a connection gets before giving up.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// The subset of the client the pool needs. Mocked in tests.
#[async_trait]
pub trait Endpoint: Send + Sync + 'static {
    fn url(&self) -> &str;
    async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, RpcError>;
}

#[async_trait]
impl Endpoint for RpcClient {
    fn url(&self) -> &str {
        RpcClient::url(self)
    }

    async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, RpcError> {
        RpcClient::call(self, method, params).await
    }
}

/// Identity of the chain an endpoint serves. All pool members must agree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInfo {
    pub chain_id: String,
    pub genesis_hash: String,
    pub runtime_chain: String,
}

/// One pooled endpoint plus its health state.
pub struct Connection {
    pub endpoint: String,
    pub api: Arc<dyn Endpoint>,
    pub info: NetworkInfo,
    circuit: CircuitBreaker,
}

impl Connection {
    /// Closed or half-open circuits stay in rotation.
    pub fn is_healthy(&self) -> bool {
        self.circuit.is_allowed()
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.circuit.state()
    }
}

/// Pool of verified connections.
///
/// `api()` hands out healthy connections round-robin. A connection whose
/// circuit opens is parked on the unhealthy side and probed in the background
/// with exponential backoff until it answers again or runs out of attempts.
pub struct ConnectionPool {
    connections: RwLock<Vec<Arc<Connection>>>,
    cursor: AtomicUsize,
    reference: Mutex<Option<NetworkInfo>>,
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(Vec::new()),
            cursor: AtomicUsize::new(0),
            reference: Mutex::new(None),
        }
    }

    /// Number of connections, healthy or not.
    pub fn len(&self) -> usize {
        self.connections.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.read().unwrap().is_empty()
    }

    pub fn healthy_count(&self) -> usize {
        self.connections
            .read()
            .unwrap()
            .iter()
            .filter(|c| c.is_healthy())
            .count()
    }

    /// Chain identity agreed on by the pool (set by the first join).
    pub fn network_info(&self) -> Option<NetworkInfo> {
        self.reference.lock().unwrap().clone()
    }

    /// Verify the endpoint's chain identity and add it to the pool.
    ///
    /// The first connection to join sets the reference identity; any later
    /// mismatch on `chainId`, `genesisHash`, or `runtimeChain` is a fatal
    /// configuration error.
    pub async fn add_connection(&self, api: Arc<dyn Endpoint>) -> Result<(), RpcError> {
        let endpoint = api.url().to_string();
        let info = fetch_network_info(api.as_ref()).await?;

        {
            let mut reference = self.reference.lock().unwrap();
            match reference.as_ref() {
                None => *reference = Some(info.clone()),
                Some(expected) => verify_network(&endpoint, expected, &info)?,
            }
        }

        tracing::info!(
            endpoint = %endpoint,
            chain_id = %info.chain_id,
            runtime = %info.runtime_chain,
            "endpoint joined pool"
        );

        self.connections.write().unwrap().push(Arc::new(Connection {
            endpoint,
            api,
            info,
            circuit: CircuitBreaker::new(CircuitBreakerConfig::default()),
        }));
        Ok(())
    }

    /// Next healthy connection, round-robin.
    pub fn api(&self) -> Result<Arc<Connection>, RpcError> {
        let connections = self.connections.read().unwrap();
        if connections.is_empty() {
            return Err(RpcError::AllEndpointsUnhealthy);
        }
        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % connections.len();
        for i in 0..connections.len() {
            let conn = &connections[(start + i) % connections.len()];
            if conn.is_healthy() {
                return Ok(conn.clone());
            }
        }
        Err(RpcError::AllEndpointsUnhealthy)
    }

    /// Handle a disconnect event: trip the circuit and start probing in the
    /// background.
    pub fn handle_disconnect(&self, conn: &Arc<Connection>) {
        if conn.circuit.state() == CircuitState::Open {
            return; // reconnect already in flight
        }
        conn.circuit.open();
        tracing::warn!(endpoint = %conn.endpoint, "endpoint disconnected");
        spawn_reconnect(conn.clone());
    }

    /// Run `op` against the first available connection, walking the pool on
    /// retryable failure for up to [`MAX_RECONNECT_ATTEMPTS`] tries. Each
    /// outcome feeds the endpoint's circuit breaker; an endpoint whose
    /// circuit opens leaves rotation and is probed in the background.
    pub async fn first_available<T, F>(&self, mut op: F) -> Result<T, RpcError>
    where
        F: FnMut(Arc<Connection>) -> BoxFuture<'static, Result<T, RpcError>>,
    {
        let mut last_err = RpcError::AllEndpointsUnhealthy;
        for attempt in 0..MAX_RECONNECT_ATTEMPTS {
            let conn = self.api()?;
            match op(conn.clone()).await {
                Ok(value) => {
                    conn.circuit.record_success();
                    return Ok(value);
                }
                Err(e) if e.is_retryable() => {
                    tracing::warn!(
                        endpoint = %conn.endpoint,
                        attempt,
                        error = %e,
                        "call failed, failing over"
                    );
                    conn.circuit.record_failure();
                    if conn.circuit.state() == CircuitState::Open {
                        spawn_reconnect(conn.clone());
                    }
                    last_err = e;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err)
    }
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new()
    }
}

fn spawn_reconnect(conn: Arc<Connection>) {
    tokio::spawn(async move {
        reconnect(conn).await;
    });
}

/// Probe an open-circuit endpoint with exponential backoff until a probe
/// closes the circuit or the attempt budget runs out.
async fn reconnect(conn: Arc<Connection>) {
    for attempt in 0..MAX_RECONNECT_ATTEMPTS {
        let delay = Duration::from_secs(1 << attempt.min(5));
        tokio::time::sleep(delay).await;

        // The wait doubles as the circuit's open duration; by now the
        // breaker has moved to half-open and the probe result decides.
        match conn.api.call("eth_chainId", vec![]).await {
            Ok(_) => {
                conn.circuit.record_success();
                if conn.circuit.state() == CircuitState::Closed {
                    tracing::info!(endpoint = %conn.endpoint, attempt, "endpoint reconnected");
                    return;
                }
            }
            Err(e) => {
                conn.circuit.record_failure();
                tracing::debug!(
                    endpoint = %conn.endpoint,
                    attempt,
                    error = %e,
                    "reconnect probe failed"
                );
            }
        }
    }
    tracing::error!(
        endpoint = %conn.endpoint,
        attempts = MAX_RECONNECT_ATTEMPTS,
        "endpoint unreachable, leaving pool rotation"
    );
}

/// Read `chainId`, `genesisHash`, and `runtimeChain` from an endpoint.
pub async fn fetch_network_info(api: &dyn Endpoint) -> Result<NetworkInfo, RpcError> {
    let raw_chain_id = api.call("eth_chainId", vec![]).await?;
    let chain_id = raw_chain_id
        .as_str()
        .map(str::to_lowercase)
        .ok_or_else(|| RpcError::Internal("eth_chainId returned non-string".into()))?;

    let genesis = api
        .call("eth_getBlockByNumber", vec![json!("0x0"), json!(false)])
        .await?;
    let genesis_hash = genesis["hash"]
        .as_str()
        .map(str::to_lowercase)
        .ok_or_else(|| RpcError::Internal("genesis block has no hash".into()))?;

    // Optional on some providers; fall back to the chain id.
    let runtime_chain = match api.call("web3_clientVersion", vec![]).await {
        Ok(Value::String(v)) => v,
        _ => chain_id.clone(),
    };

    Ok(NetworkInfo {
        chain_id,
        genesis_hash,
        runtime_chain,
    })
}

fn verify_network(
    endpoint: &str,
    expected: &NetworkInfo,
    actual: &NetworkInfo,
) -> Result<(), RpcError> {
    if expected.chain_id != actual.chain_id {
        return Err(RpcError::NetworkMismatch {
            endpoint: endpoint.into(),
            field: "chainId",
            expected: expected.chain_id.clone(),
            actual: actual.chain_id.clone(),
        });
    }
    if expected.genesis_hash != actual.genesis_hash {
        return Err(RpcError::NetworkMismatch {
            endpoint: endpoint.into(),
            field: "genesisHash",
            expected: expected.genesis_hash.clone(),
            actual: actual.genesis_hash.clone(),
        });
    }
    if expected.runtime_chain != actual.runtime_chain {
        return Err(RpcError::NetworkMismatch {
            endpoint: endpoint.into(),
            field: "runtimeChain",
            expected: expected.runtime_chain.clone(),
            actual: actual.runtime_chain.clone(),
        });
    }
    Ok(())
}
