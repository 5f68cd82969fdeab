//! ABI decoding against user-supplied fragments.
//!
//! Interfaces are cached process-wide by ABI name: the first load wins, and
//! two data sources sharing a name but not a definition are not detected.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use alloy_core::dyn_abi::{DynSolType, DynSolValue};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tiny_keccak::{Hasher, Keccak};

use crate::error::ChainError;
use crate::types::{EthLog, EthTransaction};

// ─── Hashing ──────────────────────────────────────────────────────────────────

/// keccak256 of arbitrary bytes.
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak::v256();
    let mut output = [0u8; 32];
    hasher.update(data);
    hasher.finalize(&mut output);
    output
}

/// The topic0 of a canonical event signature, e.g.
/// `"Transfer(address,address,uint256)"`.
pub fn event_topic(signature: &str) -> String {
    format!("0x{}", hex::encode(keccak256(signature.as_bytes())))
}

/// The 4-byte selector of a canonical function signature, e.g.
/// `"transfer(address,uint256)"` → `0xa9059cbb`.
pub fn function_selector(signature: &str) -> String {
    format!("0x{}", hex::encode(&keccak256(signature.as_bytes())[..4]))
}

// ─── Fragments and interfaces ─────────────────────────────────────────────────

/// One parameter of an ABI fragment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbiParam {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub indexed: bool,
}

/// A single event or function declaration from an ABI file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbiFragment {
    /// `"event"` or `"function"`.
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    #[serde(default)]
    pub inputs: Vec<AbiParam>,
}

impl AbiFragment {
    /// Canonical signature string, e.g. `"Transfer(address,address,uint256)"`.
    pub fn signature(&self) -> String {
        let types: Vec<&str> = self.inputs.iter().map(|p| p.kind.as_str()).collect();
        format!("{}({})", self.name, types.join(","))
    }
}

struct AbiEvent {
    name: String,
    /// `(param name, type, indexed)` in declaration order.
    params: Vec<(String, DynSolType, bool)>,
}

struct AbiFunction {
    name: String,
    params: Vec<(String, DynSolType)>,
}

/// A parsed ABI: events keyed by topic0, functions keyed by selector.
pub struct AbiInterface {
    events: HashMap<String, AbiEvent>,
    functions: HashMap<String, AbiFunction>,
}

impl AbiInterface {
    pub fn parse(fragments: &[AbiFragment]) -> Result<Self, ChainError> {
        let mut events = HashMap::new();
        let mut functions = HashMap::new();

        for fragment in fragments {
            let parse_param = |p: &AbiParam| {
                p.kind
                    .parse::<DynSolType>()
                    .map_err(|e| ChainError::Abi(format!("bad type `{}`: {e}", p.kind)))
            };
            match fragment.kind.as_str() {
                "event" => {
                    let params = fragment
                        .inputs
                        .iter()
                        .map(|p| Ok((p.name.clone(), parse_param(p)?, p.indexed)))
                        .collect::<Result<Vec<_>, ChainError>>()?;
                    events.insert(
                        event_topic(&fragment.signature()),
                        AbiEvent {
                            name: fragment.name.clone(),
                            params,
                        },
                    );
                }
                "function" => {
                    let params = fragment
                        .inputs
                        .iter()
                        .map(|p| Ok((p.name.clone(), parse_param(p)?)))
                        .collect::<Result<Vec<_>, ChainError>>()?;
                    functions.insert(
                        function_selector(&fragment.signature()),
                        AbiFunction {
                            name: fragment.name.clone(),
                            params,
                        },
                    );
                }
                _ => {} // constructors, errors, fallbacks are not dispatch targets
            }
        }

        Ok(Self { events, functions })
    }
}

// ─── Process-wide cache ───────────────────────────────────────────────────────

static INTERFACE_CACHE: OnceLock<Mutex<HashMap<String, Arc<AbiInterface>>>> = OnceLock::new();

fn cache() -> &'static Mutex<HashMap<String, Arc<AbiInterface>>> {
    INTERFACE_CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Load (or fetch the cached) interface for `name`. First load wins.
pub fn load_interface(
    name: &str,
    fragments: &[AbiFragment],
) -> Result<Arc<AbiInterface>, ChainError> {
    let mut cache = cache().lock().unwrap();
    if let Some(existing) = cache.get(name) {
        return Ok(existing.clone());
    }
    let interface = Arc::new(AbiInterface::parse(fragments)?);
    cache.insert(name.to_string(), interface.clone());
    Ok(interface)
}

/// A previously loaded interface, if any.
pub fn cached_interface(name: &str) -> Option<Arc<AbiInterface>> {
    cache().lock().unwrap().get(name).cloned()
}

// ─── Decoding ─────────────────────────────────────────────────────────────────

/// A decoded log: event name plus named arguments as JSON.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParsedLog {
    pub name: String,
    pub args: Value,
}

/// A decoded transaction: function name plus named arguments as JSON.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParsedTransaction {
    pub name: String,
    pub args: Value,
}

/// Decode `log` against `interface`. Returns `None` when topic0 does not
/// match any known event.
pub fn parse_log(
    interface: &AbiInterface,
    log: &EthLog,
) -> Result<Option<ParsedLog>, ChainError> {
    let Some(topic0) = log.topics.first() else {
        return Ok(None);
    };
    let Some(event) = interface.events.get(&topic0.to_lowercase()) else {
        return Ok(None);
    };

    let data = decode_hex(&log.data)?;
    let mut args = serde_json::Map::new();
    let mut topic_cursor = 1usize;

    let body_types: Vec<DynSolType> = event
        .params
        .iter()
        .filter(|(_, _, indexed)| !indexed)
        .map(|(_, ty, _)| ty.clone())
        .collect();
    let body = DynSolType::Tuple(body_types)
        .abi_decode_params(&data)
        .map_err(|e| ChainError::Abi(format!("log data decode: {e}")))?;
    let mut body_values = match body {
        DynSolValue::Tuple(values) => values.into_iter(),
        other => vec![other].into_iter(),
    };

    for (name, ty, indexed) in &event.params {
        let value = if *indexed {
            let topic = log
                .topics
                .get(topic_cursor)
                .ok_or_else(|| ChainError::Abi("missing indexed topic".into()))?;
            topic_cursor += 1;
            if is_dynamic(ty) {
                // Dynamic indexed params are stored as their keccak hash.
                Value::String(topic.to_lowercase())
            } else {
                let word = decode_hex(topic)?;
                let decoded = ty
                    .abi_decode(&word)
                    .map_err(|e| ChainError::Abi(format!("topic decode: {e}")))?;
                sol_value_to_json(&decoded)
            }
        } else {
            let decoded = body_values
                .next()
                .ok_or_else(|| ChainError::Abi("log data arity mismatch".into()))?;
            sol_value_to_json(&decoded)
        };
        args.insert(name.clone(), value);
    }

    Ok(Some(ParsedLog {
        name: event.name.clone(),
        args: Value::Object(args),
    }))
}

/// Decode `tx` call data against `interface`. Returns `None` when the
/// selector does not match any known function.
pub fn parse_transaction(
    interface: &AbiInterface,
    tx: &EthTransaction,
) -> Result<Option<ParsedTransaction>, ChainError> {
    let Some(selector) = tx.selector() else {
        return Ok(None);
    };
    let Some(function) = interface.functions.get(&selector.to_lowercase()) else {
        return Ok(None);
    };

    let input = decode_hex(&tx.input)?;
    if input.len() < 4 {
        return Ok(None);
    }
    let types: Vec<DynSolType> = function.params.iter().map(|(_, ty)| ty.clone()).collect();
    let decoded = DynSolType::Tuple(types)
        .abi_decode_params(&input[4..])
        .map_err(|e| ChainError::Abi(format!("calldata decode: {e}")))?;

    let values = match decoded {
        DynSolValue::Tuple(values) => values,
        other => vec![other],
    };
    let mut args = serde_json::Map::new();
    for ((name, _), value) in function.params.iter().zip(values.iter()) {
        args.insert(name.clone(), sol_value_to_json(value));
    }

    Ok(Some(ParsedTransaction {
        name: function.name.clone(),
        args: Value::Object(args),
    }))
}

fn is_dynamic(ty: &DynSolType) -> bool {
    match ty {
        DynSolType::String | DynSolType::Bytes | DynSolType::Array(_) => true,
        DynSolType::FixedArray(inner, _) => is_dynamic(inner),
        DynSolType::Tuple(inner) => inner.iter().any(is_dynamic),
        _ => false,
    }
}

fn decode_hex(s: &str) -> Result<Vec<u8>, ChainError> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    if s.is_empty() {
        return Ok(vec![]);
    }
    hex::decode(s).map_err(|e| ChainError::Abi(format!("bad hex: {e}")))
}

/// Render a decoded Solidity value as JSON. Numbers wider than u64 keep
/// their decimal string form.
fn sol_value_to_json(value: &DynSolValue) -> Value {
    match value {
        DynSolValue::Address(a) => Value::String(format!("{a:?}").to_lowercase()),
        DynSolValue::Bool(b) => Value::Bool(*b),
        DynSolValue::Uint(n, _) => json!(n.to_string()),
        DynSolValue::Int(n, _) => json!(n.to_string()),
        DynSolValue::FixedBytes(bytes, size) => {
            Value::String(format!("0x{}", hex::encode(&bytes.as_slice()[..*size])))
        }
        DynSolValue::Bytes(bytes) => Value::String(format!("0x{}", hex::encode(bytes))),
        DynSolValue::String(s) => Value::String(s.clone()),
        DynSolValue::Array(items) | DynSolValue::FixedArray(items) => {
            Value::Array(items.iter().map(sol_value_to_json).collect())
        }
        DynSolValue::Tuple(items) => Value::Array(items.iter().map(sol_value_to_json).collect()),
        _ => Value::Null,
    }
}
