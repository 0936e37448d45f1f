//! JSON-RPC command encoding and reply decoding.

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{CodecError, CodecResult, RpcError};
use crate::{DEFAULT_ERROR_CODE, JSONRPC_VERSION, MAX_REQUEST_ID};

/// A JSON-RPC request as sent to the server.
///
/// The id is random and never matched against the reply: each connection
/// carries a single outstanding request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub jsonrpc: String,
    pub id: String,
    pub method: String,
    pub params: Value,
}

impl Request {
    /// Builds a request with a fresh random id.
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        let id = rand::rng().random_range(0..=MAX_REQUEST_ID);
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: id.to_string(),
            method: method.into(),
            params: normalize_params(params),
        }
    }
}

/// Maps absent or empty parameters to an empty object.
///
/// The server rejects `null` params and treats `[]` and `{}` alike, so
/// only non-empty lists and maps go on the wire as given.
pub fn normalize_params(params: Option<Value>) -> Value {
    match params {
        None | Some(Value::Null) => Value::Object(Map::new()),
        Some(Value::Array(items)) if items.is_empty() => Value::Object(Map::new()),
        Some(Value::Object(map)) if map.is_empty() => Value::Object(map),
        Some(other) => other,
    }
}

/// Encodes a command into its JSON text form.
pub fn encode_command(method: &str, params: Option<Value>) -> CodecResult<String> {
    let request = Request::new(method, params);
    Ok(serde_json::to_string(&request)?)
}

/// Decodes a reply, returning its `result` value.
///
/// # Errors
///
/// - [`CodecError::Malformed`] when `text` is not JSON.
/// - [`CodecError::Rpc`] when the reply has an `error` object, or has no
///   `result` (reported with the reserved internal-error code).
pub fn decode_reply(text: &str) -> CodecResult<Value> {
    let reply: Value = serde_json::from_str(text).map_err(|source| CodecError::Malformed {
        reply: text.to_string(),
        source,
    })?;

    let Value::Object(mut fields) = reply else {
        return Err(CodecError::Rpc(RpcError::internal()));
    };

    if let Some(Value::Object(error)) = fields.get("error") {
        return Err(CodecError::Rpc(rpc_error_from(error)));
    }

    fields
        .remove("result")
        .ok_or_else(|| CodecError::Rpc(RpcError::internal()))
}

fn rpc_error_from(error: &Map<String, Value>) -> RpcError {
    let code = error
        .get("code")
        .and_then(Value::as_i64)
        .unwrap_or(DEFAULT_ERROR_CODE);
    let message = match error.get("message") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    };
    let data = error.get("data").filter(|d| !d.is_null()).cloned();

    RpcError {
        code,
        message,
        data,
    }
}
