//! JSON-RPC 2.0 wire types exchanged with the host daemon.
//!
//! The host writes requests and notifications to the plugin's stdin; the
//! plugin answers on stdout. Requests carry an `id`, notifications do not.

use crate::error::RpcError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub const JSONRPC_VERSION: &str = "2.0";

/// Request not acceptable in the current lifecycle state.
pub const INVALID_REQUEST: i64 = -32600;
/// Unknown, hidden or deprecated method.
pub const METHOD_NOT_FOUND: i64 = -32601;
/// Parameters or option values that do not fit.
pub const INVALID_PARAMS: i64 = -32602;
/// A handler failed without choosing its own error.
pub const INTERNAL_ERROR: i64 = -32603;

/// Request ids are opaque: the host may use numbers or strings.
pub type RequestId = Value;

/// A decoded inbound message, classified by shape.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    /// Carries a non-null `id` and expects exactly one response.
    Request {
        id: RequestId,
        method: String,
        /// `Null` when the host sent no params.
        params: Value,
    },
    /// No `id`: never answered.
    Notification {
        /// The topic name.
        method: String,
        params: Value,
    },
}

/// Why an inbound message could not be classified. Such messages are skipped.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("message is not a JSON object")]
    NotAnObject,
    #[error("message has no method")]
    MissingMethod,
}

impl Incoming {
    pub fn classify(message: Value) -> Result<Self, ProtocolError> {
        let Value::Object(mut fields) = message else {
            return Err(ProtocolError::NotAnObject);
        };
        let method = match fields.remove("method") {
            Some(Value::String(method)) => method,
            _ => return Err(ProtocolError::MissingMethod),
        };
        let params = fields.remove("params").unwrap_or(Value::Null);
        match fields.remove("id") {
            Some(id) if !id.is_null() => Ok(Incoming::Request { id, method, params }),
            _ => Ok(Incoming::Notification { method, params }),
        }
    }
}

/// Either half of a response; exactly one is ever present on the wire.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    /// Serialized as the `result` member.
    Result(Value),
    /// Serialized as the `error` member.
    Error(RpcError),
}

/// Answer to one request.
#[derive(Debug, Clone, Serialize)]
pub struct Response<'a> {
    /// Always `"2.0"`.
    pub jsonrpc: &'static str,
    /// Echo of the request id, whatever its type.
    pub id: &'a RequestId,
    #[serde(flatten)]
    pub outcome: Outcome,
}

impl<'a> Response<'a> {
    pub fn result(id: &'a RequestId, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            outcome: Outcome::Result(result),
        }
    }

    pub fn error(id: &'a RequestId, error: RpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            outcome: Outcome::Error(error),
        }
    }
}

/// Outbound notification: `log`, `message`, `progress` or a declared topic.
#[derive(Debug, Clone, Serialize)]
pub struct Notification<'a, P> {
    /// Always `"2.0"`.
    pub jsonrpc: &'static str,
    /// Topic name.
    pub method: &'a str,
    pub params: P,
}

impl<'a, P: Serialize> Notification<'a, P> {
    pub fn new(method: &'a str, params: P) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            method,
            params,
        }
    }
}

/// Parameters of the `getmanifest` request.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GetManifestParams {
    /// Gates deprecated methods and options for the whole run.
    #[serde(rename = "allow-deprecated-apis", default)]
    pub allow_deprecated_apis: bool,
}

/// Parameters of the `init` request.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InitParams {
    /// Option values chosen by the node operator, keyed by option name.
    #[serde(default)]
    pub options: Map<String, Value>,
    #[serde(default)]
    pub configuration: Configuration,
}

/// Host environment handed to the plugin at `init`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    /// The node's data directory.
    #[serde(rename = "lightning-dir", default)]
    pub lightning_dir: String,
    /// Socket name of the node's RPC interface, relative to `lightning_dir`.
    #[serde(rename = "rpc-file", default)]
    pub rpc_file: String,
    /// e.g. `bitcoin`, `regtest`.
    #[serde(default)]
    pub network: String,
    /// True when the plugin is started together with the node rather than
    /// loaded later.
    #[serde(default)]
    pub startup: bool,
    /// Fields this engine does not interpret, kept verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Parameters of the `setconfig` request. `val` is absent for flags.
#[derive(Debug, Clone, Deserialize)]
pub struct SetConfigParams {
    /// Option name.
    pub config: String,
    #[serde(default)]
    pub val: Option<Value>,
}
