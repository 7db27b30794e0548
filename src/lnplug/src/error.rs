use crate::handshake::InitError;
use crate::manifest::ManifestError;
use crate::transport::TransportError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use thiserror::Error;

/// A JSON-RPC error object.
///
/// Handlers return this (through `anyhow::Error`) to fail a call with an
/// explicit code and message; it reaches the host verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "code {} message {}", self.code, self.message)
    }
}

impl std::error::Error for RpcError {}

/// Errors that stop the engine. These never reach the host as a JSON-RPC
/// error object: the process exits instead.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid engine configuration: {0}")]
    Config(#[from] lnplug_core::ValidationError),
    #[error("manifest rejected: {0}")]
    Manifest(#[from] ManifestError),
    #[error("init failed: {0}")]
    Init(#[from] InitError),
    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),
}

/// Diagnostic payload for a failure that was not a deliberate `RpcError`.
#[derive(Debug, Clone, PartialEq)]
pub struct Cause {
    pub kind: &'static str,
    pub message: String,
    pub trace: Vec<String>,
}

impl Cause {
    pub fn from_error(kind: &'static str, err: &anyhow::Error) -> Self {
        Self {
            kind,
            message: err.to_string(),
            trace: err.chain().skip(1).map(ToString::to_string).collect(),
        }
    }

    pub fn from_panic(payload: &(dyn std::any::Any + Send)) -> Self {
        let message = if let Some(msg) = payload.downcast_ref::<&str>() {
            (*msg).to_string()
        } else if let Some(msg) = payload.downcast_ref::<String>() {
            msg.clone()
        } else {
            "panic with a non-string payload".to_string()
        };
        Self {
            kind: "panic",
            message,
            trace: Vec::new(),
        }
    }

    pub fn to_data(&self) -> Value {
        json!({
            "cause": self.message,
            "type": self.kind,
            "trace": self.trace,
        })
    }
}

impl fmt::Display for Cause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{cause: {}, type: {}", self.message, self.kind)?;
        if !self.trace.is_empty() {
            write!(f, ", trace: [{}]", self.trace.join("; "))?;
        }
        write!(f, "}}")
    }
}
