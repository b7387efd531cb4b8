//! Unified failure carrier.
//!
//! One error type flows through the whole engine: transport faults, protocol
//! faults, and handler faults all reject promises and translate to JSON-RPC
//! error objects through the same taxonomy. The translation table lives in
//! [`Error::to_error_object`]; the top-level request validation codes
//! (-32700/-32600) are applied by the dispatcher where the faulting layer is
//! known.

use serde_json::{json, Value};
use std::io;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Failure carrier for promise rejection and dispatch translation.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A handler rejected the request parameters.
    #[error("invalid params")]
    InvalidParams,

    /// An error object received from the remote peer, echoed verbatim when
    /// proxied onward.
    #[error("{message}")]
    Remote {
        /// The remote error code.
        code: i64,
        /// The remote error message.
        message: String,
        /// The complete error object as received.
        full: Value,
    },

    /// JSON (de)serialisation failed.
    #[error("{0}")]
    Json(#[from] serde_json::Error),

    /// No handler matched the requested method.
    #[error("method not found")]
    MethodNotFound,

    /// The WebSocket opening handshake failed.
    #[error("handshake failed")]
    HandshakeFailed,

    /// The peer closed the connection or the transport died.
    #[error("connection closed")]
    ConnectionClosed,

    /// Socket-level failure.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// Anything else a handler may report.
    #[error("{0}")]
    Internal(String),
}

impl Error {
    /// Wraps an error object received from the peer.
    ///
    /// Missing `code`/`message` members degrade to `-32000` and an empty
    /// message rather than failing: the object is still echoed in full when
    /// proxied.
    #[must_use]
    pub fn remote(full: Value) -> Self {
        let code = full.get("code").and_then(Value::as_i64).unwrap_or(-32000);
        let message = full
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();
        Self::Remote {
            code,
            message,
            full,
        }
    }

    /// Builds an application-level error from a plain message.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// The JSON-RPC error code this failure translates to.
    #[must_use]
    pub fn code(&self) -> i64 {
        match self {
            Self::InvalidParams => -32602,
            Self::Remote { code, .. } => *code,
            Self::MethodNotFound => -32601,
            _ => -32000,
        }
    }

    /// Translates this failure into a JSON-RPC error object.
    ///
    /// Remote errors are echoed verbatim; JSON faults carry the parser
    /// position under `data`; everything else maps through [`Error::code`]
    /// with the display message.
    #[must_use]
    pub fn to_error_object(&self) -> Value {
        match self {
            Self::Remote { full, .. } => full.clone(),
            Self::Json(e) => json!({
                "code": -32000,
                "message": e.to_string(),
                "data": { "position": e.column() },
            }),
            other => json!({ "code": other.code(), "message": other.to_string() }),
        }
    }
}
