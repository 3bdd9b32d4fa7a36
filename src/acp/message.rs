//! JSON-RPC 2.0 envelope used on the ACP stream.
//!
//! A single [`Message`] type carries requests, notifications, and responses.
//! The kind is never stored; it is derived from which fields are present:
//!
//! | `method` | `id`    | kind                          |
//! |----------|---------|-------------------------------|
//! | present  | present | [`MessageKind::Request`]      |
//! | present  | absent  | [`MessageKind::Notification`] |
//! | absent   | present | [`MessageKind::Response`]     |
//! | absent   | absent  | [`MessageKind::Invalid`]      |
//!
//! Absent fields are omitted from the wire form, never written as `null`.
//! Unknown fields on inbound lines are ignored.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{AppError, Result};

/// Protocol version string carried in every envelope.
pub const JSONRPC_VERSION: &str = "2.0";

/// Invalid JSON was received.
pub const PARSE_ERROR: i64 = -32_700;
/// The JSON sent is not a valid request object.
pub const INVALID_REQUEST: i64 = -32_600;
/// The method does not exist.
pub const METHOD_NOT_FOUND: i64 = -32_601;
/// Invalid method parameters.
pub const INVALID_PARAMS: i64 = -32_602;
/// Internal error while handling a request.
pub const INTERNAL_ERROR: i64 = -32_603;

/// Error object of a JSON-RPC error response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    /// Numeric error code.
    pub code: i64,
    /// Human-readable description.
    pub message: String,
    /// Optional structured detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    /// Build an error object without structured detail.
    #[must_use]
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

/// Classification of a [`Message`], derived from field presence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// `method` and `id` present.
    Request,
    /// `method` present, `id` absent.
    Notification,
    /// `id` present, `method` absent.
    Response,
    /// Neither `method` nor `id`; not a valid envelope.
    Invalid,
}

/// One JSON-RPC 2.0 envelope.
///
/// Constructed through [`Message::request`], [`Message::notification`],
/// [`Message::response`], [`Message::error_response`], or decoded from a wire
/// line with [`Message::from_line`]. Fields are read-only after construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default = "default_version")]
    jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<RpcError>,
}

fn default_version() -> String {
    JSONRPC_VERSION.to_owned()
}

impl Message {
    /// Build a request expecting a response correlated by `id`.
    #[must_use]
    pub fn request(id: u64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: default_version(),
            id: Some(id),
            method: Some(method.into()),
            params,
            result: None,
            error: None,
        }
    }

    /// Build a notification; no response is expected.
    #[must_use]
    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: default_version(),
            id: None,
            method: Some(method.into()),
            params,
            result: None,
            error: None,
        }
    }

    /// Build a success response for request `id`.
    ///
    /// The `result` member is mandatory on success, so it is always emitted.
    #[must_use]
    pub fn response(id: u64, result: Value) -> Self {
        Self {
            jsonrpc: default_version(),
            id: Some(id),
            method: None,
            params: None,
            result: Some(result),
            error: None,
        }
    }

    /// Build an error response for request `id`.
    #[must_use]
    pub fn error_response(id: u64, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: default_version(),
            id: Some(id),
            method: None,
            params: None,
            result: None,
            error: Some(RpcError::new(code, message)),
        }
    }

    /// Decode one wire line.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Acp("malformed json: …")` if the line is not a JSON
    /// object matching the envelope shape.
    pub fn from_line(line: &str) -> Result<Self> {
        serde_json::from_str(line).map_err(|e| AppError::Acp(format!("malformed json: {e}")))
    }

    /// Encode as a single compact JSON line, without the trailing newline.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Acp` if serialisation fails.
    pub fn to_line(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| AppError::Acp(format!("failed to serialise message: {e}")))
    }

    /// Classify by field presence.
    #[must_use]
    pub fn kind(&self) -> MessageKind {
        match (self.method.is_some(), self.id.is_some()) {
            (true, true) => MessageKind::Request,
            (true, false) => MessageKind::Notification,
            (false, true) => MessageKind::Response,
            (false, false) => MessageKind::Invalid,
        }
    }

    /// `true` for an agent- or host-initiated request.
    #[must_use]
    pub fn is_request(&self) -> bool {
        self.kind() == MessageKind::Request
    }

    /// `true` for a notification.
    #[must_use]
    pub fn is_notification(&self) -> bool {
        self.kind() == MessageKind::Notification
    }

    /// `true` for a response.
    #[must_use]
    pub fn is_response(&self) -> bool {
        self.kind() == MessageKind::Response
    }

    /// `true` for a response carrying an error object.
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.is_response() && self.error.is_some()
    }

    /// Correlation id.
    #[must_use]
    pub fn id(&self) -> Option<u64> {
        self.id
    }

    /// Method name.
    #[must_use]
    pub fn method(&self) -> Option<&str> {
        self.method.as_deref()
    }

    /// Request or notification parameters.
    #[must_use]
    pub fn params(&self) -> Option<&Value> {
        self.params.as_ref()
    }

    /// Success payload of a response.
    #[must_use]
    pub fn result(&self) -> Option<&Value> {
        self.result.as_ref()
    }

    /// Error object of a response.
    #[must_use]
    pub fn error(&self) -> Option<&RpcError> {
        self.error.as_ref()
    }

    /// Consume the message and return its parameters, or `Value::Null`.
    #[must_use]
    pub fn into_params(self) -> Value {
        self.params.unwrap_or(Value::Null)
    }

    /// Consume a response and turn it into its outcome.
    ///
    /// A response without a `result` member (or with an explicit `null`)
    /// yields `Value::Null`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Rpc` when the response carries an error object.
    pub fn into_result(self) -> Result<Value> {
        match self.error {
            Some(err) => Err(AppError::Rpc {
                code: err.code,
                message: err.message,
            }),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}
