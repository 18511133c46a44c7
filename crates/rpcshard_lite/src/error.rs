use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::executor::InstanceKey;

/// Error taxonomy shared by every layer of the gateway.
///
/// Each variant maps onto a JSON-RPC numeric code for the wire and an HTTP
/// status for the error shape's `data` block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// The inbound frame could not be decoded.
    ParseError,
    /// Malformed envelope, missing addressing, duplicate subscription id or unknown path.
    BadRequest,
    /// Unexpected failure inside an executor instance.
    InternalError,
    /// No local subscribers, or no route to the requested instance kind.
    NotFound,
}

impl ErrorCode {
    pub const CODE_PARSE_ERROR: i32 = -32700;
    pub const CODE_BAD_REQUEST: i32 = -32600;
    pub const CODE_INTERNAL_ERROR: i32 = -32603;
    pub const CODE_NOT_FOUND: i32 = -32004;

    pub fn to_code(self) -> i32 {
        match self {
            ErrorCode::ParseError => Self::CODE_PARSE_ERROR,
            ErrorCode::BadRequest => Self::CODE_BAD_REQUEST,
            ErrorCode::InternalError => Self::CODE_INTERNAL_ERROR,
            ErrorCode::NotFound => Self::CODE_NOT_FOUND,
        }
    }

    /// Unknown codes collapse to `InternalError`.
    pub fn from_code(code: i32) -> Self {
        match code {
            Self::CODE_PARSE_ERROR => ErrorCode::ParseError,
            Self::CODE_BAD_REQUEST => ErrorCode::BadRequest,
            Self::CODE_NOT_FOUND => ErrorCode::NotFound,
            _ => ErrorCode::InternalError,
        }
    }

    pub fn http_status(self) -> u16 {
        match self {
            ErrorCode::ParseError | ErrorCode::BadRequest => 400,
            ErrorCode::InternalError => 500,
            ErrorCode::NotFound => 404,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::ParseError => "PARSE_ERROR",
            ErrorCode::BadRequest => "BAD_REQUEST",
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::NotFound => "NOT_FOUND",
        }
    }
}

/// Errors that can occur while parsing a dotted procedure path.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PathError {
    #[error("invalid procedure path: {0}")]
    Invalid(String),
}

/// Errors that can occur while decoding an inbound frame.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EnvelopeError {
    /// The frame is not valid JSON.
    #[error("frame is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// The frame is JSON but not a well-formed envelope.
    #[error("invalid envelope: {0}")]
    Invalid(String),
}

/// Errors that can occur while writing to a connection.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum OutboundError {
    #[error("failed to encode response: {0}")]
    Encode(#[from] serde_json::Error),

    /// The connection's writer has gone away.
    #[error("connection closed")]
    Closed,

    /// The connection's outbound queue is full.
    #[error("outbound queue full")]
    Full,
}

/// Errors raised by an instance's storage backend.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StorageError {
    #[error("failed to (de)serialize stored value: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A set operation hit a key that holds a non-set value.
    #[error("key '{0}' does not hold a set")]
    NotASet(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Error produced by a procedure or by the adapter around it.
///
/// Procedures choose the code; anything they do not classify surfaces as
/// `INTERNAL_ERROR`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct ProcedureError {
    pub code: ErrorCode,
    pub message: String,
}

impl ProcedureError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BadRequest, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }
}

impl From<StorageError> for ProcedureError {
    fn from(err: StorageError) -> Self {
        ProcedureError::internal(err.to_string())
    }
}

impl From<serde_json::Error> for ProcedureError {
    fn from(err: serde_json::Error) -> Self {
        ProcedureError::internal(format!("serialization failed: {err}"))
    }
}

/// Errors that can occur while resolving or talking to an executor instance.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum InstanceError {
    /// No executor kind is registered under this name.
    #[error("no executor registered for kind '{0}'")]
    UnknownKind(String),

    /// The instance's mailbox is gone.
    #[error("instance {0} is no longer running")]
    Closed(InstanceKey),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl InstanceError {
    pub fn code(&self) -> ErrorCode {
        match self {
            InstanceError::UnknownKind(_) => ErrorCode::NotFound,
            InstanceError::Closed(_) | InstanceError::Storage(_) => ErrorCode::InternalError,
        }
    }
}

/// Errors that can occur while routing a call to an executor instance.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RouteError {
    #[error(transparent)]
    Path(#[from] PathError),

    /// The path's namespace does not name a registered executor kind.
    #[error("no executor namespace '{0}'")]
    UnknownNamespace(String),

    /// The input does not carry the namespace's addressing field.
    #[error("input for '{namespace}' is missing the addressing field '{field}'")]
    MissingAddressing { namespace: String, field: String },

    #[error(transparent)]
    Instance(#[from] InstanceError),

    /// The instance executed the call and reported a failure.
    #[error("{message}")]
    Remote { code: ErrorCode, message: String },

    /// The instance replied with a subscription handshake we could not read.
    #[error("malformed subscription handshake: {0}")]
    Handshake(#[source] serde_json::Error),
}

impl RouteError {
    pub fn code(&self) -> ErrorCode {
        match self {
            RouteError::Path(_)
            | RouteError::UnknownNamespace(_)
            | RouteError::MissingAddressing { .. } => ErrorCode::BadRequest,
            RouteError::Instance(e) => e.code(),
            RouteError::Remote { code, .. } => *code,
            RouteError::Handshake(_) => ErrorCode::InternalError,
        }
    }
}

/// Errors that can occur while assigning a connection to a shard.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum GroupError {
    /// The shard factory refused to create another shard.
    #[error("failed to create shard: {0}")]
    ShardCreate(String),
}

/// Errors that can occur while running the gateway listener.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum GatewayError {
    #[error("listener error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_round_trip() {
        for code in [
            ErrorCode::ParseError,
            ErrorCode::BadRequest,
            ErrorCode::InternalError,
            ErrorCode::NotFound,
        ] {
            assert_eq!(ErrorCode::from_code(code.to_code()), code);
        }
    }

    #[test]
    fn test_unknown_code_is_internal() {
        assert_eq!(ErrorCode::from_code(42), ErrorCode::InternalError);
    }

    #[test]
    fn test_serde_name_matches_as_str() {
        let json = serde_json::to_value(ErrorCode::BadRequest).unwrap();
        assert_eq!(json, serde_json::json!(ErrorCode::BadRequest.as_str()));
    }

    #[test]
    fn test_route_error_codes() {
        let missing = RouteError::MissingAddressing {
            namespace: "DO_COUNTER".into(),
            field: "_namespace".into(),
        };
        assert_eq!(missing.code(), ErrorCode::BadRequest);

        let unknown = RouteError::Instance(InstanceError::UnknownKind("DO_X".into()));
        assert_eq!(unknown.code(), ErrorCode::NotFound);

        let remote = RouteError::Remote {
            code: ErrorCode::InternalError,
            message: "boom".into(),
        };
        assert_eq!(remote.code(), ErrorCode::InternalError);
    }
}
