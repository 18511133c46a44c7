//! Client-facing wire format.
//!
//! Inbound frames carry one envelope or a JSON array of envelopes:
//!
//! ```json
//! {"id": 1, "jsonrpc": "2.0", "method": "mutation",
//!  "params": {"path": "DO_COUNTER.inc", "input": {"_namespace": "team1", "amount": 2}}}
//! ```
//!
//! Outbound envelopes carry either a `result` or an `error`:
//!
//! ```json
//! {"id": 1, "result": {"type": "data", "data": 3}}
//! {"id": null, "error": {"code": -32700, "message": "...", "data": {"code": "PARSE_ERROR", "httpStatus": 400}}}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::fmt;

use crate::error::{EnvelopeError, ErrorCode};

pub const JSONRPC_VERSION: &str = "2.0";

/// Client-chosen request id, echoed on every reply for that request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::String(s) => f.write_str(s),
        }
    }
}

impl From<i64> for RequestId {
    fn from(id: i64) -> Self {
        RequestId::Number(id)
    }
}

impl From<&str> for RequestId {
    fn from(id: &str) -> Self {
        RequestId::String(id.to_owned())
    }
}

/// The three procedure kinds a path can be invoked as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcedureKind {
    Query,
    Mutation,
    Subscription,
}

impl ProcedureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcedureKind::Query => "query",
            ProcedureKind::Mutation => "mutation",
            ProcedureKind::Subscription => "subscription",
        }
    }
}

impl fmt::Display for ProcedureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What an inbound envelope asks for.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Call {
        kind: ProcedureKind,
        path: String,
        input: Value,
    },
    /// `subscription.stop` for the envelope's id.
    Stop,
}

/// A decoded inbound envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestEnvelope {
    pub id: Option<RequestId>,
    pub jsonrpc: Option<String>,
    pub request: Request,
}

impl RequestEnvelope {
    pub fn call(
        id: impl Into<RequestId>,
        kind: ProcedureKind,
        path: impl Into<String>,
        input: Value,
    ) -> Self {
        Self {
            id: Some(id.into()),
            jsonrpc: Some(JSONRPC_VERSION.to_owned()),
            request: Request::Call {
                kind,
                path: path.into(),
                input,
            },
        }
    }

    pub fn stop(id: impl Into<RequestId>) -> Self {
        Self {
            id: Some(id.into()),
            jsonrpc: Some(JSONRPC_VERSION.to_owned()),
            request: Request::Stop,
        }
    }

    /// The JSON form a client puts on the wire.
    pub fn to_wire(&self) -> Value {
        let mut wire = json!({ "id": self.id });
        if let Some(jsonrpc) = &self.jsonrpc {
            wire["jsonrpc"] = json!(jsonrpc);
        }
        match &self.request {
            Request::Call { kind, path, input } => {
                wire["method"] = json!(kind.as_str());
                wire["params"] = json!({ "path": path, "input": input });
            }
            Request::Stop => {
                wire["method"] = json!("subscription.stop");
            }
        }
        wire
    }
}

#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(default)]
    id: Option<RequestId>,
    #[serde(default)]
    jsonrpc: Option<String>,
    method: String,
    #[serde(default)]
    params: Option<RawParams>,
}

#[derive(Deserialize)]
struct RawParams {
    path: String,
    #[serde(default)]
    input: Value,
}

/// Decode one inbound frame into its envelopes, preserving batch order.
///
/// Any malformed element fails the whole frame.
pub fn decode_frame(frame: &[u8]) -> Result<Vec<RequestEnvelope>, EnvelopeError> {
    let value: Value = serde_json::from_slice(frame)?;
    match value {
        Value::Array(items) => items.into_iter().map(decode_envelope).collect(),
        single => Ok(vec![decode_envelope(single)?]),
    }
}

fn decode_envelope(value: Value) -> Result<RequestEnvelope, EnvelopeError> {
    if !value.is_object() {
        return Err(EnvelopeError::Invalid("envelope must be an object".into()));
    }

    let raw: RawEnvelope =
        serde_json::from_value(value).map_err(|e| EnvelopeError::Invalid(e.to_string()))?;

    if let Some(version) = &raw.jsonrpc {
        if version != JSONRPC_VERSION {
            return Err(EnvelopeError::Invalid(format!(
                "unsupported jsonrpc version '{version}'"
            )));
        }
    }

    let kind = match raw.method.as_str() {
        "subscription.stop" => {
            return Ok(RequestEnvelope {
                id: raw.id,
                jsonrpc: raw.jsonrpc,
                request: Request::Stop,
            });
        }
        "query" => ProcedureKind::Query,
        "mutation" => ProcedureKind::Mutation,
        "subscription" => ProcedureKind::Subscription,
        other => {
            return Err(EnvelopeError::Invalid(format!("unknown method '{other}'")));
        }
    };

    let params = raw
        .params
        .ok_or_else(|| EnvelopeError::Invalid(format!("'{}' requires params", raw.method)))?;

    Ok(RequestEnvelope {
        id: raw.id,
        jsonrpc: raw.jsonrpc,
        request: Request::Call {
            kind,
            path: params.path,
            input: params.input,
        },
    })
}

/// Payload of a successful outbound envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ResultPayload {
    Data {
        #[serde(default)]
        data: Value,
    },
    Started,
    Stopped,
}

/// Extra error detail carried alongside the numeric code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorData {
    pub code: ErrorCode,
    #[serde(rename = "httpStatus")]
    pub http_status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// The error shape sent to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorShape {
    pub code: i32,
    pub message: String,
    pub data: ErrorData,
}

impl ErrorShape {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code.to_code(),
            message: message.into(),
            data: ErrorData {
                code,
                http_status: code.http_status(),
                path: None,
            },
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.data.path = Some(path.into());
        self
    }

    pub fn error_code(&self) -> ErrorCode {
        self.data.code
    }
}

/// An outbound envelope. Exactly one of `result` and `error` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub id: Option<RequestId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jsonrpc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ResultPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorShape>,
}

impl ResponseEnvelope {
    fn with_result(id: Option<RequestId>, jsonrpc: Option<String>, result: ResultPayload) -> Self {
        Self {
            id,
            jsonrpc,
            result: Some(result),
            error: None,
        }
    }

    pub fn data(id: Option<RequestId>, jsonrpc: Option<String>, data: Value) -> Self {
        Self::with_result(id, jsonrpc, ResultPayload::Data { data })
    }

    pub fn started(id: Option<RequestId>, jsonrpc: Option<String>) -> Self {
        Self::with_result(id, jsonrpc, ResultPayload::Started)
    }

    pub fn stopped(id: Option<RequestId>, jsonrpc: Option<String>) -> Self {
        Self::with_result(id, jsonrpc, ResultPayload::Stopped)
    }

    pub fn error(id: Option<RequestId>, jsonrpc: Option<String>, error: ErrorShape) -> Self {
        Self {
            id,
            jsonrpc,
            result: None,
            error: Some(error),
        }
    }

    /// The data carried by a `{type: "data"}` result, if that is what this is.
    pub fn data_value(&self) -> Option<&Value> {
        match &self.result {
            Some(ResultPayload::Data { data }) => Some(data),
            _ => None,
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
