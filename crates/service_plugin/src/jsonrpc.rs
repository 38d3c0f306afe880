use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON‑RPC 2.0 envelopes exchanged between the master and its workers,
/// one JSON document per line over the child's stdin/stdout.
///
/// A call carries an explicit `id`; replies are matched on it, so several
/// calls may be outstanding on the same channel at once.
///
/// ```ignore
/// use serde_json::json;
/// use service_plugin::jsonrpc::{Id, Request};
///
/// let req = Request::call(Id::Number(1), "query-info", Some(json!({"service_id": "svc1"})));
/// let line = serde_json::to_string(&req).unwrap();
/// ```
pub const JSONRPC_VERSION: &str = "2.0";

/// Error codes used on the wire.
pub mod codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
    /// A handler reported a failure (`result:false`).
    pub const REMOTE_FAILURE: i64 = -32000;
    pub const TIMEOUT: i64 = -32001;
    pub const WORKER_GONE: i64 = -32002;
    pub const NOT_READY: i64 = -32003;
    pub const NOT_FOUND: i64 = -32004;
}

/// `id` MAY be a string, number or null. We support all forms.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Id {
    Number(i64),
    String(String),
    Null,
}

impl Id {
    /// Key under which a pending call is tracked. Numbers and strings never
    /// collide (`1` vs `"1"`).
    pub fn key(&self) -> String {
        match self {
            Id::Number(n) => format!("n:{n}"),
            Id::String(s) => format!("s:{s}"),
            Id::Null => "null".to_owned(),
        }
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Id::Number(n) => write!(f, "{n}"),
            Id::String(s) => f.write_str(s),
            Id::Null => f.write_str("null"),
        }
    }
}

/// JSON‑RPC 2.0 Request object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// Omitted for *notifications*.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Id>,
}

fn default_version() -> String {
    JSONRPC_VERSION.to_owned()
}

/// JSON‑RPC 2.0 Error object. Travels unchanged across every hop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{message} (code {code})")]
pub struct Error {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Error {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), data: None }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// JSON‑RPC 2.0 Response object.
/// Exactly one of `result` or `error` **must** be present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Error>,
    pub id: Id,
}

/// Convenience enum so callers can `serde_json::from_str::<Message>()` without inspecting the type first.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Request(Request),
    Response(Response),
}

impl Request {
    /// Create a *notification* (no response expected).
    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            method: method.into(),
            params,
            id: None,
        }
    }

    /// Create a *call* expecting a response.
    pub fn call(id: Id, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            method: method.into(),
            params,
            id: Some(id),
        }
    }
}

impl Response {
    pub fn success(id: Id, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn fail(id: Id, code: i64, message: impl Into<String>, data: Option<Value>) -> Self {
        Self::from_error(id, Error { code, message: message.into(), data })
    }

    pub fn from_error(id: Id, error: Error) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            result: None,
            error: Some(error),
            id,
        }
    }

    /// `result:true` yields the body (a missing or `null` result is `Null`),
    /// `result:false` yields the error object as sent.
    pub fn into_result(self) -> Result<Value, Error> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_and_response_are_told_apart() {
        let req = r#"{"jsonrpc":"2.0","id":7,"method":"query-info","params":{"service_id":"a"}}"#;
        let rsp = r#"{"jsonrpc":"2.0","id":7,"result":{"id":"a","state":"open"}}"#;
        let notif = r#"{"jsonrpc":"2.0","method":"ready"}"#;

        assert!(matches!(serde_json::from_str::<Message>(req).unwrap(), Message::Request(r) if r.id == Some(Id::Number(7))));
        assert!(matches!(serde_json::from_str::<Message>(rsp).unwrap(), Message::Response(r) if r.id == Id::Number(7)));
        assert!(matches!(serde_json::from_str::<Message>(notif).unwrap(), Message::Request(r) if r.id.is_none()));
    }

    #[test]
    fn garbage_object_is_rejected() {
        assert!(serde_json::from_str::<Message>(r#"{"foo":1}"#).is_err());
    }

    #[test]
    fn null_result_is_success() {
        let rsp: Response = serde_json::from_str(r#"{"jsonrpc":"2.0","id":1,"result":null}"#).unwrap();
        assert_eq!(rsp.into_result().unwrap(), Value::Null);
    }

    #[test]
    fn error_survives_the_wire_unchanged() {
        let err = Error::new(codes::NOT_READY, "service is opening").with_data(json!({"state": "opening"}));
        let line = serde_json::to_string(&Response::from_error(Id::Number(3), err.clone())).unwrap();
        let back: Response = serde_json::from_str(&line).unwrap();
        assert_eq!(back.into_result().unwrap_err(), err);
    }

    #[test]
    fn id_keys_do_not_collide() {
        assert_ne!(Id::Number(1).key(), Id::String("1".into()).key());
    }
}
