use std::time::Duration;

use serde_json::json;
use thiserror::Error;

use crate::jsonrpc::{self, codes};
use crate::message::ServiceState;

/// Everything a caller of a correlated call can see go wrong.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CallError {
    /// No reply within the deadline. The worker may still be working on it.
    #[error("no reply to `{method}` within {timeout:?}")]
    Timeout { method: String, timeout: Duration },

    /// The other side answered `result:false`; forwarded as received.
    #[error(transparent)]
    Remote(jsonrpc::Error),

    #[error("service `{0}` not found")]
    NotFound(String),

    #[error("service is {0}, not open")]
    NotReady(ServiceState),

    /// The channel closed before a reply arrived.
    #[error("worker `{0}` is gone")]
    WorkerGone(String),

    #[error("invalid params: {0}")]
    InvalidParams(String),

    #[error("method `{0}` not found")]
    MethodNotFound(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("transport error: {0}")]
    Transport(String),
}

impl CallError {
    pub fn code(&self) -> i64 {
        match self {
            CallError::Timeout { .. } => codes::TIMEOUT,
            CallError::Remote(err) => err.code,
            CallError::NotFound(_) => codes::NOT_FOUND,
            CallError::NotReady(_) => codes::NOT_READY,
            CallError::WorkerGone(_) => codes::WORKER_GONE,
            CallError::InvalidParams(_) => codes::INVALID_PARAMS,
            CallError::MethodNotFound(_) => codes::METHOD_NOT_FOUND,
            CallError::Codec(_) | CallError::Transport(_) => codes::INTERNAL_ERROR,
        }
    }

    /// Wire form of the error. A `Remote` error comes out exactly as it came in.
    pub fn into_rpc_error(self) -> jsonrpc::Error {
        let code = self.code();
        let message = self.to_string();
        match self {
            CallError::Remote(err) => err,
            CallError::NotReady(state) => {
                jsonrpc::Error::new(code, message).with_data(json!({ "state": state }))
            }
            CallError::NotFound(id) => jsonrpc::Error::new(code, message).with_data(json!({ "id": id })),
            _ => jsonrpc::Error::new(code, message),
        }
    }
}

impl From<jsonrpc::Error> for CallError {
    fn from(err: jsonrpc::Error) -> Self {
        CallError::Remote(err)
    }
}

/// Failures raised by a service handler while executing a command.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("service is {0}, not open")]
    NotReady(ServiceState),

    #[error("invalid params: {0}")]
    InvalidParams(String),

    #[error("{0}")]
    Failed(String),
}

impl ServiceError {
    pub fn failed(err: impl std::fmt::Display) -> Self {
        ServiceError::Failed(err.to_string())
    }

    pub fn into_rpc_error(self) -> jsonrpc::Error {
        match self {
            ServiceError::NotReady(state) => CallError::NotReady(state).into_rpc_error(),
            ServiceError::InvalidParams(msg) => CallError::InvalidParams(msg).into_rpc_error(),
            ServiceError::Failed(msg) => jsonrpc::Error::new(codes::REMOTE_FAILURE, msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_errors_pass_through_untouched() {
        let original = jsonrpc::Error::new(codes::REMOTE_FAILURE, "channel_not_found")
            .with_data(json!({"channel": "random"}));
        let forwarded = CallError::from(original.clone()).into_rpc_error();
        assert_eq!(forwarded, original);
    }

    #[test]
    fn not_ready_reports_the_state() {
        let err = ServiceError::NotReady(ServiceState::Opening).into_rpc_error();
        assert_eq!(err.code, codes::NOT_READY);
        assert_eq!(err.data, Some(json!({"state": "opening"})));
    }

    #[test]
    fn remote_code_is_visible_to_callers() {
        let err = CallError::Remote(jsonrpc::Error::new(codes::NOT_FOUND, "gone"));
        assert_eq!(err.code(), codes::NOT_FOUND);
    }
}
