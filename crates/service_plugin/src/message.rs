use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strum_macros::{AsRefStr, Display, EnumString};

use crate::error::CallError;

/// Methods a service worker understands, plus the `ready` notification it
/// sends once its command loop is attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, AsRefStr, Display, Serialize, Deserialize)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum Method {
    Open,
    QueryInfo,
    QueryUsers,
    SendMessage,
    StartListen,
    StopListen,
    GetCallbacks,
    PostCallback,
    Ready,
}

impl From<Method> for String {
    fn from(m: Method) -> Self {
        m.as_ref().to_owned()
    }
}

/// Lifecycle of one service runtime. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Display, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    #[default]
    Unopened,
    Opening,
    Open,
    Closed,
}

/// Options for `open`: the chat token plus the storage account callbacks
/// are written to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenOptions {
    pub host: String,
    pub token: String,
    /// App-level token; enables inbound events over Socket Mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_token: Option<String>,
    pub cell: String,
    pub username: String,
    pub password: String,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub id: String,
    pub state: ServiceState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendMessageParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(alias = "message")]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Value>,
}

/// Where a message was seen from the bot's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, AsRefStr, Display, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ListenScope {
    MessageReceived,
    Ambient,
    DirectMessage,
    DirectMention,
    Mention,
}

impl ListenScope {
    pub const ALL: [ListenScope; 5] = [
        ListenScope::MessageReceived,
        ListenScope::Ambient,
        ListenScope::DirectMessage,
        ListenScope::DirectMention,
        ListenScope::Mention,
    ];
}

/// `start-listen` payload. Storage fields left out fall back to the ones
/// the service was opened with.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ListenRequest {
    pub key: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mention: Vec<ListenScope>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cell: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenStarted {
    pub listen_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopListen {
    #[serde(alias = "hear_id")]
    pub listen_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserEntry {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub real_name: Option<String>,
    #[serde(default)]
    pub is_bot: bool,
    /// Direct message channel opened for this user, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
}

/// Users keyed by name.
pub type UserDirectory = BTreeMap<String, UserEntry>;

/// An interactive-message callback as delivered by the chat platform. Only
/// `callback_id` is interpreted; it names the service the event belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackEvent {
    pub callback_id: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackRecord {
    pub received_at: DateTime<Utc>,
    pub event: CallbackEvent,
}

/// `params` of every call to a service worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceParams {
    pub service_id: String,
    #[serde(default)]
    pub payload: Value,
}

/// Decoded form of a call to a service worker, one payload type per method.
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceCommand {
    Open(OpenOptions),
    QueryInfo,
    QueryUsers,
    SendMessage(SendMessageParams),
    StartListen(ListenRequest),
    StopListen(StopListen),
    GetCallbacks,
    PostCallback(CallbackEvent),
}

impl ServiceCommand {
    pub fn decode(method: Method, payload: Value) -> Result<Self, CallError> {
        fn typed<T: serde::de::DeserializeOwned>(payload: Value) -> Result<T, CallError> {
            serde_json::from_value(payload).map_err(|e| CallError::InvalidParams(e.to_string()))
        }

        Ok(match method {
            Method::Open => ServiceCommand::Open(typed(payload)?),
            Method::QueryInfo => ServiceCommand::QueryInfo,
            Method::QueryUsers => ServiceCommand::QueryUsers,
            Method::SendMessage => ServiceCommand::SendMessage(typed(payload)?),
            Method::StartListen => ServiceCommand::StartListen(typed(payload)?),
            Method::StopListen => ServiceCommand::StopListen(typed(payload)?),
            Method::GetCallbacks => ServiceCommand::GetCallbacks,
            Method::PostCallback => ServiceCommand::PostCallback(typed(payload)?),
            Method::Ready => return Err(CallError::MethodNotFound(method.to_string())),
        })
    }

    pub fn method(&self) -> Method {
        match self {
            ServiceCommand::Open(_) => Method::Open,
            ServiceCommand::QueryInfo => Method::QueryInfo,
            ServiceCommand::QueryUsers => Method::QueryUsers,
            ServiceCommand::SendMessage(_) => Method::SendMessage,
            ServiceCommand::StartListen(_) => Method::StartListen,
            ServiceCommand::StopListen(_) => Method::StopListen,
            ServiceCommand::GetCallbacks => Method::GetCallbacks,
            ServiceCommand::PostCallback(_) => Method::PostCallback,
        }
    }

    pub fn payload(&self) -> Result<Value, CallError> {
        let encoded = match self {
            ServiceCommand::Open(options) => serde_json::to_value(options),
            ServiceCommand::SendMessage(params) => serde_json::to_value(params),
            ServiceCommand::StartListen(request) => serde_json::to_value(request),
            ServiceCommand::StopListen(request) => serde_json::to_value(request),
            ServiceCommand::PostCallback(event) => serde_json::to_value(event),
            ServiceCommand::QueryInfo | ServiceCommand::QueryUsers | ServiceCommand::GetCallbacks => {
                Ok(Value::Null)
            }
        };
        encoded.map_err(|e| CallError::Codec(e.to_string()))
    }

    /// `query-info` runs in any state, `open` only before the first open,
    /// everything else only once the service is open.
    pub fn allowed_in(&self, state: ServiceState) -> bool {
        match self {
            ServiceCommand::QueryInfo => true,
            ServiceCommand::Open(_) => state == ServiceState::Unopened,
            _ => state == ServiceState::Open,
        }
    }
}
