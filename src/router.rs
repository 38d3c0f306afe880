// src/router.rs

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use service_plugin::error::CallError;
use service_plugin::jsonrpc::{self, Request, Response};
use service_plugin::message::*;
use service_plugin::peer::Peer;
use strum_macros::{AsRefStr, Display, EnumString};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, warn};

use crate::logger::Telemetry;
use crate::registry::{Created, WorkerRegistry};

pub const CALLBACK_ACCEPTED: &str = "Processing now...";

/// The caller-facing actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, AsRefStr, Display, Serialize, Deserialize)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum ApiActionKind {
    CreateService,
    GetService,
    DeleteService,
    GetUsers,
    SendMessage,
    StartListen,
    StopListen,
    GetCallbacks,
    PostCallback,
}

impl From<ApiActionKind> for String {
    fn from(kind: ApiActionKind) -> Self {
        kind.as_ref().to_string()
    }
}

/// Untyped `{id?, payload?}` as it travels between the web worker and the
/// master.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
}

impl ActionParams {
    pub fn new(id: Option<String>, payload: Value) -> Self {
        Self { id, payload }
    }
}

/// `send-message` as callers send it. `attachments` may be a JSON string.
#[derive(Debug, Clone, Deserialize)]
struct SayPayload {
    #[serde(default)]
    channel: Option<String>,
    #[serde(alias = "message")]
    text: String,
    #[serde(default)]
    attachments: Option<Value>,
}

/// Scopes as a list or a comma-separated string.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum MentionList {
    Csv(String),
    List(Vec<String>),
}

impl MentionList {
    fn scopes(self) -> Result<Vec<ListenScope>, CallError> {
        let names = match self {
            MentionList::Csv(csv) => csv.split(',').map(|s| s.trim().to_string()).collect(),
            MentionList::List(list) => list,
        };
        names
            .into_iter()
            .filter(|name| !name.is_empty())
            .map(|name| {
                name.parse::<ListenScope>()
                    .map_err(|_| CallError::InvalidParams(format!("unknown mention scope `{name}`")))
            })
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
struct HearPayload {
    key: String,
    #[serde(default)]
    mention: Option<MentionList>,
    #[serde(default)]
    cell: Option<String>,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

/// One decoded action, carrying the concrete payload it needs.
#[derive(Debug, Clone, PartialEq)]
pub enum ApiAction {
    CreateService { id: String, options: OpenOptions },
    GetService { id: Option<String> },
    DeleteService { id: String },
    GetUsers { id: String },
    SendMessage { id: String, params: SendMessageParams },
    StartListen { id: String, request: ListenRequest },
    StopListen { id: String, request: StopListen },
    GetCallbacks { id: String },
    /// The service is the event's `callback_id`.
    PostCallback { event: CallbackEvent },
}

fn typed<T: serde::de::DeserializeOwned>(payload: Value) -> Result<T, CallError> {
    serde_json::from_value(payload).map_err(|e| CallError::InvalidParams(e.to_string()))
}

fn required(kind: ApiActionKind, id: Option<String>) -> Result<String, CallError> {
    id.filter(|id| !id.is_empty())
        .ok_or_else(|| CallError::InvalidParams(format!("`{kind}` needs a service id")))
}

impl ApiAction {
    /// Validate the caller's payload for `kind`. Nothing is contacted yet.
    pub fn decode(kind: ApiActionKind, params: ActionParams) -> Result<Self, CallError> {
        let ActionParams { id, payload } = params;
        Ok(match kind {
            ApiActionKind::CreateService => ApiAction::CreateService {
                id: required(kind, id)?,
                options: typed(payload)?,
            },
            ApiActionKind::GetService => ApiAction::GetService {
                id: id.filter(|id| !id.is_empty()),
            },
            ApiActionKind::DeleteService => ApiAction::DeleteService { id: required(kind, id)? },
            ApiActionKind::GetUsers => ApiAction::GetUsers { id: required(kind, id)? },
            ApiActionKind::SendMessage => {
                let id = required(kind, id)?;
                let say: SayPayload = typed(payload)?;
                let attachments = match say.attachments {
                    Some(Value::String(raw)) if raw.trim().is_empty() => None,
                    Some(Value::String(raw)) => Some(
                        serde_json::from_str(&raw)
                            .map_err(|e| CallError::InvalidParams(format!("attachments are not JSON: {e}")))?,
                    ),
                    Some(Value::Null) | None => None,
                    Some(other) => Some(other),
                };
                ApiAction::SendMessage {
                    id,
                    params: SendMessageParams { channel: say.channel, text: say.text, attachments },
                }
            }
            ApiActionKind::StartListen => {
                let id = required(kind, id)?;
                let hear: HearPayload = typed(payload)?;
                let mention = match hear.mention {
                    Some(list) => list.scopes()?,
                    None => Vec::new(),
                };
                ApiAction::StartListen {
                    id,
                    request: ListenRequest {
                        key: hear.key,
                        mention,
                        cell: hear.cell,
                        path: hear.path,
                        username: hear.username,
                        password: hear.password,
                    },
                }
            }
            ApiActionKind::StopListen => ApiAction::StopListen {
                id: required(kind, id)?,
                request: typed(payload)?,
            },
            ApiActionKind::GetCallbacks => ApiAction::GetCallbacks { id: required(kind, id)? },
            ApiActionKind::PostCallback => ApiAction::PostCallback { event: typed(payload)? },
        })
    }

    pub fn kind(&self) -> ApiActionKind {
        match self {
            ApiAction::CreateService { .. } => ApiActionKind::CreateService,
            ApiAction::GetService { .. } => ApiActionKind::GetService,
            ApiAction::DeleteService { .. } => ApiActionKind::DeleteService,
            ApiAction::GetUsers { .. } => ApiActionKind::GetUsers,
            ApiAction::SendMessage { .. } => ApiActionKind::SendMessage,
            ApiAction::StartListen { .. } => ApiActionKind::StartListen,
            ApiAction::StopListen { .. } => ApiActionKind::StopListen,
            ApiAction::GetCallbacks { .. } => ApiActionKind::GetCallbacks,
            ApiAction::PostCallback { .. } => ApiActionKind::PostCallback,
        }
    }

    pub fn service_id(&self) -> Option<&str> {
        match self {
            ApiAction::GetService { id } => id.as_deref(),
            ApiAction::CreateService { id, .. }
            | ApiAction::DeleteService { id }
            | ApiAction::GetUsers { id }
            | ApiAction::SendMessage { id, .. }
            | ApiAction::StartListen { id, .. }
            | ApiAction::StopListen { id, .. }
            | ApiAction::GetCallbacks { id } => Some(id),
            ApiAction::PostCallback { event } => Some(&event.callback_id),
        }
    }

    /// Back to wire params. `decode(kind, encode())` gives the same action.
    pub fn encode(&self) -> Result<ActionParams, CallError> {
        fn value<T: Serialize>(v: &T) -> Result<Value, CallError> {
            serde_json::to_value(v).map_err(|e| CallError::Codec(e.to_string()))
        }
        let id = match self {
            ApiAction::PostCallback { .. } => None,
            other => other.service_id().map(str::to_owned),
        };
        let payload = match self {
            ApiAction::CreateService { options, .. } => value(options)?,
            ApiAction::SendMessage { params, .. } => value(params)?,
            ApiAction::StartListen { request, .. } => value(request)?,
            ApiAction::StopListen { request, .. } => value(request)?,
            ApiAction::PostCallback { event } => value(event)?,
            ApiAction::GetService { .. }
            | ApiAction::DeleteService { .. }
            | ApiAction::GetUsers { .. }
            | ApiAction::GetCallbacks { .. } => Value::Null,
        };
        Ok(ActionParams { id, payload })
    }
}

fn body<T: Serialize>(value: T) -> Result<Value, CallError> {
    serde_json::to_value(value).map_err(|e| CallError::Codec(e.to_string()))
}

/// Turns actions into registry operations and service calls.
pub struct ActionRouter {
    registry: Arc<WorkerRegistry>,
    telemetry: Arc<Telemetry>,
}

impl ActionRouter {
    pub fn new(registry: Arc<WorkerRegistry>, telemetry: Arc<Telemetry>) -> Self {
        Self { registry, telemetry }
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    pub async fn route(&self, kind: ApiActionKind, params: ActionParams) -> Result<Value, CallError> {
        let action = ApiAction::decode(kind, params)?;
        self.execute(action).await
    }

    pub async fn execute(&self, action: ApiAction) -> Result<Value, CallError> {
        let kind = action.kind();
        self.telemetry
            .instrument_request(kind.as_ref(), || self.dispatch(action))
            .await
    }

    async fn dispatch(&self, action: ApiAction) -> Result<Value, CallError> {
        match action {
            ApiAction::CreateService { id, options } => {
                if self.registry.create_service(&id, options)? == Created::AlreadyExists {
                    debug!(service_id = %id, "create ignored; service exists");
                }
                body(id)
            }
            ApiAction::GetService { id: Some(id) } => body(self.registry.get_service(&id).await?),
            ApiAction::GetService { id: None } => body(self.registry.get_all_services().await?),
            ApiAction::DeleteService { id } => {
                self.registry.delete_service(&id).await?;
                body(id)
            }
            ApiAction::GetUsers { id } => body(self.registry.client(&id)?.query_users().await?),
            ApiAction::SendMessage { id, params } => {
                self.registry.client(&id)?.send_message(params).await?;
                Ok(Value::Null)
            }
            ApiAction::StartListen { id, request } => {
                let started = self.registry.client(&id)?.start_listen(request).await?;
                body(started.listen_id)
            }
            ApiAction::StopListen { id, request } => {
                let stopped = self.registry.client(&id)?.stop_listen(request).await?;
                body(stopped.listen_id)
            }
            ApiAction::GetCallbacks { id } => body(self.registry.client(&id)?.callbacks().await?),
            ApiAction::PostCallback { event } => {
                self.registry.client(&event.callback_id)?.post_callback(event).await?;
                body(CALLBACK_ACCEPTED)
            }
        }
    }

    /// Answer one request from the web worker. Failures, including ones a
    /// service worker reported, go back unchanged.
    pub async fn handle(&self, req: Request) -> Option<Response> {
        let id = req.id.clone()?;
        let result = match req.method.parse::<ApiActionKind>() {
            Ok(kind) => match serde_json::from_value::<ActionParams>(req.params.unwrap_or(Value::Null)) {
                Ok(params) => self.route(kind, params).await,
                Err(e) => Err(CallError::InvalidParams(e.to_string())),
            },
            Err(_) => Err(CallError::MethodNotFound(req.method.clone())),
        };
        Some(match result {
            Ok(value) => Response::success(id, value),
            Err(err) => Response::from_error(id, err.into_rpc_error()),
        })
    }

    /// Serve the web worker's requests until its channel closes. Each
    /// request runs on its own task.
    pub async fn serve_peer(self: Arc<Self>, peer: Peer, mut inbound: UnboundedReceiver<Request>) {
        info!(peer = peer.label(), "serving actions");
        while let Some(req) = inbound.recv().await {
            let router = Arc::clone(&self);
            let peer = peer.clone();
            tokio::spawn(async move {
                let method = req.method.clone();
                if let Some(rsp) = router.handle(req).await {
                    if let Err(e) = peer.respond(rsp) {
                        warn!(%method, error = %e, "could not reply to the web worker");
                    }
                }
            });
        }
        info!(peer = peer.label(), "action channel closed");
    }
}

/// Caller-facing `{result, body?, error?}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiReply {
    pub result: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<jsonrpc::Error>,
}

impl ApiReply {
    pub fn from_result(result: Result<Value, CallError>) -> Self {
        match result {
            Ok(Value::Null) => Self { result: true, body: None, error: None },
            Ok(body) => Self { result: true, body: Some(body), error: None },
            Err(err) => Self { result: false, body: None, error: Some(err.into_rpc_error()) },
        }
    }
}
