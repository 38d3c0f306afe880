//! Slack Web API + Socket Mode implementation of the chat connector.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use service_plugin::message::ListenScope;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast;
use tokio::task::AbortHandle;
use tokio_tungstenite::{WebSocketStream, connect_async, tungstenite::Message as WsMsg};
use tracing::{debug, info, warn};

use crate::connector::*;

pub const SLACK_API: &str = "https://slack.com/api";

#[derive(Clone)]
pub struct SlackConnector {
    http: reqwest::Client,
    api_base: String,
    reconnect_backoff: Duration,
}

impl SlackConnector {
    pub fn new(api_base: impl Into<String>, reconnect_backoff: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_base: api_base.into(),
            reconnect_backoff,
        }
    }
}

#[async_trait]
impl ChatConnector for SlackConnector {
    async fn connect(&self, token: &str, app_token: Option<&str>) -> Result<Arc<dyn ChatConnection>, ConnectorError> {
        let api = SlackApi {
            http: self.http.clone(),
            base: self.api_base.clone(),
            token: token.to_owned(),
        };
        let auth: AuthTest = api.call("auth.test", &[]).await.map_err(|e| match e {
            ConnectorError::Api(code) => ConnectorError::Auth(code),
            other => other,
        })?;
        info!(bot_user_id = %auth.user_id, "connected to slack");

        let (events, _) = broadcast::channel(256);
        let socket = match app_token {
            Some(app_token) => {
                let app = SlackApi { token: app_token.to_owned(), ..api.clone() };
                let task = socket_mode(app, auth.user_id.clone(), events.clone(), self.reconnect_backoff);
                Some(tokio::spawn(task).abort_handle())
            }
            None => {
                warn!("no app-level token configured; inbound messages are disabled");
                None
            }
        };

        Ok(Arc::new(SlackConnection { api, events, socket }))
    }
}

#[derive(Clone)]
struct SlackApi {
    http: reqwest::Client,
    base: String,
    token: String,
}

impl SlackApi {
    async fn call<T: DeserializeOwned>(&self, method: &str, form: &[(&str, String)]) -> Result<T, ConnectorError> {
        let body: Value = self
            .http
            .post(format!("{}/{}", self.base, method))
            .bearer_auth(&self.token)
            .form(form)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        if body.get("ok").and_then(Value::as_bool) != Some(true) {
            let code = body.get("error").and_then(Value::as_str).unwrap_or("unknown_error");
            return Err(ConnectorError::Api(code.to_owned()));
        }
        Ok(serde_json::from_value(body)?)
    }

    /// Follows `response_metadata.next_cursor` until exhausted.
    async fn paged<T, P>(&self, method: &str, base_form: &[(&str, String)], mut take: impl FnMut(P) -> Vec<T>) -> Result<Vec<T>, ConnectorError>
    where
        P: DeserializeOwned + Paged,
    {
        let mut out = Vec::new();
        let mut cursor = String::new();
        loop {
            let mut form = base_form.to_vec();
            form.push(("limit", "200".to_owned()));
            if !cursor.is_empty() {
                form.push(("cursor", cursor.clone()));
            }
            let page: P = self.call(method, &form).await?;
            cursor = page.next_cursor();
            out.extend(take(page));
            if cursor.is_empty() {
                return Ok(out);
            }
        }
    }
}

trait Paged {
    fn next_cursor(&self) -> String;
}

#[derive(Deserialize)]
struct AuthTest {
    user_id: String,
}

#[derive(Deserialize, Default)]
struct ResponseMetadata {
    #[serde(default)]
    next_cursor: String,
}

#[derive(Deserialize)]
struct ConversationsList {
    channels: Vec<RawChannel>,
    #[serde(default)]
    response_metadata: ResponseMetadata,
}

#[derive(Deserialize)]
struct RawChannel {
    id: String,
    #[serde(default)]
    name: String,
}

#[derive(Deserialize)]
struct UsersList {
    members: Vec<RawMember>,
    #[serde(default)]
    response_metadata: ResponseMetadata,
}

#[derive(Deserialize)]
struct RawMember {
    id: String,
    name: String,
    #[serde(default)]
    real_name: Option<String>,
    #[serde(default)]
    is_bot: bool,
    #[serde(default)]
    is_app_user: bool,
    #[serde(default)]
    deleted: bool,
}

impl Paged for ConversationsList {
    fn next_cursor(&self) -> String {
        self.response_metadata.next_cursor.clone()
    }
}

impl Paged for UsersList {
    fn next_cursor(&self) -> String {
        self.response_metadata.next_cursor.clone()
    }
}

#[derive(Deserialize)]
struct ConversationsOpen {
    channel: RawChannel,
}

#[derive(Deserialize)]
struct ConnectionsOpen {
    url: String,
}

struct SlackConnection {
    api: SlackApi,
    events: broadcast::Sender<InboundMessage>,
    socket: Option<AbortHandle>,
}

#[async_trait]
impl ChatConnection for SlackConnection {
    async fn list_directory(&self) -> Result<DirectoryListing, ConnectorError> {
        let types = [("types", "public_channel,private_channel".to_owned()), ("exclude_archived", "true".to_owned())];
        let channels = self
            .api
            .paged("conversations.list", &types, |page: ConversationsList| {
                page.channels
                    .into_iter()
                    .map(|c| ChannelEntry { id: c.id, name: c.name })
                    .collect()
            })
            .await?;
        let members = self
            .api
            .paged("users.list", &[], |page: UsersList| {
                page.members
                    .into_iter()
                    .map(|m| MemberEntry {
                        id: m.id,
                        name: m.name,
                        real_name: m.real_name,
                        is_bot: m.is_bot || m.is_app_user,
                        deleted: m.deleted,
                    })
                    .collect()
            })
            .await?;
        Ok(DirectoryListing { channels, members })
    }

    async fn open_direct_channel(&self, user_id: &str) -> Result<String, ConnectorError> {
        let opened: ConversationsOpen = self
            .api
            .call("conversations.open", &[("users", user_id.to_owned())])
            .await?;
        Ok(opened.channel.id)
    }

    async fn send_message(&self, channel: &str, text: &str, attachments: Option<&Value>) -> Result<(), ConnectorError> {
        let mut form = vec![("channel", channel.to_owned()), ("text", text.to_owned())];
        if let Some(attachments) = attachments {
            let encoded = match attachments {
                Value::String(raw) => raw.clone(),
                other => other.to_string(),
            };
            form.push(("attachments", encoded));
        }
        let _: Value = self.api.call("chat.postMessage", &form).await?;
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<InboundMessage> {
        self.events.subscribe()
    }

    async fn disconnect(&self) {
        if let Some(socket) = &self.socket {
            socket.abort();
        }
    }
}

#[derive(Deserialize)]
struct SocketEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    envelope_id: Option<String>,
    #[serde(default)]
    payload: Option<Value>,
}

/// Keeps a Socket Mode connection up, reconnecting after `backoff` whenever
/// it drops.
async fn socket_mode(app: SlackApi, bot_user_id: String, events: broadcast::Sender<InboundMessage>, backoff: Duration) {
    loop {
        match app.call::<ConnectionsOpen>("apps.connections.open", &[]).await {
            Ok(open) => match connect_async(open.url.as_str()).await {
                Ok((ws, _)) => {
                    info!("socket mode connected");
                    pump(ws, &bot_user_id, &events).await;
                    warn!("socket mode connection closed");
                }
                Err(e) => warn!(error = %e, "socket mode handshake failed"),
            },
            Err(e) => warn!(error = %e, "could not open a socket mode connection"),
        }
        tokio::time::sleep(backoff).await;
    }
}

async fn pump<S>(ws: WebSocketStream<S>, bot_user_id: &str, events: &broadcast::Sender<InboundMessage>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut write, mut read) = ws.split();
    while let Some(frame) = read.next().await {
        match frame {
            Ok(WsMsg::Text(text)) => {
                let envelope: SocketEnvelope = match serde_json::from_str(text.as_str()) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        debug!(error = %e, "skipping unreadable socket frame");
                        continue;
                    }
                };
                if let Some(id) = &envelope.envelope_id {
                    let ack = json!({ "envelope_id": id }).to_string();
                    if let Err(e) = write.send(WsMsg::text(ack)).await {
                        warn!(error = %e, "could not acknowledge envelope");
                        break;
                    }
                }
                match envelope.kind.as_str() {
                    "events_api" => {
                        if let Some(msg) = envelope.payload.as_ref().and_then(|p| classify(p, bot_user_id)) {
                            // no receivers just means nobody listens yet
                            let _ = events.send(msg);
                        }
                    }
                    "disconnect" => {
                        info!("slack asked us to reconnect");
                        break;
                    }
                    _ => {}
                }
            }
            Ok(WsMsg::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "socket mode read failed");
                break;
            }
        }
    }
}

/// Turn an `events_api` payload into an inbound message, deciding the scope
/// relative to the bot. Bot and edited messages are skipped.
fn classify(payload: &Value, bot_user_id: &str) -> Option<InboundMessage> {
    let event = payload.get("event")?;
    if event.get("type")?.as_str()? != "message" {
        return None;
    }
    if event.get("subtype").is_some() || event.get("bot_id").is_some() {
        return None;
    }
    let text = event.get("text")?.as_str()?;
    let channel_id = event.get("channel")?.as_str()?.to_owned();
    let user_id = event.get("user").and_then(Value::as_str).map(str::to_owned);

    let mention = format!("<@{bot_user_id}>");
    let (scope, text) = if event.get("channel_type").and_then(Value::as_str) == Some("im") {
        (ListenScope::DirectMessage, text.to_owned())
    } else if let Some(rest) = text.trim_start().strip_prefix(&mention) {
        let rest = rest.trim_start_matches(':').trim_start();
        (ListenScope::DirectMention, rest.to_owned())
    } else if text.contains(&mention) {
        (ListenScope::Mention, text.to_owned())
    } else {
        (ListenScope::Ambient, text.to_owned())
    };

    Some(InboundMessage { channel_id, user_id, text, scope })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(event: Value) -> Value {
        json!({ "event": event })
    }

    #[test]
    fn direct_messages_and_mentions_are_scoped() {
        let im = payload(json!({"type": "message", "channel_type": "im", "channel": "D1", "user": "U1", "text": "hi"}));
        assert_eq!(classify(&im, "UBOT").unwrap().scope, ListenScope::DirectMessage);

        let direct = payload(json!({"type": "message", "channel": "C1", "user": "U1", "text": "<@UBOT>: deploy now"}));
        let msg = classify(&direct, "UBOT").unwrap();
        assert_eq!(msg.scope, ListenScope::DirectMention);
        assert_eq!(msg.text, "deploy now");

        let mention = payload(json!({"type": "message", "channel": "C1", "user": "U1", "text": "ask <@UBOT> later"}));
        assert_eq!(classify(&mention, "UBOT").unwrap().scope, ListenScope::Mention);

        let ambient = payload(json!({"type": "message", "channel": "C1", "user": "U1", "text": "ping"}));
        assert_eq!(classify(&ambient, "UBOT").unwrap().scope, ListenScope::Ambient);
    }

    #[test]
    fn bot_and_edited_messages_are_skipped() {
        let from_bot = payload(json!({"type": "message", "channel": "C1", "bot_id": "B1", "text": "hi"}));
        let edited = payload(json!({"type": "message", "subtype": "message_changed", "channel": "C1"}));
        let reaction = payload(json!({"type": "reaction_added", "user": "U1"}));
        assert!(classify(&from_bot, "UBOT").is_none());
        assert!(classify(&edited, "UBOT").is_none());
        assert!(classify(&reaction, "UBOT").is_none());
    }
}
