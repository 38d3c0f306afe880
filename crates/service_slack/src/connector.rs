use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use service_plugin::message::ListenScope;
use thiserror::Error;
use tokio::sync::broadcast;

#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("chat api returned `{0}`")]
    Api(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected payload: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("socket error: {0}")]
    Socket(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelEntry {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberEntry {
    pub id: String,
    pub name: String,
    pub real_name: Option<String>,
    pub is_bot: bool,
    pub deleted: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectoryListing {
    pub channels: Vec<ChannelEntry>,
    pub members: Vec<MemberEntry>,
}

/// A message seen by the bot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub channel_id: String,
    pub user_id: Option<String>,
    pub text: String,
    pub scope: ListenScope,
}

impl InboundMessage {
    /// `message_received` covers every message; other scopes match exactly.
    pub fn matches(&self, scopes: &[ListenScope]) -> bool {
        scopes
            .iter()
            .any(|s| *s == ListenScope::MessageReceived || *s == self.scope)
    }

    /// Addressed to the bot rather than overheard.
    pub fn is_addressed(&self) -> bool {
        matches!(
            self.scope,
            ListenScope::DirectMessage | ListenScope::DirectMention | ListenScope::Mention
        )
    }
}

/// Entry point of a chat platform SDK.
#[async_trait]
pub trait ChatConnector: Send + Sync + 'static {
    async fn connect(&self, token: &str, app_token: Option<&str>) -> Result<Arc<dyn ChatConnection>, ConnectorError>;
}

/// A live, authenticated connection. Keeping the inbound stream alive across
/// drops is the connection's job.
#[async_trait]
pub trait ChatConnection: Send + Sync + 'static {
    async fn list_directory(&self) -> Result<DirectoryListing, ConnectorError>;

    /// Opens (or reuses) the direct message channel with a user.
    async fn open_direct_channel(&self, user_id: &str) -> Result<String, ConnectorError>;

    /// `channel` may be an id or a channel name.
    async fn send_message(&self, channel: &str, text: &str, attachments: Option<&Value>) -> Result<(), ConnectorError>;

    fn subscribe(&self) -> broadcast::Receiver<InboundMessage>;

    async fn disconnect(&self) {}
}
