//! In-memory stand-ins for the chat platform and the storage service.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Mutex, broadcast};

use crate::connector::*;
use crate::storage::{StorageClient, StorageError, StorageTarget, StorageToken};

#[derive(Debug, Clone, PartialEq)]
pub struct SentMessage {
    pub channel: String,
    pub text: String,
    pub attachments: Option<Value>,
}

pub struct MockConnection {
    listing: DirectoryListing,
    fail_listing: AtomicBool,
    sent: Mutex<Vec<SentMessage>>,
    opened: Mutex<Vec<String>>,
    events: broadcast::Sender<InboundMessage>,
    disconnected: AtomicBool,
}

impl Default for MockConnection {
    fn default() -> Self {
        Self::with_listing(DirectoryListing::default())
    }
}

impl MockConnection {
    pub fn with_listing(listing: DirectoryListing) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            listing,
            fail_listing: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
            opened: Mutex::new(Vec::new()),
            events,
            disconnected: AtomicBool::new(false),
        }
    }

    pub fn fail_listing(&self, fail: bool) {
        self.fail_listing.store(fail, Ordering::SeqCst);
    }

    /// Push a message as if it arrived from the platform. Returns how many
    /// subscribers saw it.
    pub fn inject(&self, msg: InboundMessage) -> usize {
        self.events.send(msg).unwrap_or(0)
    }

    pub fn subscribers(&self) -> usize {
        self.events.receiver_count()
    }

    pub async fn sent_messages(&self) -> Vec<SentMessage> {
        self.sent.lock().await.clone()
    }

    pub async fn opened_direct_channels(&self) -> Vec<String> {
        self.opened.lock().await.clone()
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatConnection for MockConnection {
    async fn list_directory(&self) -> Result<DirectoryListing, ConnectorError> {
        if self.fail_listing.load(Ordering::SeqCst) {
            return Err(ConnectorError::Api("ratelimited".into()));
        }
        Ok(self.listing.clone())
    }

    async fn open_direct_channel(&self, user_id: &str) -> Result<String, ConnectorError> {
        self.opened.lock().await.push(user_id.to_owned());
        Ok(format!("D-{user_id}"))
    }

    async fn send_message(&self, channel: &str, text: &str, attachments: Option<&Value>) -> Result<(), ConnectorError> {
        self.sent.lock().await.push(SentMessage {
            channel: channel.to_owned(),
            text: text.to_owned(),
            attachments: attachments.cloned(),
        });
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<InboundMessage> {
        self.events.subscribe()
    }

    async fn disconnect(&self) {
        self.disconnected.store(true, Ordering::SeqCst);
    }
}

/// Hands out one shared [`MockConnection`]; the first `failures` connects fail.
pub struct MockConnector {
    connection: Arc<MockConnection>,
    failures: AtomicUsize,
    attempts: AtomicUsize,
}

impl MockConnector {
    pub fn new(connection: Arc<MockConnection>) -> Self {
        Self { connection, failures: AtomicUsize::new(0), attempts: AtomicUsize::new(0) }
    }

    pub fn failing_first(self, failures: usize) -> Self {
        self.failures.store(failures, Ordering::SeqCst);
        self
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatConnector for MockConnector {
    async fn connect(&self, _token: &str, _app_token: Option<&str>) -> Result<Arc<dyn ChatConnection>, ConnectorError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(ConnectorError::Auth("invalid_auth".into()));
        }
        Ok(self.connection.clone())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredPost {
    pub cell: String,
    pub path: String,
    pub body: Value,
}

pub struct MockStorage {
    posts: Mutex<Vec<StoredPost>>,
    logins: AtomicUsize,
    refreshes: AtomicUsize,
    refuse_login: AtomicBool,
    expires_in: AtomicU64,
}

impl Default for MockStorage {
    fn default() -> Self {
        Self {
            posts: Mutex::new(Vec::new()),
            logins: AtomicUsize::new(0),
            refreshes: AtomicUsize::new(0),
            refuse_login: AtomicBool::new(false),
            expires_in: AtomicU64::new(3600),
        }
    }
}

impl MockStorage {
    pub fn refusing_login(self) -> Self {
        self.refuse_login.store(true, Ordering::SeqCst);
        self
    }

    pub fn with_expires_in(self, secs: u64) -> Self {
        self.expires_in.store(secs, Ordering::SeqCst);
        self
    }

    pub async fn posts(&self) -> Vec<StoredPost> {
        self.posts.lock().await.clone()
    }

    pub fn logins(&self) -> usize {
        self.logins.load(Ordering::SeqCst)
    }

    pub fn refreshes(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }

    fn token(&self) -> StorageToken {
        StorageToken {
            access_token: "access".into(),
            refresh_token: Some("refresh".into()),
            expires_in: self.expires_in.load(Ordering::SeqCst),
        }
    }
}

#[async_trait]
impl StorageClient for MockStorage {
    async fn login(&self, target: &StorageTarget, _username: &str, _password: &str) -> Result<StorageToken, StorageError> {
        self.logins.fetch_add(1, Ordering::SeqCst);
        if self.refuse_login.load(Ordering::SeqCst) {
            return Err(StorageError::Login { cell: target.cell.clone(), reason: "status 401".into() });
        }
        Ok(self.token())
    }

    async fn refresh(&self, _target: &StorageTarget, _refresh_token: &str) -> Result<StorageToken, StorageError> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        Ok(self.token())
    }

    async fn post(&self, target: &StorageTarget, _token: &StorageToken, path: &str, body: &Value) -> Result<(), StorageError> {
        self.posts.lock().await.push(StoredPost {
            cell: target.cell.clone(),
            path: path.to_owned(),
            body: body.clone(),
        });
        Ok(())
    }
}
