use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use regex::{Regex, RegexBuilder};
use serde_json::{Value, json};
use service_plugin::error::ServiceError;
use service_plugin::message::*;
use service_plugin::plugin_runtime::ServiceHandler;
use service_plugin::util::unique_id;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

use crate::connector::{ChatConnection, ChatConnector, InboundMessage};
use crate::directory::DirectoryCache;
use crate::storage::{StorageClient, StorageSession, StorageTarget};

#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub directory_refresh: Duration,
    pub reconnect_backoff: Duration,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            directory_refresh: Duration::from_secs(60 * 60),
            reconnect_backoff: Duration::from_secs(60),
        }
    }
}

/// The Slack service runtime hosted by one worker.
#[derive(Clone)]
pub struct SlackService {
    inner: Arc<Inner>,
}

struct Inner {
    connector: Arc<dyn ChatConnector>,
    storage: Arc<dyn StorageClient>,
    settings: RuntimeSettings,
    state: watch::Sender<ServiceState>,
    service_id: OnceLock<String>,
    options: OnceLock<OpenOptions>,
    session: OnceLock<Arc<StorageSession>>,
    connection: OnceLock<Arc<dyn ChatConnection>>,
    directory: DirectoryCache,
    subscriptions: DashMap<String, Arc<Subscription>>,
    callbacks: Mutex<Vec<CallbackRecord>>,
    tasks: Mutex<Vec<AbortHandle>>,
}

/// An active `start-listen`.
struct Subscription {
    id: String,
    pattern: Regex,
    scopes: Vec<ListenScope>,
    target: StorageTarget,
    username: String,
    password: String,
    path: String,
}

impl SlackService {
    pub fn new(connector: Arc<dyn ChatConnector>, storage: Arc<dyn StorageClient>, settings: RuntimeSettings) -> Self {
        let (state, _) = watch::channel(ServiceState::Unopened);
        Self {
            inner: Arc::new(Inner {
                connector,
                storage,
                settings,
                state,
                service_id: OnceLock::new(),
                options: OnceLock::new(),
                session: OnceLock::new(),
                connection: OnceLock::new(),
                directory: DirectoryCache::default(),
                subscriptions: DashMap::new(),
                callbacks: Mutex::new(Vec::new()),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Resolves once the service reaches `state`.
    pub async fn wait_for_state(&self, state: ServiceState) {
        let mut rx = self.inner.state.subscribe();
        let _ = rx.wait_for(|s| *s == state).await;
    }

    pub fn active_listens(&self) -> usize {
        self.inner.subscriptions.len()
    }

    fn service_id(&self) -> &str {
        self.inner.service_id.get().map(String::as_str).unwrap_or_default()
    }

    fn set_state(&self, state: ServiceState) {
        let previous = self.inner.state.send_replace(state);
        if previous != state {
            info!(service_id = self.service_id(), from = %previous, to = %state, "state changed");
        }
    }

    fn connection(&self) -> Result<Arc<dyn ChatConnection>, ServiceError> {
        self.inner
            .connection
            .get()
            .cloned()
            .ok_or(ServiceError::NotReady(self.state()))
    }

    async fn track(&self, task: AbortHandle) {
        self.inner.tasks.lock().await.push(task);
    }

    /// Wire a live connection in: directory, refresh timer, event pump. The
    /// service is open once this returns.
    async fn attach(&self, conn: Arc<dyn ChatConnection>) {
        if let Err(e) = self.inner.directory.rebuild(conn.as_ref()).await {
            warn!(service_id = self.service_id(), error = %e, "initial directory build failed");
        }
        if self.inner.connection.set(Arc::clone(&conn)).is_err() {
            warn!(service_id = self.service_id(), "connection already attached");
            return;
        }

        let events = conn.subscribe();
        let pump = tokio::spawn(dispatch_events(self.clone(), events));
        let refresh = tokio::spawn(refresh_directory(self.clone(), conn));
        self.track(pump.abort_handle()).await;
        self.track(refresh.abort_handle()).await;

        self.set_state(ServiceState::Open);
    }

    async fn spawn_reconnect(&self, token: String, app_token: Option<String>) {
        let svc = self.clone();
        let backoff = self.inner.settings.reconnect_backoff;
        let task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(backoff).await;
                if svc.state() != ServiceState::Opening {
                    return;
                }
                match svc.inner.connector.connect(&token, app_token.as_deref()).await {
                    Ok(conn) => {
                        svc.attach(conn).await;
                        return;
                    }
                    Err(e) => warn!(service_id = svc.service_id(), error = %e, ?backoff, "chat connect failed again"),
                }
            }
        });
        self.track(task.abort_handle()).await;
    }

    async fn on_message(&self, msg: InboundMessage) {
        if msg.is_addressed() && is_greeting(&msg.text) {
            if let Some(conn) = self.inner.connection.get() {
                if let Err(e) = conn.send_message(&msg.channel_id, "hi", None).await {
                    warn!(service_id = self.service_id(), error = %e, "could not answer greeting");
                }
            }
        }

        let matched: Vec<Arc<Subscription>> = self
            .inner
            .subscriptions
            .iter()
            .filter(|sub| msg.matches(&sub.scopes) && sub.pattern.is_match(&msg.text))
            .map(|sub| Arc::clone(sub.value()))
            .collect();
        if matched.is_empty() {
            return;
        }

        let dir = self.inner.directory.get().await;
        let user_name = msg.user_id.as_deref().and_then(|id| dir.user_name(id));
        let entity = json!({
            "service": self.service_id(),
            "action": msg.scope,
            "channelId": msg.channel_id,
            "channel": dir.channel_name(&msg.channel_id),
            "text": msg.text,
            "user": user_name,
            "userId": msg.user_id,
        });

        for sub in matched {
            let svc = self.clone();
            let entity = entity.clone();
            tokio::spawn(async move { svc.deliver(sub, entity).await });
        }
    }

    async fn deliver(&self, sub: Arc<Subscription>, entity: Value) {
        // a stop that raced the match wins
        if !self.inner.subscriptions.contains_key(&sub.id) {
            debug!(listen_id = %sub.id, "listen stopped before delivery");
            return;
        }
        // every heard message gets its own login with the listener's credentials
        let session = StorageSession::new(
            Arc::clone(&self.inner.storage),
            sub.target.clone(),
            sub.username.as_str(),
            sub.password.as_str(),
        );
        match session.post(&sub.path, &entity).await {
            Ok(()) => info!(listen_id = %sub.id, path = %sub.path, "stored a heard message"),
            Err(e) => error!(listen_id = %sub.id, error = %e, "could not store a heard message"),
        }
    }
}

/// `hi`, `Hi!`, `hi there`...
fn is_greeting(text: &str) -> bool {
    text.split_whitespace()
        .next()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()))
        .is_some_and(|w| w.eq_ignore_ascii_case("hi"))
}

async fn dispatch_events(svc: SlackService, mut events: broadcast::Receiver<InboundMessage>) {
    loop {
        match events.recv().await {
            Ok(msg) => svc.on_message(msg).await,
            Err(RecvError::Lagged(skipped)) => warn!(service_id = svc.service_id(), skipped, "event pump fell behind"),
            Err(RecvError::Closed) => {
                debug!(service_id = svc.service_id(), "event stream ended");
                return;
            }
        }
    }
}

async fn refresh_directory(svc: SlackService, conn: Arc<dyn ChatConnection>) {
    let period = svc.inner.settings.directory_refresh;
    if period.is_zero() {
        warn!(service_id = svc.service_id(), "directory refresh disabled");
        return;
    }
    let mut ticker = tokio::time::interval(period);
    // the first tick completes immediately; the directory was just built
    ticker.tick().await;
    loop {
        ticker.tick().await;
        match svc.inner.directory.rebuild(conn.as_ref()).await {
            Ok(dir) => debug!(service_id = svc.service_id(), users = dir.users().len(), "directory refreshed"),
            Err(e) => warn!(service_id = svc.service_id(), error = %e, "directory refresh failed; keeping the old one"),
        }
    }
}

#[async_trait]
impl ServiceHandler for SlackService {
    fn state(&self) -> ServiceState {
        *self.inner.state.borrow()
    }

    async fn open(&self, service_id: &str, options: OpenOptions) -> Result<(), ServiceError> {
        let claimed = self.inner.state.send_if_modified(|state| {
            if *state == ServiceState::Unopened {
                *state = ServiceState::Opening;
                true
            } else {
                false
            }
        });
        if !claimed {
            return Err(ServiceError::NotReady(self.state()));
        }
        let _ = self.inner.service_id.set(service_id.to_owned());
        let _ = self.inner.options.set(options.clone());

        let session = Arc::new(StorageSession::new(
            Arc::clone(&self.inner.storage),
            StorageTarget::new(&options.host, &options.cell),
            &options.username,
            &options.password,
        ));
        if let Err(e) = session.login().await {
            error!(service_id, error = %e, "storage login failed");
            self.set_state(ServiceState::Closed);
            return Err(ServiceError::failed(e));
        }
        let _ = self.inner.session.set(session);

        match self.inner.connector.connect(&options.token, options.app_token.as_deref()).await {
            Ok(conn) => {
                self.attach(conn).await;
                Ok(())
            }
            Err(e) => {
                let backoff = self.inner.settings.reconnect_backoff;
                warn!(service_id, error = %e, ?backoff, "chat connect failed; will retry");
                self.spawn_reconnect(options.token, options.app_token).await;
                Err(ServiceError::Failed(format!("chat connect failed: {e}")))
            }
        }
    }

    async fn query_users(&self) -> Result<UserDirectory, ServiceError> {
        let conn = self.connection()?;
        match self.inner.directory.rebuild(conn.as_ref()).await {
            Ok(dir) => Ok(dir.users().clone()),
            Err(e) => {
                warn!(service_id = self.service_id(), error = %e, "directory rebuild failed; serving cached users");
                Ok(self.inner.directory.get().await.users().clone())
            }
        }
    }

    async fn send_message(&self, params: SendMessageParams) -> Result<(), ServiceError> {
        let conn = self.connection()?;
        let target = self.inner.directory.get().await.resolve_target(params.channel.as_deref());
        conn.send_message(&target, &params.text, params.attachments.as_ref())
            .await
            .map_err(ServiceError::failed)
    }

    async fn start_listen(&self, request: ListenRequest) -> Result<ListenStarted, ServiceError> {
        let pattern = RegexBuilder::new(&request.key)
            .case_insensitive(true)
            .build()
            .map_err(|e| ServiceError::InvalidParams(format!("bad pattern `{}`: {e}", request.key)))?;
        let options = self
            .inner
            .options
            .get()
            .ok_or(ServiceError::NotReady(self.state()))?;

        let scopes = if request.mention.is_empty() {
            ListenScope::ALL.to_vec()
        } else {
            request.mention.clone()
        };
        let target = StorageTarget::new(&options.host, request.cell.unwrap_or_else(|| options.cell.clone()));
        let id = unique_id();
        let sub = Subscription {
            id: id.clone(),
            pattern,
            scopes,
            target,
            username: request.username.unwrap_or_else(|| options.username.clone()),
            password: request.password.unwrap_or_else(|| options.password.clone()),
            path: request.path.unwrap_or_else(|| options.path.clone()),
        };
        self.inner.subscriptions.insert(id.clone(), Arc::new(sub));
        info!(service_id = self.service_id(), listen_id = %id, key = %request.key, "listening");
        Ok(ListenStarted { listen_id: id })
    }

    async fn stop_listen(&self, request: StopListen) -> Result<(), ServiceError> {
        match self.inner.subscriptions.remove(&request.listen_id) {
            Some(_) => info!(service_id = self.service_id(), listen_id = %request.listen_id, "stopped listening"),
            None => debug!(listen_id = %request.listen_id, "no such listen"),
        }
        Ok(())
    }

    async fn callbacks(&self) -> Result<Vec<CallbackRecord>, ServiceError> {
        Ok(self.inner.callbacks.lock().await.clone())
    }

    async fn post_callback(&self, event: CallbackEvent) -> Result<(), ServiceError> {
        let raw = serde_json::to_string(&event).map_err(ServiceError::failed)?;
        self.inner.callbacks.lock().await.push(CallbackRecord {
            received_at: Utc::now(),
            event,
        });

        let (Some(session), Some(options)) = (self.inner.session.get().cloned(), self.inner.options.get()) else {
            return Ok(());
        };
        let path = options.path.clone();
        let body = json!({ "service": self.service_id(), "raw": raw });
        let service_id = self.service_id().to_owned();
        tokio::spawn(async move {
            match session.post(&path, &body).await {
                Ok(()) => info!(%service_id, "stored callback"),
                Err(e) => error!(%service_id, error = %e, "could not store callback"),
            }
        });
        Ok(())
    }

    async fn close(&self) {
        for task in self.inner.tasks.lock().await.drain(..) {
            task.abort();
        }
        if let Some(conn) = self.inner.connection.get() {
            conn.disconnect().await;
        }
        self.set_state(ServiceState::Closed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::{DirectoryListing, MemberEntry};
    use crate::testing::{MockConnection, MockConnector, MockStorage, StoredPost};

    struct Fixture {
        svc: SlackService,
        conn: Arc<MockConnection>,
        connector: Arc<MockConnector>,
        storage: Arc<MockStorage>,
    }

    fn fixture_with(connector_failures: usize, storage: MockStorage) -> Fixture {
        build(connector_failures, storage, Duration::from_secs(3600))
    }

    fn build(connector_failures: usize, storage: MockStorage, directory_refresh: Duration) -> Fixture {
        let listing = DirectoryListing {
            channels: vec![],
            members: vec![MemberEntry {
                id: "U1".into(),
                name: "alice".into(),
                real_name: None,
                is_bot: false,
                deleted: false,
            }],
        };
        let conn = Arc::new(MockConnection::with_listing(listing));
        let connector = Arc::new(MockConnector::new(conn.clone()).failing_first(connector_failures));
        let storage = Arc::new(storage);
        let settings = RuntimeSettings {
            directory_refresh,
            reconnect_backoff: Duration::from_millis(20),
        };
        let svc = SlackService::new(connector.clone(), storage.clone(), settings);
        Fixture { svc, conn, connector, storage }
    }

    fn fixture() -> Fixture {
        fixture_with(0, MockStorage::default())
    }

    fn options() -> OpenOptions {
        OpenOptions {
            host: "pds.example".into(),
            token: "xoxb-1".into(),
            app_token: None,
            cell: "app".into(),
            username: "bot".into(),
            password: "secret".into(),
            path: "box/callbacks".into(),
        }
    }

    fn inbound(text: &str, scope: ListenScope) -> InboundMessage {
        InboundMessage {
            channel_id: "D-U1".into(),
            user_id: Some("U1".into()),
            text: text.into(),
            scope,
        }
    }

    async fn posts_after(storage: &MockStorage, at_least: usize) -> Vec<StoredPost> {
        for _ in 0..100 {
            let posts = storage.posts().await;
            if posts.len() >= at_least {
                return posts;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        storage.posts().await
    }

    #[tokio::test]
    async fn open_logs_in_connects_and_builds_the_directory() {
        let f = fixture();
        f.svc.open("svc1", options()).await.unwrap();

        assert_eq!(f.svc.state(), ServiceState::Open);
        assert_eq!(f.storage.logins(), 1);
        let users = f.svc.query_users().await.unwrap();
        assert_eq!(users["alice"].channel_id.as_deref(), Some("D-U1"));
    }

    #[tokio::test]
    async fn second_open_is_refused() {
        let f = fixture();
        f.svc.open("svc1", options()).await.unwrap();
        let err = f.svc.open("svc1", options()).await.unwrap_err();
        assert!(matches!(err, ServiceError::NotReady(ServiceState::Open)));
    }

    #[tokio::test]
    async fn refused_storage_login_closes_the_service() {
        let f = fixture_with(0, MockStorage::default().refusing_login());
        assert!(f.svc.open("svc1", options()).await.is_err());
        assert_eq!(f.svc.state(), ServiceState::Closed);
        assert_eq!(f.connector.attempts(), 0);
    }

    #[tokio::test]
    async fn failed_connect_stays_opening_and_retries() {
        let f = fixture_with(2, MockStorage::default());
        assert!(f.svc.open("svc1", options()).await.is_err());
        assert_eq!(f.svc.state(), ServiceState::Opening);

        tokio::time::timeout(Duration::from_secs(2), f.svc.wait_for_state(ServiceState::Open))
            .await
            .unwrap();
        assert_eq!(f.connector.attempts(), 3);
    }

    #[tokio::test]
    async fn send_message_defaults_to_general_and_maps_users_to_their_dm() {
        let f = fixture();
        f.svc.open("svc1", options()).await.unwrap();

        let say = |channel: Option<&str>| SendMessageParams {
            channel: channel.map(str::to_owned),
            text: "hi".into(),
            attachments: None,
        };
        f.svc.send_message(say(None)).await.unwrap();
        f.svc.send_message(say(Some("alice"))).await.unwrap();

        let sent = f.conn.sent_messages().await;
        assert_eq!(sent[0].channel, "general");
        assert_eq!(sent[1].channel, "D-U1");
    }

    #[tokio::test]
    async fn heard_messages_are_posted_until_the_listen_stops() {
        let f = fixture();
        f.svc.open("svc1", options()).await.unwrap();

        let started = f
            .svc
            .start_listen(ListenRequest { key: "ping".into(), ..Default::default() })
            .await
            .unwrap();
        f.conn.inject(inbound("PING please", ListenScope::DirectMessage));

        let posts = posts_after(&f.storage, 1).await;
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].cell, "app");
        assert_eq!(posts[0].path, "box/callbacks");
        assert_eq!(posts[0].body["service"], json!("svc1"));
        assert_eq!(posts[0].body["action"], json!("direct_message"));
        assert_eq!(posts[0].body["user"], json!("alice"));
        assert_eq!(posts[0].body["channel"], json!("alice"));

        f.svc.stop_listen(StopListen { listen_id: started.listen_id }).await.unwrap();
        f.conn.inject(inbound("ping again", ListenScope::DirectMessage));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(f.storage.posts().await.len(), 1);
    }

    #[tokio::test]
    async fn listen_scopes_filter_messages() {
        let f = fixture();
        f.svc.open("svc1", options()).await.unwrap();
        f.svc
            .start_listen(ListenRequest {
                key: "deploy".into(),
                mention: vec![ListenScope::DirectMention],
                path: Some("box/deploys".into()),
                ..Default::default()
            })
            .await
            .unwrap();

        f.conn.inject(inbound("deploy", ListenScope::Ambient));
        f.conn.inject(inbound("deploy", ListenScope::DirectMention));

        let posts = posts_after(&f.storage, 1).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(f.storage.posts().await.len(), 1);
        assert_eq!(posts[0].path, "box/deploys");
    }

    #[tokio::test]
    async fn bad_pattern_is_invalid_params() {
        let f = fixture();
        f.svc.open("svc1", options()).await.unwrap();
        let err = f
            .svc
            .start_listen(ListenRequest { key: "(".into(), ..Default::default() })
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidParams(_)));
        assert_eq!(f.svc.active_listens(), 0);
    }

    #[tokio::test]
    async fn greets_back_when_addressed() {
        let f = fixture();
        f.svc.open("svc1", options()).await.unwrap();

        f.conn.inject(inbound("hi there", ListenScope::Ambient));
        f.conn.inject(inbound("Hi!", ListenScope::DirectMessage));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let sent = f.conn.sent_messages().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].channel, "D-U1");
        assert_eq!(sent[0].text, "hi");
    }

    #[tokio::test]
    async fn callbacks_are_buffered_and_stored() {
        let f = fixture();
        f.svc.open("svc1", options()).await.unwrap();

        let event: CallbackEvent = serde_json::from_value(json!({"callback_id": "svc1", "actions": [{"value": "yes"}]})).unwrap();
        f.svc.post_callback(event.clone()).await.unwrap();

        let list = f.svc.callbacks().await.unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].event, event);

        let posts = posts_after(&f.storage, 1).await;
        assert_eq!(posts[0].body["service"], json!("svc1"));
        let raw: Value = serde_json::from_str(posts[0].body["raw"].as_str().unwrap()).unwrap();
        assert_eq!(raw["actions"][0]["value"], json!("yes"));
    }

    #[tokio::test]
    async fn each_heard_message_logs_in_again() {
        let f = fixture();
        f.svc.open("svc1", options()).await.unwrap();
        assert_eq!(f.storage.logins(), 1);

        f.svc
            .start_listen(ListenRequest {
                key: "ping".into(),
                cell: Some("ops".into()),
                username: Some("listener".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        f.conn.inject(inbound("ping", ListenScope::DirectMessage));
        posts_after(&f.storage, 1).await;
        f.conn.inject(inbound("ping", ListenScope::DirectMessage));

        let posts = posts_after(&f.storage, 2).await;
        assert_eq!(posts.len(), 2);
        assert!(posts.iter().all(|p| p.cell == "ops"));
        assert_eq!(f.storage.logins(), 3);
    }

    #[tokio::test]
    async fn directory_is_rebuilt_until_close() {
        let f = build(0, MockStorage::default(), Duration::from_millis(50));
        f.svc.open("svc1", options()).await.unwrap();
        let built_on_open = f.conn.opened_direct_channels().await.len();
        assert_eq!(built_on_open, 1);

        tokio::time::sleep(Duration::from_millis(220)).await;
        let refreshed = f.conn.opened_direct_channels().await.len();
        assert!(refreshed >= built_on_open + 2, "only {refreshed} builds");

        f.svc.close().await;
        let at_close = f.conn.opened_direct_channels().await.len();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(f.conn.opened_direct_channels().await.len(), at_close);
    }

    #[tokio::test]
    async fn zero_refresh_builds_the_directory_once() {
        let f = build(0, MockStorage::default(), Duration::ZERO);
        f.svc.open("svc1", options()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(f.conn.opened_direct_channels().await.len(), 1);
        assert_eq!(f.svc.state(), ServiceState::Open);
    }

    #[tokio::test]
    async fn close_disconnects_and_is_terminal() {
        let f = fixture();
        f.svc.open("svc1", options()).await.unwrap();
        f.svc.close().await;

        assert!(f.conn.is_disconnected());
        assert_eq!(f.svc.state(), ServiceState::Closed);
    }

    #[test]
    fn greeting_detection() {
        assert!(is_greeting("hi"));
        assert!(is_greeting("Hi! how are you"));
        assert!(!is_greeting("this is it"));
        assert!(!is_greeting(""));
    }
}
