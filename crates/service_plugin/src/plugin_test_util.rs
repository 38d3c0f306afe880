use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{Mutex, Notify};
use tracing::warn;

use crate::error::{CallError, ServiceError};
use crate::message::*;
use crate::peer::Peer;
use crate::plugin_runtime::{ServiceHandler, serve_until};
use crate::util::unique_id;
use crate::worker::{LaunchedWorker, WorkerLauncher};

type Factory<H> = Arc<dyn Fn(&str) -> H + Send + Sync>;

/// Launches workers as tasks in this process, talking JSON‑RPC over an
/// in-memory pipe. Killing a worker tears the pipe down the way a process
/// exit would.
pub struct InProcessLauncher<H: ServiceHandler> {
    factory: Factory<H>,
    launched: AtomicUsize,
}

impl<H: ServiceHandler> InProcessLauncher<H> {
    pub fn new(factory: impl Fn(&str) -> H + Send + Sync + 'static) -> Self {
        Self { factory: Arc::new(factory), launched: AtomicUsize::new(0) }
    }

    /// How many workers have been launched so far.
    pub fn launched(&self) -> usize {
        self.launched.load(Ordering::SeqCst)
    }
}

impl<H: ServiceHandler> WorkerLauncher for InProcessLauncher<H> {
    fn launch(&self, service_id: &str) -> Result<LaunchedWorker, CallError> {
        let handler = (self.factory)(service_id);
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        let (their_read, their_write) = tokio::io::split(theirs);
        let (our_read, our_write) = tokio::io::split(ours);

        let kill = Arc::new(Notify::new());
        let shutdown = Arc::clone(&kill);
        let label = service_id.to_owned();
        tokio::spawn(async move {
            let stop = async move { shutdown.notified().await };
            if let Err(e) = serve_until(handler, their_read, their_write, stop).await {
                warn!(service_id = %label, error = %e, "in-process worker failed");
            }
        });

        let (peer, inbound) = Peer::connect(service_id, our_read, our_write);
        self.launched.fetch_add(1, Ordering::SeqCst);
        Ok(LaunchedWorker { pid: None, peer, inbound, kill })
    }
}

/// A service handler that records what it is asked to do.
#[derive(Clone, Default)]
pub struct MockService {
    inner: Arc<MockInner>,
}

#[derive(Default)]
struct MockInner {
    state: StdMutex<ServiceState>,
    opened_with: Mutex<Option<OpenOptions>>,
    sent: Mutex<Vec<SendMessageParams>>,
    listens: DashMap<String, ListenRequest>,
    callbacks: Mutex<Vec<CallbackRecord>>,
    fail_open: AtomicBool,
    fail_info: AtomicBool,
    stall_info: AtomicBool,
}

impl MockService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts out already open.
    pub fn opened() -> Self {
        let svc = Self::default();
        svc.set_state(ServiceState::Open);
        svc
    }

    pub fn failing_open(self) -> Self {
        self.inner.fail_open.store(true, Ordering::SeqCst);
        self
    }

    pub fn failing_info(self) -> Self {
        self.inner.fail_info.store(true, Ordering::SeqCst);
        self
    }

    /// `query-info` never answers.
    pub fn stalling_info(self) -> Self {
        self.inner.stall_info.store(true, Ordering::SeqCst);
        self
    }

    pub fn set_state(&self, state: ServiceState) {
        *self.inner.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    pub async fn opened_with(&self) -> Option<OpenOptions> {
        self.inner.opened_with.lock().await.clone()
    }

    pub async fn sent_messages(&self) -> Vec<SendMessageParams> {
        self.inner.sent.lock().await.clone()
    }

    pub fn active_listens(&self) -> usize {
        self.inner.listens.len()
    }
}

#[async_trait]
impl ServiceHandler for MockService {
    fn state(&self) -> ServiceState {
        *self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn info(&self, service_id: &str) -> Result<ServiceInfo, ServiceError> {
        if self.inner.stall_info.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.inner.fail_info.load(Ordering::SeqCst) {
            return Err(ServiceError::failed("info unavailable"));
        }
        Ok(ServiceInfo { id: service_id.to_owned(), state: self.state() })
    }

    async fn open(&self, _service_id: &str, options: OpenOptions) -> Result<(), ServiceError> {
        *self.inner.opened_with.lock().await = Some(options);
        if self.inner.fail_open.load(Ordering::SeqCst) {
            self.set_state(ServiceState::Closed);
            return Err(ServiceError::failed("login refused"));
        }
        self.set_state(ServiceState::Open);
        Ok(())
    }

    async fn query_users(&self) -> Result<UserDirectory, ServiceError> {
        let mut users = UserDirectory::new();
        users.insert(
            "alice".into(),
            UserEntry {
                id: "U1".into(),
                name: "alice".into(),
                real_name: None,
                is_bot: false,
                channel_id: Some("D1".into()),
            },
        );
        Ok(users)
    }

    async fn send_message(&self, params: SendMessageParams) -> Result<(), ServiceError> {
        self.inner.sent.lock().await.push(params);
        Ok(())
    }

    async fn start_listen(&self, request: ListenRequest) -> Result<ListenStarted, ServiceError> {
        let listen_id = unique_id();
        self.inner.listens.insert(listen_id.clone(), request);
        Ok(ListenStarted { listen_id })
    }

    async fn stop_listen(&self, request: StopListen) -> Result<(), ServiceError> {
        self.inner.listens.remove(&request.listen_id);
        Ok(())
    }

    async fn callbacks(&self) -> Result<Vec<CallbackRecord>, ServiceError> {
        Ok(self.inner.callbacks.lock().await.clone())
    }

    async fn post_callback(&self, event: CallbackEvent) -> Result<(), ServiceError> {
        let record = CallbackRecord { received_at: Utc::now(), event };
        self.inner.callbacks.lock().await.push(record);
        Ok(())
    }
}
