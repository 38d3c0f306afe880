use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde_json::Value;
use tokio::process::{Child, Command as TokioCommand};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::{Notify, watch};
use tracing::{debug, info, warn};

use crate::error::CallError;
use crate::jsonrpc::{Request, Response, codes};
use crate::message::{Method, ServiceParams};
use crate::peer::Peer;

/// A freshly started worker, before the registry wraps it.
pub struct LaunchedWorker {
    pub pid: Option<u32>,
    pub peer: Peer,
    pub inbound: UnboundedReceiver<Request>,
    /// Notified to terminate the worker.
    pub kill: Arc<Notify>,
}

/// Starts one worker for a service. Synchronous so the registry can launch
/// while it holds the entry for the id.
pub trait WorkerLauncher: Send + Sync + 'static {
    fn launch(&self, service_id: &str) -> Result<LaunchedWorker, CallError>;
}

/// Launches workers by re-executing a binary with a role flag.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self { program: program.into(), args }
    }

    /// The running executable, started with `args`.
    pub fn current_exe(args: Vec<String>) -> std::io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?, args))
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn launch(&self, service_id: &str) -> Result<LaunchedWorker, CallError> {
        let mut child = TokioCommand::new(&self.program)
            .args(&self.args)
            .arg("--service-id")
            .arg(service_id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CallError::Transport(format!("could not start worker for `{service_id}`: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| CallError::Transport("worker stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CallError::Transport("worker stdout unavailable".into()))?;
        let pid = child.id();

        let (peer, inbound) = Peer::connect(service_id, stdout, stdin);
        let kill = Arc::new(Notify::new());
        tokio::spawn(monitor_child(service_id.to_owned(), child, Arc::clone(&kill)));

        info!(service_id, ?pid, program = %self.program.display(), "worker started");
        Ok(LaunchedWorker { pid, peer, inbound, kill })
    }
}

async fn monitor_child(service_id: String, mut child: Child, kill: Arc<Notify>) {
    tokio::select! {
        status = child.wait() => match status {
            Ok(status) => info!(%service_id, %status, "worker exited"),
            Err(e) => warn!(%service_id, error = %e, "could not wait on worker"),
        },
        _ = kill.notified() => match child.kill().await {
            Ok(()) => info!(%service_id, "worker terminated"),
            Err(e) => warn!(%service_id, error = %e, "could not terminate worker"),
        },
    }
}

/// One live worker as the registry sees it.
pub struct WorkerHandle {
    worker_id: u64,
    service_id: String,
    pid: Option<u32>,
    peer: Peer,
    ready: watch::Receiver<bool>,
    kill: Arc<Notify>,
    killed: AtomicBool,
}

impl WorkerHandle {
    /// Wrap a launched worker and start consuming what it sends us (the
    /// `ready` handshake; anything else is refused).
    pub fn new(worker_id: u64, service_id: impl Into<String>, launched: LaunchedWorker) -> Arc<Self> {
        let LaunchedWorker { pid, peer, mut inbound, kill } = launched;
        let service_id = service_id.into();
        let (ready_tx, ready) = watch::channel(false);

        let responder = peer.clone();
        let label = service_id.clone();
        tokio::spawn(async move {
            while let Some(req) = inbound.recv().await {
                match (req.method.parse::<Method>(), req.id) {
                    (Ok(Method::Ready), _) => {
                        debug!(service_id = %label, "worker ready");
                        ready_tx.send_replace(true);
                    }
                    (_, Some(id)) => {
                        let rsp = Response::fail(id, codes::METHOD_NOT_FOUND, "Method not found", None);
                        let _ = responder.respond(rsp);
                    }
                    (_, None) => debug!(service_id = %label, method = %req.method, "ignoring notification"),
                }
            }
        });

        Arc::new(Self {
            worker_id,
            service_id,
            pid,
            peer,
            ready,
            kill,
            killed: AtomicBool::new(false),
        })
    }

    pub fn worker_id(&self) -> u64 {
        self.worker_id
    }

    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    /// Call `method` on this worker with the standard `{service_id, payload}` params.
    pub async fn call(&self, method: Method, payload: Value, timeout: Duration) -> Result<Value, CallError> {
        let params = ServiceParams { service_id: self.service_id.clone(), payload };
        let params = serde_json::to_value(params).map_err(|e| CallError::Codec(e.to_string()))?;
        self.peer.call(method, Some(params), timeout).await
    }

    /// Wait for the worker's `ready` notification.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<(), CallError> {
        let mut ready = self.ready.clone();
        match tokio::time::timeout(timeout, ready.wait_for(|r| *r)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(CallError::WorkerGone(self.service_id.clone())),
            Err(_) => Err(CallError::Timeout { method: Method::Ready.to_string(), timeout }),
        }
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Terminate the worker. Idempotent.
    pub fn kill(&self) {
        if !self.killed.swap(true, Ordering::SeqCst) {
            self.kill.notify_one();
        }
    }

    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    /// Resolves once the worker's channel has closed.
    pub async fn exited(&self) {
        self.peer.closed().await
    }
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("worker_id", &self.worker_id)
            .field("service_id", &self.service_id)
            .field("pid", &self.pid)
            .field("killed", &self.is_killed())
            .finish()
    }
}
