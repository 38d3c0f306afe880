// src/registry.rs

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::future::try_join_all;
use service_plugin::control_client::ServiceClient;
use service_plugin::error::CallError;
use service_plugin::message::{OpenOptions, ServiceInfo};
use service_plugin::worker::{WorkerHandle, WorkerLauncher};
use tracing::{debug, error, info, warn};

use crate::config::Settings;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryConfig {
    /// Deadline for every call made to a service worker.
    pub call_timeout: Duration,
    /// How long a fresh worker gets to announce `ready`.
    pub startup_timeout: Duration,
    /// Delay between killing a worker and dropping its entry.
    pub delete_grace: Duration,
}

impl From<&Settings> for RegistryConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            call_timeout: settings.web.timeout(),
            startup_timeout: settings.worker.startup_timeout(),
            delete_grace: settings.worker.delete_grace(),
        }
    }
}

/// Outcome of [`WorkerRegistry::create_service`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Created {
    Launched,
    AlreadyExists,
}

/// Owns every service worker of this process, keyed by service id.
pub struct WorkerRegistry {
    launcher: Arc<dyn WorkerLauncher>,
    workers: DashMap<String, Arc<WorkerHandle>>,
    next_worker_id: AtomicU64,
    config: RegistryConfig,
    me: Weak<WorkerRegistry>,
}

impl WorkerRegistry {
    pub fn new(launcher: Arc<dyn WorkerLauncher>, config: RegistryConfig) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            launcher,
            workers: DashMap::new(),
            next_worker_id: AtomicU64::new(1),
            config,
            me: me.clone(),
        })
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Launch a worker for `id` unless one is already registered. The entry
    /// is visible as soon as this returns; `open` runs in the background
    /// once the worker reports ready.
    pub fn create_service(&self, id: &str, options: OpenOptions) -> Result<Created, CallError> {
        let worker = match self.workers.entry(id.to_owned()) {
            Entry::Occupied(_) => {
                debug!(service_id = id, "service already exists");
                return Ok(Created::AlreadyExists);
            }
            Entry::Vacant(slot) => {
                let launched = self.launcher.launch(id)?;
                let worker_id = self.next_worker_id.fetch_add(1, Ordering::SeqCst);
                let worker = WorkerHandle::new(worker_id, id, launched);
                slot.insert(Arc::clone(&worker));
                worker
            }
        };
        info!(service_id = id, worker_id = worker.worker_id(), pid = ?worker.pid(), "service registered");

        tokio::spawn(initialize(worker.clone(), options, self.config.clone()));
        tokio::spawn(watch_exit(self.me.clone(), worker));
        Ok(Created::Launched)
    }

    /// `query-info` on one worker.
    pub async fn get_service(&self, id: &str) -> Result<ServiceInfo, CallError> {
        self.client(id)?.query_info().await
    }

    /// `query-info` on every worker at once, sorted by id. One failure fails
    /// the whole list.
    pub async fn get_all_services(&self) -> Result<Vec<ServiceInfo>, CallError> {
        let mut workers: Vec<Arc<WorkerHandle>> = self.workers.iter().map(|w| Arc::clone(w.value())).collect();
        workers.sort_by(|a, b| a.service_id().cmp(b.service_id()));
        let calls = workers
            .into_iter()
            .map(|worker| async move { ServiceClient::new(worker, self.config.call_timeout).query_info().await });
        try_join_all(calls).await
    }

    /// Kill the worker for `id`, wait out the grace delay, then drop the entry.
    /// Lookups during the delay still find the dead worker and fail on it.
    pub async fn delete_service(&self, id: &str) -> Result<(), CallError> {
        let worker = self.dispatch(id).ok_or_else(|| CallError::NotFound(id.to_owned()))?;
        worker.kill();
        info!(service_id = id, worker_id = worker.worker_id(), "service terminated");

        tokio::time::sleep(self.config.delete_grace).await;
        self.workers
            .remove_if(id, |_, current| current.worker_id() == worker.worker_id());
        debug!(service_id = id, "service removed");
        Ok(())
    }

    pub fn dispatch(&self, id: &str) -> Option<Arc<WorkerHandle>> {
        self.workers.get(id).map(|w| Arc::clone(w.value()))
    }

    /// Typed client for the worker registered under `id`.
    pub fn client(&self, id: &str) -> Result<ServiceClient, CallError> {
        self.dispatch(id)
            .map(|worker| ServiceClient::new(worker, self.config.call_timeout))
            .ok_or_else(|| CallError::NotFound(id.to_owned()))
    }

    /// Kill every worker. Shutdown only.
    pub fn dispose_all(&self) {
        let count = self.workers.len();
        for worker in self.workers.iter() {
            worker.kill();
        }
        self.workers.clear();
        info!(count, "all services disposed");
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

async fn initialize(worker: Arc<WorkerHandle>, options: OpenOptions, config: RegistryConfig) {
    let service_id = worker.service_id().to_owned();
    if let Err(e) = worker.wait_ready(config.startup_timeout).await {
        error!(%service_id, error = %e, "worker never became ready");
        return;
    }
    match ServiceClient::new(worker, config.call_timeout).open(options).await {
        Ok(info) => info!(%service_id, state = %info.state, "service opened"),
        Err(e) => warn!(%service_id, code = e.code(), error = %e, "service open failed"),
    }
}

/// Drop a worker that died on its own so the id can be created again.
async fn watch_exit(registry: Weak<WorkerRegistry>, worker: Arc<WorkerHandle>) {
    worker.exited().await;
    if worker.is_killed() {
        return;
    }
    let Some(registry) = registry.upgrade() else {
        return;
    };
    let removed = registry
        .workers
        .remove_if(worker.service_id(), |_, current| current.worker_id() == worker.worker_id())
        .is_some();
    if removed {
        warn!(service_id = worker.service_id(), worker_id = worker.worker_id(), "worker exited unexpectedly; deregistered");
    }
}
