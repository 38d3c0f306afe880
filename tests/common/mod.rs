#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::{Value, json};
use service_plugin::message::{OpenOptions, ServiceState};
use service_plugin::plugin_test_util::{InProcessLauncher, MockService};
use slackmux::registry::{RegistryConfig, WorkerRegistry};

pub fn test_config() -> RegistryConfig {
    RegistryConfig {
        call_timeout: Duration::from_millis(300),
        startup_timeout: Duration::from_secs(1),
        delete_grace: Duration::from_millis(50),
    }
}

pub fn options_json() -> Value {
    json!({
        "host": "pds.example",
        "token": "xoxb-1",
        "cell": "app",
        "username": "bot",
        "password": "secret",
        "path": "box/callbacks",
    })
}

pub fn options() -> OpenOptions {
    serde_json::from_value(options_json()).unwrap()
}

/// A registry over in-process mock workers, keeping a handle on each one.
pub struct MockFleet {
    pub launcher: Arc<InProcessLauncher<MockService>>,
    pub services: Arc<DashMap<String, MockService>>,
    pub registry: Arc<WorkerRegistry>,
}

impl MockFleet {
    pub fn new() -> Self {
        Self::with(|_| MockService::new())
    }

    pub fn with(make: impl Fn(&str) -> MockService + Send + Sync + 'static) -> Self {
        let services: Arc<DashMap<String, MockService>> = Arc::new(DashMap::new());
        let seen = Arc::clone(&services);
        let launcher = Arc::new(InProcessLauncher::new(move |id: &str| {
            let svc = make(id);
            seen.insert(id.to_owned(), svc.clone());
            svc
        }));
        let registry = WorkerRegistry::new(launcher.clone(), test_config());
        Self { launcher, services, registry }
    }

    pub fn service(&self, id: &str) -> MockService {
        self.services.get(id).map(|s| s.value().clone()).expect("no such mock service")
    }
}

/// Poll `query-info` until the service reports `state`.
pub async fn wait_for_state(registry: &WorkerRegistry, id: &str, state: ServiceState) {
    for _ in 0..100 {
        if let Ok(info) = registry.get_service(id).await {
            if info.state == state {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("service `{id}` never reached {state}");
}
