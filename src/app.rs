// src/app.rs

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context as _, bail};
use serde::{Deserialize, Serialize};
use service_plugin::plugin_runtime;
use service_plugin::worker::{LaunchedWorker, ProcessLauncher, WorkerLauncher};
use service_slack::RuntimeSettings;
use strum_macros::{AsRefStr, Display, EnumString};
use tracing::{error, info};

use crate::config::Settings;
use crate::logger::Telemetry;
use crate::registry::{RegistryConfig, WorkerRegistry};
use crate::router::ActionRouter;

/// Which command loop this process runs. Fixed at start-up by a flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, AsRefStr, Display, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Master,
    Web,
    Service,
}

/// Flags a child needs to find the same configuration as its parent.
#[derive(Debug, Clone, Default)]
pub struct ChildArgs {
    args: Vec<String>,
}

impl ChildArgs {
    pub fn new(config: &Path, env_file: &Path) -> Self {
        Self {
            args: vec![
                "--config".to_string(),
                config.display().to_string(),
                "--env-file".to_string(),
                env_file.display().to_string(),
            ],
        }
    }

    fn for_role(&self, role: Role) -> Vec<String> {
        let mut args = vec!["--role".to_string(), role.to_string()];
        args.extend(self.args.iter().cloned());
        args
    }
}

/// The master: service workers behind a registry, one web worker in front.
/// Runs until Ctrl-C or until the web worker dies.
pub async fn run_master(settings: Settings, telemetry: Arc<Telemetry>, child_args: ChildArgs) -> anyhow::Result<()> {
    let service_launcher = ProcessLauncher::current_exe(child_args.for_role(Role::Service))
        .context("locating the current executable")?;
    let registry = WorkerRegistry::new(Arc::new(service_launcher), RegistryConfig::from(&settings));
    let router = Arc::new(ActionRouter::new(Arc::clone(&registry), telemetry));

    let web_launcher = ProcessLauncher::current_exe(child_args.for_role(Role::Web))
        .context("locating the current executable")?;
    let LaunchedWorker { pid, peer, inbound, kill } = web_launcher.launch("web")?;
    info!(?pid, port = settings.web.port, "master up; web worker started");

    let serving = tokio::spawn(Arc::clone(&router).serve_peer(peer.clone(), inbound));

    let web_died = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("waiting for Ctrl-C")?;
            info!("interrupted; shutting down");
            false
        }
        _ = peer.closed() => {
            error!("web worker exited; shutting down");
            true
        }
    };

    registry.dispose_all();
    kill.notify_one();
    serving.abort();

    if web_died {
        bail!("web worker exited unexpectedly");
    }
    Ok(())
}

/// A service worker: the Slack runtime on stdin/stdout.
pub async fn run_service(settings: Settings, service_id: Option<String>) -> anyhow::Result<()> {
    info!(service_id = service_id.as_deref().unwrap_or("?"), "service worker starting");
    let runtime = RuntimeSettings {
        directory_refresh: settings.service.directory_refresh(),
        reconnect_backoff: settings.service.reconnect_backoff(),
    };
    plugin_runtime::run(service_slack::slack_service(runtime)).await
}
