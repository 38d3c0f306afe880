use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use slackmux::app::{self, ChildArgs, Role};
use slackmux::config::Settings;
use slackmux::logger::Telemetry;
use slackmux::web;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "slackmux", about = "Multi-process Slack bot service multiplexer", version)]
struct Cli {
    /// Which command loop to run: master, web or service
    #[arg(long, env = "SLACKMUX_ROLE", default_value = "master")]
    role: Role,

    /// JSON settings file; the environment is used when it does not exist
    #[arg(long, default_value = "settings.json")]
    config: PathBuf,

    /// .env file loaded before reading the environment
    #[arg(long, default_value = ".env")]
    env_file: PathBuf,

    /// Service this worker hosts (set by the master)
    #[arg(long)]
    service_id: Option<String>,
}

/// Log the panic, then exit: a half-dead worker is worse than a dead one.
fn install_panic_hook() {
    std::panic::set_hook(Box::new(|panic| {
        error!(%panic, "uncaught panic; exiting");
        std::process::exit(1);
    }));
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let (settings, origin) = Settings::load(&cli.config, &cli.env_file)
        .await
        .context("loading configuration")?;

    let telemetry = Arc::new(Telemetry::init(cli.role.as_ref(), &settings.logger)?);
    install_panic_hook();
    info!(role = %cli.role, config = %origin, "slackmux starting");

    let result = match cli.role {
        Role::Master => {
            let child_args = ChildArgs::new(&cli.config, &cli.env_file);
            app::run_master(settings, Arc::clone(&telemetry), child_args).await
        }
        Role::Web => web::run(settings).await,
        Role::Service => app::run_service(settings, cli.service_id).await,
    };

    if let Err(e) = &result {
        error!(role = %cli.role, error = %format!("{e:#}"), "exiting with an error");
    } else {
        info!(role = %cli.role, "exiting");
    }
    telemetry.shutdown();
    result
}
