use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::info;
use veil_browser::LaunchOptions;
use veil_common::observability::{self, TelemetryOptions};
use veil_config::{VeilConfig, VeilConfigLoader};
use veil_mediator::{Mediator, MediatorConfig};
use veil_server::{ControlServer, ProjectStore};

/// Interactive HTTP interception and replay workbench.
#[derive(Parser)]
#[command(name = "veil")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(long, default_value = "veil.yaml")]
    config: PathBuf,

    /// Override the control channel listen address.
    #[arg(long)]
    listen: Option<String>,

    /// Run the browser without a visible window.
    #[arg(long)]
    headless: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut cfg: VeilConfig = VeilConfigLoader::new()
        .with_optional_file(&cli.config)
        .load()?;
    if let Some(listen) = cli.listen {
        cfg.control.listen = listen;
    }
    if cli.headless {
        cfg.browser.headless = true;
    }

    let _telemetry = observability::init(TelemetryOptions {
        stderr: true,
        ..TelemetryOptions::default()
    })?;

    let (events_tx, _) = broadcast::channel(1024);

    let mediator = Arc::new(Mediator::new(
        MediatorConfig {
            launch: LaunchOptions {
                binary: cfg.browser.binary.clone(),
                headless: cfg.browser.headless,
                window: (cfg.browser.window_width, cfg.browser.window_height),
            },
            replay_timeout: Duration::from_secs(cfg.replay.timeout_secs),
        },
        events_tx.clone(),
    )?);

    let projects_dir = cfg
        .projects
        .dir
        .clone()
        .unwrap_or_else(default_projects_dir);
    let store = Arc::new(ProjectStore::new(projects_dir)?);

    let cancel = CancellationToken::new();
    let server = ControlServer::new(
        cfg.control.listen.clone(),
        mediator.clone(),
        store,
        events_tx,
        cancel.clone(),
    );
    let server_task = tokio::spawn(async move { server.run().await });

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    cancel.cancel();
    mediator.shutdown().await;
    server_task.await??;
    Ok(())
}

fn default_projects_dir() -> PathBuf {
    if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home)
            .join(".local")
            .join("share")
            .join("veil")
            .join("projects")
    } else {
        PathBuf::from(".").join("veil").join("projects")
    }
}
