// src/main.rs

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use smarthub::backend::HttpBackend;
use smarthub::config::{ConfigManagerType, EnvConfigManager, HubSettings};
use smarthub::flow::FlowEngine;
use smarthub::hub::Hub;
use smarthub::logger;
use smarthub::plugin::{PluginDeps, PluginManager};
use smarthub::radio::{BleRadio, RadioScheduler, RadioTransport};

#[derive(Parser, Debug)]
#[command(name = "smarthub", version, about = "Home automation gateway hub")]
struct Cli {
    /// Override the hub serial number from the environment.
    #[arg(long)]
    serial_number: Option<String>,

    /// Log level when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Also write logs to daily files in this directory.
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Heartbeat period in seconds.
    #[arg(long)]
    period: Option<u64>,

    /// Comma-separated plugin list, e.g. "onio,sonos".
    #[arg(long)]
    plugins: Option<String>,

    /// Path to a dotenv file.
    #[arg(long)]
    env_file: Option<PathBuf>,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = logger::init_tracing(&cli.log_level, cli.log_dir.as_deref())?;

    let config: Arc<dyn ConfigManagerType> =
        Arc::new(EnvConfigManager::with_env_file(cli.env_file.as_deref()));
    if let Some(serial) = &cli.serial_number {
        config.set("HUB_SERIAL_NO", serial).await;
    }
    if let Some(period) = cli.period {
        config.set("HUB_LOOP_PERIOD_SECS", &period.to_string()).await;
    }
    if let Some(plugins) = &cli.plugins {
        config.set("HUB_PLUGINS", plugins).await;
    }
    let settings = Arc::new(
        HubSettings::load(config.as_ref())
            .await
            .context("loading hub settings")?,
    );

    let radio: Option<Arc<dyn RadioTransport>> = if settings.needs_radio() {
        let radio = BleRadio::new()
            .await
            .context("initialising bluetooth radio")?;
        Some(Arc::new(radio))
    } else {
        warn!("no BLE plugin configured, radio disabled");
        None
    };

    let backend = Arc::new(HttpBackend::new(
        &settings.server_url,
        &settings.serial_no,
        &settings.app_id,
        &settings.app_secret,
        settings.http_timeout,
    )?);
    let flow = FlowEngine::new();
    let plugins = Arc::new(PluginManager::new(PluginDeps {
        flow: flow.clone(),
        backend: backend.clone(),
        radio,
        scheduler: RadioScheduler::new(),
        settings: settings.clone(),
    }));

    let hub = Hub::new(settings, config, backend, flow, plugins);
    hub.run().await?;
    info!("goodbye");
    Ok(())
}
