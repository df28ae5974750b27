// src/hub.rs
//
// The hub controller: startup handshake with the backend, then a heartbeat
// loop that executes plugins, refreshes the flow periodically and dispatches
// commands the server piggybacks on ping responses.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::backend::{Backend, HubCommand};
use crate::config::{ConfigManagerType, HubSettings};
use crate::flow::{FlowEngine, FlowError};
use crate::plugin::PluginManager;

pub struct Hub {
    settings: Arc<HubSettings>,
    config: Arc<dyn ConfigManagerType>,
    backend: Arc<dyn Backend>,
    flow: Arc<FlowEngine>,
    plugins: Arc<PluginManager>,
}

/// Outcome of one loop iteration.
enum LoopStep {
    Continue,
    Reboot,
}

impl Hub {
    pub fn new(
        settings: Arc<HubSettings>,
        config: Arc<dyn ConfigManagerType>,
        backend: Arc<dyn Backend>,
        flow: Arc<FlowEngine>,
        plugins: Arc<PluginManager>,
    ) -> Self {
        Self {
            settings,
            config,
            backend,
            flow,
            plugins,
        }
    }

    pub async fn startup(&self) -> Result<()> {
        info!(serial = %self.settings.serial_no, "hub starting");

        // Offline start is allowed; the loop retries on every heartbeat.
        if let Err(err) = self.backend.authenticate().await {
            warn!(%err, "authentication failed, starting offline");
        }
        if let Err(err) = self
            .backend
            .set_location(self.settings.latitude, self.settings.longitude)
            .await
        {
            warn!(%err, "could not push hub location");
        }

        for kind in &self.settings.plugins {
            self.plugins
                .load(*kind)
                .await
                .with_context(|| format!("loading plugin {}", kind.name()))?;
        }

        if self.settings.auto_scan {
            self.plugins.scan_all(Duration::from_secs(5)).await;
        }

        self.refresh_flow().await;
        Ok(())
    }

    /// Fetch the latest flow and rebind behaviors when it changed.
    async fn refresh_flow(&self) {
        let definition = match self.backend.get_flow().await {
            Ok(definition) => definition,
            Err(err) => {
                warn!(%err, "could not fetch flow");
                return;
            }
        };
        match self.flow.set_flow(&definition).await {
            Ok(true) => {
                self.flow.describe().await;
                self.plugins.associate_all().await;
            }
            Ok(false) => debug!("flow unchanged"),
            Err(FlowError::EmptyDefinition) => debug!("server has no flow configured"),
            Err(err) => warn!(%err, "rejected flow definition, keeping previous"),
        }
    }

    /// Write the current plugin set back so a restart comes up with the
    /// same plugins the server last requested.
    async fn persist_plugin_set(&self) {
        let names: Vec<&str> = self
            .plugins
            .loaded_kinds()
            .into_iter()
            .map(|k| k.name())
            .collect();
        self.config.set("HUB_PLUGINS", &names.join(",")).await;
    }

    async fn dispatch(&self, command: HubCommand) -> LoopStep {
        match command {
            HubCommand::None => {}
            HubCommand::Scan => {
                info!("server requested a device scan");
                self.plugins.scan_all(Duration::from_secs(5)).await;
                self.plugins.display_devices();
                self.plugins.associate_all().await;
            }
            HubCommand::Reboot => {
                info!("server requested a reboot");
                return LoopStep::Reboot;
            }
            HubCommand::LoadPlugin(name) => {
                match self.plugins.load_by_name(&name).await {
                    Ok(()) => {
                        self.plugins.associate_all().await;
                        self.persist_plugin_set().await;
                    }
                    Err(err) => warn!(plugin = %name, %err, "load command failed"),
                }
            }
            HubCommand::UnloadPlugin(name) => {
                match self.plugins.unload_by_name(&name).await {
                    Ok(()) => self.persist_plugin_set().await,
                    Err(err) => warn!(plugin = %name, %err, "unload command failed"),
                }
            }
        }
        LoopStep::Continue
    }

    pub async fn run(&self) -> Result<()> {
        self.startup().await?;

        let mut cycles: u32 = 0;
        loop {
            self.plugins.execute_all();
            self.flow.execute_flow().await;

            cycles = cycles.wrapping_add(1);
            if self.settings.flow_refresh_cycles > 0
                && cycles % self.settings.flow_refresh_cycles == 0
            {
                self.refresh_flow().await;
            }

            match self.backend.ping().await {
                Ok(command) => {
                    if matches!(self.dispatch(command).await, LoopStep::Reboot) {
                        break;
                    }
                }
                Err(err) => {
                    debug!(%err, "ping failed, retrying authentication");
                    if let Err(err) = self.backend.authenticate().await {
                        error!(%err, "re-authentication failed");
                    }
                }
            }

            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("interrupt received");
                    break;
                }
                _ = sleep(self.settings.loop_period) => {}
            }
        }

        self.shutdown().await;
        Ok(())
    }

    pub async fn shutdown(&self) {
        info!("hub shutting down");
        self.plugins.stop_all().await;
    }
}
