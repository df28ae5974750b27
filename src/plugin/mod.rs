// src/plugin/mod.rs
//
// Plugin runtime. Each supported device family is a compiled-in plugin that
// owns its device registry and implements whichever capability traits apply:
// `Scannable` (active discovery), `Controllable` (drives devices from flow
// nodes), `Pollable` (periodic reads).

pub mod emulator;
pub mod onio;
pub mod sonos;
pub mod xiaomi;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::backend::Backend;
use crate::config::HubSettings;
use crate::device::DeviceRegistry;
use crate::flow::FlowEngine;
use crate::radio::{RadioScheduler, RadioTransport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Ble,
    Wifi,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ble => write!(f, "BLE"),
            Self::Wifi => write!(f, "WiFi"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PluginKind {
    Onio,
    Xiaomi,
    Sonos,
    Emulator,
}

impl PluginKind {
    pub const ALL: [PluginKind; 4] = [Self::Onio, Self::Xiaomi, Self::Sonos, Self::Emulator];

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "onio" => Some(Self::Onio),
            "xiaomi" => Some(Self::Xiaomi),
            "sonos" => Some(Self::Sonos),
            "emulator" | "null" => Some(Self::Emulator),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Onio => "onio",
            Self::Xiaomi => "xiaomi",
            Self::Sonos => "sonos",
            Self::Emulator => "emulator",
        }
    }

    pub fn needs_radio(&self) -> bool {
        matches!(self, Self::Onio | Self::Xiaomi)
    }
}

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("unknown plugin: {0}")]
    Unknown(String),
    #[error("plugin {0} is already loaded")]
    AlreadyLoaded(&'static str),
    #[error("plugin {0} is not loaded")]
    NotLoaded(String),
    #[error("plugin {name} requires a radio but none is available")]
    RadioRequired { name: &'static str },
    #[error("radio error: {0}")]
    Radio(#[from] crate::radio::RadioError),
    #[error("backend error: {0}")]
    Backend(#[from] crate::backend::BackendError),
    #[error("{0}")]
    Other(String),
}

/// Everything a plugin may need, injected at construction.
#[derive(Clone)]
pub struct PluginDeps {
    pub flow: Arc<FlowEngine>,
    pub backend: Arc<dyn Backend>,
    /// Absent when the hub runs without BLE hardware.
    pub radio: Option<Arc<dyn RadioTransport>>,
    pub scheduler: RadioScheduler,
    pub settings: Arc<HubSettings>,
}

impl PluginDeps {
    fn require_radio(&self, name: &'static str) -> Result<Arc<dyn RadioTransport>, PluginError> {
        self.radio
            .clone()
            .ok_or(PluginError::RadioRequired { name })
    }
}

#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &'static str;
    fn protocol(&self) -> Protocol;
    fn registry(&self) -> &DeviceRegistry;

    /// Begin background work (scan loops, pollers). Must be idempotent.
    async fn start(&self) -> Result<(), PluginError>;
    /// Stop background work and release the radio. Bounded.
    async fn stop(&self);

    /// One round of the plugin's periodic duty. Implementations guard
    /// against overlapping rounds themselves.
    async fn execute(&self);

    /// Bind behaviors onto the flow nodes this plugin can drive.
    async fn associate_flow_nodes(&self) {}

    /// Log the plugin's current device inventory.
    fn display_devices(&self) {
        self.registry().display();
    }

    fn scannable(&self) -> Option<&dyn Scannable> {
        None
    }
    fn controllable(&self) -> Option<&dyn Controllable> {
        None
    }
    fn pollable(&self) -> Option<&dyn Pollable> {
        None
    }
}

/// Active device discovery on demand.
#[async_trait]
pub trait Scannable: Send + Sync {
    /// Returns the number of devices known after the pass.
    async fn discover(&self, duration: Duration) -> Result<usize, PluginError>;
}

/// Driving devices from flow node behaviors.
pub trait Controllable: Send + Sync {
    fn actions(&self) -> Vec<&'static str>;
}

/// Periodic sensor reads.
#[async_trait]
pub trait Pollable: Send + Sync {
    async fn refresh(&self) -> Result<(), PluginError>;
}

fn build(kind: PluginKind, deps: &PluginDeps) -> Result<Arc<dyn Plugin>, PluginError> {
    Ok(match kind {
        PluginKind::Onio => Arc::new(onio::OnioPlugin::new(deps)?),
        PluginKind::Xiaomi => Arc::new(xiaomi::XiaomiPlugin::new(deps)?),
        PluginKind::Sonos => Arc::new(sonos::SonosPlugin::new(deps)),
        PluginKind::Emulator => Arc::new(emulator::EmulatorPlugin::new(deps)),
    })
}

/// Owns the loaded plugins. Load and unload are driven by configuration at
/// startup and by backend commands at runtime.
pub struct PluginManager {
    deps: PluginDeps,
    plugins: DashMap<PluginKind, Arc<dyn Plugin>>,
}

impl PluginManager {
    pub fn new(deps: PluginDeps) -> Self {
        Self {
            deps,
            plugins: DashMap::new(),
        }
    }

    pub async fn load(&self, kind: PluginKind) -> Result<(), PluginError> {
        if self.plugins.contains_key(&kind) {
            return Err(PluginError::AlreadyLoaded(kind.name()));
        }
        let plugin = build(kind, &self.deps)?;
        plugin.start().await?;
        info!(plugin = plugin.name(), protocol = %plugin.protocol(), "plugin loaded");
        self.plugins.insert(kind, plugin);
        Ok(())
    }

    pub async fn load_by_name(&self, name: &str) -> Result<(), PluginError> {
        let kind =
            PluginKind::from_name(name).ok_or_else(|| PluginError::Unknown(name.to_string()))?;
        self.load(kind).await
    }

    pub async fn unload_by_name(&self, name: &str) -> Result<(), PluginError> {
        let kind =
            PluginKind::from_name(name).ok_or_else(|| PluginError::Unknown(name.to_string()))?;
        let Some((_, plugin)) = self.plugins.remove(&kind) else {
            return Err(PluginError::NotLoaded(name.to_string()));
        };
        plugin.stop().await;
        info!(plugin = plugin.name(), "plugin unloaded");
        Ok(())
    }

    pub fn is_loaded(&self, kind: PluginKind) -> bool {
        self.plugins.contains_key(&kind)
    }

    pub fn loaded_kinds(&self) -> Vec<PluginKind> {
        self.plugins.iter().map(|e| *e.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Fire one execute round per plugin without waiting; a slow plugin must
    /// not stall the hub loop.
    pub fn execute_all(&self) {
        for entry in self.plugins.iter() {
            let plugin = entry.value().clone();
            tokio::spawn(async move {
                plugin.execute().await;
            });
        }
    }

    pub async fn associate_all(&self) {
        // Collect first; holding map shards across await points invites
        // deadlock with a concurrent load.
        let plugins: Vec<Arc<dyn Plugin>> =
            self.plugins.iter().map(|e| e.value().clone()).collect();
        for plugin in plugins {
            plugin.associate_flow_nodes().await;
        }
    }

    /// Run a discovery pass on every scannable plugin, then report the full
    /// inventory to the backend.
    pub async fn scan_all(&self, duration: Duration) {
        let plugins: Vec<Arc<dyn Plugin>> =
            self.plugins.iter().map(|e| e.value().clone()).collect();
        for plugin in &plugins {
            if let Some(scannable) = plugin.scannable() {
                match scannable.discover(duration).await {
                    Ok(count) => info!(plugin = plugin.name(), devices = count, "scan pass done"),
                    Err(err) => warn!(plugin = plugin.name(), %err, "scan pass failed"),
                }
            }
        }
        let devices = self.snapshot_devices();
        if let Err(err) = self.deps.backend.post_scan_results(&devices).await {
            warn!(%err, "failed to report scan results");
        }
    }

    pub fn snapshot_devices(&self) -> Vec<crate::device::Device> {
        self.plugins
            .iter()
            .flat_map(|e| e.value().registry().snapshot())
            .collect()
    }

    pub fn display_devices(&self) {
        for entry in self.plugins.iter() {
            let plugin = entry.value();
            info!(plugin = plugin.name(), devices = plugin.registry().len(), "inventory");
            plugin.display_devices();
        }
    }

    pub async fn stop_all(&self) {
        let plugins: Vec<Arc<dyn Plugin>> =
            self.plugins.iter().map(|e| e.value().clone()).collect();
        self.plugins.clear();
        futures::future::join_all(plugins.iter().map(|plugin| async move {
            debug!(plugin = plugin.name(), "stopping plugin");
            plugin.stop().await;
        }))
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plugin_names_round_trip() {
        for kind in PluginKind::ALL {
            assert_eq!(PluginKind::from_name(kind.name()), Some(kind));
        }
        assert_eq!(PluginKind::from_name("NULL"), Some(PluginKind::Emulator));
        assert_eq!(PluginKind::from_name("toaster"), None);
    }

    #[test]
    fn radio_requirement_matches_protocol() {
        assert!(PluginKind::Onio.needs_radio());
        assert!(PluginKind::Xiaomi.needs_radio());
        assert!(!PluginKind::Sonos.needs_radio());
        assert!(!PluginKind::Emulator.needs_radio());
    }
}
