// src/plugin/emulator.rs
//
// Virtual sensor for development without hardware. Produces wave-shaped
// telemetry so backend graphs look plausible, and pushes it through the same
// registry/flow/backend path a real plugin would use.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Timelike, Utc};
use rand::Rng;
use serde_json::{Map, Value, json};
use tracing::debug;

use crate::backend::Backend;
use crate::device::{Device, DeviceRegistry};
use crate::flow::FlowEngine;

use super::{Plugin, PluginDeps, PluginError, Pollable, Protocol, Scannable};

pub struct EmulatorPlugin {
    registry: Arc<DeviceRegistry>,
    flow: Arc<FlowEngine>,
    backend: Arc<dyn Backend>,
    mac_address: String,
    busy: AtomicBool,
}

/// Stable fake MAC derived from the hub serial, so the backend sees the
/// same emulated device across restarts.
fn derive_mac(serial_no: &str) -> String {
    let mut hasher = DefaultHasher::new();
    serial_no.hash(&mut hasher);
    let bytes = hasher.finish().to_be_bytes();
    format!(
        "02:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4]
    )
}

/// Slow daily wave plus jitter, bounded to a plausible range.
fn wave_sample(base: f64, amplitude: f64, jitter: f64) -> f64 {
    let now = Utc::now();
    let seconds = f64::from(now.num_seconds_from_midnight());
    let phase = seconds / 86_400.0 * std::f64::consts::TAU;
    let noise = rand::rng().random_range(-jitter..=jitter);
    let value = base + amplitude * phase.sin() + noise;
    (value * 100.0).round() / 100.0
}

fn telemetry() -> Map<String, Value> {
    let mut fields = Map::new();
    fields.insert(
        "temperature".to_string(),
        json!(wave_sample(21.0, 4.0, 0.3)),
    );
    fields.insert("humidity".to_string(), json!(wave_sample(45.0, 10.0, 1.0)));
    fields.insert(
        "battery".to_string(),
        json!(rand::rng().random_range(80..=100)),
    );
    fields
}

impl EmulatorPlugin {
    pub fn new(deps: &PluginDeps) -> Self {
        Self {
            registry: Arc::new(DeviceRegistry::new()),
            flow: deps.flow.clone(),
            backend: deps.backend.clone(),
            mac_address: derive_mac(&deps.settings.serial_no),
            busy: AtomicBool::new(false),
        }
    }

    fn register_self(&self) {
        self.registry.upsert(Device {
            mac_address: self.mac_address.clone(),
            device_name: "emulated sensor".to_string(),
            manufacturer: "virtual".to_string(),
            model_no: "null-1".to_string(),
            serial_no: self.mac_address.replace(':', ""),
            com_protocol: "virtual".to_string(),
            firmware: "0.0.0".to_string(),
            ..Device::default()
        });
    }
}

#[async_trait]
impl Plugin for EmulatorPlugin {
    fn name(&self) -> &'static str {
        "emulator"
    }

    fn protocol(&self) -> Protocol {
        Protocol::Wifi
    }

    fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    async fn start(&self) -> Result<(), PluginError> {
        self.register_self();
        Ok(())
    }

    async fn stop(&self) {}

    async fn execute(&self) {
        if self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("emulator round already running, skipping");
            return;
        }
        if let Err(err) = self.refresh().await {
            debug!(%err, "emulator refresh failed");
        }
        self.busy.store(false, Ordering::SeqCst);
    }

    fn scannable(&self) -> Option<&dyn Scannable> {
        Some(self)
    }

    fn pollable(&self) -> Option<&dyn Pollable> {
        Some(self)
    }
}

#[async_trait]
impl Scannable for EmulatorPlugin {
    async fn discover(&self, _duration: Duration) -> Result<usize, PluginError> {
        self.register_self();
        Ok(self.registry.len())
    }
}

#[async_trait]
impl Pollable for EmulatorPlugin {
    async fn refresh(&self) -> Result<(), PluginError> {
        let fields = telemetry();
        self.registry.record_data(&self.mac_address, fields.clone());
        if let Err(err) = self
            .backend
            .send_collected_data(&self.mac_address, &Value::Object(fields.clone()))
            .await
        {
            debug!(%err, "could not forward emulated data");
        }
        self.flow.receive_device_data(&self.mac_address, &fields).await;
        Ok(())
    }
}
