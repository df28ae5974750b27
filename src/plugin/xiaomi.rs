// src/plugin/xiaomi.rs
//
// Xiaomi Flower Care plant sensors. These are connectable GATT devices: a
// magic write to the access characteristic unlocks the live-data
// characteristic, which is then read and decoded.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tokio::time::sleep;
use tracing::{debug, warn};
use uuid::{Uuid, uuid};

use crate::backend::Backend;
use crate::device::{Device, DeviceRegistry};
use crate::flow::FlowEngine;
use crate::radio::{RadioScheduler, RadioTransport};

use super::{Plugin, PluginDeps, PluginError, Pollable, Protocol, Scannable};

const ACCESS_CHAR: Uuid = uuid!("00001a00-0000-1000-8000-00805f9b34fb");
const DATA_CHAR: Uuid = uuid!("00001a01-0000-1000-8000-00805f9b34fb");
const STATUS_CHAR: Uuid = uuid!("00001a02-0000-1000-8000-00805f9b34fb");
const ADVERTISED_SERVICE: Uuid = uuid!("0000fe95-0000-1000-8000-00805f9b34fb");

/// Written to the access characteristic before the data characteristic
/// returns live values.
const LIVE_DATA_MAGIC: [u8; 2] = [0xA0, 0x1F];

pub struct XiaomiPlugin {
    registry: Arc<DeviceRegistry>,
    radio: Arc<dyn RadioTransport>,
    scheduler: RadioScheduler,
    flow: Arc<FlowEngine>,
    backend: Arc<dyn Backend>,
    busy: AtomicBool,
}

/// Live-data characteristic layout, 16 bytes.
fn decode_live_data(raw: &[u8]) -> Option<Map<String, Value>> {
    if raw.len() < 10 {
        return None;
    }
    let mut fields = Map::new();
    let temperature = u16::from_le_bytes([raw[0], raw[1]]) as f64 / 10.0;
    let brightness = u32::from_le_bytes([raw[3], raw[4], raw[5], raw[6]]);
    fields.insert("temperature".to_string(), json!(temperature));
    fields.insert("brightness".to_string(), json!(brightness));
    fields.insert("moisture".to_string(), json!(raw[7]));
    fields.insert(
        "conductivity".to_string(),
        json!(u16::from_le_bytes([raw[8], raw[9]])),
    );
    Some(fields)
}

/// Status characteristic: battery level then firmware version string.
fn decode_status(raw: &[u8]) -> (Option<u8>, Option<String>) {
    let battery = raw.first().copied();
    let firmware = raw
        .get(2..7)
        .map(|b| String::from_utf8_lossy(b).trim_end_matches('\0').to_string());
    (battery, firmware)
}

impl XiaomiPlugin {
    pub fn new(deps: &PluginDeps) -> Result<Self, PluginError> {
        let radio = deps.require_radio("xiaomi")?;
        Ok(Self {
            registry: Arc::new(DeviceRegistry::new()),
            radio,
            scheduler: deps.scheduler.clone(),
            flow: deps.flow.clone(),
            backend: deps.backend.clone(),
            busy: AtomicBool::new(false),
        })
    }

    /// Unlock, read live data and status from one sensor. Holds the radio
    /// for the whole exchange. One retry on the unlock/read pair; these
    /// sensors drop the first connection fairly often.
    async fn read_sensor(&self, mac: &str) -> Result<Map<String, Value>, PluginError> {
        let _radio_slot = self.scheduler.acquire().await;

        let mut raw = Vec::new();
        for attempt in 0..2 {
            let result = async {
                self.radio
                    .write_gatt(mac, ACCESS_CHAR, &LIVE_DATA_MAGIC)
                    .await?;
                self.radio.read_gatt(mac, DATA_CHAR).await
            }
            .await;
            match result {
                Ok(bytes) => {
                    raw = bytes;
                    break;
                }
                Err(err) if attempt == 0 => {
                    debug!(%mac, %err, "sensor read failed, retrying once");
                    sleep(Duration::from_millis(500)).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
        let mut fields = decode_live_data(&raw)
            .ok_or_else(|| PluginError::Other(format!("short live-data read from {mac}")))?;

        match self.radio.read_gatt(mac, STATUS_CHAR).await {
            Ok(status) => {
                let (battery, firmware) = decode_status(&status);
                if let Some(battery) = battery {
                    fields.insert("battery".to_string(), json!(battery));
                }
                if let Some(firmware) = firmware {
                    fields.insert("firmware".to_string(), json!(firmware));
                }
            }
            Err(err) => debug!(%mac, %err, "status read failed, keeping live data"),
        }
        Ok(fields)
    }
}

#[async_trait]
impl Plugin for XiaomiPlugin {
    fn name(&self) -> &'static str {
        "xiaomi"
    }

    fn protocol(&self) -> Protocol {
        Protocol::Ble
    }

    fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    async fn start(&self) -> Result<(), PluginError> {
        Ok(())
    }

    async fn stop(&self) {}

    async fn execute(&self) {
        if self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("sensor round already running, skipping");
            return;
        }
        if let Err(err) = self.refresh().await {
            warn!(%err, "sensor refresh round failed");
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
impl Scannable for XiaomiPlugin {
    async fn discover(&self, duration: Duration) -> Result<usize, PluginError> {
        {
            let _radio_slot = self.scheduler.acquire().await;
            self.radio.start_scan().await?;
            sleep(duration).await;
            self.radio.stop_scan().await?;
        }
        for advertisement in self.radio.drain_advertisements().await? {
            let by_service = advertisement.service_uuids.contains(&ADVERTISED_SERVICE);
            let by_name = advertisement
                .local_name
                .as_deref()
                .is_some_and(|n| n.starts_with("Flower care"));
            if !(by_service || by_name) {
                continue;
            }
            self.registry.upsert(Device {
                mac_address: advertisement.address.clone(),
                device_name: advertisement
                    .local_name
                    .unwrap_or_else(|| "Flower care".to_string()),
                manufacturer: "Xiaomi".to_string(),
                model_no: "HHCCJCY01".to_string(),
                serial_no: advertisement.address.replace(':', ""),
                com_protocol: "BLE".to_string(),
                firmware: String::new(),
                ..Device::default()
            });
        }
        Ok(self.registry.len())
    }
}

#[async_trait]
impl Pollable for XiaomiPlugin {
    async fn refresh(&self) -> Result<(), PluginError> {
        for device in self.registry.snapshot() {
            let mac = device.mac_address;
            match self.read_sensor(&mac).await {
                Ok(fields) => {
                    if let Some(firmware) = fields.get("firmware").and_then(Value::as_str) {
                        let mut updated = self.registry.get(&mac).unwrap_or_default();
                        updated.mac_address = mac.clone();
                        updated.firmware = firmware.to_string();
                        self.registry.upsert(updated);
                    }
                    self.registry.record_data(&mac, fields.clone());
                    if let Err(err) = self
                        .backend
                        .send_collected_data(&mac, &Value::Object(fields.clone()))
                        .await
                    {
                        debug!(%err, "could not forward sensor data to backend");
                    }
                    self.flow.receive_device_data(&mac, &fields).await;
                }
                Err(err) => warn!(%mac, %err, "sensor read failed"),
            }
        }
        Ok(())
    }
}
