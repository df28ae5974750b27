// src/device.rs

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};

/// Most recent payload received from a device, with arrival time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LastData {
    pub payload: Map<String, Value>,
    pub received: DateTime<Utc>,
}

/// A device known to the hub, keyed by MAC address.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Device {
    pub mac_address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    pub device_name: String,
    pub manufacturer: String,
    pub model_no: String,
    pub serial_no: String,
    pub com_protocol: String,
    pub firmware: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_data: Option<LastData>,
}

/// Concurrent inventory of discovered devices. Plugins insert and update
/// entries; the hub reads them for scan reports and display.
#[derive(Default)]
pub struct DeviceRegistry {
    devices: DashMap<String, Device>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert the device on first sighting; on later sightings refresh the
    /// descriptive fields while keeping accumulated state.
    pub fn upsert(&self, device: Device) {
        match self.devices.get_mut(&device.mac_address) {
            Some(mut existing) => {
                existing.ip = device.ip.or(existing.ip.take());
                existing.device_name = device.device_name;
                existing.firmware = device.firmware;
                if device.device_description.is_some() {
                    existing.device_description = device.device_description;
                }
            }
            None => {
                info!(mac = %device.mac_address, name = %device.device_name, "new device discovered");
                self.devices.insert(device.mac_address.clone(), device);
            }
        }
    }

    /// Attach a fresh payload to an already-known device. Unknown MACs are
    /// ignored; discovery is the plugin's job.
    pub fn record_data(&self, mac_address: &str, payload: Map<String, Value>) {
        match self.devices.get_mut(mac_address) {
            Some(mut device) => {
                device.last_data = Some(LastData {
                    payload,
                    received: Utc::now(),
                });
            }
            None => debug!(mac = %mac_address, "data for unknown device dropped"),
        }
    }

    pub fn get(&self, mac_address: &str) -> Option<Device> {
        self.devices.get(mac_address).map(|d| d.clone())
    }

    pub fn contains(&self, mac_address: &str) -> bool {
        self.devices.contains_key(mac_address)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn snapshot(&self) -> Vec<Device> {
        self.devices.iter().map(|d| d.clone()).collect()
    }

    pub fn display(&self) {
        for device in self.devices.iter() {
            info!(
                mac = %device.mac_address,
                name = %device.device_name,
                model = %device.model_no,
                protocol = %device.com_protocol,
                firmware = %device.firmware,
                "device"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample(mac: &str) -> Device {
        Device {
            mac_address: mac.to_string(),
            device_name: "button".to_string(),
            manufacturer: "ONiO".to_string(),
            model_no: "onio-1".to_string(),
            serial_no: mac.replace(':', ""),
            com_protocol: "BLE".to_string(),
            firmware: "1.0.0".to_string(),
            ..Device::default()
        }
    }

    #[test]
    fn upsert_creates_then_updates_in_place() {
        let registry = DeviceRegistry::new();
        registry.upsert(sample("aa:bb"));
        assert_eq!(registry.len(), 1);

        let mut updated = sample("aa:bb");
        updated.firmware = "1.1.0".to_string();
        updated.ip = Some("10.0.0.9".to_string());
        registry.upsert(updated);

        assert_eq!(registry.len(), 1);
        let device = registry.get("aa:bb").unwrap();
        assert_eq!(device.firmware, "1.1.0");
        assert_eq!(device.ip.as_deref(), Some("10.0.0.9"));
    }

    #[test]
    fn upsert_keeps_known_ip_when_update_has_none() {
        let registry = DeviceRegistry::new();
        let mut first = sample("aa:bb");
        first.ip = Some("10.0.0.9".to_string());
        registry.upsert(first);
        registry.upsert(sample("aa:bb"));
        assert_eq!(registry.get("aa:bb").unwrap().ip.as_deref(), Some("10.0.0.9"));
    }

    #[test]
    fn record_data_requires_a_known_device() {
        let registry = DeviceRegistry::new();
        registry.record_data("aa:bb", Map::new());
        assert!(registry.get("aa:bb").is_none());

        registry.upsert(sample("aa:bb"));
        let mut payload = Map::new();
        payload.insert("button_state".to_string(), json!(1));
        registry.record_data("aa:bb", payload);

        let last = registry.get("aa:bb").unwrap().last_data.unwrap();
        assert_eq!(last.payload.get("button_state"), Some(&json!(1)));
    }
}
