// src/plugin/onio.rs
//
// ONiO battery-free BLE devices. They only ever advertise, so the plugin is
// a scan supervisor feeding decoded frames into the registry and the flow.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::advert;
use crate::backend::Backend;
use crate::device::{Device, DeviceRegistry};
use crate::flow::FlowEngine;
use crate::radio::Advertisement;
use crate::scan::{AdvertisementHandler, ScanSupervisor};

use super::{Plugin, PluginDeps, PluginError, Protocol, Scannable};

pub struct OnioPlugin {
    registry: Arc<DeviceRegistry>,
    supervisor: Arc<ScanSupervisor>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

/// Turns matching advertisements into registry entries and flow events.
struct OnioSink {
    registry: Arc<DeviceRegistry>,
    flow: Arc<FlowEngine>,
    backend: Arc<dyn Backend>,
}

#[async_trait]
impl AdvertisementHandler for OnioSink {
    fn matches(&self, advertisement: &Advertisement) -> bool {
        advert::matches_filter(&advertisement.manufacturer_data)
    }

    async fn handle(&self, advertisement: Advertisement) {
        let Some(event) = advert::decode(&advertisement.manufacturer_data, advertisement.rssi)
        else {
            debug!(address = %advertisement.address, "frame matched filter but failed to decode");
            return;
        };
        let mac = advertisement.address;

        self.registry.upsert(Device {
            mac_address: mac.clone(),
            device_name: advertisement
                .local_name
                .unwrap_or_else(|| event.kind.label()),
            manufacturer: "ONiO".to_string(),
            model_no: "onio-1".to_string(),
            serial_no: mac.replace(':', ""),
            com_protocol: "BLE".to_string(),
            firmware: "1.0.0".to_string(),
            ..Device::default()
        });
        self.registry.record_data(&mac, event.fields.clone());

        if let Err(err) = self
            .backend
            .send_collected_data(&mac, &serde_json::Value::Object(event.fields.clone()))
            .await
        {
            debug!(%err, "could not forward decoded frame to backend");
        }
        self.flow.receive_device_data(&mac, &event.fields).await;
    }
}

impl OnioPlugin {
    pub fn new(deps: &PluginDeps) -> Result<Self, PluginError> {
        let radio = deps.require_radio("onio")?;
        let registry = Arc::new(DeviceRegistry::new());
        let sink = Arc::new(OnioSink {
            registry: registry.clone(),
            flow: deps.flow.clone(),
            backend: deps.backend.clone(),
        });
        let supervisor = ScanSupervisor::new(
            deps.settings.scan.clone(),
            radio,
            deps.scheduler.clone(),
            sink,
        );
        Ok(Self {
            registry,
            supervisor,
            loop_handle: Mutex::new(None),
        })
    }
}

#[async_trait]
impl Plugin for OnioPlugin {
    fn name(&self) -> &'static str {
        "onio"
    }

    fn protocol(&self) -> Protocol {
        Protocol::Ble
    }

    fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    async fn start(&self) -> Result<(), PluginError> {
        let mut handle = self.loop_handle.lock().await;
        if handle.is_none() {
            *handle = Some(self.supervisor.spawn());
        }
        Ok(())
    }

    async fn stop(&self) {
        let handle = self.loop_handle.lock().await.take();
        match handle {
            Some(handle) => {
                self.supervisor
                    .shutdown(handle, Duration::from_secs(5))
                    .await;
            }
            None => self.supervisor.stop(),
        }
    }

    /// The scan loop runs continuously; the periodic round has nothing extra
    /// to do.
    async fn execute(&self) {}

    fn scannable(&self) -> Option<&dyn Scannable> {
        Some(self)
    }
}

#[async_trait]
impl Scannable for OnioPlugin {
    async fn discover(&self, _duration: Duration) -> Result<usize, PluginError> {
        // One extra cycle on demand; the background loop keeps its cadence.
        self.supervisor.scan_cycle().await?;
        Ok(self.registry.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    use crate::backend::{BackendError, HubCommand};
    use crate::flow::FlowDefinition;

    struct NullBackend {
        collected: StdMutex<Vec<(String, Value)>>,
    }

    #[async_trait]
    impl Backend for NullBackend {
        async fn authenticate(&self) -> Result<(), BackendError> {
            Ok(())
        }
        async fn set_location(&self, _: f64, _: f64) -> Result<(), BackendError> {
            Ok(())
        }
        async fn get_flow(&self) -> Result<FlowDefinition, BackendError> {
            Ok(FlowDefinition::default())
        }
        async fn ping(&self) -> Result<HubCommand, BackendError> {
            Ok(HubCommand::None)
        }
        async fn post_scan_results(&self, _: &[Device]) -> Result<(), BackendError> {
            Ok(())
        }
        async fn send_collected_data(&self, mac: &str, data: &Value) -> Result<(), BackendError> {
            self.collected
                .lock()
                .unwrap()
                .push((mac.to_string(), data.clone()));
            Ok(())
        }
    }

    fn advertisement(payload: &[u8]) -> Advertisement {
        let mut manufacturer_data = HashMap::new();
        manufacturer_data.insert(0x1234u16, payload.to_vec());
        Advertisement {
            address: "aa:bb:cc:dd:ee:ff".to_string(),
            local_name: None,
            rssi: Some(-55),
            manufacturer_data,
            service_uuids: Vec::new(),
        }
    }

    fn sink() -> (OnioSink, Arc<DeviceRegistry>, Arc<FlowEngine>) {
        let registry = Arc::new(DeviceRegistry::new());
        let flow = FlowEngine::new();
        let sink = OnioSink {
            registry: registry.clone(),
            flow: flow.clone(),
            backend: Arc::new(NullBackend {
                collected: StdMutex::new(Vec::new()),
            }),
        };
        (sink, registry, flow)
    }

    #[tokio::test]
    async fn decoded_frame_lands_in_registry_and_flow() {
        let (sink, registry, flow) = sink();

        let def: FlowDefinition = serde_json::from_value(json!({
            "md5_out": "x",
            "flow": {
                "1": {
                    "id": 1,
                    "data": {"type": "device", "node": "button", "mac_address": "aa:bb:cc:dd:ee:ff"},
                    "inputs": {},
                    "outputs": {},
                },
            },
        }))
        .unwrap();
        flow.set_flow(&def).await.unwrap();

        sink.handle(advertisement(&[0xFE, 0xE5, 0xBB, 0x01, 0x00, 0x00, 0x80]))
            .await;

        let device = registry.get("aa:bb:cc:dd:ee:ff").unwrap();
        assert_eq!(device.manufacturer, "ONiO");
        assert_eq!(device.serial_no, "aabbccddeeff");
        let last = device.last_data.unwrap();
        assert_eq!(last.payload.get("button_state"), Some(&json!(1)));
        assert_eq!(last.payload.get("z_acceleration"), Some(&json!(-128)));

        let nodes = flow.nodes().await;
        let node = nodes.iter().find(|n| n.node_id == 1).unwrap();
        assert_eq!(node.snapshot().await.get("button_state"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn undecodable_frame_is_dropped() {
        let (sink, registry, _) = sink();
        sink.handle(advertisement(&[0xFE, 0xE5])).await;
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn local_name_wins_over_kind_label() {
        let (sink, registry, _) = sink();
        let mut ad = advertisement(&[0xFE, 0xE5, 0xCC, 0x01, 80]);
        ad.local_name = Some("kitchen switch".to_string());
        sink.handle(ad).await;
        assert_eq!(
            registry.get("aa:bb:cc:dd:ee:ff").unwrap().device_name,
            "kitchen switch"
        );
    }
}
