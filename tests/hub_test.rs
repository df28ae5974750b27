// tests/hub_test.rs
//
// End-to-end paths: a flow definition in the backend wire format drives the
// graph, and a scan cycle carries a vendor advertisement all the way into
// the registry and a flow node.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value, json};

use smarthub::backend::{Backend, BackendError, HubCommand};
use smarthub::device::Device;
use smarthub::flow::{FlowDefinition, FlowEngine};
use smarthub::node::{NodeBehavior, NodeError};
use smarthub::radio::{Advertisement, RadioError, RadioScheduler, RadioTransport};
use smarthub::scan::{AdvertisementHandler, ScanConfig, ScanSupervisor};

fn wire_definition() -> FlowDefinition {
    serde_json::from_value(json!({
        "id": "flow-42",
        "name": "button toggles light",
        "creation_date": "2024-03-01T10:00:00Z",
        "md5_out": "d41d8cd98f",
        "flow": {
            "1": {
                "id": 1,
                "data": {"type": "device", "node": "button", "mac_address": "aa:bb:cc:dd:ee:ff"},
                "inputs": {},
                "outputs": {"output_1": {"connections": [{"node": "2", "output": "input_1"}]}},
            },
            "2": {
                "id": 2,
                "data": {"type": "device", "node": "toggle", "mac_address": "11:22:33:44:55:66"},
                "inputs": {"input_1": {"connections": [{"node": 1, "input": "output_1"}]}},
                "outputs": {},
            },
        },
    }))
    .unwrap()
}

struct Toggle {
    calls: AtomicU32,
    seen: StdMutex<Vec<Map<String, Value>>>,
}

#[async_trait]
impl NodeBehavior for Toggle {
    fn name(&self) -> &str {
        "toggle"
    }
    async fn invoke(&self, data: &mut Map<String, Value>) -> Result<bool, NodeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(data.clone());
        Ok(true)
    }
}

#[tokio::test]
async fn device_event_runs_the_flow_once_with_merged_data() {
    let engine = FlowEngine::new();
    assert!(engine.set_flow(&wire_definition()).await.unwrap());

    let toggle = Arc::new(Toggle {
        calls: AtomicU32::new(0),
        seen: StdMutex::new(Vec::new()),
    });
    for node in engine.nodes().await {
        if node.node_id == 2 {
            node.bind(toggle.clone());
        }
    }

    let mut event = Map::new();
    event.insert("button_state".to_string(), json!(1));
    engine
        .receive_device_data("aa:bb:cc:dd:ee:ff", &event)
        .await;

    assert_eq!(toggle.calls.load(Ordering::SeqCst), 1);
    let seen = toggle.seen.lock().unwrap();
    assert_eq!(seen[0].get("button_state"), Some(&json!(1)));
    // The parent's mac_address overwrote the child's own on merge.
    assert_eq!(seen[0].get("mac_address"), Some(&json!("aa:bb:cc:dd:ee:ff")));
}

#[tokio::test]
async fn reapplying_the_same_definition_keeps_node_state() {
    let engine = FlowEngine::new();
    engine.set_flow(&wire_definition()).await.unwrap();

    let mut event = Map::new();
    event.insert("button_state".to_string(), json!(1));
    engine
        .receive_device_data("aa:bb:cc:dd:ee:ff", &event)
        .await;

    assert!(!engine.set_flow(&wire_definition()).await.unwrap());
    let nodes = engine.nodes().await;
    let root = nodes.iter().find(|n| n.node_id == 1).unwrap();
    assert_eq!(root.snapshot().await.get("button_state"), Some(&json!(1)));
}

struct OneFrameRadio {
    frame: Vec<u8>,
}

#[async_trait]
impl RadioTransport for OneFrameRadio {
    async fn start_scan(&self) -> Result<(), RadioError> {
        Ok(())
    }
    async fn stop_scan(&self) -> Result<(), RadioError> {
        Ok(())
    }
    async fn drain_advertisements(&self) -> Result<Vec<Advertisement>, RadioError> {
        let mut manufacturer_data = HashMap::new();
        manufacturer_data.insert(0x1234u16, self.frame.clone());
        Ok(vec![Advertisement {
            address: "aa:bb:cc:dd:ee:ff".to_string(),
            local_name: Some("button".to_string()),
            rssi: Some(-48),
            manufacturer_data,
            service_uuids: Vec::new(),
        }])
    }
    async fn reset(&self) -> Result<(), RadioError> {
        Ok(())
    }
    async fn read_gatt(&self, _: &str, _: uuid::Uuid) -> Result<Vec<u8>, RadioError> {
        Ok(Vec::new())
    }
    async fn write_gatt(&self, _: &str, _: uuid::Uuid, _: &[u8]) -> Result<(), RadioError> {
        Ok(())
    }
}

struct FlowSink {
    engine: Arc<FlowEngine>,
}

#[async_trait]
impl AdvertisementHandler for FlowSink {
    fn matches(&self, advertisement: &Advertisement) -> bool {
        smarthub::advert::matches_filter(&advertisement.manufacturer_data)
    }
    async fn handle(&self, advertisement: Advertisement) {
        let event =
            smarthub::advert::decode(&advertisement.manufacturer_data, advertisement.rssi)
                .expect("frame matched the filter");
        self.engine
            .receive_device_data(&advertisement.address, &event.fields)
            .await;
    }
}

#[tokio::test]
async fn scan_cycle_feeds_a_decoded_frame_into_the_flow() {
    let engine = FlowEngine::new();
    engine.set_flow(&wire_definition()).await.unwrap();

    let toggle = Arc::new(Toggle {
        calls: AtomicU32::new(0),
        seen: StdMutex::new(Vec::new()),
    });
    for node in engine.nodes().await {
        if node.node_id == 2 {
            node.bind(toggle.clone());
        }
    }

    let supervisor = ScanSupervisor::new(
        ScanConfig {
            scan_duration: Duration::from_millis(5),
            pause_duration: Duration::from_millis(5),
            ..ScanConfig::default()
        },
        Arc::new(OneFrameRadio {
            frame: vec![0xFE, 0xE5, 0xBB, 0x01, 0x00, 0x00, 0x80],
        }),
        RadioScheduler::new(),
        Arc::new(FlowSink {
            engine: engine.clone(),
        }),
    );

    let matched = supervisor.scan_cycle().await.unwrap();
    assert_eq!(matched, 1);

    assert_eq!(toggle.calls.load(Ordering::SeqCst), 1);
    let seen = toggle.seen.lock().unwrap();
    assert_eq!(seen[0].get("button_state"), Some(&json!(1)));
    assert_eq!(seen[0].get("z_acceleration"), Some(&json!(-128)));
    assert_eq!(seen[0].get("device_type"), Some(&json!("accelerometer-button")));
}

struct ScriptedBackend {
    commands: StdMutex<Vec<&'static str>>,
}

#[async_trait]
impl Backend for ScriptedBackend {
    async fn authenticate(&self) -> Result<(), BackendError> {
        Ok(())
    }
    async fn set_location(&self, _: f64, _: f64) -> Result<(), BackendError> {
        Ok(())
    }
    async fn get_flow(&self) -> Result<FlowDefinition, BackendError> {
        Ok(wire_definition())
    }
    async fn ping(&self) -> Result<HubCommand, BackendError> {
        let raw = self.commands.lock().unwrap().pop();
        Ok(HubCommand::parse(raw))
    }
    async fn post_scan_results(&self, _: &[Device]) -> Result<(), BackendError> {
        Ok(())
    }
    async fn send_collected_data(&self, _: &str, _: &Value) -> Result<(), BackendError> {
        Ok(())
    }
}

#[tokio::test]
async fn backend_commands_parse_from_ping_responses() {
    let backend = ScriptedBackend {
        commands: StdMutex::new(vec!["rebooting", "scan_devices"]),
    };
    assert_eq!(backend.ping().await.unwrap(), HubCommand::Scan);
    assert_eq!(backend.ping().await.unwrap(), HubCommand::Reboot);
    assert_eq!(backend.ping().await.unwrap(), HubCommand::None);
}
