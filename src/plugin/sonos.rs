// src/plugin/sonos.rs
//
// Sonos speakers over WiFi. Discovery is SSDP multicast; control is SOAP
// against the speaker's UPnP services on port 1400. Flow nodes named after
// an action get a behavior bound that drives the matching speaker.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::device::{Device, DeviceRegistry};
use crate::node::{NodeBehavior, NodeError};

use super::{Controllable, Plugin, PluginDeps, PluginError, Protocol, Scannable};

const SSDP_ADDR: &str = "239.255.255.250:1900";
const SSDP_TARGET: &str = "urn:schemas-upnp-org:device:ZonePlayer:1";
const SOAP_PORT: u16 = 1400;

/// Transport state changes slowly; polling every heartbeat would hammer the
/// speakers for nothing.
const UPDATE_INTERVAL: Duration = Duration::from_secs(60);

const ACTIONS: [&str; 9] = [
    "play",
    "pause",
    "next",
    "previous",
    "volume",
    "mute",
    "unmute",
    "started-playing",
    "stopped-playing",
];

pub struct SonosPlugin {
    registry: Arc<DeviceRegistry>,
    client: reqwest::Client,
    flow: Arc<crate::flow::FlowEngine>,
    soap_port: u16,
    update_interval: Duration,
    busy: AtomicBool,
    last_refresh: StdMutex<Option<Instant>>,
}

/// Pull `<tag>…</tag>` out of loosely structured UPnP XML. The device
/// descriptions are small and flat, so no XML parser is needed.
fn extract_between<'a>(haystack: &'a str, tag: &str) -> Option<&'a str> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = haystack.find(&open)? + open.len();
    let end = haystack[start..].find(&close)? + start;
    Some(haystack[start..end].trim())
}

fn extract_header<'a>(response: &'a str, name: &str) -> Option<&'a str> {
    response.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        key.trim().eq_ignore_ascii_case(name).then(|| value.trim())
    })
}

fn location_host(location: &str) -> Option<String> {
    let rest = location.strip_prefix("http://")?;
    let host_port = rest.split('/').next()?;
    Some(host_port.split(':').next()?.to_string())
}

async fn soap_request(
    client: &reqwest::Client,
    ip: &str,
    port: u16,
    service: &str,
    action: &str,
    arguments: &str,
) -> Result<String, NodeError> {
    let body = format!(
        r#"<?xml version="1.0" encoding="utf-8"?>
<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/" s:encodingStyle="http://schemas.xmlsoap.org/soap/encoding/">
<s:Body><u:{action} xmlns:u="urn:schemas-upnp-org:service:{service}:1"><InstanceID>0</InstanceID>{arguments}</u:{action}></s:Body>
</s:Envelope>"#
    );
    let url = format!("http://{ip}:{port}/MediaRenderer/{service}/Control");
    let response = client
        .post(url)
        .header("Content-Type", "text/xml; charset=\"utf-8\"")
        .header(
            "SOAPACTION",
            format!("\"urn:schemas-upnp-org:service:{service}:1#{action}\""),
        )
        .body(body)
        .send()
        .await
        .map_err(|e| NodeError::DeviceUnreachable(e.to_string()))?;
    if !response.status().is_success() {
        return Err(NodeError::ExecutionFailed(format!(
            "speaker returned {}",
            response.status()
        )));
    }
    response
        .text()
        .await
        .map_err(|e| NodeError::ExecutionFailed(e.to_string()))
}

async fn transport_state(
    client: &reqwest::Client,
    ip: &str,
    port: u16,
) -> Result<String, NodeError> {
    let response = soap_request(client, ip, port, "AVTransport", "GetTransportInfo", "").await?;
    extract_between(&response, "CurrentTransportState")
        .map(str::to_string)
        .ok_or_else(|| NodeError::ExecutionFailed("no transport state in response".to_string()))
}

/// Behavior bound to a flow node; one per (speaker, action) pair.
struct SonosAction {
    client: reqwest::Client,
    ip: String,
    port: u16,
    action: &'static str,
}

#[async_trait]
impl NodeBehavior for SonosAction {
    fn name(&self) -> &str {
        self.action
    }

    async fn invoke(&self, data: &mut Map<String, Value>) -> Result<bool, NodeError> {
        match self.action {
            "play" | "pause" | "next" | "previous" => {
                let soap = match self.action {
                    "play" => "Play",
                    "pause" => "Pause",
                    "next" => "Next",
                    _ => "Previous",
                };
                let args = if soap == "Play" { "<Speed>1</Speed>" } else { "" };
                soap_request(&self.client, &self.ip, self.port, "AVTransport", soap, args).await?;
                Ok(true)
            }
            "volume" => {
                let level = data
                    .get("volume")
                    .and_then(Value::as_u64)
                    .ok_or_else(|| NodeError::InvalidInput("missing volume".to_string()))?
                    .min(100);
                let args = format!(
                    "<Channel>Master</Channel><DesiredVolume>{level}</DesiredVolume>"
                );
                soap_request(
                    &self.client,
                    &self.ip,
                    self.port,
                    "RenderingControl",
                    "SetVolume",
                    &args,
                )
                .await?;
                Ok(true)
            }
            "mute" | "unmute" => {
                let desired = if self.action == "mute" { 1 } else { 0 };
                let args = format!(
                    "<Channel>Master</Channel><DesiredMute>{desired}</DesiredMute>"
                );
                soap_request(
                    &self.client,
                    &self.ip,
                    self.port,
                    "RenderingControl",
                    "SetMute",
                    &args,
                )
                .await?;
                Ok(true)
            }
            "started-playing" => {
                let playing =
                    transport_state(&self.client, &self.ip, self.port).await? == "PLAYING";
                data.insert("playing".to_string(), json!(playing));
                Ok(playing)
            }
            "stopped-playing" => {
                let playing =
                    transport_state(&self.client, &self.ip, self.port).await? == "PLAYING";
                data.insert("playing".to_string(), json!(playing));
                Ok(!playing)
            }
            other => Err(NodeError::InvalidInput(format!("unknown action {other}"))),
        }
    }
}

impl SonosPlugin {
    pub fn new(deps: &PluginDeps) -> Self {
        Self {
            registry: Arc::new(DeviceRegistry::new()),
            client: reqwest::Client::new(),
            flow: deps.flow.clone(),
            soap_port: SOAP_PORT,
            update_interval: UPDATE_INTERVAL,
            busy: AtomicBool::new(false),
            last_refresh: StdMutex::new(None),
        }
    }

    async fn poll_speakers(&self) {
        for device in self.registry.snapshot() {
            let Some(ip) = device.ip else { continue };
            match transport_state(&self.client, &ip, self.soap_port).await {
                Ok(state) => {
                    let mut payload = Map::new();
                    payload.insert("playing".to_string(), json!(state == "PLAYING"));
                    payload.insert("transport_state".to_string(), json!(state));
                    self.registry
                        .record_data(&device.mac_address, payload.clone());
                    self.flow
                        .receive_device_data(&device.mac_address, &payload)
                        .await;
                }
                Err(err) => debug!(mac = %device.mac_address, %err, "transport poll failed"),
            }
        }
    }

    async fn ssdp_search(&self, duration: Duration) -> Result<Vec<String>, PluginError> {
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|e| PluginError::Other(format!("ssdp bind failed: {e}")))?;
        let request = format!(
            "M-SEARCH * HTTP/1.1\r\nHOST: {SSDP_ADDR}\r\nMAN: \"ssdp:discover\"\r\nMX: 2\r\nST: {SSDP_TARGET}\r\n\r\n"
        );
        socket
            .send_to(request.as_bytes(), SSDP_ADDR)
            .await
            .map_err(|e| PluginError::Other(format!("ssdp send failed: {e}")))?;

        let mut locations = Vec::new();
        let deadline = tokio::time::Instant::now() + duration;
        let mut buf = [0u8; 2048];
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            match timeout(remaining, socket.recv_from(&mut buf)).await {
                Ok(Ok((len, _))) => {
                    let response = String::from_utf8_lossy(&buf[..len]);
                    if let Some(location) = extract_header(&response, "LOCATION") {
                        if !locations.iter().any(|l| l == location) {
                            locations.push(location.to_string());
                        }
                    }
                }
                Ok(Err(err)) => {
                    debug!(%err, "ssdp receive error");
                    break;
                }
                Err(_) => break,
            }
        }
        Ok(locations)
    }

    async fn register_from_description(&self, location: &str) {
        let Some(ip) = location_host(location) else {
            debug!(%location, "unparseable ssdp location");
            return;
        };
        let xml = match self.client.get(location).send().await {
            Ok(response) => match response.text().await {
                Ok(text) => text,
                Err(err) => {
                    debug!(%err, "could not read device description");
                    return;
                }
            },
            Err(err) => {
                debug!(%err, "could not fetch device description");
                return;
            }
        };

        let mac = extract_between(&xml, "MACAddress")
            .map(|m| m.to_lowercase())
            .unwrap_or_else(|| format!("sonos-{ip}"));
        self.registry.upsert(Device {
            mac_address: mac,
            ip: Some(ip),
            device_name: extract_between(&xml, "roomName")
                .or_else(|| extract_between(&xml, "friendlyName"))
                .unwrap_or("Sonos")
                .to_string(),
            manufacturer: "Sonos".to_string(),
            model_no: extract_between(&xml, "modelNumber").unwrap_or("").to_string(),
            serial_no: extract_between(&xml, "serialNum").unwrap_or("").to_string(),
            com_protocol: "WiFi".to_string(),
            firmware: extract_between(&xml, "softwareVersion")
                .unwrap_or("")
                .to_string(),
            device_description: extract_between(&xml, "modelName").map(str::to_string),
            last_data: None,
        });
    }
}

#[async_trait]
impl Plugin for SonosPlugin {
    fn name(&self) -> &'static str {
        "sonos"
    }

    fn protocol(&self) -> Protocol {
        Protocol::Wifi
    }

    fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    async fn start(&self) -> Result<(), PluginError> {
        Ok(())
    }

    async fn stop(&self) {}

    /// Poll every known speaker's transport state so flows triggered from
    /// playback changes have fresh data. At most one round runs at a time,
    /// and rounds closer together than the update interval are skipped.
    async fn execute(&self) {
        if self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("speaker poll already running, skipping");
            return;
        }
        let due = {
            let mut last = self.last_refresh.lock().unwrap();
            match *last {
                Some(at) if at.elapsed() < self.update_interval => false,
                _ => {
                    *last = Some(Instant::now());
                    true
                }
            }
        };
        if due {
            self.poll_speakers().await;
        }
        self.busy.store(false, Ordering::SeqCst);
    }

    async fn associate_flow_nodes(&self) {
        let speakers: HashMap<String, String> = self
            .registry
            .snapshot()
            .into_iter()
            .filter_map(|d| d.ip.map(|ip| (d.mac_address, ip)))
            .collect();
        if speakers.is_empty() {
            return;
        }

        for node in self.flow.nodes().await {
            let Some(device_id) = node.device_id().await else {
                continue;
            };
            let Some(ip) = speakers.get(&device_id.to_lowercase()) else {
                continue;
            };
            let Some(action) = ACTIONS.iter().copied().find(|a| *a == node.node_name) else {
                debug!(node = %node.node_name, "no sonos action for node");
                continue;
            };
            node.bind(Arc::new(SonosAction {
                client: self.client.clone(),
                ip: ip.clone(),
                port: self.soap_port,
                action,
            }));
            info!(node_id = node.node_id, action, %ip, "bound sonos action");
        }
    }

    fn scannable(&self) -> Option<&dyn Scannable> {
        Some(self)
    }

    fn controllable(&self) -> Option<&dyn Controllable> {
        Some(self)
    }
}

#[async_trait]
impl Scannable for SonosPlugin {
    async fn discover(&self, duration: Duration) -> Result<usize, PluginError> {
        let locations = self.ssdp_search(duration).await?;
        for location in &locations {
            self.register_from_description(location).await;
        }
        if locations.is_empty() {
            warn!("ssdp search found no speakers");
        }
        Ok(self.registry.len())
    }
}

impl Controllable for SonosPlugin {
    fn actions(&self) -> Vec<&'static str> {
        ACTIONS.to_vec()
    }
}
