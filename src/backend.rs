// src/backend.rs
//
// Remote server collaborator. The hub authenticates once, then talks to the
// backend with app-id/app-secret headers plus a bearer token. Every ping may
// carry a command back for the hub to execute.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use serde::Serialize;
use serde_json::{Value, json};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::device::Device;
use crate::flow::FlowDefinition;

/// Command embedded in a ping response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubCommand {
    None,
    Scan,
    Reboot,
    LoadPlugin(String),
    UnloadPlugin(String),
}

impl HubCommand {
    pub fn parse(raw: Option<&str>) -> Self {
        let Some(raw) = raw else {
            return Self::None;
        };
        match raw {
            "" => Self::None,
            "scan_devices" => Self::Scan,
            "rebooting" => Self::Reboot,
            other => {
                if let Some(name) = other.strip_prefix("load_plugin:") {
                    Self::LoadPlugin(name.to_string())
                } else if let Some(name) = other.strip_prefix("unload_plugin:") {
                    Self::UnloadPlugin(name.to_string())
                } else {
                    warn!(command = other, "unrecognised hub command ignored");
                    Self::None
                }
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server rejected request: status {0}")]
    Rejected(u16),
    #[error("not authenticated")]
    NotAuthenticated,
    #[error("malformed server response: {0}")]
    Malformed(String),
}

#[async_trait]
pub trait Backend: Send + Sync {
    async fn authenticate(&self) -> Result<(), BackendError>;
    async fn set_location(&self, latitude: f64, longitude: f64) -> Result<(), BackendError>;
    async fn get_flow(&self) -> Result<FlowDefinition, BackendError>;
    /// Heartbeat; the response may carry a command.
    async fn ping(&self) -> Result<HubCommand, BackendError>;
    async fn post_scan_results(&self, devices: &[Device]) -> Result<(), BackendError>;
    async fn send_collected_data(
        &self,
        mac_address: &str,
        data: &Value,
    ) -> Result<(), BackendError>;
}

pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
    serial_no: String,
    token: RwLock<Option<String>>,
}

impl HttpBackend {
    pub fn new(
        base_url: &str,
        serial_no: &str,
        app_id: &str,
        app_secret: &str,
        timeout: Duration,
    ) -> Result<Self, BackendError> {
        let mut headers = HeaderMap::new();
        if let Ok(v) = HeaderValue::from_str(app_id) {
            headers.insert("x-app-id", v);
        }
        if let Ok(v) = HeaderValue::from_str(app_secret) {
            headers.insert("x-app-secret", v);
        }
        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            serial_no: serial_no.to_string(),
            token: RwLock::new(None),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn bearer(&self) -> Result<String, BackendError> {
        self.token
            .read()
            .await
            .clone()
            .ok_or(BackendError::NotAuthenticated)
    }

    /// POST with bearer auth, unwrap the `{statusCode, data}` envelope.
    async fn post(&self, path: &str, body: &impl Serialize) -> Result<Value, BackendError> {
        let response = self
            .client
            .post(self.url(path))
            .bearer_auth(self.bearer().await?)
            .json(body)
            .send()
            .await?;
        Self::unwrap_envelope(response).await
    }

    async fn get(&self, path: &str) -> Result<Value, BackendError> {
        let response = self
            .client
            .get(self.url(path))
            .bearer_auth(self.bearer().await?)
            .send()
            .await?;
        Self::unwrap_envelope(response).await
    }

    async fn unwrap_envelope(response: reqwest::Response) -> Result<Value, BackendError> {
        let http_status = response.status().as_u16();
        let body: Value = response
            .json()
            .await
            .map_err(|e| BackendError::Malformed(e.to_string()))?;
        let status = body
            .get("statusCode")
            .and_then(Value::as_u64)
            .unwrap_or(http_status as u64);
        if !(200..300).contains(&status) {
            return Err(BackendError::Rejected(status as u16));
        }
        Ok(body.get("data").cloned().unwrap_or(body))
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn authenticate(&self) -> Result<(), BackendError> {
        let response = self
            .client
            .post(self.url("hub/authenticate"))
            .json(&json!({ "serialNo": self.serial_no }))
            .send()
            .await?;
        let data = Self::unwrap_envelope(response).await?;
        let token = data
            .get("token")
            .and_then(Value::as_str)
            .ok_or_else(|| BackendError::Malformed("missing token".to_string()))?;
        *self.token.write().await = Some(token.to_string());
        info!("authenticated with backend");
        Ok(())
    }

    async fn set_location(&self, latitude: f64, longitude: f64) -> Result<(), BackendError> {
        self.post(
            "hub/location",
            &json!({ "latitude": latitude, "longitude": longitude }),
        )
        .await?;
        Ok(())
    }

    async fn get_flow(&self) -> Result<FlowDefinition, BackendError> {
        let data = self.get("hub/flow").await?;
        serde_json::from_value(data).map_err(|e| BackendError::Malformed(e.to_string()))
    }

    async fn ping(&self) -> Result<HubCommand, BackendError> {
        let data = self.post("hub/ping", &json!({})).await?;
        let command = HubCommand::parse(data.get("command").and_then(Value::as_str));
        if command != HubCommand::None {
            debug!(?command, "ping returned a command");
        }
        Ok(command)
    }

    async fn post_scan_results(&self, devices: &[Device]) -> Result<(), BackendError> {
        self.post("hub/devices", &json!({ "devices": devices })).await?;
        Ok(())
    }

    async fn send_collected_data(
        &self,
        mac_address: &str,
        data: &Value,
    ) -> Result<(), BackendError> {
        self.post(
            "hub/data",
            &json!({ "macAddress": mac_address, "data": data }),
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_commands_parse() {
        assert_eq!(HubCommand::parse(Some("scan_devices")), HubCommand::Scan);
        assert_eq!(HubCommand::parse(Some("rebooting")), HubCommand::Reboot);
        assert_eq!(
            HubCommand::parse(Some("load_plugin:sonos")),
            HubCommand::LoadPlugin("sonos".to_string())
        );
        assert_eq!(
            HubCommand::parse(Some("unload_plugin:emulator")),
            HubCommand::UnloadPlugin("emulator".to_string())
        );
    }

    #[test]
    fn absent_empty_and_unknown_commands_are_none() {
        assert_eq!(HubCommand::parse(None), HubCommand::None);
        assert_eq!(HubCommand::parse(Some("")), HubCommand::None);
        assert_eq!(HubCommand::parse(Some("self_destruct")), HubCommand::None);
    }

    #[test]
    fn base_url_trailing_slash_is_normalised() {
        let backend = HttpBackend::new(
            "https://api.example.test/",
            "serial-1",
            "id",
            "secret",
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(backend.url("/hub/ping"), "https://api.example.test/hub/ping");
        assert_eq!(backend.url("hub/ping"), "https://api.example.test/hub/ping");
    }
}
