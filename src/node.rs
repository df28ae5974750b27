// src/node.rs

use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard};

/// Behavior bound to a flow node by a plugin. The returned bool is a gate:
/// `false` stops propagation past the node without being an error.
#[async_trait]
pub trait NodeBehavior: Send + Sync {
    fn name(&self) -> &str;
    async fn invoke(&self, data: &mut Map<String, Value>) -> Result<bool, NodeError>;
}

#[derive(Debug, Clone, Error)]
pub enum NodeError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("device unreachable: {0}")]
    DeviceUnreachable(String),
    #[error("execution failed: {0}")]
    ExecutionFailed(String),
}

/// One step in the automation graph. A node never owns a device; it only
/// carries a device identifier inside its node_data that plugins resolve.
pub struct FlowNode {
    pub node_id: i64,
    pub node_type: String,
    pub node_name: String,
    pub is_root: bool,
    pub is_leaf: bool,
    data: AsyncMutex<Map<String, Value>>,
    behavior: Mutex<Option<Arc<dyn NodeBehavior>>>,
}

impl FlowNode {
    pub fn new(
        node_id: i64,
        node_type: String,
        node_name: String,
        node_data: Map<String, Value>,
        is_root: bool,
        is_leaf: bool,
    ) -> Self {
        Self {
            node_id,
            node_type,
            node_name,
            is_root,
            is_leaf,
            data: AsyncMutex::new(node_data),
            behavior: Mutex::new(None),
        }
    }

    /// Lock the node's working data, e.g. for the duration of a behavior call.
    pub async fn data(&self) -> MutexGuard<'_, Map<String, Value>> {
        self.data.lock().await
    }

    pub async fn snapshot(&self) -> Map<String, Value> {
        self.data.lock().await.clone()
    }

    /// Shallow merge: incoming keys overwrite existing keys of the same name.
    pub async fn merge_data(&self, incoming: &Map<String, Value>) {
        let mut data = self.data.lock().await;
        for (key, value) in incoming {
            data.insert(key.clone(), value.clone());
        }
    }

    /// The device identifier this node refers to, if any.
    pub async fn device_id(&self) -> Option<String> {
        let data = self.data.lock().await;
        data.get("device_id")
            .or_else(|| data.get("mac_address"))
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    pub fn bind(&self, behavior: Arc<dyn NodeBehavior>) {
        *self.behavior.lock().unwrap() = Some(behavior);
    }

    pub fn unbind(&self) {
        *self.behavior.lock().unwrap() = None;
    }

    pub fn behavior(&self) -> Option<Arc<dyn NodeBehavior>> {
        self.behavior.lock().unwrap().clone()
    }
}

impl fmt::Debug for FlowNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowNode")
            .field("node_id", &self.node_id)
            .field("node_type", &self.node_type)
            .field("node_name", &self.node_name)
            .field("is_root", &self.is_root)
            .field("is_leaf", &self.is_leaf)
            .field("bound", &self.behavior.lock().unwrap().is_some())
            .finish()
    }
}
