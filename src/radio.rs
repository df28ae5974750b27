// src/radio.rs
//
// Abstraction over the BLE radio. Plugins depend on `RadioTransport` so the
// scan and GATT paths can be exercised without hardware; `BleRadio` is the
// btleplug-backed implementation. `RadioScheduler` serialises access to the
// single physical radio across plugins.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{Central, Manager as _, Peripheral as _, ScanFilter, WriteType};
use btleplug::platform::{Adapter, Manager};
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum RadioError {
    #[error("no bluetooth adapter available")]
    NoAdapter,
    #[error("radio operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("bluetooth error: {0}")]
    Bluetooth(String),
    #[error("device not found: {0}")]
    DeviceNotFound(String),
}

impl From<btleplug::Error> for RadioError {
    fn from(err: btleplug::Error) -> Self {
        Self::Bluetooth(err.to_string())
    }
}

/// One observed advertisement, already detached from the backing stack.
#[derive(Debug, Clone)]
pub struct Advertisement {
    pub address: String,
    pub local_name: Option<String>,
    pub rssi: Option<i16>,
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
    pub service_uuids: Vec<Uuid>,
}

#[async_trait]
pub trait RadioTransport: Send + Sync {
    async fn start_scan(&self) -> Result<(), RadioError>;
    async fn stop_scan(&self) -> Result<(), RadioError>;
    /// Collect everything observed since the scan started.
    async fn drain_advertisements(&self) -> Result<Vec<Advertisement>, RadioError>;
    /// Drop and re-acquire the adapter. Used when scans fail repeatedly.
    async fn reset(&self) -> Result<(), RadioError>;
    async fn read_gatt(&self, address: &str, characteristic: Uuid) -> Result<Vec<u8>, RadioError>;
    async fn write_gatt(
        &self,
        address: &str,
        characteristic: Uuid,
        value: &[u8],
    ) -> Result<(), RadioError>;
}

/// Process-wide hand-off token for the radio. Whoever holds the guard owns
/// the radio until it is dropped.
#[derive(Clone)]
pub struct RadioScheduler {
    slot: Arc<Mutex<()>>,
}

impl RadioScheduler {
    pub fn new() -> Self {
        Self {
            slot: Arc::new(Mutex::new(())),
        }
    }

    pub async fn acquire(&self) -> OwnedMutexGuard<()> {
        self.slot.clone().lock_owned().await
    }
}

impl Default for RadioScheduler {
    fn default() -> Self {
        Self::new()
    }
}

const GATT_OP_TIMEOUT: Duration = Duration::from_secs(20);

/// Runs one GATT exchange and always tears the link down afterwards. A
/// failed exchange must not leave the peripheral connected; a lingering
/// connection blocks the next scan cycle from seeing the device.
async fn run_then_disconnect<T, O, D>(op: O, disconnect: D) -> Result<T, RadioError>
where
    O: Future<Output = Result<T, RadioError>>,
    D: Future<Output = Result<(), btleplug::Error>>,
{
    let result = op.await;
    if let Err(err) = disconnect.await {
        debug!(%err, "disconnect after gatt exchange failed");
    }
    result
}

/// btleplug-backed radio. The adapter handle is replaceable so `reset` can
/// re-acquire it from a fresh manager.
pub struct BleRadio {
    adapter: RwLock<Option<Adapter>>,
}

impl BleRadio {
    pub async fn new() -> Result<Self, RadioError> {
        let adapter = Self::acquire_adapter().await?;
        Ok(Self {
            adapter: RwLock::new(Some(adapter)),
        })
    }

    async fn acquire_adapter() -> Result<Adapter, RadioError> {
        let manager = Manager::new().await?;
        let adapters = manager.adapters().await?;
        let adapter = adapters.into_iter().next().ok_or(RadioError::NoAdapter)?;
        info!("bluetooth adapter acquired");
        Ok(adapter)
    }

    async fn current_adapter(&self) -> Result<Adapter, RadioError> {
        self.adapter
            .read()
            .await
            .clone()
            .ok_or(RadioError::NoAdapter)
    }

    async fn find_peripheral(
        &self,
        adapter: &Adapter,
        address: &str,
    ) -> Result<btleplug::platform::Peripheral, RadioError> {
        let wanted = address.to_lowercase();
        for peripheral in adapter.peripherals().await? {
            if peripheral.address().to_string().to_lowercase() == wanted {
                return Ok(peripheral);
            }
        }
        Err(RadioError::DeviceNotFound(address.to_string()))
    }

    async fn connected_characteristic(
        &self,
        peripheral: &btleplug::platform::Peripheral,
        characteristic: Uuid,
    ) -> Result<btleplug::api::Characteristic, RadioError> {
        if !peripheral.is_connected().await? {
            timeout(GATT_OP_TIMEOUT, peripheral.connect())
                .await
                .map_err(|_| RadioError::Timeout(GATT_OP_TIMEOUT))??;
        }
        peripheral.discover_services().await?;
        peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == characteristic)
            .ok_or_else(|| {
                RadioError::Bluetooth(format!("characteristic {characteristic} not found"))
            })
    }
}

#[async_trait]
impl RadioTransport for BleRadio {
    async fn start_scan(&self) -> Result<(), RadioError> {
        let adapter = self.current_adapter().await?;
        adapter.start_scan(ScanFilter::default()).await?;
        debug!("scan started");
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), RadioError> {
        let adapter = self.current_adapter().await?;
        adapter.stop_scan().await?;
        debug!("scan stopped");
        Ok(())
    }

    async fn drain_advertisements(&self) -> Result<Vec<Advertisement>, RadioError> {
        let adapter = self.current_adapter().await?;
        let mut out = Vec::new();
        for peripheral in adapter.peripherals().await? {
            let Some(props) = peripheral.properties().await? else {
                continue;
            };
            out.push(Advertisement {
                address: peripheral.address().to_string().to_lowercase(),
                local_name: props.local_name,
                rssi: props.rssi,
                manufacturer_data: props.manufacturer_data,
                service_uuids: props.services,
            });
        }
        Ok(out)
    }

    async fn reset(&self) -> Result<(), RadioError> {
        warn!("resetting bluetooth adapter");
        {
            let mut slot = self.adapter.write().await;
            if let Some(adapter) = slot.take() {
                if let Err(err) = adapter.stop_scan().await {
                    debug!(%err, "stop_scan during reset failed");
                }
            }
        }
        let fresh = Self::acquire_adapter().await?;
        *self.adapter.write().await = Some(fresh);
        Ok(())
    }

    async fn read_gatt(&self, address: &str, characteristic: Uuid) -> Result<Vec<u8>, RadioError> {
        let adapter = self.current_adapter().await?;
        let peripheral = self.find_peripheral(&adapter, address).await?;
        run_then_disconnect(
            async {
                let chr = self
                    .connected_characteristic(&peripheral, characteristic)
                    .await?;
                let value = timeout(GATT_OP_TIMEOUT, peripheral.read(&chr))
                    .await
                    .map_err(|_| RadioError::Timeout(GATT_OP_TIMEOUT))??;
                Ok(value)
            },
            peripheral.disconnect(),
        )
        .await
    }

    async fn write_gatt(
        &self,
        address: &str,
        characteristic: Uuid,
        value: &[u8],
    ) -> Result<(), RadioError> {
        let adapter = self.current_adapter().await?;
        let peripheral = self.find_peripheral(&adapter, address).await?;
        run_then_disconnect(
            async {
                let chr = self
                    .connected_characteristic(&peripheral, characteristic)
                    .await?;
                timeout(
                    GATT_OP_TIMEOUT,
                    peripheral.write(&chr, value, WriteType::WithResponse),
                )
                .await
                .map_err(|_| RadioError::Timeout(GATT_OP_TIMEOUT))??;
                Ok(())
            },
            peripheral.disconnect(),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn gatt_exchange_always_disconnects() {
        let disconnected = AtomicBool::new(false);
        let result: Result<Vec<u8>, _> = run_then_disconnect(
            async { Err(RadioError::Bluetooth("read failed".to_string())) },
            async {
                disconnected.store(true, Ordering::SeqCst);
                Ok(())
            },
        )
        .await;
        assert!(result.is_err());
        assert!(disconnected.load(Ordering::SeqCst));

        disconnected.store(false, Ordering::SeqCst);
        let result = run_then_disconnect(
            async { Ok(vec![1u8, 2, 3]) },
            async {
                disconnected.store(true, Ordering::SeqCst);
                Ok(())
            },
        )
        .await;
        assert_eq!(result.unwrap(), vec![1, 2, 3]);
        assert!(disconnected.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn scheduler_serialises_holders() {
        let scheduler = RadioScheduler::new();
        let guard = scheduler.acquire().await;
        // A second acquire must not resolve while the guard is held.
        let second = scheduler.acquire();
        tokio::pin!(second);
        assert!(
            tokio::time::timeout(Duration::from_millis(20), &mut second)
                .await
                .is_err()
        );
        drop(guard);
        assert!(
            tokio::time::timeout(Duration::from_millis(100), second)
                .await
                .is_ok()
        );
    }
}
