// src/scan.rs
//
// Periodic BLE scan supervisor. Runs scan cycles on a fixed cadence, hands
// matching advertisements to a handler, counts consecutive failures and
// resets the radio when they cross a threshold or after a fixed number of
// healthy cycles.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::radio::{Advertisement, RadioError, RadioScheduler, RadioTransport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ScanState {
    #[default]
    Idle = 0,
    Scanning = 1,
    Processing = 2,
    Recovering = 3,
    Stopped = 4,
}

impl ScanState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Idle,
            1 => Self::Scanning,
            2 => Self::Processing,
            3 => Self::Recovering,
            _ => Self::Stopped,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Time the radio listens per cycle.
    pub scan_duration: Duration,
    /// Gap between cycles.
    pub pause_duration: Duration,
    /// Consecutive failures before the radio is reset.
    pub failure_threshold: u32,
    /// Cool-down after a reset before scanning resumes.
    pub recovery_delay: Duration,
    /// Healthy cycles between preventive resets; 0 disables them.
    pub preventive_reset_threshold: u32,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            scan_duration: Duration::from_secs(5),
            pause_duration: Duration::from_secs(1),
            failure_threshold: 3,
            recovery_delay: Duration::from_secs(10),
            preventive_reset_threshold: 120,
        }
    }
}

/// Consumer of matching advertisements.
#[async_trait]
pub trait AdvertisementHandler: Send + Sync {
    /// Cheap filter applied to every drained advertisement.
    fn matches(&self, advertisement: &Advertisement) -> bool;
    async fn handle(&self, advertisement: Advertisement);
}

pub struct ScanSupervisor {
    config: ScanConfig,
    radio: Arc<dyn RadioTransport>,
    scheduler: RadioScheduler,
    handler: Arc<dyn AdvertisementHandler>,
    state: AtomicU8,
    scan_failure_count: AtomicU32,
    cycles_since_reset: AtomicU32,
    resets: AtomicU32,
    last_scan_time: StdMutex<Option<Instant>>,
    cycle_guard: Mutex<()>,
    cancel: CancellationToken,
}

impl ScanSupervisor {
    pub fn new(
        config: ScanConfig,
        radio: Arc<dyn RadioTransport>,
        scheduler: RadioScheduler,
        handler: Arc<dyn AdvertisementHandler>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            radio,
            scheduler,
            handler,
            state: AtomicU8::new(ScanState::Idle as u8),
            scan_failure_count: AtomicU32::new(0),
            cycles_since_reset: AtomicU32::new(0),
            resets: AtomicU32::new(0),
            last_scan_time: StdMutex::new(None),
            cycle_guard: Mutex::new(()),
            cancel: CancellationToken::new(),
        })
    }

    pub fn state(&self) -> ScanState {
        ScanState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: ScanState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    pub fn failure_count(&self) -> u32 {
        self.scan_failure_count.load(Ordering::SeqCst)
    }

    pub fn reset_count(&self) -> u32 {
        self.resets.load(Ordering::SeqCst)
    }

    /// When the last cycle started listening, if any.
    pub fn last_scan_time(&self) -> Option<Instant> {
        *self.last_scan_time.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let supervisor = self.clone();
        tokio::spawn(async move { supervisor.run().await })
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Cancel the loop and wait for the task to drain, force-terminating it
    /// if it does not finish in time.
    pub async fn shutdown(&self, handle: JoinHandle<()>, grace: Duration) {
        self.stop();
        let abort = handle.abort_handle();
        if timeout(grace, handle).await.is_err() {
            warn!("scan loop did not stop in time, aborting");
            abort.abort();
        }
        if let Err(err) = self.radio.stop_scan().await {
            debug!(%err, "final stop_scan failed");
        }
        self.set_state(ScanState::Stopped);
    }

    pub async fn run(&self) {
        info!(
            scan = ?self.config.scan_duration,
            pause = ?self.config.pause_duration,
            "scan loop started"
        );
        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            match self.scan_cycle().await {
                Ok(count) => {
                    self.scan_failure_count.store(0, Ordering::SeqCst);
                    let healthy = self.cycles_since_reset.fetch_add(1, Ordering::SeqCst) + 1;
                    debug!(matched = count, healthy_cycles = healthy, "scan cycle done");
                    if self.config.preventive_reset_threshold > 0
                        && healthy >= self.config.preventive_reset_threshold
                    {
                        info!(cycles = healthy, "preventive radio reset");
                        self.recover().await;
                    }
                }
                Err(err) => {
                    let failures = self.scan_failure_count.fetch_add(1, Ordering::SeqCst) + 1;
                    warn!(%err, failures, "scan cycle failed");
                    if failures >= self.config.failure_threshold {
                        error!(failures, "failure threshold reached, recovering radio");
                        self.recover().await;
                    }
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = sleep(self.config.pause_duration) => {}
            }
        }

        if let Err(err) = self.radio.stop_scan().await {
            debug!(%err, "stop_scan on exit failed");
        }
        self.set_state(ScanState::Stopped);
        info!("scan loop stopped");
    }

    /// One complete cycle: listen, drain, filter, hand off. Only one cycle
    /// runs at a time; an overlapping call returns immediately.
    pub async fn scan_cycle(&self) -> Result<usize, RadioError> {
        let Ok(_cycle) = self.cycle_guard.try_lock() else {
            debug!("scan cycle already in flight, skipping");
            return Ok(0);
        };
        let _radio_slot = self.scheduler.acquire().await;

        self.set_state(ScanState::Scanning);
        *self
            .last_scan_time
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
        let result = self.listen_and_collect().await;
        if result.is_err() {
            // Best effort; the radio may be in a half-started state.
            if let Err(err) = self.radio.stop_scan().await {
                debug!(%err, "stop_scan after failed cycle");
            }
        }
        let advertisements = match result {
            Ok(ads) => ads,
            Err(err) => {
                self.set_state(ScanState::Idle);
                return Err(err);
            }
        };

        self.set_state(ScanState::Processing);
        let mut matched = 0;
        for advertisement in advertisements {
            if self.handler.matches(&advertisement) {
                matched += 1;
                self.handler.handle(advertisement).await;
            }
        }
        self.set_state(ScanState::Idle);
        Ok(matched)
    }

    async fn listen_and_collect(&self) -> Result<Vec<Advertisement>, RadioError> {
        self.radio.start_scan().await?;
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = sleep(self.config.scan_duration) => {}
        }
        self.radio.stop_scan().await?;
        self.radio.drain_advertisements().await
    }

    async fn recover(&self) {
        self.set_state(ScanState::Recovering);
        let _radio_slot = self.scheduler.acquire().await;
        match self.radio.reset().await {
            Ok(()) => {
                self.resets.fetch_add(1, Ordering::SeqCst);
                self.scan_failure_count.store(0, Ordering::SeqCst);
                self.cycles_since_reset.store(0, Ordering::SeqCst);
                info!("radio reset complete");
            }
            Err(err) => error!(%err, "radio reset failed"),
        }
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = sleep(self.config.recovery_delay) => {}
        }
        self.set_state(ScanState::Idle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicBool;

    struct MockRadio {
        fail_scans: AtomicBool,
        starts: AtomicU32,
        resets: AtomicU32,
        payload: Vec<u8>,
    }

    impl MockRadio {
        fn new(payload: Vec<u8>) -> Arc<Self> {
            Arc::new(Self {
                fail_scans: AtomicBool::new(false),
                starts: AtomicU32::new(0),
                resets: AtomicU32::new(0),
                payload,
            })
        }
    }

    #[async_trait]
    impl RadioTransport for MockRadio {
        async fn start_scan(&self) -> Result<(), RadioError> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            if self.fail_scans.load(Ordering::SeqCst) {
                return Err(RadioError::Bluetooth("boom".to_string()));
            }
            Ok(())
        }
        async fn stop_scan(&self) -> Result<(), RadioError> {
            Ok(())
        }
        async fn drain_advertisements(&self) -> Result<Vec<Advertisement>, RadioError> {
            let mut manufacturer_data = HashMap::new();
            manufacturer_data.insert(0x1234u16, self.payload.clone());
            Ok(vec![Advertisement {
                address: "aa:bb:cc:dd:ee:ff".to_string(),
                local_name: None,
                rssi: Some(-60),
                manufacturer_data,
                service_uuids: Vec::new(),
            }])
        }
        async fn reset(&self) -> Result<(), RadioError> {
            self.resets.fetch_add(1, Ordering::SeqCst);
            self.fail_scans.store(false, Ordering::SeqCst);
            Ok(())
        }
        async fn read_gatt(&self, _: &str, _: uuid::Uuid) -> Result<Vec<u8>, RadioError> {
            Ok(Vec::new())
        }
        async fn write_gatt(&self, _: &str, _: uuid::Uuid, _: &[u8]) -> Result<(), RadioError> {
            Ok(())
        }
    }

    struct Collector {
        handled: AtomicU32,
    }

    #[async_trait]
    impl AdvertisementHandler for Collector {
        fn matches(&self, advertisement: &Advertisement) -> bool {
            crate::advert::matches_filter(&advertisement.manufacturer_data)
        }
        async fn handle(&self, _advertisement: Advertisement) {
            self.handled.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn quick_config() -> ScanConfig {
        ScanConfig {
            scan_duration: Duration::from_millis(5),
            pause_duration: Duration::from_millis(5),
            failure_threshold: 3,
            recovery_delay: Duration::from_millis(5),
            preventive_reset_threshold: 0,
        }
    }

    fn supervisor_with(
        radio: Arc<MockRadio>,
        config: ScanConfig,
    ) -> (Arc<ScanSupervisor>, Arc<Collector>) {
        let handler = Arc::new(Collector {
            handled: AtomicU32::new(0),
        });
        let supervisor = ScanSupervisor::new(
            config,
            radio,
            RadioScheduler::new(),
            handler.clone(),
        );
        (supervisor, handler)
    }

    #[tokio::test]
    async fn matching_advertisements_reach_the_handler() {
        let radio = MockRadio::new(vec![0xFE, 0xE5, 0xCC, 0x01, 80]);
        let (supervisor, handler) = supervisor_with(radio, quick_config());
        assert!(supervisor.last_scan_time().is_none());
        let matched = supervisor.scan_cycle().await.unwrap();
        assert_eq!(matched, 1);
        assert_eq!(handler.handled.load(Ordering::SeqCst), 1);
        assert_eq!(supervisor.state(), ScanState::Idle);
        assert!(supervisor.last_scan_time().is_some());
    }

    #[tokio::test]
    async fn non_vendor_advertisements_are_filtered_out() {
        let radio = MockRadio::new(vec![0x01, 0x02, 0x03]);
        let (supervisor, handler) = supervisor_with(radio, quick_config());
        let matched = supervisor.scan_cycle().await.unwrap();
        assert_eq!(matched, 0);
        assert_eq!(handler.handled.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failure_threshold_triggers_exactly_one_reset() {
        let radio = MockRadio::new(vec![0xFE, 0xE5, 0xCC, 0x01, 80]);
        radio.fail_scans.store(true, Ordering::SeqCst);
        let (supervisor, _) = supervisor_with(radio.clone(), quick_config());

        let handle = supervisor.spawn();
        // The mock starts succeeding again after reset, so the loop settles.
        tokio::time::sleep(Duration::from_millis(200)).await;
        supervisor.shutdown(handle, Duration::from_secs(1)).await;

        assert_eq!(radio.resets.load(Ordering::SeqCst), 1);
        assert_eq!(supervisor.reset_count(), 1);
        assert_eq!(supervisor.failure_count(), 0);
        assert_eq!(supervisor.state(), ScanState::Stopped);
    }

    #[tokio::test]
    async fn preventive_reset_fires_after_healthy_cycles() {
        let radio = MockRadio::new(vec![0xFE, 0xE5, 0xCC, 0x01, 80]);
        let mut config = quick_config();
        config.preventive_reset_threshold = 2;
        let (supervisor, _) = supervisor_with(radio.clone(), config);

        let handle = supervisor.spawn();
        tokio::time::sleep(Duration::from_millis(200)).await;
        supervisor.shutdown(handle, Duration::from_secs(1)).await;

        assert!(radio.resets.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn overlapping_cycles_collapse_to_one() {
        let radio = MockRadio::new(vec![0xFE, 0xE5, 0xCC, 0x01, 80]);
        let mut config = quick_config();
        config.scan_duration = Duration::from_millis(50);
        let (supervisor, handler) = supervisor_with(radio.clone(), config);

        let a = supervisor.clone();
        let first = tokio::spawn(async move { a.scan_cycle().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        // The first cycle still holds the guard, so this one bails out.
        assert_eq!(supervisor.scan_cycle().await.unwrap(), 0);
        assert_eq!(first.await.unwrap().unwrap(), 1);
        assert_eq!(handler.handled.load(Ordering::SeqCst), 1);
    }

    /// Radio whose listen phase never completes, as seen when the adapter
    /// firmware wedges mid start_scan.
    struct HangingRadio;

    #[async_trait]
    impl RadioTransport for HangingRadio {
        async fn start_scan(&self) -> Result<(), RadioError> {
            std::future::pending().await
        }
        async fn stop_scan(&self) -> Result<(), RadioError> {
            Ok(())
        }
        async fn drain_advertisements(&self) -> Result<Vec<Advertisement>, RadioError> {
            Ok(Vec::new())
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

    #[tokio::test]
    async fn shutdown_terminates_a_stuck_worker() {
        let handler = Arc::new(Collector {
            handled: AtomicU32::new(0),
        });
        let scheduler = RadioScheduler::new();
        let supervisor = ScanSupervisor::new(
            quick_config(),
            Arc::new(HangingRadio),
            scheduler.clone(),
            handler,
        );

        let handle = supervisor.spawn();
        tokio::time::sleep(Duration::from_millis(20)).await;
        supervisor
            .shutdown(handle, Duration::from_millis(50))
            .await;

        assert_eq!(supervisor.state(), ScanState::Stopped);
        // Termination must release the radio slot the wedged cycle held.
        let _slot = timeout(Duration::from_secs(1), scheduler.acquire())
            .await
            .expect("radio slot still held after shutdown");
    }

    #[tokio::test]
    async fn stop_is_cooperative() {
        let radio = MockRadio::new(vec![0xFE, 0xE5, 0xCC, 0x01, 80]);
        let mut config = quick_config();
        config.scan_duration = Duration::from_secs(30);
        let (supervisor, _) = supervisor_with(radio, config);

        let handle = supervisor.spawn();
        tokio::time::sleep(Duration::from_millis(20)).await;
        supervisor.shutdown(handle, Duration::from_secs(1)).await;
        assert_eq!(supervisor.state(), ScanState::Stopped);
    }
}
