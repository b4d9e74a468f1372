//! # Device Manager
//!
//! Owns one [`PersistentConnection`] per physical address and the health
//! record of every logical device behind it. Several devices configured
//! with the same address (hub mode) share a single connection and are
//! polled one after another over it.
//!
//! A poll cycle never fails as a whole: a link that cannot be reached marks
//! its devices failed and the cycle moves on to the next link.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::config::PollingConfig;
use crate::connection::PersistentConnection;
use crate::error::{RenogyError, RenogyResult};
use crate::logging::obfuscate_address;
use crate::parsers::Telemetry;
use crate::registers::{device_key, DeviceIdentity};
use crate::transport::TransportFactory;
use crate::utils::{OperationTimer, PollMetrics};

/// Consecutive failed polls after which a device is reported unavailable
pub const FAILURE_THRESHOLD: u32 = 3;

/// Synchronous result callback
pub type SyncCallback = Box<dyn Fn(&str, &Telemetry) -> RenogyResult<()> + Send + Sync>;

/// Asynchronous result callback
pub type AsyncCallback =
    Box<dyn Fn(String, Telemetry) -> BoxFuture<'static, RenogyResult<()>> + Send + Sync>;

/// Invoked with `(device_key, telemetry)` after every successful device poll
pub enum DataCallback {
    Sync(SyncCallback),
    Async(AsyncCallback),
}

impl DataCallback {
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(&str, &Telemetry) -> RenogyResult<()> + Send + Sync + 'static,
    {
        DataCallback::Sync(Box::new(f))
    }

    pub fn asynchronous<F>(f: F) -> Self
    where
        F: Fn(String, Telemetry) -> BoxFuture<'static, RenogyResult<()>> + Send + Sync + 'static,
    {
        DataCallback::Async(Box::new(f))
    }

    /// Run the callback; a panic is reported as a callback error
    async fn invoke(&self, key: &str, data: &Telemetry) -> RenogyResult<()> {
        let outcome = match self {
            DataCallback::Sync(f) => panic::catch_unwind(AssertUnwindSafe(|| f(key, data))),
            DataCallback::Async(f) => {
                AssertUnwindSafe(f(key.to_string(), data.clone()))
                    .catch_unwind()
                    .await
            }
        };
        outcome.unwrap_or_else(|_| Err(RenogyError::callback(key, "callback panicked")))
    }
}

impl std::fmt::Debug for DataCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataCallback::Sync(_) => f.write_str("DataCallback::Sync"),
            DataCallback::Async(_) => f.write_str("DataCallback::Async"),
        }
    }
}

/// Latest data and availability of one logical device
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceHealth {
    pub identity: DeviceIdentity,
    /// Every field seen so far, newest value wins
    pub telemetry: Telemetry,
    pub last_update: Option<DateTime<Utc>>,
    pub available: bool,
    pub consecutive_failures: u32,
}

impl DeviceHealth {
    pub fn new(identity: DeviceIdentity) -> Self {
        Self {
            identity,
            telemetry: Telemetry::new(),
            last_update: None,
            available: false,
            consecutive_failures: 0,
        }
    }

    /// Merge a successful poll
    pub fn update(&mut self, data: &Telemetry) {
        self.telemetry
            .extend(data.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.last_update = Some(Utc::now());
        self.available = true;
        self.consecutive_failures = 0;
    }

    /// Count a failed poll; unavailable from the third in a row
    pub fn mark_failed(&mut self) {
        self.consecutive_failures += 1;
        if self.consecutive_failures >= FAILURE_THRESHOLD {
            self.available = false;
        }
    }
}

/// Connections and device health for every configured device
pub struct DeviceManager {
    connections: Vec<PersistentConnection>,
    health: BTreeMap<String, DeviceHealth>,
    callback: Option<DataCallback>,
    polling: PollingConfig,
    metrics: PollMetrics,
    running: bool,
}

impl DeviceManager {
    /// Group `devices` by address (case-insensitive) into connections
    ///
    /// Connections keep the order in which their address first appears.
    pub fn new(
        devices: Vec<DeviceIdentity>,
        factory: Arc<dyn TransportFactory>,
        polling: PollingConfig,
    ) -> Self {
        let mut groups: Vec<(String, Vec<DeviceIdentity>)> = Vec::new();
        let mut health = BTreeMap::new();

        for mut device in devices {
            device.address = device.address.to_ascii_uppercase();
            health.insert(device.device_key(), DeviceHealth::new(device.clone()));

            match groups.iter_mut().find(|(address, _)| *address == device.address) {
                Some((_, members)) => members.push(device),
                None => groups.push((device.address.clone(), vec![device])),
            }
        }

        let connections: Vec<PersistentConnection> = groups
            .into_iter()
            .map(|(address, members)| {
                if members.len() > 1 {
                    info!(
                        "Hub mode: {} devices on {}",
                        members.len(),
                        obfuscate_address(&address)
                    );
                }
                PersistentConnection::new(address, members, factory.clone(), polling.clone())
            })
            .collect();

        info!(
            "Device manager: {} devices on {} BT modules",
            health.len(),
            connections.len()
        );

        Self {
            connections,
            health,
            callback: None,
            polling,
            metrics: PollMetrics::new(),
            running: true,
        }
    }

    pub fn with_callback(mut self, callback: DataCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    pub fn set_callback(&mut self, callback: Option<DataCallback>) {
        self.callback = callback;
    }

    /// Connect every link in turn, pausing between links
    ///
    /// Returns the number of links that connected.
    pub async fn connect_all(&self) -> usize {
        let mut connected = 0;
        for connection in &self.connections {
            let address = obfuscate_address(connection.address());
            info!("Connecting to BT module: {}", address);
            if connection.connect().await {
                connected += 1;
            } else {
                error!("Failed to connect to: {}", address);
            }
            sleep(self.polling.connect_delay).await;
        }
        connected
    }

    /// Run one poll cycle over every link and device
    ///
    /// Returns `device_key → telemetry` for devices that produced data.
    pub async fn poll_all(&mut self) -> BTreeMap<String, Telemetry> {
        let mut results = BTreeMap::new();
        if !self.running {
            warn!("Device manager stopped; skipping poll");
            return results;
        }

        let Self {
            connections,
            health,
            callback,
            polling,
            metrics,
            ..
        } = self;

        for connection in connections.iter() {
            let address = connection.address().to_string();
            let tag = obfuscate_address(&address);

            if !connection.is_connected() {
                warn!("[{}] Not connected, reconnecting...", tag);
                if !connection.connect().await {
                    error!("[{}] Reconnection failed", tag);
                    for device in connection.devices() {
                        if let Some(entry) = health.get_mut(&device.device_key()) {
                            entry.mark_failed();
                        }
                        metrics.record_failure(std::time::Duration::ZERO);
                    }
                    continue;
                }
            }

            for device in connection.devices() {
                let key = device_key(&address, device.device_type, device.unit_id);
                info!(
                    "Polling: {} (type={}, id={})",
                    device.name, device.device_type, device.unit_id
                );

                let timer = OperationTimer::start(&format!("poll {}", key));
                let data = connection.poll_device(device).await;

                let mut success = !data.is_empty();
                if success {
                    if let Some(entry) = health.get_mut(&key) {
                        entry.update(&data);
                    }
                    if let Some(callback) = callback.as_ref() {
                        if let Err(e) = callback.invoke(&key, &data).await {
                            error!("  {}: Error polling: {}", device.name, e);
                            if let Some(entry) = health.get_mut(&key) {
                                entry.mark_failed();
                            }
                            success = false;
                        }
                    }
                    results.insert(key, data);
                } else {
                    warn!("  {}: No data", device.name);
                    if let Some(entry) = health.get_mut(&key) {
                        entry.mark_failed();
                    }
                }

                let elapsed = timer.stop_and_log(success);
                if success {
                    metrics.record_success(elapsed);
                } else {
                    metrics.record_failure(elapsed);
                }

                sleep(polling.device_delay).await;
            }

            sleep(polling.link_delay).await;
        }

        results
    }

    pub async fn disconnect_all(&self) {
        for connection in &self.connections {
            connection.disconnect().await;
        }
    }

    /// Stop polling and close every link
    pub async fn stop(&mut self) {
        self.running = false;
        self.disconnect_all().await;
        info!("Device manager stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn device_health(&self, device_key: &str) -> Option<&DeviceHealth> {
        self.health.get(device_key)
    }

    pub fn all_device_health(&self) -> &BTreeMap<String, DeviceHealth> {
        &self.health
    }

    /// Number of physical links
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn connection(&self, address: &str) -> Option<&PersistentConnection> {
        self.connections
            .iter()
            .find(|c| c.address().eq_ignore_ascii_case(address))
    }

    /// Logical devices sharing `address`
    pub fn devices_on(&self, address: &str) -> Option<&[DeviceIdentity]> {
        self.connection(address).map(PersistentConnection::devices)
    }

    /// Per-device poll outcomes accumulated over all cycles
    pub fn metrics(&self) -> &PollMetrics {
        &self.metrics
    }
}

impl std::fmt::Debug for DeviceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceManager")
            .field("connections", &self.connections)
            .field("devices", &self.health.len())
            .field("running", &self.running)
            .finish()
    }
}
