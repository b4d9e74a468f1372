//! # Wireless Link Transport Layer
//!
//! This module defines the seam between the acquisition core and the host's
//! radio stack. A concrete transport opens a session to one physical
//! address, exposes its characteristics, subscribes to notifications and
//! writes request frames. Incoming notification fragments and link loss are
//! pushed back into the core through a [`LinkEvents`] sink.
//!
//! ## Delivery model
//!
//! The link is half-duplex and notification based: a request frame is
//! written to the write characteristic and the response arrives later as one
//! or more notification packets on the notify characteristic. The transport
//! must call [`LinkEvents::on_notification`] once per packet, in arrival
//! order, and [`LinkEvents::on_disconnect`] when the session drops.
//!
//! ## Transport Statistics
//!
//! ```rust
//! use renogy_ble::transport::TransportStats;
//!
//! let mut stats = TransportStats::default();
//! stats.record_request(8);
//! stats.record_response(21);
//! assert_eq!(stats.success_rate(), 100.0);
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::error::RenogyResult;
use crate::logging::obfuscate_address;

/// Well-known write characteristic
pub const WRITE_CHAR_UUID: &str = "0000ffd1-0000-1000-8000-00805f9b34fb";

/// Well-known notify characteristic
pub const NOTIFY_CHAR_UUID: &str = "0000fff1-0000-1000-8000-00805f9b34fb";

/// Format raw bytes as hex string for packet logging
pub fn format_hex_packet(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Log packet with direction and link address
pub fn log_packet(direction: &str, data: &[u8], address: &str, unit_id: Option<u8>) {
    let hex_string = format_hex_packet(data);
    let address = obfuscate_address(address);
    match unit_id {
        Some(id) => debug!("[BLE {}] {} unit:{} {}", address, direction, id, hex_string),
        None => debug!("[BLE {}] {} {}", address, direction, hex_string),
    }
}

/// GATT characteristic capabilities relevant to the protocol
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharProperties {
    pub write: bool,
    pub write_without_response: bool,
    pub notify: bool,
    pub indicate: bool,
}

impl CharProperties {
    pub fn can_write(&self) -> bool {
        self.write || self.write_without_response
    }

    pub fn can_notify(&self) -> bool {
        self.notify || self.indicate
    }
}

/// A characteristic discovered on the remote device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Characteristic {
    pub uuid: String,
    pub properties: CharProperties,
}

impl Characteristic {
    pub fn new<S: Into<String>>(uuid: S, properties: CharProperties) -> Self {
        Self {
            uuid: uuid.into(),
            properties,
        }
    }
}

/// Write and notify characteristic pair used for request/response traffic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicPair {
    pub write: String,
    pub notify: String,
}

impl Default for CharacteristicPair {
    fn default() -> Self {
        Self {
            write: WRITE_CHAR_UUID.to_string(),
            notify: NOTIFY_CHAR_UUID.to_string(),
        }
    }
}

impl CharacteristicPair {
    /// Match the well-known ids (case-insensitive), falling back to the
    /// defaults for whichever one is missing
    pub fn by_known_uuid(chars: &[Characteristic]) -> Self {
        let mut pair = Self::default();
        let mut found_write = false;
        let mut found_notify = false;
        for ch in chars {
            let uuid = ch.uuid.to_ascii_lowercase();
            if uuid == WRITE_CHAR_UUID {
                pair.write = ch.uuid.clone();
                found_write = true;
            } else if uuid == NOTIFY_CHAR_UUID {
                pair.notify = ch.uuid.clone();
                found_notify = true;
            }
        }
        if !found_write {
            debug!("Using default write char: {}", WRITE_CHAR_UUID);
        }
        if !found_notify {
            debug!("Using default notify char: {}", NOTIFY_CHAR_UUID);
        }
        pair
    }

    /// Pick characteristics by capability; the last capable one wins
    pub fn by_capability(chars: &[Characteristic]) -> Self {
        let mut pair = Self::default();
        for ch in chars {
            if ch.properties.can_write() {
                pair.write = ch.uuid.clone();
            }
            if ch.properties.can_notify() {
                pair.notify = ch.uuid.clone();
            }
        }
        pair
    }
}

/// Sink for asynchronous link events
///
/// Implementations must be cheap and non-blocking: they run on the
/// transport's delivery path.
pub trait LinkEvents: Send + Sync {
    /// One notification packet arrived
    fn on_notification(&self, data: &[u8]);

    /// The session was lost
    fn on_disconnect(&self);
}

/// Session to one physical wireless address
///
/// All methods that touch the radio are async and may fail with
/// transport-class errors; the connection layer turns those into retries or
/// "no data".
#[async_trait]
pub trait BleTransport: Send + Sync {
    /// Open the session; `events` receives notifications and link loss
    async fn connect(&mut self, events: Arc<dyn LinkEvents>) -> RenogyResult<()>;

    /// Characteristics exposed by the connected device
    async fn characteristics(&mut self) -> RenogyResult<Vec<Characteristic>>;

    /// Subscribe to notifications on `uuid`
    async fn start_notify(&mut self, uuid: &str) -> RenogyResult<()>;

    /// Unsubscribe from `uuid`
    async fn stop_notify(&mut self, uuid: &str) -> RenogyResult<()>;

    /// Write a request frame to `uuid`
    async fn write(&mut self, uuid: &str, data: &[u8]) -> RenogyResult<()>;

    /// Close the session
    async fn disconnect(&mut self) -> RenogyResult<()>;

    /// Local view of the session state
    fn is_connected(&self) -> bool;
}

/// Creates fresh transport sessions for a physical address
pub trait TransportFactory: Send + Sync {
    fn create(&self, address: &str) -> RenogyResult<Box<dyn BleTransport>>;
}

impl<F> TransportFactory for F
where
    F: Fn(&str) -> RenogyResult<Box<dyn BleTransport>> + Send + Sync,
{
    fn create(&self, address: &str) -> RenogyResult<Box<dyn BleTransport>> {
        self(address)
    }
}

/// An advertisement seen during a scan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredDevice {
    pub name: String,
    pub address: String,
    pub rssi: Option<i16>,
}

/// Host scanner returning nearby advertisements
#[async_trait]
pub trait Scanner: Send + Sync {
    async fn discover(&self, timeout: std::time::Duration) -> RenogyResult<Vec<DiscoveredDevice>>;
}

/// Returns `true` for advertisement names used by the vendor's BT modules
pub fn is_renogy_name(name: &str) -> bool {
    name.starts_with("BT-TH") || name.to_ascii_uppercase().contains("RENOGY")
}

/// Scan and keep vendor devices (or everything with `show_all`), strongest first
///
/// A failed scan is logged and yields an empty list.
pub async fn scan_for_devices(
    scanner: &dyn Scanner,
    timeout: std::time::Duration,
    show_all: bool,
) -> Vec<DiscoveredDevice> {
    let devices = match scanner.discover(timeout).await {
        Ok(devices) => devices,
        Err(e) => {
            tracing::error!("Scan failed: {}", e);
            return Vec::new();
        }
    };

    let mut results: Vec<DiscoveredDevice> = devices
        .into_iter()
        .filter(|d| show_all || is_renogy_name(&d.name))
        .collect();
    results.sort_by_key(|d| std::cmp::Reverse(d.rssi.unwrap_or(-100)));

    tracing::info!(
        "Found {} {} devices",
        results.len(),
        if show_all { "total" } else { "Renogy" }
    );
    results
}

/// Per-link traffic counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportStats {
    pub requests_sent: u64,
    pub responses_received: u64,
    pub errors: u64,
    pub timeouts: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

impl TransportStats {
    pub fn record_request(&mut self, bytes: usize) {
        self.requests_sent += 1;
        self.bytes_sent += bytes as u64;
    }

    pub fn record_response(&mut self, bytes: usize) {
        self.responses_received += 1;
        self.bytes_received += bytes as u64;
    }

    pub fn record_error(&mut self) {
        self.errors += 1;
    }

    pub fn record_timeout(&mut self) {
        self.timeouts += 1;
    }

    /// Percentage of requests that produced a usable response
    pub fn success_rate(&self) -> f64 {
        if self.requests_sent == 0 {
            return 0.0;
        }
        self.responses_received as f64 / self.requests_sent as f64 * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(write: bool, notify: bool) -> CharProperties {
        CharProperties {
            write,
            notify,
            ..Default::default()
        }
    }

    #[test]
    fn test_format_hex_packet() {
        assert_eq!(format_hex_packet(&[0xFF, 0x03, 0x00, 0x0C]), "FF 03 00 0C");
        assert_eq!(format_hex_packet(&[]), "");
    }

    #[test]
    fn test_pair_by_known_uuid() {
        let chars = vec![
            Characteristic::new("0000FFD1-0000-1000-8000-00805F9B34FB", props(true, false)),
            Characteristic::new("0000fff1-0000-1000-8000-00805f9b34fb", props(false, true)),
            Characteristic::new("00002a00-0000-1000-8000-00805f9b34fb", props(true, true)),
        ];
        let pair = CharacteristicPair::by_known_uuid(&chars);
        assert_eq!(pair.write, "0000FFD1-0000-1000-8000-00805F9B34FB");
        assert_eq!(pair.notify, NOTIFY_CHAR_UUID);
    }

    #[test]
    fn test_pair_falls_back_to_defaults() {
        assert_eq!(
            CharacteristicPair::by_known_uuid(&[]),
            CharacteristicPair::default()
        );
        assert_eq!(
            CharacteristicPair::by_capability(&[]),
            CharacteristicPair::default()
        );
    }

    #[test]
    fn test_pair_by_capability() {
        let chars = vec![
            Characteristic::new("aaaa", props(true, false)),
            Characteristic::new(
                "bbbb",
                CharProperties {
                    indicate: true,
                    ..Default::default()
                },
            ),
            Characteristic::new(
                "cccc",
                CharProperties {
                    write_without_response: true,
                    ..Default::default()
                },
            ),
        ];
        let pair = CharacteristicPair::by_capability(&chars);
        assert_eq!(pair.write, "cccc");
        assert_eq!(pair.notify, "bbbb");
    }

    #[test]
    fn test_stats_success_rate() {
        let mut stats = TransportStats::default();
        assert_eq!(stats.success_rate(), 0.0);
        stats.record_request(8);
        stats.record_request(8);
        stats.record_response(21);
        stats.record_timeout();
        assert_eq!(stats.bytes_sent, 16);
        assert_eq!(stats.success_rate(), 50.0);
    }

    struct FixedScanner(Vec<DiscoveredDevice>);

    #[async_trait]
    impl Scanner for FixedScanner {
        async fn discover(&self, _timeout: std::time::Duration) -> RenogyResult<Vec<DiscoveredDevice>> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn test_scan_filters_and_sorts() {
        let device = |name: &str, rssi: Option<i16>| DiscoveredDevice {
            name: name.to_string(),
            address: format!("{}-addr", name),
            rssi,
        };
        let scanner = FixedScanner(vec![
            device("BT-TH-1234", Some(-80)),
            device("Phone", Some(-40)),
            device("Renogy Hub", Some(-60)),
            device("BT-TH-9999", None),
        ]);

        let found = scan_for_devices(&scanner, std::time::Duration::from_secs(1), false).await;
        let names: Vec<&str> = found.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["Renogy Hub", "BT-TH-1234", "BT-TH-9999"]);

        let all = scan_for_devices(&scanner, std::time::Duration::from_secs(1), true).await;
        assert_eq!(all.len(), 4);
        assert_eq!(all[0].name, "Phone");
    }
}
