//! Configuration loading
//!
//! A configuration names the devices to poll and the timing of the polling
//! state machine. It can be written in YAML or JSON:
//!
//! ```yaml
//! system_voltage: 24
//! devices:
//!   - name: Rover
//!     address: "AA:BB:CC:DD:EE:FF"
//!     device_type: controller
//!   - name: Pack 1
//!     address: "AA:BB:CC:DD:EE:FF"
//!     device_type: battery
//!     unit_id: 48
//! polling:
//!   response_timeout: 5000
//! ```
//!
//! Durations are given in milliseconds.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::error::{RenogyError, RenogyResult};
use crate::registers::{DeviceIdentity, DeviceType};
use crate::utils::format::format_mac_address;

/// Supported nominal system voltages
pub const SUPPORTED_SYSTEM_VOLTAGES: [u32; 3] = [12, 24, 48];

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenogyConfig {
    /// Devices to poll; several may share one address (hub mode)
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,

    /// Nominal system voltage used to scale controller validation limits
    #[serde(default = "default_system_voltage")]
    pub system_voltage: u32,

    /// Polling state machine timings
    #[serde(default)]
    pub polling: PollingConfig,

    /// Log level used by binaries when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// One configured device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub name: String,
    pub address: String,
    pub device_type: String,
    /// Defaults to 255 for controllers and inverters, 247 for batteries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_id: Option<u8>,
}

impl DeviceConfig {
    /// Resolve into a device identity, rejecting unknown device types
    pub fn identity(&self) -> RenogyResult<DeviceIdentity> {
        let device_type: DeviceType = self.device_type.parse()?;
        let unit_id = self.unit_id.unwrap_or_else(|| device_type.default_unit_id());
        DeviceIdentity::new(
            self.name.clone(),
            normalize_address(&self.address),
            device_type,
            unit_id,
        )
    }
}

/// MAC addresses become `XX:XX:XX:XX:XX:XX`; other identifiers (platform
/// UUIDs) are only trimmed and uppercased
fn normalize_address(address: &str) -> String {
    format_mac_address(address).unwrap_or_else(|_| address.trim().to_uppercase())
}

/// Timings of the connection and polling state machine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollingConfig {
    /// Session attempts per `connect()`
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,

    /// Pause between connect attempts
    #[serde(default = "default_retry_delay", with = "duration_millis")]
    pub retry_delay: Duration,

    /// Wait for the first notification of a response
    #[serde(default = "default_response_timeout", with = "duration_millis")]
    pub response_timeout: Duration,

    /// Extra wait for trailing notification fragments
    #[serde(default = "default_settle_delay", with = "duration_millis")]
    pub settle_delay: Duration,

    /// Pause between register groups of one device
    #[serde(default = "default_group_delay", with = "duration_millis")]
    pub group_delay: Duration,

    /// Pause between devices on one link
    #[serde(default = "default_device_delay", with = "duration_millis")]
    pub device_delay: Duration,

    /// Pause after finishing a link
    #[serde(default = "default_link_delay", with = "duration_millis")]
    pub link_delay: Duration,

    /// Pause between links in `connect_all()`
    #[serde(default = "default_connect_delay", with = "duration_millis")]
    pub connect_delay: Duration,

    /// Overall timeout for device-type detection
    #[serde(default = "default_detection_timeout", with = "duration_millis")]
    pub detection_timeout: Duration,

    /// Timeout for a single detection probe
    #[serde(default = "default_probe_timeout", with = "duration_millis")]
    pub probe_timeout: Duration,
}

fn default_system_voltage() -> u32 {
    12
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_connect_attempts() -> u32 {
    3
}

fn default_retry_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_response_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_settle_delay() -> Duration {
    Duration::from_millis(300)
}

fn default_group_delay() -> Duration {
    Duration::from_millis(500)
}

fn default_device_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_link_delay() -> Duration {
    Duration::from_secs(2)
}

fn default_connect_delay() -> Duration {
    Duration::from_secs(3)
}

fn default_detection_timeout() -> Duration {
    Duration::from_secs(15)
}

fn default_probe_timeout() -> Duration {
    Duration::from_secs(3)
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            connect_attempts: default_connect_attempts(),
            retry_delay: default_retry_delay(),
            response_timeout: default_response_timeout(),
            settle_delay: default_settle_delay(),
            group_delay: default_group_delay(),
            device_delay: default_device_delay(),
            link_delay: default_link_delay(),
            connect_delay: default_connect_delay(),
            detection_timeout: default_detection_timeout(),
            probe_timeout: default_probe_timeout(),
        }
    }
}

impl PollingConfig {
    /// All delays and timeouts zeroed except the waits needed for a reply
    pub fn fast() -> Self {
        Self {
            retry_delay: Duration::ZERO,
            settle_delay: Duration::from_millis(10),
            group_delay: Duration::ZERO,
            device_delay: Duration::ZERO,
            link_delay: Duration::ZERO,
            connect_delay: Duration::ZERO,
            ..Self::default()
        }
    }
}

impl Default for RenogyConfig {
    fn default() -> Self {
        Self {
            devices: Vec::new(),
            system_voltage: default_system_voltage(),
            polling: PollingConfig::default(),
            log_level: default_log_level(),
        }
    }
}

impl RenogyConfig {
    /// Load from a `.yaml`/`.yml` or `.json` file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> RenogyResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            RenogyError::configuration(format!("Cannot read {}: {}", path.display(), e))
        })?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json_str(&content),
            Some("yaml") | Some("yml") => Self::from_yaml_str(&content),
            other => Err(RenogyError::configuration(format!(
                "Unsupported configuration format: {:?}",
                other
            ))),
        }
    }

    pub fn from_yaml_str(content: &str) -> RenogyResult<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(content: &str) -> RenogyResult<Self> {
        let config: Self = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check device types, addresses, unit ids and the system voltage
    pub fn validate(&self) -> RenogyResult<()> {
        if !SUPPORTED_SYSTEM_VOLTAGES.contains(&self.system_voltage) {
            return Err(RenogyError::configuration(format!(
                "Unsupported system voltage {} (must be 12, 24 or 48)",
                self.system_voltage
            )));
        }
        if self.polling.connect_attempts == 0 {
            return Err(RenogyError::configuration(
                "connect_attempts must be at least 1",
            ));
        }
        self.device_identities().map(|_| ())
    }

    /// Resolve every configured device, rejecting duplicates
    pub fn device_identities(&self) -> RenogyResult<Vec<DeviceIdentity>> {
        let mut seen = HashSet::new();
        let mut identities = Vec::with_capacity(self.devices.len());
        for device in &self.devices {
            let identity = device.identity()?;
            if !seen.insert(identity.device_key()) {
                return Err(RenogyError::configuration(format!(
                    "Duplicate device {}",
                    identity.device_key()
                )));
            }
            identities.push(identity);
        }
        Ok(identities)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
system_voltage: 24
devices:
  - name: Rover
    address: "aa:bb:cc:dd:ee:ff"
    device_type: controller
  - name: Pack 1
    address: "AA:BB:CC:DD:EE:FF"
    device_type: Battery
    unit_id: 48
  - name: Pack 2
    address: "11:22:33:44:55:66"
    device_type: battery
polling:
  response_timeout: 2500
  group_delay: 0
"#;

    #[test]
    fn test_yaml_loading() {
        let config = RenogyConfig::from_yaml_str(YAML).unwrap();
        assert_eq!(config.system_voltage, 24);
        assert_eq!(config.polling.response_timeout, Duration::from_millis(2500));
        assert_eq!(config.polling.group_delay, Duration::ZERO);
        assert_eq!(config.polling.retry_delay, Duration::from_secs(5));
        assert_eq!(config.log_level, "info");

        let ids = config.device_identities().unwrap();
        assert_eq!(ids.len(), 3);
        assert_eq!(ids[0].device_key(), "AA:BB:CC:DD:EE:FF_controller_255");
        assert_eq!(ids[1].device_key(), "AA:BB:CC:DD:EE:FF_battery_48");
        assert_eq!(ids[2].unit_id, 247);
    }

    #[test]
    fn test_addresses_are_normalized() {
        let device = |address: &str| DeviceConfig {
            name: "Rover".to_string(),
            address: address.to_string(),
            device_type: "controller".to_string(),
            unit_id: None,
        };
        assert_eq!(device("aa-bb-cc-dd-ee-ff").identity().unwrap().address, "AA:BB:CC:DD:EE:FF");
        assert_eq!(device(" aabbccddeeff ").identity().unwrap().address, "AA:BB:CC:DD:EE:FF");
        assert_eq!(
            device("5e3a1c2b-0000-4f00-8000-00805f9b34fb").identity().unwrap().address,
            "5E3A1C2B-0000-4F00-8000-00805F9B34FB"
        );
    }

    #[test]
    fn test_unknown_device_type_is_rejected() {
        let yaml = r#"
devices:
  - name: Panel
    address: "AA:BB:CC:DD:EE:FF"
    device_type: solar
"#;
        let err = RenogyConfig::from_yaml_str(yaml).unwrap_err();
        assert!(matches!(err, RenogyError::InvalidDeviceType { .. }));
        assert!(err.is_configuration_error());
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let bad_voltage = "system_voltage: 36\n";
        assert!(RenogyConfig::from_yaml_str(bad_voltage).is_err());

        let bad_unit = r#"{"devices":[{"name":"x","address":"AA","device_type":"battery","unit_id":0}]}"#;
        assert!(RenogyConfig::from_json_str(bad_unit).is_err());

        let empty_address = r#"{"devices":[{"name":"x","address":" ","device_type":"battery"}]}"#;
        assert!(RenogyConfig::from_json_str(empty_address).is_err());

        let duplicate = r#"{"devices":[
            {"name":"a","address":"AA","device_type":"battery"},
            {"name":"b","address":"aa","device_type":"battery","unit_id":247}]}"#;
        assert!(RenogyConfig::from_json_str(duplicate).is_err());

        assert!(RenogyConfig::from_yaml_str("devices: [").is_err());
    }

    #[test]
    fn test_json_round_trip_uses_milliseconds() {
        let config = RenogyConfig::default();
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["polling"]["settle_delay"], 300);
        assert_eq!(json["polling"]["detection_timeout"], 15000);

        let back = RenogyConfig::from_json_str(&json.to_string()).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_load_from_file() {
        let dir = std::env::temp_dir().join(format!("renogy_ble_cfg_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("devices.yaml");
        std::fs::write(&path, YAML).unwrap();

        let config = RenogyConfig::load_from_file(&path).unwrap();
        assert_eq!(config.devices.len(), 3);

        let txt = dir.join("devices.txt");
        std::fs::write(&txt, YAML).unwrap();
        assert!(RenogyConfig::load_from_file(&txt).is_err());
        assert!(RenogyConfig::load_from_file(dir.join("missing.yaml")).is_err());

        std::fs::remove_dir_all(&dir).ok();
    }
}
