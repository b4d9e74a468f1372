//! Poll cycle driver and snapshot producer
//!
//! A [`Coordinator`] runs one manager poll per [`Coordinator::refresh`],
//! passes every record through its device's validator and folds the result
//! into a snapshot keyed by device key. Devices missing from a cycle keep
//! their previous entry.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::RenogyConfig;
use crate::connection::is_tag;
use crate::error::{RenogyError, RenogyResult};
use crate::manager::DeviceManager;
use crate::parsers::{Telemetry, TelemetryValue};
use crate::registers::{DeviceIdentity, DeviceType};
use crate::transport::TransportFactory;
use crate::validator::ValidatorManager;

/// Link type reported for every device
pub const LINK_TYPE: &str = "Bluetooth";

/// A field value and its unit symbol (empty when unitless)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldReading(pub TelemetryValue, pub &'static str);

/// Published view of one device
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceSnapshot {
    pub name: String,
    pub model: String,
    pub firmware: String,
    pub serial: String,
    pub physical_address: String,
    pub link_type: String,
    pub device_type: DeviceType,
    pub fields: BTreeMap<String, FieldReading>,
}

/// `device_key → device`
pub type Snapshot = BTreeMap<String, DeviceSnapshot>;

/// Unit symbol for a field, derived from its name
pub fn field_unit(name: &str) -> &'static str {
    if name.ends_with("_voltage") || name.ends_with("_voltages") || name == "voltage" {
        "V"
    } else if name.ends_with("_current") || name == "current" {
        "A"
    } else if name.contains("amp_hours") || name.contains("_ah_") || name.ends_with("_capacity") {
        "Ah"
    } else if name.starts_with("power_generation") || name.starts_with("power_consumption") {
        "Wh"
    } else if name.ends_with("_power") || name.contains("_power_") || name == "power" {
        "W"
    } else if name.ends_with("temperature") || name == "temperatures" {
        "°C"
    } else if name.ends_with("_percentage") || name.ends_with("soc") {
        "%"
    } else if name.contains("frequency") {
        "Hz"
    } else if name.contains("_generation_") || name.contains("_consumption_") {
        "kWh"
    } else {
        ""
    }
}

fn text_field(data: &Telemetry, key: &str) -> Option<String> {
    data.get(key)
        .and_then(TelemetryValue::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Build the published entry for one validated record
pub fn device_snapshot(identity: &DeviceIdentity, data: &Telemetry) -> DeviceSnapshot {
    let type_name = identity.device_type.as_str();
    let default_model = format!(
        "Renogy {}{}",
        type_name[..1].to_ascii_uppercase(),
        &type_name[1..]
    );

    DeviceSnapshot {
        name: identity.name.clone(),
        model: text_field(data, "model").unwrap_or(default_model),
        firmware: text_field(data, "firmware_version").unwrap_or_default(),
        serial: String::new(),
        physical_address: identity.address.clone(),
        link_type: LINK_TYPE.to_string(),
        device_type: identity.device_type,
        fields: data
            .iter()
            .filter(|(key, _)| !is_tag(key))
            .map(|(key, value)| (key.clone(), FieldReading(value.clone(), field_unit(key))))
            .collect(),
    }
}

/// Runs poll cycles and maintains the published snapshot
pub struct Coordinator {
    manager: DeviceManager,
    validators: ValidatorManager,
    system_voltage: u32,
    snapshot: Snapshot,
}

impl Coordinator {
    pub fn new(manager: DeviceManager, system_voltage: u32) -> Self {
        Self {
            manager,
            validators: ValidatorManager::new(),
            system_voltage,
            snapshot: Snapshot::new(),
        }
    }

    /// Validate `config` and build a manager for its devices
    pub fn from_config(
        config: &RenogyConfig,
        factory: Arc<dyn TransportFactory>,
    ) -> RenogyResult<Self> {
        config.validate()?;
        let devices = config.device_identities()?;
        let manager = DeviceManager::new(devices, factory, config.polling.clone());
        Ok(Self::new(manager, config.system_voltage))
    }

    /// Run one poll cycle and return the updated snapshot
    ///
    /// A cycle that yields nothing returns the previous snapshot; it is an
    /// error only when no snapshot was ever produced.
    pub async fn refresh(&mut self) -> RenogyResult<&Snapshot> {
        let results = self.manager.poll_all().await;

        if results.is_empty() {
            if self.snapshot.is_empty() {
                return Err(RenogyError::connection("No data received from BLE device"));
            }
            warn!("Poll cycle produced no data; keeping previous snapshot");
            return Ok(&self.snapshot);
        }

        for (key, raw) in results {
            let Some(identity) = self
                .manager
                .device_health(&key)
                .map(|health| health.identity.clone())
            else {
                warn!("Result for unknown device {}", key);
                continue;
            };

            let (validated, rejections) = self.validators.validate_device_data(
                &identity.name,
                identity.device_type,
                &raw,
                self.system_voltage,
            );
            if !rejections.is_empty() {
                debug!("Rejected {} values for {}", rejections.len(), identity.name);
            }

            self.snapshot.insert(key, device_snapshot(&identity, &validated));
        }

        debug!("Snapshot holds {} devices", self.snapshot.len());
        Ok(&self.snapshot)
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    pub fn manager(&self) -> &DeviceManager {
        &self.manager
    }

    pub fn manager_mut(&mut self) -> &mut DeviceManager {
        &mut self.manager
    }

    pub fn validators(&self) -> &ValidatorManager {
        &self.validators
    }

    /// Stop the manager and close every link
    pub async fn shutdown(&mut self) {
        self.manager.stop().await;
    }
}
