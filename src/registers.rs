//! Device types, register catalogs and device identities
//!
//! Each device type owns a fixed, ordered catalog of register groups. A poll
//! of one logical device walks its catalog in order.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{RenogyError, RenogyResult};
use crate::protocol::{RegisterAddress, UnitId};
use crate::utils::validation::validate_unit_id;

/// Default unit id for charge controllers
pub const DEFAULT_CONTROLLER_UNIT_ID: UnitId = 255;

/// Default unit id for batteries
pub const DEFAULT_BATTERY_UNIT_ID: UnitId = 247;

/// Default unit id for inverters
pub const DEFAULT_INVERTER_UNIT_ID: UnitId = 255;

/// Kind of device behind a unit id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Controller,
    Battery,
    Inverter,
}

impl DeviceType {
    /// All known device types
    pub const ALL: [DeviceType; 3] = [
        DeviceType::Controller,
        DeviceType::Battery,
        DeviceType::Inverter,
    ];

    /// Lowercase name as used in device keys and configuration
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Controller => "controller",
            DeviceType::Battery => "battery",
            DeviceType::Inverter => "inverter",
        }
    }

    /// Unit id used when the configuration does not name one
    pub fn default_unit_id(&self) -> UnitId {
        match self {
            DeviceType::Controller => DEFAULT_CONTROLLER_UNIT_ID,
            DeviceType::Battery => DEFAULT_BATTERY_UNIT_ID,
            DeviceType::Inverter => DEFAULT_INVERTER_UNIT_ID,
        }
    }

    /// Ordered register catalog for this type
    pub fn registers(&self) -> &'static [RegisterGroup] {
        registers_for(*self)
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceType {
    type Err = RenogyError;

    fn from_str(s: &str) -> RenogyResult<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "controller" => Ok(DeviceType::Controller),
            "battery" => Ok(DeviceType::Battery),
            "inverter" => Ok(DeviceType::Inverter),
            _ => Err(RenogyError::invalid_device_type(s)),
        }
    }
}

/// A contiguous block of registers read with one request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterGroup {
    pub name: &'static str,
    pub address: RegisterAddress,
    pub words: u16,
}

impl RegisterGroup {
    const fn new(name: &'static str, address: RegisterAddress, words: u16) -> Self {
        Self { name, address, words }
    }
}

pub const CONTROLLER_REGISTERS: &[RegisterGroup] = &[
    RegisterGroup::new("device_info", 12, 8),
    RegisterGroup::new("device_id", 26, 1),
    RegisterGroup::new("charging_info", 256, 34),
    RegisterGroup::new("faults", 289, 2),
    RegisterGroup::new("battery_type", 57348, 1),
    RegisterGroup::new("historical", 60000, 21),
];

pub const BATTERY_REGISTERS: &[RegisterGroup] = &[
    RegisterGroup::new("cell_info", 5000, 17),
    RegisterGroup::new("temp_info", 5017, 17),
    RegisterGroup::new("battery_info", 5042, 8),
    RegisterGroup::new("status_info", 5100, 10),
    RegisterGroup::new("device_info", 5122, 8),
];

pub const INVERTER_REGISTERS: &[RegisterGroup] = &[
    RegisterGroup::new("main_status", 4000, 10),
    RegisterGroup::new("device_info", 4303, 24),
    RegisterGroup::new("pv_info", 4327, 7),
    RegisterGroup::new("settings_status", 4398, 20),
    RegisterGroup::new("settings", 4441, 4),
    RegisterGroup::new("statistics", 4543, 25),
];

/// Ordered register catalog for a device type
pub fn registers_for(device_type: DeviceType) -> &'static [RegisterGroup] {
    match device_type {
        DeviceType::Controller => CONTROLLER_REGISTERS,
        DeviceType::Battery => BATTERY_REGISTERS,
        DeviceType::Inverter => INVERTER_REGISTERS,
    }
}

/// One logical device reachable over a physical link
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub name: String,
    pub address: String,
    pub device_type: DeviceType,
    pub unit_id: UnitId,
}

impl DeviceIdentity {
    /// Create an identity, rejecting an empty address or unit id 0
    pub fn new<N: Into<String>, A: Into<String>>(
        name: N,
        address: A,
        device_type: DeviceType,
        unit_id: UnitId,
    ) -> RenogyResult<Self> {
        let address = address.into();
        if address.trim().is_empty() {
            return Err(RenogyError::configuration("Device address must not be empty"));
        }
        validate_unit_id(unit_id)?;
        Ok(Self {
            name: name.into(),
            address,
            device_type,
            unit_id,
        })
    }

    /// Create an identity using the type's default unit id
    pub fn with_default_unit<N: Into<String>, A: Into<String>>(
        name: N,
        address: A,
        device_type: DeviceType,
    ) -> RenogyResult<Self> {
        Self::new(name, address, device_type, device_type.default_unit_id())
    }

    /// Stable key `"{address}_{type}_{unit_id}"`
    pub fn device_key(&self) -> String {
        device_key(&self.address, self.device_type, self.unit_id)
    }
}

/// Build a device key from its parts
pub fn device_key(address: &str, device_type: DeviceType, unit_id: UnitId) -> String {
    format!("{}_{}_{}", address, device_type, unit_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_type_parsing() {
        assert_eq!("controller".parse::<DeviceType>().unwrap(), DeviceType::Controller);
        assert_eq!("Battery".parse::<DeviceType>().unwrap(), DeviceType::Battery);
        assert_eq!(" INVERTER ".parse::<DeviceType>().unwrap(), DeviceType::Inverter);

        let err = "solar".parse::<DeviceType>().unwrap_err();
        assert!(matches!(err, RenogyError::InvalidDeviceType { .. }));
    }

    #[test]
    fn test_catalogs() {
        let addrs: Vec<u16> = CONTROLLER_REGISTERS.iter().map(|g| g.address).collect();
        assert_eq!(addrs, vec![12, 26, 256, 289, 57348, 60000]);

        let battery = registers_for(DeviceType::Battery);
        assert_eq!(battery.len(), 5);
        assert_eq!(battery[4].address, 5122);
        assert_eq!(battery[4].words, 8);

        let inverter = DeviceType::Inverter.registers();
        assert_eq!(inverter.first().map(|g| g.name), Some("main_status"));
        assert_eq!(inverter.last().map(|g| g.words), Some(25));
    }

    #[test]
    fn test_device_key() {
        let id = DeviceIdentity::new("Rover", "AA:BB:CC:DD:EE:FF", DeviceType::Controller, 255)
            .unwrap();
        assert_eq!(id.device_key(), "AA:BB:CC:DD:EE:FF_controller_255");

        let id = DeviceIdentity::with_default_unit("Pack", "11:22:33:44:55:66", DeviceType::Battery)
            .unwrap();
        assert_eq!(id.unit_id, 247);
        assert_eq!(id.device_key(), "11:22:33:44:55:66_battery_247");
    }

    #[test]
    fn test_identity_rejects_bad_input() {
        assert!(DeviceIdentity::new("x", "", DeviceType::Battery, 48).is_err());
        assert!(DeviceIdentity::new("x", "AA", DeviceType::Battery, 0).is_err());
    }
}
