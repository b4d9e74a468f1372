//! Register response parsers
//!
//! A static table maps `(device type, starting address)` to a decoder. Each
//! decoder takes the complete response frame (header included) and returns
//! the fields it could decode, or an empty map when the frame is shorter than
//! the group requires.

pub mod battery;
pub mod controller;
pub mod decode;
pub mod inverter;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use tracing::{debug, error, warn};

use crate::protocol::RegisterAddress;
use crate::registers::DeviceType;

/// A single decoded field value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TelemetryValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<TelemetryValue>),
}

impl TelemetryValue {
    /// Numeric view of integer and float values
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            TelemetryValue::Int(v) => Some(*v as f64),
            TelemetryValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            TelemetryValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            TelemetryValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[TelemetryValue]> {
        match self {
            TelemetryValue::List(items) => Some(items),
            _ => None,
        }
    }
}

impl fmt::Display for TelemetryValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TelemetryValue::Bool(v) => write!(f, "{}", v),
            TelemetryValue::Int(v) => write!(f, "{}", v),
            TelemetryValue::Float(v) => write!(f, "{}", v),
            TelemetryValue::Text(v) => f.write_str(v),
            TelemetryValue::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                f.write_str("]")
            }
        }
    }
}

impl From<i64> for TelemetryValue {
    fn from(v: i64) -> Self {
        TelemetryValue::Int(v)
    }
}

impl From<f64> for TelemetryValue {
    fn from(v: f64) -> Self {
        TelemetryValue::Float(v)
    }
}

impl From<bool> for TelemetryValue {
    fn from(v: bool) -> Self {
        TelemetryValue::Bool(v)
    }
}

impl From<String> for TelemetryValue {
    fn from(v: String) -> Self {
        TelemetryValue::Text(v)
    }
}

impl From<&str> for TelemetryValue {
    fn from(v: &str) -> Self {
        TelemetryValue::Text(v.to_string())
    }
}

impl<T: Into<TelemetryValue>> From<Vec<T>> for TelemetryValue {
    fn from(v: Vec<T>) -> Self {
        TelemetryValue::List(v.into_iter().map(Into::into).collect())
    }
}

/// Field name → value for one device
pub type Telemetry = BTreeMap<String, TelemetryValue>;

/// Signature shared by every group decoder
pub type Decoder = fn(&[u8]) -> Telemetry;

/// Small helper for building telemetry maps
pub(crate) trait TelemetryExt {
    fn put<V: Into<TelemetryValue>>(&mut self, key: &str, value: V);
}

impl TelemetryExt for Telemetry {
    fn put<V: Into<TelemetryValue>>(&mut self, key: &str, value: V) {
        self.insert(key.to_string(), value.into());
    }
}

const CONTROLLER_PARSERS: &[(RegisterAddress, Decoder)] = &[
    (12, controller::parse_device_info),
    (26, controller::parse_device_id),
    (256, controller::parse_charging_info),
    (289, controller::parse_faults),
    (57348, controller::parse_battery_type),
    (60000, controller::parse_historical),
];

const BATTERY_PARSERS: &[(RegisterAddress, Decoder)] = &[
    (5000, battery::parse_cell_info),
    (5017, battery::parse_temp_info),
    (5042, battery::parse_battery_info),
    (5100, battery::parse_status_info),
    (5122, battery::parse_device_info),
];

const INVERTER_PARSERS: &[(RegisterAddress, Decoder)] = &[
    (4000, inverter::parse_main_status),
    (4303, inverter::parse_device_info),
    (4327, inverter::parse_pv_info),
    (4398, inverter::parse_settings_status),
    (4441, inverter::parse_settings),
    (4543, inverter::parse_statistics),
];

/// Find the decoder for a register group
pub fn decoder_for(device_type: DeviceType, address: RegisterAddress) -> Option<Decoder> {
    let table = match device_type {
        DeviceType::Controller => CONTROLLER_PARSERS,
        DeviceType::Battery => BATTERY_PARSERS,
        DeviceType::Inverter => INVERTER_PARSERS,
    };
    table
        .iter()
        .find(|(addr, _)| *addr == address)
        .map(|(_, decoder)| *decoder)
}

/// Decode a response frame for the given register group
///
/// Unknown groups and decoder failures (including panics) yield an empty map.
pub fn parse_response(device_type: DeviceType, address: RegisterAddress, data: &[u8]) -> Telemetry {
    let decoder = match decoder_for(device_type, address) {
        Some(decoder) => decoder,
        None => {
            warn!("Unknown register {} for {}", address, device_type);
            return Telemetry::new();
        }
    };

    match panic::catch_unwind(AssertUnwindSafe(|| decoder(data))) {
        Ok(result) => {
            debug!("Parsed {} register {}: {} fields", device_type, address, result.len());
            result
        }
        Err(_) => {
            error!("Error parsing {} register {}", device_type, address);
            Telemetry::new()
        }
    }
}

/// Parse a device type by name and decode; unknown names yield an empty map
pub fn parse_response_named(device_type: &str, address: RegisterAddress, data: &[u8]) -> Telemetry {
    match device_type.parse::<DeviceType>() {
        Ok(device_type) => parse_response(device_type, address, data),
        Err(_) => {
            warn!("Unknown device type: {}", device_type);
            Telemetry::new()
        }
    }
}
