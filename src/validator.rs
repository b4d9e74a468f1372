//! Range and spike filter for polled telemetry
//!
//! Charge controllers occasionally report garbage readings. Each controller
//! gets a [`DataValidator`] holding per-field bounds and the last accepted
//! value of every field; a reading outside its bounds, or one that jumps
//! further than `max_change` from the last accepted value, is rejected and
//! replaced with that last accepted value. Batteries and inverters pass
//! through untouched.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use tracing::{debug, warn};

use crate::parsers::{Telemetry, TelemetryValue};
use crate::registers::DeviceType;

/// Rejections kept per device
pub const MAX_REJECTION_LOG: usize = 100;

/// Rejections returned as "recent" in [`RejectionStats`]
const RECENT_REJECTIONS: usize = 5;

/// Bounds for one field
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FieldLimits {
    pub min: f64,
    pub max: f64,
    /// Largest accepted change from the last accepted value
    pub max_change: f64,
}

impl FieldLimits {
    pub const fn new(min: f64, max: f64, max_change: f64) -> Self {
        Self { min, max, max_change }
    }
}

/// Controller bounds for a 12 V system
pub const CONTROLLER_BASE_LIMITS: &[(&str, FieldLimits)] = &[
    ("battery_voltage", FieldLimits::new(0.0, 20.0, 5.0)),
    ("battery_current", FieldLimits::new(-100.0, 100.0, 50.0)),
    ("battery_percentage", FieldLimits::new(0.0, 100.0, 50.0)),
    ("battery_temperature", FieldLimits::new(-40.0, 85.0, 20.0)),
    ("charging_amp_hours_today", FieldLimits::new(0.0, 10000.0, 200.0)),
    ("discharging_amp_hours_today", FieldLimits::new(0.0, 10000.0, 200.0)),
    ("pv_voltage", FieldLimits::new(0.0, 30.0, 10.0)),
    ("pv_current", FieldLimits::new(0.0, 100.0, 50.0)),
    ("pv_power", FieldLimits::new(0.0, 5000.0, 2000.0)),
    ("max_charging_power_today", FieldLimits::new(0.0, 5000.0, 5000.0)),
    ("power_generation_today", FieldLimits::new(0.0, 50000.0, 50000.0)),
    ("power_generation_total", FieldLimits::new(0.0, 1e9, 100000.0)),
    ("load_voltage", FieldLimits::new(0.0, 20.0, 20.0)),
    ("load_current", FieldLimits::new(0.0, 20.0, 20.0)),
    ("load_power", FieldLimits::new(0.0, 3000.0, 1500.0)),
    ("power_consumption_today", FieldLimits::new(0.0, 50000.0, 50000.0)),
    ("max_discharging_power_today", FieldLimits::new(0.0, 3000.0, 3000.0)),
    ("controller_temperature", FieldLimits::new(-40.0, 85.0, 20.0)),
];

/// Fields whose `max` and `max_change` scale with the system voltage
const VOLTAGE_SCALED_FIELDS: &[&str] = &["battery_voltage", "pv_voltage", "load_voltage"];

/// Controller bounds for `system_voltage` (12 V → 1x, 24 V → 2x, 48 V → 4x)
pub fn controller_limits(system_voltage: u32) -> HashMap<String, FieldLimits> {
    let multiplier = (system_voltage as f64 / 12.0).max(1.0);
    CONTROLLER_BASE_LIMITS
        .iter()
        .map(|&(field, limits)| {
            let limits = if VOLTAGE_SCALED_FIELDS.contains(&field) {
                FieldLimits::new(limits.min, limits.max * multiplier, limits.max_change * multiplier)
            } else {
                limits
            };
            (field.to_string(), limits)
        })
        .collect()
}

/// Why a reading was rejected
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RejectionReason {
    BelowMinimum { value: f64, min: f64 },
    AboveMaximum { value: f64, max: f64 },
    SpikeDetected { value: f64, last: f64, change: f64, max_change: f64 },
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectionReason::BelowMinimum { value, min } => {
                write!(f, "below_minimum (value={}, min={})", value, min)
            }
            RejectionReason::AboveMaximum { value, max } => {
                write!(f, "above_maximum (value={}, max={})", value, max)
            }
            RejectionReason::SpikeDetected { value, last, change, max_change } => write!(
                f,
                "spike_detected (value={}, last={}, change={:.2}, max_change={})",
                value, last, change, max_change
            ),
        }
    }
}

/// One rejected reading
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Rejection {
    pub timestamp: DateTime<Utc>,
    pub field: String,
    pub rejected_value: TelemetryValue,
    pub reason: RejectionReason,
    pub last_good_value: Option<TelemetryValue>,
}

/// Summary of a validator's rejection log
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RejectionStats {
    pub total_rejections: usize,
    pub recent_rejections: Vec<Rejection>,
    pub rejection_counts_by_field: BTreeMap<String, usize>,
    pub last_rejection_time: Option<DateTime<Utc>>,
}

/// Per-device range and spike filter
#[derive(Debug, Clone)]
pub struct DataValidator {
    device_name: String,
    device_type: DeviceType,
    limits: HashMap<String, FieldLimits>,
    last_good: HashMap<String, TelemetryValue>,
    rejection_log: VecDeque<Rejection>,
}

impl DataValidator {
    /// Controllers get [`controller_limits`]; other types get no limits
    pub fn new(device_name: impl Into<String>, device_type: DeviceType, system_voltage: u32) -> Self {
        let limits = match device_type {
            DeviceType::Controller => controller_limits(system_voltage),
            DeviceType::Battery | DeviceType::Inverter => HashMap::new(),
        };
        Self {
            device_name: device_name.into(),
            device_type,
            limits,
            last_good: HashMap::new(),
            rejection_log: VecDeque::with_capacity(MAX_REJECTION_LOG),
        }
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn device_type(&self) -> DeviceType {
        self.device_type
    }

    /// Bounds applied to `field`, if any
    pub fn limits(&self, field: &str) -> Option<FieldLimits> {
        self.limits.get(field).copied()
    }

    /// Last accepted value of `field`
    pub fn last_good(&self, field: &str) -> Option<&TelemetryValue> {
        self.last_good.get(field)
    }

    /// Filter one record
    ///
    /// Returns the record with rejected readings replaced by their last
    /// accepted value (or left as-is when there is none), plus the
    /// rejections. Unknown and non-numeric fields pass through.
    pub fn validate(&mut self, data: &Telemetry) -> (Telemetry, Vec<Rejection>) {
        if self.limits.is_empty() {
            return (data.clone(), Vec::new());
        }

        let mut validated = data.clone();
        let mut rejections = Vec::new();

        for (field, value) in data {
            let Some(limits) = self.limits.get(field).copied() else {
                continue;
            };
            let Some(reading) = value.as_f64() else {
                continue;
            };

            let last = self.last_good.get(field).and_then(TelemetryValue::as_f64);
            let Some(reason) = check(reading, limits, last) else {
                self.last_good.insert(field.clone(), value.clone());
                continue;
            };

            warn!(
                "[{}] Data rejected: {}={} - {}",
                self.device_name, field, value, reason
            );

            let last_good_value = self.last_good.get(field).cloned();
            if let Some(previous) = &last_good_value {
                validated.insert(field.clone(), previous.clone());
            }

            let rejection = Rejection {
                timestamp: Utc::now(),
                field: field.clone(),
                rejected_value: value.clone(),
                reason,
                last_good_value,
            };
            self.push_rejection(rejection.clone());
            rejections.push(rejection);
        }

        if !rejections.is_empty() {
            debug!(
                "[{}] {} of {} fields rejected",
                self.device_name,
                rejections.len(),
                data.len()
            );
        }
        (validated, rejections)
    }

    fn push_rejection(&mut self, rejection: Rejection) {
        if self.rejection_log.len() == MAX_REJECTION_LOG {
            self.rejection_log.pop_front();
        }
        self.rejection_log.push_back(rejection);
    }

    pub fn rejection_stats(&self) -> RejectionStats {
        let mut counts = BTreeMap::new();
        for rejection in &self.rejection_log {
            *counts.entry(rejection.field.clone()).or_insert(0) += 1;
        }

        let skip = self.rejection_log.len().saturating_sub(RECENT_REJECTIONS);
        RejectionStats {
            total_rejections: self.rejection_log.len(),
            recent_rejections: self.rejection_log.iter().skip(skip).cloned().collect(),
            rejection_counts_by_field: counts,
            last_rejection_time: self.rejection_log.back().map(|r| r.timestamp),
        }
    }

    pub fn last_rejection(&self) -> Option<&Rejection> {
        self.rejection_log.back()
    }

    pub fn clear_rejection_log(&mut self) {
        self.rejection_log.clear();
    }
}

/// Range check first; the spike check only applies to in-range readings
fn check(value: f64, limits: FieldLimits, last: Option<f64>) -> Option<RejectionReason> {
    if value < limits.min {
        return Some(RejectionReason::BelowMinimum { value, min: limits.min });
    }
    if value > limits.max {
        return Some(RejectionReason::AboveMaximum { value, max: limits.max });
    }
    let last = last?;
    let change = (value - last).abs();
    if change > limits.max_change {
        return Some(RejectionReason::SpikeDetected {
            value,
            last,
            change,
            max_change: limits.max_change,
        });
    }
    None
}

/// One validator per `(device name, device type)`, created on first use
#[derive(Debug, Default)]
pub struct ValidatorManager {
    validators: BTreeMap<String, DataValidator>,
}

impl ValidatorManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the validator for a device
    ///
    /// `system_voltage` only matters on creation.
    pub fn validator(
        &mut self,
        device_name: &str,
        device_type: DeviceType,
        system_voltage: u32,
    ) -> &mut DataValidator {
        self.validators
            .entry(format!("{}_{}", device_name, device_type))
            .or_insert_with(|| DataValidator::new(device_name, device_type, system_voltage))
    }

    pub fn validate_device_data(
        &mut self,
        device_name: &str,
        device_type: DeviceType,
        data: &Telemetry,
        system_voltage: u32,
    ) -> (Telemetry, Vec<Rejection>) {
        self.validator(device_name, device_type, system_voltage)
            .validate(data)
    }

    /// Rejection stats keyed by `"{device name}_{device type}"`
    pub fn all_rejection_stats(&self) -> BTreeMap<String, RejectionStats> {
        self.validators
            .iter()
            .map(|(key, validator)| (key.clone(), validator.rejection_stats()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }
}
