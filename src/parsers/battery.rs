//! Battery (BMS) register groups

use tracing::warn;

use super::decode::{
    ascii, bit, cell_codes, has_payload, read_int, round_to, scaled, set_flags, text_list,
    two_bit_codes, BitTable, HEADER,
};
use super::{Telemetry, TelemetryExt, TelemetryValue};

/// Upper bound on reported cells
pub const MAX_CELLS: usize = 16;

/// Upper bound on reported temperature sensors
pub const MAX_TEMPERATURE_SENSORS: usize = 8;

/// 2-bit protection codes of registers 5104-5105, as (name, bit position)
pub const OTHER_ALARMS: &[(&str, u8)] = &[
    ("bms_board_temp", 0),
    ("bms_board_temp", 2),
    ("env_temp_1", 4),
    ("env_temp_1", 6),
    ("env_temp_2", 8),
    ("env_temp_2", 10),
    ("heater_temp_1", 12),
    ("heater_temp_1", 14),
    ("heater_temp_2", 16),
    ("heater_temp_2", 18),
    ("charge_current", 20),
    ("charge_current", 22),
    ("discharge_current", 24),
    ("discharge_current", 26),
];

/// Register 5106 protection bits
pub const STATUS1_FAULTS: BitTable = &[
    (15, "module_undervoltage"),
    (14, "charge_overtemp"),
    (13, "charge_undertemp"),
    (12, "discharge_overtemp"),
    (11, "discharge_undertemp"),
    (10, "discharge_overcurrent1"),
    (9, "charge_overcurrent1"),
    (8, "cell_overvoltage"),
    (7, "cell_undervoltage"),
    (6, "module_overvoltage"),
    (5, "discharge_overcurrent2"),
    (4, "charge_overcurrent2"),
    (0, "short_circuit"),
];

/// Register 5108 low-byte warnings
pub const STATUS3_WARNINGS: BitTable = &[
    (7, "discharge_high_temp"),
    (6, "discharge_low_temp"),
    (5, "charge_high_temp"),
    (4, "charge_low_temp"),
    (3, "module_high_voltage"),
    (2, "module_low_voltage"),
    (1, "cell_high_voltage"),
    (0, "cell_low_voltage"),
];

/// Registers 5000-5016
pub fn parse_cell_info(data: &[u8]) -> Telemetry {
    let mut result = Telemetry::new();
    if !has_payload(data, 4) {
        return result;
    }

    let cell_count = (read_int(data, HEADER, 2, false) as usize).min(MAX_CELLS);
    let voltages: Vec<TelemetryValue> = (0..cell_count)
        .map(|i| HEADER + 2 + i * 2)
        .take_while(|offset| offset + 2 <= data.len())
        .map(|offset| TelemetryValue::Float(round_to(scaled(data, offset, 2, 0.1, false), 2)))
        .collect();

    result.put("cell_count", cell_count as i64);
    result.insert("cell_voltages".into(), TelemetryValue::List(voltages));
    result
}

/// Registers 5017-5033
pub fn parse_temp_info(data: &[u8]) -> Telemetry {
    let mut result = Telemetry::new();
    if !has_payload(data, 4) {
        return result;
    }

    let count = (read_int(data, HEADER, 2, false) as usize).min(MAX_TEMPERATURE_SENSORS);
    let temperatures: Vec<f64> = (0..count)
        .map(|i| HEADER + 2 + i * 2)
        .take_while(|offset| offset + 2 <= data.len())
        .map(|offset| round_to(read_int(data, offset, 2, true) as f64 * 0.1, 1))
        .collect();

    result.put("temperature_count", count as i64);
    if let Some(first) = temperatures.first() {
        result.put("battery_temperature", *first);
    }
    result.put("temperatures", temperatures);
    result
}

/// Registers 5042-5049: current, voltage and capacity
pub fn parse_battery_info(data: &[u8]) -> Telemetry {
    let mut result = Telemetry::new();
    if !has_payload(data, 12) {
        warn!(
            "Battery info data too short: {} bytes (need {})",
            data.len(),
            HEADER + 12
        );
        return result;
    }

    let current = scaled(data, HEADER, 2, 0.01, true);
    let voltage = scaled(data, HEADER + 2, 2, 0.1, false);
    let remaining = scaled(data, HEADER + 4, 4, 0.001, false);
    let total = scaled(data, HEADER + 8, 4, 0.001, false);

    result.put("current", current);
    result.put("voltage", voltage);
    result.put("remaining_capacity", remaining);
    result.put("total_capacity", total);
    if total > 0.0 {
        result.put("soc", round_to(remaining / total * 100.0, 1));
    } else {
        result.put("soc", 0i64);
    }
    result.put("power", round_to(voltage * current, 1));
    result
}

/// Registers 5100-5109: alarm and status words
pub fn parse_status_info(data: &[u8]) -> Telemetry {
    let mut result = Telemetry::new();
    if !has_payload(data, 20) {
        warn!("Battery alarm data too short: {} bytes", data.len());
        return result;
    }
    let dword = |offset: usize| read_int(data, HEADER + offset, 4, false) as u32;
    let reg = |offset: usize| read_int(data, HEADER + offset, 2, false) as u32;

    let cell_voltage_alarms = cell_codes(dword(0), ["_undervoltage", "_overvoltage", "_alarm"]);
    let cell_temperature_alarms = cell_codes(dword(4), ["_undertemp", "_overtemp", "_temp_alarm"]);

    let mut protection_alarms = two_bit_codes(
        dword(8),
        OTHER_ALARMS.iter().map(|(name, pos)| (name.to_string(), *pos)),
        ["_low", "_high", "_alarm"],
    );

    let status1 = reg(12);
    protection_alarms.extend(set_flags(status1, STATUS1_FAULTS));
    result.put("using_battery_power", bit(status1, 3));
    result.put("discharge_mosfet", if bit(status1, 2) { "on" } else { "off" });
    result.put("charge_mosfet", if bit(status1, 1) { "on" } else { "off" });

    let status2 = reg(14);
    result.put("effective_charge", bit(status2, 15));
    result.put("effective_discharge", bit(status2, 14));
    result.put("heater_on", bit(status2, 13));
    result.put("fully_charged", bit(status2, 11));
    result.put("buzzer_on", bit(status2, 8));

    let status3 = reg(16);
    let mut warnings = set_flags(status3, STATUS3_WARNINGS);
    warnings.extend(
        (0..8u8)
            .filter(|i| bit(status3, 8 + i))
            .map(|i| format!("cell_{}_voltage_error", 11 + i)),
    );

    let status4 = reg(18);
    result.put("discharge_enabled", bit(status4, 7));
    result.put("charge_enabled", bit(status4, 6));
    result.put("charge_immediately", bit(status4, 5));
    result.put("full_charge_request", bit(status4, 3));

    let alarms: Vec<String> = cell_voltage_alarms
        .iter()
        .chain(&cell_temperature_alarms)
        .chain(&protection_alarms)
        .cloned()
        .collect();

    result.put("alarm_count", alarms.len() as i64);
    result.put("warning_count", warnings.len() as i64);
    result.insert("alarms".into(), text_list(alarms));
    result.insert("cell_voltage_alarms".into(), text_list(cell_voltage_alarms));
    result.insert(
        "cell_temperature_alarms".into(),
        text_list(cell_temperature_alarms),
    );
    result.insert("protection_alarms".into(), text_list(protection_alarms));
    result.insert("warnings".into(), text_list(warnings));
    result
}

/// Registers 5122-5129
pub fn parse_device_info(data: &[u8]) -> Telemetry {
    let mut result = Telemetry::new();
    if !has_payload(data, 16) {
        return result;
    }
    result.put("model", ascii(data, HEADER, 16));
    result
}
