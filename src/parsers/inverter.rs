//! Inverter register groups

use super::decode::{
    ascii, bit, has_payload, lookup, read_int, round_to, scaled, set_flags, text_list, word,
    BitTable, HEADER,
};
use super::{Telemetry, TelemetryExt};

/// Raw readings at or above this value mean "not present"
pub const SENTINEL: i64 = 65000;

pub const CHARGING_STATE: &[(i64, &str)] = &[
    (0, "not_charging"),
    (1, "constant_current"),
    (2, "constant_voltage"),
    (4, "float"),
    (6, "battery_activation"),
    (7, "battery_disconnect"),
];

pub const MACHINE_STATE: &[(i64, &str)] = &[
    (0, "power_on_delay"),
    (1, "waiting"),
    (2, "initialization"),
    (3, "soft_start"),
    (4, "mains_operation"),
    (5, "inverter_operation"),
    (6, "inverter_to_mains"),
    (7, "mains_to_inverter"),
    (10, "shutdown"),
    (11, "fault"),
];

pub const OUTPUT_PRIORITY: &[(i64, &str)] = &[(0, "solar"), (1, "line"), (2, "sbu")];

pub const HIGH_FAULTS: BitTable = &[
    (15, "input_uvp"),
    (14, "input_ovp"),
    (13, "output_overload"),
    (12, "dcdc_overload"),
    (11, "dcdc_overcurrent"),
    (10, "bus_overvoltage"),
    (9, "ground_fault"),
    (8, "over_temperature"),
    (7, "output_short_circuit"),
    (6, "output_uvp"),
    (5, "output_ovp"),
];

pub const LOW_FAULTS: BitTable = &[
    (15, "utility_fail"),
    (14, "battery_low"),
    (13, "apr_active"),
    (12, "ups_fail"),
    (9, "shutdown_active"),
    (7, "fan_locked"),
    (6, "inverter_overload"),
    (5, "inverter_short_circuit"),
    (4, "battery_bad"),
];

/// Scale a raw reading, mapping sentinel values to 0
fn sentinel_scaled(data: &[u8], offset: usize, scale: f64) -> f64 {
    let raw = read_int(data, offset, 2, false);
    if raw >= SENTINEL {
        0.0
    } else {
        round_to(raw as f64 * scale, 2)
    }
}

/// Registers 4000-4009
pub fn parse_main_status(data: &[u8]) -> Telemetry {
    let mut result = Telemetry::new();
    if !has_payload(data, 18) {
        return result;
    }

    let input_voltage = sentinel_scaled(data, HEADER, 0.1);
    let input_current = sentinel_scaled(data, HEADER + 2, 0.01);
    let output_voltage = scaled(data, HEADER + 4, 2, 0.1, false);
    let output_current = scaled(data, HEADER + 6, 2, 0.01, false);

    result.put("input_voltage", input_voltage);
    result.put("input_current", input_current);
    result.put("output_voltage", output_voltage);
    result.put("output_current", output_current);
    result.put("output_frequency", scaled(data, HEADER + 8, 2, 0.01, false));
    result.put("battery_voltage", scaled(data, HEADER + 10, 2, 0.1, false));
    result.put("temperature", scaled(data, HEADER + 12, 2, 0.1, false));

    let status_high = read_int(data, HEADER + 14, 2, false) as u32;
    let status_low = read_int(data, HEADER + 16, 2, false) as u32;

    let mut faults = set_flags(status_high, HIGH_FAULTS);
    faults.extend(set_flags(status_low, LOW_FAULTS));

    result.put("eco_mode", bit(status_high, 4));
    result.put("ups_line_interactive", bit(status_low, 11));
    result.put("test_in_progress", bit(status_low, 10));
    result.put("beeper_on", bit(status_low, 8));
    result.put("fault_count", faults.len() as i64);
    result.insert("faults".into(), text_list(faults));

    if has_payload(data, 20) {
        result.put("input_frequency", sentinel_scaled(data, HEADER + 18, 0.01));
    }

    let input_power = if input_voltage > 0.0 && input_current > 0.0 {
        round_to(input_voltage * input_current, 1)
    } else {
        0.0
    };
    result.put("input_power", input_power);
    result.put("output_power", round_to(output_voltage * output_current, 1));
    result
}

/// Registers 4303-4326
pub fn parse_device_info(data: &[u8]) -> Telemetry {
    let mut result = Telemetry::new();
    if !has_payload(data, 48) {
        return result;
    }
    result.put("manufacturer", ascii(data, HEADER, 16));
    result.put("model", ascii(data, HEADER + 16, 16));
    result.put("firmware_version", ascii(data, HEADER + 32, 16));
    result
}

/// Registers 4327-4333
pub fn parse_pv_info(data: &[u8]) -> Telemetry {
    let mut result = Telemetry::new();
    if !has_payload(data, 12) {
        return result;
    }
    result.insert("battery_soc".into(), word(data, HEADER));
    result.put("charge_current", scaled(data, HEADER + 2, 2, 0.1, false));
    result.put("pv_voltage", scaled(data, HEADER + 4, 2, 0.1, false));
    result.put("pv_current", scaled(data, HEADER + 6, 2, 0.1, false));
    result.insert("pv_power".into(), word(data, HEADER + 8));

    let charge_state = read_int(data, HEADER + 10, 2, false) & 0xFF;
    result.put("charging_status", lookup(CHARGING_STATE, charge_state));
    result
}

/// Registers 4398-4417
pub fn parse_settings_status(data: &[u8]) -> Telemetry {
    let mut result = Telemetry::new();
    if !has_payload(data, 30) {
        return result;
    }

    let machine_state = read_int(data, HEADER + 14, 2, false);
    result.put("machine_state", lookup(MACHINE_STATE, machine_state));
    result.put("bus_voltage", scaled(data, HEADER + 18, 2, 0.1, false));
    result.put("load_current", scaled(data, HEADER + 20, 2, 0.1, false));
    result.insert("load_active_power".into(), word(data, HEADER + 22));
    result.insert("load_apparent_power".into(), word(data, HEADER + 24));

    if has_payload(data, 32) {
        result.insert("load_percentage".into(), word(data, HEADER + 30));
    }
    result
}

/// Registers 4441-4444
pub fn parse_settings(data: &[u8]) -> Telemetry {
    let mut result = Telemetry::new();
    if !has_payload(data, 8) {
        return result;
    }

    let priority = read_int(data, HEADER, 2, false);
    result.put("output_priority", lookup(OUTPUT_PRIORITY, priority));

    let frequency = read_int(data, HEADER + 2, 2, false);
    result.put("output_frequency_setting", round_to(frequency as f64 * 0.01, 1));

    let ac_range = read_int(data, HEADER + 4, 2, false);
    result.put("ac_voltage_range", if ac_range == 0 { "wide" } else { "narrow" });

    result.put("power_saving_mode", read_int(data, HEADER + 6, 2, false) == 1);
    result
}

/// Registers 4543-4567
pub fn parse_statistics(data: &[u8]) -> Telemetry {
    let mut result = Telemetry::new();
    if !has_payload(data, 10) {
        return result;
    }

    result.insert("battery_charge_ah_today".into(), word(data, HEADER));
    result.insert("battery_discharge_ah_today".into(), word(data, HEADER + 2));
    result.put("pv_generation_today", scaled(data, HEADER + 4, 2, 0.1, false));
    result.put("load_consumption_today", scaled(data, HEADER + 6, 2, 0.1, false));

    if has_payload(data, 30) {
        result.put("battery_charge_ah_total", read_int(data, HEADER + 14, 4, false));
        result.put("battery_discharge_ah_total", read_int(data, HEADER + 18, 4, false));
        result.put("pv_generation_total", scaled(data, HEADER + 22, 4, 0.1, false));
        result.put("load_consumption_total", scaled(data, HEADER + 26, 4, 0.1, false));
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parsers::TelemetryValue;
    use crate::protocol::build_response;

    fn frame(payload: &[u8]) -> Vec<u8> {
        build_response(0xFF, 0x03, payload)
    }

    fn words(values: &[u16]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_be_bytes()).collect()
    }

    #[test]
    fn test_main_status() {
        let regs = [
            2300,
            150,
            2295,
            210,
            5000,
            264,
            352,
            (1 << 15) | (1 << 4),
            (1 << 7) | (1 << 8),
            6000,
        ];
        let result = parse_main_status(&frame(&words(&regs)));

        assert_eq!(result["input_voltage"], TelemetryValue::Float(230.0));
        assert_eq!(result["input_current"], TelemetryValue::Float(1.5));
        assert_eq!(result["output_voltage"], TelemetryValue::Float(229.5));
        assert_eq!(result["output_current"], TelemetryValue::Float(2.1));
        assert_eq!(result["output_frequency"], TelemetryValue::Float(50.0));
        assert_eq!(result["battery_voltage"], TelemetryValue::Float(26.4));
        assert_eq!(result["temperature"], TelemetryValue::Float(35.2));
        assert_eq!(
            result["faults"],
            TelemetryValue::from(vec!["input_uvp", "fan_locked"])
        );
        assert_eq!(result["fault_count"], TelemetryValue::Int(2));
        assert_eq!(result["eco_mode"], TelemetryValue::Bool(true));
        assert_eq!(result["beeper_on"], TelemetryValue::Bool(true));
        assert_eq!(result["test_in_progress"], TelemetryValue::Bool(false));
        assert_eq!(result["input_frequency"], TelemetryValue::Float(60.0));
        assert_eq!(result["input_power"], TelemetryValue::Float(345.0));
        assert_eq!(result["output_power"], TelemetryValue::Float(482.0));
    }

    #[test]
    fn test_main_status_sentinels() {
        let regs = [65535u16, 65000, 0, 0, 0, 0, 0, 0, 0];
        let result = parse_main_status(&frame(&words(&regs)));
        assert_eq!(result["input_voltage"], TelemetryValue::Float(0.0));
        assert_eq!(result["input_current"], TelemetryValue::Float(0.0));
        assert_eq!(result["input_power"], TelemetryValue::Float(0.0));
    }

    #[test]
    fn test_device_info() {
        let mut payload = Vec::new();
        for text in ["RENOGY", "RIV1230RCH-SPS", "V1.2.3"] {
            let mut field = text.as_bytes().to_vec();
            field.resize(16, 0);
            payload.extend(field);
        }
        let result = parse_device_info(&frame(&payload));
        assert_eq!(result["manufacturer"], TelemetryValue::from("RENOGY"));
        assert_eq!(result["model"], TelemetryValue::from("RIV1230RCH-SPS"));
        assert_eq!(result["firmware_version"], TelemetryValue::from("V1.2.3"));
    }

    #[test]
    fn test_pv_info() {
        let regs = [87u16, 125, 1800, 42, 756, 0x0302, 0];
        let result = parse_pv_info(&frame(&words(&regs)));
        assert_eq!(result["battery_soc"], TelemetryValue::Int(87));
        assert_eq!(result["charge_current"], TelemetryValue::Float(12.5));
        assert_eq!(result["pv_voltage"], TelemetryValue::Float(180.0));
        assert_eq!(result["pv_current"], TelemetryValue::Float(4.2));
        assert_eq!(result["pv_power"], TelemetryValue::Int(756));
        assert_eq!(result["charging_status"], TelemetryValue::from("constant_voltage"));
    }

    #[test]
    fn test_settings_status() {
        let mut regs = [0u16; 20];
        regs[7] = 5;
        regs[9] = 3800;
        regs[10] = 35;
        regs[11] = 640;
        regs[12] = 700;
        regs[15] = 21;
        let result = parse_settings_status(&frame(&words(&regs)));
        assert_eq!(result["machine_state"], TelemetryValue::from("inverter_operation"));
        assert_eq!(result["bus_voltage"], TelemetryValue::Float(380.0));
        assert_eq!(result["load_current"], TelemetryValue::Float(3.5));
        assert_eq!(result["load_active_power"], TelemetryValue::Int(640));
        assert_eq!(result["load_apparent_power"], TelemetryValue::Int(700));
        assert_eq!(result["load_percentage"], TelemetryValue::Int(21));
    }

    #[test]
    fn test_settings() {
        let result = parse_settings(&frame(&words(&[2, 5000, 1, 1])));
        assert_eq!(result["output_priority"], TelemetryValue::from("sbu"));
        assert_eq!(result["output_frequency_setting"], TelemetryValue::Float(50.0));
        assert_eq!(result["ac_voltage_range"], TelemetryValue::from("narrow"));
        assert_eq!(result["power_saving_mode"], TelemetryValue::Bool(true));
    }

    #[test]
    fn test_statistics() {
        let mut regs = [0u16; 25];
        regs[0] = 12;
        regs[1] = 8;
        regs[2] = 35;
        regs[3] = 27;
        regs[7] = 1;
        regs[8] = 500;
        regs[12] = 4321;
        let result = parse_statistics(&frame(&words(&regs)));
        assert_eq!(result["battery_charge_ah_today"], TelemetryValue::Int(12));
        assert_eq!(result["battery_discharge_ah_today"], TelemetryValue::Int(8));
        assert_eq!(result["pv_generation_today"], TelemetryValue::Float(3.5));
        assert_eq!(result["load_consumption_today"], TelemetryValue::Float(2.7));
        assert_eq!(result["battery_charge_ah_total"], TelemetryValue::Int(66036));
        assert_eq!(result["pv_generation_total"], TelemetryValue::Float(432.1));
    }
}
