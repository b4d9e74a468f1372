//! Charge controller register groups

use tracing::{debug, warn};

use super::decode::{
    ascii, has_payload, lookup, read_int, scaled, set_flags, temperature, text_list, word,
    BitTable, HEADER,
};
use super::{Telemetry, TelemetryExt, TelemetryValue};

pub const CHARGING_STATE: &[(i64, &str)] = &[
    (0, "deactivated"),
    (1, "activated"),
    (2, "mppt"),
    (3, "equalizing"),
    (4, "boost"),
    (5, "floating"),
    (6, "current_limiting"),
];

pub const LOAD_STATE: &[(i64, &str)] = &[(0, "off"), (1, "on")];

pub const BATTERY_TYPE: &[(i64, &str)] = &[
    (1, "open"),
    (2, "sealed"),
    (3, "gel"),
    (4, "lithium"),
    (5, "custom"),
];

/// Fault bits of the 32-bit fault word
pub const FAULTS: BitTable = &[
    (30, "charge_mos_short_circuit"),
    (29, "anti_reverse_mos_short"),
    (28, "solar_panel_reversed"),
    (27, "pv_working_point_overvoltage"),
    (26, "pv_counter_current"),
    (25, "pv_input_overvoltage"),
    (24, "pv_input_short_circuit"),
    (23, "pv_input_overpower"),
    (22, "ambient_temp_too_high"),
    (21, "controller_temp_too_high"),
    (20, "load_overpower"),
    (19, "load_short_circuit"),
    (17, "battery_overvoltage"),
    (16, "battery_over_discharge"),
];

pub const WARNINGS: BitTable = &[(18, "battery_undervoltage")];

/// Registers 12-19
pub fn parse_device_info(data: &[u8]) -> Telemetry {
    let mut result = Telemetry::new();
    if !has_payload(data, 16) {
        return result;
    }
    result.put("model", ascii(data, HEADER, 16));
    result
}

/// Register 26
pub fn parse_device_id(data: &[u8]) -> Telemetry {
    let mut result = Telemetry::new();
    if !has_payload(data, 2) {
        return result;
    }
    result.put("device_id", read_int(data, HEADER, 1, false));
    result
}

/// Registers 256-289: battery, load, PV and daily counters
pub fn parse_charging_info(data: &[u8]) -> Telemetry {
    let mut result = Telemetry::new();
    if !has_payload(data, 68) {
        warn!("Charging info data too short: {} bytes", data.len());
        return result;
    }
    let at = |offset: usize| HEADER + offset;

    result.insert("battery_percentage".into(), word(data, at(0)));
    result.put("battery_voltage", scaled(data, at(2), 2, 0.1, false));
    result.put("battery_current", scaled(data, at(4), 2, 0.01, false));
    result.put(
        "controller_temperature",
        temperature(read_int(data, at(6), 1, false)),
    );
    result.put(
        "battery_temperature",
        temperature(read_int(data, at(7), 1, false)),
    );

    result.put("load_voltage", scaled(data, at(8), 2, 0.1, false));
    result.put("load_current", scaled(data, at(10), 2, 0.01, false));
    result.insert("load_power".into(), word(data, at(12)));

    result.put("pv_voltage", scaled(data, at(14), 2, 0.1, false));
    result.put("pv_current", scaled(data, at(16), 2, 0.01, false));
    result.insert("pv_power".into(), word(data, at(18)));

    for (name, offset) in [
        ("max_charging_power_today", 30),
        ("max_discharging_power_today", 32),
        ("charging_amp_hours_today", 34),
        ("discharging_amp_hours_today", 36),
        ("power_generation_today", 38),
        ("power_consumption_today", 40),
    ] {
        result.insert(name.into(), word(data, at(offset)));
    }

    result.put("power_generation_total", read_int(data, at(56), 4, false));

    let load_byte = read_int(data, at(64), 1, false);
    result.put("load_status", lookup(LOAD_STATE, (load_byte >> 7) & 1));

    let charging_byte = read_int(data, at(65), 1, false);
    result.put("charging_status", lookup(CHARGING_STATE, charging_byte));

    result
}

/// Register 57348 (0xE004)
pub fn parse_battery_type(data: &[u8]) -> Telemetry {
    let mut result = Telemetry::new();
    if !has_payload(data, 2) {
        return result;
    }
    let code = read_int(data, HEADER, 2, false);
    result.put("battery_type", lookup(BATTERY_TYPE, code));
    result
}

/// Registers 289-290: fault and warning bitmap
pub fn parse_faults(data: &[u8]) -> Telemetry {
    let mut result = Telemetry::new();
    if !has_payload(data, 4) {
        warn!("Fault data too short: {} bytes", data.len());
        return result;
    }

    let fault_bits = read_int(data, HEADER, 4, false) as u32;
    let faults = set_flags(fault_bits, FAULTS);
    let warnings = set_flags(fault_bits, WARNINGS);

    if fault_bits != 0 {
        debug!(
            "Controller fault bits: 0x{:08X}, faults: {:?}, warnings: {:?}",
            fault_bits, faults, warnings
        );
    }

    result.put("fault_count", faults.len() as i64);
    result.put("warning_count", warnings.len() as i64);
    result.insert("faults".into(), text_list(faults));
    result.insert("warnings".into(), text_list(warnings));
    result
}

/// Registers 60000-60020: last seven days
pub fn parse_historical(data: &[u8]) -> Telemetry {
    let mut result = Telemetry::new();
    if !has_payload(data, 42) {
        return result;
    }

    for (index, name) in ["daily_power_generation", "daily_charge_ah", "daily_max_power"]
        .iter()
        .enumerate()
    {
        let base = HEADER + index * 14;
        let days: Vec<TelemetryValue> = (0..7).map(|day| word(data, base + day * 2)).collect();
        result.insert(name.to_string(), TelemetryValue::List(days));
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::build_response;

    fn frame(payload: &[u8]) -> Vec<u8> {
        build_response(0xFF, 0x03, payload)
    }

    fn charging_payload() -> Vec<u8> {
        let mut p = vec![0u8; 68];
        p[0..2].copy_from_slice(&85u16.to_be_bytes());
        p[2..4].copy_from_slice(&132u16.to_be_bytes());
        p[4..6].copy_from_slice(&520u16.to_be_bytes());
        p[6] = 30;
        p[7] = 0x8A;
        p[8..10].copy_from_slice(&131u16.to_be_bytes());
        p[10..12].copy_from_slice(&150u16.to_be_bytes());
        p[12..14].copy_from_slice(&20u16.to_be_bytes());
        p[14..16].copy_from_slice(&185u16.to_be_bytes());
        p[16..18].copy_from_slice(&380u16.to_be_bytes());
        p[18..20].copy_from_slice(&70u16.to_be_bytes());
        p[30..32].copy_from_slice(&210u16.to_be_bytes());
        p[38..40].copy_from_slice(&640u16.to_be_bytes());
        p[56..60].copy_from_slice(&123_456u32.to_be_bytes());
        p[64] = 0x80;
        p[65] = 2;
        p
    }

    #[test]
    fn test_device_info() {
        let mut payload = b"RNG-CTRL-RVR40".to_vec();
        payload.resize(16, 0);
        let result = parse_device_info(&frame(&payload));
        assert_eq!(result["model"], TelemetryValue::from("RNG-CTRL-RVR40"));

        assert!(parse_device_info(&[0xFF, 0x03, 0x10, b'R']).is_empty());
    }

    #[test]
    fn test_device_id() {
        let result = parse_device_id(&frame(&[0x10, 0x00]));
        assert_eq!(result["device_id"], TelemetryValue::Int(16));
    }

    #[test]
    fn test_charging_info() {
        let result = parse_charging_info(&frame(&charging_payload()));

        assert_eq!(result["battery_percentage"], TelemetryValue::Int(85));
        assert_eq!(result["battery_voltage"], TelemetryValue::Float(13.2));
        assert_eq!(result["battery_current"], TelemetryValue::Float(5.2));
        assert_eq!(result["controller_temperature"], TelemetryValue::Int(30));
        assert_eq!(result["battery_temperature"], TelemetryValue::Int(-10));
        assert_eq!(result["load_voltage"], TelemetryValue::Float(13.1));
        assert_eq!(result["load_current"], TelemetryValue::Float(1.5));
        assert_eq!(result["load_power"], TelemetryValue::Int(20));
        assert_eq!(result["pv_voltage"], TelemetryValue::Float(18.5));
        assert_eq!(result["pv_current"], TelemetryValue::Float(3.8));
        assert_eq!(result["pv_power"], TelemetryValue::Int(70));
        assert_eq!(result["max_charging_power_today"], TelemetryValue::Int(210));
        assert_eq!(result["power_generation_today"], TelemetryValue::Int(640));
        assert_eq!(result["power_generation_total"], TelemetryValue::Int(123_456));
        assert_eq!(result["load_status"], TelemetryValue::from("on"));
        assert_eq!(result["charging_status"], TelemetryValue::from("mppt"));
    }

    #[test]
    fn test_charging_info_unknown_state_and_short_frame() {
        let mut payload = charging_payload();
        payload[64] = 0x00;
        payload[65] = 9;
        let result = parse_charging_info(&frame(&payload));
        assert_eq!(result["load_status"], TelemetryValue::from("off"));
        assert_eq!(result["charging_status"], TelemetryValue::from("unknown"));

        let mut short = vec![0xFF, 0x03, 0x44];
        short.extend_from_slice(&payload[..67]);
        assert!(parse_charging_info(&short).is_empty());
    }

    #[test]
    fn test_battery_type() {
        for (code, name) in [(1u16, "open"), (4, "lithium"), (5, "custom"), (9, "unknown")] {
            let result = parse_battery_type(&frame(&code.to_be_bytes()));
            assert_eq!(result["battery_type"], TelemetryValue::from(name));
        }
    }

    #[test]
    fn test_faults() {
        let bits: u32 = (1 << 30) | (1 << 19) | (1 << 18) | (1 << 16);
        let result = parse_faults(&frame(&bits.to_be_bytes()));
        assert_eq!(
            result["faults"],
            TelemetryValue::from(vec![
                "charge_mos_short_circuit",
                "load_short_circuit",
                "battery_over_discharge"
            ])
        );
        assert_eq!(
            result["warnings"],
            TelemetryValue::from(vec!["battery_undervoltage"])
        );
        assert_eq!(result["fault_count"], TelemetryValue::Int(3));
        assert_eq!(result["warning_count"], TelemetryValue::Int(1));
    }

    #[test]
    fn test_faults_clear_and_short() {
        let result = parse_faults(&frame(&[0, 0, 0, 0]));
        assert_eq!(result["fault_count"], TelemetryValue::Int(0));
        assert_eq!(result["faults"], TelemetryValue::List(vec![]));

        assert!(parse_faults(&[0xFF, 0x03, 0x04, 0x00, 0x01]).is_empty());
    }

    #[test]
    fn test_historical() {
        let payload: Vec<u8> = (0..21u16).flat_map(|v| (v * 10).to_be_bytes()).collect();
        let result = parse_historical(&frame(&payload));
        let generation = result["daily_power_generation"].as_list().unwrap();
        assert_eq!(generation.len(), 7);
        assert_eq!(generation[0], TelemetryValue::Int(0));
        assert_eq!(generation[6], TelemetryValue::Int(60));
        let max_power = result["daily_max_power"].as_list().unwrap();
        assert_eq!(max_power[0], TelemetryValue::Int(140));
    }
}
