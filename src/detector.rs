//! One-shot device type detection
//!
//! Opens a throwaway session to an address and probes the registers that
//! only one kind of device answers: the controller model block at unit 255,
//! then the battery model block at unit 247 and 255. The first valid
//! response decides the type. The session is closed on every exit path.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, warn};

use crate::config::PollingConfig;
use crate::connection::LinkShared;
use crate::error::{RenogyError, RenogyResult};
use crate::logging::obfuscate_address;
use crate::protocol::{
    build_request, expected_response_len, is_error_frame, validate_response, ModbusFunction,
    RegisterAddress, UnitId, MIN_RESPONSE_LEN,
};
use crate::registers::DeviceType;
use crate::transport::{BleTransport, CharacteristicPair, LinkEvents, TransportFactory};

/// Detected device type and the unit id it answered on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectionResult {
    pub device_type: DeviceType,
    pub unit_id: UnitId,
}

/// A read that identifies a device type when answered
#[derive(Debug, Clone, Copy)]
struct Probe {
    device_type: DeviceType,
    unit_id: UnitId,
    address: RegisterAddress,
    words: u16,
}

const PROBES: &[Probe] = &[
    Probe {
        device_type: DeviceType::Controller,
        unit_id: 255,
        address: 12,
        words: 8,
    },
    Probe {
        device_type: DeviceType::Battery,
        unit_id: 247,
        address: 5122,
        words: 6,
    },
    Probe {
        device_type: DeviceType::Battery,
        unit_id: 255,
        address: 5122,
        words: 6,
    },
];

/// Probe `address` and report what answered
///
/// Returns `None` when nothing answered, the session could not be opened, or
/// the whole detection exceeded `polling.detection_timeout`.
pub async fn detect_device_type(
    factory: &dyn TransportFactory,
    address: &str,
    polling: &PollingConfig,
) -> Option<DetectionResult> {
    let tag = obfuscate_address(address);

    let mut transport = match factory.create(address) {
        Ok(transport) => transport,
        Err(e) => {
            debug!("[{}] Detection failed: {}", tag, e);
            return None;
        }
    };

    let sink = Arc::new(LinkShared::new(address));
    let mut chars = CharacteristicPair::default();

    let outcome = timeout(
        polling.detection_timeout,
        run_probes(transport.as_mut(), &sink, &mut chars, polling, &tag),
    )
    .await;

    teardown(transport.as_mut(), &chars, &tag).await;

    match outcome {
        Ok(Ok(Some(result))) => {
            debug!(
                "[{}] Detected {} at unit {}",
                tag, result.device_type, result.unit_id
            );
            Some(result)
        }
        Ok(Ok(None)) => {
            debug!("[{}] Detection exhausted without a match", tag);
            None
        }
        Ok(Err(e)) => {
            debug!("[{}] Error during detection: {}", tag, e);
            None
        }
        Err(_) => {
            debug!("[{}] Detection timed out", tag);
            None
        }
    }
}

async fn run_probes(
    transport: &mut dyn BleTransport,
    sink: &Arc<LinkShared>,
    chars: &mut CharacteristicPair,
    polling: &PollingConfig,
    tag: &str,
) -> RenogyResult<Option<DetectionResult>> {
    let events: Arc<dyn LinkEvents> = sink.clone();
    transport.connect(events).await?;
    if !transport.is_connected() {
        return Err(RenogyError::connection("could not connect"));
    }

    *chars = match transport.characteristics().await {
        Ok(found) => CharacteristicPair::by_capability(&found),
        Err(e) => {
            warn!("[{}] Characteristic discovery failed, using defaults: {}", tag, e);
            CharacteristicPair::default()
        }
    };
    transport.start_notify(&chars.notify).await?;

    for probe in PROBES {
        debug!(
            "[{}] Probing {} (ID {})...",
            tag, probe.device_type, probe.unit_id
        );
        let Some(response) = read_probe(transport, sink, chars, probe, polling).await else {
            continue;
        };
        if validate_response(&response, Some(probe.unit_id)) {
            return Ok(Some(DetectionResult {
                device_type: probe.device_type,
                unit_id: probe.unit_id,
            }));
        }
    }
    Ok(None)
}

/// Send one probe and collect fragments until an error frame, a complete
/// frame, or the per-probe timeout
async fn read_probe(
    transport: &mut dyn BleTransport,
    sink: &LinkShared,
    chars: &CharacteristicPair,
    probe: &Probe,
    polling: &PollingConfig,
) -> Option<Vec<u8>> {
    sink.reset();

    let request = build_request(
        probe.unit_id,
        ModbusFunction::ReadHoldingRegisters.to_u8(),
        probe.address,
        probe.words,
    );
    if let Err(e) = transport.write(&chars.write, &request).await {
        debug!("Write failed: {}", e);
        return None;
    }

    let expected_len = expected_response_len(probe.words);
    let deadline = Instant::now() + polling.probe_timeout;

    loop {
        timeout_at(deadline, sink.wait_ready()).await.ok()?;
        let received = sink.snapshot();

        if is_error_frame(&received) {
            return Some(received[..MIN_RESPONSE_LEN].to_vec());
        }
        if received.len() >= expected_len {
            return Some(received[..expected_len].to_vec());
        }
    }
}

async fn teardown(transport: &mut dyn BleTransport, chars: &CharacteristicPair, tag: &str) {
    if transport.is_connected() {
        if let Err(e) = transport.stop_notify(&chars.notify).await {
            debug!("[{}] stop_notify during cleanup: {}", tag, e);
        }
    }
    if let Err(e) = transport.disconnect().await {
        debug!("[{}] disconnect during cleanup: {}", tag, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::{RegisterBank, SimulatedLink, SimulatorFactory};
    use std::time::Duration;

    const ADDR: &str = "AA:BB:CC:DD:EE:09";

    fn factory_with(link: &SimulatedLink) -> SimulatorFactory {
        let factory = SimulatorFactory::new();
        factory.add_link(ADDR, link.clone());
        factory
    }

    #[tokio::test(start_paused = true)]
    async fn test_detects_controller() {
        let link = SimulatedLink::with_controller(255);
        link.set_fragment_size(20);
        let factory = factory_with(&link);

        let result = detect_device_type(&factory, ADDR, &PollingConfig::default()).await;
        assert_eq!(
            result,
            Some(DetectionResult {
                device_type: DeviceType::Controller,
                unit_id: 255
            })
        );
        assert_eq!(link.open_sessions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_detects_battery_at_247() {
        let link = SimulatedLink::with_battery(247);
        let factory = factory_with(&link);

        let result = detect_device_type(&factory, ADDR, &PollingConfig::default()).await;
        assert_eq!(
            result,
            Some(DetectionResult {
                device_type: DeviceType::Battery,
                unit_id: 247
            })
        );
        // controller probe went unanswered first
        assert_eq!(link.requests().len(), 2);
        assert_eq!(link.open_sessions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_detects_battery_at_255_after_error_frame() {
        let link = SimulatedLink::new(ADDR);
        link.add_unit(255, RegisterBank::battery());
        let factory = factory_with(&link);

        let start = Instant::now();
        let result = detect_device_type(&factory, ADDR, &PollingConfig::default()).await;
        assert_eq!(
            result,
            Some(DetectionResult {
                device_type: DeviceType::Battery,
                unit_id: 255
            })
        );
        // the exception answer to the controller probe ends that probe early
        assert!(start.elapsed() < Duration::from_secs(4));
        assert_eq!(link.requests().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_nothing_answers() {
        let link = SimulatedLink::new(ADDR);
        link.add_unit(16, RegisterBank::controller(16));
        let factory = factory_with(&link);

        let result = detect_device_type(&factory, ADDR, &PollingConfig::default()).await;
        assert!(result.is_none());
        assert_eq!(link.requests().len(), 3);
        assert_eq!(link.open_sessions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_failure_uses_default_characteristics() {
        let link = SimulatedLink::with_controller(255);
        link.set_fail_discovery(true);
        let factory = factory_with(&link);

        let result = detect_device_type(&factory, ADDR, &PollingConfig::default()).await;
        assert_eq!(
            result,
            Some(DetectionResult {
                device_type: DeviceType::Controller,
                unit_id: 255
            })
        );
        assert_eq!(link.requests().len(), 1);
        assert_eq!(link.open_sessions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overall_timeout_tears_down() {
        let link = SimulatedLink::with_battery(247);
        link.set_silent(true);
        let factory = factory_with(&link);
        let polling = PollingConfig {
            detection_timeout: Duration::from_secs(5),
            ..PollingConfig::default()
        };

        let start = Instant::now();
        assert!(detect_device_type(&factory, ADDR, &polling).await.is_none());
        assert!(start.elapsed() < Duration::from_secs(6));
        assert_eq!(link.open_sessions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failure_returns_none() {
        let link = SimulatedLink::with_controller(255);
        link.set_fail_connects(1);
        let factory = factory_with(&link);

        assert!(detect_device_type(&factory, ADDR, &PollingConfig::default())
            .await
            .is_none());
        assert!(detect_device_type(&factory, "00:00:00:00:00:00", &PollingConfig::default())
            .await
            .is_none());
        assert_eq!(link.open_sessions(), 0);
    }
}
