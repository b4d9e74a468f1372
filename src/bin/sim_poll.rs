/// Renogy BLE Simulation Poll
///
/// Runs detection and a few poll cycles against simulated devices and
/// prints the resulting snapshot as JSON.
///
/// Usage: `sim_poll [config.yaml|config.json] [cycles]`
///
/// Without a config file a hub (controller + battery) and a standalone
/// inverter are simulated.

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

use renogy_ble::simulator::{RegisterBank, SimulatedLink, SimulatorFactory};
use renogy_ble::utils::format::{format_duration, format_metrics};
use renogy_ble::{
    detect_device_type, info as crate_info, init_logging, Coordinator, DeviceType, PollingConfig,
    RenogyConfig, MAX_NOTIFICATION_SIZE,
};

const DEMO_CONFIG: &str = r#"
system_voltage: 12
log_level: info
devices:
  - name: Rover
    address: "C4:D3:6A:00:00:01"
    device_type: controller
  - name: House Battery
    address: "C4:D3:6A:00:00:01"
    device_type: battery
  - name: Inverter
    address: "C4:D3:6A:00:00:02"
    device_type: inverter
"#;

/// One simulated link per configured address, one unit per configured device
fn build_simulator(config: &RenogyConfig) -> Result<SimulatorFactory> {
    let factory = SimulatorFactory::new();
    for identity in config.device_identities()? {
        let link = match factory.link(&identity.address) {
            Some(link) => link,
            None => {
                let link = SimulatedLink::new(identity.address.clone());
                link.set_fragment_size(MAX_NOTIFICATION_SIZE);
                factory.add_link(&identity.address, link.clone());
                link
            }
        };
        let bank = match identity.device_type {
            DeviceType::Controller => RegisterBank::controller(identity.unit_id),
            DeviceType::Battery => RegisterBank::battery(),
            DeviceType::Inverter => RegisterBank::inverter(),
        };
        link.add_unit(identity.unit_id, bank);
    }
    Ok(factory)
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut args = std::env::args().skip(1);

    let mut config = match args.next() {
        Some(path) => RenogyConfig::load_from_file(&path)
            .with_context(|| format!("loading configuration from {}", path))?,
        None => RenogyConfig::from_yaml_str(DEMO_CONFIG)?,
    };
    let cycles: usize = match args.next() {
        Some(n) => n.parse().context("cycle count must be a number")?,
        None => 3,
    };

    init_logging(&config.log_level);
    info!("{}", crate_info());

    // simulated devices answer instantly
    config.polling = PollingConfig {
        connect_attempts: config.polling.connect_attempts,
        ..PollingConfig::fast()
    };

    let factory = Arc::new(build_simulator(&config)?);

    println!("Detecting device types...");
    for device in &config.devices {
        match detect_device_type(factory.as_ref(), &device.address, &config.polling).await {
            Some(result) => println!(
                "  {} ({}): {} at unit {}",
                device.name, device.address, result.device_type, result.unit_id
            ),
            None => println!("  {} ({}): not detected", device.name, device.address),
        }
    }

    let mut coordinator = Coordinator::from_config(&config, factory.clone())?;
    let connected = coordinator.manager().connect_all().await;
    println!(
        "Connected {}/{} links",
        connected,
        coordinator.manager().connection_count()
    );

    for cycle in 1..=cycles {
        let started = tokio::time::Instant::now();
        let snapshot = coordinator.refresh().await?;
        println!(
            "\nCycle {}: {} devices in {}",
            cycle,
            snapshot.len(),
            format_duration(started.elapsed())
        );
        if cycle == cycles {
            println!("{}", serde_json::to_string_pretty(snapshot)?);
        }
    }

    println!("\n{}", format_metrics(coordinator.manager().metrics()));
    for (device, stats) in coordinator.validators().all_rejection_stats() {
        println!("{}: {} rejected readings", device, stats.total_rejections);
    }

    coordinator.shutdown().await;
    println!("Sessions opened: {}", factory.sessions_created());
    Ok(())
}
