//! # Renogy BLE - Telemetry Acquisition over Modbus-on-Bluetooth
//!
//! Acquisition core for solar charge controllers, lithium batteries and
//! inverters that expose their registers through a BT-1/BT-2 style wireless
//! module. Requests are Modbus RTU frames written to a GATT characteristic;
//! responses come back as one or more notification packets.
//!
//! ## Features
//!
//! - **Frame codec**: request building, CRC16 validation, exception frames
//! - **Register decoders**: per-device-type tables turning frames into typed fields
//! - **Persistent links**: reconnect with backoff, serialized request/response
//!   correlation, hub mode (several devices behind one module)
//! - **Auto-detection**: one-shot probe for the device type and unit id
//! - **Spike filter**: range and rate-of-change validation for controllers
//! - **Simulator**: in-process devices for tests and demos
//!
//! ## Supported Devices
//!
//! | Type | Default unit id | Register groups |
//! |------|-----------------|-----------------|
//! | Charge controller | 255 | device info, id, charging info, faults, battery type, history |
//! | Battery | 247 | cells, temperatures, capacity, status, device info |
//! | Inverter | 255 | main status, device info, PV, settings status, settings, statistics |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use renogy_ble::{Coordinator, RenogyConfig, RenogyResult};
//! use renogy_ble::simulator::{SimulatedLink, SimulatorFactory};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> RenogyResult<()> {
//!     let config = RenogyConfig::from_yaml_str(
//!         "devices:\n  - name: Rover\n    address: AA:BB:CC:DD:EE:FF\n    device_type: controller\n",
//!     )?;
//!
//!     let factory = SimulatorFactory::new();
//!     factory.add_link("AA:BB:CC:DD:EE:FF", SimulatedLink::with_controller(255));
//!
//!     let mut coordinator = Coordinator::from_config(&config, Arc::new(factory))?;
//!     for (key, device) in coordinator.refresh().await? {
//!         println!("{}: {} fields", key, device.fields.len());
//!     }
//!     coordinator.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │   Coordinator   │──► Validator
//! └─────────────────┘
//!          │
//! ┌─────────────────┐
//! │ Device Manager  │   one connection per physical address
//! └─────────────────┘
//!          │
//! ┌─────────────────┐    ┌─────────────────┐
//! │   Connection    │───►│ Protocol/Parsers│
//! └─────────────────┘    └─────────────────┘
//!          │
//! ┌─────────────────┐
//! │ BLE Transport   │   host radio stack or simulator
//! └─────────────────┘
//! ```

/// Core error types and result handling
pub mod error;

/// Modbus RTU framing and CRC
pub mod protocol;

/// Device types and register catalogs
pub mod registers;

/// Register response decoders
pub mod parsers;

/// Wireless transport seam
pub mod transport;

/// Persistent per-link connection
pub mod connection;

/// Multi-link device manager
pub mod manager;

/// Device type auto-detection
pub mod detector;

/// Range and spike validation
pub mod validator;

/// Poll cycle driver and snapshot producer
pub mod coordinator;

/// Configuration loading
pub mod config;

/// In-process device simulator
pub mod simulator;

/// Utility functions and poll metrics
pub mod utils;

/// Logging setup and helpers
pub mod logging;

// Re-export main types for convenience
pub use config::{DeviceConfig, PollingConfig, RenogyConfig};
pub use connection::{ConnectionState, PersistentConnection};
pub use coordinator::{Coordinator, DeviceSnapshot, FieldReading, Snapshot};
pub use detector::{detect_device_type, DetectionResult};
pub use error::{RenogyError, RenogyResult};
pub use logging::{init_logging, LogLevel};
pub use manager::{DataCallback, DeviceHealth, DeviceManager};
pub use parsers::{parse_response, Telemetry, TelemetryValue};
pub use protocol::{ModbusFunction, UnitId};
pub use registers::{DeviceIdentity, DeviceType, RegisterGroup};
pub use transport::{
    scan_for_devices, BleTransport, DiscoveredDevice, LinkEvents, Scanner, TransportFactory,
    TransportStats,
};
pub use utils::{OperationTimer, PollMetrics};
pub use validator::{DataValidator, ValidatorManager};

/// Maximum notification payload of the wireless modules
pub const MAX_NOTIFICATION_SIZE: usize = 20;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library information
pub fn info() -> String {
    format!(
        "Renogy BLE v{} - Modbus-over-Bluetooth telemetry for controllers, batteries and inverters",
        VERSION
    )
}
