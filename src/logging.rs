//! Logging initialization and log formatting helpers
//!
//! The crate logs through `tracing`. Binaries call [`init_logging`] once;
//! libraries embedding the crate install their own subscriber.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::{RenogyError, RenogyResult};

/// Log levels accepted by [`init_logging`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Convert log level to filter directive string
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }

    /// Parse a level name; unknown names fall back to `Info`
    pub fn parse(level: &str) -> Self {
        match level.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warn" | "warning" => LogLevel::Warn,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Info,
        }
    }
}

/// Install a formatted subscriber filtered by `RUST_LOG`, or `level` when unset
///
/// Fails if a global subscriber is already installed.
pub fn try_init_logging(level: LogLevel) -> RenogyResult<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("renogy_ble={}", level.as_str())));

    let is_terminal = std::io::IsTerminal::is_terminal(&std::io::stdout());

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_ansi(is_terminal),
        )
        .try_init()
        .map_err(|e| RenogyError::internal(format!("Logging already initialized: {}", e)))
}

/// Install the subscriber, ignoring an already-installed one
pub fn init_logging(level: &str) {
    if let Err(e) = try_init_logging(LogLevel::parse(level)) {
        tracing::debug!("{}", e);
    }
}

/// Mask a hardware address for logs, keeping the last two octets
///
/// `AA:BB:CC:DD:EE:FF` becomes `**:**:**:**:EE:FF`; anything that is not a
/// six-part address keeps only its last five characters.
pub fn obfuscate_address(address: &str) -> String {
    let parts: Vec<&str> = address.split(':').collect();
    if parts.len() == 6 {
        return format!("**:**:**:**:{}:{}", parts[4], parts[5]);
    }
    let chars: Vec<char> = address.chars().collect();
    if chars.len() > 5 {
        let tail: String = chars[chars.len() - 5..].iter().collect();
        format!("***{}", tail)
    } else {
        "***".to_string()
    }
}

/// Human-readable summary of a read request
pub fn describe_request(unit_id: u8, function: u8, address: u16, words: u16) -> String {
    format!(
        "Request -> Unit: {}, Function: 0x{:02X}, Address: {}, Words: {}",
        unit_id, function, address, words
    )
}

/// Human-readable summary of a response frame
pub fn describe_response(data: &[u8]) -> String {
    if data.len() < 3 {
        return format!("Response <- Data: {}", hex::encode(data));
    }
    if data[1] & crate::protocol::EXCEPTION_BIT != 0 {
        return format!(
            "Response <- Unit: {}, Exception 0x{:02X} for function 0x{:02X}",
            data[0],
            data[2],
            data[1] & !crate::protocol::EXCEPTION_BIT
        );
    }
    let payload = crate::protocol::payload(data);
    let registers: Vec<u16> = payload
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .take(8)
        .collect();
    format!(
        "Response <- Unit: {}, Byte count: {}, Registers: {:?}",
        data[0], data[2], registers
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_obfuscate_address() {
        assert_eq!(obfuscate_address("AA:BB:CC:DD:EE:FF"), "**:**:**:**:EE:FF");
        assert_eq!(obfuscate_address("hci0-device-1234"), "***-1234");
        assert_eq!(obfuscate_address("abc"), "***");
    }

    #[test]
    fn test_level_parsing() {
        assert_eq!(LogLevel::parse("WARNING"), LogLevel::Warn);
        assert_eq!(LogLevel::parse("debug"), LogLevel::Debug);
        assert_eq!(LogLevel::parse("verbose"), LogLevel::Info);
        assert_eq!(LogLevel::Trace.as_str(), "trace");
    }

    #[test]
    fn test_describe_frames() {
        assert_eq!(
            describe_request(255, 3, 256, 34),
            "Request -> Unit: 255, Function: 0x03, Address: 256, Words: 34"
        );

        let frame = [0x01, 0x03, 0x04, 0x00, 0x0A, 0x00, 0x0B, 0x9B, 0xF6];
        assert_eq!(
            describe_response(&frame),
            "Response <- Unit: 1, Byte count: 4, Registers: [10, 11]"
        );

        let error = [0xFF, 0x83, 0x02, 0xA1, 0x01];
        assert!(describe_response(&error).contains("Exception 0x02"));
        assert_eq!(describe_response(&[0xAB]), "Response <- Data: ab");
    }
}
