//! # Renogy BLE Error Handling
//!
//! Error types shared by the codec, the transport seam, the connection
//! state machine and the configuration layer.
//!
//! ## Error Categories
//!
//! ### Transport Errors
//! - **I/O / Connection**: session or subscription failures on the wireless link
//! - **Timeout**: a bounded wait expired
//!
//! ### Protocol Errors
//! - **Frame**: short or truncated frames
//! - **CRC**: checksum mismatch
//! - **Exception**: the device answered with an error frame
//!
//! ### Configuration Errors
//! - **Invalid device type**: an unrecognized device-type string
//! - **Configuration**: malformed device list or polling settings
//!
//! Transport and protocol errors never escape the polling loop: the
//! connection and manager layers convert them into "no data this cycle".
//! Only configuration errors are returned to the caller.
//!
//! ```rust
//! use renogy_ble::RenogyError;
//!
//! let err = RenogyError::timeout("wait for notification", 5000);
//! assert!(err.is_recoverable());
//! assert!(err.is_transport_error());
//! ```

use thiserror::Error;

/// Result type alias used throughout the crate
pub type RenogyResult<T> = Result<T, RenogyError>;

/// Errors raised by the acquisition core
#[derive(Error, Debug, Clone)]
pub enum RenogyError {
    /// Low-level I/O failure on the link
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Session establishment or maintenance failure
    ///
    /// # Examples
    /// - Device not found by the scanner
    /// - Notification subscription rejected
    /// - Link dropped during a write
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// A bounded wait expired
    #[error("Timeout after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Protocol-level violation that fits no narrower category
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// Frame structure errors (too short, truncated payload)
    #[error("Frame error: {message}")]
    Frame { message: String },

    /// CRC16 validation failure
    #[error("CRC validation failed: expected={expected:04X}, actual={actual:04X}")]
    CrcMismatch { expected: u16, actual: u16 },

    /// Error frame returned by the device (`func | 0x80`)
    ///
    /// # Standard Exception Codes
    /// - 0x01: Illegal Function
    /// - 0x02: Illegal Data Address
    /// - 0x03: Illegal Data Value
    /// - 0x04: Slave Device Failure
    /// - 0x06: Slave Device Busy
    #[error("Modbus exception: function={function:02X}, code={code:02X} ({message})")]
    Exception { function: u8, code: u8, message: String },

    /// Device-type string outside `controller`, `battery`, `inverter`
    #[error("Invalid device type '{value}'. Must be one of: controller, battery, inverter")]
    InvalidDeviceType { value: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// A result callback reported a failure
    #[error("Callback error for {device_key}: {message}")]
    Callback { device_key: String, message: String },

    /// Internal errors (should not occur in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl RenogyError {
    /// Create a new I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io { message: message.into() }
    }

    /// Create a new connection error
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection { message: message.into() }
    }

    /// Create a new timeout error
    ///
    /// # Arguments
    ///
    /// * `operation` - Description of the operation that timed out
    /// * `timeout_ms` - Timeout duration in milliseconds
    pub fn timeout<S: Into<String>>(operation: S, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Create a new protocol error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol { message: message.into() }
    }

    /// Create a frame error
    pub fn frame<S: Into<String>>(message: S) -> Self {
        Self::Frame { message: message.into() }
    }

    /// Create a CRC mismatch error
    pub fn crc_mismatch(expected: u16, actual: u16) -> Self {
        Self::CrcMismatch { expected, actual }
    }

    /// Create an exception error, mapping standard codes to readable names
    pub fn exception(function: u8, code: u8) -> Self {
        let message = match code {
            0x01 => "Illegal Function",
            0x02 => "Illegal Data Address",
            0x03 => "Illegal Data Value",
            0x04 => "Slave Device Failure",
            0x05 => "Acknowledge",
            0x06 => "Slave Device Busy",
            0x08 => "Memory Parity Error",
            0x0A => "Gateway Path Unavailable",
            0x0B => "Gateway Target Device Failed to Respond",
            _ => "Unknown Exception",
        }
        .to_string();

        Self::Exception { function, code, message }
    }

    /// Create an invalid device type error
    pub fn invalid_device_type<S: Into<String>>(value: S) -> Self {
        Self::InvalidDeviceType { value: value.into() }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Create a callback error
    pub fn callback<K: Into<String>, S: Into<String>>(device_key: K, message: S) -> Self {
        Self::Callback {
            device_key: device_key.into(),
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Check if the error is recoverable (the next poll cycle may succeed)
    ///
    /// ```rust
    /// use renogy_ble::RenogyError;
    ///
    /// assert!(RenogyError::connection("link lost").is_recoverable());
    /// assert!(!RenogyError::invalid_device_type("solar").is_recoverable());
    /// ```
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Io { .. } => true,
            Self::Connection { .. } => true,
            Self::Timeout { .. } => true,
            Self::Frame { .. } => true,
            Self::CrcMismatch { .. } => true,
            Self::Callback { .. } => true,
            Self::Exception { code, .. } => matches!(code, 0x05 | 0x06),
            _ => false,
        }
    }

    /// Check if the error is a link/transport issue
    pub fn is_transport_error(&self) -> bool {
        matches!(
            self,
            Self::Io { .. } | Self::Connection { .. } | Self::Timeout { .. }
        )
    }

    /// Check if the error is a protocol issue
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Self::Protocol { .. }
                | Self::Exception { .. }
                | Self::Frame { .. }
                | Self::CrcMismatch { .. }
        )
    }

    /// Check if the error is a configuration fault that must surface to the caller
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidDeviceType { .. } | Self::Configuration { .. }
        )
    }
}

impl From<std::io::Error> for RenogyError {
    fn from(err: std::io::Error) -> Self {
        Self::io(err.to_string())
    }
}

/// The concrete duration is unknown here; callers that know it build the
/// timeout error themselves.
impl From<tokio::time::error::Elapsed> for RenogyError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::timeout("Operation timeout", 0)
    }
}

impl From<serde_json::Error> for RenogyError {
    fn from(err: serde_json::Error) -> Self {
        Self::configuration(format!("JSON error: {}", err))
    }
}

impl From<serde_yaml::Error> for RenogyError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::configuration(format!("YAML error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let err = RenogyError::timeout("read_registers", 5000);
        assert!(err.is_recoverable());
        assert!(err.is_transport_error());
        assert!(!err.is_configuration_error());

        let err = RenogyError::exception(0x03, 0x02);
        assert!(!err.is_recoverable());
        assert!(err.is_protocol_error());

        let err = RenogyError::invalid_device_type("solar");
        assert!(err.is_configuration_error());
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_error_display() {
        let err = RenogyError::crc_mismatch(0x1234, 0x5678);
        let msg = format!("{}", err);
        assert!(msg.contains("CRC validation failed"));
        assert!(msg.contains("1234"));
        assert!(msg.contains("5678"));

        let err = RenogyError::exception(0x03, 0x02);
        assert!(err.to_string().contains("Illegal Data Address"));

        let err = RenogyError::invalid_device_type("Solar");
        assert!(err.to_string().contains("'Solar'"));
    }

    #[test]
    fn test_yaml_error_is_configuration() {
        let parsed: Result<Vec<u8>, _> = serde_yaml::from_str("{not: [valid");
        let err: RenogyError = parsed.unwrap_err().into();
        assert!(err.is_configuration_error());
    }
}
