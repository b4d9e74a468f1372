/// Utility functions and helpers for polling and diagnostics
///
/// This module contains poll-cycle metrics, timing, request validation and
/// formatting helpers.

use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{RenogyError, RenogyResult};

/// Largest register count a single read may request
pub const MAX_REGISTERS_PER_REQUEST: u16 = 125;

/// Success/failure counts and durations of device polls
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PollMetrics {
    pub total_polls: u64,
    pub successful_polls: u64,
    pub failed_polls: u64,
    pub total_duration: Duration,
    pub min_duration: Option<Duration>,
    pub max_duration: Option<Duration>,
    pub avg_duration: Duration,
}

impl PollMetrics {
    /// Create new empty metrics
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful poll
    pub fn record_success(&mut self, duration: Duration) {
        self.successful_polls += 1;
        self.record(duration);
    }

    /// Record a failed poll
    pub fn record_failure(&mut self, duration: Duration) {
        self.failed_polls += 1;
        self.record(duration);
    }

    fn record(&mut self, duration: Duration) {
        self.total_polls += 1;
        self.total_duration += duration;
        self.min_duration = Some(self.min_duration.map_or(duration, |min| min.min(duration)));
        self.max_duration = Some(self.max_duration.map_or(duration, |max| max.max(duration)));
        self.avg_duration = self.total_duration / self.total_polls as u32;
    }

    /// Get success rate as percentage
    pub fn success_rate(&self) -> f64 {
        if self.total_polls == 0 {
            return 0.0;
        }
        (self.successful_polls as f64 / self.total_polls as f64) * 100.0
    }
}

/// Timer for measuring operation duration
///
/// Uses tokio's clock so durations follow paused test time.
pub struct OperationTimer {
    start: Instant,
    operation_name: String,
}

impl OperationTimer {
    /// Start a new timer
    pub fn start(operation_name: &str) -> Self {
        debug!("Starting operation: {}", operation_name);
        Self {
            start: Instant::now(),
            operation_name: operation_name.to_string(),
        }
    }

    /// Stop timer and log result
    pub fn stop_and_log(self, success: bool) -> Duration {
        let duration = self.start.elapsed();
        if success {
            info!("Operation '{}' succeeded in {}", self.operation_name, format::format_duration(duration));
        } else {
            warn!("Operation '{}' failed after {}", self.operation_name, format::format_duration(duration));
        }
        duration
    }
}

/// Request validation
pub mod validation {
    use super::*;

    /// Unit ids are 1-255; 0 is the broadcast address and never answers
    pub fn validate_unit_id(unit_id: u8) -> RenogyResult<()> {
        if unit_id == 0 {
            return Err(RenogyError::configuration(
                "Invalid unit id: 0 (must be 1-255)",
            ));
        }
        Ok(())
    }

    /// Validate register count for read operations
    pub fn validate_word_count(count: u16) -> RenogyResult<()> {
        if count == 0 || count > MAX_REGISTERS_PER_REQUEST {
            return Err(RenogyError::configuration(format!(
                "Invalid register count: {} (must be 1-{})",
                count, MAX_REGISTERS_PER_REQUEST
            )));
        }
        Ok(())
    }
}

/// Formatting and display utilities
pub mod format {
    use super::*;

    /// Format byte array as hex string
    pub fn bytes_to_hex(bytes: &[u8]) -> String {
        hex::encode(bytes)
    }

    /// Format duration in a human-readable way
    pub fn format_duration(duration: Duration) -> String {
        let millis = duration.as_millis();
        if millis < 1000 {
            format!("{}ms", millis)
        } else if millis < 60_000 {
            format!("{:.2}s", duration.as_secs_f64())
        } else {
            let mins = millis / 60_000;
            let secs = (millis % 60_000) as f64 / 1000.0;
            format!("{}m {:.1}s", mins, secs)
        }
    }

    /// Format poll metrics as a table
    pub fn format_metrics(metrics: &PollMetrics) -> String {
        format!(
            "Poll Metrics:\n\
             ├─ Total Polls: {}\n\
             ├─ Successful: {} ({:.1}%)\n\
             ├─ Failed: {}\n\
             ├─ Average Duration: {}\n\
             ├─ Min Duration: {}\n\
             └─ Max Duration: {}",
            metrics.total_polls,
            metrics.successful_polls,
            metrics.success_rate(),
            metrics.failed_polls,
            format_duration(metrics.avg_duration),
            metrics.min_duration.map_or("N/A".to_string(), format_duration),
            metrics.max_duration.map_or("N/A".to_string(), format_duration),
        )
    }

    /// Normalize a hardware address to `XX:XX:XX:XX:XX:XX`
    ///
    /// Accepts colon, dash or space separated input, or twelve bare hex digits.
    pub fn format_mac_address(mac: &str) -> RenogyResult<String> {
        let digits: String = mac
            .chars()
            .filter(|c| !matches!(c, ':' | '-' | ' '))
            .collect::<String>()
            .to_uppercase();

        if digits.len() != 12 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(RenogyError::configuration(format!(
                "Invalid MAC address: {}",
                digits
            )));
        }

        let octets: Vec<&str> = (0..12).step_by(2).map(|i| &digits[i..i + 2]).collect();
        Ok(octets.join(":"))
    }
}

#[cfg(test)]
mod tests {
    use super::format::*;
    use super::validation::*;
    use super::*;

    #[test]
    fn test_poll_metrics() {
        let mut metrics = PollMetrics::new();
        metrics.record_success(Duration::from_millis(100));
        metrics.record_success(Duration::from_millis(300));
        metrics.record_failure(Duration::from_millis(200));

        assert_eq!(metrics.total_polls, 3);
        assert_eq!(metrics.failed_polls, 1);
        assert_eq!(metrics.min_duration, Some(Duration::from_millis(100)));
        assert_eq!(metrics.max_duration, Some(Duration::from_millis(300)));
        assert_eq!(metrics.avg_duration, Duration::from_millis(200));
        assert!((metrics.success_rate() - 66.666).abs() < 0.01);
    }

    #[test]
    fn test_validation() {
        assert!(validate_unit_id(0).is_err());
        assert!(validate_unit_id(247).is_ok());
        assert!(validate_word_count(0).is_err());
        assert!(validate_word_count(34).is_ok());
        assert!(validate_word_count(126).is_err());
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_millis(300)), "300ms");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1.50s");
        assert_eq!(format_duration(Duration::from_secs(75)), "1m 15.0s");
    }

    #[test]
    fn test_format_mac_address() {
        assert_eq!(
            format_mac_address("aa-bb-cc-dd-ee-ff").unwrap(),
            "AA:BB:CC:DD:EE:FF"
        );
        assert_eq!(
            format_mac_address("aabbccddeeff").unwrap(),
            "AA:BB:CC:DD:EE:FF"
        );
        assert!(format_mac_address("AA:BB:CC").is_err());
        assert!(format_mac_address("GG:BB:CC:DD:EE:FF").is_err());
    }

    #[test]
    fn test_bytes_to_hex() {
        assert_eq!(bytes_to_hex(&[0xFF, 0x03, 0x0C]), "ff030c");
    }
}
