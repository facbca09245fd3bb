//! Human-readable byte counts for log records.

use std::fmt;
use std::time::Duration;

const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];

/// Elapsed times at or below this are too short to derive a rate from.
const MIN_RATE_WINDOW: Duration = Duration::from_millis(1);

/// A byte count rendered with a binary unit suffix, e.g. `19.53 KB`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HumanBytes(pub f64);

impl From<u64> for HumanBytes {
    fn from(bytes: u64) -> Self {
        Self(bytes as f64)
    }
}

impl fmt::Display for HumanBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut value = self.0;
        for unit in UNITS {
            if value < 1024.0 {
                return write!(f, "{value:.2} {unit}");
            }
            value /= 1024.0;
        }
        write!(f, "{value:.2} PB")
    }
}

/// Average throughput over an elapsed window, rendered as `<bytes>/s`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HumanRate {
    bytes_per_sec: f64,
}

impl HumanRate {
    /// Compute the average rate of `bytes` over `elapsed`.
    ///
    /// Windows of a millisecond or less report a rate of zero.
    pub fn new(bytes: u64, elapsed: Duration) -> Self {
        let bytes_per_sec = if elapsed <= MIN_RATE_WINDOW {
            0.0
        } else {
            bytes as f64 / elapsed.as_secs_f64()
        };
        Self { bytes_per_sec }
    }
}

impl fmt::Display for HumanRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/s", HumanBytes(self.bytes_per_sec))
    }
}
