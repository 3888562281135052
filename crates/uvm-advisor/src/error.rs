//! Error types for the prefetch advisor
//!
//! # Design
//!
//! - **`ScheduleError`**: profile log could not be turned into a schedule
//! - **`DeviceError`**: the device runtime rejected a stream or prefetch request
//! - **`AdvisorError`**: top-level enum wrapping both plus configuration errors
//!
//! Lookup misses (unknown identifiers, frees of untracked addresses) are not
//! errors; they are reported as `None` by the registry.

use std::path::PathBuf;
use thiserror::Error;

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, AdvisorError>;

/// Top-level error type
#[derive(Error, Debug)]
pub enum AdvisorError {
    /// Profile log parse failure
    #[error("Schedule error: {0}")]
    Schedule(#[from] ScheduleError),

    /// Device runtime failure
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    /// Invalid configuration value
    #[error("Invalid value {value:?} for {key}: {reason}")]
    Config {
        key: String,
        value: String,
        reason: String,
    },

    /// Stream pool was configured with zero streams
    #[error("Stream pool requires at least one stream")]
    NoStreams,
}

/// Errors raised while parsing a profiling log
#[derive(Error, Debug)]
pub enum ScheduleError {
    #[error("Failed to read profile log {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Line {line}: allocation list appears before any `Op -` line")]
    MissingOpContext { line: usize },

    #[error("Line {line}: invalid integer {token:?}: {reason}")]
    InvalidInteger {
        line: usize,
        token: String,
        reason: String,
    },
}

/// Errors reported by a [`DeviceRuntime`](crate::runtime::DeviceRuntime)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("Failed to create prefetch stream {index}: {reason}")]
    StreamCreation { index: usize, reason: String },

    #[error("Prefetch of {size} bytes at {address:#x} on stream {stream} failed: {reason}")]
    Prefetch {
        address: u64,
        size: u64,
        stream: usize,
        reason: String,
    },

    #[error("Device runtime unavailable: {0}")]
    Unavailable(String),
}

impl DeviceError {
    /// Attach the pool slot a failed prefetch was issued on
    pub fn on_stream(self, slot: usize) -> Self {
        match self {
            DeviceError::Prefetch {
                address,
                size,
                reason,
                ..
            } => DeviceError::Prefetch {
                address,
                size,
                stream: slot,
                reason,
            },
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_error_converts() {
        let err: AdvisorError = ScheduleError::MissingOpContext { line: 3 }.into();
        assert!(matches!(err, AdvisorError::Schedule(_)));
        assert!(err.to_string().contains("Line 3"));
    }

    #[test]
    fn test_device_error_display() {
        let err = DeviceError::Prefetch {
            address: 0x1000,
            size: 4096,
            stream: 2,
            reason: "invalid value".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("0x1000"));
        assert!(msg.contains("stream 2"));
    }
}
