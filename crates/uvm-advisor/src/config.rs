//! Advisor configuration
//!
//! Configuration is read once at bootstrap, normally from the process
//! environment:
//!
//! - `PREFETCH_MODE`: `0` (no prefetch), `1` (object granularity), `2` (tensor
//!   granularity, default)
//! - `DEBUG_FLAG`: nonzero holds bootstrap in a debugger wait loop
//! - `UVM_ADVISOR_PROFILE`: profile log path (default `uvm_advisor_opt.log`)
//! - `UVM_ADVISOR_STREAMS`: prefetch stream count (default 3)
//! - `UVM_ADVISOR_DEVICE`: target device ordinal (default 0)
//! - `UVM_ADVISOR_ON_DEVICE_ERROR`: `abort` (default) or `continue`
//! - `UVM_ADVISOR_TRACK_REGION_FREES`: nonzero applies region free events
//!
//! # Example
//!
//! ```
//! use uvm_advisor::config::{AdvisorConfig, PrefetchMode};
//!
//! let config = AdvisorConfig::new()
//!     .mode(PrefetchMode::Object)
//!     .num_streams(4);
//!
//! assert_eq!(config.mode, PrefetchMode::Object);
//! ```

use crate::error::{AdvisorError, Result};
use serde::Serialize;
use std::path::PathBuf;

/// Allocations at or below this many bytes are never tracked as tensors
pub const LARGE_TENSOR_THRESHOLD: u64 = 1_048_576;

/// Default profile log filename
pub const DEFAULT_PROFILE_PATH: &str = "uvm_advisor_opt.log";

/// Default number of prefetch streams
pub const DEFAULT_NUM_STREAMS: usize = 3;

pub const ENV_PREFETCH_MODE: &str = "PREFETCH_MODE";
pub const ENV_DEBUG_FLAG: &str = "DEBUG_FLAG";
pub const ENV_PROFILE: &str = "UVM_ADVISOR_PROFILE";
pub const ENV_STREAMS: &str = "UVM_ADVISOR_STREAMS";
pub const ENV_DEVICE: &str = "UVM_ADVISOR_DEVICE";
pub const ENV_ON_DEVICE_ERROR: &str = "UVM_ADVISOR_ON_DEVICE_ERROR";
pub const ENV_TRACK_REGION_FREES: &str = "UVM_ADVISOR_TRACK_REGION_FREES";

/// Prefetch policy selected at bootstrap
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
pub enum PrefetchMode {
    /// Operation hook does nothing
    NoPrefetch,
    /// Prefetch whole unified-memory regions
    Object,
    /// Prefetch individual large tensor allocations
    #[default]
    Tensor,
}

impl PrefetchMode {
    /// Map the numeric `PREFETCH_MODE` value
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(PrefetchMode::NoPrefetch),
            1 => Some(PrefetchMode::Object),
            2 => Some(PrefetchMode::Tensor),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        match self {
            PrefetchMode::NoPrefetch => 0,
            PrefetchMode::Object => 1,
            PrefetchMode::Tensor => 2,
        }
    }

    /// Which schedule list this mode reads, if any
    pub fn granularity(self) -> Option<Granularity> {
        match self {
            PrefetchMode::NoPrefetch => None,
            PrefetchMode::Object => Some(Granularity::Object),
            PrefetchMode::Tensor => Some(Granularity::Tensor),
        }
    }
}

impl std::fmt::Display for PrefetchMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PrefetchMode::NoPrefetch => write!(f, "NO PREFETCH"),
            PrefetchMode::Object => write!(f, "OBJECT GRANULARITY"),
            PrefetchMode::Tensor => write!(f, "TENSOR GRANULARITY"),
        }
    }
}

/// Unit of prefetch: which list of a schedule entry is consulted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Granularity {
    /// Region identifiers (`MemAlloc` lines)
    Object,
    /// Tensor identifiers (`TenAlloc` lines)
    Tensor,
}

/// What to do when the device runtime rejects a prefetch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum DeviceErrorPolicy {
    /// Log at error level and abort the process
    #[default]
    Abort,
    /// Log at error level and keep running
    LogAndContinue,
}

/// Advisor configuration
#[derive(Debug, Clone, Serialize)]
pub struct AdvisorConfig {
    /// Prefetch policy
    pub mode: PrefetchMode,
    /// Path of the profile log parsed at bootstrap
    pub profile_path: PathBuf,
    /// Number of prefetch streams
    pub num_streams: usize,
    /// Device ordinal prefetches migrate to
    pub target_device: i32,
    /// Tensor tracking threshold in bytes
    pub tensor_threshold: u64,
    /// Device error handling
    pub on_device_error: DeviceErrorPolicy,
    /// Apply region free events to the region table
    pub track_region_frees: bool,
    /// Park bootstrap until a debugger releases it
    pub debug_hold: bool,
}

impl Default for AdvisorConfig {
    fn default() -> Self {
        Self {
            mode: PrefetchMode::default(),
            profile_path: PathBuf::from(DEFAULT_PROFILE_PATH),
            num_streams: DEFAULT_NUM_STREAMS,
            target_device: 0,
            tensor_threshold: LARGE_TENSOR_THRESHOLD,
            on_device_error: DeviceErrorPolicy::default(),
            track_region_frees: false,
            debug_hold: false,
        }
    }
}

impl AdvisorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mode(mut self, mode: PrefetchMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn profile_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.profile_path = path.into();
        self
    }

    pub fn num_streams(mut self, n: usize) -> Self {
        self.num_streams = n;
        self
    }

    pub fn target_device(mut self, device: i32) -> Self {
        self.target_device = device;
        self
    }

    pub fn tensor_threshold(mut self, bytes: u64) -> Self {
        self.tensor_threshold = bytes;
        self
    }

    pub fn on_device_error(mut self, policy: DeviceErrorPolicy) -> Self {
        self.on_device_error = policy;
        self
    }

    pub fn track_region_frees(mut self, enable: bool) -> Self {
        self.track_region_frees = enable;
        self
    }

    pub fn debug_hold(mut self, enable: bool) -> Self {
        self.debug_hold = enable;
        self
    }

    /// Read configuration from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through an arbitrary key lookup
    ///
    /// Unset keys keep their defaults. The first invalid value aborts the
    /// read with [`AdvisorError::Config`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(raw) = lookup(ENV_DEBUG_FLAG) {
            config.debug_hold = parse_int(ENV_DEBUG_FLAG, &raw)? != 0;
        }

        if let Some(raw) = lookup(ENV_PREFETCH_MODE) {
            let code = parse_int(ENV_PREFETCH_MODE, &raw)?;
            config.mode = PrefetchMode::from_code(code)
                .ok_or_else(|| config_error(ENV_PREFETCH_MODE, &raw, "expected 0, 1 or 2"))?;
        }

        if let Some(raw) = lookup(ENV_PROFILE) {
            if raw.trim().is_empty() {
                return Err(config_error(ENV_PROFILE, &raw, "path is empty"));
            }
            config.profile_path = PathBuf::from(raw.trim());
        }

        if let Some(raw) = lookup(ENV_STREAMS) {
            let n = parse_int(ENV_STREAMS, &raw)?;
            if n < 1 {
                return Err(config_error(ENV_STREAMS, &raw, "must be at least 1"));
            }
            config.num_streams = usize::try_from(n)
                .map_err(|e| config_error(ENV_STREAMS, &raw, &e.to_string()))?;
        }

        if let Some(raw) = lookup(ENV_DEVICE) {
            let ordinal = parse_int(ENV_DEVICE, &raw)?;
            config.target_device = i32::try_from(ordinal)
                .map_err(|e| config_error(ENV_DEVICE, &raw, &e.to_string()))?;
        }

        if let Some(raw) = lookup(ENV_ON_DEVICE_ERROR) {
            config.on_device_error = match raw.trim().to_lowercase().as_str() {
                "abort" => DeviceErrorPolicy::Abort,
                "continue" | "log" => DeviceErrorPolicy::LogAndContinue,
                _ => {
                    return Err(config_error(
                        ENV_ON_DEVICE_ERROR,
                        &raw,
                        "expected `abort` or `continue`",
                    ))
                }
            };
        }

        if let Some(raw) = lookup(ENV_TRACK_REGION_FREES) {
            config.track_region_frees = parse_int(ENV_TRACK_REGION_FREES, &raw)? != 0;
        }

        Ok(config)
    }
}

fn parse_int(key: &str, raw: &str) -> Result<i64> {
    raw.trim()
        .parse::<i64>()
        .map_err(|e| config_error(key, raw, &e.to_string()))
}

fn config_error(key: &str, value: &str, reason: &str) -> AdvisorError {
    AdvisorError::Config {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = AdvisorConfig::default();
        assert_eq!(config.mode, PrefetchMode::Tensor);
        assert_eq!(config.num_streams, 3);
        assert_eq!(config.tensor_threshold, LARGE_TENSOR_THRESHOLD);
        assert_eq!(config.profile_path, PathBuf::from("uvm_advisor_opt.log"));
        assert_eq!(config.on_device_error, DeviceErrorPolicy::Abort);
        assert!(!config.debug_hold);
        assert!(!config.track_region_frees);
    }

    #[test]
    fn test_mode_codes() {
        assert_eq!(PrefetchMode::from_code(0), Some(PrefetchMode::NoPrefetch));
        assert_eq!(PrefetchMode::from_code(1), Some(PrefetchMode::Object));
        assert_eq!(PrefetchMode::from_code(2), Some(PrefetchMode::Tensor));
        assert_eq!(PrefetchMode::from_code(3), None);
        assert_eq!(PrefetchMode::from_code(-1), None);
        assert_eq!(PrefetchMode::Object.code(), 1);
    }

    #[test]
    fn test_mode_granularity() {
        assert_eq!(PrefetchMode::NoPrefetch.granularity(), None);
        assert_eq!(PrefetchMode::Object.granularity(), Some(Granularity::Object));
        assert_eq!(PrefetchMode::Tensor.granularity(), Some(Granularity::Tensor));
    }

    #[test]
    fn test_mode_display() {
        assert_eq!(PrefetchMode::NoPrefetch.to_string(), "NO PREFETCH");
        assert_eq!(PrefetchMode::Tensor.to_string(), "TENSOR GRANULARITY");
    }

    #[test]
    fn test_from_lookup() {
        let config = AdvisorConfig::from_lookup(lookup_from(&[
            ("PREFETCH_MODE", "1"),
            ("DEBUG_FLAG", "0"),
            ("UVM_ADVISOR_PROFILE", "/tmp/profile.log"),
            ("UVM_ADVISOR_STREAMS", "5"),
            ("UVM_ADVISOR_DEVICE", "1"),
            ("UVM_ADVISOR_ON_DEVICE_ERROR", "continue"),
            ("UVM_ADVISOR_TRACK_REGION_FREES", "1"),
        ]))
        .unwrap();

        assert_eq!(config.mode, PrefetchMode::Object);
        assert!(!config.debug_hold);
        assert_eq!(config.profile_path, PathBuf::from("/tmp/profile.log"));
        assert_eq!(config.num_streams, 5);
        assert_eq!(config.target_device, 1);
        assert_eq!(config.on_device_error, DeviceErrorPolicy::LogAndContinue);
        assert!(config.track_region_frees);
    }

    #[test]
    fn test_debug_flag_nonzero() {
        let config = AdvisorConfig::from_lookup(lookup_from(&[("DEBUG_FLAG", "7")])).unwrap();
        assert!(config.debug_hold);
    }

    #[test]
    fn test_invalid_mode_rejected() {
        let err = AdvisorConfig::from_lookup(lookup_from(&[("PREFETCH_MODE", "9")])).unwrap_err();
        assert!(matches!(err, AdvisorError::Config { ref key, .. } if key == "PREFETCH_MODE"));

        let err = AdvisorConfig::from_lookup(lookup_from(&[("PREFETCH_MODE", "abc")])).unwrap_err();
        assert!(matches!(err, AdvisorError::Config { .. }));
    }

    #[test]
    fn test_zero_streams_rejected() {
        let err =
            AdvisorConfig::from_lookup(lookup_from(&[("UVM_ADVISOR_STREAMS", "0")])).unwrap_err();
        assert!(
            matches!(err, AdvisorError::Config { ref key, .. } if key == "UVM_ADVISOR_STREAMS")
        );
    }

    #[test]
    fn test_builder() {
        let config = AdvisorConfig::new()
            .mode(PrefetchMode::NoPrefetch)
            .num_streams(1)
            .target_device(2)
            .tensor_threshold(16)
            .on_device_error(DeviceErrorPolicy::LogAndContinue)
            .track_region_frees(true)
            .profile_path("trace.log");

        assert_eq!(config.mode, PrefetchMode::NoPrefetch);
        assert_eq!(config.num_streams, 1);
        assert_eq!(config.target_device, 2);
        assert_eq!(config.tensor_threshold, 16);
        assert!(config.track_region_frees);
        assert_eq!(config.profile_path, PathBuf::from("trace.log"));
    }

    #[test]
    #[serial_test::serial(uvm_env)]
    fn test_from_env() {
        temp_env::with_vars(
            [
                ("PREFETCH_MODE", Some("0")),
                ("UVM_ADVISOR_STREAMS", Some("2")),
                ("DEBUG_FLAG", None),
            ],
            || {
                let config = AdvisorConfig::from_env().unwrap();
                assert_eq!(config.mode, PrefetchMode::NoPrefetch);
                assert_eq!(config.num_streams, 2);
                assert!(!config.debug_hold);
            },
        );
    }
}
