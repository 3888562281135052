//! # uvm-advisor
//!
//! Profile-guided prefetching for CUDA unified memory.
//!
//! A profiling run records, for every logical operation, which allocations
//! the operation touched. At run time the advisor replays that knowledge:
//! on each operation start it looks up the allocations the profile named,
//! resolves them to their current addresses and issues non-blocking
//! migration hints across a small pool of streams, so pages move to the GPU
//! before the kernels that fault on them.
//!
//! This crate provides:
//! - the profile log parser ([`schedule`])
//! - live allocation tables keyed by stable ids ([`registry`])
//! - a round-robin stream dispatcher ([`dispatch`]) over a pluggable device
//!   runtime ([`runtime`])
//! - the engine tying them together behind host event hooks ([`engine`], [`hooks`])
//! - environment configuration and process-start wiring ([`config`], [`bootstrap`])
//!
//! Prefetches are hints. The unified-memory fault handler remains the
//! correctness mechanism; nothing here allocates, frees or waits on memory.
//!
//! # Quick start
//!
//! ```
//! use uvm_advisor::prelude::*;
//!
//! let runtime = RecordingRuntime::new();
//! let mut host = ManualEventSource::new("host");
//! let config = AdvisorConfig::new().profile_path("missing.log");
//!
//! let engine = bootstrap(&config, runtime.clone(), &mut [&mut host])?;
//! host.operation("aten::mm");
//!
//! // No profile, so nothing was prefetched
//! assert_eq!(engine.effective_mode(), PrefetchMode::NoPrefetch);
//! assert_eq!(runtime.request_count(), 0);
//! # Ok::<(), anyhow::Error>(())
//! ```

#![deny(warnings)]

pub mod bootstrap;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod hooks;
pub mod registry;
pub mod runtime;
pub mod schedule;
pub mod stats;
pub mod telemetry;

pub use bootstrap::{bootstrap, bootstrap_from_env, release_debug_hold, wait_for_debugger};
pub use config::{
    AdvisorConfig, DeviceErrorPolicy, Granularity, PrefetchMode, LARGE_TENSOR_THRESHOLD,
};
pub use dispatch::StreamPool;
pub use engine::PrefetchEngine;
pub use error::{AdvisorError, DeviceError, Result, ScheduleError};
pub use hooks::{
    CallbackDomain, CallbackId, DeviceKind, DeviceLocation, EventSink, EventSource,
    ManualEventSource, ObserverHandle, OpContext, ResourceEvent, UVM_MEMORY_FLAG,
};
pub use registry::{AllocationRecord, AllocationRegistry, RegionId, RegistryStats, TensorId};
pub use runtime::{DeviceRuntime, PrefetchRequest, RecordingRuntime};
pub use schedule::{ProfileSchedule, ScheduleEntry};
pub use stats::{EngineStats, EngineStatsSnapshot};
pub use telemetry::{init_tracing, TracingConfig, TracingFormat};

#[cfg(feature = "cuda")]
pub use runtime::CudaRuntime;

/// Common imports
pub mod prelude {
    pub use crate::bootstrap::{bootstrap, bootstrap_from_env};
    pub use crate::config::{AdvisorConfig, DeviceErrorPolicy, Granularity, PrefetchMode};
    pub use crate::engine::PrefetchEngine;
    pub use crate::hooks::{
        DeviceLocation, EventSink, EventSource, ManualEventSource, OpContext, ResourceEvent,
    };
    pub use crate::runtime::{DeviceRuntime, RecordingRuntime};
    pub use crate::schedule::ProfileSchedule;
}
