//! Inbound event interfaces
//!
//! The host drives the advisor through four events:
//!
//! | Event | Source |
//! |---|---|
//! | operation start / end | host execution engine |
//! | allocation report (signed size delta) | host tensor allocator |
//! | resource event | device memory event subscriber |
//!
//! [`EventSink`] is the receiving side, implemented by
//! [`PrefetchEngine`](crate::engine::PrefetchEngine). [`EventSource`] is the
//! delivering side: bootstrap subscribes the engine to every source exactly
//! once, and the source decides how host callbacks reach the sink.
//!
//! Sink methods are boundary functions. They return nothing fallible and
//! must never unwind into the host.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// Resource flag marking a unified-memory (managed) allocation
pub const UVM_MEMORY_FLAG: u32 = 0x6;

/// Context the host passes with an operation boundary
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpContext {
    /// Operator name, if the host provides one
    pub name: Option<String>,
}

impl OpContext {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
        }
    }

    pub fn anonymous() -> Self {
        Self::default()
    }
}

/// Handle returned from an operation start, given back at its end
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverHandle {
    op_id: u64,
}

impl ObserverHandle {
    pub fn new(op_id: u64) -> Self {
        Self { op_id }
    }

    /// Operation index assigned at start; 0 if the hook faulted
    pub fn op_id(&self) -> u64 {
        self.op_id
    }
}

/// Kind of device an allocation report refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    Cpu,
    Cuda,
    Other,
}

/// Device an allocation report refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceLocation {
    pub kind: DeviceKind,
    pub index: i32,
}

impl DeviceLocation {
    pub fn cuda(index: i32) -> Self {
        Self {
            kind: DeviceKind::Cuda,
            index,
        }
    }

    pub fn cpu() -> Self {
        Self {
            kind: DeviceKind::Cpu,
            index: -1,
        }
    }

    /// Whether allocations on this device live in unified memory
    pub fn is_unified_capable(&self) -> bool {
        self.kind == DeviceKind::Cuda
    }
}

/// Callback domain of a device memory event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallbackDomain {
    Resource,
    Other(u32),
}

/// Callback id within the resource domain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallbackId {
    DeviceMemoryAlloc,
    DeviceMemoryFree,
    Other(u32),
}

/// Device memory event from the low-level subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceEvent {
    pub domain: CallbackDomain,
    pub callback: CallbackId,
    pub address: u64,
    pub size: u64,
    pub flags: u32,
}

impl ResourceEvent {
    /// Unified-memory allocation event
    pub fn uvm_alloc(address: u64, size: u64) -> Self {
        Self {
            domain: CallbackDomain::Resource,
            callback: CallbackId::DeviceMemoryAlloc,
            address,
            size,
            flags: UVM_MEMORY_FLAG,
        }
    }

    /// Unified-memory free event
    pub fn uvm_free(address: u64) -> Self {
        Self {
            domain: CallbackDomain::Resource,
            callback: CallbackId::DeviceMemoryFree,
            address,
            size: 0,
            flags: UVM_MEMORY_FLAG,
        }
    }

    /// Whether the event carries the unified-memory marker in the resource domain
    pub fn is_uvm(&self) -> bool {
        self.domain == CallbackDomain::Resource && self.flags == UVM_MEMORY_FLAG
    }
}

/// Receiving side of host events
pub trait EventSink: Send + Sync {
    fn on_operation_start(&self, ctx: &OpContext) -> ObserverHandle;

    fn on_operation_end(&self, ctx: &OpContext, handle: ObserverHandle);

    /// Positive `delta` is an allocation, negative a free
    fn on_allocation_report(&self, address: u64, delta: i64, device: DeviceLocation);

    fn on_resource_event(&self, event: &ResourceEvent);
}

/// Delivering side of host events
pub trait EventSource {
    fn name(&self) -> &str;

    /// Start delivering events to `sink`
    fn subscribe(&mut self, sink: Arc<dyn EventSink>) -> anyhow::Result<()>;
}

/// Event source driven by explicit calls
///
/// Stands in for host wiring in tests and trace replay.
#[derive(Default)]
pub struct ManualEventSource {
    name: String,
    sinks: Vec<Arc<dyn EventSink>>,
}

impl ManualEventSource {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sinks: Vec::new(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sinks.len()
    }

    /// Deliver an operation start; returns the handle of the last sink
    pub fn operation_start(&self, ctx: &OpContext) -> Option<ObserverHandle> {
        self.sinks
            .iter()
            .map(|sink| sink.on_operation_start(ctx))
            .last()
    }

    pub fn operation_end(&self, ctx: &OpContext, handle: ObserverHandle) {
        for sink in &self.sinks {
            sink.on_operation_end(ctx, handle);
        }
    }

    /// Deliver a start immediately followed by its end
    pub fn operation(&self, name: &str) -> Option<ObserverHandle> {
        let ctx = OpContext::named(name);
        let handle = self.operation_start(&ctx)?;
        self.operation_end(&ctx, handle);
        Some(handle)
    }

    pub fn allocation_report(&self, address: u64, delta: i64, device: DeviceLocation) {
        for sink in &self.sinks {
            sink.on_allocation_report(address, delta, device);
        }
    }

    pub fn resource_event(&self, event: ResourceEvent) {
        for sink in &self.sinks {
            sink.on_resource_event(&event);
        }
    }
}

impl EventSource for ManualEventSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn subscribe(&mut self, sink: Arc<dyn EventSink>) -> anyhow::Result<()> {
        self.sinks.push(sink);
        Ok(())
    }
}

impl std::fmt::Debug for ManualEventSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManualEventSource")
            .field("name", &self.name)
            .field("subscribers", &self.sinks.len())
            .finish()
    }
}

/// Run `f` at an event boundary, converting a panic into `fallback`
pub(crate) fn contain<T>(hook: &'static str, fallback: T, f: impl FnOnce() -> T) -> T {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => value,
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            tracing::error!(hook, %message, "event hook faulted; event dropped");
            fallback
        }
    }
}
