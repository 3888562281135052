//! Prefetch engine
//!
//! [`PrefetchEngine`] owns everything the advisor mutates: the operation
//! counter, both allocation tables, the stream pool and the immutable
//! schedule. The host reaches it only through [`EventSink`].
//!
//! # Operation hook
//!
//! On every operation start:
//!
//! 1. the operation counter advances, so the first operation is `op_id == 1`
//! 2. the schedule is consulted for that `op_id` at the configured granularity
//! 3. every identifier is resolved against the live tables; misses are skipped
//! 4. each resolved range is handed to the next stream in rotation
//!
//! Steps run strictly in that order for a given operation. The registry lock
//! is released before the dispatcher lock is taken.
//!
//! # Example
//!
//! ```
//! use uvm_advisor::config::AdvisorConfig;
//! use uvm_advisor::engine::PrefetchEngine;
//! use uvm_advisor::hooks::{DeviceLocation, EventSink, OpContext};
//! use uvm_advisor::runtime::RecordingRuntime;
//! use uvm_advisor::schedule::ProfileSchedule;
//!
//! let schedule = ProfileSchedule::parse_str("Op - op_id: 1\nTenAlloc 1:\n")?;
//! let runtime = RecordingRuntime::new();
//! let engine = PrefetchEngine::new(&AdvisorConfig::default(), Some(schedule), runtime.clone())?;
//!
//! engine.on_allocation_report(0x1000, 2 << 20, DeviceLocation::cuda(0));
//! engine.on_operation_start(&OpContext::named("aten::mm"));
//!
//! assert_eq!(runtime.request_count(), 1);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use crate::config::{AdvisorConfig, DeviceErrorPolicy, Granularity, PrefetchMode};
use crate::dispatch::StreamPool;
use crate::error::{DeviceError, Result};
use crate::hooks::{
    contain, CallbackId, DeviceLocation, EventSink, ObserverHandle, OpContext, ResourceEvent,
};
use crate::registry::{AllocationRecord, AllocationRegistry, RegionId, RegistryStats, TensorId};
use crate::runtime::DeviceRuntime;
use crate::schedule::ProfileSchedule;
use crate::stats::{EngineStats, EngineStatsSnapshot};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide prefetch context
pub struct PrefetchEngine<R: DeviceRuntime> {
    mode: PrefetchMode,
    schedule: Option<ProfileSchedule>,
    registry: Mutex<AllocationRegistry>,
    dispatcher: Mutex<StreamPool<R>>,
    op_counter: AtomicU64,
    /// Reserved; no current logic advances it
    kernel_counter: AtomicU64,
    on_device_error: DeviceErrorPolicy,
    track_region_frees: bool,
    stats: EngineStats,
}

impl<R: DeviceRuntime> PrefetchEngine<R> {
    /// Build an engine and its stream pool
    ///
    /// `schedule == None` means the profile could not be loaded; the engine
    /// then behaves as [`PrefetchMode::NoPrefetch`] whatever `config.mode` says.
    pub fn new(
        config: &AdvisorConfig,
        schedule: Option<ProfileSchedule>,
        runtime: R,
    ) -> Result<Self> {
        let dispatcher = StreamPool::new(runtime, config.num_streams, config.target_device)?;

        Ok(Self {
            mode: config.mode,
            schedule,
            registry: Mutex::new(AllocationRegistry::new(config.tensor_threshold)),
            dispatcher: Mutex::new(dispatcher),
            op_counter: AtomicU64::new(0),
            kernel_counter: AtomicU64::new(0),
            on_device_error: config.on_device_error,
            track_region_frees: config.track_region_frees,
            stats: EngineStats::new(),
        })
    }

    /// Configured mode
    pub fn mode(&self) -> PrefetchMode {
        self.mode
    }

    /// Mode actually in force, accounting for a missing schedule
    pub fn effective_mode(&self) -> PrefetchMode {
        if self.schedule.is_some() {
            self.mode
        } else {
            PrefetchMode::NoPrefetch
        }
    }

    pub fn schedule(&self) -> Option<&ProfileSchedule> {
        self.schedule.as_ref()
    }

    /// Index of the most recently started operation
    pub fn op_id(&self) -> u64 {
        self.op_counter.load(Ordering::SeqCst)
    }

    pub fn kernel_id(&self) -> u64 {
        self.kernel_counter.load(Ordering::Relaxed)
    }

    /// Advance the operation counter and prefetch for the new operation
    ///
    /// Returns the new `op_id`.
    pub fn operation_start(&self) -> u64 {
        let op_id = self.op_counter.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats.record_op();
        if let Some(granularity) = self.effective_mode().granularity() {
            self.prefetch_for(op_id, granularity);
        }
        op_id
    }

    /// Issue prefetches scheduled for `op_id` at `granularity`
    ///
    /// Returns the number of requests the runtime accepted.
    pub fn prefetch_for(&self, op_id: u64, granularity: Granularity) -> usize {
        let Some(schedule) = self.schedule.as_ref() else {
            return 0;
        };
        let ids = schedule.ids(op_id, granularity);
        if ids.is_empty() {
            return 0;
        }

        let batch: Vec<AllocationRecord> = {
            let registry = self.registry.lock();
            ids.iter()
                .filter_map(|&id| match granularity {
                    Granularity::Object => registry.resolve_region(id),
                    Granularity::Tensor => registry.resolve_tensor(id),
                })
                .collect()
        };

        let unresolved = ids.len() - batch.len();
        if unresolved > 0 {
            self.stats.record_unresolved(unresolved as u64);
            tracing::trace!(op_id, unresolved, "skipping ids with no live allocation");
        }

        let mut issued = 0;
        let mut dispatcher = self.dispatcher.lock();
        for record in batch {
            match dispatcher.prefetch_region(record.address, record.size) {
                Ok(_) => {
                    self.stats.record_prefetch(record.size);
                    issued += 1;
                }
                Err(err) => self.handle_device_error(op_id, err),
            }
        }
        issued
    }

    fn handle_device_error(&self, op_id: u64, err: DeviceError) {
        self.stats.record_device_error();
        tracing::error!(op_id, error = %err, "prefetch request failed");
        if self.on_device_error == DeviceErrorPolicy::Abort {
            tracing::error!("aborting: device error policy is `abort`");
            std::process::abort();
        }
    }

    pub fn record_tensor_alloc(&self, address: u64, size: i64) -> Option<TensorId> {
        let id = self.registry.lock().record_tensor_alloc(address, size);
        if id.is_some() {
            self.stats.record_tensor_alloc();
        }
        id
    }

    pub fn record_tensor_free(&self, address: u64, negative_size: i64) -> Option<TensorId> {
        let id = self.registry.lock().record_tensor_free(address, negative_size);
        if id.is_some() {
            self.stats.record_tensor_free();
        }
        id
    }

    pub fn record_region_alloc(&self, address: u64, size: u64) -> RegionId {
        let id = self.registry.lock().record_region_alloc(address, size);
        self.stats.record_region_alloc();
        id
    }

    pub fn record_region_free(&self, address: u64) -> Option<RegionId> {
        let id = self.registry.lock().record_region_free(address);
        if id.is_some() {
            self.stats.record_region_free();
        }
        id
    }

    pub fn resolve_tensor(&self, tensor_id: TensorId) -> Option<AllocationRecord> {
        self.registry.lock().resolve_tensor(tensor_id)
    }

    pub fn resolve_region(&self, region_id: RegionId) -> Option<AllocationRecord> {
        self.registry.lock().resolve_region(region_id)
    }

    pub fn tensor_id_at(&self, address: u64) -> Option<TensorId> {
        self.registry.lock().tensor_id_at(address)
    }

    pub fn registry_stats(&self) -> RegistryStats {
        self.registry.lock().stats()
    }

    /// Stream slot the next prefetch will use
    pub fn dispatcher_cursor(&self) -> usize {
        self.dispatcher.lock().cursor()
    }

    pub fn num_streams(&self) -> usize {
        self.dispatcher.lock().num_streams()
    }

    pub fn stats(&self) -> EngineStatsSnapshot {
        self.stats.snapshot()
    }
}

impl<R: DeviceRuntime> EventSink for PrefetchEngine<R> {
    fn on_operation_start(&self, ctx: &OpContext) -> ObserverHandle {
        contain("operation_start", ObserverHandle::new(0), || {
            let op_id = self.operation_start();
            tracing::trace!(op_id, op = ctx.name.as_deref().unwrap_or(""), "operation start");
            ObserverHandle::new(op_id)
        })
    }

    fn on_operation_end(&self, _ctx: &OpContext, _handle: ObserverHandle) {}

    fn on_allocation_report(&self, address: u64, delta: i64, device: DeviceLocation) {
        contain("allocation_report", (), || {
            if !device.is_unified_capable() || delta == 0 {
                self.stats.record_ignored();
                return;
            }
            if delta > 0 {
                self.record_tensor_alloc(address, delta);
            } else {
                self.record_tensor_free(address, delta);
            }
        })
    }

    fn on_resource_event(&self, event: &ResourceEvent) {
        contain("resource_event", (), || {
            if !event.is_uvm() {
                self.stats.record_ignored();
                return;
            }
            match event.callback {
                CallbackId::DeviceMemoryAlloc => {
                    self.record_region_alloc(event.address, event.size);
                }
                CallbackId::DeviceMemoryFree if self.track_region_frees => {
                    self.record_region_free(event.address);
                }
                _ => self.stats.record_ignored(),
            }
        })
    }
}

impl<R: DeviceRuntime> std::fmt::Debug for PrefetchEngine<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrefetchEngine")
            .field("mode", &self.mode)
            .field("effective_mode", &self.effective_mode())
            .field("scheduled_ops", &self.schedule.as_ref().map(|s| s.len()))
            .field("op_id", &self.op_id())
            .field("dispatcher", &*self.dispatcher.lock())
            .finish()
    }
}
