//! Live allocation tables
//!
//! Two independently keyed tables map stable identifiers to the current
//! device address and size of an allocation:
//!
//! - tensor table: large allocations reported by the host allocator, with an
//!   `address -> tensor_id` reverse index so frees resolve in O(1)
//! - region table: unified-memory regions reported by the device memory
//!   event subscriber
//!
//! Identifiers come from monotonically increasing counters starting at 1 and
//! are never reused. This is what lets an offline schedule name allocations
//! that did not exist yet when the schedule was written.

use serde::Serialize;
use std::collections::HashMap;

/// Identifier of a tracked tensor allocation
pub type TensorId = u64;

/// Identifier of a tracked unified-memory region
pub type RegionId = u64;

/// Current placement of one live allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct AllocationRecord {
    /// Device address of the first byte
    pub address: u64,
    /// Length in bytes
    pub size: u64,
}

impl AllocationRecord {
    pub fn new(address: u64, size: u64) -> Self {
        Self { address, size }
    }
}

/// Registry statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub live_tensors: usize,
    pub live_regions: usize,
    pub tracked_tensor_bytes: u64,
    pub tracked_region_bytes: u64,
    pub last_tensor_id: TensorId,
    pub last_region_id: RegionId,
}

/// Tensor and region allocation tables
#[derive(Debug)]
pub struct AllocationRegistry {
    /// Allocations strictly above this size are tracked as tensors
    threshold: u64,
    /// Last issued tensor id
    tensor_counter: TensorId,
    /// Last issued region id
    region_counter: RegionId,
    tensors: HashMap<TensorId, AllocationRecord>,
    address_to_tensor: HashMap<u64, TensorId>,
    regions: HashMap<RegionId, AllocationRecord>,
    address_to_region: HashMap<u64, RegionId>,
}

impl AllocationRegistry {
    /// Create an empty registry tracking tensors larger than `threshold` bytes
    pub fn new(threshold: u64) -> Self {
        Self {
            threshold,
            tensor_counter: 0,
            region_counter: 0,
            tensors: HashMap::new(),
            address_to_tensor: HashMap::new(),
            regions: HashMap::new(),
            address_to_region: HashMap::new(),
        }
    }

    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    /// Record a host allocator allocation
    ///
    /// Allocations of `threshold` bytes or fewer are not prefetch candidates
    /// and return `None` without touching the counter.
    pub fn record_tensor_alloc(&mut self, address: u64, size: i64) -> Option<TensorId> {
        let size = u64::try_from(size).ok()?;
        if size <= self.threshold {
            return None;
        }

        self.tensor_counter += 1;
        let tensor_id = self.tensor_counter;

        // The host never reuses a live address; if it does, the old entry is
        // stale and must go so the reverse index stays an exact inverse.
        if let Some(stale) = self.address_to_tensor.insert(address, tensor_id) {
            self.tensors.remove(&stale);
            tracing::warn!(address, stale_id = stale, "tensor address re-registered before free");
        }
        self.tensors.insert(tensor_id, AllocationRecord::new(address, size));

        tracing::trace!(tensor_id, address, size, "tensor tracked");
        Some(tensor_id)
    }

    /// Record a host allocator free
    ///
    /// Free events report the size as a negative delta. Frees whose magnitude
    /// is within the threshold, and frees of untracked addresses, are no-ops.
    /// Returns the id that was released.
    pub fn record_tensor_free(&mut self, address: u64, negative_size: i64) -> Option<TensorId> {
        let magnitude = negative_size.checked_neg().unwrap_or(i64::MAX);
        if magnitude <= 0 || magnitude as u64 <= self.threshold {
            return None;
        }

        let tensor_id = self.address_to_tensor.remove(&address)?;
        self.tensors.remove(&tensor_id);
        tracing::trace!(tensor_id, address, "tensor released");
        Some(tensor_id)
    }

    /// Record a unified-memory region allocation
    ///
    /// Always inserts. An earlier region at the same address keeps its entry
    /// so schedules naming its id still resolve; only the reverse index moves
    /// to the newest id.
    pub fn record_region_alloc(&mut self, address: u64, size: u64) -> RegionId {
        self.region_counter += 1;
        let region_id = self.region_counter;

        self.address_to_region.insert(address, region_id);
        self.regions.insert(region_id, AllocationRecord::new(address, size));

        tracing::trace!(region_id, address, size, "region tracked");
        region_id
    }

    /// Drop the region that starts at `address`
    ///
    /// Only called when region free tracking is enabled; by default region
    /// entries live for the whole process.
    pub fn record_region_free(&mut self, address: u64) -> Option<RegionId> {
        let region_id = self.address_to_region.remove(&address)?;
        self.regions.remove(&region_id);
        Some(region_id)
    }

    /// Current placement of `tensor_id`, `None` once freed or never tracked
    pub fn resolve_tensor(&self, tensor_id: TensorId) -> Option<AllocationRecord> {
        self.tensors.get(&tensor_id).copied()
    }

    /// Current placement of `region_id`
    pub fn resolve_region(&self, region_id: RegionId) -> Option<AllocationRecord> {
        self.regions.get(&region_id).copied()
    }

    /// Tensor id currently living at `address`
    pub fn tensor_id_at(&self, address: u64) -> Option<TensorId> {
        self.address_to_tensor.get(&address).copied()
    }

    pub fn live_tensors(&self) -> usize {
        self.tensors.len()
    }

    pub fn live_regions(&self) -> usize {
        self.regions.len()
    }

    pub fn tracked_tensor_bytes(&self) -> u64 {
        self.tensors.values().map(|r| r.size).sum()
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            live_tensors: self.tensors.len(),
            live_regions: self.regions.len(),
            tracked_tensor_bytes: self.tracked_tensor_bytes(),
            tracked_region_bytes: self.regions.values().map(|r| r.size).sum(),
            last_tensor_id: self.tensor_counter,
            last_region_id: self.region_counter,
        }
    }
}

impl Default for AllocationRegistry {
    fn default() -> Self {
        Self::new(crate::config::LARGE_TENSOR_THRESHOLD)
    }
}
