//! Property-based tests for the schedule parser, registry and dispatcher

use proptest::prelude::*;
use std::collections::HashMap;
use uvm_advisor::{
    AdvisorConfig, AllocationRecord, AllocationRegistry, DeviceErrorPolicy, Granularity,
    PrefetchEngine, PrefetchMode, ProfileSchedule, RecordingRuntime, ScheduleEntry, StreamPool,
    LARGE_TENSOR_THRESHOLD,
};

// ============================================================================
// Strategies
// ============================================================================

fn id_list() -> impl Strategy<Value = Vec<u64>> {
    prop::collection::vec(0u64..1_000_000, 0..8)
}

fn schedule_entries() -> impl Strategy<Value = HashMap<u64, (Vec<u64>, Vec<u64>)>> {
    prop::collection::hash_map(1u64..500, (id_list(), id_list()), 0..20)
}

fn render_log(entries: &HashMap<u64, (Vec<u64>, Vec<u64>)>) -> String {
    let mut ops: Vec<_> = entries.keys().copied().collect();
    ops.sort_unstable();

    let mut log = String::from("profiling run\n");
    for op in ops {
        let (regions, tensors) = &entries[&op];
        log.push_str(&format!("Op - name: aten::op op_id: {op}\n"));
        log.push_str("MemAlloc");
        for id in regions {
            log.push_str(&format!(" {id}:4096"));
        }
        log.push('\n');
        log.push_str("TenAlloc");
        for id in tensors {
            log.push_str(&format!(" {id}:2097152"));
        }
        log.push('\n');
    }
    log
}

// ============================================================================
// Schedule Properties
// ============================================================================

proptest! {
    /// Property: every rendered entry parses back to the same id lists, in order
    #[test]
    fn prop_schedule_preserves_ids(entries in schedule_entries()) {
        let schedule = ProfileSchedule::parse_str(&render_log(&entries)).unwrap();

        prop_assert_eq!(schedule.len(), entries.len());
        for (op, (regions, tensors)) in &entries {
            let entry = schedule.get(*op).unwrap();
            prop_assert_eq!(&entry.region_ids, regions);
            prop_assert_eq!(&entry.tensor_ids, tensors);
        }
    }

    /// Property: unscheduled operations yield no ids at either granularity
    #[test]
    fn prop_absent_ops_empty(entries in schedule_entries(), probe in 500u64..1000) {
        let schedule = ProfileSchedule::parse_str(&render_log(&entries)).unwrap();
        prop_assert!(schedule.ids(probe, Granularity::Object).is_empty());
        prop_assert!(schedule.ids(probe, Granularity::Tensor).is_empty());
    }
}

// ============================================================================
// Registry Properties
// ============================================================================

proptest! {
    /// Property: large allocations resolve exactly until freed, then both lookups miss
    #[test]
    fn prop_tensor_lifecycle(sizes in prop::collection::vec(1i64..8 * 1024 * 1024, 1..40)) {
        let mut registry = AllocationRegistry::default();
        let mut live = Vec::new();

        for (i, size) in sizes.iter().enumerate() {
            let address = 0x1000_0000 + (i as u64) * 0x100_0000;
            match registry.record_tensor_alloc(address, *size) {
                Some(id) => {
                    prop_assert!(*size as u64 > LARGE_TENSOR_THRESHOLD);
                    prop_assert_eq!(
                        registry.resolve_tensor(id),
                        Some(AllocationRecord::new(address, *size as u64))
                    );
                    live.push((id, address, *size));
                }
                None => {
                    prop_assert!(*size as u64 <= LARGE_TENSOR_THRESHOLD);
                    let before = registry.stats();
                    prop_assert_eq!(registry.record_tensor_free(address, -*size), None);
                    prop_assert_eq!(registry.stats(), before);
                }
            }
        }

        for (id, address, size) in live {
            prop_assert_eq!(registry.record_tensor_free(address, -size), Some(id));
            prop_assert_eq!(registry.resolve_tensor(id), None);
            prop_assert_eq!(registry.tensor_id_at(address), None);
        }
        prop_assert_eq!(registry.live_tensors(), 0);
    }

    /// Property: issued tensor ids are strictly increasing and gap-free
    #[test]
    fn prop_tensor_ids_monotonic(count in 1usize..50) {
        let mut registry = AllocationRegistry::default();
        let ids: Vec<u64> = (0..count)
            .filter_map(|i| registry.record_tensor_alloc(i as u64 * 0x1000, 2 << 20))
            .collect();
        let expected: Vec<u64> = (1..=count as u64).collect();
        prop_assert_eq!(ids, expected);
    }

    /// Property: without frees every region id stays resolvable, even when addresses repeat
    #[test]
    fn prop_regions_accumulate(slots in prop::collection::vec((0u64..4, 1u64..1 << 24), 1..40)) {
        let mut registry = AllocationRegistry::default();
        let mut issued = Vec::new();

        for (slot, size) in &slots {
            let address = 0x7f00_0000_0000 + slot * 0x100_0000;
            issued.push((registry.record_region_alloc(address, *size), address, *size));
        }

        prop_assert_eq!(registry.live_regions(), slots.len());
        for (id, address, size) in issued {
            prop_assert_eq!(
                registry.resolve_region(id),
                Some(AllocationRecord::new(address, size))
            );
        }
    }
}

// ============================================================================
// Dispatcher Properties
// ============================================================================

proptest! {
    /// Property: k requests over N streams land on 0, 1, .., N-1, 0, .. and leave cursor = k mod N
    #[test]
    fn prop_round_robin(num_streams in 1usize..8, k in 0usize..64) {
        let runtime = RecordingRuntime::new();
        let mut pool = StreamPool::new(runtime.clone(), num_streams, 0).unwrap();

        for i in 0..k {
            pool.prefetch_region(i as u64 * 0x1000, 4096).unwrap();
        }

        let expected: Vec<usize> = (0..k).map(|i| i % num_streams).collect();
        prop_assert_eq!(runtime.stream_sequence(), expected);
        prop_assert_eq!(pool.cursor(), k % num_streams);
    }

    /// Property: no-prefetch mode never issues, whatever the schedule holds
    #[test]
    fn prop_no_prefetch_mode_silent(entries in schedule_entries(), ops in 0u64..50) {
        let schedule = ProfileSchedule::from_entries(entries.into_iter().map(|(op, (r, t))| {
            (op, ScheduleEntry { region_ids: r, tensor_ids: t })
        }));
        let runtime = RecordingRuntime::new();
        let engine = PrefetchEngine::new(
            &AdvisorConfig::new()
                .mode(PrefetchMode::NoPrefetch)
                .on_device_error(DeviceErrorPolicy::LogAndContinue),
            Some(schedule),
            runtime.clone(),
        )
        .unwrap();
        for i in 0..20u64 {
            engine.record_tensor_alloc(i * 0x100_0000, 2 << 20);
            engine.record_region_alloc(0x8000_0000 + i * 0x1000, 4096);
        }

        for _ in 0..ops {
            engine.operation_start();
        }
        prop_assert_eq!(runtime.request_count(), 0);
        prop_assert_eq!(engine.op_id(), ops);
    }
}
