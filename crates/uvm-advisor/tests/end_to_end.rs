//! End-to-end tests for uvm-advisor
//!
//! Drive a bootstrapped engine through host-style event sources and check
//! the requests that reach the device runtime.

use anyhow::Result;
use std::path::PathBuf;
use uvm_advisor::{
    bootstrap, AdvisorConfig, DeviceErrorPolicy, DeviceLocation, ManualEventSource, PrefetchMode,
    PrefetchRequest, ProfileSchedule, RecordingRuntime, ResourceEvent,
};

const MB: u64 = 1024 * 1024;

fn write_profile(dir: &tempfile::TempDir, contents: &str) -> PathBuf {
    let path = dir.path().join("uvm_advisor_opt.log");
    std::fs::write(&path, contents).expect("write profile");
    path
}

fn config(path: PathBuf, mode: PrefetchMode) -> AdvisorConfig {
    AdvisorConfig::new()
        .profile_path(path)
        .mode(mode)
        .on_device_error(DeviceErrorPolicy::LogAndContinue)
}

/// Allocate `count` large tensors at distinct addresses starting at `base`
fn allocate_tensors(allocator: &ManualEventSource, base: u64, count: u64) {
    for i in 0..count {
        allocator.allocation_report(base + i * 0x100_0000, 2 * MB as i64, DeviceLocation::cuda(0));
    }
}

/// Schedule `{1: ([], [7]), 3: ([5], [])}`, tensor 7 at 0x1000 (2MB), region 5
/// at 0x2000 (4MB), three operations in tensor mode.
#[test]
fn test_e2e_tensor_mode_scenario() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = write_profile(
        &dir,
        "Op - name: aten::linear op_id: 1\n\
         TenAlloc 7:2097152\n\
         Op - name: aten::add op_id: 3\n\
         MemAlloc 5:4194304\n",
    );
    let runtime = RecordingRuntime::new();
    let mut operators = ManualEventSource::new("operators");
    let mut allocator = ManualEventSource::new("allocator");
    let mut sanitizer = ManualEventSource::new("sanitizer");

    let engine = bootstrap(
        &config(path, PrefetchMode::Tensor),
        runtime.clone(),
        &mut [&mut operators, &mut allocator, &mut sanitizer],
    )?;

    // Tensor ids 1..=6 elsewhere, then id 7 at 0x1000
    allocate_tensors(&allocator, 0x1000_0000, 6);
    allocator.allocation_report(0x1000, 2 * MB as i64, DeviceLocation::cuda(0));
    // Regions 1..=4 elsewhere, then id 5 at 0x2000
    for i in 0..4 {
        sanitizer.resource_event(ResourceEvent::uvm_alloc(0x9000_0000 + i * 0x1000, 64));
    }
    sanitizer.resource_event(ResourceEvent::uvm_alloc(0x2000, 4 * MB));

    assert_eq!(engine.tensor_id_at(0x1000), Some(7));
    assert_eq!(engine.resolve_region(5).map(|r| r.address), Some(0x2000));

    operators.operation("aten::linear");
    assert_eq!(
        runtime.requests(),
        vec![PrefetchRequest {
            address: 0x1000,
            size: 2 * MB,
            device: 0,
            stream: 0,
        }]
    );

    operators.operation("aten::relu");
    assert_eq!(runtime.request_count(), 1);

    operators.operation("aten::add");
    assert_eq!(runtime.request_count(), 1);
    assert_eq!(engine.op_id(), 3);

    Ok(())
}

#[test]
fn test_e2e_object_mode_scenario() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = write_profile(
        &dir,
        "Op - op_id: 1\nTenAlloc 1:\nMemAlloc 1: 2:\nOp - op_id: 2\nMemAlloc 2:\n",
    );
    let runtime = RecordingRuntime::new();
    let mut host = ManualEventSource::new("host");
    let engine = bootstrap(
        &config(path, PrefetchMode::Object),
        runtime.clone(),
        &mut [&mut host],
    )?;

    host.allocation_report(0x7000, 8 * MB as i64, DeviceLocation::cuda(0));
    host.resource_event(ResourceEvent::uvm_alloc(0x10_0000, 16 * MB));
    host.resource_event(ResourceEvent::uvm_alloc(0x20_0000, 32 * MB));

    host.operation("op1");
    host.operation("op2");

    let addresses: Vec<u64> = runtime.requests().iter().map(|r| r.address).collect();
    assert_eq!(addresses, vec![0x10_0000, 0x20_0000, 0x20_0000]);
    assert_eq!(runtime.stream_sequence(), vec![0, 1, 2]);
    assert_eq!(engine.dispatcher_cursor(), 0);
    Ok(())
}

#[test]
fn test_e2e_no_prefetch_mode() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = write_profile(&dir, "Op - op_id: 1\nTenAlloc 1:\nMemAlloc 1:\n");
    let runtime = RecordingRuntime::new();
    let mut host = ManualEventSource::new("host");
    let engine = bootstrap(
        &config(path, PrefetchMode::NoPrefetch),
        runtime.clone(),
        &mut [&mut host],
    )?;

    host.allocation_report(0x1000, 4 * MB as i64, DeviceLocation::cuda(0));
    host.resource_event(ResourceEvent::uvm_alloc(0x2000, 4 * MB));
    for _ in 0..4 {
        host.operation("op");
    }

    assert_eq!(runtime.request_count(), 0);
    assert_eq!(engine.stats().ops_observed, 4);
    Ok(())
}

#[test]
fn test_e2e_freed_tensor_not_prefetched() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = write_profile(&dir, "Op - op_id: 2\nTenAlloc 1: 2:\n");
    let runtime = RecordingRuntime::new();
    let mut host = ManualEventSource::new("host");
    let engine = bootstrap(
        &config(path, PrefetchMode::Tensor),
        runtime.clone(),
        &mut [&mut host],
    )?;

    host.allocation_report(0xA000, 2 * MB as i64, DeviceLocation::cuda(0));
    host.allocation_report(0xB000, 2 * MB as i64, DeviceLocation::cuda(0));
    host.operation("op1");
    host.allocation_report(0xA000, -(2 * MB as i64), DeviceLocation::cuda(0));
    host.operation("op2");

    assert_eq!(runtime.requests().len(), 1);
    assert_eq!(runtime.requests()[0].address, 0xB000);
    assert_eq!(engine.stats().unresolved_ids, 1);
    Ok(())
}

#[test]
fn test_e2e_small_allocations_untracked() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = write_profile(&dir, "Op - op_id: 1\nTenAlloc 1:\n");
    let runtime = RecordingRuntime::new();
    let mut host = ManualEventSource::new("host");
    let engine = bootstrap(
        &config(path, PrefetchMode::Tensor),
        runtime.clone(),
        &mut [&mut host],
    )?;

    host.allocation_report(0x1000, MB as i64, DeviceLocation::cuda(0));
    host.allocation_report(0x1000, -(MB as i64), DeviceLocation::cuda(0));
    host.allocation_report(0x5000, 4 * MB as i64, DeviceLocation::cpu());
    host.operation("op1");

    assert_eq!(engine.registry_stats().live_tensors, 0);
    assert_eq!(engine.registry_stats().last_tensor_id, 0);
    assert_eq!(runtime.request_count(), 0);
    Ok(())
}

#[test]
fn test_e2e_malformed_profile_never_prefetches() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = write_profile(&dir, "Op - op_id: 1\nTenAlloc 1:\nOp - op_id: x\n");
    let runtime = RecordingRuntime::new();
    let mut host = ManualEventSource::new("host");
    let engine = bootstrap(
        &config(path, PrefetchMode::Tensor),
        runtime.clone(),
        &mut [&mut host],
    )?;

    host.allocation_report(0x1000, 4 * MB as i64, DeviceLocation::cuda(0));
    host.operation("op1");

    assert_eq!(engine.effective_mode(), PrefetchMode::NoPrefetch);
    assert_eq!(runtime.request_count(), 0);
    // Allocation tracking continues regardless
    assert_eq!(engine.tensor_id_at(0x1000), Some(1));
    Ok(())
}

#[test]
fn test_e2e_concurrent_hosts_serialize() -> Result<()> {
    use std::sync::Arc;
    use uvm_advisor::{EventSink, OpContext, PrefetchEngine};

    let mut entries = Vec::new();
    for op in 1..=400u64 {
        entries.push((
            op,
            uvm_advisor::ScheduleEntry {
                region_ids: vec![],
                tensor_ids: vec![1],
            },
        ));
    }
    let runtime = RecordingRuntime::new();
    let engine = Arc::new(PrefetchEngine::new(
        &AdvisorConfig::new().num_streams(4),
        Some(ProfileSchedule::from_entries(entries)),
        runtime.clone(),
    )?);
    engine.on_allocation_report(0x1000, 2 * MB as i64, DeviceLocation::cuda(0));

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let engine = Arc::clone(&engine);
            std::thread::spawn(move || {
                for _ in 0..100 {
                    engine.on_operation_start(&OpContext::anonymous());
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().expect("worker thread");
    }

    assert_eq!(engine.op_id(), 400);
    assert_eq!(runtime.request_count(), 400);
    let mut per_stream = [0usize; 4];
    for slot in runtime.stream_sequence() {
        per_stream[slot] += 1;
    }
    assert_eq!(per_stream, [100, 100, 100, 100]);
    Ok(())
}
