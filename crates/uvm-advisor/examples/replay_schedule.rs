//! Replay a synthetic training step against a profile schedule
//!
//! Builds a small profile log, bootstraps the advisor on the recording
//! runtime, then plays allocator and operator events the way a host would.
//!
//! Run with: cargo run --example replay_schedule
//! Pass a path to replay against an existing profile log instead:
//!   cargo run --example replay_schedule -- uvm_advisor_opt.log

use uvm_advisor::prelude::*;

const MB: u64 = 1024 * 1024;

const DEMO_PROFILE: &str = "\
Op - name: aten::embedding op_id: 1
TenAlloc 1:33554432 2:8388608
Op - name: aten::linear op_id: 2
TenAlloc 3:16777216
MemAlloc 1:67108864
Op - name: aten::gelu op_id: 4
TenAlloc 2:8388608 4:16777216
";

fn main() -> anyhow::Result<()> {
    uvm_advisor::init_tracing(uvm_advisor::TracingConfig::default())?;

    println!("=== UVM Prefetch Replay ===\n");

    let dir = tempfile::tempdir()?;
    let profile_path = match std::env::args().nth(1) {
        Some(path) => std::path::PathBuf::from(path),
        None => {
            let path = dir.path().join("uvm_advisor_opt.log");
            std::fs::write(&path, DEMO_PROFILE)?;
            path
        }
    };

    let config = AdvisorConfig::new()
        .profile_path(&profile_path)
        .mode(PrefetchMode::Tensor)
        .on_device_error(DeviceErrorPolicy::LogAndContinue);
    println!("1. Profile: {}", profile_path.display());
    println!("   Mode: {}, streams: {}\n", config.mode, config.num_streams);

    let runtime = RecordingRuntime::new();
    let mut operators = ManualEventSource::new("operators");
    let mut allocator = ManualEventSource::new("allocator");
    let mut sanitizer = ManualEventSource::new("sanitizer");
    let engine = bootstrap(
        &config,
        runtime.clone(),
        &mut [&mut operators, &mut allocator, &mut sanitizer],
    )?;

    println!("2. Allocating...");
    sanitizer.resource_event(ResourceEvent::uvm_alloc(0x7f00_0000_0000, 64 * MB));
    let tensors = [(0x7f00_0000_0000u64, 32 * MB), (0x7f00_0200_0000, 8 * MB)];
    for (address, size) in tensors {
        allocator.allocation_report(address, size as i64, DeviceLocation::cuda(0));
    }
    // Below the tracking threshold
    allocator.allocation_report(0x7f00_0300_0000, 4096, DeviceLocation::cuda(0));
    allocator.allocation_report(0x7f00_0400_0000, 16 * MB as i64, DeviceLocation::cuda(0));
    allocator.allocation_report(0x7f00_0500_0000, 16 * MB as i64, DeviceLocation::cuda(0));
    println!("   {:?}\n", engine.registry_stats());

    println!("3. Running operators...");
    for name in ["aten::embedding", "aten::linear", "aten::relu", "aten::gelu"] {
        let before = runtime.request_count();
        let handle = operators.operation(name);
        let op_id = handle.map(|h| h.op_id()).unwrap_or_default();
        println!(
            "   op {:>2} {:<16} prefetches: {}",
            op_id,
            name,
            runtime.request_count() - before
        );
    }

    println!("\n4. Requests issued:");
    for request in runtime.requests() {
        println!(
            "   stream {} <- {:#x} ({} MB)",
            request.stream,
            request.address,
            request.size / MB
        );
    }

    let stats = engine.stats();
    println!("\n5. Stats:");
    println!("   {}", stats_json(&stats));
    println!("   resolve rate: {:.2}", stats.resolve_rate());

    Ok(())
}

fn stats_json(stats: &uvm_advisor::EngineStatsSnapshot) -> String {
    serde_json::to_string(stats).unwrap_or_else(|_| format!("{:?}", stats))
}
