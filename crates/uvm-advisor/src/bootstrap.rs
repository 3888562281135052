//! Process-start wiring
//!
//! Bootstrap runs once:
//!
//! 1. optional debugger hold (`DEBUG_FLAG`)
//! 2. startup diagnostic naming the prefetch mode
//! 3. profile log parse; a failure disables prefetching for the run
//! 4. stream pool creation
//! 5. subscription of the engine to every event source
//!
//! Nothing is subscribed until the engine is fully built, so no host event
//! can observe a half-initialised engine.

use crate::config::AdvisorConfig;
use crate::engine::PrefetchEngine;
use crate::hooks::{EventSink, EventSource};
use crate::runtime::DeviceRuntime;
use crate::schedule::ProfileSchedule;
use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

static DEBUG_HOLD: AtomicBool = AtomicBool::new(false);

const DEBUG_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Build the engine from `config` and subscribe it to `sources`
pub fn bootstrap<R>(
    config: &AdvisorConfig,
    runtime: R,
    sources: &mut [&mut dyn EventSource],
) -> Result<Arc<PrefetchEngine<R>>>
where
    R: DeviceRuntime + 'static,
{
    if config.debug_hold {
        wait_for_debugger();
    }

    tracing::info!("PREFETCH_MODE: {}", config.mode);

    let schedule = match ProfileSchedule::from_file(&config.profile_path) {
        Ok(schedule) => {
            tracing::debug!(
                path = %config.profile_path.display(),
                operations = schedule.len(),
                region_ids = schedule.total_region_ids(),
                tensor_ids = schedule.total_tensor_ids(),
                "profile schedule loaded"
            );
            Some(schedule)
        }
        Err(err) => {
            tracing::warn!(
                path = %config.profile_path.display(),
                error = %err,
                "profile schedule unusable; prefetching disabled for this run"
            );
            None
        }
    };

    let engine = PrefetchEngine::new(config, schedule, runtime)
        .context("failed to create prefetch stream pool")?;
    let engine = Arc::new(engine);

    for source in sources.iter_mut() {
        let sink: Arc<dyn EventSink> = engine.clone();
        source
            .subscribe(sink)
            .with_context(|| format!("failed to subscribe to event source `{}`", source.name()))?;
        tracing::debug!(source = source.name(), "event source subscribed");
    }

    Ok(engine)
}

/// [`bootstrap`] with configuration read from the process environment
///
/// An invalid environment value is reported and the defaults are used.
pub fn bootstrap_from_env<R>(
    runtime: R,
    sources: &mut [&mut dyn EventSource],
) -> Result<Arc<PrefetchEngine<R>>>
where
    R: DeviceRuntime + 'static,
{
    let config = AdvisorConfig::from_env().unwrap_or_else(|err| {
        tracing::warn!(error = %err, "invalid advisor configuration; using defaults");
        AdvisorConfig::default()
    });
    bootstrap(&config, runtime, sources)
}

/// Diagnostic hold for attaching a debugger
///
/// Parks the calling thread until [`release_debug_hold`] runs, either from
/// another thread or by a debugger calling it directly.
pub fn wait_for_debugger() {
    DEBUG_HOLD.store(true, Ordering::SeqCst);
    tracing::warn!(
        pid = std::process::id(),
        "DEBUG_FLAG set: bootstrap held until release_debug_hold() is called"
    );
    while DEBUG_HOLD.load(Ordering::SeqCst) {
        std::thread::sleep(DEBUG_POLL_INTERVAL);
    }
    tracing::info!("debug hold released");
}

pub fn release_debug_hold() {
    DEBUG_HOLD.store(false, Ordering::SeqCst);
}
