//! Device runtime abstraction
//!
//! The advisor only needs two things from a GPU runtime: a way to create
//! independent non-blocking streams, and a fire-and-forget "migrate this
//! address range to a device" request on one of them.
//!
//! # Backends
//!
//! - [`RecordingRuntime`]: in-memory backend that records every request;
//!   used for dry runs and tests
//! - `CudaRuntime` (feature `cuda`): `cuMemPrefetchAsync` through cudarc

use crate::error::DeviceError;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Outbound interface to the device runtime
pub trait DeviceRuntime: Send + Sync {
    /// Opaque stream handle
    type Stream: Send;

    /// Create one non-blocking stream; `index` is its slot in the pool
    fn create_stream(&self, index: usize) -> Result<Self::Stream, DeviceError>;

    /// Issue an asynchronous migration of `[address, address + size)` to
    /// `device` on `stream`. Must not wait for the migration.
    fn prefetch_async(
        &self,
        address: u64,
        size: u64,
        device: i32,
        stream: &Self::Stream,
    ) -> Result<(), DeviceError>;

    /// Backend name for diagnostics
    fn name(&self) -> &str;
}

/// One request observed by [`RecordingRuntime`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PrefetchRequest {
    pub address: u64,
    pub size: u64,
    pub device: i32,
    /// Pool slot of the stream the request was issued on
    pub stream: usize,
}

/// Stream handle of [`RecordingRuntime`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordedStream {
    index: usize,
}

impl RecordedStream {
    pub fn index(&self) -> usize {
        self.index
    }
}

/// Runtime that records requests instead of talking to a device
///
/// Clones share the same request log, so a test can keep one handle while
/// the engine owns another.
#[derive(Debug, Clone, Default)]
pub struct RecordingRuntime {
    requests: Arc<Mutex<Vec<PrefetchRequest>>>,
    /// 1-based request number that fails; 0 disables injection
    fail_at: Arc<AtomicU64>,
    attempts: Arc<AtomicU64>,
    fail_stream_creation: bool,
}

impl RecordingRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the `n`-th prefetch attempt (1-based) fail
    pub fn fail_request(self, n: u64) -> Self {
        self.fail_at.store(n, Ordering::Relaxed);
        self
    }

    /// Make every stream creation fail
    pub fn fail_stream_creation(mut self) -> Self {
        self.fail_stream_creation = true;
        self
    }

    /// Requests accepted so far, in issuance order
    pub fn requests(&self) -> Vec<PrefetchRequest> {
        self.requests.lock().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    /// Stream slot of every accepted request, in issuance order
    pub fn stream_sequence(&self) -> Vec<usize> {
        self.requests.lock().iter().map(|r| r.stream).collect()
    }

    pub fn clear(&self) {
        self.requests.lock().clear();
    }
}

impl DeviceRuntime for RecordingRuntime {
    type Stream = RecordedStream;

    fn create_stream(&self, index: usize) -> Result<Self::Stream, DeviceError> {
        if self.fail_stream_creation {
            return Err(DeviceError::StreamCreation {
                index,
                reason: "stream creation disabled".to_string(),
            });
        }
        Ok(RecordedStream { index })
    }

    fn prefetch_async(
        &self,
        address: u64,
        size: u64,
        device: i32,
        stream: &Self::Stream,
    ) -> Result<(), DeviceError> {
        let attempt = self.attempts.fetch_add(1, Ordering::Relaxed) + 1;
        if attempt == self.fail_at.load(Ordering::Relaxed) {
            return Err(DeviceError::Prefetch {
                address,
                size,
                stream: stream.index,
                reason: "injected failure".to_string(),
            });
        }

        self.requests.lock().push(PrefetchRequest {
            address,
            size,
            device,
            stream: stream.index,
        });
        Ok(())
    }

    fn name(&self) -> &str {
        "recording"
    }
}

#[cfg(feature = "cuda")]
pub use cuda::CudaRuntime;

#[cfg(feature = "cuda")]
mod cuda {
    use super::DeviceRuntime;
    use crate::error::DeviceError;
    use cudarc::driver::sys::{cuMemPrefetchAsync, CUdeviceptr, CUresult};
    use cudarc::driver::{CudaContext, CudaStream};
    use std::sync::Arc;

    /// CUDA driver backend
    ///
    /// Streams are forked from a context on the target device and never
    /// synchronized by the advisor.
    pub struct CudaRuntime {
        ctx: Arc<CudaContext>,
        ordinal: usize,
    }

    impl CudaRuntime {
        pub fn new(ordinal: usize) -> Result<Self, DeviceError> {
            let ctx = CudaContext::new(ordinal).map_err(|e| {
                DeviceError::Unavailable(format!(
                    "Failed to create CUDA context for device {}: {:?}",
                    ordinal, e
                ))
            })?;
            tracing::info!(ordinal, "CUDA prefetch runtime initialized");
            Ok(Self { ctx, ordinal })
        }

        pub fn ordinal(&self) -> usize {
            self.ordinal
        }
    }

    impl DeviceRuntime for CudaRuntime {
        type Stream = Arc<CudaStream>;

        fn create_stream(&self, index: usize) -> Result<Self::Stream, DeviceError> {
            self.ctx
                .new_stream()
                .map_err(|e| DeviceError::StreamCreation {
                    index,
                    reason: format!("{:?}", e),
                })
        }

        fn prefetch_async(
            &self,
            address: u64,
            size: u64,
            device: i32,
            stream: &Self::Stream,
        ) -> Result<(), DeviceError> {
            let fail = |reason: String| DeviceError::Prefetch {
                address,
                size,
                stream: 0,
                reason,
            };
            let count = usize::try_from(size).map_err(|e| fail(e.to_string()))?;
            self.ctx
                .bind_to_thread()
                .map_err(|e| fail(format!("{:?}", e)))?;

            // SAFETY: the range comes from allocator events for managed memory;
            // a prefetch is only a migration hint and the driver validates it.
            let result = unsafe {
                cuMemPrefetchAsync(
                    address as CUdeviceptr,
                    count,
                    device,
                    stream.cu_stream(),
                )
            };
            if result != CUresult::CUDA_SUCCESS {
                return Err(fail(format!("cuMemPrefetchAsync returned {:?}", result)));
            }
            Ok(())
        }

        fn name(&self) -> &str {
            "cuda"
        }
    }
}
