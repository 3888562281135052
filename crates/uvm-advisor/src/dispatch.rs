//! Round-robin prefetch dispatcher
//!
//! A fixed pool of non-blocking streams, created once. Each request goes to
//! the stream under the cursor and the cursor then moves on by one, so `k`
//! requests land on streams `0, 1, .., N-1, 0, 1, ..`.
//!
//! Requests on one stream run in issue order. Requests on different streams
//! are unordered with respect to each other.

use crate::error::{AdvisorError, DeviceError, Result};
use crate::runtime::DeviceRuntime;

/// Fixed-size pool of prefetch streams with a round-robin cursor
pub struct StreamPool<R: DeviceRuntime> {
    runtime: R,
    streams: Vec<R::Stream>,
    cursor: usize,
    device: i32,
}

impl<R: DeviceRuntime> StreamPool<R> {
    /// Create `num_streams` streams on `runtime`, targeting `device`
    pub fn new(runtime: R, num_streams: usize, device: i32) -> Result<Self> {
        if num_streams == 0 {
            return Err(AdvisorError::NoStreams);
        }

        let streams = (0..num_streams)
            .map(|index| runtime.create_stream(index))
            .collect::<std::result::Result<Vec<_>, DeviceError>>()?;

        tracing::debug!(
            backend = runtime.name(),
            streams = num_streams,
            device,
            "prefetch stream pool created"
        );

        Ok(Self {
            runtime,
            streams,
            cursor: 0,
            device,
        })
    }

    /// Issue a migration of `[address, address + size)` on the next stream
    ///
    /// Returns the slot the request went to. The cursor advances whether or
    /// not the runtime accepted the request.
    pub fn prefetch_region(
        &mut self,
        address: u64,
        size: u64,
    ) -> std::result::Result<usize, DeviceError> {
        let slot = self.cursor;
        self.cursor = (self.cursor + 1) % self.streams.len();

        self.runtime
            .prefetch_async(address, size, self.device, &self.streams[slot])
            .map_err(|e| e.on_stream(slot))?;

        tracing::trace!(address, size, stream = slot, "prefetch issued");
        Ok(slot)
    }

    /// Slot the next request will use
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn num_streams(&self) -> usize {
        self.streams.len()
    }

    pub fn device(&self) -> i32 {
        self.device
    }

    pub fn runtime(&self) -> &R {
        &self.runtime
    }
}

impl<R: DeviceRuntime> std::fmt::Debug for StreamPool<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamPool")
            .field("backend", &self.runtime.name())
            .field("streams", &self.streams.len())
            .field("cursor", &self.cursor)
            .field("device", &self.device)
            .finish()
    }
}
