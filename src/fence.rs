//! Monotonic Fence
//!
//! Thin wrapper over a backend fence that owns the value counter and checks
//! that completion never goes backwards. A completed value lower than one
//! already observed means the device state is no longer trustworthy and is
//! reported as [`LifecycleError::FenceRegressed`].

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use log::error;

use crate::backend::{FenceId, GpuBackend};
use crate::errors::{LifecycleError, Result};

pub struct Fence {
    backend: Arc<dyn GpuBackend>,
    id: FenceId,
    last_signaled: AtomicU64,
    last_completed: AtomicU64,
}

impl Fence {
    pub fn new(backend: Arc<dyn GpuBackend>) -> Result<Self> {
        let id = backend.create_fence()?;
        Ok(Self {
            backend,
            id,
            last_signaled: AtomicU64::new(0),
            last_completed: AtomicU64::new(0),
        })
    }

    #[inline]
    #[must_use]
    pub fn id(&self) -> FenceId {
        self.id
    }

    /// The most recent value handed to the queue.
    #[inline]
    #[must_use]
    pub fn last_signaled(&self) -> u64 {
        self.last_signaled.load(Ordering::Acquire)
    }

    /// Queues a signal with the next value and returns it.
    ///
    /// Callers must hold whatever lock serializes access to the queue, so
    /// that values reach the queue in increasing order.
    pub fn signal(&self) -> Result<u64> {
        let value = self.last_signaled.fetch_add(1, Ordering::AcqRel) + 1;
        self.backend.signal(self.id, value)?;
        Ok(value)
    }

    /// Reads the completed value, rejecting regressions.
    pub fn completed(&self) -> Result<u64> {
        let observed = self.backend.completed_value(self.id)?;
        let previous = self.last_completed.fetch_max(observed, Ordering::AcqRel);
        if observed < previous {
            error!(
                "Fence {} regressed from {} to {}",
                self.id.raw(),
                previous,
                observed
            );
            return Err(LifecycleError::FenceRegressed { previous, observed });
        }
        Ok(observed)
    }

    #[inline]
    pub fn is_complete(&self, value: u64) -> Result<bool> {
        // Cheap path: already seen.
        if self.last_completed.load(Ordering::Acquire) >= value {
            return Ok(true);
        }
        Ok(self.completed()? >= value)
    }

    /// Blocks until the GPU reaches `value`. There is no timeout: a GPU that
    /// never gets there is a lost device.
    pub fn wait(&self, value: u64) -> Result<()> {
        if self.is_complete(value)? {
            return Ok(());
        }
        self.backend.wait_for(self.id, value).inspect_err(|e| {
            error!("Wait on fence {} for {} failed: {e}", self.id.raw(), value);
        })?;
        self.completed()?;
        Ok(())
    }

    /// Makes subsequent queue work wait until `value` is reached.
    pub fn queue_wait(&self, value: u64) -> Result<()> {
        self.backend.queue_wait(self.id, value)
    }

    /// Waits for the most recently signaled value.
    pub fn wait_all(&self) -> Result<()> {
        self.wait(self.last_signaled())
    }
}
