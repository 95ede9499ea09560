//! Streaming Uploads
//!
//! Moves CPU-authored data into GPU memory through a fixed-size circular
//! upload arena.
//!
//! # Flow
//!
//! ```text
//!  begin_upload(size) ──► reserve ring range ──► UploadContext
//!        │                    (may block on GPU)       │ write bytes
//!        │                                             │ record copies
//!        ▼                                             ▼
//!   Submission { fence: UNSET } ◄──────────── end_upload(ctx)
//!                                             submit copies + signal fence
//!                                             Submission { fence: v }
//!
//!  reclaim: oldest-first, stops at the first submission whose fence value
//!           has not completed (or was never set)
//! ```
//!
//! # Locking
//!
//! Two locks are involved. `state` guards the submission ring bookkeeping and
//! is only ever held briefly. `submit` serializes access to the hardware queue
//! so that copy batches and their fence signals reach the queue in the same
//! order as their values. `begin_upload` is the one call in the subsystem that
//! may block the calling thread: it sleeps on a condition variable, or on the
//! upload fence, until the ring has room.

mod ring;
mod transient;

pub use ring::{CircularUploadBuffer, RingAllocation};
pub use transient::{TransientAllocation, TransientBuffers};

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, error, info, warn};
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::backend::{BufferDesc, CopyCommand, CopyList, GpuBackend, NativeHandle, UploadBatch};
use crate::errors::{LifecycleError, Result};
use crate::fence::Fence;
use crate::settings::LifecycleSettings;

/// Rounds `value` up to `alignment`, or `None` if that overflows.
#[inline]
pub(crate) fn align_up(value: u64, alignment: u64) -> Option<u64> {
    debug_assert!(alignment.is_power_of_two());
    Some(value.checked_add(alignment - 1)? & !(alignment - 1))
}

// ─── Upload Context ───────────────────────────────────────────────────────────

/// An open upload: CPU staging for one ring range plus the copies that will
/// consume it.
///
/// Must be handed back to [`StreamingUploader::end_upload`]; an upload that is
/// never ended blocks reclamation of everything allocated after it.
#[must_use = "an upload that is never ended blocks ring reclamation"]
#[derive(Debug)]
pub struct UploadContext {
    submission: u64,
    arena: NativeHandle,
    offset: u64,
    data: Vec<u8>,
    copies: CopyList,
}

impl UploadContext {
    /// Identifies the submission record this upload will complete.
    #[inline]
    #[must_use]
    pub fn submission(&self) -> u64 {
        self.submission
    }

    /// The GPU arena the data lands in.
    #[inline]
    #[must_use]
    pub fn arena(&self) -> NativeHandle {
        self.arena
    }

    /// Byte offset of this upload inside the arena.
    #[inline]
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Reserved size, already rounded up to the upload alignment.
    #[inline]
    #[must_use]
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    #[inline]
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn write_bytes(&mut self, at: u64, bytes: &[u8]) {
        let start = at as usize;
        self.data[start..start + bytes.len()].copy_from_slice(bytes);
    }

    pub fn write_pod<T: bytemuck::Pod>(&mut self, at: u64, value: &T) {
        self.write_bytes(at, bytemuck::bytes_of(value));
    }

    pub fn write_slice<T: bytemuck::Pod>(&mut self, at: u64, values: &[T]) {
        self.write_bytes(at, bytemuck::cast_slice(values));
    }

    /// Records a copy of `size` bytes from `src_offset` in this upload into a
    /// buffer.
    pub fn copy_to_buffer(&mut self, dst: NativeHandle, dst_offset: u64, src_offset: u64, size: u64) {
        debug_assert!(src_offset + size <= self.size());
        self.copies.push(CopyCommand::Buffer {
            dst,
            dst_offset,
            src_offset,
            size,
        });
    }

    /// Records a copy of tightly described texel rows into a texture mip.
    pub fn copy_to_texture(
        &mut self,
        dst: NativeHandle,
        mip_level: u32,
        origin: wgpu::Origin3d,
        extent: wgpu::Extent3d,
        src_offset: u64,
        bytes_per_row: u32,
    ) {
        self.copies.push(CopyCommand::Texture {
            dst,
            mip_level,
            origin,
            extent,
            src_offset,
            bytes_per_row,
            rows_per_image: extent.height,
        });
    }

    #[must_use]
    pub fn copies(&self) -> &[CopyCommand] {
        &self.copies
    }
}

// ─── Submission Ring ──────────────────────────────────────────────────────────

#[derive(Debug)]
struct Submission {
    id: u64,
    allocation: RingAllocation,
    /// `None` until the upload is ended and its signal queued.
    fence_value: Option<u64>,
}

struct UploadState {
    ring: CircularUploadBuffer,
    submissions: VecDeque<Submission>,
    next_id: u64,
}

/// Point-in-time view of the uploader, for diagnostics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UploadStats {
    pub in_flight: usize,
    pub used_bytes: u64,
    pub capacity: u64,
    /// Number of `begin_upload` calls that had to wait for the GPU.
    pub stalls: u64,
    pub last_signaled: u64,
}

// ─── Uploader ─────────────────────────────────────────────────────────────────

pub struct StreamingUploader {
    backend: Arc<dyn GpuBackend>,
    arena: NativeHandle,
    alignment: u64,
    max_in_flight: usize,
    state: Mutex<UploadState>,
    /// Woken whenever a submission gets its fence value or ring space frees.
    progress: Condvar,
    /// Serializes hardware queue access.
    submit: Mutex<()>,
    fence: Fence,
    stalls: AtomicU64,
}

impl StreamingUploader {
    pub fn new(backend: Arc<dyn GpuBackend>, settings: &LifecycleSettings) -> Result<Self> {
        let capacity = settings.upload_ring_bytes;
        let arena = backend.create_buffer(&BufferDesc {
            label: "Streaming Upload Ring",
            size: capacity,
            usage: wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST,
        })?;
        let fence = Fence::new(Arc::clone(&backend))?;

        info!(
            "Streaming uploader: {} byte ring on '{}', alignment {}, {} submissions max",
            capacity,
            backend.name(),
            settings.upload_alignment,
            settings.max_in_flight_uploads
        );

        Ok(Self {
            backend,
            arena,
            alignment: settings.upload_alignment,
            max_in_flight: settings.max_in_flight_uploads as usize,
            state: Mutex::new(UploadState {
                ring: CircularUploadBuffer::new(capacity),
                submissions: VecDeque::with_capacity(settings.max_in_flight_uploads as usize),
                next_id: 0,
            }),
            progress: Condvar::new(),
            submit: Mutex::new(()),
            fence,
            stalls: AtomicU64::new(0),
        })
    }

    #[inline]
    #[must_use]
    pub fn arena(&self) -> NativeHandle {
        self.arena
    }

    #[inline]
    #[must_use]
    pub fn fence(&self) -> &Fence {
        &self.fence
    }

    #[must_use]
    pub fn stats(&self) -> UploadStats {
        let state = self.state.lock();
        UploadStats {
            in_flight: state.submissions.len(),
            used_bytes: state.ring.used(),
            capacity: state.ring.capacity(),
            stalls: self.stalls.load(Ordering::Relaxed),
            last_signaled: self.fence.last_signaled(),
        }
    }

    // ── Upload API ─────────────────────────────────────────────────────────

    /// Reserves `size` bytes (rounded up to the alignment) in the ring.
    ///
    /// Blocks while the ring is full until the oldest submissions complete.
    /// Requests larger than the whole ring fail with
    /// [`LifecycleError::UploadTooLarge`].
    pub fn begin_upload(&self, size: u64) -> Result<UploadContext> {
        let mut state = self.state.lock();
        let capacity = state.ring.capacity();
        let Some(aligned) = align_up(size.max(1), self.alignment).filter(|a| *a <= capacity) else {
            error!("Upload of {size} bytes exceeds the {capacity} byte ring");
            return Err(LifecycleError::UploadTooLarge {
                requested: size,
                capacity,
            });
        };

        let mut stalled = false;
        loop {
            if state.submissions.len() < self.max_in_flight
                && let Some(allocation) = state.ring.try_allocate(aligned)
            {
                let id = state.next_id;
                state.next_id += 1;
                state.submissions.push_back(Submission {
                    id,
                    allocation,
                    fence_value: None,
                });
                return Ok(UploadContext {
                    submission: id,
                    arena: self.arena,
                    offset: allocation.offset,
                    data: vec![0; aligned as usize],
                    copies: CopyList::new(),
                });
            }

            if self.reclaim_locked(&mut state)? > 0 {
                continue;
            }

            if !stalled {
                stalled = true;
                self.stalls.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Upload of {aligned} bytes stalled: {} of {capacity} bytes in flight",
                    state.ring.used()
                );
            }

            match state.submissions.front().map(|s| s.fence_value) {
                Some(Some(value)) => {
                    MutexGuard::unlocked(&mut state, || self.fence.wait(value))?;
                }
                // The oldest upload is still being recorded by someone.
                Some(None) => self.progress.wait(&mut state),
                None => {
                    return Err(LifecycleError::UploadTooLarge {
                        requested: size,
                        capacity,
                    });
                }
            }
        }
    }

    /// Submits the upload's copies and signals the upload fence.
    ///
    /// Returns the fence value that marks the data as resident.
    pub fn end_upload(&self, ctx: UploadContext) -> Result<u64> {
        let value = {
            let _queue = self.submit.lock();
            self.backend.submit_copies(&UploadBatch {
                arena: ctx.arena,
                offset: ctx.offset,
                data: &ctx.data,
                copies: &ctx.copies,
            })?;
            self.fence.signal()?
        };

        let mut state = self.state.lock();
        if let Some(submission) = state
            .submissions
            .iter_mut()
            .find(|s| s.id == ctx.submission)
        {
            submission.fence_value = Some(value);
        } else {
            warn!("end_upload for unknown submission {}", ctx.submission);
        }
        drop(state);
        self.progress.notify_all();
        Ok(value)
    }

    /// Convenience: uploads `bytes` and copies them to `dst` at `dst_offset`.
    pub fn upload_to_buffer(&self, dst: NativeHandle, dst_offset: u64, bytes: &[u8]) -> Result<u64> {
        let mut ctx = self.begin_upload(bytes.len() as u64)?;
        ctx.write_bytes(0, bytes);
        ctx.copy_to_buffer(dst, dst_offset, 0, bytes.len() as u64);
        self.end_upload(ctx)
    }

    /// Whether the upload that returned `value` has landed.
    pub fn is_complete(&self, value: u64) -> Result<bool> {
        self.fence.is_complete(value)
    }

    // ── Reclamation ────────────────────────────────────────────────────────

    /// Frees completed submissions without blocking. Returns how many.
    pub fn reclaim(&self) -> Result<usize> {
        let mut state = self.state.lock();
        self.reclaim_locked(&mut state)
    }

    fn reclaim_locked(&self, state: &mut UploadState) -> Result<usize> {
        let Some(Some(_)) = state.submissions.front().map(|s| s.fence_value) else {
            return Ok(0);
        };
        let completed = self.fence.completed()?;

        let mut reclaimed = 0;
        while let Some(front) = state.submissions.front() {
            match front.fence_value {
                Some(value) if value <= completed => {
                    if let Some(done) = state.submissions.pop_front() {
                        state.ring.release(&done.allocation);
                        reclaimed += 1;
                    }
                }
                // Strict FIFO: later submissions wait behind this one.
                _ => break,
            }
        }
        if reclaimed > 0 {
            self.progress.notify_all();
        }
        Ok(reclaimed)
    }

    // ── Frame boundary ─────────────────────────────────────────────────────

    /// Reclaims what it can, then makes later GPU work wait for every upload
    /// signaled so far.
    pub fn end_frame(&self) -> Result<()> {
        self.reclaim()?;
        let last = self.fence.last_signaled();
        if last > 0 {
            let _queue = self.submit.lock();
            self.fence.queue_wait(last)?;
        }
        Ok(())
    }

    /// Waits for every signaled upload, then forgets all submissions and
    /// destroys the arena.
    pub fn shutdown(&self) -> Result<()> {
        self.fence.wait_all()?;
        let mut state = self.state.lock();
        self.reclaim_locked(&mut state)?;
        if !state.submissions.is_empty() {
            warn!(
                "Dropping {} upload(s) that were never ended",
                state.submissions.len()
            );
            state.submissions.clear();
        }
        state.ring.reset();
        drop(state);
        self.progress.notify_all();
        self.backend.release(self.arena);
        debug!("Streaming uploader shut down");
        Ok(())
    }
}
