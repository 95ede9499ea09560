//! Frame Cycle
//!
//! [`FrameCycle`] owns the four lifetime components and drives them once per
//! presented frame:
//!
//! ```text
//!  on_frame_begin()
//!    wait frame fence (frame F-N) ─► reset transient buffer of this slot
//!  [engine records + submits]
//!  on_frame_presented(dt)
//!    uploads.end_frame ─► signal frame fence ─► advance frame index
//!    ─► views.end_frame ─► deferred release cleanup ─► scratch pool cleanup
//!  shutdown()
//!    wait GPU idle ─► drain everything regardless of age
//! ```
//!
//! Allocation, upload and scratch-target calls take `&self` and may be made
//! from any number of recording threads. The frame hooks take `&mut self`, so
//! recording must have finished before a frame boundary is crossed.

use std::sync::Arc;

use log::{debug, error, info};

use crate::backend::{BufferDesc, GpuBackend, RenderTargetDesc};
use crate::errors::{LifecycleError, Result};
use crate::fence::Fence;
use crate::release::{DeferredReleaseQueue, OwnedResource, OwnedView, Reclaimable};
use crate::scratch_pool::{ScratchTarget, ScratchTargetDesc, ScratchTargetPool};
use crate::settings::LifecycleSettings;
use crate::upload::{StreamingUploader, TransientBuffers, UploadContext};
use crate::views::{HeapKind, TemporaryRange, ViewHandle, ViewHeaps};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FramePhase {
    Idle,
    Recording,
    ShutDown,
}

/// Identifies the frame currently being recorded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameToken {
    /// Frames presented before this one.
    pub frame_number: u64,
    /// Pipeline slot, `frame_number % N`.
    pub slot: usize,
}

pub struct FrameCycle {
    settings: LifecycleSettings,
    backend: Arc<dyn GpuBackend>,
    views: Arc<ViewHeaps>,
    uploader: StreamingUploader,
    transient: TransientBuffers,
    releases: Arc<DeferredReleaseQueue>,
    scratch: ScratchTargetPool,
    frame_fence: Arc<Fence>,
    /// Frame fence value signaled at the end of the last frame in each slot.
    slot_fence_values: Vec<u64>,
    frame_number: u64,
    phase: FramePhase,
}

impl FrameCycle {
    pub fn new(backend: Arc<dyn GpuBackend>, settings: LifecycleSettings) -> Result<Self> {
        settings.validate()?;
        let frames = settings.frames_in_flight;

        let views = Arc::new(ViewHeaps::new(&settings));
        let uploader = StreamingUploader::new(Arc::clone(&backend), &settings)?;
        let transient = TransientBuffers::new(Arc::clone(&backend), &settings)?;
        let frame_fence = Arc::new(Fence::new(Arc::clone(&backend))?);
        let releases = Arc::new(DeferredReleaseQueue::new(
            Arc::clone(&backend),
            Arc::clone(&views),
            Arc::clone(&frame_fence),
            frames,
        ));
        let scratch = ScratchTargetPool::new(
            Arc::clone(&backend),
            Arc::clone(&views),
            Arc::clone(&frame_fence),
            &settings,
        );

        info!(
            "Frame pipeline ready on '{}': {} frames in flight",
            backend.name(),
            frames
        );

        Ok(Self {
            slot_fence_values: vec![0; frames as usize],
            settings,
            backend,
            views,
            uploader,
            transient,
            releases,
            scratch,
            frame_fence,
            frame_number: 0,
            phase: FramePhase::Idle,
        })
    }

    // ── Accessors ──────────────────────────────────────────────────────────

    #[inline]
    #[must_use]
    pub fn settings(&self) -> &LifecycleSettings {
        &self.settings
    }

    #[inline]
    #[must_use]
    pub fn backend(&self) -> &Arc<dyn GpuBackend> {
        &self.backend
    }

    #[inline]
    #[must_use]
    pub fn views(&self) -> &ViewHeaps {
        &self.views
    }

    #[inline]
    #[must_use]
    pub fn uploader(&self) -> &StreamingUploader {
        &self.uploader
    }

    #[inline]
    #[must_use]
    pub fn transient(&self) -> &TransientBuffers {
        &self.transient
    }

    #[inline]
    #[must_use]
    pub fn releases(&self) -> &Arc<DeferredReleaseQueue> {
        &self.releases
    }

    #[inline]
    #[must_use]
    pub fn scratch_pool(&self) -> &ScratchTargetPool {
        &self.scratch
    }

    #[inline]
    #[must_use]
    pub fn frame_fence(&self) -> &Fence {
        &self.frame_fence
    }

    /// Frames presented so far.
    #[inline]
    #[must_use]
    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    #[inline]
    #[must_use]
    pub fn current_slot(&self) -> usize {
        (self.frame_number % u64::from(self.settings.frames_in_flight)) as usize
    }

    #[inline]
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.phase == FramePhase::ShutDown
    }

    fn ensure_running(&self) -> Result<()> {
        if self.phase == FramePhase::ShutDown {
            return Err(LifecycleError::ShutDown);
        }
        Ok(())
    }

    // ── Frame hooks ────────────────────────────────────────────────────────

    /// Starts a frame: waits until the GPU has finished the frame that last
    /// used this slot, then resets the slot's per-frame allocators.
    pub fn on_frame_begin(&mut self) -> Result<FrameToken> {
        match self.phase {
            FramePhase::ShutDown => return Err(LifecycleError::ShutDown),
            FramePhase::Recording => {
                return Err(LifecycleError::FrameOutOfOrder {
                    expected: "on_frame_presented",
                    actual: "on_frame_begin",
                });
            }
            FramePhase::Idle => {}
        }

        let slot = self.current_slot();
        let wait_value = self.slot_fence_values[slot];
        if wait_value > 0 {
            self.frame_fence.wait(wait_value)?;
        }
        self.transient.begin_frame(slot);
        self.phase = FramePhase::Recording;

        Ok(FrameToken {
            frame_number: self.frame_number,
            slot,
        })
    }

    /// Ends a presented frame and runs per-frame maintenance.
    pub fn on_frame_presented(&mut self, elapsed_seconds: f64) -> Result<()> {
        match self.phase {
            FramePhase::ShutDown => return Err(LifecycleError::ShutDown),
            FramePhase::Idle => {
                return Err(LifecycleError::FrameOutOfOrder {
                    expected: "on_frame_begin",
                    actual: "on_frame_presented",
                });
            }
            FramePhase::Recording => {}
        }

        self.uploader.end_frame()?;

        let slot = self.current_slot();
        self.slot_fence_values[slot] = self.frame_fence.signal()?;
        self.frame_number += 1;

        self.views.end_frame();
        let released = self.releases.cleanup()?;
        let evicted = self.scratch.cleanup(elapsed_seconds)?;
        self.phase = FramePhase::Idle;

        if released > 0 || evicted > 0 {
            debug!(
                "Frame {}: {released} deferred release(s), {evicted} scratch eviction(s)",
                self.frame_number
            );
        }
        Ok(())
    }

    /// Waits for the GPU to go idle and destroys everything still pending.
    ///
    /// Idempotent. Every later frame hook fails with
    /// [`LifecycleError::ShutDown`].
    pub fn shutdown(&mut self) -> Result<()> {
        if self.phase == FramePhase::ShutDown {
            return Ok(());
        }
        self.backend.wait_idle()?;
        self.frame_fence.wait_all()?;

        self.uploader.shutdown()?;
        self.transient.shutdown();
        let scratch = self.scratch.drain();
        let released = self.releases.close();
        self.views.end_frame();
        self.phase = FramePhase::ShutDown;

        info!(
            "Frame pipeline shut down after {} frames ({scratch} scratch targets, {released} deferred releases drained)",
            self.frame_number
        );
        Ok(())
    }

    // ── View handles ───────────────────────────────────────────────────────

    pub fn allocate_persistent_view(&self, heap: HeapKind) -> Result<ViewHandle> {
        self.views.allocate_persistent(heap)
    }

    /// Frees a slot immediately. Use [`allocate_owned_view`](Self::allocate_owned_view)
    /// for slots the GPU may still be reading.
    pub fn free_persistent_view(&self, heap: HeapKind, handle: ViewHandle) {
        self.views.free_persistent(heap, handle);
    }

    /// Allocates a slot whose release is deferred by N frames on drop.
    pub fn allocate_owned_view(&self, heap: HeapKind) -> Result<OwnedView> {
        let handle = self.views.allocate_persistent(heap)?;
        Ok(self.releases.adopt_view(heap, handle))
    }

    pub fn allocate_temporary_views(&self, heap: HeapKind, count: u32) -> Result<TemporaryRange> {
        self.views.allocate_temporary(heap, count)
    }

    // ── Uploads ────────────────────────────────────────────────────────────

    pub fn begin_upload(&self, size: u64) -> Result<UploadContext> {
        self.ensure_running()?;
        self.uploader.begin_upload(size)
    }

    pub fn end_upload(&self, ctx: UploadContext) -> Result<u64> {
        self.ensure_running()?;
        self.uploader.end_upload(ctx)
    }

    // ── Resources ──────────────────────────────────────────────────────────

    /// Creates a buffer whose destruction is deferred by N frames on drop.
    pub fn create_buffer(&self, desc: &BufferDesc) -> Result<OwnedResource> {
        self.ensure_running()?;
        let handle = self.backend.create_buffer(desc)?;
        Ok(self.releases.adopt(handle))
    }

    /// Creates a texture whose destruction is deferred by N frames on drop.
    pub fn create_render_target(&self, desc: &RenderTargetDesc) -> Result<OwnedResource> {
        self.ensure_running()?;
        let handle = self.backend.create_render_target(desc)?;
        Ok(self.releases.adopt(handle))
    }

    pub fn queue_deferred_release(&self, item: Reclaimable) {
        self.releases.release(item);
    }

    // ── Scratch targets ────────────────────────────────────────────────────

    pub fn acquire_scratch_target(&self, desc: &ScratchTargetDesc, clear_color: [f32; 4]) -> Result<ScratchTarget> {
        self.ensure_running()?;
        self.scratch.acquire(desc, clear_color, false)
    }

    /// Like [`acquire_scratch_target`](Self::acquire_scratch_target) but never
    /// returns the target released last, so a pass can read the previous
    /// result while writing a new one.
    pub fn acquire_distinct_scratch_target(
        &self,
        desc: &ScratchTargetDesc,
        clear_color: [f32; 4],
    ) -> Result<ScratchTarget> {
        self.ensure_running()?;
        self.scratch.acquire(desc, clear_color, true)
    }

    pub fn release_scratch_target(&self, target: &ScratchTarget, mark_as_most_recent: bool) {
        self.scratch.release(target, mark_as_most_recent);
    }
}

impl Drop for FrameCycle {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            error!("Frame pipeline shutdown on drop failed: {e}");
        }
    }
}
