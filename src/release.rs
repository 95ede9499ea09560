//! Deferred Release
//!
//! A GPU object retired on the CPU in frame F may still be referenced by a
//! command list executing while the CPU records frame F+N-1. Retired objects
//! are therefore parked here and only destroyed once both hold:
//!
//! - N frame boundaries have passed since the release, and
//! - the frame fence has reached the value that closes the frame the object
//!   was released in.
//!
//! ```text
//!   release(R) @F      cleanup @F     cleanup @F+1   cleanup @F+2
//!   tag = signaled+1   age 1     ──►  age 2     ──►  age 3 = N
//!                                                    └► destroyed once
//!                                                       fence >= tag
//! ```
//!
//! Callers rarely queue by hand: [`OwnedResource`] and [`OwnedView`] enqueue
//! themselves when dropped, so shared ownership through `Arc` gives the
//! N-frame delay without bookkeeping at every call site.
//!
//! After [`close`](DeferredReleaseQueue::close) the GPU is idle and no more
//! frames will age entries, so late releases are destroyed on the spot.

use std::sync::Arc;

use log::{debug, warn};
use parking_lot::Mutex;

use crate::backend::{GpuBackend, NativeHandle};
use crate::errors::Result;
use crate::fence::Fence;
use crate::views::{HeapKind, ViewHandle, ViewHeaps};

/// Something whose destruction must wait for the GPU.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Reclaimable {
    Native(NativeHandle),
    ViewSlot { heap: HeapKind, handle: ViewHandle },
}

#[derive(Debug)]
struct ReclaimableEntry {
    item: Reclaimable,
    age_in_frames: u32,
    /// Frame fence value after which no GPU work can reference `item`.
    fence_value: u64,
}

#[derive(Default)]
struct QueueState {
    entries: Vec<ReclaimableEntry>,
    closed: bool,
}

pub struct DeferredReleaseQueue {
    backend: Arc<dyn GpuBackend>,
    views: Arc<ViewHeaps>,
    frame_fence: Arc<Fence>,
    frames_in_flight: u32,
    state: Mutex<QueueState>,
}

impl DeferredReleaseQueue {
    /// `frame_fence` must be the fence signaled once at the end of every
    /// frame.
    #[must_use]
    pub fn new(
        backend: Arc<dyn GpuBackend>,
        views: Arc<ViewHeaps>,
        frame_fence: Arc<Fence>,
        frames_in_flight: u32,
    ) -> Self {
        Self {
            backend,
            views,
            frame_fence,
            frames_in_flight,
            state: Mutex::new(QueueState::default()),
        }
    }

    /// Parks `item` with an age of zero, tagged with the next frame fence
    /// value.
    pub fn release(&self, item: Reclaimable) {
        let mut state = self.state.lock();
        if state.closed {
            drop(state);
            warn!("Deferred release after shutdown: destroying {item:?} immediately");
            self.destroy(item);
            return;
        }
        // Everything submitted so far is covered by the next signal.
        let fence_value = self.frame_fence.last_signaled() + 1;
        state.entries.push(ReclaimableEntry {
            item,
            age_in_frames: 0,
            fence_value,
        });
    }

    pub fn release_native(&self, handle: NativeHandle) {
        self.release(Reclaimable::Native(handle));
    }

    pub fn release_view(&self, heap: HeapKind, handle: ViewHandle) {
        if handle.is_valid() {
            self.release(Reclaimable::ViewSlot { heap, handle });
        }
    }

    /// Wraps a native handle so that dropping the wrapper queues its release.
    #[must_use]
    pub fn adopt(self: &Arc<Self>, handle: NativeHandle) -> OwnedResource {
        OwnedResource {
            handle,
            queue: Arc::clone(self),
        }
    }

    /// Wraps a persistent view slot so that dropping the wrapper queues its
    /// release.
    #[must_use]
    pub fn adopt_view(self: &Arc<Self>, heap: HeapKind, handle: ViewHandle) -> OwnedView {
        OwnedView {
            heap,
            handle,
            queue: Arc::clone(self),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Ages every entry by one frame and destroys those that reached N and
    /// whose frame the GPU has finished.
    ///
    /// Called once per presented frame. Returns the number destroyed.
    pub fn cleanup(&self) -> Result<usize> {
        let completed = self.frame_fence.completed()?;
        let mut state = self.state.lock();
        let before = state.entries.len();
        state.entries.retain_mut(|entry| {
            entry.age_in_frames = entry.age_in_frames.saturating_add(1);
            if entry.age_in_frames >= self.frames_in_flight && completed >= entry.fence_value {
                self.destroy(entry.item);
                false
            } else {
                true
            }
        });
        let destroyed = before - state.entries.len();
        if destroyed > 0 {
            debug!(
                "Deferred release: destroyed {destroyed}, {} pending",
                state.entries.len()
            );
        }
        Ok(destroyed)
    }

    /// Destroys everything regardless of age. Only valid once the GPU is idle.
    pub fn drain(&self) -> usize {
        let drained: Vec<_> = self.state.lock().entries.drain(..).collect();
        for entry in &drained {
            self.destroy(entry.item);
        }
        debug!("Deferred release: drained {} entries", drained.len());
        drained.len()
    }

    /// Drains the queue and destroys every later release immediately.
    /// Only valid once the GPU is idle.
    pub fn close(&self) -> usize {
        self.state.lock().closed = true;
        self.drain()
    }

    fn destroy(&self, item: Reclaimable) {
        match item {
            Reclaimable::Native(handle) => self.backend.release(handle),
            Reclaimable::ViewSlot { heap, handle } => self.views.free_persistent(heap, handle),
        }
    }
}

// ─── Scoped Ownership ─────────────────────────────────────────────────────────

/// Unique owner of a GPU object. Share it with `Arc<OwnedResource>`.
#[derive(Debug)]
pub struct OwnedResource {
    handle: NativeHandle,
    queue: Arc<DeferredReleaseQueue>,
}

impl OwnedResource {
    #[inline]
    #[must_use]
    pub fn handle(&self) -> NativeHandle {
        self.handle
    }
}

impl Drop for OwnedResource {
    fn drop(&mut self) {
        self.queue.release_native(self.handle);
    }
}

/// Unique owner of a persistent view slot.
#[derive(Debug)]
pub struct OwnedView {
    heap: HeapKind,
    handle: ViewHandle,
    queue: Arc<DeferredReleaseQueue>,
}

impl OwnedView {
    #[inline]
    #[must_use]
    pub fn heap(&self) -> HeapKind {
        self.heap
    }

    #[inline]
    #[must_use]
    pub fn handle(&self) -> ViewHandle {
        self.handle
    }

    #[inline]
    #[must_use]
    pub fn index(&self) -> u32 {
        self.handle.index()
    }
}

impl Drop for OwnedView {
    fn drop(&mut self) {
        self.queue.release_view(self.heap, self.handle);
    }
}

impl std::fmt::Debug for DeferredReleaseQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferredReleaseQueue")
            .field("frames_in_flight", &self.frames_in_flight)
            .field("pending", &self.len())
            .finish_non_exhaustive()
    }
}
