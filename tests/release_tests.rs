//! Deferred Release Tests
//!
//! Tests for:
//! - N-frame delay before destruction
//! - Frame fence gating: nothing is destroyed while the GPU may still use it
//! - View slot reclamation through the queue
//! - Scoped owners (`OwnedResource`, `OwnedView`) enqueueing on drop
//! - Draining at shutdown and releases after close

use std::sync::Arc;

use frame_pipeline::backend::{BufferDesc, GpuBackend, NativeHandle};
use frame_pipeline::fence::Fence;
use frame_pipeline::views::ViewHeaps;
use frame_pipeline::{DeferredReleaseQueue, HeadlessBackend, HeapKind, LifecycleSettings, Reclaimable};

struct Fixture {
    backend: Arc<HeadlessBackend>,
    views: Arc<ViewHeaps>,
    frame_fence: Arc<Fence>,
    queue: Arc<DeferredReleaseQueue>,
}

fn fixture(frames_in_flight: u32) -> Fixture {
    let settings = LifecycleSettings {
        frames_in_flight,
        ..Default::default()
    };
    let backend = Arc::new(HeadlessBackend::new());
    let views = Arc::new(ViewHeaps::new(&settings));
    let frame_fence = Arc::new(Fence::new(backend.clone()).unwrap());
    let queue = Arc::new(DeferredReleaseQueue::new(
        backend.clone(),
        views.clone(),
        frame_fence.clone(),
        frames_in_flight,
    ));
    Fixture {
        backend,
        views,
        frame_fence,
        queue,
    }
}

/// Ends a frame whose GPU work finishes immediately, then runs cleanup.
fn end_frame(f: &Fixture) -> usize {
    f.frame_fence.signal().unwrap();
    f.backend.complete_all().unwrap();
    f.queue.cleanup().unwrap()
}

fn buffer(backend: &HeadlessBackend) -> NativeHandle {
    backend
        .create_buffer(&BufferDesc {
            label: "Retired",
            size: 16,
            usage: wgpu::BufferUsages::UNIFORM,
        })
        .unwrap()
}

// ============================================================================
// Frame Delay
// ============================================================================

#[test]
fn released_resource_survives_until_third_cleanup() {
    let f = fixture(3);
    let r = buffer(&f.backend);

    // Released while frame 10 is recorded; cleanups run at the ends of
    // frames 10, 11 and 12.
    f.queue.release_native(r);
    assert_eq!(end_frame(&f), 0);
    assert!(f.backend.is_live(r), "still live after 1 cleanup");
    assert_eq!(end_frame(&f), 0);
    assert!(f.backend.is_live(r), "still live after 2 cleanups");
    assert_eq!(end_frame(&f), 1);
    assert!(!f.backend.is_live(r));
    assert!(f.queue.is_empty());
}

#[test]
fn delay_follows_frames_in_flight() {
    let f = fixture(2);
    let r = buffer(&f.backend);
    f.queue.release_native(r);

    assert_eq!(end_frame(&f), 0);
    assert_eq!(end_frame(&f), 1);
    assert_eq!(f.backend.released(), vec![r]);
}

#[test]
fn entries_age_independently() {
    let f = fixture(3);
    let early = buffer(&f.backend);
    let late = buffer(&f.backend);

    f.queue.release_native(early);
    end_frame(&f);
    f.queue.release_native(late);
    assert_eq!(f.queue.len(), 2);

    end_frame(&f);
    assert_eq!(end_frame(&f), 1);
    assert!(!f.backend.is_live(early));
    assert!(f.backend.is_live(late));

    assert_eq!(end_frame(&f), 1);
    assert!(!f.backend.is_live(late));
}

#[test]
fn view_slot_returns_to_free_list_after_delay() {
    let f = fixture(3);
    let heap = f.views.get(HeapKind::ShaderResource);
    let handle = heap.allocate_persistent().unwrap();

    f.queue.release(Reclaimable::ViewSlot {
        heap: HeapKind::ShaderResource,
        handle,
    });
    end_frame(&f);
    end_frame(&f);
    assert_eq!(heap.persistent_in_use(), 1);

    end_frame(&f);
    assert_eq!(heap.persistent_in_use(), 0);
    assert_eq!(heap.allocate_persistent().unwrap().index(), handle.index());
}

#[test]
fn aged_entry_waits_for_gpu_to_finish_its_frame() {
    let f = fixture(3);
    let r = buffer(&f.backend);
    f.queue.release_native(r);

    // Frames are submitted but the GPU falls behind.
    for _ in 0..4 {
        f.frame_fence.signal().unwrap();
        assert_eq!(f.queue.cleanup().unwrap(), 0);
    }
    assert!(f.backend.is_live(r));

    f.backend.complete_next().unwrap();
    assert_eq!(f.queue.cleanup().unwrap(), 1);
    assert!(!f.backend.is_live(r));
}

#[test]
fn entry_released_after_signal_needs_the_next_one() {
    let f = fixture(1);
    let r = buffer(&f.backend);

    f.frame_fence.signal().unwrap();
    f.backend.complete_all().unwrap();
    f.queue.release_native(r);

    // Value 1 completed before the release, so it does not cover it.
    assert_eq!(f.queue.cleanup().unwrap(), 0);
    assert_eq!(end_frame(&f), 1);
}

#[test]
fn cleanup_reports_device_loss() {
    let f = fixture(3);
    f.queue.release_native(buffer(&f.backend));
    f.backend.lose_device();
    assert!(f.queue.cleanup().unwrap_err().is_device_loss());
    assert_eq!(f.queue.len(), 1);
}

// ============================================================================
// Scoped Owners
// ============================================================================

#[test]
fn dropping_last_owner_enqueues_release() {
    let f = fixture(3);
    let r = buffer(&f.backend);

    let owned = Arc::new(f.queue.adopt(r));
    let shared = Arc::clone(&owned);
    drop(owned);
    assert!(f.queue.is_empty(), "a holder remains");

    drop(shared);
    assert_eq!(f.queue.len(), 1);
    for _ in 0..3 {
        end_frame(&f);
    }
    assert!(!f.backend.is_live(r));
}

#[test]
fn owned_view_releases_slot_late() {
    let f = fixture(3);
    let handle = f.views.allocate_persistent(HeapKind::Sampler).unwrap();
    let view = f.queue.adopt_view(HeapKind::Sampler, handle);
    assert_eq!(view.index(), handle.index());

    drop(view);
    assert_eq!(f.views.get(HeapKind::Sampler).persistent_in_use(), 1);
    for _ in 0..3 {
        end_frame(&f);
    }
    assert_eq!(f.views.get(HeapKind::Sampler).persistent_in_use(), 0);
}

#[test]
fn invalid_view_is_never_enqueued() {
    let f = fixture(3);
    f.queue
        .release_view(HeapKind::ShaderResource, frame_pipeline::ViewHandle::INVALID);
    assert!(f.queue.is_empty());
}

// ============================================================================
// Drain
// ============================================================================

#[test]
fn drain_destroys_everything_regardless_of_age() {
    let f = fixture(3);
    let handles: Vec<_> = (0..4).map(|_| buffer(&f.backend)).collect();
    for h in &handles {
        f.queue.release_native(*h);
    }
    end_frame(&f);

    assert_eq!(f.queue.drain(), 4);
    assert!(f.queue.is_empty());
    assert_eq!(f.backend.live_count(), 0);
}

#[test]
fn release_after_close_is_immediate() {
    let f = fixture(3);
    let pending = buffer(&f.backend);
    f.queue.release_native(pending);

    assert_eq!(f.queue.close(), 1);
    assert!(f.queue.is_closed());

    let late = f.queue.adopt(buffer(&f.backend));
    let handle = late.handle();
    drop(late);
    assert!(f.queue.is_empty());
    assert!(!f.backend.is_live(handle));
    assert_eq!(f.backend.live_count(), 0);
}
