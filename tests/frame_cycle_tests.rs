//! Frame Cycle Tests
//!
//! Tests for:
//! - Frame hook ordering
//! - Waiting on the frame fence before a slot is reused
//! - Per-frame resets (transient buffers, temporary views)
//! - Deferred destruction driven by presents
//! - Shutdown

use std::sync::Arc;

use frame_pipeline::backend::BufferDesc;
use frame_pipeline::{
    FrameCycle, HeadlessBackend, HeapKind, LifecycleError, LifecycleSettings, ScratchTargetDesc,
};

fn settings() -> LifecycleSettings {
    LifecycleSettings {
        upload_ring_bytes: 64 * 1024,
        transient_buffer_bytes: 4096,
        ..Default::default()
    }
}

fn setup() -> (Arc<HeadlessBackend>, FrameCycle) {
    let _ = env_logger::builder().is_test(true).try_init();
    let backend = Arc::new(HeadlessBackend::new());
    let cycle = FrameCycle::new(backend.clone(), settings()).unwrap();
    (backend, cycle)
}

fn run_frame(cycle: &mut FrameCycle, elapsed: f64) {
    cycle.on_frame_begin().unwrap();
    cycle.on_frame_presented(elapsed).unwrap();
}

fn uniform(label: &'static str) -> BufferDesc {
    BufferDesc {
        label,
        size: 64,
        usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
    }
}

// ============================================================================
// Hook Ordering
// ============================================================================

#[test]
fn present_without_begin_is_rejected() {
    let (_backend, mut cycle) = setup();
    let err = cycle.on_frame_presented(0.016).unwrap_err();
    assert!(matches!(err, LifecycleError::FrameOutOfOrder { .. }));
}

#[test]
fn double_begin_is_rejected() {
    let (_backend, mut cycle) = setup();
    cycle.on_frame_begin().unwrap();
    let err = cycle.on_frame_begin().unwrap_err();
    assert!(matches!(
        err,
        LifecycleError::FrameOutOfOrder {
            expected: "on_frame_presented",
            ..
        }
    ));
}

#[test]
fn tokens_cycle_through_slots() {
    let (_backend, mut cycle) = setup();
    let mut slots = Vec::new();
    for frame in 0..5u64 {
        let token = cycle.on_frame_begin().unwrap();
        assert_eq!(token.frame_number, frame);
        slots.push(token.slot);
        cycle.on_frame_presented(0.016).unwrap();
    }
    assert_eq!(slots, vec![0, 1, 2, 0, 1]);
    assert_eq!(cycle.frame_number(), 5);
}

// ============================================================================
// Frame Fence
// ============================================================================

#[test]
fn slot_reuse_waits_for_gpu() {
    let (_backend, mut cycle) = setup();
    for _ in 0..3 {
        run_frame(&mut cycle, 0.016);
    }
    // Three frames queued on the GPU, none executed yet.
    assert_eq!(cycle.frame_fence().last_signaled(), 3);
    assert_eq!(cycle.frame_fence().completed().unwrap(), 0);

    // Frame 3 reuses slot 0, so frame 0 must be done.
    cycle.on_frame_begin().unwrap();
    assert!(cycle.frame_fence().completed().unwrap() >= 1);
}

#[test]
fn first_frames_do_not_wait() {
    let (backend, mut cycle) = setup();
    for _ in 0..3 {
        cycle.on_frame_begin().unwrap();
        cycle.on_frame_presented(0.016).unwrap();
    }
    assert!(backend.pending_ops() >= 3, "nothing should have executed yet");
}

// ============================================================================
// Per-frame Resets
// ============================================================================

#[test]
fn transient_buffer_resets_when_slot_returns() {
    let (_backend, mut cycle) = setup();
    cycle.on_frame_begin().unwrap();
    let first = cycle.transient().push(&[1u32; 4]).unwrap();
    assert_eq!(first.frame_slot, 0);
    assert!(cycle.transient().used() > 0);
    cycle.on_frame_presented(0.016).unwrap();

    run_frame(&mut cycle, 0.016);
    run_frame(&mut cycle, 0.016);

    cycle.on_frame_begin().unwrap();
    assert_eq!(cycle.transient().current_slot(), 0);
    assert_eq!(cycle.transient().used(), 0);
    let again = cycle.transient().allocate(16).unwrap();
    assert_eq!((again.buffer, again.offset), (first.buffer, 0));
}

#[test]
fn temporary_views_reset_every_frame() {
    let (_backend, mut cycle) = setup();
    cycle.on_frame_begin().unwrap();
    cycle.allocate_temporary_views(HeapKind::ShaderResource, 8).unwrap();
    let second = cycle.allocate_temporary_views(HeapKind::ShaderResource, 8).unwrap();
    assert_eq!(second.start, 8);
    cycle.on_frame_presented(0.016).unwrap();

    cycle.on_frame_begin().unwrap();
    let next = cycle.allocate_temporary_views(HeapKind::ShaderResource, 8).unwrap();
    assert_eq!(next.start, 0);
}

// ============================================================================
// Deferred Destruction
// ============================================================================

#[test]
fn dropped_resource_outlives_gpu_frames() {
    let (backend, mut cycle) = setup();
    let resource = cycle.create_buffer(&uniform("Per-Object")).unwrap();
    let handle = resource.handle();

    cycle.on_frame_begin().unwrap();
    drop(resource);
    cycle.on_frame_presented(0.016).unwrap();
    assert!(backend.is_live(handle));

    run_frame(&mut cycle, 0.016);
    assert!(backend.is_live(handle));

    // Three boundaries have passed, but frame 0 has not finished on the GPU.
    run_frame(&mut cycle, 0.016);
    assert_eq!(cycle.frame_fence().completed().unwrap(), 0);
    assert!(backend.is_live(handle));

    // Frame 3 waits for frame 0, after which the buffer can go.
    run_frame(&mut cycle, 0.016);
    assert!(!backend.is_live(handle));
}

#[test]
fn buffer_written_by_in_flight_upload_survives_until_copy_runs() {
    let (backend, mut cycle) = setup();
    let dst = cycle.create_buffer(&uniform("Streamed")).unwrap();
    let handle = dst.handle();

    cycle.on_frame_begin().unwrap();
    let mut ctx = cycle.begin_upload(16).unwrap();
    ctx.write_slice(0, &[1u32, 2, 3, 4]);
    ctx.copy_to_buffer(handle, 0, 0, 16);
    cycle.end_upload(ctx).unwrap();
    drop(dst);
    cycle.on_frame_presented(0.016).unwrap();

    // N + 1 frames: the copy from frame 0 must find its destination alive.
    for _ in 0..4 {
        run_frame(&mut cycle, 0.016);
    }
    assert!(!backend.is_live(handle));
    assert!(cycle.releases().is_empty());
}

#[test]
fn owned_view_slot_is_reused_only_after_delay() {
    let (_backend, mut cycle) = setup();
    let view = cycle.allocate_owned_view(HeapKind::ShaderResource).unwrap();
    let index = view.index();

    cycle.on_frame_begin().unwrap();
    drop(view);
    assert_ne!(
        cycle.allocate_persistent_view(HeapKind::ShaderResource).unwrap().index(),
        index
    );
    cycle.on_frame_presented(0.016).unwrap();
    for _ in 0..3 {
        run_frame(&mut cycle, 0.016);
    }

    assert_eq!(
        cycle.allocate_persistent_view(HeapKind::ShaderResource).unwrap().index(),
        index
    );
}

#[test]
fn scratch_targets_are_evicted_through_presents() {
    let (backend, mut cycle) = setup();
    let desc = ScratchTargetDesc::new_2d("Bloom", 128, 128, wgpu::TextureFormat::Rgba16Float);

    cycle.on_frame_begin().unwrap();
    let target = cycle.acquire_scratch_target(&desc, [0.0; 4]).unwrap();
    let other = cycle.acquire_distinct_scratch_target(&desc, [0.0; 4]).unwrap();
    assert_ne!(target.resource, other.resource);
    cycle.release_scratch_target(&target, true);
    cycle.release_scratch_target(&other, false);
    cycle.on_frame_presented(0.016).unwrap();

    run_frame(&mut cycle, 15.0);
    assert_eq!(cycle.scratch_pool().len(), 2);
    // Old enough, but frame 0 has not retired on the GPU yet.
    run_frame(&mut cycle, 31.0);
    assert_eq!(cycle.scratch_pool().len(), 2);
    // Beginning frame 3 waits for frame 0's fence.
    run_frame(&mut cycle, 31.0);
    assert!(cycle.scratch_pool().is_empty());
    assert!(!backend.is_live(target.resource));
}

// ============================================================================
// Uploads Through The Cycle
// ============================================================================

#[test]
fn upload_is_visible_once_frame_fence_passes() {
    let (backend, mut cycle) = setup();
    let dst = cycle.create_buffer(&uniform("Upload Target")).unwrap();

    cycle.on_frame_begin().unwrap();
    let mut ctx = cycle.begin_upload(16).unwrap();
    ctx.write_slice(0, &[7u32, 8, 9, 10]);
    ctx.copy_to_buffer(dst.handle(), 0, 0, 16);
    cycle.end_upload(ctx).unwrap();
    cycle.on_frame_presented(0.016).unwrap();

    // The frame waits on the upload, so finishing the frame implies the data.
    let frame_value = cycle.frame_fence().last_signaled();
    cycle.frame_fence().wait(frame_value).unwrap();
    let bytes = backend.read_buffer(dst.handle()).unwrap();
    assert_eq!(&bytes[..16], bytemuck::cast_slice::<u32, u8>(&[7, 8, 9, 10]));
    assert_eq!(
        backend.queue_waits(),
        vec![(cycle.uploader().fence().id(), 1)]
    );
}

// ============================================================================
// Shutdown
// ============================================================================

#[test]
fn shutdown_drains_everything() {
    let (backend, mut cycle) = setup();
    let kept = cycle.create_buffer(&uniform("Kept")).unwrap();
    let desc = ScratchTargetDesc::new_2d("Scratch", 32, 32, wgpu::TextureFormat::Rgba8Unorm);

    cycle.on_frame_begin().unwrap();
    let scratch = cycle.acquire_scratch_target(&desc, [0.0; 4]).unwrap();
    cycle.release_scratch_target(&scratch, false);
    let ctx = cycle.begin_upload(32).unwrap();
    cycle.end_upload(ctx).unwrap();
    drop(kept);
    cycle.on_frame_presented(0.016).unwrap();

    cycle.shutdown().unwrap();
    assert!(cycle.is_shut_down());
    assert_eq!(backend.live_count(), 0);
    assert_eq!(backend.pending_ops(), 0);
    assert!(cycle.releases().is_empty());
}

#[test]
fn resource_dropped_after_shutdown_is_destroyed_immediately() {
    let (backend, mut cycle) = setup();
    let late = cycle.create_buffer(&uniform("Late")).unwrap();
    let handle = late.handle();

    cycle.shutdown().unwrap();
    assert!(backend.is_live(handle));
    drop(late);
    assert!(!backend.is_live(handle));
    assert!(cycle.releases().is_empty());
}

#[test]
fn calls_after_shutdown_fail() {
    let (_backend, mut cycle) = setup();
    cycle.shutdown().unwrap();
    cycle.shutdown().unwrap();

    assert!(matches!(cycle.on_frame_begin(), Err(LifecycleError::ShutDown)));
    assert!(matches!(
        cycle.on_frame_presented(0.016),
        Err(LifecycleError::ShutDown)
    ));
    assert!(matches!(cycle.begin_upload(16), Err(LifecycleError::ShutDown)));
}

#[test]
fn creation_rejects_invalid_settings() {
    let backend = Arc::new(HeadlessBackend::new());
    let bad = LifecycleSettings {
        frames_in_flight: 0,
        ..settings()
    };
    assert!(matches!(
        FrameCycle::new(backend, bad),
        Err(LifecycleError::InvalidSettings(_))
    ));
}

#[test]
fn device_loss_surfaces_from_frame_begin() {
    let (backend, mut cycle) = setup();
    for _ in 0..3 {
        run_frame(&mut cycle, 0.016);
    }
    backend.lose_device();
    let err = cycle.on_frame_begin().unwrap_err();
    assert!(err.is_device_loss());
}
