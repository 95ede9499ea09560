//! View Handle Allocator Tests
//!
//! Tests for:
//! - Persistent slots: uniqueness, capacity failure, free-list reuse
//! - Temporary slots: increasing ranges, per-frame reset, concurrent bumps
//! - Descriptor tables: persistent mirroring, temporary current-table writes
//! - Debug-only misuse detection

use std::collections::HashSet;

use frame_pipeline::backend::NativeHandle;
use frame_pipeline::settings::{LifecycleSettings, ViewHeapSettings};
use frame_pipeline::views::{HeapKind, ViewDescriptor, ViewHandle, ViewHandleAllocator, ViewHeaps};
use frame_pipeline::LifecycleError;

fn allocator(persistent: u32, temporary: u32, tables: usize) -> ViewHandleAllocator {
    ViewHandleAllocator::new(
        HeapKind::ShaderResource,
        &ViewHeapSettings::new(persistent, temporary, true),
        tables,
    )
}

fn descriptor(raw: u64) -> ViewDescriptor {
    ViewDescriptor::whole(NativeHandle::from_raw(raw), Some(wgpu::TextureFormat::Rgba8Unorm))
}

// ============================================================================
// Persistent Slots
// ============================================================================

#[test]
fn persistent_capacity_four_then_fifth_fails_and_freed_index_is_reused() {
    let heap = allocator(4, 0, 1);

    let handles: Vec<ViewHandle> = (0..4).map(|_| heap.allocate_persistent().unwrap()).collect();
    let indices: HashSet<u32> = handles.iter().map(|h| h.index()).collect();
    assert_eq!(indices, HashSet::from([0, 1, 2, 3]));

    let err = heap.allocate_persistent().unwrap_err();
    assert!(matches!(
        err,
        LifecycleError::CapacityExceeded {
            heap: HeapKind::ShaderResource,
            capacity: 4,
            ..
        }
    ));

    let one = handles.iter().copied().find(|h| h.index() == 1).unwrap();
    heap.free_persistent(one);
    assert_eq!(heap.allocate_persistent().unwrap().index(), 1);
}

#[test]
fn live_persistent_indices_are_unique() {
    let heap = allocator(64, 0, 1);
    let mut live: Vec<ViewHandle> = Vec::new();

    // Deterministic churn: allocate in bursts, free every third handle.
    for round in 0..50 {
        for _ in 0..(round % 5 + 1) {
            if live.len() < 64 {
                live.push(heap.allocate_persistent().unwrap());
            }
        }
        let mut i = 0;
        live.retain(|h| {
            i += 1;
            if i % 3 == 0 {
                heap.free_persistent(*h);
                false
            } else {
                true
            }
        });

        let unique: HashSet<u32> = live.iter().map(|h| h.index()).collect();
        assert_eq!(unique.len(), live.len(), "duplicate live index in round {round}");
        assert_eq!(heap.persistent_in_use() as usize, live.len());
    }
}

#[test]
fn freeing_invalid_sentinel_is_a_no_op() {
    let heap = allocator(2, 0, 1);
    heap.free_persistent(ViewHandle::INVALID);
    assert_eq!(heap.persistent_in_use(), 0);
    assert!(heap.allocate_persistent().is_ok());
}

#[test]
fn concurrent_persistent_allocation_never_duplicates() {
    let heap = &allocator(1024, 0, 1);
    let mut all = Vec::new();

    std::thread::scope(|s| {
        let workers: Vec<_> = (0..8)
            .map(|_| {
                s.spawn(move || {
                    (0..128)
                        .map(|_| heap.allocate_persistent().unwrap().index())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        for w in workers {
            all.extend(w.join().unwrap());
        }
    });

    let unique: HashSet<u32> = all.iter().copied().collect();
    assert_eq!(unique.len(), 1024);
    assert!(heap.allocate_persistent().is_err());
}

#[cfg(debug_assertions)]
#[test]
#[should_panic(expected = "double free")]
fn double_free_is_caught_in_debug_builds() {
    let heap = allocator(2, 0, 1);
    let h = heap.allocate_persistent().unwrap();
    heap.free_persistent(h);
    heap.free_persistent(h);
}

#[cfg(debug_assertions)]
#[test]
fn stale_handle_is_not_live_after_reuse() {
    let heap = allocator(1, 0, 1);
    let old = heap.allocate_persistent().unwrap();
    heap.free_persistent(old);
    let new = heap.allocate_persistent().unwrap();

    assert_eq!(old.index(), new.index());
    assert!(!heap.is_live(old));
    assert!(heap.is_live(new));
}

// ============================================================================
// Temporary Slots
// ============================================================================

#[test]
fn temporary_ranges_increase_without_overlap_and_reset_each_frame() {
    let heap = allocator(8, 32, 3);

    let a = heap.allocate_temporary(4).unwrap();
    let b = heap.allocate_temporary(10).unwrap();
    let c = heap.allocate_temporary(1).unwrap();
    assert_eq!((a.start, b.start, c.start), (0, 4, 14));
    assert!(a.start + a.count <= b.start);
    assert!(b.start + b.count <= c.start);

    // Temporary slots live after the persistent region.
    assert_eq!(a.table_index(0), 8);

    heap.end_frame();
    assert_eq!(heap.allocate_temporary(2).unwrap().start, 0);
}

#[test]
fn temporary_overflow_fails() {
    let heap = allocator(0, 16, 1);
    heap.allocate_temporary(10).unwrap();
    let err = heap.allocate_temporary(7).unwrap_err();
    assert!(matches!(
        err,
        LifecycleError::CapacityExceeded {
            requested: 7,
            capacity: 16,
            ..
        }
    ));
}

#[test]
fn concurrent_temporary_ranges_are_disjoint() {
    let heap = &allocator(0, 4096, 1);
    let mut ranges = Vec::new();

    std::thread::scope(|s| {
        let workers: Vec<_> = (1..=8)
            .map(|n| {
                s.spawn(move || {
                    (0..32)
                        .map(|_| heap.allocate_temporary(n).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        for w in workers {
            ranges.extend(w.join().unwrap());
        }
    });

    ranges.sort_by_key(|r| r.start);
    for pair in ranges.windows(2) {
        assert!(pair[0].start + pair[0].count <= pair[1].start);
    }
    assert_eq!(heap.temporary_in_use(), (1..=8u64).sum::<u64>() * 32);
}

// ============================================================================
// Descriptor Tables
// ============================================================================

#[test]
fn persistent_descriptor_is_visible_in_every_table() {
    let heap = allocator(4, 4, 3);
    heap.end_frame(); // write while table 1 is current
    let h = heap.allocate_persistent().unwrap();
    heap.write_persistent(h, descriptor(7));

    for table in 0..3 {
        assert_eq!(heap.descriptor(table, h.index()), Some(descriptor(7)));
    }
}

#[test]
fn temporary_descriptor_only_lands_in_current_table() {
    let heap = allocator(4, 4, 3);
    let range = heap.allocate_temporary(2).unwrap();
    heap.write_temporary(&range, 1, descriptor(9));

    let index = range.table_index(1);
    assert_eq!(heap.descriptor(0, index), Some(descriptor(9)));
    assert_eq!(heap.descriptor(1, index), None);
    assert_eq!(heap.descriptor(2, index), None);
}

#[test]
fn end_frame_rotates_tables_round_robin() {
    let heap = allocator(1, 1, 3);
    let seen: Vec<usize> = (0..6)
        .map(|_| {
            let t = heap.current_table();
            heap.end_frame();
            t
        })
        .collect();
    assert_eq!(seen, vec![0, 1, 2, 0, 1, 2]);
}

// ============================================================================
// Heap Set
// ============================================================================

#[test]
fn only_shader_visible_heaps_get_per_frame_tables() {
    let settings = LifecycleSettings::default();
    let heaps = ViewHeaps::new(&settings);

    assert_eq!(heaps.get(HeapKind::ShaderResource).table_count(), 3);
    assert_eq!(heaps.get(HeapKind::Sampler).table_count(), 3);
    assert_eq!(heaps.get(HeapKind::RenderTarget).table_count(), 1);
    assert_eq!(heaps.get(HeapKind::DepthStencil).table_count(), 1);
}

#[test]
fn heaps_are_independent() {
    let settings = LifecycleSettings {
        render_target_heap: ViewHeapSettings::new(1, 0, false),
        ..Default::default()
    };
    let heaps = ViewHeaps::new(&settings);

    heaps.allocate_persistent(HeapKind::RenderTarget).unwrap();
    assert!(heaps.allocate_persistent(HeapKind::RenderTarget).is_err());
    assert!(heaps.allocate_persistent(HeapKind::ShaderResource).is_ok());
}
