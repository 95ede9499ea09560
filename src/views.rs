//! View Handle Allocation
//!
//! Fixed-capacity tables of view slots, one table set per [`HeapKind`].
//!
//! # Layout
//!
//! ```text
//!  table (one per frame in flight when shader-visible, otherwise one)
//!  ┌──────────────────────────────┬──────────────────────┐
//!  │ persistent [0, P)            │ temporary [P, P + T) │
//!  │ free-list, explicit free     │ bump, reset per frame│
//!  └──────────────────────────────┴──────────────────────┘
//! ```
//!
//! - **Persistent** slots come from a free-list guarded by an exclusive lock.
//!   A freed index is the next one handed out.
//! - **Temporary** slots come from an atomic bump counter. They are never
//!   freed individually; [`ViewHandleAllocator::end_frame`] resets the counter
//!   and rotates to the next backing table.
//!
//! Descriptors written for persistent slots are mirrored into every backing
//! table, so a view created mid-frame is visible whichever table the GPU has
//! bound when it is read. Temporary descriptors go to the current table only.
//!
//! # Misuse Detection
//!
//! Double frees and stale handles are caller bugs. Debug builds track a
//! generation per persistent slot and assert on misuse; release builds carry
//! no checks.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use log::{error, info};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::backend::NativeHandle;
use crate::errors::{LifecycleError, Result};
use crate::settings::{LifecycleSettings, ViewHeapSettings};

// ─── Public Types ─────────────────────────────────────────────────────────────

/// The kinds of view heap the device exposes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub enum HeapKind {
    /// Constant, shader-resource and unordered-access views.
    ShaderResource,
    Sampler,
    RenderTarget,
    DepthStencil,
}

impl HeapKind {
    pub const ALL: [HeapKind; 4] = [
        HeapKind::ShaderResource,
        HeapKind::Sampler,
        HeapKind::RenderTarget,
        HeapKind::DepthStencil,
    ];

    #[inline]
    const fn index(self) -> usize {
        self as usize
    }
}

/// A persistent slot in a view table.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ViewHandle {
    index: u32,
    /// Always 0 in release builds.
    generation: u32,
}

impl ViewHandle {
    /// Sentinel; freeing it is a no-op.
    pub const INVALID: Self = Self {
        index: u32::MAX,
        generation: 0,
    };

    #[inline]
    #[must_use]
    pub fn index(self) -> u32 {
        self.index
    }

    #[inline]
    #[must_use]
    pub fn generation(self) -> u32 {
        self.generation
    }

    #[inline]
    #[must_use]
    pub fn is_valid(self) -> bool {
        self.index != u32::MAX
    }
}

/// A run of temporary slots valid until the end of the current frame.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct TemporaryRange {
    /// First slot, counted from the start of the temporary region.
    pub start: u32,
    pub count: u32,
    /// Where the temporary region begins in the table.
    base: u32,
}

impl TemporaryRange {
    /// Absolute table index of the `i`-th slot of this range.
    #[inline]
    #[must_use]
    pub fn table_index(&self, i: u32) -> u32 {
        debug_assert!(i < self.count, "slot {i} outside range of {}", self.count);
        self.base + self.start + i
    }
}

/// What a view slot points at.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ViewDescriptor {
    pub resource: NativeHandle,
    pub format: Option<wgpu::TextureFormat>,
    pub base_mip: u32,
    pub mip_count: u32,
}

impl ViewDescriptor {
    /// Whole-resource view.
    #[must_use]
    pub fn whole(resource: NativeHandle, format: Option<wgpu::TextureFormat>) -> Self {
        Self {
            resource,
            format,
            base_mip: 0,
            mip_count: 1,
        }
    }
}

// ─── Allocator ────────────────────────────────────────────────────────────────

struct PersistentSlots {
    free_list: Vec<u32>,
    allocated: u32,
    #[cfg(debug_assertions)]
    generations: Vec<u32>,
    #[cfg(debug_assertions)]
    live: Vec<bool>,
}

type ViewTable = RwLock<Vec<Option<ViewDescriptor>>>;

/// Issues and reclaims slot indices for one heap.
pub struct ViewHandleAllocator {
    kind: HeapKind,
    persistent_capacity: u32,
    temporary_capacity: u32,
    persistent: RwLock<PersistentSlots>,
    allocated_temporary: AtomicU64,
    tables: Vec<ViewTable>,
    current_table: AtomicUsize,
}

impl ViewHandleAllocator {
    /// Creates an allocator with `table_count` backing tables.
    #[must_use]
    pub fn new(kind: HeapKind, settings: &ViewHeapSettings, table_count: usize) -> Self {
        let capacity = settings.persistent_capacity;
        let table_count = table_count.max(1);
        let tables = (0..table_count)
            .map(|_| RwLock::new(vec![None; settings.table_len()]))
            .collect();

        info!(
            "{kind:?} view heap: {} persistent + {} temporary slots x {table_count} table(s)",
            capacity, settings.temporary_capacity
        );

        Self {
            kind,
            persistent_capacity: capacity,
            temporary_capacity: settings.temporary_capacity,
            persistent: RwLock::new(PersistentSlots {
                // Reversed so that the lowest index is handed out first.
                free_list: (0..capacity).rev().collect(),
                allocated: 0,
                #[cfg(debug_assertions)]
                generations: vec![0; capacity as usize],
                #[cfg(debug_assertions)]
                live: vec![false; capacity as usize],
            }),
            allocated_temporary: AtomicU64::new(0),
            tables,
            current_table: AtomicUsize::new(0),
        }
    }

    #[inline]
    #[must_use]
    pub fn kind(&self) -> HeapKind {
        self.kind
    }

    #[inline]
    #[must_use]
    pub fn persistent_capacity(&self) -> u32 {
        self.persistent_capacity
    }

    #[inline]
    #[must_use]
    pub fn temporary_capacity(&self) -> u32 {
        self.temporary_capacity
    }

    #[inline]
    #[must_use]
    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    /// Index of the backing table the CPU is writing this frame.
    #[inline]
    #[must_use]
    pub fn current_table(&self) -> usize {
        self.current_table.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn persistent_in_use(&self) -> u32 {
        self.persistent.read().allocated
    }

    #[must_use]
    pub fn temporary_in_use(&self) -> u64 {
        self.allocated_temporary.load(Ordering::Acquire)
    }

    // ── Persistent slots ───────────────────────────────────────────────────

    /// Takes a slot off the free-list.
    ///
    /// Exhaustion is a sizing defect and is reported as
    /// [`LifecycleError::CapacityExceeded`].
    pub fn allocate_persistent(&self) -> Result<ViewHandle> {
        let mut slots = self.persistent.write();
        let Some(index) = slots.free_list.pop() else {
            error!(
                "{:?} view heap exhausted ({} persistent slots)",
                self.kind, self.persistent_capacity
            );
            return Err(LifecycleError::CapacityExceeded {
                heap: self.kind,
                requested: 1,
                capacity: u64::from(self.persistent_capacity),
            });
        };
        slots.allocated += 1;
        debug_assert!(slots.allocated <= self.persistent_capacity);

        #[cfg(debug_assertions)]
        let generation = {
            slots.live[index as usize] = true;
            slots.generations[index as usize]
        };
        #[cfg(not(debug_assertions))]
        let generation = 0;

        Ok(ViewHandle { index, generation })
    }

    /// Returns a slot to the free-list. Freeing [`ViewHandle::INVALID`] is a
    /// no-op.
    pub fn free_persistent(&self, handle: ViewHandle) {
        if !handle.is_valid() {
            return;
        }
        let mut slots = self.persistent.write();

        #[cfg(debug_assertions)]
        {
            let i = handle.index as usize;
            debug_assert!(
                slots.live[i],
                "double free of {:?} view slot {}",
                self.kind, handle.index
            );
            debug_assert_eq!(
                slots.generations[i], handle.generation,
                "stale {:?} view handle freed",
                self.kind
            );
            slots.live[i] = false;
            slots.generations[i] = slots.generations[i].wrapping_add(1);
        }

        slots.free_list.push(handle.index);
        slots.allocated -= 1;
    }

    /// Whether `handle` still refers to a live slot. Always `true` in
    /// release builds for in-range handles.
    #[must_use]
    pub fn is_live(&self, handle: ViewHandle) -> bool {
        if !handle.is_valid() || handle.index >= self.persistent_capacity {
            return false;
        }
        #[cfg(debug_assertions)]
        {
            let slots = self.persistent.read();
            let i = handle.index as usize;
            slots.live[i] && slots.generations[i] == handle.generation
        }
        #[cfg(not(debug_assertions))]
        {
            true
        }
    }

    /// Writes a persistent descriptor into every backing table.
    pub fn write_persistent(&self, handle: ViewHandle, descriptor: ViewDescriptor) {
        debug_assert!(self.is_live(handle), "write through stale {:?} handle", self.kind);
        for table in &self.tables {
            table.write()[handle.index as usize] = Some(descriptor);
        }
    }

    // ── Temporary slots ────────────────────────────────────────────────────

    /// Reserves `count` consecutive slots for the rest of this frame.
    ///
    /// Lock-free; safe to call from any number of threads at once.
    pub fn allocate_temporary(&self, count: u32) -> Result<TemporaryRange> {
        let start = self
            .allocated_temporary
            .fetch_add(u64::from(count), Ordering::AcqRel);
        if start + u64::from(count) > u64::from(self.temporary_capacity) {
            error!(
                "{:?} temporary views exhausted: {} + {} > {}",
                self.kind, start, count, self.temporary_capacity
            );
            return Err(LifecycleError::CapacityExceeded {
                heap: self.kind,
                requested: u64::from(count),
                capacity: u64::from(self.temporary_capacity),
            });
        }
        Ok(TemporaryRange {
            start: start as u32,
            count,
            base: self.persistent_capacity,
        })
    }

    /// Writes a temporary descriptor into the current table only.
    pub fn write_temporary(&self, range: &TemporaryRange, i: u32, descriptor: ViewDescriptor) {
        let index = range.table_index(i) as usize;
        self.tables[self.current_table()].write()[index] = Some(descriptor);
    }

    // ── Reading ────────────────────────────────────────────────────────────

    /// Reads a slot from a backing table.
    #[must_use]
    pub fn descriptor(&self, table: usize, index: u32) -> Option<ViewDescriptor> {
        self.tables
            .get(table)?
            .read()
            .get(index as usize)
            .copied()
            .flatten()
    }

    #[must_use]
    pub fn persistent_descriptor(&self, handle: ViewHandle) -> Option<ViewDescriptor> {
        self.descriptor(self.current_table(), handle.index)
    }

    // ── Frame boundary ─────────────────────────────────────────────────────

    /// Releases every temporary slot and rotates to the next backing table.
    pub fn end_frame(&self) {
        self.allocated_temporary.store(0, Ordering::Release);
        let next = (self.current_table() + 1) % self.tables.len();
        self.current_table.store(next, Ordering::Release);
    }
}

// ─── Heap Set ─────────────────────────────────────────────────────────────────

/// One [`ViewHandleAllocator`] per [`HeapKind`].
pub struct ViewHeaps {
    heaps: [ViewHandleAllocator; 4],
}

impl ViewHeaps {
    #[must_use]
    pub fn new(settings: &LifecycleSettings) -> Self {
        let build = |kind: HeapKind| {
            let heap = settings.heap(kind);
            let tables = if heap.shader_visible {
                settings.frames_in_flight as usize
            } else {
                1
            };
            ViewHandleAllocator::new(kind, heap, tables)
        };
        Self {
            heaps: HeapKind::ALL.map(build),
        }
    }

    #[inline]
    #[must_use]
    pub fn get(&self, kind: HeapKind) -> &ViewHandleAllocator {
        &self.heaps[kind.index()]
    }

    pub fn allocate_persistent(&self, kind: HeapKind) -> Result<ViewHandle> {
        self.get(kind).allocate_persistent()
    }

    pub fn free_persistent(&self, kind: HeapKind, handle: ViewHandle) {
        self.get(kind).free_persistent(handle);
    }

    pub fn allocate_temporary(&self, kind: HeapKind, count: u32) -> Result<TemporaryRange> {
        self.get(kind).allocate_temporary(count)
    }

    pub fn end_frame(&self) {
        for heap in &self.heaps {
            heap.end_frame();
        }
    }
}
