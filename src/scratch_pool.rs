//! Scratch Render Target Pool
//!
//! Recycles intermediate color/depth targets across passes and frames.
//!
//! # Design
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                    ScratchTargetPool                         │
//! │                                                              │
//! │  entries:      SlotMap<ScratchTargetId, ScratchEntry>        │
//! │  by_signature: FxHashMap<ScratchSignature, [ScratchTargetId]>│
//! │                                                              │
//! │  acquire(desc, clear) → ScratchTarget   (in_use = true)      │
//! │  release(target)                        (in_use = false)     │
//! │  cleanup(dt)          age idle entries, evict after 30 s     │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Two requests with the same [`ScratchSignature`] are interchangeable. An
//! entry only starts accumulating idle time once it has been unused for N
//! frames and the frame fence has passed the frame it was released in, i.e.
//! once the GPU can no longer be reading it; eviction therefore destroys the
//! target directly instead of going through deferred release.

use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use slotmap::SlotMap;

use crate::backend::{GpuBackend, NativeHandle, RenderTargetDesc};
use crate::errors::Result;
use crate::fence::Fence;
use crate::settings::LifecycleSettings;
use crate::views::{HeapKind, ViewDescriptor, ViewHandle, ViewHeaps};

slotmap::new_key_type! {
    /// Identifies one physical target in the pool.
    pub struct ScratchTargetId;
}

// ─── Public Types ─────────────────────────────────────────────────────────────

/// Request for a scratch target.
#[derive(Clone, Debug)]
pub struct ScratchTargetDesc {
    pub label: &'static str,
    pub width: u32,
    pub height: u32,
    pub depth_or_array_layers: u32,
    pub mip_level_count: u32,
    pub sample_count: u32,
    pub dimension: wgpu::TextureDimension,
    pub format: wgpu::TextureFormat,
    pub usage: wgpu::TextureUsages,
}

impl ScratchTargetDesc {
    /// Single-sampled, single-mip 2D target.
    #[must_use]
    pub fn new_2d(label: &'static str, width: u32, height: u32, format: wgpu::TextureFormat) -> Self {
        Self {
            label,
            width,
            height,
            depth_or_array_layers: 1,
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::TEXTURE_BINDING,
        }
    }

    #[must_use]
    pub fn to_render_target(&self) -> RenderTargetDesc {
        RenderTargetDesc {
            label: self.label,
            size: wgpu::Extent3d {
                width: self.width,
                height: self.height,
                depth_or_array_layers: self.depth_or_array_layers,
            },
            mip_level_count: self.mip_level_count,
            sample_count: self.sample_count,
            dimension: self.dimension,
            format: self.format,
            usage: self.usage,
        }
    }
}

/// Structural identity of a scratch target. The clear color is quantized to
/// 8 bits per channel.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ScratchSignature {
    pub dimension: wgpu::TextureDimension,
    pub byte_size: u64,
    pub width: u32,
    pub height: u32,
    pub depth_or_array_layers: u32,
    pub mip_level_count: u32,
    pub format: wgpu::TextureFormat,
    pub sample_count: u32,
    pub usage: wgpu::TextureUsages,
    pub clear_color: [u8; 4],
}

impl ScratchSignature {
    #[must_use]
    pub fn new(desc: &ScratchTargetDesc, clear_color: [f32; 4]) -> Self {
        Self {
            dimension: desc.dimension,
            byte_size: desc.to_render_target().byte_size(),
            width: desc.width,
            height: desc.height,
            depth_or_array_layers: desc.depth_or_array_layers,
            mip_level_count: desc.mip_level_count,
            format: desc.format,
            sample_count: desc.sample_count,
            usage: desc.usage,
            clear_color: clear_color.map(quantize_channel),
        }
    }
}

fn quantize_channel(c: f32) -> u8 {
    (c.clamp(0.0, 1.0) * 255.0).round() as u8
}

/// A target handed out by [`ScratchTargetPool::acquire`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ScratchTarget {
    pub id: ScratchTargetId,
    pub resource: NativeHandle,
    pub view_heap: HeapKind,
    pub view: ViewHandle,
    pub signature: ScratchSignature,
}

// ─── Internal Types ───────────────────────────────────────────────────────────

struct ScratchEntry {
    target: ScratchTarget,
    in_use: bool,
    age_in_frames: u32,
    unused_seconds: f64,
    /// Frame fence value closing the frame of the last release.
    fence_value: u64,
}

#[derive(Default)]
struct PoolState {
    entries: SlotMap<ScratchTargetId, ScratchEntry>,
    by_signature: FxHashMap<ScratchSignature, Vec<ScratchTargetId>>,
    last_released: Option<ScratchTargetId>,
    /// Engine-wide "last thing rendered", for passes that chain implicitly.
    most_recent: Option<ScratchTarget>,
}

// ─── Pool Implementation ──────────────────────────────────────────────────────

pub struct ScratchTargetPool {
    backend: Arc<dyn GpuBackend>,
    views: Arc<ViewHeaps>,
    frame_fence: Arc<Fence>,
    frames_in_flight: u32,
    eviction_seconds: f64,
    state: Mutex<PoolState>,
}

impl ScratchTargetPool {
    #[must_use]
    pub fn new(
        backend: Arc<dyn GpuBackend>,
        views: Arc<ViewHeaps>,
        frame_fence: Arc<Fence>,
        settings: &LifecycleSettings,
    ) -> Self {
        Self {
            backend,
            views,
            frame_fence,
            frames_in_flight: settings.frames_in_flight,
            eviction_seconds: settings.scratch_eviction_seconds,
            state: Mutex::new(PoolState::default()),
        }
    }

    /// Hands out an idle target matching `desc` and `clear_color`, creating
    /// one if none is free.
    ///
    /// With `exclude_most_recently_released`, the entry released last is
    /// skipped so that a pass never reads and writes the same physical target.
    pub fn acquire(
        &self,
        desc: &ScratchTargetDesc,
        clear_color: [f32; 4],
        exclude_most_recently_released: bool,
    ) -> Result<ScratchTarget> {
        let signature = ScratchSignature::new(desc, clear_color);
        let mut state = self.state.lock();
        let excluded = if exclude_most_recently_released {
            state.last_released
        } else {
            None
        };

        let reusable = state.by_signature.get(&signature).and_then(|bucket| {
            bucket.iter().copied().find(|id| {
                Some(*id) != excluded && state.entries.get(*id).is_some_and(|e| !e.in_use)
            })
        });
        if let Some(id) = reusable
            && let Some(entry) = state.entries.get_mut(id)
        {
            entry.in_use = true;
            return Ok(entry.target);
        }

        let target = self.create_target(desc, signature)?;
        let id = state.entries.insert_with_key(|id| ScratchEntry {
            target: ScratchTarget { id, ..target },
            in_use: true,
            age_in_frames: 0,
            unused_seconds: 0.0,
            fence_value: 0,
        });
        state.by_signature.entry(signature).or_default().push(id);
        info!(
            "Scratch pool: created '{}' {}x{} {:?} ({} targets)",
            desc.label,
            desc.width,
            desc.height,
            desc.format,
            state.entries.len()
        );
        Ok(state.entries[id].target)
    }

    fn create_target(&self, desc: &ScratchTargetDesc, signature: ScratchSignature) -> Result<ScratchTarget> {
        let resource = self.backend.create_render_target(&desc.to_render_target())?;
        let view_heap = if desc.format.is_depth_stencil_format() {
            HeapKind::DepthStencil
        } else {
            HeapKind::RenderTarget
        };
        let view = match self.views.allocate_persistent(view_heap) {
            Ok(view) => view,
            Err(e) => {
                self.backend.release(resource);
                return Err(e);
            }
        };
        self.views.get(view_heap).write_persistent(
            view,
            ViewDescriptor {
                resource,
                format: Some(desc.format),
                base_mip: 0,
                mip_count: desc.mip_level_count,
            },
        );
        Ok(ScratchTarget {
            id: ScratchTargetId::default(),
            resource,
            view_heap,
            view,
            signature,
        })
    }

    /// Returns a target to the pool.
    ///
    /// With `mark_as_most_recent`, the target also becomes
    /// [`most_recent`](Self::most_recent).
    pub fn release(&self, target: &ScratchTarget, mark_as_most_recent: bool) {
        let fence_value = self.frame_fence.last_signaled() + 1;
        let mut state = self.state.lock();
        let Some(entry) = state.entries.get_mut(target.id) else {
            warn!("Scratch pool: release of unknown target {:?}", target.id);
            return;
        };
        entry.in_use = false;
        entry.age_in_frames = 0;
        entry.unused_seconds = 0.0;
        entry.fence_value = fence_value;
        let released = entry.target;
        state.last_released = Some(target.id);
        if mark_as_most_recent {
            state.most_recent = Some(released);
        }
    }

    /// The target most recently released with `mark_as_most_recent`.
    #[must_use]
    pub fn most_recent(&self) -> Option<ScratchTarget> {
        self.state.lock().most_recent
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
    pub fn in_use_count(&self) -> usize {
        self.state.lock().entries.values().filter(|e| e.in_use).count()
    }

    /// Ages idle entries and evicts those idle for longer than the threshold.
    ///
    /// Returns the number of evicted targets.
    pub fn cleanup(&self, elapsed_seconds: f64) -> Result<usize> {
        let completed = self.frame_fence.completed()?;
        let mut state = self.state.lock();
        let mut evicted = Vec::new();
        for (id, entry) in &mut state.entries {
            if entry.in_use {
                continue;
            }
            entry.age_in_frames = entry.age_in_frames.saturating_add(1);
            if entry.age_in_frames >= self.frames_in_flight && completed >= entry.fence_value {
                entry.unused_seconds += elapsed_seconds;
            }
            if entry.unused_seconds > self.eviction_seconds {
                evicted.push(id);
            }
        }
        for id in &evicted {
            self.evict(&mut state, *id);
        }
        if !evicted.is_empty() {
            debug!(
                "Scratch pool: evicted {}, {} remain",
                evicted.len(),
                state.entries.len()
            );
        }
        Ok(evicted.len())
    }

    /// Destroys every target, in use or not. Only valid once the GPU is idle.
    pub fn drain(&self) -> usize {
        let mut state = self.state.lock();
        let ids: Vec<_> = state.entries.keys().collect();
        let in_use = state.entries.values().filter(|e| e.in_use).count();
        if in_use > 0 {
            warn!("Scratch pool: draining {in_use} target(s) still marked in use");
        }
        for id in &ids {
            self.evict(&mut state, *id);
        }
        ids.len()
    }

    fn evict(&self, state: &mut PoolState, id: ScratchTargetId) {
        let Some(entry) = state.entries.remove(id) else {
            return;
        };
        let target = entry.target;
        self.backend.release(target.resource);
        self.views.free_persistent(target.view_heap, target.view);

        if let Some(bucket) = state.by_signature.get_mut(&target.signature) {
            bucket.retain(|other| *other != id);
            if bucket.is_empty() {
                state.by_signature.remove(&target.signature);
            }
        }
        if state.last_released == Some(id) {
            state.last_released = None;
        }
        if state.most_recent.is_some_and(|t| t.id == id) {
            state.most_recent = None;
        }
    }
}
