//! Frame Pipeline Settings
//!
//! All sizing decisions of the subsystem live here. Every capacity is fixed at
//! construction time; running out of one at runtime is a sizing bug reported
//! as a fatal [`LifecycleError`], so these numbers should be chosen with
//! headroom for the worst frame the application renders.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use frame_pipeline::settings::LifecycleSettings;
//!
//! // Defaults: triple buffering, 64 MiB upload ring, 30 s scratch eviction
//! let settings = LifecycleSettings::default();
//!
//! // Loaded from a JSON document shipped with the application
//! let settings = LifecycleSettings::from_json_str(include_str!("gpu.json"))?;
//! ```

use serde::{Deserialize, Serialize};

use crate::errors::{LifecycleError, Result};
use crate::views::HeapKind;

/// Default frame-pipelining depth.
pub const DEFAULT_FRAMES_IN_FLIGHT: u32 = 3;

/// Default scratch render target eviction threshold, in seconds.
pub const DEFAULT_SCRATCH_EVICTION_SECONDS: f64 = 30.0;

// ---------------------------------------------------------------------------
// ViewHeapSettings
// ---------------------------------------------------------------------------

/// Sizing of a single view heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewHeapSettings {
    /// Slots with caller-managed lifetime.
    pub persistent_capacity: u32,
    /// Slots valid for a single frame, bulk-reset at every frame boundary.
    pub temporary_capacity: u32,
    /// Whether shaders read this heap directly. Shader-visible heaps keep
    /// one backing table per frame in flight.
    pub shader_visible: bool,
}

impl ViewHeapSettings {
    #[must_use]
    pub const fn new(persistent_capacity: u32, temporary_capacity: u32, shader_visible: bool) -> Self {
        Self {
            persistent_capacity,
            temporary_capacity,
            shader_visible,
        }
    }

    /// Total number of slots in one backing table.
    #[inline]
    #[must_use]
    pub fn table_len(&self) -> usize {
        self.persistent_capacity as usize + self.temporary_capacity as usize
    }
}

// ---------------------------------------------------------------------------
// LifecycleSettings
// ---------------------------------------------------------------------------

/// Configuration consumed once when the frame pipeline is created.
///
/// | Field                      | Default      |
/// |----------------------------|--------------|
/// | `frames_in_flight`         | 3            |
/// | `shader_resource_heap`     | 16384 / 8192 |
/// | `sampler_heap`             | 512 / 256    |
/// | `render_target_heap`       | 1024 / 256   |
/// | `depth_stencil_heap`       | 256 / 64     |
/// | `upload_ring_bytes`        | 64 MiB       |
/// | `upload_alignment`         | 512          |
/// | `max_in_flight_uploads`    | 256          |
/// | `transient_buffer_bytes`   | 4 MiB        |
/// | `transient_alignment`      | 256          |
/// | `scratch_eviction_seconds` | 30.0         |
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleSettings {
    /// Frame-pipelining depth (N): how many frames the CPU may run ahead.
    pub frames_in_flight: u32,

    // === View Heaps ===
    pub shader_resource_heap: ViewHeapSettings,
    pub sampler_heap: ViewHeapSettings,
    pub render_target_heap: ViewHeapSettings,
    pub depth_stencil_heap: ViewHeapSettings,

    // === Streaming Uploads ===
    /// Byte capacity of the circular upload ring; a multiple of
    /// `upload_alignment`.
    pub upload_ring_bytes: u64,
    /// Every upload is rounded up to this many bytes.
    pub upload_alignment: u64,
    /// Upper bound on submissions awaiting GPU completion.
    pub max_in_flight_uploads: u32,

    // === Per-frame Transient Data ===
    /// Byte capacity of each per-frame transient buffer.
    pub transient_buffer_bytes: u64,
    pub transient_alignment: u64,

    // === Scratch Targets ===
    /// Idle time after which an unused scratch target is destroyed.
    pub scratch_eviction_seconds: f64,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            frames_in_flight: DEFAULT_FRAMES_IN_FLIGHT,
            shader_resource_heap: ViewHeapSettings::new(16_384, 8_192, true),
            sampler_heap: ViewHeapSettings::new(512, 256, true),
            render_target_heap: ViewHeapSettings::new(1_024, 256, false),
            depth_stencil_heap: ViewHeapSettings::new(256, 64, false),
            upload_ring_bytes: 64 * 1024 * 1024,
            upload_alignment: 512,
            max_in_flight_uploads: 256,
            transient_buffer_bytes: 4 * 1024 * 1024,
            transient_alignment: 256,
            scratch_eviction_seconds: DEFAULT_SCRATCH_EVICTION_SECONDS,
        }
    }
}

impl LifecycleSettings {
    /// Parses settings from JSON. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let settings: Self = serde_json::from_str(json)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Sizing of the heap of the given kind.
    #[inline]
    #[must_use]
    pub fn heap(&self, kind: HeapKind) -> &ViewHeapSettings {
        match kind {
            HeapKind::ShaderResource => &self.shader_resource_heap,
            HeapKind::Sampler => &self.sampler_heap,
            HeapKind::RenderTarget => &self.render_target_heap,
            HeapKind::DepthStencil => &self.depth_stencil_heap,
        }
    }

    /// Rejects configurations that could never work at runtime.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(LifecycleError::InvalidSettings(msg));

        if self.frames_in_flight == 0 {
            return fail("frames_in_flight must be at least 1".into());
        }
        for kind in HeapKind::ALL {
            let heap = self.heap(kind);
            if heap.persistent_capacity == 0 {
                return fail(format!("{kind:?} heap has no persistent slots"));
            }
            if heap.table_len() > u32::MAX as usize {
                return fail(format!("{kind:?} heap exceeds u32 index space"));
            }
        }
        if self.upload_ring_bytes == 0 {
            return fail("upload_ring_bytes must be non-zero".into());
        }
        if !self.upload_alignment.is_power_of_two() {
            return fail(format!(
                "upload_alignment {} is not a power of two",
                self.upload_alignment
            ));
        }
        if self.upload_ring_bytes % self.upload_alignment != 0 {
            return fail(format!(
                "upload_ring_bytes {} is not a multiple of upload_alignment {}",
                self.upload_ring_bytes, self.upload_alignment
            ));
        }
        if self.max_in_flight_uploads == 0 {
            return fail("max_in_flight_uploads must be non-zero".into());
        }
        if self.transient_buffer_bytes == 0 {
            return fail("transient_buffer_bytes must be non-zero".into());
        }
        if !self.transient_alignment.is_power_of_two() {
            return fail(format!(
                "transient_alignment {} is not a power of two",
                self.transient_alignment
            ));
        }
        if self.scratch_eviction_seconds.is_nan() || self.scratch_eviction_seconds < 0.0 {
            return fail("scratch_eviction_seconds must be a non-negative number".into());
        }
        Ok(())
    }
}
