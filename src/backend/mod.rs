//! GPU Backend Abstraction
//!
//! Every component of the frame pipeline talks to the hardware through a
//! [`GpuBackend`] trait object that is handed to it at construction time.
//! There is no process-wide device: whoever builds the [`FrameCycle`]
//! decides which backend is used.
//!
//! Two implementations ship with the crate:
//!
//! - [`WgpuBackend`]: real GPU access through `wgpu`.
//! - [`HeadlessBackend`]: a CPU-emulated queue whose work only "executes"
//!   when someone waits on it. Used by the tests and by tools that want to
//!   exercise the pipeline without a device.
//!
//! [`FrameCycle`]: crate::frame::FrameCycle

pub mod headless;
pub mod wgpu_backend;

pub use headless::HeadlessBackend;
pub use wgpu_backend::WgpuBackend;

use smallvec::SmallVec;

use crate::errors::Result;

// ─── Handles ──────────────────────────────────────────────────────────────────

/// Opaque identifier of a GPU object owned by a backend.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct NativeHandle(u64);

impl NativeHandle {
    #[inline]
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

/// Identifier of a monotonic fence created by a backend.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct FenceId(u32);

impl FenceId {
    #[inline]
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }
}

// ─── Descriptors ──────────────────────────────────────────────────────────────

/// Descriptor for a linear GPU buffer.
#[derive(Clone, Debug)]
pub struct BufferDesc {
    pub label: &'static str,
    pub size: u64,
    pub usage: wgpu::BufferUsages,
}

/// Descriptor for a render target texture.
#[derive(Clone, Debug, PartialEq)]
pub struct RenderTargetDesc {
    pub label: &'static str,
    pub size: wgpu::Extent3d,
    pub mip_level_count: u32,
    pub sample_count: u32,
    pub dimension: wgpu::TextureDimension,
    pub format: wgpu::TextureFormat,
    pub usage: wgpu::TextureUsages,
}

impl RenderTargetDesc {
    /// Bytes occupied by one texel of mip 0, or 0 for formats without a
    /// single copyable aspect.
    #[must_use]
    pub fn texel_size(&self) -> u32 {
        self.format.block_copy_size(None).unwrap_or(0)
    }

    /// Approximate footprint of the full mip chain across all samples.
    #[must_use]
    pub fn byte_size(&self) -> u64 {
        let texel = u64::from(self.texel_size());
        let samples = u64::from(self.sample_count.max(1));
        (0..self.mip_level_count.max(1))
            .map(|mip| {
                let w = u64::from((self.size.width >> mip).max(1));
                let h = u64::from((self.size.height >> mip).max(1));
                let d = match self.dimension {
                    wgpu::TextureDimension::D3 => {
                        u64::from((self.size.depth_or_array_layers >> mip).max(1))
                    }
                    _ => u64::from(self.size.depth_or_array_layers.max(1)),
                };
                w * h * d * texel * samples
            })
            .sum()
    }
}

// ─── Copy Recording ───────────────────────────────────────────────────────────

/// A single GPU-side copy out of an upload allocation.
///
/// `src_offset` is relative to the start of the owning upload.
#[derive(Clone, Debug, PartialEq)]
pub enum CopyCommand {
    Buffer {
        dst: NativeHandle,
        dst_offset: u64,
        src_offset: u64,
        size: u64,
    },
    Texture {
        dst: NativeHandle,
        mip_level: u32,
        origin: wgpu::Origin3d,
        extent: wgpu::Extent3d,
        src_offset: u64,
        bytes_per_row: u32,
        rows_per_image: u32,
    },
}

/// Inline storage for the copies of one upload. Most uploads feed a single
/// destination.
pub type CopyList = SmallVec<[CopyCommand; 4]>;

/// A closed copy recording ready for the hardware queue.
#[derive(Debug)]
pub struct UploadBatch<'a> {
    /// The upload arena the data lives in.
    pub arena: NativeHandle,
    /// Byte offset of `data` inside the arena.
    pub offset: u64,
    /// CPU-authored bytes, written into the arena before the copies run.
    pub data: &'a [u8],
    pub copies: &'a [CopyCommand],
}

// ─── Backend Trait ────────────────────────────────────────────────────────────

/// The device and its single hardware queue.
///
/// Implementations must be callable from any thread. Queue-touching methods
/// (`submit_copies`, `signal`, `queue_wait`) are serialized by the callers.
pub trait GpuBackend: Send + Sync {
    /// Short name used in log output.
    fn name(&self) -> &'static str;

    fn create_buffer(&self, desc: &BufferDesc) -> Result<NativeHandle>;

    fn create_render_target(&self, desc: &RenderTargetDesc) -> Result<NativeHandle>;

    /// Destroys a GPU object immediately. Callers are responsible for making
    /// sure the GPU no longer references it.
    fn release(&self, handle: NativeHandle);

    /// CPU write into CPU-visible buffer memory.
    fn write_buffer(&self, handle: NativeHandle, offset: u64, data: &[u8]) -> Result<()>;

    /// Writes `batch.data` into the arena and executes its copies on the queue.
    fn submit_copies(&self, batch: &UploadBatch<'_>) -> Result<()>;

    fn create_fence(&self) -> Result<FenceId>;

    /// Queues a signal of `value` after all previously submitted work.
    fn signal(&self, fence: FenceId, value: u64) -> Result<()>;

    /// The highest value the GPU has signaled so far.
    fn completed_value(&self, fence: FenceId) -> Result<u64>;

    /// Blocks the calling thread until `fence` reaches `value`.
    fn wait_for(&self, fence: FenceId, value: u64) -> Result<()>;

    /// Makes subsequent queue work wait for `fence` to reach `value`.
    fn queue_wait(&self, fence: FenceId, value: u64) -> Result<()>;

    /// Blocks until every submitted command has finished.
    fn wait_idle(&self) -> Result<()>;
}
