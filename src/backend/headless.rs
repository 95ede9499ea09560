//! Headless Backend
//!
//! A CPU emulation of one device with a single in-order hardware queue.
//!
//! Nothing submitted to the queue runs on its own. Work only executes when
//! the CPU waits for it ([`GpuBackend::wait_for`], [`GpuBackend::wait_idle`])
//! or when a test advances the queue explicitly with
//! [`HeadlessBackend::complete_next`] / [`HeadlessBackend::complete_all`].
//! This makes "the GPU is still busy" a state that can be held for as long as
//! a test needs it.
//!
//! ```text
//!   submit_copies ──┐
//!   signal ─────────┼──► pending: VecDeque<QueueOp> ──► execute (on wait)
//!   queue_wait ─────┘                                     │
//!                                                         ▼
//!                                  resources / fence completed values
//! ```

use std::collections::VecDeque;

use log::{debug, trace, warn};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use super::{
    BufferDesc, CopyCommand, FenceId, GpuBackend, NativeHandle, RenderTargetDesc, UploadBatch,
};
use crate::errors::{LifecycleError, Result};

// ─── Internal Types ───────────────────────────────────────────────────────────

enum Storage {
    Buffer(Vec<u8>),
    Texture {
        desc: RenderTargetDesc,
        /// One linear array per mip, rows tightly packed.
        mips: Vec<Vec<u8>>,
    },
}

enum QueueOp {
    Copies {
        arena: NativeHandle,
        offset: u64,
        copies: Vec<CopyCommand>,
    },
    Signal {
        fence: FenceId,
        value: u64,
    },
    Wait {
        fence: FenceId,
        value: u64,
    },
}

#[derive(Default)]
struct HeadlessState {
    next_handle: u64,
    resources: FxHashMap<NativeHandle, Storage>,
    /// Completed value per fence, indexed by `FenceId`.
    fences: Vec<u64>,
    pending: VecDeque<QueueOp>,
    released: Vec<NativeHandle>,
    submitted_batches: u64,
    queue_waits: Vec<(FenceId, u64)>,
    device_lost: bool,
}

fn mip_extent(desc: &RenderTargetDesc, mip: u32) -> (usize, usize, usize) {
    let w = (desc.size.width >> mip).max(1) as usize;
    let h = (desc.size.height >> mip).max(1) as usize;
    let d = match desc.dimension {
        wgpu::TextureDimension::D3 => (desc.size.depth_or_array_layers >> mip).max(1) as usize,
        _ => desc.size.depth_or_array_layers.max(1) as usize,
    };
    (w, h, d)
}

fn out_of_bounds(what: &str) -> LifecycleError {
    LifecycleError::DeviceLost(format!("headless: {what} out of bounds"))
}

impl HeadlessState {
    fn check_alive(&self) -> Result<()> {
        if self.device_lost {
            return Err(LifecycleError::DeviceLost("headless device removed".into()));
        }
        Ok(())
    }

    fn fence(&self, fence: FenceId) -> Result<u64> {
        self.fences
            .get(fence.raw() as usize)
            .copied()
            .ok_or_else(|| LifecycleError::DeviceLost(format!("unknown fence {fence:?}")))
    }

    fn allocate_handle(&mut self) -> NativeHandle {
        self.next_handle += 1;
        NativeHandle::from_raw(self.next_handle)
    }

    /// Executes the oldest queued operation. Returns `None` when idle.
    fn execute_next(&mut self) -> Result<Option<QueueOp>> {
        let Some(op) = self.pending.pop_front() else {
            return Ok(None);
        };
        match &op {
            QueueOp::Copies {
                arena,
                offset,
                copies,
            } => {
                for copy in copies {
                    self.execute_copy(*arena, *offset, copy)?;
                }
            }
            QueueOp::Signal { fence, value } => {
                let slot = self
                    .fences
                    .get_mut(fence.raw() as usize)
                    .ok_or_else(|| LifecycleError::DeviceLost(format!("unknown fence {fence:?}")))?;
                *slot = (*slot).max(*value);
                trace!("headless: fence {} -> {}", fence.raw(), value);
            }
            QueueOp::Wait { fence, value } => {
                // In-order queue: the signal must already have executed.
                if self.fence(*fence)? < *value {
                    return Err(LifecycleError::DeviceLost(format!(
                        "queue wait on fence {} for {} can never be satisfied",
                        fence.raw(),
                        value
                    )));
                }
            }
        }
        Ok(Some(op))
    }

    fn read_arena(&self, arena: NativeHandle, start: usize, len: usize) -> Result<Vec<u8>> {
        match self.resources.get(&arena) {
            Some(Storage::Buffer(bytes)) => bytes
                .get(start..start + len)
                .map(<[u8]>::to_vec)
                .ok_or_else(|| out_of_bounds("copy source")),
            _ => Err(LifecycleError::UnknownResource(arena)),
        }
    }

    fn execute_copy(&mut self, arena: NativeHandle, base: u64, copy: &CopyCommand) -> Result<()> {
        match copy {
            CopyCommand::Buffer {
                dst,
                dst_offset,
                src_offset,
                size,
            } => {
                let src = self.read_arena(arena, (base + src_offset) as usize, *size as usize)?;
                let Some(Storage::Buffer(bytes)) = self.resources.get_mut(dst) else {
                    return Err(LifecycleError::UnknownResource(*dst));
                };
                let start = *dst_offset as usize;
                bytes
                    .get_mut(start..start + src.len())
                    .ok_or_else(|| out_of_bounds("buffer copy destination"))?
                    .copy_from_slice(&src);
            }
            CopyCommand::Texture {
                dst,
                mip_level,
                origin,
                extent,
                src_offset,
                bytes_per_row,
                rows_per_image,
            } => {
                let rows = extent.height as usize * extent.depth_or_array_layers as usize;
                let span = if rows == 0 {
                    0
                } else {
                    *bytes_per_row as usize
                        * (*rows_per_image as usize * (extent.depth_or_array_layers as usize - 1)
                            + extent.height as usize)
                };
                let src = self.read_arena(arena, (base + src_offset) as usize, span)?;
                let Some(Storage::Texture { desc, mips }) = self.resources.get_mut(dst) else {
                    return Err(LifecycleError::UnknownResource(*dst));
                };
                let texel = desc.texel_size().max(1) as usize;
                let (w, h, _) = mip_extent(desc, *mip_level);
                let mip = mips
                    .get_mut(*mip_level as usize)
                    .ok_or_else(|| out_of_bounds("texture mip"))?;
                let row_len = extent.width as usize * texel;
                for z in 0..extent.depth_or_array_layers as usize {
                    for y in 0..extent.height as usize {
                        let s = (z * *rows_per_image as usize + y) * *bytes_per_row as usize;
                        let d = (((origin.z as usize + z) * h + origin.y as usize + y) * w
                            + origin.x as usize)
                            * texel;
                        let row = src
                            .get(s..s + row_len)
                            .ok_or_else(|| out_of_bounds("copy source"))?;
                        mip.get_mut(d..d + row_len)
                            .ok_or_else(|| out_of_bounds("texture copy destination"))?
                            .copy_from_slice(row);
                    }
                }
            }
        }
        Ok(())
    }
}

// ─── Backend ──────────────────────────────────────────────────────────────────

/// CPU-emulated device. See the module documentation.
#[derive(Default)]
pub struct HeadlessBackend {
    state: Mutex<HeadlessState>,
}

impl HeadlessBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs queued work up to and including the next fence signal.
    ///
    /// Returns `false` if the queue ran dry without reaching a signal.
    pub fn complete_next(&self) -> Result<bool> {
        let mut state = self.state.lock();
        state.check_alive()?;
        while let Some(op) = state.execute_next()? {
            if matches!(op, QueueOp::Signal { .. }) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Runs every queued operation.
    pub fn complete_all(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.check_alive()?;
        while state.execute_next()?.is_some() {}
        Ok(())
    }

    /// Number of operations waiting on the emulated queue.
    #[must_use]
    pub fn pending_ops(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Number of upload batches ever submitted.
    #[must_use]
    pub fn submitted_batches(&self) -> u64 {
        self.state.lock().submitted_batches
    }

    /// Snapshot of a buffer's current contents.
    #[must_use]
    pub fn read_buffer(&self, handle: NativeHandle) -> Option<Vec<u8>> {
        match self.state.lock().resources.get(&handle) {
            Some(Storage::Buffer(bytes)) => Some(bytes.clone()),
            _ => None,
        }
    }

    /// Snapshot of one mip of a texture, rows tightly packed.
    #[must_use]
    pub fn read_texture(&self, handle: NativeHandle, mip: u32) -> Option<Vec<u8>> {
        match self.state.lock().resources.get(&handle) {
            Some(Storage::Texture { mips, .. }) => mips.get(mip as usize).cloned(),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_live(&self, handle: NativeHandle) -> bool {
        self.state.lock().resources.contains_key(&handle)
    }

    #[must_use]
    pub fn live_count(&self) -> usize {
        self.state.lock().resources.len()
    }

    /// Every handle released so far, in release order.
    #[must_use]
    pub fn released(&self) -> Vec<NativeHandle> {
        self.state.lock().released.clone()
    }

    /// Every queue-side wait issued so far.
    #[must_use]
    pub fn queue_waits(&self) -> Vec<(FenceId, u64)> {
        self.state.lock().queue_waits.clone()
    }

    /// Forgets the release and queue-wait history kept for inspection.
    pub fn clear_history(&self) {
        let mut state = self.state.lock();
        state.released.clear();
        state.queue_waits.clear();
    }

    /// Simulates device removal: every subsequent call fails.
    pub fn lose_device(&self) {
        warn!("headless: simulating device loss");
        self.state.lock().device_lost = true;
    }

    /// Overwrites a fence's completed value, bypassing the queue.
    pub fn force_completed_value(&self, fence: FenceId, value: u64) {
        if let Some(slot) = self.state.lock().fences.get_mut(fence.raw() as usize) {
            *slot = value;
        }
    }
}

impl GpuBackend for HeadlessBackend {
    fn name(&self) -> &'static str {
        "headless"
    }

    fn create_buffer(&self, desc: &BufferDesc) -> Result<NativeHandle> {
        let mut state = self.state.lock();
        state.check_alive()?;
        let handle = state.allocate_handle();
        state
            .resources
            .insert(handle, Storage::Buffer(vec![0; desc.size as usize]));
        debug!(
            "headless: buffer '{}' ({} bytes) -> {:?}",
            desc.label, desc.size, handle
        );
        Ok(handle)
    }

    fn create_render_target(&self, desc: &RenderTargetDesc) -> Result<NativeHandle> {
        let mut state = self.state.lock();
        state.check_alive()?;
        let texel = desc.texel_size().max(1) as usize;
        let mips = (0..desc.mip_level_count.max(1))
            .map(|mip| {
                let (w, h, d) = mip_extent(desc, mip);
                vec![0; w * h * d * texel]
            })
            .collect();
        let handle = state.allocate_handle();
        state.resources.insert(
            handle,
            Storage::Texture {
                desc: desc.clone(),
                mips,
            },
        );
        debug!(
            "headless: render target '{}' {}x{} {:?} -> {:?}",
            desc.label, desc.size.width, desc.size.height, desc.format, handle
        );
        Ok(handle)
    }

    fn release(&self, handle: NativeHandle) {
        let mut state = self.state.lock();
        if state.resources.remove(&handle).is_none() {
            warn!("headless: release of unknown resource {handle:?}");
            return;
        }
        state.released.push(handle);
    }

    fn write_buffer(&self, handle: NativeHandle, offset: u64, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        state.check_alive()?;
        let Some(Storage::Buffer(bytes)) = state.resources.get_mut(&handle) else {
            return Err(LifecycleError::UnknownResource(handle));
        };
        let start = offset as usize;
        bytes
            .get_mut(start..start + data.len())
            .ok_or_else(|| out_of_bounds("buffer write"))?
            .copy_from_slice(data);
        Ok(())
    }

    fn submit_copies(&self, batch: &UploadBatch<'_>) -> Result<()> {
        let mut state = self.state.lock();
        state.check_alive()?;
        // The arena is CPU-visible: the bytes land immediately, the copies
        // out of it run when the queue gets there.
        let Some(Storage::Buffer(bytes)) = state.resources.get_mut(&batch.arena) else {
            return Err(LifecycleError::UnknownResource(batch.arena));
        };
        let start = batch.offset as usize;
        bytes
            .get_mut(start..start + batch.data.len())
            .ok_or_else(|| out_of_bounds("upload arena write"))?
            .copy_from_slice(batch.data);

        state.pending.push_back(QueueOp::Copies {
            arena: batch.arena,
            offset: batch.offset,
            copies: batch.copies.to_vec(),
        });
        state.submitted_batches += 1;
        Ok(())
    }

    fn create_fence(&self) -> Result<FenceId> {
        let mut state = self.state.lock();
        state.check_alive()?;
        state.fences.push(0);
        Ok(FenceId::from_raw((state.fences.len() - 1) as u32))
    }

    fn signal(&self, fence: FenceId, value: u64) -> Result<()> {
        let mut state = self.state.lock();
        state.check_alive()?;
        state.fence(fence)?;
        state.pending.push_back(QueueOp::Signal { fence, value });
        Ok(())
    }

    fn completed_value(&self, fence: FenceId) -> Result<u64> {
        let state = self.state.lock();
        state.check_alive()?;
        state.fence(fence)
    }

    fn wait_for(&self, fence: FenceId, value: u64) -> Result<()> {
        let mut state = self.state.lock();
        state.check_alive()?;
        while state.fence(fence)? < value {
            if state.execute_next()?.is_none() {
                return Err(LifecycleError::DeviceLost(format!(
                    "fence {} will never reach {} (completed {})",
                    fence.raw(),
                    value,
                    state.fence(fence)?
                )));
            }
        }
        Ok(())
    }

    fn queue_wait(&self, fence: FenceId, value: u64) -> Result<()> {
        let mut state = self.state.lock();
        state.check_alive()?;
        state.queue_waits.push((fence, value));
        state.pending.push_back(QueueOp::Wait { fence, value });
        Ok(())
    }

    fn wait_idle(&self) -> Result<()> {
        self.complete_all()
    }
}
