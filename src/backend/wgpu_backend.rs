//! wgpu Backend
//!
//! Maps the [`GpuBackend`] contract onto `wgpu`:
//!
//! | Contract            | wgpu                                                  |
//! |---------------------|-------------------------------------------------------|
//! | native handle       | id into a registry of `wgpu::Buffer` / `wgpu::Texture` |
//! | `submit_copies`     | `Queue::write_buffer` + one `CommandEncoder` submit    |
//! | `signal`            | `Queue::on_submitted_work_done` callback               |
//! | `wait_for`          | `Device::poll` until the callback has fired            |
//! | `queue_wait`        | no-op: the single wgpu queue executes in order         |

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use log::{error, trace, warn};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use super::{
    BufferDesc, CopyCommand, FenceId, GpuBackend, NativeHandle, RenderTargetDesc, UploadBatch,
};
use crate::errors::{LifecycleError, Result};

enum WgpuResource {
    Buffer(wgpu::Buffer),
    Texture(wgpu::Texture),
}

/// CPU-side mirror of a fence; completed values arrive through queue callbacks.
#[derive(Default)]
struct WgpuFence {
    completed: Arc<AtomicU64>,
    signaled: AtomicU64,
}

/// A [`GpuBackend`] driving a real `wgpu` device.
pub struct WgpuBackend {
    device: wgpu::Device,
    queue: wgpu::Queue,
    resources: RwLock<FxHashMap<NativeHandle, WgpuResource>>,
    fences: RwLock<Vec<WgpuFence>>,
    next_id: AtomicU64,
}

impl WgpuBackend {
    #[must_use]
    pub fn new(device: wgpu::Device, queue: wgpu::Queue) -> Self {
        Self {
            device,
            queue,
            resources: RwLock::new(FxHashMap::default()),
            fences: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    #[inline]
    #[must_use]
    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    #[inline]
    #[must_use]
    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    /// Runs `f` with the texture behind `handle`, e.g. to create views.
    pub fn with_texture<R>(&self, handle: NativeHandle, f: impl FnOnce(&wgpu::Texture) -> R) -> Result<R> {
        match self.resources.read().get(&handle) {
            Some(WgpuResource::Texture(texture)) => Ok(f(texture)),
            _ => Err(LifecycleError::UnknownResource(handle)),
        }
    }

    /// Runs `f` with the buffer behind `handle`, e.g. to build bind groups.
    pub fn with_buffer<R>(&self, handle: NativeHandle, f: impl FnOnce(&wgpu::Buffer) -> R) -> Result<R> {
        match self.resources.read().get(&handle) {
            Some(WgpuResource::Buffer(buffer)) => Ok(f(buffer)),
            _ => Err(LifecycleError::UnknownResource(handle)),
        }
    }

    fn insert(&self, resource: WgpuResource) -> NativeHandle {
        let handle = NativeHandle::from_raw(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.resources.write().insert(handle, resource);
        handle
    }

    fn poll(&self, poll_type: wgpu::PollType) -> Result<()> {
        self.device.poll(poll_type).map(|_| ()).map_err(|e| {
            error!("wgpu: device poll failed: {e}");
            LifecycleError::DeviceLost(e.to_string())
        })
    }
}

impl GpuBackend for WgpuBackend {
    fn name(&self) -> &'static str {
        "wgpu"
    }

    fn create_buffer(&self, desc: &BufferDesc) -> Result<NativeHandle> {
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(desc.label),
            size: desc.size,
            usage: desc.usage,
            mapped_at_creation: false,
        });
        Ok(self.insert(WgpuResource::Buffer(buffer)))
    }

    fn create_render_target(&self, desc: &RenderTargetDesc) -> Result<NativeHandle> {
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(desc.label),
            size: desc.size,
            mip_level_count: desc.mip_level_count,
            sample_count: desc.sample_count,
            dimension: desc.dimension,
            format: desc.format,
            usage: desc.usage,
            view_formats: &[],
        });
        Ok(self.insert(WgpuResource::Texture(texture)))
    }

    fn release(&self, handle: NativeHandle) {
        match self.resources.write().remove(&handle) {
            Some(WgpuResource::Buffer(buffer)) => buffer.destroy(),
            Some(WgpuResource::Texture(texture)) => texture.destroy(),
            None => warn!("wgpu: release of unknown resource {handle:?}"),
        }
    }

    fn write_buffer(&self, handle: NativeHandle, offset: u64, data: &[u8]) -> Result<()> {
        self.with_buffer(handle, |buffer| self.queue.write_buffer(buffer, offset, data))
    }

    fn submit_copies(&self, batch: &UploadBatch<'_>) -> Result<()> {
        let resources = self.resources.read();
        let Some(WgpuResource::Buffer(arena)) = resources.get(&batch.arena) else {
            return Err(LifecycleError::UnknownResource(batch.arena));
        };
        self.queue.write_buffer(arena, batch.offset, batch.data);

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Streaming Upload"),
            });
        for copy in batch.copies {
            match copy {
                CopyCommand::Buffer {
                    dst,
                    dst_offset,
                    src_offset,
                    size,
                } => {
                    let Some(WgpuResource::Buffer(dst_buffer)) = resources.get(dst) else {
                        return Err(LifecycleError::UnknownResource(*dst));
                    };
                    encoder.copy_buffer_to_buffer(
                        arena,
                        batch.offset + src_offset,
                        dst_buffer,
                        *dst_offset,
                        *size,
                    );
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
                    let Some(WgpuResource::Texture(texture)) = resources.get(dst) else {
                        return Err(LifecycleError::UnknownResource(*dst));
                    };
                    encoder.copy_buffer_to_texture(
                        wgpu::TexelCopyBufferInfo {
                            buffer: arena,
                            layout: wgpu::TexelCopyBufferLayout {
                                offset: batch.offset + src_offset,
                                bytes_per_row: Some(*bytes_per_row),
                                rows_per_image: Some(*rows_per_image),
                            },
                        },
                        wgpu::TexelCopyTextureInfo {
                            texture,
                            mip_level: *mip_level,
                            origin: *origin,
                            aspect: wgpu::TextureAspect::All,
                        },
                        *extent,
                    );
                }
            }
        }
        self.queue.submit(Some(encoder.finish()));
        Ok(())
    }

    fn create_fence(&self) -> Result<FenceId> {
        let mut fences = self.fences.write();
        fences.push(WgpuFence::default());
        Ok(FenceId::from_raw((fences.len() - 1) as u32))
    }

    fn signal(&self, fence: FenceId, value: u64) -> Result<()> {
        let fences = self.fences.read();
        let entry = fences
            .get(fence.raw() as usize)
            .ok_or_else(|| LifecycleError::DeviceLost(format!("unknown fence {fence:?}")))?;
        entry.signaled.fetch_max(value, Ordering::AcqRel);
        let completed = Arc::clone(&entry.completed);
        self.queue.on_submitted_work_done(move || {
            completed.fetch_max(value, Ordering::AcqRel);
        });
        trace!("wgpu: fence {} signal {} queued", fence.raw(), value);
        Ok(())
    }

    fn completed_value(&self, fence: FenceId) -> Result<u64> {
        self.poll(wgpu::PollType::Poll)?;
        let fences = self.fences.read();
        fences
            .get(fence.raw() as usize)
            .map(|f| f.completed.load(Ordering::Acquire))
            .ok_or_else(|| LifecycleError::DeviceLost(format!("unknown fence {fence:?}")))
    }

    fn wait_for(&self, fence: FenceId, value: u64) -> Result<()> {
        let (completed, signaled) = {
            let fences = self.fences.read();
            let entry = fences
                .get(fence.raw() as usize)
                .ok_or_else(|| LifecycleError::DeviceLost(format!("unknown fence {fence:?}")))?;
            (Arc::clone(&entry.completed), entry.signaled.load(Ordering::Acquire))
        };
        if signaled < value {
            return Err(LifecycleError::DeviceLost(format!(
                "fence {} will never reach {} (last signal {})",
                fence.raw(),
                value,
                signaled
            )));
        }
        while completed.load(Ordering::Acquire) < value {
            self.poll(wgpu::PollType::wait_indefinitely())?;
        }
        Ok(())
    }

    fn queue_wait(&self, fence: FenceId, value: u64) -> Result<()> {
        trace!("wgpu: queue wait on fence {} for {} (implicit)", fence.raw(), value);
        Ok(())
    }

    fn wait_idle(&self) -> Result<()> {
        self.poll(wgpu::PollType::wait_indefinitely())
    }
}
