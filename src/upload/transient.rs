//! Per-frame transient buffers.
//!
//! One CPU-visible buffer per frame in flight for small constant-style data
//! that lives for a single frame. There is no completion tracking: a buffer
//! is reset wholesale when its frame slot comes around again, which the frame
//! cycle only does after waiting for the GPU to finish that slot.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use log::{error, info};

use super::align_up;
use crate::backend::{BufferDesc, GpuBackend, NativeHandle};
use crate::errors::{LifecycleError, Result};
use crate::settings::LifecycleSettings;

/// A range inside one frame's transient buffer.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct TransientAllocation {
    pub frame_slot: usize,
    pub buffer: NativeHandle,
    pub offset: u64,
    pub size: u64,
}

struct FrameBuffer {
    buffer: NativeHandle,
    cursor: AtomicU64,
}

pub struct TransientBuffers {
    backend: Arc<dyn GpuBackend>,
    capacity: u64,
    alignment: u64,
    frames: Vec<FrameBuffer>,
    current: AtomicUsize,
}

impl TransientBuffers {
    pub fn new(backend: Arc<dyn GpuBackend>, settings: &LifecycleSettings) -> Result<Self> {
        let capacity = settings.transient_buffer_bytes;
        let frames = (0..settings.frames_in_flight)
            .map(|_| {
                let buffer = backend.create_buffer(&BufferDesc {
                    label: "Transient Frame Buffer",
                    size: capacity,
                    usage: wgpu::BufferUsages::UNIFORM
                        | wgpu::BufferUsages::STORAGE
                        | wgpu::BufferUsages::VERTEX
                        | wgpu::BufferUsages::INDEX
                        | wgpu::BufferUsages::COPY_DST,
                })?;
                Ok(FrameBuffer {
                    buffer,
                    cursor: AtomicU64::new(0),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        info!(
            "Transient buffers: {} x {} bytes",
            frames.len(),
            capacity
        );

        Ok(Self {
            backend,
            capacity,
            alignment: settings.transient_alignment,
            frames,
            current: AtomicUsize::new(0),
        })
    }

    #[inline]
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    #[inline]
    #[must_use]
    pub fn current_slot(&self) -> usize {
        self.current.load(Ordering::Acquire)
    }

    /// Bytes handed out from the current frame's buffer.
    #[must_use]
    pub fn used(&self) -> u64 {
        self.frames[self.current_slot()]
            .cursor
            .load(Ordering::Acquire)
            .min(self.capacity)
    }

    /// Bump-allocates `size` bytes from the current frame's buffer.
    pub fn allocate(&self, size: u64) -> Result<TransientAllocation> {
        let slot = self.current_slot();
        let frame = &self.frames[slot];
        let Some(aligned) = align_up(size.max(1), self.alignment).filter(|a| *a <= self.capacity) else {
            error!(
                "Transient allocation of {size} bytes exceeds the {} byte buffer",
                self.capacity
            );
            return Err(LifecycleError::TransientExhausted {
                requested: size,
                remaining: self
                    .capacity
                    .saturating_sub(frame.cursor.load(Ordering::Acquire)),
            });
        };
        let offset = frame.cursor.fetch_add(aligned, Ordering::AcqRel);
        if offset.saturating_add(aligned) > self.capacity {
            error!(
                "Transient buffer {slot} exhausted: {aligned} bytes requested at offset {offset} of {}",
                self.capacity
            );
            return Err(LifecycleError::TransientExhausted {
                requested: size,
                remaining: self.capacity.saturating_sub(offset),
            });
        }
        Ok(TransientAllocation {
            frame_slot: slot,
            buffer: frame.buffer,
            offset,
            size: aligned,
        })
    }

    /// Writes `bytes` at the start of `allocation`.
    pub fn write(&self, allocation: &TransientAllocation, bytes: &[u8]) -> Result<()> {
        debug_assert!(bytes.len() as u64 <= allocation.size);
        self.backend
            .write_buffer(allocation.buffer, allocation.offset, bytes)
    }

    /// Allocates and fills in one step.
    pub fn push<T: bytemuck::Pod>(&self, value: &T) -> Result<TransientAllocation> {
        let bytes = bytemuck::bytes_of(value);
        let allocation = self.allocate(bytes.len() as u64)?;
        self.write(&allocation, bytes)?;
        Ok(allocation)
    }

    /// Switches to `slot` and resets its buffer. The caller must have waited
    /// for the GPU to finish the frame that last used this slot.
    pub fn begin_frame(&self, slot: usize) {
        let slot = slot % self.frames.len();
        self.frames[slot].cursor.store(0, Ordering::Release);
        self.current.store(slot, Ordering::Release);
    }

    pub fn shutdown(&self) {
        for frame in &self.frames {
            self.backend.release(frame.buffer);
            frame.cursor.store(0, Ordering::Release);
        }
    }
}
