//! Frame-pipelined GPU resource lifetime management.
//!
//! The CPU records frame F while the GPU may still be executing frames
//! F-1 … F-N+1. This crate holds the pieces that have to respect that:
//!
//! - [`views`]: fixed-capacity view slot tables (persistent + per-frame).
//! - [`upload`]: a fence-tracked circular upload ring and per-frame
//!   transient buffers.
//! - [`release`]: a queue that destroys retired objects N frames late.
//! - [`scratch_pool`]: signature-keyed reuse of intermediate render targets.
//! - [`frame`]: the per-present driver tying them together.
//!
//! All of them reach the device through an explicit [`GpuBackend`] context.

pub mod backend;
pub mod errors;
pub mod fence;
pub mod frame;
pub mod release;
pub mod scratch_pool;
pub mod settings;
pub mod upload;
pub mod views;

pub use backend::{GpuBackend, HeadlessBackend, NativeHandle, WgpuBackend};
pub use errors::{LifecycleError, Result};
pub use frame::{FrameCycle, FrameToken};
pub use release::{DeferredReleaseQueue, OwnedResource, OwnedView, Reclaimable};
pub use scratch_pool::{ScratchSignature, ScratchTarget, ScratchTargetDesc, ScratchTargetPool};
pub use settings::LifecycleSettings;
pub use upload::{StreamingUploader, UploadContext};
pub use views::{HeapKind, TemporaryRange, ViewHandle, ViewHandleAllocator, ViewHeaps};
