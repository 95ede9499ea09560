//! Error Types
//!
//! This module defines the error types used throughout the frame pipeline.
//!
//! # Overview
//!
//! Almost every variant of [`LifecycleError`] is **fatal**: it describes a
//! static sizing defect (an exhausted view heap, an upload larger than the
//! ring) or a lost device. None of the components attempt local recovery;
//! the error is logged where it is detected and propagated with `?` up to the
//! render loop, which is expected to tear the process down.
//!
//! Upload-ring exhaustion is the only non-fatal pressure condition and never
//! surfaces as an error: the uploader blocks until the GPU frees space.
//!
//! ```rust,ignore
//! use frame_pipeline::errors::{LifecycleError, Result};
//!
//! fn record(frame: &mut FrameCycle) -> Result<()> {
//!     let view = frame.allocate_persistent_view(HeapKind::ShaderResource)?;
//!     Ok(())
//! }
//! ```

use thiserror::Error;

use crate::backend::NativeHandle;
use crate::views::HeapKind;

/// The main error type for the frame pipeline.
#[derive(Error, Debug)]
pub enum LifecycleError {
    // ========================================================================
    // Sizing Errors
    // ========================================================================
    /// A view heap ran out of slots.
    ///
    /// Treated as a static configuration defect, never retried.
    #[error("{heap:?} view heap exhausted: requested {requested}, capacity {capacity}")]
    CapacityExceeded {
        heap: HeapKind,
        requested: u64,
        capacity: u64,
    },

    /// An upload is larger than the whole streaming ring.
    #[error("Upload of {requested} bytes exceeds ring capacity of {capacity} bytes")]
    UploadTooLarge { requested: u64, capacity: u64 },

    /// A per-frame transient buffer ran out of space.
    #[error("Transient buffer exhausted: requested {requested} bytes, {remaining} remaining")]
    TransientExhausted { requested: u64, remaining: u64 },

    // ========================================================================
    // Device Errors
    // ========================================================================
    /// The device stopped responding or a fence wait failed.
    #[error("GPU device lost: {0}")]
    DeviceLost(String),

    /// A fence reported a completed value lower than one observed earlier.
    #[error("Fence completion regressed from {previous} to {observed}")]
    FenceRegressed { previous: u64, observed: u64 },

    /// The backend does not know the given native handle.
    #[error("Unknown native resource: {0:?}")]
    UnknownResource(NativeHandle),

    // ========================================================================
    // Frame Cycle Errors
    // ========================================================================
    /// A frame hook was invoked in the wrong order.
    #[error("Frame hook out of order: expected {expected}, got {actual}")]
    FrameOutOfOrder {
        expected: &'static str,
        actual: &'static str,
    },

    /// The frame cycle has already been shut down.
    #[error("Frame pipeline has been shut down")]
    ShutDown,

    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Settings failed validation.
    #[error("Invalid settings: {0}")]
    InvalidSettings(String),

    /// Settings could not be parsed.
    #[error("Settings parse error: {0}")]
    Settings(#[from] serde_json::Error),
}

impl LifecycleError {
    /// Returns `true` for conditions that indicate the GPU itself is gone.
    #[must_use]
    pub fn is_device_loss(&self) -> bool {
        matches!(self, Self::DeviceLost(_) | Self::FenceRegressed { .. })
    }
}

/// Alias for `Result<T, LifecycleError>`.
pub type Result<T> = std::result::Result<T, LifecycleError>;
