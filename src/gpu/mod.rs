//! GPU collaborator
//!
//! The pipeline never talks to a graphics API directly. Everything it needs
//! from the GPU goes through [`GpuBackend`]:
//! - asynchronous readback into pixel buffer objects (PBOs) plus fences
//! - synchronous readback as the fallback path
//! - mapping PBOs into host memory on the transfer thread
//!
//! Implementations must allow fence waits and PBO maps from the transfer
//! thread (a shared context in GL terms).

mod resources;
mod software;

pub use resources::{MappedBuffer, PixelBuffer, ScopedFence};
pub use software::{SoftwareGpu, SoftwareGpuConfig};

use crate::types::{DataFormat, Resolution};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for GPU calls
pub type GpuResult<T> = std::result::Result<T, GpuError>;

/// GPU failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GpuError {
    #[error("GPU context lost")]
    ContextLost,

    #[error("GPU out of memory: {0}")]
    OutOfMemory(String),

    #[error("Invalid GPU handle {0}")]
    InvalidHandle(u64),

    #[error("Unsupported GPU operation: {0}")]
    Unsupported(String),
}

impl GpuError {
    /// The device must be closed and reopened after this error
    pub fn is_fatal(&self) -> bool {
        matches!(self, GpuError::ContextLost)
    }
}

/// Identifier of a framebuffer owned by the renderer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FramebufferId(pub u64);

/// Identifier of a pixel buffer object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PixelBufferId(pub u64);

/// Identifier of a fence sync object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FenceId(pub u64);

/// Borrowed handle to a rendered framebuffer
///
/// The renderer owns the framebuffer. The pipeline holds this handle only
/// between `begin_external_readback` and `end_external_readback`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramebufferRef {
    pub id: FramebufferId,
    pub width: u32,
    pub height: u32,
    pub format: DataFormat,
}

impl FramebufferRef {
    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }
}

/// Outcome of a bounded fence wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceStatus {
    /// All commands before the fence have completed
    Signaled,
    /// The timeout expired first
    TimeoutExpired,
    /// The driver dropped the fence
    Failed,
}

/// Operations the output pipeline needs from the GPU
pub trait GpuBackend: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &str;

    /// Whether pixel buffer objects are available at all
    fn supports_pixel_buffers(&self) -> bool;

    /// Row alignment applied to readback rows
    fn pack_alignment(&self) -> usize;

    fn create_pixel_buffer(&self, size: usize) -> GpuResult<PixelBufferId>;

    fn delete_pixel_buffer(&self, id: PixelBufferId);

    /// Queue a readback of `fbo` into `pbo`; returns without waiting
    fn read_pixels_to_buffer(&self, fbo: &FramebufferRef, pbo: PixelBufferId) -> GpuResult<()>;

    /// Blocking readback of `fbo` into host memory using padded rows
    fn read_pixels(&self, fbo: &FramebufferRef, dst: &mut [u8]) -> GpuResult<()>;

    /// Insert a fence after all queued commands
    fn insert_fence(&self) -> GpuResult<FenceId>;

    /// Wait up to `timeout` for the fence
    fn client_wait_fence(&self, fence: FenceId, timeout: Duration) -> FenceStatus;

    fn delete_fence(&self, fence: FenceId);

    /// Map a PBO for reading; the slice stays valid until unmapped
    fn map_pixel_buffer(&self, id: PixelBufferId) -> GpuResult<Arc<[u8]>>;

    fn unmap_pixel_buffer(&self, id: PixelBufferId);

    /// Tell the renderer not to reuse `fbo` until the readback ends
    fn begin_external_readback(&self, fbo: &FramebufferRef);

    fn end_external_readback(&self, fbo: &FramebufferRef);
}
