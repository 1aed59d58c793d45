//! Owned GPU handles released on drop

use super::{FenceId, FenceStatus, GpuBackend, GpuResult, PixelBufferId};
use std::sync::Arc;
use std::time::Duration;

/// Fence sync object deleted when dropped
pub struct ScopedFence {
    gpu: Arc<dyn GpuBackend>,
    id: FenceId,
}

impl ScopedFence {
    /// Insert a fence behind every command queued so far
    pub fn insert(gpu: &Arc<dyn GpuBackend>) -> GpuResult<Self> {
        let id = gpu.insert_fence()?;
        Ok(Self {
            gpu: Arc::clone(gpu),
            id,
        })
    }

    pub fn id(&self) -> FenceId {
        self.id
    }

    pub fn wait(&self, timeout: Duration) -> FenceStatus {
        self.gpu.client_wait_fence(self.id, timeout)
    }
}

impl Drop for ScopedFence {
    fn drop(&mut self) {
        self.gpu.delete_fence(self.id);
    }
}

impl std::fmt::Debug for ScopedFence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ScopedFence").field(&self.id.0).finish()
    }
}

/// Pixel buffer object deleted when dropped
pub struct PixelBuffer {
    gpu: Arc<dyn GpuBackend>,
    id: PixelBufferId,
    size: usize,
}

impl PixelBuffer {
    pub fn new(gpu: &Arc<dyn GpuBackend>, size: usize) -> GpuResult<Self> {
        let id = gpu.create_pixel_buffer(size)?;
        Ok(Self {
            gpu: Arc::clone(gpu),
            id,
            size,
        })
    }

    pub fn id(&self) -> PixelBufferId {
        self.id
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Map for reading; unmapped when the returned guard drops
    pub fn map(&self) -> GpuResult<MappedBuffer> {
        let pixels = self.gpu.map_pixel_buffer(self.id)?;
        Ok(MappedBuffer {
            gpu: Arc::clone(&self.gpu),
            id: self.id,
            pixels,
        })
    }
}

impl Drop for PixelBuffer {
    fn drop(&mut self) {
        self.gpu.delete_pixel_buffer(self.id);
    }
}

impl std::fmt::Debug for PixelBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PixelBuffer")
            .field("id", &self.id.0)
            .field("size", &self.size)
            .finish()
    }
}

/// Host view of a mapped PBO
pub struct MappedBuffer {
    gpu: Arc<dyn GpuBackend>,
    id: PixelBufferId,
    pixels: Arc<[u8]>,
}

impl MappedBuffer {
    pub fn bytes(&self) -> &[u8] {
        &self.pixels
    }
}

impl Drop for MappedBuffer {
    fn drop(&mut self) {
        self.gpu.unmap_pixel_buffer(self.id);
    }
}

impl std::fmt::Debug for MappedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedBuffer")
            .field("id", &self.id.0)
            .field("len", &self.pixels.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{SoftwareGpu, SoftwareGpuConfig};

    #[test]
    fn test_handles_released_on_drop() {
        let soft = Arc::new(SoftwareGpu::new(SoftwareGpuConfig::default()));
        let gpu: Arc<dyn GpuBackend> = soft.clone();

        let pbo = PixelBuffer::new(&gpu, 64).unwrap();
        let fence = ScopedFence::insert(&gpu).unwrap();
        {
            let mapped = pbo.map().unwrap();
            assert_eq!(mapped.bytes().len(), 64);
            assert_eq!(soft.mapped_buffers(), 1);
        }
        assert_eq!(soft.mapped_buffers(), 0);
        assert_eq!(soft.live_pixel_buffers(), 1);
        assert_eq!(soft.live_fences(), 1);

        drop(fence);
        drop(pbo);
        assert_eq!(soft.live_pixel_buffers(), 0);
        assert_eq!(soft.live_fences(), 0);
    }
}
