//! Host-memory GPU
//!
//! Emulates readback, PBOs and fences on the CPU. Used by the CLI when no
//! hardware backend is linked and by tests, which can inject late or failed
//! fences, PBO exhaustion and context loss.

use super::{
    FenceId, FenceStatus, FramebufferId, FramebufferRef, GpuBackend, GpuError, GpuResult,
    PixelBufferId,
};
use crate::types::{DataFormat, Resolution};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Behaviour knobs of the software GPU
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SoftwareGpuConfig {
    /// Readback row alignment in bytes
    pub pack_alignment: usize,
    /// Expose pixel buffer objects
    pub pixel_buffers: bool,
    /// Fail PBO allocation beyond this many live buffers
    pub max_pixel_buffers: Option<usize>,
    /// Time between fence insertion and completion
    pub fence_latency: Duration,
}

impl Default for SoftwareGpuConfig {
    fn default() -> Self {
        Self {
            pack_alignment: 4,
            pixel_buffers: true,
            max_pixel_buffers: None,
            fence_latency: Duration::ZERO,
        }
    }
}

impl SoftwareGpuConfig {
    pub fn with_pack_alignment(mut self, alignment: usize) -> Self {
        self.pack_alignment = alignment.max(1);
        self
    }

    pub fn with_pixel_buffers(mut self, enabled: bool) -> Self {
        self.pixel_buffers = enabled;
        self
    }

    pub fn with_max_pixel_buffers(mut self, max: usize) -> Self {
        self.max_pixel_buffers = Some(max);
        self
    }

    pub fn with_fence_latency(mut self, latency: Duration) -> Self {
        self.fence_latency = latency;
        self
    }
}

struct SoftFramebuffer {
    width: u32,
    height: u32,
    format: DataFormat,
    pixels: Vec<u8>,
}

struct SoftPixelBuffer {
    data: Arc<[u8]>,
    mapped: bool,
}

struct SoftFence {
    ready_at: Instant,
    failed: bool,
}

#[derive(Default)]
struct SoftState {
    next_id: u64,
    framebuffers: HashMap<u64, SoftFramebuffer>,
    pixel_buffers: HashMap<u64, SoftPixelBuffer>,
    fences: HashMap<u64, SoftFence>,
    fences_created: u64,
    fence_stalls: HashMap<u64, Duration>,
    fence_failures: HashSet<u64>,
    readbacks: HashMap<u64, usize>,
    context_lost: bool,
}

impl SoftState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn check_context(&self) -> GpuResult<()> {
        if self.context_lost {
            Err(GpuError::ContextLost)
        } else {
            Ok(())
        }
    }
}

/// CPU implementation of [`GpuBackend`]
pub struct SoftwareGpu {
    config: SoftwareGpuConfig,
    state: Mutex<SoftState>,
}

impl SoftwareGpu {
    pub fn new(config: SoftwareGpuConfig) -> Self {
        Self {
            config,
            state: Mutex::new(SoftState::default()),
        }
    }

    /// Create a renderer-side framebuffer filled with zeros
    pub fn create_framebuffer(&self, resolution: Resolution, format: DataFormat) -> FramebufferRef {
        let mut state = self.state.lock();
        let id = state.next_id();
        let size = resolution.pixels() as usize * format.pixel_size_in_bytes();
        state.framebuffers.insert(
            id,
            SoftFramebuffer {
                width: resolution.width,
                height: resolution.height,
                format,
                pixels: vec![0; size],
            },
        );
        FramebufferRef {
            id: FramebufferId(id),
            width: resolution.width,
            height: resolution.height,
            format,
        }
    }

    /// "Render" into a framebuffer by replacing its tightly packed pixels
    pub fn upload(&self, fbo: &FramebufferRef, pixels: &[u8]) -> GpuResult<()> {
        let mut state = self.state.lock();
        state.check_context()?;
        let target = state
            .framebuffers
            .get_mut(&fbo.id.0)
            .ok_or(GpuError::InvalidHandle(fbo.id.0))?;
        let n = target.pixels.len().min(pixels.len());
        target.pixels[..n].copy_from_slice(&pixels[..n]);
        Ok(())
    }

    /// Fill every byte of a framebuffer with `value`
    pub fn fill(&self, fbo: &FramebufferRef, value: u8) -> GpuResult<()> {
        let mut state = self.state.lock();
        state.check_context()?;
        let target = state
            .framebuffers
            .get_mut(&fbo.id.0)
            .ok_or(GpuError::InvalidHandle(fbo.id.0))?;
        target.pixels.fill(value);
        Ok(())
    }

    /// Delay completion of the fence with the given creation ordinal
    pub fn stall_fence(&self, ordinal: u64, extra: Duration) {
        self.state.lock().fence_stalls.insert(ordinal, extra);
    }

    /// Make the fence with the given creation ordinal report failure
    pub fn fail_fence(&self, ordinal: u64) {
        self.state.lock().fence_failures.insert(ordinal);
    }

    /// Every further call fails with [`GpuError::ContextLost`]
    pub fn lose_context(&self) {
        self.state.lock().context_lost = true;
    }

    pub fn fences_created(&self) -> u64 {
        self.state.lock().fences_created
    }

    pub fn live_fences(&self) -> usize {
        self.state.lock().fences.len()
    }

    pub fn live_pixel_buffers(&self) -> usize {
        self.state.lock().pixel_buffers.len()
    }

    pub fn mapped_buffers(&self) -> usize {
        self.state
            .lock()
            .pixel_buffers
            .values()
            .filter(|b| b.mapped)
            .count()
    }

    pub fn is_in_external_readback(&self, fbo: &FramebufferRef) -> bool {
        self.state
            .lock()
            .readbacks
            .get(&fbo.id.0)
            .is_some_and(|n| *n > 0)
    }

    fn padded_row(&self, width: u32, format: DataFormat) -> usize {
        let tight = width as usize * format.pixel_size_in_bytes();
        tight.div_ceil(self.config.pack_alignment) * self.config.pack_alignment
    }

    fn copy_padded(&self, src: &SoftFramebuffer, dst: &mut [u8]) -> GpuResult<()> {
        let tight = src.width as usize * src.format.pixel_size_in_bytes();
        let padded = self.padded_row(src.width, src.format);
        let needed = padded * src.height as usize;
        if dst.len() < needed {
            return Err(GpuError::Unsupported(format!(
                "readback target holds {} bytes, need {}",
                dst.len(),
                needed
            )));
        }
        for (row, chunk) in src.pixels.chunks_exact(tight).enumerate() {
            let start = row * padded;
            dst[start..start + tight].copy_from_slice(chunk);
            dst[start + tight..start + padded].fill(0);
        }
        Ok(())
    }
}

impl GpuBackend for SoftwareGpu {
    fn name(&self) -> &str {
        "software"
    }

    fn supports_pixel_buffers(&self) -> bool {
        self.config.pixel_buffers
    }

    fn pack_alignment(&self) -> usize {
        self.config.pack_alignment
    }

    fn create_pixel_buffer(&self, size: usize) -> GpuResult<PixelBufferId> {
        let mut state = self.state.lock();
        state.check_context()?;
        if !self.config.pixel_buffers {
            return Err(GpuError::Unsupported("pixel buffers disabled".into()));
        }
        if let Some(max) = self.config.max_pixel_buffers {
            if state.pixel_buffers.len() >= max {
                return Err(GpuError::OutOfMemory(format!(
                    "pixel buffer limit {} reached",
                    max
                )));
            }
        }
        let id = state.next_id();
        state.pixel_buffers.insert(
            id,
            SoftPixelBuffer {
                data: Arc::from(vec![0u8; size]),
                mapped: false,
            },
        );
        Ok(PixelBufferId(id))
    }

    fn delete_pixel_buffer(&self, id: PixelBufferId) {
        self.state.lock().pixel_buffers.remove(&id.0);
    }

    fn read_pixels_to_buffer(&self, fbo: &FramebufferRef, pbo: PixelBufferId) -> GpuResult<()> {
        let mut state = self.state.lock();
        state.check_context()?;
        let size = match state.pixel_buffers.get(&pbo.0) {
            Some(buffer) if buffer.mapped => {
                return Err(GpuError::Unsupported("readback into a mapped PBO".into()))
            }
            Some(buffer) => buffer.data.len(),
            None => return Err(GpuError::InvalidHandle(pbo.0)),
        };
        let src = state
            .framebuffers
            .get(&fbo.id.0)
            .ok_or(GpuError::InvalidHandle(fbo.id.0))?;
        let mut data = vec![0u8; size];
        self.copy_padded(src, &mut data)?;
        if let Some(buffer) = state.pixel_buffers.get_mut(&pbo.0) {
            buffer.data = Arc::from(data);
        }
        Ok(())
    }

    fn read_pixels(&self, fbo: &FramebufferRef, dst: &mut [u8]) -> GpuResult<()> {
        let state = self.state.lock();
        state.check_context()?;
        let src = state
            .framebuffers
            .get(&fbo.id.0)
            .ok_or(GpuError::InvalidHandle(fbo.id.0))?;
        self.copy_padded(src, dst)
    }

    fn insert_fence(&self) -> GpuResult<FenceId> {
        let mut state = self.state.lock();
        state.check_context()?;
        let ordinal = state.fences_created;
        state.fences_created += 1;
        let extra = state.fence_stalls.remove(&ordinal).unwrap_or_default();
        let failed = state.fence_failures.remove(&ordinal);
        let id = state.next_id();
        state.fences.insert(
            id,
            SoftFence {
                ready_at: Instant::now() + self.config.fence_latency + extra,
                failed,
            },
        );
        Ok(FenceId(id))
    }

    fn client_wait_fence(&self, fence: FenceId, timeout: Duration) -> FenceStatus {
        let remaining = {
            let state = self.state.lock();
            if state.context_lost {
                return FenceStatus::Failed;
            }
            match state.fences.get(&fence.0) {
                Some(f) if f.failed => return FenceStatus::Failed,
                Some(f) => f.ready_at.saturating_duration_since(Instant::now()),
                None => return FenceStatus::Failed,
            }
        };

        if remaining.is_zero() {
            FenceStatus::Signaled
        } else if remaining <= timeout {
            std::thread::sleep(remaining);
            FenceStatus::Signaled
        } else {
            std::thread::sleep(timeout);
            FenceStatus::TimeoutExpired
        }
    }

    fn delete_fence(&self, fence: FenceId) {
        self.state.lock().fences.remove(&fence.0);
    }

    fn map_pixel_buffer(&self, id: PixelBufferId) -> GpuResult<Arc<[u8]>> {
        let mut state = self.state.lock();
        state.check_context()?;
        let buffer = state
            .pixel_buffers
            .get_mut(&id.0)
            .ok_or(GpuError::InvalidHandle(id.0))?;
        buffer.mapped = true;
        Ok(Arc::clone(&buffer.data))
    }

    fn unmap_pixel_buffer(&self, id: PixelBufferId) {
        if let Some(buffer) = self.state.lock().pixel_buffers.get_mut(&id.0) {
            buffer.mapped = false;
        }
    }

    fn begin_external_readback(&self, fbo: &FramebufferRef) {
        *self.state.lock().readbacks.entry(fbo.id.0).or_insert(0) += 1;
    }

    fn end_external_readback(&self, fbo: &FramebufferRef) {
        let mut state = self.state.lock();
        if let Some(count) = state.readbacks.get_mut(&fbo.id.0) {
            *count = count.saturating_sub(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_readback_pads_rows() {
        let gpu = SoftwareGpu::new(SoftwareGpuConfig::default().with_pack_alignment(4));
        let fbo = gpu.create_framebuffer(Resolution::new(3, 2), DataFormat::Rgb8);
        gpu.upload(&fbo, &(1..=18).collect::<Vec<u8>>()).unwrap();

        // 9 bytes per row padded to 12
        let mut dst = vec![0xAA; 24];
        gpu.read_pixels(&fbo, &mut dst).unwrap();
        assert_eq!(&dst[..9], &[1, 2, 3, 4, 5, 6, 7, 8, 9]);
        assert_eq!(&dst[9..12], &[0, 0, 0]);
        assert_eq!(&dst[12..21], &[10, 11, 12, 13, 14, 15, 16, 17, 18]);
    }

    #[test]
    fn test_fence_latency_and_stall() {
        let gpu = SoftwareGpu::new(SoftwareGpuConfig::default());
        gpu.stall_fence(1, Duration::from_millis(50));

        let first = gpu.insert_fence().unwrap();
        assert_eq!(gpu.client_wait_fence(first, Duration::ZERO), FenceStatus::Signaled);

        let second = gpu.insert_fence().unwrap();
        assert_eq!(
            gpu.client_wait_fence(second, Duration::from_millis(5)),
            FenceStatus::TimeoutExpired
        );
        assert_eq!(
            gpu.client_wait_fence(second, Duration::from_millis(200)),
            FenceStatus::Signaled
        );
    }

    #[test]
    fn test_failed_fence_and_lost_context() {
        let gpu = SoftwareGpu::new(SoftwareGpuConfig::default());
        gpu.fail_fence(0);
        let fence = gpu.insert_fence().unwrap();
        assert_eq!(gpu.client_wait_fence(fence, Duration::ZERO), FenceStatus::Failed);

        gpu.lose_context();
        assert_eq!(gpu.insert_fence(), Err(GpuError::ContextLost));
    }

    #[test]
    fn test_pixel_buffer_limit() {
        let gpu = SoftwareGpu::new(SoftwareGpuConfig::default().with_max_pixel_buffers(1));
        let first = gpu.create_pixel_buffer(16).unwrap();
        assert!(matches!(
            gpu.create_pixel_buffer(16),
            Err(GpuError::OutOfMemory(_))
        ));
        gpu.delete_pixel_buffer(first);
        assert!(gpu.create_pixel_buffer(16).is_ok());
    }
}
