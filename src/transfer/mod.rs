//! GPU to host transfer
//!
//! Two readback paths:
//! - PBO: the render thread queues a readback into the slot's pixel buffer
//!   and a fence, then returns. The transfer thread waits for the fence,
//!   maps the buffer and packs it into the slot's host memory.
//! - ReadPixels: the render thread reads synchronously into host memory and
//!   the transfer thread only packs.
//!
//! Both walk a slot through `Reading -> Mapped -> Transferring -> NeedsUnmap
//! -> Ready`. A frame whose transfer failed walks the same path with its
//! `failed` flag set and is repeated over at the output.

pub mod packing;
mod thread;

pub use thread::{spawn_transfer_thread, FrameReadyHook, PendingTransfer, TransferQueue, TransferWorker};

use crate::config::{DeviceConfig, TransferMethod};
use crate::error::{Error, Result};
use crate::gpu::{FenceStatus, FramebufferRef, GpuBackend, GpuError, PixelBuffer, ScopedFence};
use crate::profile::{GpuTransferScope, Profiler};
use crate::ring::{Ring, SlotImage, SlotState, VideoChannel, WaitSignal};
use crate::types::{Counters, FrameLayout, FrameStamp};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub(crate) const RENDER_THREAD: &str = "render";
pub(crate) const TRANSFER_THREAD: &str = "transfer";

/// Result of finishing one channel of a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    Complete,
    Failed,
}

/// Bounds of every wait the engine performs
#[derive(Debug, Clone, Copy)]
pub struct WaitBounds {
    pub fence_timeout: Duration,
    pub fence_retries: u32,
    pub poll_interval: Duration,
    pub backpressure_timeout: Duration,
}

impl From<&DeviceConfig> for WaitBounds {
    fn from(config: &DeviceConfig) -> Self {
        Self {
            fence_timeout: Duration::from_millis(config.fence_timeout_ms),
            fence_retries: config.fence_retries,
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            backpressure_timeout: Duration::from_millis(config.backpressure_timeout_ms),
        }
    }
}

/// Moves rendered frames from GPU framebuffers into slot host buffers
pub struct TransferEngine {
    gpu: Arc<dyn GpuBackend>,
    layout: FrameLayout,
    method: TransferMethod,
    bounds: WaitBounds,
    profiler: Option<Arc<Profiler>>,
    counters: Arc<Counters>,
}

impl TransferEngine {
    pub fn new(
        gpu: Arc<dyn GpuBackend>,
        layout: FrameLayout,
        method: TransferMethod,
        bounds: WaitBounds,
        counters: Arc<Counters>,
    ) -> Self {
        Self {
            gpu,
            layout,
            method,
            bounds,
            profiler: None,
            counters,
        }
    }

    pub fn with_profiler(mut self, profiler: Option<Arc<Profiler>>) -> Self {
        self.profiler = profiler;
        self
    }

    /// Method in effect after `prepare`
    pub fn method(&self) -> TransferMethod {
        self.method
    }

    pub fn layout(&self) -> &FrameLayout {
        &self.layout
    }

    /// Allocate one PBO per slot, falling back to ReadPixels if that fails
    pub fn prepare(&mut self, ring: &Ring) -> Result<()> {
        if self.method != TransferMethod::Pbo {
            return Ok(());
        }
        if !self.gpu.supports_pixel_buffers() {
            tracing::warn!(
                "{}: pixel buffers unavailable, using synchronous readback",
                self.gpu.name()
            );
            self.method = TransferMethod::ReadPixels;
            return Ok(());
        }

        let size = self.layout.readback_bytes();
        for channel in ring.channels() {
            for slot in channel.slots() {
                match PixelBuffer::new(&self.gpu, size) {
                    Ok(pbo) => slot.lock_image(RENDER_THREAD).pbo = Some(pbo),
                    Err(e) if e.is_fatal() => return Err(e.into()),
                    Err(e) => {
                        tracing::warn!(
                            "PBO allocation failed ({}), falling back to synchronous readback",
                            e
                        );
                        ring.release_gpu_resources();
                        self.method = TransferMethod::ReadPixels;
                        return Ok(());
                    }
                }
            }
        }
        tracing::debug!(
            "Allocated {} PBOs of {} bytes",
            ring.channels().len() * ring.depth(),
            size
        );
        Ok(())
    }

    /// Scope timing one frame's readback initiation
    pub fn start_gpu_transfer(&self) -> GpuTransferScope<'_> {
        GpuTransferScope::new(self.profiler.as_deref())
    }

    /// Wait until the slot about to be reused is free again
    ///
    /// Returns whether the render thread had to wait.
    pub fn finalize_outstanding_transfer(
        &self,
        channel: &VideoChannel,
        index: usize,
        signal: &WaitSignal,
        stop: &AtomicBool,
    ) -> Result<bool> {
        let slot = channel.slot(index);
        let deadline = Instant::now() + self.bounds.backpressure_timeout;
        let mut waited = false;
        loop {
            let seen = signal.generation();
            let free = slot
                .try_lock_state()
                .is_some_and(|s| s.state() == SlotState::NotReady);
            if free {
                return Ok(waited);
            }
            if stop.load(Ordering::Acquire) {
                return Err(Error::DeviceNotOpen);
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout(format!(
                    "slot {} of {} channel not released within {:?}",
                    index,
                    channel.name(),
                    self.bounds.backpressure_timeout
                )));
            }
            waited = true;
            signal.wait_for(seen, self.bounds.poll_interval);
        }
    }

    /// Start moving `fbo` into slot `index` of `channel`
    ///
    /// Only fatal GPU errors are returned; anything else marks the frame
    /// failed so the output repeats the previous one.
    pub fn transfer_channel(
        &self,
        channel: &VideoChannel,
        index: usize,
        fbo: &FramebufferRef,
        stamp: FrameStamp,
    ) -> Result<()> {
        let slot = channel.slot(index);
        let mut image = slot.lock_image(RENDER_THREAD);
        {
            let mut status = slot.lock_state(RENDER_THREAD);
            if !status.transition(SlotState::Reading, RENDER_THREAD) {
                return Err(Error::Internal(format!(
                    "slot {} of {} channel reused while {}",
                    index,
                    channel.name(),
                    status.state()
                )));
            }
            status.fbo = Some(*fbo);
            status.stamp = stamp;
            status.failed = false;
            status.output = None;
        }

        let result = if fbo.resolution() != self.layout.resolution() || fbo.format != self.layout.format {
            Err(GpuError::Unsupported(format!(
                "framebuffer {}x{} {} does not match output {}x{} {}",
                fbo.width,
                fbo.height,
                fbo.format,
                self.layout.width,
                self.layout.height,
                self.layout.format
            )))
        } else {
            self.gpu.begin_external_readback(fbo);
            let result = match self.method {
                TransferMethod::Pbo => self.transfer_channel_pbo(&mut image, fbo),
                TransferMethod::ReadPixels => self.transfer_channel_read_pixels(&mut image, fbo),
            };
            if self.method == TransferMethod::ReadPixels || result.is_err() {
                self.gpu.end_external_readback(fbo);
            }
            result
        };

        let mut status = slot.lock_state(RENDER_THREAD);
        match result {
            Ok(()) => {
                if self.method == TransferMethod::ReadPixels {
                    status.fbo = None;
                    status.transition(SlotState::Mapped, RENDER_THREAD);
                }
                Ok(())
            }
            Err(e) if e.is_fatal() => Err(e.into()),
            Err(e) => {
                tracing::warn!("Frame {} {} readback failed: {}", stamp.sequence, channel.name(), e);
                status.fbo = None;
                status.failed = true;
                Ok(())
            }
        }
    }

    fn transfer_channel_pbo(&self, image: &mut SlotImage, fbo: &FramebufferRef) -> std::result::Result<(), GpuError> {
        let pbo = image
            .pbo
            .as_ref()
            .ok_or_else(|| GpuError::Unsupported("slot has no pixel buffer".into()))?;
        self.gpu.read_pixels_to_buffer(fbo, pbo.id())?;
        image.fence = Some(ScopedFence::insert(&self.gpu)?);
        Ok(())
    }

    fn transfer_channel_read_pixels(
        &self,
        image: &mut SlotImage,
        fbo: &FramebufferRef,
    ) -> std::result::Result<(), GpuError> {
        if self.layout.is_passthrough() {
            self.gpu.read_pixels(fbo, Arc::make_mut(&mut image.data).as_mut_slice())
        } else {
            self.gpu.read_pixels(fbo, &mut image.staging)
        }
    }

    /// Finish slot `index` of `channel` on the transfer thread
    pub fn complete_transfer(&self, channel: &VideoChannel, index: usize) -> Result<TransferOutcome> {
        let slot = channel.slot(index);
        let mut image = slot.lock_image(TRANSFER_THREAD);
        let (state, mut failed, fbo, sequence) = {
            let status = slot.lock_state(TRANSFER_THREAD);
            (status.state(), status.failed, status.fbo, status.stamp.sequence)
        };

        if !matches!(state, SlotState::Reading | SlotState::Mapped) {
            tracing::warn!(
                "Frame {} {}: nothing to complete in state {}",
                sequence,
                channel.name(),
                state
            );
            return Ok(TransferOutcome::Failed);
        }

        if state == SlotState::Reading {
            let mut outcome = Ok(true);
            if !failed {
                outcome = self.await_pbo(&mut image, sequence);
            }
            if let Some(fbo) = fbo {
                self.gpu.end_external_readback(&fbo);
            }
            let mut status = slot.lock_state(TRANSFER_THREAD);
            status.fbo = None;
            match outcome {
                Ok(true) => {}
                Ok(false) => {
                    failed = true;
                    status.failed = true;
                }
                Err(e) => return Err(e),
            }
            status.transition(SlotState::Mapped, TRANSFER_THREAD);
        }

        slot.lock_state(TRANSFER_THREAD)
            .transition(SlotState::Transferring, TRANSFER_THREAD);

        if !failed {
            let SlotImage {
                data,
                staging,
                mapped,
                ..
            } = &mut *image;
            let read_in_place = mapped.is_none() && self.layout.is_passthrough();
            if !read_in_place {
                let src = match mapped.as_ref() {
                    Some(m) => m.bytes(),
                    None => staging.as_slice(),
                };
                packing::pack(
                    self.layout.format.pack_op(),
                    &self.layout,
                    src,
                    Arc::make_mut(data).as_mut_slice(),
                );
            }
        }

        slot.lock_state(TRANSFER_THREAD)
            .transition(SlotState::NeedsUnmap, TRANSFER_THREAD);
        image.mapped = None;

        let mut status = slot.lock_state(TRANSFER_THREAD);
        status.output = Some(Arc::clone(&image.data));
        status.transition(SlotState::Ready, TRANSFER_THREAD);

        Ok(if failed {
            TransferOutcome::Failed
        } else {
            TransferOutcome::Complete
        })
    }

    /// Wait for the slot's fence and map its PBO
    ///
    /// `Ok(false)` means the frame is lost but the device is fine.
    fn await_pbo(&self, image: &mut SlotImage, sequence: u64) -> Result<bool> {
        let Some(fence) = image.fence.take() else {
            return Ok(false);
        };
        if !self.wait_fence(&fence, sequence)? {
            return Ok(false);
        }
        drop(fence);

        let Some(pbo) = image.pbo.as_ref() else {
            return Ok(false);
        };
        match pbo.map() {
            Ok(mapped) => {
                image.mapped = Some(mapped);
                Ok(true)
            }
            Err(e) if e.is_fatal() => Err(e.into()),
            Err(e) => {
                tracing::warn!("Frame {}: mapping pixel buffer failed: {}", sequence, e);
                Ok(false)
            }
        }
    }

    /// Bounded fence wait with retries
    fn wait_fence(&self, fence: &ScopedFence, sequence: u64) -> Result<bool> {
        for attempt in 1..=self.bounds.fence_retries.max(1) {
            match fence.wait(self.bounds.fence_timeout) {
                FenceStatus::Signaled => return Ok(true),
                FenceStatus::Failed => {
                    tracing::warn!("Frame {}: GPU dropped the readback fence", sequence);
                    return Ok(false);
                }
                FenceStatus::TimeoutExpired => {
                    Counters::bump(&self.counters.fence_timeouts);
                    tracing::warn!(
                        "Frame {}: fence wait timed out ({}/{}), retrying",
                        sequence,
                        attempt,
                        self.bounds.fence_retries
                    );
                }
            }
        }
        Err(Error::Timeout(format!(
            "GPU fence for frame {} not signaled after {} waits of {:?}",
            sequence, self.bounds.fence_retries, self.bounds.fence_timeout
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{SoftwareGpu, SoftwareGpuConfig};
    use crate::types::{DataFormat, Resolution};

    fn setup(
        config: SoftwareGpuConfig,
        method: TransferMethod,
        resolution: Resolution,
        format: DataFormat,
    ) -> (Arc<SoftwareGpu>, Ring, TransferEngine) {
        let soft = Arc::new(SoftwareGpu::new(config));
        let gpu: Arc<dyn GpuBackend> = soft.clone();
        let layout = FrameLayout::new(resolution, format, gpu.pack_alignment());
        let ring = Ring::new(layout, 3, false, false);
        let bounds = WaitBounds {
            fence_timeout: Duration::from_millis(20),
            fence_retries: 3,
            poll_interval: Duration::from_millis(2),
            backpressure_timeout: Duration::from_millis(50),
        };
        let mut engine = TransferEngine::new(gpu, layout, method, bounds, Arc::new(Counters::default()));
        engine.prepare(&ring).unwrap();
        (soft, ring, engine)
    }

    fn stamp(sequence: u64) -> FrameStamp {
        FrameStamp {
            sequence,
            time: 0.0,
        }
    }

    fn output_of(ring: &Ring, index: usize) -> Vec<u8> {
        let status = ring.channels()[0].slot(index).lock_state("test");
        assert_eq!(status.state(), SlotState::Ready);
        status.output.as_ref().unwrap().to_vec()
    }

    #[test]
    fn test_pbo_path_strips_padding() {
        let (soft, ring, engine) = setup(
            SoftwareGpuConfig::default(),
            TransferMethod::Pbo,
            Resolution::new(3, 2),
            DataFormat::Rgb8,
        );
        assert_eq!(engine.method(), TransferMethod::Pbo);
        let fbo = soft.create_framebuffer(Resolution::new(3, 2), DataFormat::Rgb8);
        let pixels: Vec<u8> = (1..=18).collect();
        soft.upload(&fbo, &pixels).unwrap();

        let channel = &ring.channels()[0];
        engine.transfer_channel(channel, 0, &fbo, stamp(0)).unwrap();
        assert_eq!(channel.slot(0).state(), SlotState::Reading);
        assert!(soft.is_in_external_readback(&fbo));

        let outcome = engine.complete_transfer(channel, 0).unwrap();
        assert_eq!(outcome, TransferOutcome::Complete);
        assert_eq!(output_of(&ring, 0), pixels);
        assert!(!soft.is_in_external_readback(&fbo));
        assert_eq!(soft.live_fences(), 0);
        assert_eq!(soft.mapped_buffers(), 0);
    }

    #[test]
    fn test_read_pixels_path_subsamples() {
        let (soft, ring, engine) = setup(
            SoftwareGpuConfig::default(),
            TransferMethod::ReadPixels,
            Resolution::new(2, 1),
            DataFormat::CbY0CrY1_8,
        );
        let fbo = soft.create_framebuffer(Resolution::new(2, 1), DataFormat::CbY0CrY1_8);
        soft.upload(&fbo, &[10, 20, 30, 11, 21, 31]).unwrap();

        let channel = &ring.channels()[0];
        engine.transfer_channel(channel, 1, &fbo, stamp(1)).unwrap();
        assert_eq!(channel.slot(1).state(), SlotState::Mapped);
        engine.complete_transfer(channel, 1).unwrap();
        assert_eq!(output_of(&ring, 1), vec![20, 10, 30, 11]);
    }

    #[test]
    fn test_pbo_exhaustion_falls_back() {
        let (soft, ring, engine) = setup(
            SoftwareGpuConfig::default().with_max_pixel_buffers(2),
            TransferMethod::Pbo,
            Resolution::new(4, 4),
            DataFormat::Rgba8,
        );
        assert_eq!(engine.method(), TransferMethod::ReadPixels);
        assert_eq!(soft.live_pixel_buffers(), 0);

        let fbo = soft.create_framebuffer(Resolution::new(4, 4), DataFormat::Rgba8);
        soft.fill(&fbo, 7).unwrap();
        let channel = &ring.channels()[0];
        engine.transfer_channel(channel, 0, &fbo, stamp(0)).unwrap();
        engine.complete_transfer(channel, 0).unwrap();
        assert_eq!(output_of(&ring, 0), vec![7; 64]);
    }

    #[test]
    fn test_dropped_fence_marks_frame_failed() {
        let (soft, ring, engine) = setup(
            SoftwareGpuConfig::default(),
            TransferMethod::Pbo,
            Resolution::new(2, 2),
            DataFormat::Rgba8,
        );
        soft.fail_fence(0);
        let fbo = soft.create_framebuffer(Resolution::new(2, 2), DataFormat::Rgba8);
        let channel = &ring.channels()[0];
        engine.transfer_channel(channel, 0, &fbo, stamp(0)).unwrap();
        assert_eq!(engine.complete_transfer(channel, 0).unwrap(), TransferOutcome::Failed);
        let status = channel.slot(0).lock_state("test");
        assert_eq!(status.state(), SlotState::Ready);
        assert!(status.failed);
    }

    #[test]
    fn test_fence_retries_exhausted_is_fatal() {
        let (soft, ring, engine) = setup(
            SoftwareGpuConfig::default(),
            TransferMethod::Pbo,
            Resolution::new(2, 2),
            DataFormat::Rgba8,
        );
        soft.stall_fence(0, Duration::from_secs(10));
        let fbo = soft.create_framebuffer(Resolution::new(2, 2), DataFormat::Rgba8);
        let channel = &ring.channels()[0];
        engine.transfer_channel(channel, 0, &fbo, stamp(0)).unwrap();
        let err = engine.complete_transfer(channel, 0).unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(engine.counters.fence_timeouts.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn test_mismatched_framebuffer_is_transient() {
        let (soft, ring, engine) = setup(
            SoftwareGpuConfig::default(),
            TransferMethod::Pbo,
            Resolution::new(2, 2),
            DataFormat::Rgba8,
        );
        let fbo = soft.create_framebuffer(Resolution::new(4, 2), DataFormat::Rgba8);
        let channel = &ring.channels()[0];
        engine.transfer_channel(channel, 0, &fbo, stamp(0)).unwrap();
        assert_eq!(engine.complete_transfer(channel, 0).unwrap(), TransferOutcome::Failed);
    }

    #[test]
    fn test_lost_context_is_fatal() {
        let (soft, ring, engine) = setup(
            SoftwareGpuConfig::default(),
            TransferMethod::Pbo,
            Resolution::new(2, 2),
            DataFormat::Rgba8,
        );
        let fbo = soft.create_framebuffer(Resolution::new(2, 2), DataFormat::Rgba8);
        soft.lose_context();
        let err = engine
            .transfer_channel(&ring.channels()[0], 0, &fbo, stamp(0))
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_backpressure_wait_times_out() {
        let (soft, ring, engine) = setup(
            SoftwareGpuConfig::default(),
            TransferMethod::Pbo,
            Resolution::new(2, 2),
            DataFormat::Rgba8,
        );
        let fbo = soft.create_framebuffer(Resolution::new(2, 2), DataFormat::Rgba8);
        let channel = &ring.channels()[0];
        let stop = AtomicBool::new(false);

        assert!(!engine
            .finalize_outstanding_transfer(channel, 0, ring.signal(), &stop)
            .unwrap());
        engine.transfer_channel(channel, 0, &fbo, stamp(0)).unwrap();
        let err = engine
            .finalize_outstanding_transfer(channel, 0, ring.signal(), &stop)
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));

        stop.store(true, Ordering::Release);
        assert!(matches!(
            engine.finalize_outstanding_transfer(channel, 0, ring.signal(), &stop),
            Err(Error::DeviceNotOpen)
        ));
    }
}
