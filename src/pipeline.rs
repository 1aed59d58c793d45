//! Output pipeline
//!
//! Connects render thread → transfer thread → output dispatch for one
//! layout. A layout change tears the pipeline down and builds a new one.

use crate::audio::AudioStage;
use crate::config::{Pacing, TransferMethod};
use crate::error::{Error, Result};
use crate::formats::{DataFormatSpec, VideoFormat};
use crate::gpu::{FramebufferRef, GpuBackend};
use crate::output::{
    DispatchCore, FrameWriter, OutputSink, ScheduledDispatch, ScheduledOutput, WriterDispatch,
};
use crate::profile::Profiler;
use crate::ring::Ring;
use crate::transfer::{
    spawn_transfer_thread, FrameReadyHook, PendingTransfer, TransferEngine, TransferQueue,
    TransferWorker, WaitBounds,
};
use crate::types::{Counters, FrameLayout, FrameStamp};

use crossbeam_channel::Sender;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Stop flag plus the first fatal error seen by any pipeline thread
#[derive(Debug, Default)]
pub struct PipelineControl {
    stop: AtomicBool,
    fault: Mutex<Option<String>>,
}

impl PipelineControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn is_stopping(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    pub fn stop_flag(&self) -> &AtomicBool {
        &self.stop
    }

    /// Record a fatal error and stop the pipeline; the first reason wins
    pub fn fail(&self, reason: impl Into<String>) {
        let mut fault = self.fault.lock();
        if fault.is_none() {
            *fault = Some(reason.into());
        }
        self.request_stop();
    }

    pub fn fault(&self) -> Option<String> {
        self.fault.lock().clone()
    }
}

/// Everything needed to build a pipeline for one layout
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub name: String,
    pub video: VideoFormat,
    pub data: DataFormatSpec,
    pub layout: FrameLayout,
    pub stereo: bool,
    pub depth: usize,
    pub method: TransferMethod,
    pub bounds: WaitBounds,
    pub pacing: Pacing,
    pub latency_frames: f64,
    pub preroll: usize,
    pub drain_timeout: Duration,
    pub verbose: bool,
    pub profile: bool,
    pub profile_csv: Option<PathBuf>,
}

enum Dispatcher {
    Writer {
        stop: Sender<()>,
        handle: JoinHandle<Box<dyn FrameWriter>>,
    },
    Scheduled {
        dispatch: Arc<ScheduledDispatch>,
        card: Arc<dyn ScheduledOutput>,
    },
}

/// Running threads and ring of an open device
pub struct Pipeline {
    settings: PipelineSettings,
    gpu: Arc<dyn GpuBackend>,
    ring: Arc<Ring>,
    engine: Arc<TransferEngine>,
    queue: Arc<TransferQueue>,
    control: Arc<PipelineControl>,
    counters: Arc<Counters>,
    profiler: Option<Arc<Profiler>>,
    transfer: Option<JoinHandle<()>>,
    dispatcher: Option<Dispatcher>,
}

impl Pipeline {
    /// Allocate the ring and start the transfer and output threads
    pub fn start(
        gpu: Arc<dyn GpuBackend>,
        settings: PipelineSettings,
        sink: OutputSink,
        audio: Arc<AudioStage>,
        counters: Arc<Counters>,
    ) -> Result<Self> {
        let ring = Arc::new(Ring::new(
            settings.layout,
            settings.depth,
            settings.stereo,
            settings.verbose,
        ));
        let profiler = settings.profile.then(|| Arc::new(Profiler::new()));

        let mut engine = TransferEngine::new(
            gpu.clone(),
            settings.layout,
            settings.method,
            settings.bounds,
            counters.clone(),
        )
        .with_profiler(profiler.clone());
        engine.prepare(&ring)?;
        let engine = Arc::new(engine);

        let core = Arc::new(DispatchCore::new(
            ring.clone(),
            counters.clone(),
            audio,
            profiler.clone(),
        ));
        let (dispatcher, on_frame_ready) = match sink {
            OutputSink::Writer(writer) => {
                let (stop, stop_rx) = crossbeam_channel::bounded(1);
                let handle = WriterDispatch::new(
                    core,
                    writer,
                    settings.pacing,
                    settings.video.rate,
                    settings.latency_frames,
                    settings.bounds.poll_interval,
                    stop_rx,
                )
                .spawn()?;
                (Dispatcher::Writer { stop, handle }, None)
            }
            OutputSink::Scheduled(card) => {
                let dispatch = Arc::new(ScheduledDispatch::new(
                    core,
                    card.clone(),
                    settings.video.rate,
                    settings.preroll,
                ));
                card.enable(&settings.video, &settings.data, dispatch.clone())?;
                let hook_target = dispatch.clone();
                let hook: FrameReadyHook = Arc::new(move || hook_target.on_frame_ready());
                (Dispatcher::Scheduled { dispatch, card }, Some(hook))
            }
        };

        let queue = Arc::new(TransferQueue::new());
        let control = Arc::new(PipelineControl::new());
        let mut pipeline = Self {
            settings,
            gpu,
            ring,
            engine,
            queue,
            control,
            counters,
            profiler,
            transfer: None,
            dispatcher: Some(dispatcher),
        };

        let worker = TransferWorker {
            engine: pipeline.engine.clone(),
            ring: pipeline.ring.clone(),
            queue: pipeline.queue.clone(),
            control: pipeline.control.clone(),
            counters: pipeline.counters.clone(),
            on_frame_ready,
            poll_interval: pipeline.settings.bounds.poll_interval,
            drain_timeout: pipeline.settings.drain_timeout,
        };
        match spawn_transfer_thread(worker) {
            Ok(handle) => pipeline.transfer = Some(handle),
            Err(e) => {
                let _ = pipeline.shutdown();
                return Err(e);
            }
        }

        tracing::info!(
            "{}: pipeline started ({} {}, {} slots, {}, {})",
            pipeline.settings.name,
            pipeline.settings.layout.resolution(),
            pipeline.settings.layout.format,
            pipeline.settings.depth,
            if pipeline.settings.stereo { "stereo" } else { "mono" },
            pipeline.engine.method()
        );
        Ok(pipeline)
    }

    pub fn ring(&self) -> &Ring {
        &self.ring
    }

    pub fn control(&self) -> &Arc<PipelineControl> {
        &self.control
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Method in effect after any fallback
    pub fn method(&self) -> TransferMethod {
        self.engine.method()
    }

    /// Whether the next `submit` has to wait for a slot
    pub fn will_block(&self) -> bool {
        let next = self.ring.slot_index(self.ring.cursor().write());
        !self.ring.is_free(next)
    }

    fn fatal(&self) -> Error {
        Error::DeviceClosedUnexpectedly(self.control.fault().unwrap_or_else(|| "pipeline stopped".into()))
    }

    /// Start reading back one frame, one framebuffer per channel
    ///
    /// Blocks only while the slot it needs is still in use.
    pub fn submit(&self, fbos: &[FramebufferRef], time: f64) -> Result<()> {
        if self.control.fault().is_some() {
            return Err(self.fatal());
        }
        if self.control.is_stopping() {
            return Err(Error::DeviceNotOpen);
        }
        debug_assert_eq!(fbos.len(), self.ring.channels().len());

        let sequence = self.ring.cursor().write();
        let index = self.ring.slot_index(sequence);
        let _scope = self.engine.start_gpu_transfer();

        let mut waited = false;
        for channel in self.ring.channels() {
            match self.engine.finalize_outstanding_transfer(
                channel,
                index,
                self.ring.signal(),
                self.control.stop_flag(),
            ) {
                Ok(w) => waited |= w,
                Err(Error::Timeout(reason)) => {
                    tracing::error!("{}: {}", self.settings.name, reason);
                    self.control.fail(reason);
                    return Err(self.fatal());
                }
                Err(_) if self.control.fault().is_some() => return Err(self.fatal()),
                Err(e) => return Err(e),
            }
        }
        if waited {
            Counters::bump(&self.counters.backpressure_waits);
        }

        let stamp = FrameStamp { sequence, time };
        for (channel, fbo) in self.ring.channels().iter().zip(fbos) {
            if let Err(e) = self.engine.transfer_channel(channel, index, fbo, stamp) {
                tracing::error!("{}: frame {} readback failed: {}", self.settings.name, sequence, e);
                self.control.fail(e.to_string());
                return Err(self.fatal());
            }
        }

        self.ring.cursor().advance_write();
        self.queue.push(PendingTransfer { sequence, index });
        Counters::bump(&self.counters.frames_submitted);
        Ok(())
    }

    /// Drain and stop every thread, then release GPU resources
    ///
    /// Hands the sink back so the device can reuse it for a new layout.
    pub fn shutdown(mut self) -> (Result<()>, Option<OutputSink>) {
        self.control.request_stop();
        self.queue.wake();
        self.ring.signal().notify();

        let mut result = Ok(());
        if let Some(handle) = self.transfer.take() {
            if handle.join().is_err() {
                tracing::error!("{}: transfer thread panicked", self.settings.name);
                self.control.fail("transfer thread panicked");
            }
        }

        let sink = match self.dispatcher.take() {
            Some(Dispatcher::Writer { stop, handle }) => {
                let _ = stop.send(());
                match handle.join() {
                    Ok(mut writer) => {
                        if let Err(e) = writer.finish() {
                            tracing::error!("{}: finishing writer failed: {}", writer.name(), e);
                            result = Err(e);
                        }
                        Some(OutputSink::Writer(writer))
                    }
                    Err(_) => {
                        tracing::error!("{}: output thread panicked", self.settings.name);
                        self.control.fail("output thread panicked");
                        None
                    }
                }
            }
            Some(Dispatcher::Scheduled { dispatch, card }) => {
                if self.control.fault().is_none()
                    && !dispatch.drain(self.settings.drain_timeout, self.settings.bounds.poll_interval)
                {
                    tracing::error!(
                        "{}: playout drain timed out after {:?}",
                        self.settings.name,
                        self.settings.drain_timeout
                    );
                }
                dispatch.stop();
                Some(OutputSink::Scheduled(card))
            }
            None => None,
        };

        self.release_gpu_resources();

        if let Some(profiler) = &self.profiler {
            profiler.log_summary(&self.settings.name);
            if let Some(path) = &self.settings.profile_csv {
                if let Err(e) = profiler.write_csv(path) {
                    tracing::warn!("Writing profile to {} failed: {}", path.display(), e);
                }
            }
        }

        if let Some(reason) = self.control.fault() {
            result = Err(Error::DeviceClosedUnexpectedly(reason));
        }
        tracing::info!("{}: pipeline stopped", self.settings.name);
        (result, sink)
    }

    /// Return borrowed framebuffers and drop every fence, mapping and PBO
    fn release_gpu_resources(&self) {
        for channel in self.ring.channels() {
            for slot in channel.slots() {
                let fbo = slot.lock_state("teardown").fbo.take();
                if let Some(fbo) = fbo {
                    self.gpu.end_external_readback(&fbo);
                }
            }
        }
        self.ring.reset();
        self.ring.release_gpu_resources();
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if self.transfer.is_some() || self.dispatcher.is_some() {
            self.control.request_stop();
            self.queue.wake();
            if let Some(handle) = self.transfer.take() {
                let _ = handle.join();
            }
            match self.dispatcher.take() {
                Some(Dispatcher::Writer { stop, handle }) => {
                    let _ = stop.send(());
                    let _ = handle.join();
                }
                Some(Dispatcher::Scheduled { dispatch, .. }) => dispatch.stop(),
                None => {}
            }
            self.release_gpu_resources();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WriteRequest;
    use crate::output::{MemoryWriter, OutputFrame, StreamInfo};
    use crate::gpu::{SoftwareGpu, SoftwareGpuConfig};
    use crate::types::{DataFormat, Framerate, Resolution};
    use std::sync::atomic::AtomicU64;

    /// Writer whose per-frame cost varies with the sequence number
    struct JitterWriter {
        inner: MemoryWriter,
    }

    impl FrameWriter for JitterWriter {
        fn name(&self) -> &str {
            "jitter"
        }

        fn open(&mut self, info: &StreamInfo, request: &WriteRequest) -> Result<()> {
            self.inner.open(info, request)
        }

        fn write(&mut self, frame: &OutputFrame) -> Result<()> {
            let pause = (frame.sequence.wrapping_mul(7919) >> 3) % 3;
            std::thread::sleep(Duration::from_micros(pause * 700));
            self.inner.write(frame)
        }

        fn finish(&mut self) -> Result<()> {
            self.inner.finish()
        }

        fn frames_written(&self) -> u64 {
            self.inner.frames_written()
        }
    }

    fn settings(resolution: Resolution, depth: usize) -> PipelineSettings {
        let video = VideoFormat::new(resolution, Framerate::FPS_24, "test");
        let data = DataFormatSpec::new(DataFormat::Rgba8, "RGBA8 Stereo");
        PipelineSettings {
            name: "test".into(),
            video,
            data,
            layout: FrameLayout::new(resolution, DataFormat::Rgba8, 4),
            stereo: true,
            depth,
            method: TransferMethod::Pbo,
            bounds: WaitBounds {
                fence_timeout: Duration::from_millis(50),
                fence_retries: 10,
                poll_interval: Duration::from_millis(1),
                backpressure_timeout: Duration::from_secs(2),
            },
            pacing: Pacing::Unpaced,
            latency_frames: 0.5,
            preroll: 1,
            drain_timeout: Duration::from_secs(2),
            verbose: false,
            profile: false,
            profile_csv: None,
        }
    }

    #[test]
    fn test_ring_bounds_hold_under_load() {
        const FRAMES: u64 = 120;
        const DEPTH: usize = 3;

        let soft = Arc::new(SoftwareGpu::new(
            SoftwareGpuConfig::default().with_fence_latency(Duration::from_micros(500)),
        ));
        let resolution = Resolution::new(8, 4);
        let left = soft.create_framebuffer(resolution, DataFormat::Rgba8);
        let right = soft.create_framebuffer(resolution, DataFormat::Rgba8);
        soft.fill(&left, 1).unwrap();
        soft.fill(&right, 2).unwrap();

        let (writer, capture) = MemoryWriter::new();
        let counters = Arc::new(Counters::default());
        let pipeline = Pipeline::start(
            soft.clone(),
            settings(resolution, DEPTH),
            OutputSink::Writer(Box::new(JitterWriter { inner: writer })),
            Arc::new(AudioStage::new()),
            counters.clone(),
        )
        .unwrap();

        let done = AtomicBool::new(false);
        let violations = AtomicU64::new(0);
        std::thread::scope(|scope| {
            scope.spawn(|| {
                let cursor = pipeline.ring().cursor();
                while !done.load(Ordering::Acquire) {
                    let read = cursor.read();
                    let ready = cursor.ready();
                    let write = cursor.write();
                    let read_after = cursor.read();
                    if read > ready || ready > write || write > read_after + DEPTH as u64 {
                        violations.fetch_add(1, Ordering::Relaxed);
                    }
                    std::thread::yield_now();
                }
            });

            for frame in 0..FRAMES {
                pipeline.submit(&[left, right], frame as f64 / 24.0).unwrap();
                if frame % 7 == 0 {
                    std::thread::sleep(Duration::from_micros(300));
                }
            }
            done.store(true, Ordering::Release);
        });

        let (result, sink) = pipeline.shutdown();
        result.unwrap();
        assert!(sink.is_some());
        assert_eq!(violations.load(Ordering::Relaxed), 0);

        let sequences = capture.sequences();
        assert_eq!(sequences, (0..FRAMES).collect::<Vec<_>>());
        assert!(capture.frames().iter().all(|f| f.eyes.len() == 2
            && f.eyes[0].first() == Some(&1)
            && f.eyes[1].first() == Some(&2)));
        assert!(capture.is_finished());

        let stats = counters.snapshot();
        assert_eq!(stats.frames_submitted, FRAMES);
        assert_eq!(stats.frames_transferred, FRAMES);
        assert!(stats.backpressure_waits > 0);
        assert_eq!(soft.live_fences(), 0);
        assert_eq!(soft.live_pixel_buffers(), 0);
    }
}
