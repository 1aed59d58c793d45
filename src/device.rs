//! Output device
//!
//! The render thread's view of an output: open it with option tokens, hand
//! it one framebuffer per eye each frame, close it. Format switches and
//! lifecycle changes take the device write lock, transfers the read lock,
//! so a reconfiguration always sees a drained pipeline.

use crate::audio::AudioStage;
use crate::config::{
    DeviceConfig, DeviceOptions, TransferMethod, DEFAULT_PLAYOUT_RING_SIZE,
    DEFAULT_WRITER_RING_SIZE,
};
use crate::error::{Error, Result};
use crate::formats::{
    self, audio_frame_size_sequence, AudioFormat, DataFormatSpec, FormatCatalog, SyncMode,
    SyncSource, VideoFormat,
};
use crate::gpu::{FramebufferRef, GpuBackend};
use crate::output::{OutputSink, ScheduledOutput, StreamInfo, WriterFactory};
use crate::pipeline::{Pipeline, PipelineControl, PipelineSettings};
use crate::transfer::WaitBounds;
use crate::types::{Counters, DataFormat, FrameLayout, Framerate, Resolution, Stats};

use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Module name used in device IDs when none is set
pub const DEFAULT_MODULE_NAME: &str = "framelink";

/// Raster of a writer device opened without `--size`
const DEFAULT_WRITER_RESOLUTION: Resolution = Resolution::FHD_1080P;

/// Lifecycle of a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceStatus {
    Closed,
    Opening,
    Open,
    Closing,
    /// A fatal error was seen; only `close` is accepted
    Failed(String),
}

impl std::fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceStatus::Closed => write!(f, "closed"),
            DeviceStatus::Opening => write!(f, "opening"),
            DeviceStatus::Open => write!(f, "open"),
            DeviceStatus::Closing => write!(f, "closing"),
            DeviceStatus::Failed(reason) => write!(f, "failed ({})", reason),
        }
    }
}

/// What a device can do, as a bit set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Capabilities(u32);

impl Capabilities {
    pub const IMAGE_OUTPUT: Self = Self(1 << 0);
    pub const IMAGE_CAPTURE: Self = Self(1 << 1);
    pub const PROVIDES_SYNC: Self = Self(1 << 2);
    pub const FIXED_RESOLUTION: Self = Self(1 << 3);
    pub const SUB_WINDOW: Self = Self(1 << 4);
    pub const CLOCK: Self = Self(1 << 5);
    pub const AUDIO_OUTPUT: Self = Self(1 << 6);
    pub const AUDIO_CAPTURE: Self = Self(1 << 7);
    pub const TIME_CODE_OUTPUT: Self = Self(1 << 8);
    pub const BLOCKING_TRANSFER: Self = Self(1 << 9);
    pub const ASYNC_READBACK: Self = Self(1 << 10);
    pub const FLIPPED_IMAGE: Self = Self(1 << 11);
    pub const NORMALIZED_COORDINATES: Self = Self(1 << 12);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for Capabilities {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for Capabilities {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Which parts of the configuration a device ID covers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum IdType {
    #[default]
    HostnameVideoAndDataFormat,
    VideoAndDataFormat,
    VideoFormat,
    DataFormat,
    DeviceName,
    ModuleName,
}

/// Where finished frames go
enum DeviceKind {
    /// Software movie writer, created from `--output` at open
    Writer(Arc<dyn WriterFactory>),
    /// Hardware playout card
    Playout(Arc<dyn ScheduledOutput>),
}

impl DeviceKind {
    fn default_ring_size(&self) -> usize {
        match self {
            DeviceKind::Writer(_) => DEFAULT_WRITER_RING_SIZE,
            DeviceKind::Playout(_) => DEFAULT_PLAYOUT_RING_SIZE,
        }
    }
}

/// Current catalog indices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct Selection {
    video: usize,
    data: usize,
    sync_mode: usize,
    sync_source: usize,
    audio: usize,
}

struct DeviceState {
    status: DeviceStatus,
    catalog: FormatCatalog,
    selection: Selection,
    options: Option<DeviceOptions>,
    pipeline: Option<Pipeline>,
    counters: Arc<Counters>,
    /// Samples per frame for the current audio format and rate
    audio_sequence: Vec<usize>,
    fixed_latency: f64,
    frame_latency: f64,
}

/// A video output reached from the render thread
pub struct OutputDevice {
    name: String,
    module: String,
    kind: DeviceKind,
    gpu: Arc<dyn GpuBackend>,
    config: DeviceConfig,
    state: RwLock<DeviceState>,
    /// Stop handle of the running pipeline, reachable without the device lock
    control: Mutex<Option<Arc<PipelineControl>>>,
    audio: Arc<AudioStage>,
    frame_count: AtomicU64,
    mono_warned: AtomicBool,
}

impl OutputDevice {
    /// Device that feeds movie writers created by `factory`
    pub fn new_writer(
        name: impl Into<String>,
        gpu: Arc<dyn GpuBackend>,
        factory: Arc<dyn WriterFactory>,
        config: DeviceConfig,
    ) -> Self {
        let catalog = FormatCatalog::for_writer(
            writer_video_format(DEFAULT_WRITER_RESOLUTION, Framerate::FPS_24, 1.0),
            false,
        );
        let data = catalog
            .data_formats
            .iter()
            .position(|d| d.format == DataFormat::Rgba8)
            .unwrap_or(0);
        let selection = Selection {
            data,
            ..Selection::default()
        };
        Self::new(name, DeviceKind::Writer(factory), gpu, catalog, selection, config)
    }

    /// Device driving a playout card
    pub fn new_playout(
        name: impl Into<String>,
        gpu: Arc<dyn GpuBackend>,
        card: Arc<dyn ScheduledOutput>,
        config: DeviceConfig,
    ) -> Self {
        let catalog = card.catalog();
        Self::new(
            name,
            DeviceKind::Playout(card),
            gpu,
            catalog,
            Selection::default(),
            config,
        )
    }

    fn new(
        name: impl Into<String>,
        kind: DeviceKind,
        gpu: Arc<dyn GpuBackend>,
        catalog: FormatCatalog,
        selection: Selection,
        config: DeviceConfig,
    ) -> Self {
        let audio_sequence = audio_sequence_for(&catalog, &selection);
        Self {
            name: name.into(),
            module: DEFAULT_MODULE_NAME.to_string(),
            kind,
            gpu,
            config,
            state: RwLock::new(DeviceState {
                status: DeviceStatus::Closed,
                catalog,
                selection,
                options: None,
                pipeline: None,
                counters: Arc::new(Counters::default()),
                audio_sequence,
                fixed_latency: 0.0,
                frame_latency: 0.0,
            }),
            control: Mutex::new(None),
            audio: Arc::new(AudioStage::new()),
            frame_count: AtomicU64::new(0),
            mono_warned: AtomicBool::new(false),
        }
    }

    /// Name of the module owning this device, used in IDs
    pub fn with_module(mut self, module: impl Into<String>) -> Self {
        self.module = module.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn module_name(&self) -> &str {
        &self.module
    }

    pub fn is_playout(&self) -> bool {
        matches!(self.kind, DeviceKind::Playout(_))
    }

    // ----------------------------------------------------------------------
    // Lifecycle
    // ----------------------------------------------------------------------

    /// Open the device with option tokens
    ///
    /// On error the device stays closed and keeps its previous selection.
    pub fn open<S: AsRef<str>>(&self, tokens: &[S]) -> Result<()> {
        let mut state = self.state.write();
        if state.status != DeviceStatus::Closed {
            return Err(Error::DeviceAlreadyOpen);
        }
        state.status = DeviceStatus::Opening;
        tracing::info!("Opening output device: {}", self.name);

        match self.open_locked(&mut state, tokens) {
            Ok(()) => {
                state.status = DeviceStatus::Open;
                tracing::info!(
                    "{}: open ({} / {})",
                    self.name,
                    describe(state.catalog.video_formats.get(state.selection.video)),
                    state
                        .catalog
                        .data_formats
                        .get(state.selection.data)
                        .map_or("none", |d| d.description.as_str())
                );
                Ok(())
            }
            Err(e) => {
                tracing::error!("{}: open failed: {}", self.name, e);
                state.status = DeviceStatus::Closed;
                Err(e)
            }
        }
    }

    fn open_locked<S: AsRef<str>>(&self, state: &mut DeviceState, tokens: &[S]) -> Result<()> {
        let options = DeviceOptions::parse(tokens, self.config.clone())?;

        let catalog = match &self.kind {
            DeviceKind::Writer(_) => FormatCatalog::for_writer(
                writer_video_format(
                    options.resolution.unwrap_or(DEFAULT_WRITER_RESOLUTION),
                    options.rate.unwrap_or(Framerate::FPS_24),
                    options.request.pixel_aspect,
                ),
                options.stereo,
            ),
            DeviceKind::Playout(card) => card.catalog(),
        };
        let current_format = state
            .catalog
            .data_formats
            .get(state.selection.data)
            .map(|d| d.format);
        let selection = self.select(&catalog, &options, state.selection, current_format)?;

        let counters = Arc::new(Counters::default());
        let pipeline = self.start_pipeline(&catalog, selection, &options, None, counters.clone())?;

        *self.control.lock() = Some(pipeline.control().clone());
        state.audio_sequence = audio_sequence_for(&catalog, &selection);
        state.catalog = catalog;
        state.selection = selection;
        state.options = Some(options);
        state.pipeline = Some(pipeline);
        state.counters = counters;
        self.frame_count.store(0, Ordering::Release);
        self.mono_warned.store(false, Ordering::Relaxed);
        Ok(())
    }

    /// Pick catalog indices from the options, falling back to `current`
    fn select(
        &self,
        catalog: &FormatCatalog,
        options: &DeviceOptions,
        current: Selection,
        current_format: Option<DataFormat>,
    ) -> Result<Selection> {
        let indices = &options.indices;
        let mut selection = current;

        match &self.kind {
            DeviceKind::Writer(_) => {
                selection.video = indices.video.unwrap_or(0);
                selection.data = match indices.data {
                    Some(index) => index,
                    None => {
                        let wanted = options
                            .data_format
                            .or(current_format)
                            .unwrap_or(DataFormat::Rgba8);
                        catalog
                            .data_formats
                            .iter()
                            .position(|d| d.format == wanted)
                            .unwrap_or(0)
                    }
                };
            }
            DeviceKind::Playout(_) => {
                if let Some(index) = indices.video {
                    selection.video = index;
                } else if options.resolution.is_some() || options.rate.is_some() {
                    selection.video = catalog
                        .video_formats
                        .iter()
                        .position(|v| {
                            options.resolution.map_or(true, |r| r == v.resolution)
                                && options.rate.map_or(true, |r| r == v.rate)
                        })
                        .ok_or_else(|| {
                            Error::Config(format!(
                                "{} has no video format matching the requested size and rate",
                                self.name
                            ))
                        })?;
                }
                if let Some(index) = indices.data {
                    selection.data = index;
                } else if options.data_format.is_some() || options.stereo {
                    selection.data = catalog
                        .data_formats
                        .iter()
                        .position(|d| {
                            options.data_format.map_or(true, |f| f == d.format)
                                && d.is_stereo() == options.stereo
                        })
                        .ok_or_else(|| {
                            Error::Config(format!(
                                "{} has no data format matching the requested layout",
                                self.name
                            ))
                        })?;
                }
            }
        }
        if let Some(index) = indices.sync_mode {
            selection.sync_mode = index;
        }
        if let Some(index) = indices.sync_source {
            selection.sync_source = index;
        }
        if let Some(index) = indices.audio {
            selection.audio = index;
        }

        validate_selection(catalog, &selection, indices.sync_mode, indices.sync_source, indices.audio)?;
        Ok(selection)
    }

    fn start_pipeline(
        &self,
        catalog: &FormatCatalog,
        selection: Selection,
        options: &DeviceOptions,
        previous: Option<OutputSink>,
        counters: Arc<Counters>,
    ) -> Result<Pipeline> {
        let video = catalog
            .video_formats
            .get(selection.video)
            .cloned()
            .ok_or(Error::InvalidVideoFormat(selection.video))?;
        let data = catalog
            .data_formats
            .get(selection.data)
            .cloned()
            .ok_or(Error::InvalidDataFormat(selection.data))?;
        let config = &options.config;
        let stereo = data.is_stereo();
        let layout = FrameLayout::new(video.resolution, data.format, self.gpu.pack_alignment());
        let depth = config
            .ring_buffer_size
            .unwrap_or_else(|| self.kind.default_ring_size());

        let sink = match &self.kind {
            DeviceKind::Writer(factory) => {
                let mut writer = match previous {
                    Some(OutputSink::Writer(writer)) => writer,
                    _ => factory.create(options.output.as_deref().unwrap_or(""))?,
                };
                let info = StreamInfo {
                    resolution: video.resolution,
                    rate: video.rate,
                    format: data.format,
                    pixel_aspect: video.pixel_aspect,
                    stereo,
                    row_bytes: layout.output_row_bytes,
                    frame_bytes: layout.buffer_size_bytes(),
                    frame_start: options.frame_start,
                    frame_end: options.frame_end,
                    chapters: options.chapters.clone(),
                    audio: options
                        .request
                        .has_audio
                        .then(|| catalog.audio_formats.get(selection.audio).cloned())
                        .flatten(),
                };
                writer.open(&info, &options.request)?;
                OutputSink::Writer(writer)
            }
            DeviceKind::Playout(card) => OutputSink::Scheduled(card.clone()),
        };

        let settings = PipelineSettings {
            name: self.name.clone(),
            video,
            data,
            layout,
            stereo,
            depth,
            method: config.method,
            bounds: WaitBounds::from(config),
            pacing: config.pacing,
            latency_frames: config.output_latency_frames,
            preroll: config.preroll_frames.min(depth.saturating_sub(1)).max(1),
            drain_timeout: Duration::from_millis(config.drain_timeout_ms),
            verbose: config.verbose,
            profile: config.profile,
            profile_csv: config.profile_csv.clone(),
        };
        Pipeline::start(self.gpu.clone(), settings, sink, self.audio.clone(), counters)
    }

    /// Drain and stop the device
    ///
    /// Closing a closed device does nothing. A device that failed is torn
    /// down and reports why.
    pub fn close(&self) -> Result<()> {
        if let Some(control) = self.control.lock().clone() {
            control.request_stop();
        }

        let mut state = self.state.write();
        let failed = match &state.status {
            DeviceStatus::Closed => return Ok(()),
            DeviceStatus::Failed(reason) => Some(reason.clone()),
            _ => None,
        };
        state.status = DeviceStatus::Closing;
        tracing::info!("Closing output device: {}", self.name);

        let result = match state.pipeline.take() {
            Some(pipeline) => pipeline.shutdown().0,
            None => Ok(()),
        };
        *self.control.lock() = None;
        state.options = None;
        state.status = DeviceStatus::Closed;

        let stats = state.counters.snapshot();
        tracing::info!(
            "{}: closed ({} submitted, {} output, {} repeated, {} failed)",
            self.name,
            stats.frames_submitted,
            stats.frames_output,
            stats.frames_repeated,
            stats.frames_failed
        );

        match failed {
            Some(reason) => Err(Error::DeviceClosedUnexpectedly(reason)),
            None => result,
        }
    }

    fn mark_failed(&self, reason: &str) {
        let mut state = self.state.write();
        if state.status == DeviceStatus::Open {
            tracing::error!("{}: device failed: {}", self.name, reason);
            state.status = DeviceStatus::Failed(reason.to_string());
        }
    }

    // ----------------------------------------------------------------------
    // Render thread
    // ----------------------------------------------------------------------

    /// Output one frame; stereo devices show it to both eyes
    pub fn transfer(&self, fbo: &FramebufferRef) -> Result<()> {
        self.submit(fbo, None)
    }

    /// Output one frame per eye; mono devices use the left eye only
    pub fn transfer2(&self, left: &FramebufferRef, right: &FramebufferRef) -> Result<()> {
        self.submit(left, Some(right))
    }

    fn submit(&self, left: &FramebufferRef, right: Option<&FramebufferRef>) -> Result<()> {
        let result = {
            let state = self.state.read();
            let pipeline = match (&state.status, state.pipeline.as_ref()) {
                (DeviceStatus::Open, Some(pipeline)) => pipeline,
                (DeviceStatus::Failed(reason), _) => {
                    return Err(Error::DeviceClosedUnexpectedly(reason.clone()))
                }
                _ => return Err(Error::DeviceNotOpen),
            };

            let fbos = if pipeline.settings().stereo {
                vec![*left, *right.unwrap_or(left)]
            } else {
                if right.is_some() && !self.mono_warned.swap(true, Ordering::Relaxed) {
                    tracing::warn!(
                        "{}: stereo transfer on a mono device, right eye ignored",
                        self.name
                    );
                }
                vec![*left]
            };
            let frame = self.frame_count.load(Ordering::Acquire);
            pipeline.submit(&fbos, pipeline.settings().video.rate.time_of(frame))
        };

        match result {
            Ok(()) => {
                self.frame_count.fetch_add(1, Ordering::AcqRel);
                Ok(())
            }
            Err(Error::DeviceClosedUnexpectedly(reason)) => {
                self.mark_failed(&reason);
                Err(Error::DeviceClosedUnexpectedly(reason))
            }
            Err(e) => Err(e),
        }
    }

    /// Whether the next `transfer` would wait for a slot or for a reconfiguration
    pub fn will_block_on_transfer(&self) -> bool {
        match self.state.try_read() {
            Some(state) => state.pipeline.as_ref().is_some_and(|p| p.will_block()),
            None => true,
        }
    }

    /// Stage interleaved samples for the next frame
    ///
    /// Never blocks and never fails; samples sent while closed are dropped.
    pub fn transfer_audio(&self, interleaved: &[u8], sample_count: usize) {
        let state = self.state.read();
        if state.pipeline.is_none() {
            tracing::debug!("{}: audio while closed dropped", self.name);
            return;
        }
        let frame_bytes = state
            .catalog
            .audio_formats
            .get(state.selection.audio)
            .map_or(0, AudioFormat::frame_bytes);
        self.audio.submit(interleaved, sample_count, frame_bytes);
    }

    // ----------------------------------------------------------------------
    // Format selection
    // ----------------------------------------------------------------------

    /// Switch video format, rebuilding the pipeline when open
    pub fn set_video_format(&self, index: usize) -> Result<()> {
        let mut state = self.state.write();
        let video = state
            .catalog
            .video_formats
            .get(index)
            .ok_or(Error::InvalidVideoFormat(index))?;
        let stereo_data = state
            .catalog
            .data_formats
            .get(state.selection.data)
            .is_some_and(DataFormatSpec::is_stereo);
        if stereo_data && !video.stereo_capable {
            tracing::warn!(
                "{}: {} cannot carry the current stereo data format",
                self.name,
                video.description
            );
            return Err(Error::InvalidVideoFormat(index));
        }
        let selection = Selection {
            video: index,
            ..state.selection
        };
        self.apply_selection(&mut state, selection)
    }

    /// Switch data format, rebuilding the pipeline when open
    pub fn set_data_format(&self, index: usize) -> Result<()> {
        let mut state = self.state.write();
        let data = state
            .catalog
            .data_formats
            .get(index)
            .ok_or(Error::InvalidDataFormat(index))?;
        let capable = state
            .catalog
            .video_formats
            .get(state.selection.video)
            .is_some_and(|v| v.stereo_capable);
        if data.is_stereo() && !capable {
            tracing::warn!("{}: {} needs a stereo video format", self.name, data.description);
            return Err(Error::InvalidDataFormat(index));
        }
        let selection = Selection {
            data: index,
            ..state.selection
        };
        self.apply_selection(&mut state, selection)
    }

    pub fn set_sync_mode(&self, index: usize) -> Result<()> {
        let mut state = self.state.write();
        if index >= state.catalog.sync_modes.len() {
            return Err(Error::InvalidSyncMode(index));
        }
        state.selection.sync_mode = index;
        tracing::debug!("{}: sync mode {}", self.name, state.catalog.sync_modes[index].name);
        Ok(())
    }

    pub fn set_sync_source(&self, index: usize) -> Result<()> {
        let mut state = self.state.write();
        if index >= state.catalog.sync_sources.len() {
            return Err(Error::InvalidSyncSource(index));
        }
        state.selection.sync_source = index;
        tracing::debug!(
            "{}: sync source {}",
            self.name,
            state.catalog.sync_sources[index].name
        );
        Ok(())
    }

    /// Switch audio format; restarts the per-frame sample cadence
    pub fn set_audio_format(&self, index: usize) -> Result<()> {
        let mut state = self.state.write();
        if index >= state.catalog.audio_formats.len() {
            return Err(Error::InvalidAudioFormat(index));
        }
        state.selection.audio = index;
        state.audio_sequence = audio_sequence_for(&state.catalog, &state.selection);
        Ok(())
    }

    fn apply_selection(&self, state: &mut DeviceState, selection: Selection) -> Result<()> {
        if let DeviceStatus::Failed(reason) = &state.status {
            return Err(Error::DeviceClosedUnexpectedly(reason.clone()));
        }
        if selection == state.selection {
            return Ok(());
        }
        let (Some(pipeline), Some(options)) = (state.pipeline.take(), state.options.clone())
        else {
            state.selection = selection;
            state.audio_sequence = audio_sequence_for(&state.catalog, &selection);
            return Ok(());
        };

        tracing::info!(
            "{}: switching to {} / {}",
            self.name,
            describe(state.catalog.video_formats.get(selection.video)),
            state
                .catalog
                .data_formats
                .get(selection.data)
                .map_or("none", |d| d.description.as_str())
        );
        *self.control.lock() = None;
        let (result, sink) = pipeline.shutdown();
        match result {
            Err(Error::DeviceClosedUnexpectedly(reason)) => {
                state.status = DeviceStatus::Failed(reason.clone());
                return Err(Error::DeviceClosedUnexpectedly(reason));
            }
            Err(e) => tracing::warn!("{}: closing previous layout: {}", self.name, e),
            Ok(()) => {}
        }

        match self.start_pipeline(
            &state.catalog,
            selection,
            &options,
            sink,
            state.counters.clone(),
        ) {
            Ok(pipeline) => {
                *self.control.lock() = Some(pipeline.control().clone());
                state.pipeline = Some(pipeline);
                state.selection = selection;
                state.audio_sequence = audio_sequence_for(&state.catalog, &selection);
                Ok(())
            }
            Err(e) => {
                tracing::error!("{}: rebuilding pipeline failed: {}", self.name, e);
                state.status = DeviceStatus::Closed;
                state.options = None;
                Err(e)
            }
        }
    }

    // ----------------------------------------------------------------------
    // Catalog queries
    // ----------------------------------------------------------------------

    pub fn num_video_formats(&self) -> usize {
        self.state.read().catalog.video_formats.len()
    }

    pub fn video_format_at_index(&self, index: usize) -> Option<VideoFormat> {
        self.state.read().catalog.video_formats.get(index).cloned()
    }

    pub fn current_video_format(&self) -> usize {
        self.state.read().selection.video
    }

    pub fn num_data_formats(&self) -> usize {
        self.state.read().catalog.data_formats.len()
    }

    pub fn data_format_at_index(&self, index: usize) -> Option<DataFormatSpec> {
        self.state.read().catalog.data_formats.get(index).cloned()
    }

    pub fn current_data_format(&self) -> usize {
        self.state.read().selection.data
    }

    pub fn num_sync_modes(&self) -> usize {
        self.state.read().catalog.sync_modes.len()
    }

    pub fn sync_mode_at_index(&self, index: usize) -> Option<SyncMode> {
        self.state.read().catalog.sync_modes.get(index).cloned()
    }

    pub fn current_sync_mode(&self) -> usize {
        self.state.read().selection.sync_mode
    }

    pub fn num_sync_sources(&self) -> usize {
        self.state.read().catalog.sync_sources.len()
    }

    pub fn sync_source_at_index(&self, index: usize) -> Option<SyncSource> {
        self.state.read().catalog.sync_sources.get(index).cloned()
    }

    pub fn current_sync_source(&self) -> usize {
        self.state.read().selection.sync_source
    }

    pub fn num_audio_formats(&self) -> usize {
        self.state.read().catalog.audio_formats.len()
    }

    pub fn audio_format_at_index(&self, index: usize) -> Option<AudioFormat> {
        self.state.read().catalog.audio_formats.get(index).cloned()
    }

    pub fn current_audio_format(&self) -> usize {
        self.state.read().selection.audio
    }

    // ----------------------------------------------------------------------
    // Current signal
    // ----------------------------------------------------------------------

    /// Pixel format of the current data format
    pub fn format(&self) -> Option<DataFormat> {
        let state = self.state.read();
        state.catalog.data_formats.get(state.selection.data).map(|d| d.format)
    }

    pub fn resolution(&self) -> Option<Resolution> {
        let state = self.state.read();
        state
            .catalog
            .video_formats
            .get(state.selection.video)
            .map(|v| v.resolution)
    }

    /// Frame rate of the current video format
    pub fn timing(&self) -> Option<Framerate> {
        let state = self.state.read();
        state.catalog.video_formats.get(state.selection.video).map(|v| v.rate)
    }

    pub fn width(&self) -> u32 {
        self.resolution().map_or(0, |r| r.width)
    }

    pub fn height(&self) -> u32 {
        self.resolution().map_or(0, |r| r.height)
    }

    pub fn is_stereo(&self) -> bool {
        let state = self.state.read();
        state
            .catalog
            .data_formats
            .get(state.selection.data)
            .is_some_and(DataFormatSpec::is_stereo)
    }

    /// Stereo carried as two separate hardware streams
    pub fn is_dual_stereo(&self) -> bool {
        self.is_playout() && self.is_stereo()
    }

    pub fn is_open(&self) -> bool {
        self.state.read().status == DeviceStatus::Open
    }

    /// Lifecycle state; a pipeline fault shows up as `Failed` right away
    pub fn status(&self) -> DeviceStatus {
        let state = self.state.read();
        if state.status == DeviceStatus::Open {
            if let Some(reason) = state.pipeline.as_ref().and_then(|p| p.control().fault()) {
                return DeviceStatus::Failed(reason);
            }
        }
        state.status.clone()
    }

    /// Readback method in effect, after any fallback
    pub fn transfer_method(&self) -> Option<TransferMethod> {
        self.state.read().pipeline.as_ref().map(Pipeline::method)
    }

    pub fn capabilities(&self) -> Capabilities {
        let mut caps = Capabilities::IMAGE_OUTPUT
            | Capabilities::AUDIO_OUTPUT
            | Capabilities::BLOCKING_TRANSFER;
        let method = self.transfer_method().unwrap_or(self.config.method);
        if method == TransferMethod::Pbo && self.gpu.supports_pixel_buffers() {
            caps |= Capabilities::ASYNC_READBACK;
        }
        if self.is_playout() {
            caps |= Capabilities::FIXED_RESOLUTION | Capabilities::CLOCK | Capabilities::PROVIDES_SYNC;
        }
        caps
    }

    /// Frames that may be in flight at once
    pub fn async_max_mapped_buffers(&self) -> usize {
        let state = self.state.read();
        match &state.pipeline {
            Some(pipeline) => pipeline.ring().depth(),
            None => self
                .config
                .ring_buffer_size
                .unwrap_or_else(|| self.kind.default_ring_size()),
        }
    }

    pub fn stats(&self) -> Stats {
        self.state.read().counters.snapshot()
    }

    // ----------------------------------------------------------------------
    // Clock and latency
    // ----------------------------------------------------------------------

    fn hz(&self) -> f64 {
        self.timing().map_or(0.0, |r| r.as_f64())
    }

    /// Output time of the next frame, from the frame count alone
    pub fn output_time(&self) -> f64 {
        let hz = self.hz();
        if hz <= 0.0 {
            return 0.0;
        }
        self.frame_count.load(Ordering::Acquire) as f64 / hz
    }

    pub fn next_frame_time(&self) -> f64 {
        self.output_time()
    }

    /// Output devices have no input clock
    pub fn input_time(&self) -> f64 {
        0.0
    }

    pub fn next_frame(&self) -> u64 {
        self.frame_count.load(Ordering::Acquire)
    }

    pub fn reset_clock(&self) {
        self.frame_count.store(0, Ordering::Release);
    }

    /// Extra latency in seconds
    pub fn set_fixed_latency(&self, seconds: f64) {
        self.state.write().fixed_latency = seconds;
    }

    /// Extra latency in frames of the current format
    pub fn set_frame_latency(&self, frames: f64) {
        self.state.write().frame_latency = frames;
    }

    /// Hardware latency plus frame and fixed latency, in seconds
    pub fn total_latency(&self) -> f64 {
        let hz = self.hz();
        let state = self.state.read();
        let device = match &self.kind {
            DeviceKind::Playout(card) => card.device_latency().as_secs_f64(),
            DeviceKind::Writer(_) => 0.0,
        };
        let frames = if hz > 0.0 { state.frame_latency / hz } else { 0.0 };
        device + frames + state.fixed_latency
    }

    /// Samples to send with the next frame
    pub fn current_audio_frame_size(&self) -> usize {
        let state = self.state.read();
        if state.audio_sequence.is_empty() {
            return 0;
        }
        let frame = self.frame_count.load(Ordering::Acquire) as usize;
        state.audio_sequence[frame % state.audio_sequence.len()]
    }

    // ----------------------------------------------------------------------
    // Identification
    // ----------------------------------------------------------------------

    /// Readable identifier covering the parts selected by `id_type`
    pub fn id(&self, id_type: IdType) -> String {
        let state = self.state.read();
        let video = describe(state.catalog.video_formats.get(state.selection.video));
        let data = state
            .catalog
            .data_formats
            .get(state.selection.data)
            .map_or("none", |d| d.description.as_str());
        match id_type {
            IdType::HostnameVideoAndDataFormat => format!(
                "{}/{}/{}/{}/{}",
                hostname(),
                self.module,
                self.name,
                video,
                data
            ),
            IdType::VideoAndDataFormat => {
                format!("{}/{}/{}/{}", self.module, self.name, video, data)
            }
            IdType::VideoFormat => format!("{}/{}/{}", self.module, self.name, video),
            IdType::DataFormat => format!("{}/{}/{}", self.module, self.name, data),
            IdType::DeviceName => format!("{}/{}", self.module, self.name),
            IdType::ModuleName => self.module.clone(),
        }
    }

    /// Stable hash of [`OutputDevice::id`]
    pub fn hash_id(&self, id_type: IdType) -> String {
        formats::hash_id(&self.id(id_type))
    }
}

impl Drop for OutputDevice {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!("{}: close on drop: {}", self.name, e);
        }
    }
}

impl std::fmt::Debug for OutputDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputDevice")
            .field("name", &self.name)
            .field("module", &self.module)
            .field("playout", &self.is_playout())
            .field("status", &self.status())
            .finish()
    }
}

fn writer_video_format(resolution: Resolution, rate: Framerate, pixel_aspect: f32) -> VideoFormat {
    VideoFormat::new(
        resolution,
        rate,
        format!("{} {:.2}Hz", resolution, rate.as_f64()),
    )
    .with_pixel_aspect(pixel_aspect)
}

fn describe(video: Option<&VideoFormat>) -> &str {
    video.map_or("none", |v| v.description.as_str())
}

fn audio_sequence_for(catalog: &FormatCatalog, selection: &Selection) -> Vec<usize> {
    match (
        catalog.audio_formats.get(selection.audio),
        catalog.video_formats.get(selection.video),
    ) {
        (Some(audio), Some(video)) => audio_frame_size_sequence(audio.rate, video.rate),
        _ => Vec::new(),
    }
}

/// Check indices against a catalog; optional lists are only checked when asked for
fn validate_selection(
    catalog: &FormatCatalog,
    selection: &Selection,
    sync_mode: Option<usize>,
    sync_source: Option<usize>,
    audio: Option<usize>,
) -> Result<()> {
    let video = catalog
        .video_formats
        .get(selection.video)
        .ok_or(Error::InvalidVideoFormat(selection.video))?;
    let data = catalog
        .data_formats
        .get(selection.data)
        .ok_or(Error::InvalidDataFormat(selection.data))?;
    if data.is_stereo() && !video.stereo_capable {
        return Err(Error::InvalidDataFormat(selection.data));
    }
    if sync_mode.is_some_and(|i| i >= catalog.sync_modes.len()) {
        return Err(Error::InvalidSyncMode(selection.sync_mode));
    }
    if sync_source.is_some_and(|i| i >= catalog.sync_sources.len()) {
        return Err(Error::InvalidSyncSource(selection.sync_source));
    }
    if audio.is_some_and(|i| i >= catalog.audio_formats.len()) {
        return Err(Error::InvalidAudioFormat(selection.audio));
    }
    Ok(())
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}
