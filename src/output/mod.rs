//! Output module
//!
//! Finished frames leave the pipeline through one of two sinks:
//! - Movie writers ([`FrameWriter`]), fed by a dedicated output thread
//! - Hardware playout cards ([`ScheduledOutput`]), fed from completion callbacks
//!
//! The sink is chosen once when a device opens.

pub mod dispatch;
mod file;
mod memory;
mod playout;

pub use dispatch::{DispatchCore, ReadyFrame, ScheduledDispatch, WriterDispatch};
pub use file::RawFileWriter;
pub use memory::{MemoryCapture, MemoryWriter};
pub use playout::SimulatedPlayout;

use crate::config::{Chapter, WriteRequest};
use crate::error::Result;
use crate::formats::{AudioFormat, DataFormatSpec, FormatCatalog, VideoFormat};
use crate::types::{DataFormat, Framerate, Resolution};
use std::sync::Arc;
use std::time::Duration;

/// Description of the stream a writer receives
#[derive(Debug, Clone, PartialEq)]
pub struct StreamInfo {
    pub resolution: Resolution,
    pub rate: Framerate,
    pub format: DataFormat,
    pub pixel_aspect: f32,
    pub stereo: bool,
    /// Bytes of one tightly packed output row
    pub row_bytes: usize,
    /// Bytes of one eye of one frame
    pub frame_bytes: usize,
    pub frame_start: i64,
    pub frame_end: i64,
    pub chapters: Vec<Chapter>,
    pub audio: Option<AudioFormat>,
}

/// One frame handed to a movie writer
#[derive(Debug, Clone)]
pub struct OutputFrame {
    pub sequence: u64,
    /// Output time in seconds
    pub time: f64,
    /// One buffer per video channel, left eye first
    pub eyes: Vec<Arc<Vec<u8>>>,
    /// Interleaved samples to play with this frame
    pub audio: Option<Arc<[u8]>>,
    /// Re-output of an earlier frame
    pub repeat: bool,
}

/// Software consumer of finished frames
pub trait FrameWriter: Send {
    fn name(&self) -> &str;

    /// Called at device open, and again after a layout change
    fn open(&mut self, info: &StreamInfo, request: &WriteRequest) -> Result<()>;

    fn write(&mut self, frame: &OutputFrame) -> Result<()>;

    fn finish(&mut self) -> Result<()>;

    fn frames_written(&self) -> u64;
}

/// Builds the writer named by a device's `--output` target
pub trait WriterFactory: Send + Sync {
    fn create(&self, target: &str) -> Result<Box<dyn FrameWriter>>;
}

impl<F> WriterFactory for F
where
    F: Fn(&str) -> Result<Box<dyn FrameWriter>> + Send + Sync,
{
    fn create(&self, target: &str) -> Result<Box<dyn FrameWriter>> {
        self(target)
    }
}

/// Picks a writer from the target path
///
/// An empty target or `null` discards frames; anything else is a raw file.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultWriterFactory;

impl WriterFactory for DefaultWriterFactory {
    fn create(&self, target: &str) -> Result<Box<dyn FrameWriter>> {
        create_writer(target)
    }
}

/// Create a movie writer from a target path
pub fn create_writer(target: &str) -> Result<Box<dyn FrameWriter>> {
    match target.trim() {
        "" | "null" | "/dev/null" => Ok(Box::new(NullWriter::default())),
        path => Ok(Box::new(RawFileWriter::new(path))),
    }
}

/// Frame handed to a playout card
#[derive(Debug, Clone)]
pub struct ScheduledFrame {
    /// Position in the playout timeline, counting repeats
    pub playout_index: u64,
    /// Display time in `timescale` units
    pub display_time: u64,
    pub duration: u64,
    pub timescale: u64,
    pub sequence: u64,
    /// Ring slot to release on completion; `None` for repeats
    pub slot: Option<usize>,
    pub eyes: Vec<Arc<Vec<u8>>>,
    pub audio: Option<Arc<[u8]>>,
    pub repeat: bool,
}

/// How a playout card finished with a scheduled frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionResult {
    Completed,
    DisplayedLate,
    Dropped,
    /// Discarded because playback stopped
    Flushed,
}

/// Callbacks a playout card invokes on its own thread
pub trait PlaybackHandler: Send + Sync {
    fn scheduled_frame_completed(&self, frame: ScheduledFrame, result: CompletionResult);

    fn scheduled_playback_stopped(&self);
}

/// Hardware playout card
///
/// Implementations must not hold internal locks while invoking the
/// [`PlaybackHandler`], since the handler schedules new frames from inside
/// the callback.
pub trait ScheduledOutput: Send + Sync {
    fn name(&self) -> &str;

    fn catalog(&self) -> FormatCatalog;

    fn enable(
        &self,
        video: &VideoFormat,
        data: &DataFormatSpec,
        handler: Arc<dyn PlaybackHandler>,
    ) -> Result<()>;

    fn schedule_frame(&self, frame: ScheduledFrame) -> Result<()>;

    fn start_playback(&self, start_time: u64, timescale: u64) -> Result<()>;

    /// Stop playback; pending frames complete as [`CompletionResult::Flushed`]
    fn stop_playback(&self) -> Result<()>;

    /// Release the card and drop the handler
    fn disable(&self);

    /// Delay between scheduling and light leaving the connector
    fn device_latency(&self) -> Duration {
        Duration::ZERO
    }
}

/// Where a device sends finished frames
pub enum OutputSink {
    Writer(Box<dyn FrameWriter>),
    Scheduled(Arc<dyn ScheduledOutput>),
}

impl OutputSink {
    pub fn name(&self) -> &str {
        match self {
            OutputSink::Writer(writer) => writer.name(),
            OutputSink::Scheduled(card) => card.name(),
        }
    }

    pub fn is_scheduled(&self) -> bool {
        matches!(self, OutputSink::Scheduled(_))
    }
}

impl std::fmt::Debug for OutputSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputSink::Writer(writer) => write!(f, "Writer({})", writer.name()),
            OutputSink::Scheduled(card) => write!(f, "Scheduled({})", card.name()),
        }
    }
}

/// Writer that discards everything
#[derive(Debug, Default)]
pub struct NullWriter {
    frames: u64,
    bytes: u64,
}

impl FrameWriter for NullWriter {
    fn name(&self) -> &str {
        "null"
    }

    fn open(&mut self, info: &StreamInfo, _request: &WriteRequest) -> Result<()> {
        tracing::debug!("Null writer opened for {} {}", info.resolution, info.format);
        Ok(())
    }

    fn write(&mut self, frame: &OutputFrame) -> Result<()> {
        self.frames += 1;
        self.bytes += frame.eyes.iter().map(|e| e.len() as u64).sum::<u64>();
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        tracing::debug!("Null writer discarded {} frames ({} bytes)", self.frames, self.bytes);
        Ok(())
    }

    fn frames_written(&self) -> u64 {
        self.frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_writer_by_target() {
        assert_eq!(create_writer("").unwrap().name(), "null");
        assert_eq!(create_writer("null").unwrap().name(), "null");
        assert_eq!(create_writer("/tmp/out.####.raw").unwrap().name(), "raw");
    }

    #[test]
    fn test_closure_factory() {
        let factory = |target: &str| -> Result<Box<dyn FrameWriter>> {
            assert_eq!(target, "capture");
            let (writer, _capture) = MemoryWriter::new();
            Ok(Box::new(writer))
        };
        let writer = WriterFactory::create(&factory, "capture").unwrap();
        assert_eq!(writer.name(), "memory");
    }

    #[test]
    fn test_null_writer_counts() {
        let mut writer = NullWriter::default();
        let frame = OutputFrame {
            sequence: 0,
            time: 0.0,
            eyes: vec![Arc::new(vec![0; 16]), Arc::new(vec![0; 16])],
            audio: None,
            repeat: false,
        };
        writer.write(&frame).unwrap();
        writer.write(&frame).unwrap();
        assert_eq!(writer.frames_written(), 2);
        assert_eq!(writer.bytes, 64);
    }
}
