//! In-memory writer
//!
//! Keeps every frame it receives so callers can inspect exactly what left
//! the pipeline.

use super::{FrameWriter, OutputFrame, StreamInfo};
use crate::config::WriteRequest;
use crate::error::Result;
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Debug, Default)]
struct Captured {
    info: Option<StreamInfo>,
    frames: Vec<OutputFrame>,
    opens: usize,
    finished: bool,
}

/// Read side of a [`MemoryWriter`]
#[derive(Debug, Clone, Default)]
pub struct MemoryCapture {
    inner: Arc<Mutex<Captured>>,
}

impl MemoryCapture {
    pub fn frames(&self) -> Vec<OutputFrame> {
        self.inner.lock().frames.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().frames.is_empty()
    }

    /// Sequence number of every write, repeats included
    pub fn sequences(&self) -> Vec<u64> {
        self.inner.lock().frames.iter().map(|f| f.sequence).collect()
    }

    pub fn repeats(&self) -> usize {
        self.inner.lock().frames.iter().filter(|f| f.repeat).count()
    }

    pub fn info(&self) -> Option<StreamInfo> {
        self.inner.lock().info.clone()
    }

    /// How often the writer was opened
    pub fn opens(&self) -> usize {
        self.inner.lock().opens
    }

    pub fn is_finished(&self) -> bool {
        self.inner.lock().finished
    }

    /// Another writer feeding this capture
    pub fn writer(&self) -> MemoryWriter {
        MemoryWriter {
            capture: self.clone(),
        }
    }
}

/// Writer that records frames for inspection
#[derive(Debug)]
pub struct MemoryWriter {
    capture: MemoryCapture,
}

impl MemoryWriter {
    pub fn new() -> (Self, MemoryCapture) {
        let capture = MemoryCapture::default();
        (
            Self {
                capture: capture.clone(),
            },
            capture,
        )
    }
}

impl FrameWriter for MemoryWriter {
    fn name(&self) -> &str {
        "memory"
    }

    fn open(&mut self, info: &StreamInfo, _request: &WriteRequest) -> Result<()> {
        let mut inner = self.capture.inner.lock();
        inner.info = Some(info.clone());
        inner.opens += 1;
        inner.finished = false;
        Ok(())
    }

    fn write(&mut self, frame: &OutputFrame) -> Result<()> {
        self.capture.inner.lock().frames.push(frame.clone());
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.capture.inner.lock().finished = true;
        Ok(())
    }

    fn frames_written(&self) -> u64 {
        self.capture.len() as u64
    }
}
