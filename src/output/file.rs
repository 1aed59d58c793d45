//! Raw file output
//!
//! Writes packed frames exactly as they leave the ring. A `#` run in the
//! path switches to one file per frame, numbered from the stream's start
//! frame; otherwise every frame is appended to a single file. Audio goes to
//! a `.pcm` file next to the video. Re-opening the writer after a format
//! change continues the same output: single files are appended to and the
//! frame numbering carries on.

use crate::config::WriteRequest;
use crate::error::{Error, Result};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use super::{FrameWriter, OutputFrame, StreamInfo};

/// Minimum digits a `#` run expands to
const FRAME_DIGITS: usize = 4;

/// File output for raw frames
pub struct RawFileWriter {
    pattern: String,
    initialized: bool,
    /// Set once the first `open` created the output files
    started: bool,
    bytes_written: AtomicU64,
    frame_count: u64,
    frame_start: i64,
    stream: Option<BufWriter<File>>,
    audio: Option<BufWriter<File>>,
}

impl RawFileWriter {
    /// Create a new raw writer for `pattern`
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            initialized: false,
            started: false,
            bytes_written: AtomicU64::new(0),
            frame_count: 0,
            frame_start: 0,
            stream: None,
            audio: None,
        }
    }

    /// Whether every frame gets its own file
    pub fn is_sequence(&self) -> bool {
        self.pattern.contains('#')
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    /// Path of frame `number`; the first `#` run becomes the zero padded number
    pub fn frame_path(&self, number: i64) -> PathBuf {
        let Some(start) = self.pattern.find('#') else {
            return PathBuf::from(&self.pattern);
        };
        let run = self.pattern[start..].chars().take_while(|c| *c == '#').count();
        let width = run.max(FRAME_DIGITS);
        let digits = if number < 0 {
            format!("-{:0width$}", -number, width = width)
        } else {
            format!("{:0width$}", number, width = width)
        };
        PathBuf::from(format!(
            "{}{}{}",
            &self.pattern[..start],
            digits,
            &self.pattern[start + run..]
        ))
    }

    fn audio_path(&self) -> PathBuf {
        let base = self.pattern.replace('#', "");
        let base = base.trim_end_matches(['.', '_', '-']);
        PathBuf::from(format!("{}.pcm", base))
    }

    fn create(path: &PathBuf) -> Result<BufWriter<File>> {
        Self::open_file(path, false)
    }

    fn open_file(path: &PathBuf, append: bool) -> Result<BufWriter<File>> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| Error::Writer(format!("Failed to create directory: {}", e)))?;
            }
        }
        let file = if append {
            OpenOptions::new().create(true).append(true).open(path)
        } else {
            File::create(path)
        }
        .map_err(|e| Error::Writer(format!("Failed to create {}: {}", path.display(), e)))?;
        Ok(BufWriter::new(file))
    }

    fn write_eyes(out: &mut BufWriter<File>, frame: &OutputFrame) -> Result<u64> {
        let mut bytes = 0u64;
        for eye in &frame.eyes {
            out.write_all(eye)?;
            bytes += eye.len() as u64;
        }
        Ok(bytes)
    }
}

impl FrameWriter for RawFileWriter {
    fn name(&self) -> &str {
        "raw"
    }

    fn open(&mut self, info: &StreamInfo, request: &WriteRequest) -> Result<()> {
        if self.initialized {
            self.finish()?;
        }
        if !request.codec.is_empty() {
            tracing::warn!("Raw output ignores codec '{}'", request.codec);
        }

        let append = self.started;
        if !append {
            self.frame_start = info.frame_start;
            self.frame_count = 0;
        }
        if !self.is_sequence() {
            self.stream = Some(Self::open_file(&self.frame_path(0), append)?);
        }
        if request.has_audio {
            self.audio = Some(Self::open_file(&self.audio_path(), append)?);
        }
        self.initialized = true;
        self.started = true;

        tracing::info!(
            "File output {}: {} ({}, {} {}, {} bytes per eye)",
            if append { "continued" } else { "initialized" },
            self.pattern,
            info.resolution,
            info.format,
            if info.stereo { "stereo" } else { "mono" },
            info.frame_bytes
        );
        Ok(())
    }

    fn write(&mut self, frame: &OutputFrame) -> Result<()> {
        if !self.initialized {
            return Err(Error::Writer("Output not initialized".into()));
        }

        let bytes = match self.stream.as_mut() {
            Some(stream) => Self::write_eyes(stream, frame)?,
            None => {
                let path = self.frame_path(self.frame_start + self.frame_count as i64);
                let mut file = Self::create(&path)?;
                let bytes = Self::write_eyes(&mut file, frame)?;
                file.flush()?;
                bytes
            }
        };
        if let (Some(audio), Some(samples)) = (self.audio.as_mut(), frame.audio.as_ref()) {
            audio.write_all(samples)?;
        }

        self.frame_count += 1;
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        if !self.initialized {
            return Ok(());
        }
        if let Some(mut stream) = self.stream.take() {
            stream.flush()?;
        }
        if let Some(mut audio) = self.audio.take() {
            audio.flush()?;
        }

        let bytes = self.bytes_written();
        tracing::info!(
            "File output finished: {} ({} frames, {} bytes, {:.2} MB)",
            self.pattern,
            self.frame_count,
            bytes,
            bytes as f64 / 1_000_000.0
        );
        self.initialized = false;
        Ok(())
    }

    fn frames_written(&self) -> u64 {
        self.frame_count
    }
}

impl Drop for RawFileWriter {
    fn drop(&mut self) {
        if let Some(stream) = self.stream.as_mut() {
            let _ = stream.flush();
        }
        if let Some(audio) = self.audio.as_mut() {
            let _ = audio.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DataFormat, Framerate, Resolution};
    use std::sync::Arc;

    fn info(frame_start: i64) -> StreamInfo {
        StreamInfo {
            resolution: Resolution::new(2, 1),
            rate: Framerate::FPS_24,
            format: DataFormat::Rgba8,
            pixel_aspect: 1.0,
            stereo: false,
            row_bytes: 8,
            frame_bytes: 8,
            frame_start,
            frame_end: frame_start + 10,
            chapters: Vec::new(),
            audio: None,
        }
    }

    fn frame(sequence: u64, value: u8) -> OutputFrame {
        OutputFrame {
            sequence,
            time: 0.0,
            eyes: vec![Arc::new(vec![value; 8])],
            audio: Some(Arc::from(vec![value; 4])),
            repeat: false,
        }
    }

    #[test]
    fn test_frame_path_expansion() {
        let writer = RawFileWriter::new("out/shot.#.raw");
        assert_eq!(writer.frame_path(7), PathBuf::from("out/shot.0007.raw"));
        assert_eq!(
            RawFileWriter::new("f_######.raw").frame_path(42),
            PathBuf::from("f_000042.raw")
        );
        assert_eq!(
            RawFileWriter::new("single.raw").frame_path(3),
            PathBuf::from("single.raw")
        );
    }

    #[test]
    fn test_single_file_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("movie.raw");
        let mut writer = RawFileWriter::new(path.to_string_lossy());
        let request = WriteRequest {
            has_audio: true,
            ..WriteRequest::default()
        };
        writer.open(&info(0), &request).unwrap();
        writer.write(&frame(0, 1)).unwrap();
        writer.write(&frame(1, 2)).unwrap();
        writer.finish().unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes.len(), 16);
        assert_eq!(&bytes[8..], &[2; 8]);
        assert_eq!(std::fs::read(dir.path().join("movie.raw.pcm")).unwrap().len(), 8);
        assert_eq!(writer.frames_written(), 2);
    }

    #[test]
    fn test_sequence_numbers_from_start_frame() {
        let dir = tempfile::tempdir().unwrap();
        let pattern = dir.path().join("seq").join("frame.#.raw");
        let mut writer = RawFileWriter::new(pattern.to_string_lossy());
        writer.open(&info(100), &WriteRequest::default()).unwrap();
        writer.write(&frame(0, 5)).unwrap();
        writer.write(&frame(1, 6)).unwrap();
        writer.finish().unwrap();

        let second = std::fs::read(dir.path().join("seq").join("frame.0101.raw")).unwrap();
        assert_eq!(second, vec![6; 8]);
        assert!(dir.path().join("seq").join("frame.0100.raw").exists());
    }

    #[test]
    fn test_reopen_continues_output() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("movie.raw");
        let mut writer = RawFileWriter::new(path.to_string_lossy());
        let request = WriteRequest {
            has_audio: true,
            ..WriteRequest::default()
        };
        writer.open(&info(0), &request).unwrap();
        for i in 0..3 {
            writer.write(&frame(i, 1)).unwrap();
        }
        writer.finish().unwrap();

        let mut wider = info(0);
        wider.frame_bytes = 16;
        writer.open(&wider, &request).unwrap();
        for i in 3..5 {
            let mut f = frame(i, 2);
            f.eyes = vec![Arc::new(vec![2; 16])];
            writer.write(&f).unwrap();
        }
        writer.finish().unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes.len(), 3 * 8 + 2 * 16);
        assert_eq!(&bytes[..24], &[1; 24]);
        assert_eq!(std::fs::read(dir.path().join("movie.raw.pcm")).unwrap().len(), 20);
        assert_eq!(writer.frames_written(), 5);
    }

    #[test]
    fn test_reopen_keeps_sequence_numbers() {
        let dir = tempfile::tempdir().unwrap();
        let pattern = dir.path().join("frame.#.raw");
        let mut writer = RawFileWriter::new(pattern.to_string_lossy());
        writer.open(&info(10), &WriteRequest::default()).unwrap();
        writer.write(&frame(0, 1)).unwrap();
        writer.write(&frame(1, 2)).unwrap();
        writer.finish().unwrap();

        writer.open(&info(10), &WriteRequest::default()).unwrap();
        writer.write(&frame(2, 3)).unwrap();
        writer.finish().unwrap();

        let read = |n: u32| std::fs::read(dir.path().join(format!("frame.{:04}.raw", n))).unwrap();
        assert_eq!(read(10), vec![1; 8]);
        assert_eq!(read(11), vec![2; 8]);
        assert_eq!(read(12), vec![3; 8]);
    }

    #[test]
    fn test_write_before_open_fails() {
        let mut writer = RawFileWriter::new("unused.raw");
        assert!(writer.write(&frame(0, 0)).is_err());
    }
}
