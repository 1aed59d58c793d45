//! Configuration types for framelink
//!
//! Two layers feed a device:
//! - [`DeviceConfig`]: pipeline tuning, loadable from TOML
//! - option tokens handed to `open()`, parsed into [`DeviceOptions`]
//!
//! Tokens win over environment overrides, which win over the TOML file.

use crate::error::{Error, Result};
use crate::types::{DataFormat, Framerate, Resolution};
use clap::{CommandFactory, Parser};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Prefix of environment overrides, e.g. `FRAMELINK_OUTPUT_RING_BUFFER_SIZE`
pub const ENV_PREFIX: &str = "FRAMELINK_OUTPUT_";

/// Ring depth used by movie-writer devices when nothing is configured
pub const DEFAULT_WRITER_RING_SIZE: usize = if cfg!(target_os = "linux") { 3 } else { 4 };

/// Ring depth used by playout devices when nothing is configured
pub const DEFAULT_PLAYOUT_RING_SIZE: usize = 5;

/// How pixels leave the GPU
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransferMethod {
    /// Asynchronous readback into pixel buffer objects with fences
    #[default]
    Pbo,
    /// Blocking readback on the render thread
    ReadPixels,
}

impl TransferMethod {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "pbo" | "ipbo" | "ppbo" => Some(TransferMethod::Pbo),
            "basic" | "readpixels" | "read_pixels" => Some(TransferMethod::ReadPixels),
            _ => None,
        }
    }
}

impl std::fmt::Display for TransferMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransferMethod::Pbo => f.write_str("pbo"),
            TransferMethod::ReadPixels => f.write_str("basic"),
        }
    }
}

/// How a movie-writer device paces its output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Pacing {
    /// Write frames as soon as they are ready
    #[default]
    Unpaced,
    /// One frame per frame interval, repeating the last frame on underrun
    Realtime,
}

impl Pacing {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "unpaced" | "fast" => Some(Pacing::Unpaced),
            "realtime" | "paced" => Some(Pacing::Realtime),
            _ => None,
        }
    }
}

/// Pipeline tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Slots per channel; `None` picks the backend default
    pub ring_buffer_size: Option<usize>,
    pub method: TransferMethod,
    pub pacing: Pacing,
    /// Frames scheduled on hardware before playback starts
    pub preroll_frames: usize,
    /// Delay of realtime output behind the first ready frame, in frames
    pub output_latency_frames: f64,
    /// Single fence wait before it counts as a timeout
    pub fence_timeout_ms: u64,
    /// Fence timeouts tolerated before the GPU is declared hung
    pub fence_retries: u32,
    /// Upper bound of any idle wait
    pub poll_interval_ms: u64,
    /// Longest the render thread waits for a free slot
    pub backpressure_timeout_ms: u64,
    /// Longest a format change or close waits for in-flight frames
    pub drain_timeout_ms: u64,
    pub verbose: bool,
    pub profile: bool,
    /// Where to dump profile samples at close
    pub profile_csv: Option<PathBuf>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            ring_buffer_size: None,
            method: TransferMethod::Pbo,
            pacing: Pacing::Unpaced,
            preroll_frames: 3,
            output_latency_frames: 0.5,
            fence_timeout_ms: 100,
            fence_retries: 20,
            poll_interval_ms: 5,
            backpressure_timeout_ms: 5000,
            drain_timeout_ms: 5000,
            verbose: false,
            profile: false,
            profile_csv: None,
        }
    }
}

impl DeviceConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(size) = self.ring_buffer_size {
            if size < 2 {
                return Err(Error::Config(format!(
                    "ring buffer size must be at least 2, got {}",
                    size
                )));
            }
        }
        if self.output_latency_frames < 0.0 {
            return Err(Error::Config("output latency must not be negative".into()));
        }
        if self.poll_interval_ms == 0 || self.fence_timeout_ms == 0 {
            return Err(Error::Config("wait intervals must be non-zero".into()));
        }
        Ok(())
    }

    pub fn with_ring_buffer_size(mut self, size: usize) -> Self {
        self.ring_buffer_size = Some(size);
        self
    }

    pub fn with_method(mut self, method: TransferMethod) -> Self {
        self.method = method;
        self
    }

    pub fn with_pacing(mut self, pacing: Pacing) -> Self {
        self.pacing = pacing;
        self
    }

    pub fn with_preroll(mut self, frames: usize) -> Self {
        self.preroll_frames = frames;
        self
    }

    pub fn with_output_latency(mut self, frames: f64) -> Self {
        self.output_latency_frames = frames;
        self
    }

    pub fn with_fence_timeout(mut self, timeout_ms: u64, retries: u32) -> Self {
        self.fence_timeout_ms = timeout_ms;
        self.fence_retries = retries;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn with_profile(mut self, profile: bool) -> Self {
        self.profile = profile;
        self
    }
}

/// Settings handed to a movie writer when it opens
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteRequest {
    pub verbose: bool,
    pub threads: usize,
    pub fps: f64,
    pub codec: String,
    pub audio_codec: String,
    pub quality: f32,
    pub pixel_aspect: f32,
    pub has_audio: bool,
    pub audio_channels: u32,
    pub audio_rate: u32,
    pub stereo: bool,
    pub comments: Vec<String>,
    pub copyright: String,
    /// Writer specific `key=value` pairs
    pub parameters: Vec<(String, String)>,
}

impl Default for WriteRequest {
    fn default() -> Self {
        Self {
            verbose: false,
            threads: 1,
            fps: 24.0,
            codec: String::new(),
            audio_codec: String::new(),
            quality: 1.0,
            pixel_aspect: 1.0,
            has_audio: false,
            audio_channels: 2,
            audio_rate: 48000,
            stereo: false,
            comments: Vec::new(),
            copyright: String::new(),
            parameters: Vec::new(),
        }
    }
}

/// Named frame range inside the output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chapter {
    pub start: i64,
    pub end: i64,
    pub title: String,
}

/// Catalog indices requested at open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FormatIndices {
    pub video: Option<usize>,
    pub data: Option<usize>,
    pub sync_mode: Option<usize>,
    pub sync_source: Option<usize>,
    pub audio: Option<usize>,
}

/// Raw option tokens accepted by `open()`
#[derive(Parser, Debug, Default)]
#[command(name = "output device", no_binary_name = true, disable_help_flag = true)]
pub struct DeviceArgs {
    /// Print option usage
    #[arg(short = 'h', long)]
    pub help: bool,

    /// Log slow lock acquisitions and per-frame detail
    #[arg(short = 'v', long)]
    pub verbose: bool,

    /// Collect GPU and output timings
    #[arg(short = 'p', long)]
    pub profile: bool,

    /// Pipeline tuning file (TOML)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Movie writer target; '#' expands to the frame number
    #[arg(short = 'o', long)]
    pub output: Option<String>,

    /// Output size
    #[arg(short = 's', long, num_args = 2, value_names = ["WIDTH", "HEIGHT"])]
    pub size: Option<Vec<u32>>,

    /// Frames per second
    #[arg(long)]
    pub fps: Option<f64>,

    #[arg(short = 'a', long)]
    pub pixel_aspect: Option<f32>,

    /// RGB8, RGBA8, BGRA8, RGB10, RGB16, RGBA16, RGB16F, RGBA16F, RGB32F, RGBA32F, UYVY, YUY2, V210, P216
    #[arg(short = 'f', long)]
    pub format: Option<String>,

    /// Two video channels
    #[arg(long)]
    pub stereo: bool,

    /// Video channel count (1 or 2)
    #[arg(long)]
    pub channels: Option<usize>,

    /// pbo, ipbo, ppbo or basic
    #[arg(short = 'm', long)]
    pub method: Option<String>,

    #[arg(long)]
    pub ring_buffer_size: Option<usize>,

    /// unpaced or realtime
    #[arg(long)]
    pub pacing: Option<String>,

    #[arg(long)]
    pub preroll: Option<usize>,

    #[arg(long)]
    pub latency_frames: Option<f64>,

    #[arg(long)]
    pub codec: Option<String>,

    #[arg(long)]
    pub audio_codec: Option<String>,

    #[arg(long)]
    pub audio_rate: Option<u32>,

    #[arg(long)]
    pub audio_layout: Option<String>,

    #[arg(long)]
    pub has_audio: bool,

    #[arg(long)]
    pub quality: Option<f32>,

    #[arg(long, num_args = 1..)]
    pub comments: Vec<String>,

    #[arg(long)]
    pub copyright: Option<String>,

    #[arg(long)]
    pub threads: Option<usize>,

    #[arg(long, allow_negative_numbers = true)]
    pub frame_start: Option<i64>,

    #[arg(long, allow_negative_numbers = true)]
    pub frame_end: Option<i64>,

    /// Writer parameters as key=value
    #[arg(long = "args", num_args = 1..)]
    pub writer_args: Vec<String>,

    /// Chapter ranges as start-end
    #[arg(long, num_args = 1..)]
    pub chapter_ranges: Vec<String>,

    #[arg(long, num_args = 1..)]
    pub chapter_titles: Vec<String>,

    #[arg(long)]
    pub video_format: Option<usize>,

    #[arg(long)]
    pub data_format: Option<usize>,

    #[arg(long)]
    pub sync_mode: Option<usize>,

    #[arg(long)]
    pub sync_source: Option<usize>,

    #[arg(long)]
    pub audio_format: Option<usize>,
}

impl DeviceArgs {
    /// Usage text for `--help`
    pub fn usage() -> String {
        let mut command = Self::command();
        command.render_help().to_string()
    }

    /// Parse tokens, dropping unknown options with a warning
    pub fn parse_tokens<S: AsRef<str>>(tokens: &[S]) -> Result<Self> {
        let known = known_options();
        let mut kept: Vec<String> = Vec::with_capacity(tokens.len());
        let mut skipping = false;

        for token in tokens.iter().map(AsRef::as_ref) {
            if is_option(token) {
                let name = token.split('=').next().unwrap_or(token);
                skipping = !known.iter().any(|k| k == name);
                if skipping {
                    tracing::warn!("Ignoring unknown output option {}", token);
                    continue;
                }
            } else if skipping {
                continue;
            }
            kept.push(token.to_string());
        }

        Self::try_parse_from(kept).map_err(|e| Error::Config(e.to_string().trim().to_string()))
    }
}

fn is_option(token: &str) -> bool {
    token.starts_with('-') && token.len() > 1 && token.parse::<f64>().is_err()
}

fn known_options() -> Vec<String> {
    let command = DeviceArgs::command();
    let mut names = Vec::new();
    for arg in command.get_arguments() {
        if let Some(long) = arg.get_long() {
            names.push(format!("--{}", long));
        }
        if let Some(short) = arg.get_short() {
            names.push(format!("-{}", short));
        }
    }
    names
}

/// Fully validated result of `open()` tokens
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceOptions {
    pub config: DeviceConfig,
    pub output: Option<String>,
    pub resolution: Option<Resolution>,
    pub rate: Option<Framerate>,
    pub data_format: Option<DataFormat>,
    pub stereo: bool,
    pub audio_layout: Option<String>,
    pub request: WriteRequest,
    pub frame_start: i64,
    pub frame_end: i64,
    pub chapters: Vec<Chapter>,
    pub indices: FormatIndices,
}

impl DeviceOptions {
    /// Parse tokens with overrides from the process environment
    pub fn parse<S: AsRef<str>>(tokens: &[S], base: DeviceConfig) -> Result<Self> {
        Self::parse_with_env(tokens, base, |key| std::env::var(key).ok())
    }

    pub fn parse_with_env<S, F>(tokens: &[S], base: DeviceConfig, env: F) -> Result<Self>
    where
        S: AsRef<str>,
        F: Fn(&str) -> Option<String>,
    {
        let args = DeviceArgs::parse_tokens(tokens)?;
        if args.help {
            tracing::info!("{}", DeviceArgs::usage());
            return Err(Error::Config("--help requested".into()));
        }

        let mut config = match &args.config {
            Some(path) => DeviceConfig::from_file(path)?,
            None => base,
        };
        apply_env(&mut config, &env)?;

        if args.verbose {
            config.verbose = true;
        }
        if args.profile {
            config.profile = true;
        }
        if let Some(name) = &args.method {
            config.method = TransferMethod::from_name(name)
                .ok_or_else(|| Error::Config(format!("unknown transfer method '{}'", name)))?;
        }
        if let Some(size) = args.ring_buffer_size {
            config.ring_buffer_size = Some(size);
        }
        if let Some(name) = &args.pacing {
            config.pacing = Pacing::from_name(name)
                .ok_or_else(|| Error::Config(format!("unknown pacing '{}'", name)))?;
        }
        if let Some(preroll) = args.preroll {
            config.preroll_frames = preroll;
        }
        if let Some(latency) = args.latency_frames {
            config.output_latency_frames = latency;
        }
        config.validate()?;

        let resolution = match &args.size {
            Some(size) => {
                let resolution = Resolution::new(size[0], size[1]);
                if !resolution.is_valid() {
                    return Err(Error::Config(format!("bad output size {}", resolution)));
                }
                Some(resolution)
            }
            None => None,
        };

        let rate = match args.fps {
            Some(fps) if fps > 0.0 && fps.is_finite() => Some(Framerate::from_f64(fps)),
            Some(fps) => return Err(Error::Config(format!("bad fps {}", fps))),
            None => None,
        };

        let pixel_aspect = args.pixel_aspect.unwrap_or(1.0);
        if pixel_aspect <= 0.0 {
            return Err(Error::Config(format!("bad pixel aspect {}", pixel_aspect)));
        }

        let data_format = match &args.format {
            Some(name) => Some(
                DataFormat::from_name(name)
                    .ok_or_else(|| Error::Config(format!("unknown data format '{}'", name)))?,
            ),
            None => None,
        };

        let stereo = match args.channels {
            None | Some(1) => args.stereo,
            Some(2) => true,
            Some(n) => return Err(Error::Config(format!("bad channel count {}", n))),
        };

        let mut parameters = Vec::with_capacity(args.writer_args.len());
        for pair in &args.writer_args {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| Error::Config(format!("writer argument '{}' is not key=value", pair)))?;
            parameters.push((key.to_string(), value.to_string()));
        }

        let chapters = parse_chapters(&args.chapter_ranges, &args.chapter_titles)?;

        let frame_start = args.frame_start.unwrap_or(1);
        let frame_end = args.frame_end.unwrap_or(frame_start);
        if frame_end < frame_start {
            return Err(Error::Config(format!(
                "frame end {} before frame start {}",
                frame_end, frame_start
            )));
        }

        let defaults = WriteRequest::default();
        let request = WriteRequest {
            verbose: config.verbose,
            threads: args.threads.unwrap_or(defaults.threads).max(1),
            fps: rate.map_or(defaults.fps, |r| r.as_f64()),
            codec: args.codec.clone().unwrap_or_default(),
            audio_codec: args.audio_codec.clone().unwrap_or_default(),
            quality: args.quality.unwrap_or(defaults.quality),
            pixel_aspect,
            has_audio: args.has_audio,
            audio_channels: defaults.audio_channels,
            audio_rate: args.audio_rate.unwrap_or(defaults.audio_rate),
            stereo,
            comments: args.comments.clone(),
            copyright: args.copyright.clone().unwrap_or_default(),
            parameters,
        };

        Ok(Self {
            config,
            output: args.output.clone(),
            resolution,
            rate,
            data_format,
            stereo,
            audio_layout: args.audio_layout.clone(),
            request,
            frame_start,
            frame_end,
            chapters,
            indices: FormatIndices {
                video: args.video_format,
                data: args.data_format,
                sync_mode: args.sync_mode,
                sync_source: args.sync_source,
                audio: args.audio_format,
            },
        })
    }
}

fn apply_env<F: Fn(&str) -> Option<String>>(config: &mut DeviceConfig, env: &F) -> Result<()> {
    let var = |name: &str| env(&format!("{}{}", ENV_PREFIX, name));
    let flag = |value: String| !matches!(value.trim(), "" | "0" | "false" | "no");

    if let Some(value) = var("VERBOSE") {
        config.verbose = flag(value);
    }
    if let Some(value) = var("PROFILE") {
        config.profile = flag(value);
    }
    if let Some(value) = var("METHOD") {
        config.method = TransferMethod::from_name(&value).ok_or_else(|| {
            Error::Config(format!("{}METHOD: unknown method '{}'", ENV_PREFIX, value))
        })?;
    }
    if let Some(value) = var("RING_BUFFER_SIZE") {
        let size = value.trim().parse::<usize>().map_err(|_| {
            Error::Config(format!("{}RING_BUFFER_SIZE: bad value '{}'", ENV_PREFIX, value))
        })?;
        config.ring_buffer_size = Some(size);
    }
    Ok(())
}

fn parse_chapters(ranges: &[String], titles: &[String]) -> Result<Vec<Chapter>> {
    if ranges.len() != titles.len() {
        return Err(Error::Config(format!(
            "{} chapter ranges but {} chapter titles",
            ranges.len(),
            titles.len()
        )));
    }
    ranges
        .iter()
        .zip(titles)
        .map(|(range, title)| {
            let (start, end) = range
                .split_once('-')
                .and_then(|(s, e)| Some((s.trim().parse().ok()?, e.trim().parse().ok()?)))
                .ok_or_else(|| Error::Config(format!("bad chapter range '{}'", range)))?;
            Ok(Chapter {
                start,
                end,
                title: title.clone(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn parse(tokens: &[&str]) -> Result<DeviceOptions> {
        DeviceOptions::parse_with_env(tokens, DeviceConfig::default(), |_| None)
    }

    #[test]
    fn test_defaults() {
        let options = parse(&[]).unwrap();
        assert_eq!(options.config, DeviceConfig::default());
        assert_eq!(options.frame_start, 1);
        assert_eq!(options.frame_end, 1);
        assert_eq!(options.request.audio_rate, 48000);
        assert!(!options.stereo);
    }

    #[test]
    fn test_full_token_set() {
        let options = parse(&[
            "--size", "1920", "1080", "--fps", "29.97", "-f", "RGB10", "--stereo", "-m", "basic",
            "--ring-buffer-size", "6", "--frame-start", "101", "--frame-end", "200", "--args",
            "crf=18", "preset=slow", "-o", "out.#.raw",
        ])
        .unwrap();
        assert_eq!(options.resolution, Some(Resolution::FHD_1080P));
        assert_eq!(options.rate, Some(Framerate::FPS_29_97));
        assert_eq!(options.data_format, Some(DataFormat::Rgb10X2Rev));
        assert!(options.stereo && options.request.stereo);
        assert_eq!(options.config.method, TransferMethod::ReadPixels);
        assert_eq!(options.config.ring_buffer_size, Some(6));
        assert_eq!((options.frame_start, options.frame_end), (101, 200));
        assert_eq!(options.request.parameters[1], ("preset".into(), "slow".into()));
        assert_eq!(options.output.as_deref(), Some("out.#.raw"));
    }

    #[test]
    fn test_unknown_options_are_ignored() {
        let options = parse(&["--bogus", "1", "2", "--fps", "25", "-z"]).unwrap();
        assert_eq!(options.rate, Some(Framerate::FPS_25));
    }

    #[test]
    fn test_invalid_values() {
        assert!(parse(&["--size", "0", "1080"]).unwrap_err().is_config());
        assert!(parse(&["--fps", "0"]).is_err());
        assert!(parse(&["--pixel-aspect", "-1"]).is_err());
        assert!(parse(&["--format", "RGB9"]).is_err());
        assert!(parse(&["--method", "dma"]).is_err());
        assert!(parse(&["--ring-buffer-size", "1"]).is_err());
        assert!(parse(&["--args", "novalue"]).is_err());
        assert!(parse(&["--channels", "3"]).is_err());
        assert!(parse(&["--help"]).is_err());
    }

    #[test]
    fn test_chapters() {
        let options = parse(&[
            "--chapter-ranges", "1-10", "11-20", "--chapter-titles", "intro", "main",
        ])
        .unwrap();
        assert_eq!(options.chapters.len(), 2);
        assert_eq!(options.chapters[1].start, 11);
        assert_eq!(options.chapters[1].title, "main");

        assert!(parse(&["--chapter-ranges", "1-10", "--chapter-titles", "a", "b"]).is_err());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<String, String> = [
            ("FRAMELINK_OUTPUT_RING_BUFFER_SIZE", "7"),
            ("FRAMELINK_OUTPUT_METHOD", "basic"),
            ("FRAMELINK_OUTPUT_VERBOSE", "1"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let options: DeviceOptions =
            DeviceOptions::parse_with_env(&["--ring-buffer-size", "4"], DeviceConfig::default(), |k| {
                env.get(k).cloned()
            })
            .unwrap();
        // the token beats the environment
        assert_eq!(options.config.ring_buffer_size, Some(4));
        assert_eq!(options.config.method, TransferMethod::ReadPixels);
        assert!(options.config.verbose);
    }

    #[test]
    fn test_toml_config() {
        let config = DeviceConfig::from_toml_str(
            r#"
            ring_buffer_size = 4
            method = "read_pixels"
            pacing = "realtime"
            fence_timeout_ms = 50
            "#,
        )
        .unwrap();
        assert_eq!(config.ring_buffer_size, Some(4));
        assert_eq!(config.method, TransferMethod::ReadPixels);
        assert_eq!(config.pacing, Pacing::Realtime);
        assert_eq!(config.fence_timeout_ms, 50);
        assert_eq!(config.preroll_frames, 3);

        assert!(DeviceConfig::from_toml_str("ring_buffer_size = 1").is_err());
        assert!(matches!(
            DeviceConfig::from_toml_str("method = 12"),
            Err(Error::ConfigFile(_))
        ));
    }

    #[test]
    fn test_config_file_token() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device.toml");
        std::fs::write(&path, "preroll_frames = 2\nverbose = true\n").unwrap();
        let path_str = path.to_string_lossy().to_string();
        let options = parse(&["--config", &path_str]).unwrap();
        assert_eq!(options.config.preroll_frames, 2);
        assert!(options.config.verbose);
    }
}
