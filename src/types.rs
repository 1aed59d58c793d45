//! Common types used throughout framelink

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Video resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    // Common broadcast rasters
    pub const SD_NTSC: Self = Self::new(720, 486);
    pub const SD_PAL: Self = Self::new(720, 576);
    pub const HD_720P: Self = Self::new(1280, 720);
    pub const FHD_1080P: Self = Self::new(1920, 1080);
    pub const DCI_2K: Self = Self::new(2048, 1080);
    pub const UHD_4K: Self = Self::new(3840, 2160);
    pub const DCI_4K: Self = Self::new(4096, 2160);

    /// Calculate total pixels
    pub fn pixels(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Both dimensions non-zero
    pub fn is_valid(&self) -> bool {
        self.width > 0 && self.height > 0
    }
}

impl Default for Resolution {
    fn default() -> Self {
        Self::FHD_1080P
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Framerate as an exact rational, so output time never drifts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Framerate {
    pub num: u32,
    pub den: u32,
}

impl Framerate {
    pub const fn new(num: u32, den: u32) -> Self {
        Self { num, den }
    }

    // Common framerates
    pub const FPS_23_98: Self = Self::new(24000, 1001);
    pub const FPS_24: Self = Self::new(24, 1);
    pub const FPS_25: Self = Self::new(25, 1);
    pub const FPS_29_97: Self = Self::new(30000, 1001);
    pub const FPS_30: Self = Self::new(30, 1);
    pub const FPS_48: Self = Self::new(48, 1);
    pub const FPS_50: Self = Self::new(50, 1);
    pub const FPS_59_94: Self = Self::new(60000, 1001);
    pub const FPS_60: Self = Self::new(60, 1);

    /// Convert a decimal rate, snapping NTSC-style rates to their x/1001 form
    pub fn from_f64(fps: f64) -> Self {
        let rounded = fps.round();
        if (fps - rounded).abs() < 1e-3 && rounded > 0.0 {
            return Self::new(rounded as u32, 1);
        }
        let ntsc = (fps * 1.001).round();
        if (fps - ntsc / 1.001).abs() < 5e-3 {
            return Self::new(ntsc as u32 * 1000, 1001);
        }
        Self::new((fps * 1000.0).round() as u32, 1000)
    }

    /// Get framerate as f64
    pub fn as_f64(&self) -> f64 {
        self.num as f64 / self.den as f64
    }

    /// Duration of one frame
    pub fn frame_duration(&self) -> Duration {
        Duration::from_nanos(1_000_000_000 * self.den as u64 / self.num as u64)
    }

    /// Time of a frame index, computed from the count only
    pub fn time_of(&self, frame: u64) -> f64 {
        frame as f64 * self.den as f64 / self.num as f64
    }

    /// Timescale and per-frame duration used for hardware scheduling
    pub fn timescale(&self) -> (u64, u64) {
        if self.den == 1 {
            (self.num as u64 * 1000, 1000)
        } else {
            (self.num as u64, self.den as u64)
        }
    }
}

impl Default for Framerate {
    fn default() -> Self {
        Self::FPS_24
    }
}

impl std::fmt::Display for Framerate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.den == 1 {
            write!(f, "{} fps", self.num)
        } else {
            write!(f, "{:.2} fps", self.as_f64())
        }
    }
}

/// Pixel layout of the image handed to the output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum DataFormat {
    /// 8-bit RGB
    Rgb8,
    /// 8-bit RGBA
    #[default]
    Rgba8,
    /// 8-bit BGRA
    Bgra8,
    /// 16-bit RGB
    Rgb16,
    /// 16-bit RGBA
    Rgba16,
    /// 10-bit RGB packed in a 32-bit word, R in the high bits
    Rgb10X2,
    /// 10-bit RGB packed in a 32-bit word, R in the low bits
    Rgb10X2Rev,
    /// half float RGB
    Rgb16F,
    /// half float RGBA
    Rgba16F,
    /// float RGB
    Rgb32F,
    /// float RGBA
    Rgba32F,
    /// 8-bit 4:2:2, Cb Y0 Cr Y1 byte order (UYVY / 2vuy)
    CbY0CrY1_8,
    /// 8-bit 4:2:2, Y0 Cb Y1 Cr byte order (YUY2)
    Y0CbY1Cr_8,
    /// 10-bit 4:2:2, six pixels per four words (v210)
    YCbCr10_422,
    /// 16-bit 4:2:2 semi-planar: a Y plane, then an interleaved CbCr plane
    P216,
}

/// How readback bytes become output bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackOp {
    /// Row copy dropping readback padding
    Copy,
    /// 4:4:4 YCbCr bytes to 8-bit 4:2:2
    Subsample8 { cb_first: bool },
    /// 2_10_10_10 reversed words to v210
    Subsample10,
    /// 2_10_10_10 reversed words to 10_10_10_2
    Abgr10ToRgba10,
    /// 2_10_10_10 reversed words to 16-bit semi-planar 4:2:2
    P216,
}

impl DataFormat {
    pub const ALL: [DataFormat; 15] = [
        DataFormat::Rgb8,
        DataFormat::Rgba8,
        DataFormat::Bgra8,
        DataFormat::Rgb16,
        DataFormat::Rgba16,
        DataFormat::Rgb10X2,
        DataFormat::Rgb10X2Rev,
        DataFormat::Rgb16F,
        DataFormat::Rgba16F,
        DataFormat::Rgb32F,
        DataFormat::Rgba32F,
        DataFormat::CbY0CrY1_8,
        DataFormat::Y0CbY1Cr_8,
        DataFormat::YCbCr10_422,
        DataFormat::P216,
    ];

    /// Bytes per pixel as read back from the GPU
    pub fn pixel_size_in_bytes(&self) -> usize {
        match self {
            DataFormat::Rgb8 => 3,
            DataFormat::Rgba8 | DataFormat::Bgra8 => 4,
            DataFormat::Rgb16 => 6,
            DataFormat::Rgba16 => 8,
            DataFormat::Rgb10X2 | DataFormat::Rgb10X2Rev => 4,
            DataFormat::Rgb16F => 6,
            DataFormat::Rgba16F => 8,
            DataFormat::Rgb32F => 12,
            DataFormat::Rgba32F => 16,
            DataFormat::CbY0CrY1_8 | DataFormat::Y0CbY1Cr_8 => 3,
            DataFormat::YCbCr10_422 => 4,
            DataFormat::P216 => 4,
        }
    }

    /// Bytes in one output row of `width` pixels
    pub fn output_row_bytes(&self, width: u32) -> usize {
        let w = width as usize;
        match self {
            DataFormat::CbY0CrY1_8 | DataFormat::Y0CbY1Cr_8 => w.div_ceil(2) * 4,
            DataFormat::YCbCr10_422 => w.div_ceil(48) * 128,
            DataFormat::P216 => w.div_ceil(2) * 4,
            _ => w * self.pixel_size_in_bytes(),
        }
    }

    /// Output planes, each `height` rows of `output_row_bytes`
    pub fn planes(&self) -> usize {
        match self {
            DataFormat::P216 => 2,
            _ => 1,
        }
    }

    /// Conversion applied between readback and output memory
    pub fn pack_op(&self) -> PackOp {
        match self {
            DataFormat::CbY0CrY1_8 => PackOp::Subsample8 { cb_first: true },
            DataFormat::Y0CbY1Cr_8 => PackOp::Subsample8 { cb_first: false },
            DataFormat::YCbCr10_422 => PackOp::Subsample10,
            DataFormat::Rgb10X2 => PackOp::Abgr10ToRgba10,
            DataFormat::P216 => PackOp::P216,
            _ => PackOp::Copy,
        }
    }

    /// Number of color channels the renderer produces
    pub fn color_channels(&self) -> usize {
        match self {
            DataFormat::Rgba8
            | DataFormat::Bgra8
            | DataFormat::Rgba16
            | DataFormat::Rgba16F
            | DataFormat::Rgba32F => 4,
            DataFormat::Rgb10X2 | DataFormat::Rgb10X2Rev => 1,
            _ => 3,
        }
    }

    pub fn channel_names(&self) -> &'static [&'static str] {
        match self.color_channels() {
            4 => &["R", "G", "B", "A"],
            1 => &["RGB"],
            _ => &["R", "G", "B"],
        }
    }

    pub fn is_yuv(&self) -> bool {
        matches!(
            self,
            DataFormat::CbY0CrY1_8
                | DataFormat::Y0CbY1Cr_8
                | DataFormat::YCbCr10_422
                | DataFormat::P216
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            DataFormat::Rgb8 => "RGB8",
            DataFormat::Rgba8 => "RGBA8",
            DataFormat::Bgra8 => "BGRA8",
            DataFormat::Rgb16 => "RGB16",
            DataFormat::Rgba16 => "RGBA16",
            DataFormat::Rgb10X2 => "RGB10X2",
            DataFormat::Rgb10X2Rev => "RGB10",
            DataFormat::Rgb16F => "RGB16F",
            DataFormat::Rgba16F => "RGBA16F",
            DataFormat::Rgb32F => "RGB32F",
            DataFormat::Rgba32F => "RGBA32F",
            DataFormat::CbY0CrY1_8 => "UYVY",
            DataFormat::Y0CbY1Cr_8 => "YUY2",
            DataFormat::YCbCr10_422 => "V210",
            DataFormat::P216 => "P216",
        }
    }

    /// Parse the name used by `--format`
    pub fn from_name(name: &str) -> Option<Self> {
        let upper = name.trim().to_ascii_uppercase();
        if upper == "RGB10X2REV" {
            return Some(DataFormat::Rgb10X2Rev);
        }
        Self::ALL.into_iter().find(|f| f.name() == upper)
    }
}

impl std::fmt::Display for DataFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Byte geometry of one channel's frame, fixed for a channel's lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLayout {
    pub width: u32,
    pub height: u32,
    pub format: DataFormat,
    /// Readback row size including the GPU pack alignment padding
    pub readback_row_bytes: usize,
    /// Tight output row size
    pub output_row_bytes: usize,
}

impl FrameLayout {
    pub fn new(resolution: Resolution, format: DataFormat, pack_alignment: usize) -> Self {
        let tight = resolution.width as usize * format.pixel_size_in_bytes();
        let align = pack_alignment.max(1);
        Self {
            width: resolution.width,
            height: resolution.height,
            format,
            readback_row_bytes: tight.div_ceil(align) * align,
            output_row_bytes: format.output_row_bytes(resolution.width),
        }
    }

    /// Size of a padded readback image
    pub fn readback_bytes(&self) -> usize {
        self.readback_row_bytes * self.height as usize
    }

    /// Size of the host buffer each slot owns
    pub fn buffer_size_bytes(&self) -> usize {
        self.output_row_bytes * self.height as usize * self.format.planes()
    }

    /// Readback is usable as output without a pack step
    pub fn is_passthrough(&self) -> bool {
        self.format.pack_op() == PackOp::Copy && self.readback_row_bytes == self.output_row_bytes
    }

    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }
}

/// Sequence number and output time of a submitted frame
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FrameStamp {
    pub sequence: u64,
    pub time: f64,
}

/// Statistics for monitoring
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stats {
    /// Frames handed over by the render thread
    pub frames_submitted: u64,
    /// Frames whose pixels reached host memory
    pub frames_transferred: u64,
    /// Fresh frames written or scheduled
    pub frames_output: u64,
    /// Output slots filled with a repeat of the previous frame
    pub frames_repeated: u64,
    /// Frames whose transfer failed
    pub frames_failed: u64,
    /// Hardware completions reported as displayed late
    pub frames_late: u64,
    /// Hardware completions reported as dropped
    pub frames_dropped: u64,
    /// Fence waits that timed out and were retried
    pub fence_timeouts: u64,
    /// Transfers that had to wait for a free slot
    pub backpressure_waits: u64,
}

/// Live counters shared by the pipeline threads
#[derive(Debug, Default)]
pub struct Counters {
    pub frames_submitted: AtomicU64,
    pub frames_transferred: AtomicU64,
    pub frames_output: AtomicU64,
    pub frames_repeated: AtomicU64,
    pub frames_failed: AtomicU64,
    pub frames_late: AtomicU64,
    pub frames_dropped: AtomicU64,
    pub fence_timeouts: AtomicU64,
    pub backpressure_waits: AtomicU64,
}

impl Counters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Stats {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        Stats {
            frames_submitted: get(&self.frames_submitted),
            frames_transferred: get(&self.frames_transferred),
            frames_output: get(&self.frames_output),
            frames_repeated: get(&self.frames_repeated),
            frames_failed: get(&self.frames_failed),
            frames_late: get(&self.frames_late),
            frames_dropped: get(&self.frames_dropped),
            fence_timeouts: get(&self.fence_timeouts),
            backpressure_waits: get(&self.backpressure_waits),
        }
    }
}
