//! Index-addressed format catalog
//!
//! The GUI configures a device by index into these lists, so their order is
//! stable for the lifetime of a device.

use crate::types::{DataFormat, Framerate, Resolution};
use serde::{Deserialize, Serialize};

/// Longest audio cadence computed before giving up on an exact cycle
const MAX_AUDIO_CYCLE: u64 = 1000;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Raster plus rate of an output signal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoFormat {
    pub resolution: Resolution,
    pub pixel_aspect: f32,
    pub pixel_scale: f32,
    pub rate: Framerate,
    pub description: String,
    /// Stereo data formats may be used with this format
    pub stereo_capable: bool,
}

impl VideoFormat {
    pub fn new(resolution: Resolution, rate: Framerate, description: impl Into<String>) -> Self {
        Self {
            resolution,
            pixel_aspect: 1.0,
            pixel_scale: 1.0,
            rate,
            description: description.into(),
            stereo_capable: false,
        }
    }

    pub fn with_stereo(mut self, capable: bool) -> Self {
        self.stereo_capable = capable;
        self
    }

    pub fn with_pixel_aspect(mut self, aspect: f32) -> Self {
        self.pixel_aspect = aspect;
        self
    }

    pub fn hz(&self) -> f64 {
        self.rate.as_f64()
    }
}

/// A selectable pixel layout
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataFormatSpec {
    pub format: DataFormat,
    pub description: String,
}

impl DataFormatSpec {
    pub fn new(format: DataFormat, description: impl Into<String>) -> Self {
        Self {
            format,
            description: description.into(),
        }
    }

    /// Stereo layouts are marked in their description
    pub fn is_stereo(&self) -> bool {
        self.description.contains("Stereo")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMode {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSource {
    pub name: String,
}

/// Audio sample encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SampleFormat {
    Int16,
    Int32,
    Float32,
}

impl SampleFormat {
    pub fn bytes(&self) -> usize {
        match self {
            SampleFormat::Int16 => 2,
            SampleFormat::Int32 | SampleFormat::Float32 => 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub rate: u32,
    pub format: SampleFormat,
    pub channels: u32,
    pub description: String,
}

impl AudioFormat {
    pub fn new(rate: u32, format: SampleFormat, channels: u32, description: impl Into<String>) -> Self {
        Self {
            rate,
            format,
            channels,
            description: description.into(),
        }
    }

    /// Bytes of one interleaved sample frame
    pub fn frame_bytes(&self) -> usize {
        self.format.bytes() * self.channels as usize
    }
}

/// Everything a device can be switched between
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FormatCatalog {
    pub video_formats: Vec<VideoFormat>,
    pub data_formats: Vec<DataFormatSpec>,
    pub sync_modes: Vec<SyncMode>,
    pub sync_sources: Vec<SyncSource>,
    pub audio_formats: Vec<AudioFormat>,
}

impl FormatCatalog {
    /// Data formats usable with a video format; stereo layouts need stereo support
    pub fn data_formats_for(&self, video: &VideoFormat) -> Vec<DataFormatSpec> {
        self.data_formats
            .iter()
            .filter(|d| video.stereo_capable || !d.is_stereo())
            .cloned()
            .collect()
    }

    /// Catalog of a movie-writer device: one video format, every data format
    pub fn for_writer(video: VideoFormat, stereo: bool) -> Self {
        let suffix = if stereo { " Stereo" } else { "" };
        Self {
            data_formats: DataFormat::ALL
                .into_iter()
                .map(|f| DataFormatSpec::new(f, format!("{}{}", f.name(), suffix)))
                .collect(),
            video_formats: vec![video.with_stereo(stereo)],
            sync_modes: Vec::new(),
            sync_sources: Vec::new(),
            audio_formats: default_audio_formats(),
        }
    }

    /// Catalog of a typical SDI playout card
    pub fn standard_playout() -> Self {
        let hd = |res, rate, name: &str| VideoFormat::new(res, rate, name).with_stereo(true);
        let uhd = |res, rate, name: &str| VideoFormat::new(res, rate, name);
        let video_formats = vec![
            hd(Resolution::HD_720P, Framerate::FPS_50, "1280x720 50Hz"),
            hd(Resolution::HD_720P, Framerate::FPS_59_94, "1280x720 59.94Hz"),
            hd(Resolution::HD_720P, Framerate::FPS_60, "1280x720 60Hz"),
            hd(Resolution::FHD_1080P, Framerate::FPS_23_98, "1920x1080 23.98Hz"),
            hd(Resolution::FHD_1080P, Framerate::FPS_24, "1920x1080 24Hz"),
            hd(Resolution::FHD_1080P, Framerate::FPS_25, "1920x1080 25Hz"),
            hd(Resolution::FHD_1080P, Framerate::FPS_29_97, "1920x1080 29.97Hz"),
            hd(Resolution::FHD_1080P, Framerate::FPS_30, "1920x1080 30Hz"),
            hd(Resolution::FHD_1080P, Framerate::FPS_50, "1920x1080 50Hz"),
            hd(Resolution::FHD_1080P, Framerate::FPS_59_94, "1920x1080 59.94Hz"),
            hd(Resolution::FHD_1080P, Framerate::FPS_60, "1920x1080 60Hz"),
            hd(Resolution::DCI_2K, Framerate::FPS_23_98, "2048x1080 23.98Hz"),
            hd(Resolution::DCI_2K, Framerate::FPS_24, "2048x1080 24Hz"),
            hd(Resolution::DCI_2K, Framerate::FPS_25, "2048x1080 25Hz"),
            uhd(Resolution::UHD_4K, Framerate::FPS_23_98, "3840x2160 23.98Hz"),
            uhd(Resolution::UHD_4K, Framerate::FPS_24, "3840x2160 24Hz"),
            uhd(Resolution::UHD_4K, Framerate::FPS_25, "3840x2160 25Hz"),
            uhd(Resolution::UHD_4K, Framerate::FPS_29_97, "3840x2160 29.97Hz"),
            uhd(Resolution::UHD_4K, Framerate::FPS_30, "3840x2160 30Hz"),
            uhd(Resolution::UHD_4K, Framerate::FPS_50, "3840x2160 50Hz"),
            uhd(Resolution::UHD_4K, Framerate::FPS_59_94, "3840x2160 59.94Hz"),
            uhd(Resolution::UHD_4K, Framerate::FPS_60, "3840x2160 60Hz"),
            uhd(Resolution::DCI_4K, Framerate::FPS_24, "4096x2160 24Hz"),
        ];

        let mut data_formats = Vec::new();
        for stereo in [false, true] {
            let suffix = if stereo { " Stereo" } else { "" };
            for (format, name) in [
                (DataFormat::CbY0CrY1_8, "8 Bit YCbCr 4:2:2"),
                (DataFormat::YCbCr10_422, "10 Bit YCbCr 4:2:2"),
                (DataFormat::Bgra8, "8 Bit RGBA"),
                (DataFormat::Rgb10X2, "10 Bit RGB"),
            ] {
                data_formats.push(DataFormatSpec::new(format, format!("{}{}", name, suffix)));
            }
        }

        Self {
            video_formats,
            data_formats,
            sync_modes: vec![
                SyncMode { name: "Free Running".into() },
                SyncMode { name: "Genlock".into() },
            ],
            sync_sources: vec![
                SyncSource { name: "Internal".into() },
                SyncSource { name: "Reference In".into() },
                SyncSource { name: "SDI In".into() },
            ],
            audio_formats: default_audio_formats(),
        }
    }
}

fn default_audio_formats() -> Vec<AudioFormat> {
    vec![
        AudioFormat::new(48000, SampleFormat::Float32, 2, "48kHz 32-bit float stereo"),
        AudioFormat::new(48000, SampleFormat::Int32, 2, "48kHz 32-bit stereo"),
        AudioFormat::new(48000, SampleFormat::Int16, 2, "48kHz 16-bit stereo"),
        AudioFormat::new(48000, SampleFormat::Int32, 8, "48kHz 32-bit 7.1"),
        AudioFormat::new(48000, SampleFormat::Int32, 16, "48kHz 32-bit 16 channel"),
    ]
}

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

/// Samples per video frame, one full cadence cycle long
///
/// Fractional rates produce a repeating pattern, e.g. 48 kHz at 29.97 gives
/// 1602, 1601, 1602, 1601, 1602.
pub fn audio_frame_size_sequence(sample_rate: u32, rate: Framerate) -> Vec<usize> {
    if rate.num == 0 || sample_rate == 0 {
        return Vec::new();
    }
    let a = sample_rate as u64 * rate.den as u64;
    let b = rate.num as u64;
    let cycle = (b / gcd(a, b)).clamp(1, MAX_AUDIO_CYCLE);
    let rounded = |k: u64| (2 * k * a + b) / (2 * b);
    (0..cycle)
        .map(|k| (rounded(k + 1) - rounded(k)) as usize)
        .collect()
}

/// Hex FNV-1a hash of an identifier with all whitespace removed
///
/// The value is persisted by callers and must not change between builds.
pub fn hash_id(text: &str) -> String {
    let hash = text
        .chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(|c| {
            let mut buf = [0u8; 4];
            c.encode_utf8(&mut buf).as_bytes().to_vec()
        })
        .fold(FNV_OFFSET, |hash, byte| {
            (hash ^ u64::from(byte)).wrapping_mul(FNV_PRIME)
        });
    format!("{:016x}", hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_cadence() {
        assert_eq!(
            audio_frame_size_sequence(48000, Framerate::FPS_29_97),
            vec![1602, 1601, 1602, 1601, 1602]
        );
        assert_eq!(audio_frame_size_sequence(48000, Framerate::FPS_24), vec![2000]);
        assert_eq!(audio_frame_size_sequence(48000, Framerate::FPS_23_98), vec![2002]);

        let sixty = audio_frame_size_sequence(48000, Framerate::FPS_59_94);
        assert_eq!(sixty.len(), 5);
        assert_eq!(sixty.iter().sum::<usize>(), 4004);
    }

    #[test]
    fn test_stereo_filtering() {
        let catalog = FormatCatalog::standard_playout();
        let hd = &catalog.video_formats[4];
        let uhd = catalog.video_formats.last().unwrap();
        assert_eq!(catalog.data_formats_for(hd).len(), 8);
        assert_eq!(catalog.data_formats_for(uhd).len(), 4);
        assert!(catalog.data_formats[4].is_stereo());
    }

    #[test]
    fn test_writer_catalog() {
        let video = VideoFormat::new(Resolution::new(640, 480), Framerate::FPS_30, "640x480");
        let catalog = FormatCatalog::for_writer(video, true);
        assert_eq!(catalog.video_formats.len(), 1);
        assert!(catalog.data_formats.iter().all(|d| d.is_stereo()));
        assert!(catalog.sync_modes.is_empty());
    }

    #[test]
    fn test_hash_ignores_whitespace() {
        assert_eq!(hash_id("1920x1080 24Hz"), hash_id("1920x1080\t24 Hz"));
        assert_ne!(hash_id("1920x1080 24Hz"), hash_id("1920x1080 25Hz"));
    }

    #[test]
    fn test_hash_is_fnv1a() {
        assert_eq!(hash_id(""), "cbf29ce484222325");
        assert_eq!(hash_id("a"), "af63dc4c8601ec8c");
        assert_eq!(hash_id(" a\n"), hash_id("a"));
    }
}
