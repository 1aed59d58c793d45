//! framelink — GPU frame readback and video output
//!
//! Streams rendered frames off the GPU and into video outputs: SDI playout
//! cards and movie writers. Frame accurate, stereo aware, and throttled by
//! backpressure when the output is slower than the renderer.
//!
//! # Features
//!
//! - **Readback**: asynchronous pixel-buffer readback with fences, or blocking readback
//! - **Ring**: fixed ring of frame slots per eye, strict FIFO order
//! - **Output**: threaded movie writers or callback-driven playout cards
//! - **Underruns**: the last good frame is repeated and counted, never black
//!
//! # Example
//!
//! ```rust,no_run
//! use framelink::gpu::{SoftwareGpu, SoftwareGpuConfig};
//! use framelink::types::{DataFormat, Resolution};
//! use framelink::{DeviceConfig, OutputModule};
//! use std::sync::Arc;
//!
//! fn main() -> framelink::Result<()> {
//!     let gpu = Arc::new(SoftwareGpu::new(SoftwareGpuConfig::default()));
//!     let module = OutputModule::with_movie_writer(gpu.clone(), DeviceConfig::default());
//!     let device = module.devices()[0].clone();
//!
//!     device.open(&["--size", "1920", "1080", "--fps", "24", "-o", "shot.#.raw"])?;
//!     let fbo = gpu.create_framebuffer(Resolution::FHD_1080P, DataFormat::Rgba8);
//!     for _ in 0..48 {
//!         device.transfer(&fbo)?;
//!     }
//!     device.close()
//! }
//! ```

pub mod audio;
pub mod config;
pub mod device;
pub mod error;
pub mod formats;
pub mod gpu;
pub mod module;
pub mod output;
pub mod pipeline;
pub mod profile;
pub mod ring;
pub mod transfer;
pub mod types;

// Re-exports for convenience
pub use config::{DeviceConfig, DeviceOptions, Pacing, TransferMethod, WriteRequest};
pub use device::{Capabilities, DeviceStatus, IdType, OutputDevice};
pub use error::{Error, Result};
pub use formats::{AudioFormat, DataFormatSpec, FormatCatalog, VideoFormat};
pub use gpu::{FramebufferRef, GpuBackend, GpuError};
pub use module::OutputModule;
pub use output::{FrameWriter, OutputFrame, ScheduledOutput, SimulatedPlayout, StreamInfo};
pub use types::{DataFormat, Framerate, Resolution, Stats};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
