//! framelink CLI
//!
//! Command-line driver for trying output devices with a synthetic renderer.

use anyhow::Context;
use clap::{Parser, Subcommand};
use framelink::config::{DEFAULT_PLAYOUT_RING_SIZE, DEFAULT_WRITER_RING_SIZE};
use framelink::gpu::{SoftwareGpu, SoftwareGpuConfig};
use framelink::module::MOVIE_WRITER_NAME;
use framelink::{
    Capabilities, DataFormat, DeviceConfig, FormatCatalog, GpuBackend, OutputDevice,
    OutputModule, SimulatedPlayout, Stats,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Parser)]
#[command(name = "framelink")]
#[command(about = "GPU frame readback and video output")]
#[command(version)]
struct Cli {
    /// Pipeline tuning file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show backends, defaults and device capabilities
    Info,

    /// List the formats of the simulated playout card
    Formats,

    /// Render synthetic frames into a device
    Run {
        /// Movie writer target; `#` runs number one file per frame
        #[arg(short, long, default_value = "null")]
        output: String,

        /// Drive the simulated playout card instead of a movie writer
        #[arg(long)]
        playout: bool,

        /// Frames to render (0 runs until Ctrl+C)
        #[arg(short, long, default_value = "240")]
        frames: u64,

        /// Resolution (e.g., 1920x1080)
        #[arg(short, long, default_value = "1920x1080")]
        resolution: String,

        /// Framerate
        #[arg(long, default_value = "24")]
        fps: f64,

        /// Pixel format (RGBA8, UYVY, V210, ...)
        #[arg(short = 'F', long)]
        format: Option<String>,

        /// Render both eyes
        #[arg(long)]
        stereo: bool,

        /// Render at the output frame rate instead of as fast as possible
        #[arg(long)]
        realtime: bool,

        /// Extra device option tokens
        #[arg(last = true)]
        tokens: Vec<String>,
    },

    /// Measure readback and packing throughput
    Bench {
        /// Number of frames to transfer
        #[arg(short, long, default_value = "300")]
        frames: u64,

        /// Resolution (e.g., 1920x1080)
        #[arg(short, long, default_value = "1920x1080")]
        resolution: String,

        /// Pixel format
        #[arg(short = 'F', long, default_value = "RGBA8")]
        format: String,

        /// Readback method (pbo, basic)
        #[arg(short, long, default_value = "pbo")]
        method: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("framelink=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => DeviceConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => DeviceConfig::default(),
    };

    match cli.command {
        Commands::Info => cmd_info(config),
        Commands::Formats => cmd_formats(),
        Commands::Run {
            output,
            playout,
            frames,
            resolution,
            fps,
            format,
            stereo,
            realtime,
            tokens,
        } => {
            let run = RunArgs {
                config,
                output,
                playout,
                frames,
                resolution,
                fps,
                format,
                stereo,
                realtime,
                tokens,
            };
            cmd_run(run).await
        }
        Commands::Bench {
            frames,
            resolution,
            format,
            method,
        } => cmd_bench(config, frames, resolution, format, method).await,
    }
}

fn software_gpu() -> Arc<SoftwareGpu> {
    Arc::new(SoftwareGpu::new(SoftwareGpuConfig::default()))
}

fn parse_resolution(text: &str) -> anyhow::Result<(String, String)> {
    let (w, h) = text
        .split_once('x')
        .with_context(|| format!("bad resolution '{}', expected WIDTHxHEIGHT", text))?;
    Ok((w.trim().to_string(), h.trim().to_string()))
}

fn capability_names(caps: Capabilities) -> Vec<&'static str> {
    [
        (Capabilities::IMAGE_OUTPUT, "image output"),
        (Capabilities::PROVIDES_SYNC, "provides sync"),
        (Capabilities::FIXED_RESOLUTION, "fixed resolution"),
        (Capabilities::CLOCK, "clock"),
        (Capabilities::AUDIO_OUTPUT, "audio output"),
        (Capabilities::BLOCKING_TRANSFER, "blocking transfer"),
        (Capabilities::ASYNC_READBACK, "async readback"),
    ]
    .into_iter()
    .filter(|(flag, _)| caps.contains(*flag))
    .map(|(_, name)| name)
    .collect()
}

fn cmd_info(config: DeviceConfig) -> anyhow::Result<()> {
    println!("framelink {}", framelink::VERSION);
    println!("==============\n");

    let gpu = software_gpu();
    println!("=== GPU ===");
    println!("Backend: {}", gpu.name());
    println!(
        "Pixel buffers: {}",
        if gpu.supports_pixel_buffers() { "Yes" } else { "No" }
    );
    println!("Pack alignment: {}", gpu.pack_alignment());

    println!("\n=== Defaults ===");
    println!("Readback method: {}", config.method);
    println!("Writer ring size: {}", DEFAULT_WRITER_RING_SIZE);
    println!("Playout ring size: {}", DEFAULT_PLAYOUT_RING_SIZE);
    println!("Preroll: {} frames", config.preroll_frames);
    println!(
        "Fence timeout: {} ms x {} retries",
        config.fence_timeout_ms, config.fence_retries
    );

    let mut module = OutputModule::with_movie_writer(gpu, config.clone());
    module.add_playout_device(Arc::new(SimulatedPlayout::new("Simulated SDI")), config);
    println!("\n=== Devices ===");
    for device in module.devices() {
        println!("{}", device.name());
        println!("  Capabilities: {}", capability_names(device.capabilities()).join(", "));
        println!("  Ring size: {}", device.async_max_mapped_buffers());
        println!("  Formats: {} video, {} data", device.num_video_formats(), device.num_data_formats());
    }
    module.shutdown()?;

    Ok(())
}

fn cmd_formats() -> anyhow::Result<()> {
    let catalog = FormatCatalog::standard_playout();

    println!("Video formats:");
    for (i, video) in catalog.video_formats.iter().enumerate() {
        println!(
            "  {:>2}  {:<20} {}",
            i,
            video.description,
            if video.stereo_capable { "stereo" } else { "" }
        );
    }
    println!("\nData formats:");
    for (i, data) in catalog.data_formats.iter().enumerate() {
        println!("  {:>2}  {:<28} {}", i, data.description, data.format);
    }
    println!("\nSync modes:");
    for (i, mode) in catalog.sync_modes.iter().enumerate() {
        println!("  {:>2}  {}", i, mode.name);
    }
    println!("\nSync sources:");
    for (i, source) in catalog.sync_sources.iter().enumerate() {
        println!("  {:>2}  {}", i, source.name);
    }
    println!("\nAudio formats:");
    for (i, audio) in catalog.audio_formats.iter().enumerate() {
        println!("  {:>2}  {}", i, audio.description);
    }

    Ok(())
}

struct RunArgs {
    config: DeviceConfig,
    output: String,
    playout: bool,
    frames: u64,
    resolution: String,
    fps: f64,
    format: Option<String>,
    stereo: bool,
    realtime: bool,
    tokens: Vec<String>,
}

async fn cmd_run(args: RunArgs) -> anyhow::Result<()> {
    println!("Starting output...\n");

    let stop = Arc::new(AtomicBool::new(false));
    let render_stop = stop.clone();
    let mut render = tokio::task::spawn_blocking(move || render_loop(args, &render_stop));

    let stats = tokio::select! {
        result = &mut render => result??,
        _ = tokio::signal::ctrl_c() => {
            println!("\nStopping...");
            stop.store(true, Ordering::Relaxed);
            render.await??
        }
    };

    print_stats(&stats);
    Ok(())
}

fn render_loop(args: RunArgs, stop: &AtomicBool) -> anyhow::Result<Stats> {
    let gpu = software_gpu();
    let mut module = OutputModule::new(framelink::device::DEFAULT_MODULE_NAME, gpu.clone());
    let device = if args.playout {
        module.add_playout_device(Arc::new(SimulatedPlayout::new("Simulated SDI")), args.config.clone())
    } else {
        module.add_writer_device(
            MOVIE_WRITER_NAME,
            Arc::new(framelink::output::DefaultWriterFactory),
            args.config.clone(),
        )
    };

    let (width, height) = parse_resolution(&args.resolution)?;
    let mut tokens = vec![
        "--size".to_string(),
        width,
        height,
        "--fps".to_string(),
        args.fps.to_string(),
    ];
    if let Some(format) = &args.format {
        tokens.extend(["-f".to_string(), format.clone()]);
    }
    if args.stereo {
        tokens.push("--stereo".to_string());
    }
    if !args.playout {
        tokens.extend(["-o".to_string(), args.output.clone()]);
    }
    tokens.extend(args.tokens.iter().cloned());

    device.open(&tokens)?;
    println!("Configuration:");
    println!("  Device: {}", device.name());
    println!("  Resolution: {}x{}", device.width(), device.height());
    if let Some(rate) = device.timing() {
        println!("  Rate: {}", rate);
    }
    if let Some(format) = device.format() {
        println!("  Format: {}", format);
    }
    println!("  Stereo: {}", if device.is_stereo() { "Yes" } else { "No" });
    println!();

    let result = render_frames(&gpu, &device, &args, stop);
    let close = device.close();
    let stats = device.stats();
    module.shutdown()?;
    result?;
    close?;
    Ok(stats)
}

fn render_frames(
    gpu: &SoftwareGpu,
    device: &OutputDevice,
    args: &RunArgs,
    stop: &AtomicBool,
) -> anyhow::Result<()> {
    let resolution = device.resolution().context("device has no video format")?;
    let format = device.format().unwrap_or(DataFormat::Rgba8);
    let left = gpu.create_framebuffer(resolution, format);
    let right = gpu.create_framebuffer(resolution, format);
    let interval = device
        .timing()
        .map_or(Duration::from_millis(40), |r| r.frame_duration());

    let start = Instant::now();
    let mut frame = 0u64;
    while (args.frames == 0 || frame < args.frames) && !stop.load(Ordering::Relaxed) {
        if args.realtime {
            let deadline = start + interval.mul_f64(frame as f64);
            let now = Instant::now();
            if deadline > now {
                std::thread::sleep(deadline - now);
            }
        }

        gpu.fill(&left, (frame % 256) as u8)?;
        if device.is_stereo() {
            gpu.fill(&right, (255 - frame % 256) as u8)?;
            device.transfer2(&left, &right)?;
        } else {
            device.transfer(&left)?;
        }
        frame += 1;
    }

    let elapsed = start.elapsed();
    println!(
        "Rendered {} frames in {:.2}s ({:.1} fps)",
        frame,
        elapsed.as_secs_f64(),
        frame as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
    );
    Ok(())
}

fn print_stats(stats: &Stats) {
    println!("\nStatistics:");
    println!("  Frames submitted: {}", stats.frames_submitted);
    println!("  Frames output: {}", stats.frames_output);
    println!("  Frames repeated: {}", stats.frames_repeated);
    println!("  Frames failed: {}", stats.frames_failed);
    println!("  Frames late: {}", stats.frames_late);
    println!("  Frames dropped: {}", stats.frames_dropped);
    println!("  Fence timeouts: {}", stats.fence_timeouts);
    println!("  Backpressure waits: {}", stats.backpressure_waits);
}

async fn cmd_bench(
    config: DeviceConfig,
    frames: u64,
    resolution: String,
    format: String,
    method: String,
) -> anyhow::Result<()> {
    println!("framelink Readback Benchmark");
    println!("============================\n");

    let (width, height) = parse_resolution(&resolution)?;
    let tokens = vec![
        "--size".to_string(),
        width,
        height,
        "-f".to_string(),
        format.clone(),
        "-m".to_string(),
        method.clone(),
        "-o".to_string(),
        "null".to_string(),
    ];

    println!("Resolution: {}", resolution);
    println!("Format: {}", format);
    println!("Method: {}", method);
    println!("Frames: {}", frames);
    println!();
    println!("Running benchmark...\n");

    let (elapsed, stats) = tokio::task::spawn_blocking(move || -> anyhow::Result<_> {
        let gpu = software_gpu();
        let module = OutputModule::with_movie_writer(gpu.clone(), config);
        let device = module.devices()[0].clone();
        device.open(&tokens)?;

        let resolution = device.resolution().context("device has no video format")?;
        let fbo = gpu.create_framebuffer(resolution, device.format().unwrap_or(DataFormat::Rgba8));
        let start = Instant::now();
        for i in 0..frames {
            gpu.fill(&fbo, (i % 256) as u8)?;
            device.transfer(&fbo)?;
        }
        device.close()?;
        Ok((start.elapsed(), device.stats()))
    })
    .await??;

    let fps = frames as f64 / elapsed.as_secs_f64().max(f64::EPSILON);
    let ms_per_frame = elapsed.as_secs_f64() * 1000.0 / frames.max(1) as f64;

    println!("Results:");
    println!("  Total time: {:.2}s", elapsed.as_secs_f64());
    println!("  Transfer FPS: {:.1}", fps);
    println!("  ms/frame: {:.2}", ms_per_frame);
    println!(
        "  Realtime capable (24fps): {}",
        if fps >= 24.0 { "Yes" } else { "No" }
    );
    println!(
        "  Realtime capable (60fps): {}",
        if fps >= 60.0 { "Yes" } else { "No" }
    );
    print_stats(&stats);

    Ok(())
}
