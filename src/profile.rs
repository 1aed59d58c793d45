//! Transfer timing profile
//!
//! Enabled with `--profile`. Records when GPU readbacks were issued and how
//! long the output side took per frame, then reports a summary at close and
//! optionally dumps the raw samples as CSV.

use crate::error::Result;
use parking_lot::Mutex;
use std::io::Write;
use std::path::Path;
use std::time::Instant;

/// Samples ignored by the summary while caches warm up
const WARMUP_SAMPLES: usize = 5;

/// Begin time (seconds since the profiler started) and duration in ms
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub begin: f64,
    pub duration_ms: f64,
}

/// Average / min / max of one sample series
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TimingSummary {
    pub count: usize,
    pub avg_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
}

impl TimingSummary {
    fn from_samples(samples: &[Sample]) -> Self {
        let used = samples.get(WARMUP_SAMPLES..).unwrap_or_default();
        if used.is_empty() {
            return Self::default();
        }
        let mut min = f64::MAX;
        let mut max = f64::MIN;
        let mut total = 0.0;
        for s in used {
            min = min.min(s.duration_ms);
            max = max.max(s.duration_ms);
            total += s.duration_ms;
        }
        Self {
            count: used.len(),
            avg_ms: total / used.len() as f64,
            min_ms: min,
            max_ms: max,
        }
    }
}

impl std::fmt::Display for TimingSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "avg {:.3} ms, min {:.3} ms, max {:.3} ms over {} frames",
            self.avg_ms, self.min_ms, self.max_ms, self.count
        )
    }
}

/// Collected GPU and output timings of one pipeline
#[derive(Debug)]
pub struct Profiler {
    epoch: Instant,
    gpu: Mutex<Vec<Sample>>,
    output: Mutex<Vec<Sample>>,
}

impl Default for Profiler {
    fn default() -> Self {
        Self::new()
    }
}

impl Profiler {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            gpu: Mutex::new(Vec::new()),
            output: Mutex::new(Vec::new()),
        }
    }

    fn sample(&self, begin: Instant, end: Instant) -> Sample {
        Sample {
            begin: begin.saturating_duration_since(self.epoch).as_secs_f64(),
            duration_ms: end.saturating_duration_since(begin).as_secs_f64() * 1000.0,
        }
    }

    pub fn record_gpu(&self, begin: Instant, end: Instant) {
        let sample = self.sample(begin, end);
        self.gpu.lock().push(sample);
    }

    pub fn record_output(&self, begin: Instant, end: Instant) {
        let sample = self.sample(begin, end);
        self.output.lock().push(sample);
    }

    pub fn gpu_summary(&self) -> TimingSummary {
        TimingSummary::from_samples(&self.gpu.lock())
    }

    pub fn output_summary(&self) -> TimingSummary {
        TimingSummary::from_samples(&self.output.lock())
    }

    pub fn log_summary(&self, device: &str) {
        tracing::info!("{}: GPU readback {}", device, self.gpu_summary());
        tracing::info!("{}: output transfer {}", device, self.output_summary());
    }

    /// Dump every sample pair as CSV
    pub fn write_csv(&self, path: &Path) -> Result<()> {
        let gpu = self.gpu.lock().clone();
        let output = self.output.lock().clone();
        let mut file = std::io::BufWriter::new(std::fs::File::create(path)?);
        writeln!(file, "GPUStart,GPUDuration,OutputBegin,OutputDuration")?;
        for i in 0..gpu.len().max(output.len()) {
            let g = gpu.get(i);
            let o = output.get(i);
            writeln!(
                file,
                "{},{},{},{}",
                g.map_or(String::new(), |s| format!("{:.6}", s.begin)),
                g.map_or(String::new(), |s| format!("{:.3}", s.duration_ms)),
                o.map_or(String::new(), |s| format!("{:.6}", s.begin)),
                o.map_or(String::new(), |s| format!("{:.3}", s.duration_ms)),
            )?;
        }
        file.flush()?;
        Ok(())
    }
}

/// Records one GPU sample when dropped
pub struct GpuTransferScope<'a> {
    profiler: Option<&'a Profiler>,
    begin: Instant,
}

impl<'a> GpuTransferScope<'a> {
    pub fn new(profiler: Option<&'a Profiler>) -> Self {
        Self {
            profiler,
            begin: Instant::now(),
        }
    }
}

impl Drop for GpuTransferScope<'_> {
    fn drop(&mut self) {
        if let Some(profiler) = self.profiler {
            profiler.record_gpu(self.begin, Instant::now());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_summary_skips_warmup() {
        let profiler = Profiler::new();
        let t0 = Instant::now();
        for ms in [100, 100, 100, 100, 100, 2, 4, 6] {
            profiler.record_output(t0, t0 + Duration::from_millis(ms));
        }
        let summary = profiler.output_summary();
        assert_eq!(summary.count, 3);
        assert!((summary.avg_ms - 4.0).abs() < 1e-6);
        assert!((summary.min_ms - 2.0).abs() < 1e-6);
        assert!((summary.max_ms - 6.0).abs() < 1e-6);
        assert_eq!(profiler.gpu_summary(), TimingSummary::default());
    }

    #[test]
    fn test_scope_records_gpu_sample() {
        let profiler = Profiler::new();
        {
            let _scope = GpuTransferScope::new(Some(&profiler));
        }
        drop(GpuTransferScope::new(None));
        assert_eq!(profiler.gpu.lock().len(), 1);
    }

    #[test]
    fn test_csv_dump() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profile.csv");
        let profiler = Profiler::new();
        let t0 = Instant::now();
        profiler.record_gpu(t0, t0 + Duration::from_millis(1));
        profiler.record_gpu(t0, t0 + Duration::from_millis(2));
        profiler.record_output(t0, t0 + Duration::from_millis(3));
        profiler.write_csv(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "GPUStart,GPUDuration,OutputBegin,OutputDuration");
        assert_eq!(lines.len(), 3);
        assert!(lines[2].ends_with(",,"));
    }
}
