//! Output module
//!
//! Owns the GPU handle and every device created from it. Nothing here is
//! process-wide: build a module, add devices, call `shutdown` when done.

use crate::config::DeviceConfig;
use crate::device::{OutputDevice, DEFAULT_MODULE_NAME};
use crate::error::Result;
use crate::gpu::GpuBackend;
use crate::output::{DefaultWriterFactory, ScheduledOutput, WriterFactory};
use std::sync::Arc;

/// Name of the writer device added by [`OutputModule::with_movie_writer`]
pub const MOVIE_WRITER_NAME: &str = "Movie Writer";

/// Registry of output devices sharing one GPU
pub struct OutputModule {
    name: String,
    gpu: Arc<dyn GpuBackend>,
    devices: Vec<Arc<OutputDevice>>,
}

impl OutputModule {
    pub fn new(name: impl Into<String>, gpu: Arc<dyn GpuBackend>) -> Self {
        let name = name.into();
        tracing::debug!("Output module {} on {}", name, gpu.name());
        Self {
            name,
            gpu,
            devices: Vec::new(),
        }
    }

    /// Module with the default raw/null movie writer device
    pub fn with_movie_writer(gpu: Arc<dyn GpuBackend>, config: DeviceConfig) -> Self {
        let mut module = Self::new(DEFAULT_MODULE_NAME, gpu);
        module.add_writer_device(MOVIE_WRITER_NAME, Arc::new(DefaultWriterFactory), config);
        module
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn gpu(&self) -> &Arc<dyn GpuBackend> {
        &self.gpu
    }

    pub fn add_writer_device(
        &mut self,
        name: impl Into<String>,
        factory: Arc<dyn WriterFactory>,
        config: DeviceConfig,
    ) -> Arc<OutputDevice> {
        let device = OutputDevice::new_writer(name, self.gpu.clone(), factory, config)
            .with_module(self.name.clone());
        self.register(device)
    }

    /// Add a device for a playout card; the device takes the card's name
    pub fn add_playout_device(
        &mut self,
        card: Arc<dyn ScheduledOutput>,
        config: DeviceConfig,
    ) -> Arc<OutputDevice> {
        let name = card.name().to_string();
        let device = OutputDevice::new_playout(name, self.gpu.clone(), card, config)
            .with_module(self.name.clone());
        self.register(device)
    }

    fn register(&mut self, device: OutputDevice) -> Arc<OutputDevice> {
        let device = Arc::new(device);
        tracing::info!("{}: added device {}", self.name, device.name());
        self.devices.push(device.clone());
        device
    }

    pub fn devices(&self) -> &[Arc<OutputDevice>] {
        &self.devices
    }

    pub fn device_by_name(&self, name: &str) -> Option<Arc<OutputDevice>> {
        self.devices.iter().find(|d| d.name() == name).cloned()
    }

    /// Close every device and forget them; the first close error is returned
    pub fn shutdown(&mut self) -> Result<()> {
        let mut result = Ok(());
        for device in self.devices.drain(..) {
            if let Err(e) = device.close() {
                tracing::error!("{}: closing {} failed: {}", self.name, device.name(), e);
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }
}

impl Drop for OutputModule {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::IdType;
    use crate::gpu::{SoftwareGpu, SoftwareGpuConfig};
    use crate::output::SimulatedPlayout;

    fn gpu() -> Arc<SoftwareGpu> {
        Arc::new(SoftwareGpu::new(SoftwareGpuConfig::default()))
    }

    #[test]
    fn test_registry_lookup() {
        let mut module = OutputModule::with_movie_writer(gpu(), DeviceConfig::default());
        let card = module.add_playout_device(
            Arc::new(SimulatedPlayout::new("Card 1")),
            DeviceConfig::default(),
        );

        assert_eq!(module.devices().len(), 2);
        assert!(module.device_by_name(MOVIE_WRITER_NAME).is_some());
        assert!(module.device_by_name("Card 2").is_none());
        assert!(card.is_playout());
        assert_eq!(card.id(IdType::DeviceName), "framelink/Card 1");
    }

    #[test]
    fn test_shutdown_closes_open_devices() {
        let mut module = OutputModule::new("test", gpu());
        let device = module.add_writer_device(
            "null",
            Arc::new(DefaultWriterFactory),
            DeviceConfig::default(),
        );
        device.open(&["--size", "8", "4", "-o", "null"]).unwrap();
        assert!(device.is_open());

        module.shutdown().unwrap();
        assert!(!device.is_open());
        assert!(module.devices().is_empty());
        assert_eq!(device.module_name(), "test");
    }
}
