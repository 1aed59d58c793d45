//! Error types for framelink

use crate::gpu::GpuError;
use thiserror::Error;

/// Result type alias for framelink operations
pub type Result<T> = std::result::Result<T, Error>;

/// framelink error type
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid video format index {0}")]
    InvalidVideoFormat(usize),

    #[error("Invalid data format index {0}")]
    InvalidDataFormat(usize),

    #[error("Invalid sync mode index {0}")]
    InvalidSyncMode(usize),

    #[error("Invalid sync source index {0}")]
    InvalidSyncSource(usize),

    #[error("Invalid audio format index {0}")]
    InvalidAudioFormat(usize),

    #[error("Config file error: {0}")]
    ConfigFile(#[from] toml::de::Error),

    // Lifecycle errors
    #[error("Device not open")]
    DeviceNotOpen,

    #[error("Device already open")]
    DeviceAlreadyOpen,

    #[error("Device closed unexpectedly: {0}")]
    DeviceClosedUnexpectedly(String),

    // GPU errors
    #[error("GPU error: {0}")]
    Gpu(#[from] GpuError),

    #[error("Timeout: {0}")]
    Timeout(String),

    // Output errors
    #[error("Movie writer error: {0}")]
    Writer(String),

    #[error("Playout error: {0}")]
    Playout(String),

    // General errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Check if this error is recoverable without reopening the device
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::Gpu(e) => !e.is_fatal(),
            Error::Writer(_) | Error::Playout(_) => true,
            _ => false,
        }
    }

    /// Check if this error leaves the device unusable until it is reopened
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::Gpu(e) => e.is_fatal(),
            Error::Timeout(_) | Error::DeviceClosedUnexpectedly(_) | Error::Internal(_) => true,
            _ => false,
        }
    }

    /// Check if this is a configuration problem reported before any state changed
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            Error::Config(_)
                | Error::InvalidVideoFormat(_)
                | Error::InvalidDataFormat(_)
                | Error::InvalidSyncMode(_)
                | Error::InvalidSyncSource(_)
                | Error::InvalidAudioFormat(_)
                | Error::ConfigFile(_)
        )
    }
}
