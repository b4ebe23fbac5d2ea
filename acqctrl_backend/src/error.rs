//! Errors raised on the device side: configuration, calibration data, persistence and drivers.
//! Scheduling errors from the core crate pass through unchanged.

use acqcompiler_backend::error::ScheduleError;
use thiserror::Error;

pub type DeviceResult<T> = std::result::Result<T, DeviceError>;

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("calibration error: {0}")]
    Calibration(String),

    #[error("driver error: {0}")]
    Driver(String),
}
