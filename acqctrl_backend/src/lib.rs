//! Device side of the acquisition scheduler.
//!
//! [`acqcompiler_backend`] builds action tables; this crate holds the devices that post-process
//! and play back their own rows. The deformable mirror used for remote focusing is the one
//! device here that rewrites its rows, turning focus moves into trigger pulses over a queued
//! pattern cycle and recording new calibrations.

pub mod calibration;
pub mod config;
pub mod device;
pub mod error;

pub use calibration::{ActuatorFit, CalibrationLog, CalibrationStore, CalibrationTable};
pub use config::RigConfig;
pub use device::{DeformableMirror, MirrorDriver, SimulatedMirror};
pub use error::{DeviceError, DeviceResult};
