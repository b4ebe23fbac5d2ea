//! Scheduling core for microscopy acquisitions.
//!
//! An experiment generator ([`zstack`], [`storm`], [`rotator`]) turns experiment parameters into
//! an [`ActionTable`]: a time-ordered list of actions addressed to stages, cameras, lights and
//! devices, with exact decimal timestamps ([`time`]). Devices that need to may then rewrite
//! their own rows ([`device`]) before [`compile_experiment`] freezes the result into an
//! [`ExperimentSession`] for an executor.

pub mod action;
pub mod camera;
pub mod device;
pub mod error;
pub mod experiment;
pub mod exposure;
pub mod rotator;
pub mod session;
pub mod storm;
pub mod table;
pub mod time;
pub mod utils;
pub mod zstack;

#[cfg(feature = "python")]
pub mod python;

pub use action::{Action, ActionPayload, HandlerKind, HandlerRef, LineState, Marker};
pub use camera::{CameraTiming, CameraTransform};
pub use device::{ActionRewriter, Device};
pub use error::{ScheduleError, ScheduleResult};
pub use experiment::{compute_z_positions, Actuator, Experiment, ExperimentParams};
pub use exposure::{BasicExposer, ExposureSettings, Exposer};
pub use session::{compile_experiment, ExperimentSession};
pub use table::ActionTable;
pub use time::Time;
