//! Rig description loaded from TOML.
//!
//! ```toml
//! [mirror]
//! n_actuators = 69
//! trigger_source = "dio"
//! trigger_line = "1"
//! settling_time_ms = 10
//! lut_path = "remote_focus_LUT.txt"
//! user_config_path = "cockpit.json"
//!
//! [stage]
//! name = "z"
//! speed_um_per_ms = 0.1
//! settle_time_ms = 5
//!
//! [[camera]]
//! name = "cam0"
//! readout_time_ms = 12.5
//! transform = "(lr=True, ud=False, rot=False)"
//! ```
//!
//! Every section is optional. Finding the file is up to the caller.

use std::fs;
use std::path::{Path, PathBuf};

use acqcompiler_backend::action::{HandlerKind, HandlerRef};
use acqcompiler_backend::camera::{CameraTiming, CameraTransform};
use acqcompiler_backend::experiment::LinearStage;
use acqcompiler_backend::exposure::BasicExposer;
use acqcompiler_backend::time::Time;
use serde::Deserialize;

use crate::error::DeviceResult;

fn default_mirror_name() -> String {
    "dm".to_string()
}

fn default_stage_name() -> String {
    "z".to_string()
}

fn default_settling_time() -> Time {
    Time::from_whole_millis(10)
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct MirrorConfig {
    #[serde(default = "default_mirror_name")]
    pub name: String,
    pub n_actuators: usize,
    #[serde(default)]
    pub trigger_source: Option<String>,
    #[serde(default)]
    pub trigger_line: Option<String>,
    #[serde(default = "default_settling_time")]
    pub settling_time_ms: Time,
    #[serde(default)]
    pub lut_path: Option<PathBuf>,
    #[serde(default)]
    pub user_config_path: Option<PathBuf>,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct StageConfig {
    #[serde(default = "default_stage_name")]
    pub name: String,
    pub speed_um_per_ms: f64,
    #[serde(default)]
    pub settle_time_ms: Time,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct CameraConfig {
    pub name: String,
    #[serde(default)]
    pub readout_time_ms: Time,
    #[serde(default)]
    pub transform: String,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct RigConfig {
    #[serde(default)]
    pub mirror: Option<MirrorConfig>,
    #[serde(default)]
    pub stage: Option<StageConfig>,
    #[serde(default, rename = "camera")]
    pub cameras: Vec<CameraConfig>,
}

impl MirrorConfig {
    /// Line the mirror's stepping pulses go to, named `source/line` when both are given.
    /// Without a line the pulses stay on the mirror's own handler.
    pub fn trigger_handler(&self) -> Option<HandlerRef> {
        let line = self.trigger_line.as_ref()?;
        let name = match &self.trigger_source {
            Some(source) => format!("{source}/{line}"),
            None => line.clone(),
        };
        Some(HandlerRef::new(HandlerKind::Trigger, &name))
    }
}

impl RigConfig {
    pub fn from_toml_str(text: &str) -> DeviceResult<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn load(path: &Path) -> DeviceResult<Self> {
        Self::from_toml_str(&fs::read_to_string(path)?)
    }

    /// Exposer knowing the readout time of every configured camera.
    pub fn exposer(&self) -> BasicExposer {
        self.cameras.iter().fold(BasicExposer::new(), |exposer, cam| {
            exposer.with_camera(
                HandlerRef::camera(&cam.name),
                CameraTiming::new(cam.readout_time_ms),
            )
        })
    }

    pub fn stage(&self) -> DeviceResult<Option<LinearStage>> {
        match &self.stage {
            Some(cfg) => Ok(Some(LinearStage::new(
                HandlerRef::stage(&cfg.name),
                cfg.speed_um_per_ms,
                cfg.settle_time_ms,
            )?)),
            None => Ok(None),
        }
    }

    /// Parsed transform of the named camera; cameras that are not configured are untransformed.
    pub fn camera_transform(&self, name: &str) -> DeviceResult<CameraTransform> {
        match self.cameras.iter().find(|c| c.name == name) {
            Some(cam) => Ok(CameraTransform::parse(&cam.transform)?),
            None => Ok(CameraTransform::default()),
        }
    }
}
