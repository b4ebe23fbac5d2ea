//! Remote-focus calibration of the deformable mirror.
//!
//! A calibration table maps logical focus positions to actuator vectors, one row per measured
//! position (`position a1 a2 ... an`, whitespace separated, the shape of `remote_focus_LUT.txt`).
//! Positions that were measured are reproduced exactly; everything else goes through a
//! per-actuator least-squares line fitted over the table.
//!
//! New calibration rows are accumulated at run time in a [`CalibrationLog`] and handed to a
//! [`CalibrationStore`] once execution is over.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ndarray::{Array1, Array2};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{DeviceError, DeviceResult};

/// User-config key under which the last calibration is mirrored.
pub const LUT_CONFIG_KEY: &str = "dm_remote_focus_LUT";

#[derive(Clone, Debug, PartialEq)]
pub struct CalibrationTable {
    rows: Vec<Vec<f64>>,
}

impl CalibrationTable {
    /// Every row must carry a position followed by the same, non-zero, number of actuator values.
    pub fn from_rows(rows: Vec<Vec<f64>>) -> DeviceResult<Self> {
        let width = match rows.first() {
            Some(row) => row.len(),
            None => return Err(DeviceError::Calibration("table has no rows".to_string())),
        };
        if width < 2 {
            return Err(DeviceError::Calibration(
                "rows need a position and at least one actuator value".to_string(),
            ));
        }
        if let Some(i) = rows.iter().position(|r| r.len() != width) {
            return Err(DeviceError::Calibration(format!(
                "row {} has {} columns, expected {}",
                i,
                rows[i].len(),
                width
            )));
        }
        Ok(Self { rows })
    }

    /// Parses the text format. Blank lines and `#` comments are skipped.
    pub fn parse(text: &str) -> DeviceResult<Self> {
        let mut rows = Vec::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let row = line
                .split_whitespace()
                .map(str::parse::<f64>)
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| {
                    DeviceError::Calibration(format!("line {}: {}", lineno + 1, e))
                })?;
            rows.push(row);
        }
        Self::from_rows(rows)
    }

    pub fn load(path: &Path) -> DeviceResult<Self> {
        Self::parse(&fs::read_to_string(path)?)
    }

    pub fn to_text(&self) -> String {
        let mut text = String::new();
        for row in &self.rows {
            let fields: Vec<String> = row.iter().map(|v| format!("{v:.18e}")).collect();
            text.push_str(&fields.join(" "));
            text.push('\n');
        }
        text
    }

    pub fn rows(&self) -> &[Vec<f64>] {
        &self.rows
    }

    pub fn n_actuators(&self) -> usize {
        self.rows.first().map_or(0, |r| r.len() - 1)
    }

    /// Actuator values recorded for exactly `position`, first match wins.
    pub fn row_for(&self, position: f64) -> Option<&[f64]> {
        self.rows
            .iter()
            .find(|r| r[0] == position)
            .map(|r| &r[1..])
    }
}

/// Maps logical positions to actuator vectors.
#[derive(Clone, Debug, PartialEq)]
pub struct ActuatorFit {
    slopes: Array1<f64>,
    intercepts: Array1<f64>,
    exact: Option<CalibrationTable>,
}

impl ActuatorFit {
    /// Flat fit used when no calibration is available: every position maps to all zeros.
    pub fn zeros(n_actuators: usize) -> Self {
        Self {
            slopes: Array1::zeros(n_actuators),
            intercepts: Array1::zeros(n_actuators),
            exact: None,
        }
    }

    /// Ordinary least squares per actuator over the positions of `table`, sorted ascending.
    /// With fewer than two distinct positions the line is flat at the mean.
    pub fn from_table(table: &CalibrationTable) -> Self {
        let mut rows: Vec<&Vec<f64>> = table.rows().iter().collect();
        rows.sort_by(|a, b| a[0].total_cmp(&b[0]));
        let n = rows.len() as f64;
        let n_actuators = table.n_actuators();

        let pos: Array1<f64> = rows.iter().map(|r| r[0]).collect();
        let mean_pos = pos.sum() / n;
        let centered = &pos - mean_pos;
        let sxx = centered.dot(&centered);

        let mut slopes = Array1::zeros(n_actuators);
        let mut intercepts = Array1::zeros(n_actuators);
        for k in 0..n_actuators {
            let values: Array1<f64> = rows.iter().map(|r| r[k + 1]).collect();
            let mean_val = values.sum() / n;
            let slope = if sxx > 0.0 {
                centered.dot(&(&values - mean_val)) / sxx
            } else {
                0.0
            };
            slopes[k] = slope;
            intercepts[k] = mean_val - slope * mean_pos;
        }
        debug!(
            "fitted {} actuators over {} calibration positions",
            n_actuators,
            rows.len()
        );
        Self {
            slopes,
            intercepts,
            exact: Some(table.clone()),
        }
    }

    pub fn n_actuators(&self) -> usize {
        self.slopes.len()
    }

    pub fn slopes(&self) -> &Array1<f64> {
        &self.slopes
    }

    pub fn intercepts(&self) -> &Array1<f64> {
        &self.intercepts
    }

    /// One row of actuator values per position.
    pub fn encode(&self, positions: &[f64]) -> Array2<f64> {
        let mut out = Array2::zeros((positions.len(), self.n_actuators()));
        for (mut row, &p) in out.outer_iter_mut().zip(positions) {
            match self.exact.as_ref().and_then(|t| t.row_for(p)) {
                Some(values) => row.assign(&Array1::from(values.to_vec())),
                None => row.assign(&(&self.slopes * p + &self.intercepts)),
            }
        }
        out
    }
}

/// Calibration rows recorded during execution, shared between the device and whoever persists
/// them. Clones refer to the same log.
#[derive(Clone, Debug, Default)]
pub struct CalibrationLog {
    entries: Arc<Mutex<Vec<Vec<f64>>>>,
}

impl CalibrationLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, entry: Vec<f64>) {
        self.entries.lock().push(entry);
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn snapshot(&self) -> Vec<Vec<f64>> {
        self.entries.lock().clone()
    }
}

/// Destination of a finished calibration.
pub trait CalibrationStore {
    fn save(&self, entries: &[Vec<f64>]) -> DeviceResult<()>;
}

/// Writes the calibration as a LUT text file and mirrors it under [`LUT_CONFIG_KEY`] in a JSON
/// user-config file, keeping the other keys of that file.
#[derive(Clone, Debug)]
pub struct FileCalibrationStore {
    lut_path: PathBuf,
    user_config_path: PathBuf,
}

impl FileCalibrationStore {
    pub fn new(lut_path: impl Into<PathBuf>, user_config_path: impl Into<PathBuf>) -> Self {
        Self {
            lut_path: lut_path.into(),
            user_config_path: user_config_path.into(),
        }
    }

    pub fn lut_path(&self) -> &Path {
        &self.lut_path
    }

    fn read_user_config(&self) -> DeviceResult<Map<String, Value>> {
        if !self.user_config_path.exists() {
            return Ok(Map::new());
        }
        match serde_json::from_str(&fs::read_to_string(&self.user_config_path)?)? {
            Value::Object(map) => Ok(map),
            _ => Err(DeviceError::Calibration(format!(
                "{} does not hold a JSON object",
                self.user_config_path.display()
            ))),
        }
    }
}

impl CalibrationStore for FileCalibrationStore {
    fn save(&self, entries: &[Vec<f64>]) -> DeviceResult<()> {
        let table = CalibrationTable::from_rows(entries.to_vec())?;
        fs::write(&self.lut_path, table.to_text())?;

        let mut config = self.read_user_config()?;
        config.insert(LUT_CONFIG_KEY.to_string(), serde_json::to_value(entries)?);
        fs::write(
            &self.user_config_path,
            serde_json::to_string_pretty(&Value::Object(config))?,
        )?;
        debug!(
            "saved {} calibration rows to {}",
            entries.len(),
            self.lut_path.display()
        );
        Ok(())
    }
}
