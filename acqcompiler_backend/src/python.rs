//! Python bindings, built with the `python` feature.
//!
//! Exposes Z-position computation and a small Z-stack planning class whose compiled result can be
//! inspected from Python as numpy arrays.
//!
//! # Example (python)
//! ```python
//! from acqcompiler_backend import ZStackPlan, compute_z_positions
//!
//! assert compute_z_positions(0.0, 2.0, 1.0) == [0.0, 1.0, 2.0]
//! plan = ZStackPlan("z", speed=1.0, settle_ms=5.0, start=0.0, height=4.0, step=1.0)
//! plan.add_exposure(["cam"], [("488", 10.0)])
//! session = plan.compile()
//! print(len(session), session.duration_ms(), session.times_ms())
//! ```

use indexmap::IndexMap;
use ndarray::Array1;
use pyo3::exceptions::PyValueError;
use pyo3::prelude::*;

use crate::action::HandlerRef;
use crate::camera::CameraTiming;
use crate::error::ScheduleError;
use crate::experiment::{self, ExperimentParams, LinearStage};
use crate::exposure::{BasicExposer, ExposureSettings};
use crate::session::{compile_experiment, ExperimentSession};
use crate::time::Time;
use crate::zstack::ZStackExperiment;

impl From<ScheduleError> for PyErr {
    fn from(err: ScheduleError) -> PyErr {
        PyValueError::new_err(err.to_string())
    }
}

#[pyfunction]
pub fn compute_z_positions(start: f64, stack_height: f64, step: f64) -> PyResult<Vec<f64>> {
    Ok(experiment::compute_z_positions(start, stack_height, step)?)
}

/// Builder for a Z-stack driven by a constant-speed stage.
#[pyclass]
pub struct ZStackPlan {
    stage: String,
    speed: f64,
    settle_ms: f64,
    start: f64,
    height: f64,
    step: f64,
    num_reps: usize,
    rep_duration_ms: Option<f64>,
    exposures: Vec<ExposureSettings>,
    readout_ms: IndexMap<String, f64>,
}

#[pymethods]
impl ZStackPlan {
    #[new]
    #[pyo3(signature = (stage, speed, settle_ms, start, height, step, num_reps=1, rep_duration_ms=None))]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        stage: &str,
        speed: f64,
        settle_ms: f64,
        start: f64,
        height: f64,
        step: f64,
        num_reps: usize,
        rep_duration_ms: Option<f64>,
    ) -> Self {
        Self {
            stage: stage.to_string(),
            speed,
            settle_ms,
            start,
            height,
            step,
            num_reps,
            rep_duration_ms,
            exposures: Vec::new(),
            readout_ms: IndexMap::new(),
        }
    }

    /// Appends one exposure group: cameras triggered together and `(light, duration_ms)` pairs.
    pub fn add_exposure(&mut self, cameras: Vec<String>, lights: Vec<(String, f64)>) -> PyResult<()> {
        let mut group = ExposureSettings::new();
        for camera in &cameras {
            group.add_camera(HandlerRef::camera(camera));
        }
        for (light, duration_ms) in &lights {
            group.add_light(HandlerRef::light(light), Time::from_millis(*duration_ms)?)?;
        }
        self.exposures.push(group);
        Ok(())
    }

    pub fn set_readout(&mut self, camera: &str, readout_ms: f64) {
        self.readout_ms.insert(camera.to_string(), readout_ms);
    }

    pub fn z_positions(&self) -> PyResult<Vec<f64>> {
        compute_z_positions(self.start, self.height, self.step)
    }

    pub fn compile(&self) -> PyResult<ActionSession> {
        let rep_duration = self.rep_duration_ms.map(Time::from_millis).transpose()?;
        let params = ExperimentParams::new(self.num_reps, rep_duration, self.exposures.clone())?;
        let stage = LinearStage::new(
            HandlerRef::stage(&self.stage),
            self.speed,
            Time::from_millis(self.settle_ms)?,
        )?;
        let experiment = ZStackExperiment::new(params, stage, self.start, self.height, self.step)?;

        let mut exposer = BasicExposer::new();
        for (camera, readout_ms) in &self.readout_ms {
            exposer = exposer.with_camera(
                HandlerRef::camera(camera),
                CameraTiming::new(Time::from_millis(*readout_ms)?),
            );
        }
        let inner = compile_experiment(&experiment, &exposer, &mut [])?;
        Ok(ActionSession { inner })
    }
}

/// Read-only view of a compiled experiment.
#[pyclass]
pub struct ActionSession {
    inner: ExperimentSession,
}

#[pymethods]
impl ActionSession {
    pub fn __len__(&self) -> usize {
        self.inner.len()
    }

    pub fn num_reps(&self) -> usize {
        self.inner.num_reps()
    }

    pub fn duration_ms(&self) -> PyResult<f64> {
        Ok(self.inner.duration()?.as_millis_f64())
    }

    /// Action timestamps as a float64 numpy array. Lossy; use `rows` for exact values.
    pub fn times_ms(&self, py: Python) -> PyObject {
        let arr: Array1<f64> = self.inner.iter().map(|a| a.time.as_millis_f64()).collect();
        numpy::PyArray::from_array(py, &arr).to_object(py)
    }

    /// `(time, handler, payload)` strings, time as an exact decimal.
    pub fn rows(&self) -> Vec<(String, String, String)> {
        self.inner
            .iter()
            .map(|a| {
                (
                    a.time.to_string(),
                    a.handler.to_string(),
                    a.payload.to_string(),
                )
            })
            .collect()
    }
}

#[pymodule]
fn acqcompiler_backend(_py: Python, m: &PyModule) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(compute_z_positions, m)?)?;
    m.add_class::<ZStackPlan>()?;
    m.add_class::<ActionSession>()?;
    Ok(())
}
