//! Polarization rotator sweep: step an analog line through evenly spaced voltages and image every
//! exposure group at each step. Always a single repetition.

use tracing::debug;

use crate::action::{ActionPayload, HandlerRef};
use crate::error::{ScheduleError, ScheduleResult};
use crate::experiment::{Experiment, ExperimentParams};
use crate::exposure::{ExposureSettings, Exposer};
use crate::table::ActionTable;
use crate::time::{Time, TICKS_PER_MS};

/// Gap of 0.001 ms between consecutive exposure groups at the same voltage.
pub const ROTATOR_EXPOSURE_GAP: Time = Time::from_ticks(TICKS_PER_MS / 1000);

#[derive(Clone, Debug)]
pub struct RotatorSweepExperiment {
    params: ExperimentParams,
    line: HandlerRef,
    settling_time: Time,
    start_v: f64,
    max_v: f64,
    steps: usize,
}

impl RotatorSweepExperiment {
    pub fn new(
        line: HandlerRef,
        settling_time: Time,
        start_v: f64,
        max_v: f64,
        steps: usize,
        exposures: Vec<ExposureSettings>,
    ) -> ScheduleResult<Self> {
        if steps == 0 {
            return Err(ScheduleError::InvalidParameter(
                "a rotator sweep needs at least one voltage step".to_string(),
            ));
        }
        if !(start_v.is_finite() && max_v.is_finite()) {
            return Err(ScheduleError::InvalidParameter(format!(
                "sweep voltages must be finite, got {start_v}..{max_v}"
            )));
        }
        if settling_time.is_negative() {
            return Err(ScheduleError::InvalidParameter(format!(
                "settling time must be non-negative, got {settling_time} ms"
            )));
        }
        Ok(Self {
            params: ExperimentParams::new(1, None, exposures)?,
            line,
            settling_time,
            start_v,
            max_v,
            steps,
        })
    }

    /// Voltage increment between steps.
    pub fn delta(&self) -> f64 {
        (self.max_v - self.start_v) / self.steps as f64
    }

    pub fn voltages(&self) -> Vec<f64> {
        let dv = self.delta();
        (0..self.steps)
            .map(|i| self.start_v + i as f64 * dv)
            .collect()
    }

    /// Header line recorded alongside the acquired data.
    pub fn metadata(&self) -> String {
        format!(
            "Rotator start and delta: [{:.6}, {:.6}]",
            self.start_v,
            self.delta()
        )
    }
}

impl Experiment for RotatorSweepExperiment {
    fn name(&self) -> &str {
        "rotator_sweep"
    }

    fn params(&self) -> &ExperimentParams {
        &self.params
    }

    fn generate_actions(&self, exposer: &dyn Exposer) -> ScheduleResult<ActionTable> {
        let mut table = ActionTable::new();
        let mut cur = Time::ZERO;
        for target in self.voltages() {
            table.add_move_superseding(cur, self.line.clone(), target)?;
            cur += self.settling_time;
            for group in self.params.exposures() {
                cur = exposer.expose(cur, group, &mut table)?;
                cur += ROTATOR_EXPOSURE_GAP;
            }
            // Hold the angle during the exposures
            table.add_action(cur, self.line.clone(), ActionPayload::Move(target))?;
            cur += self.settling_time;
        }
        debug!(
            "rotator sweep: {} steps of {} V, {} actions",
            self.steps,
            self.delta(),
            table.len()
        );
        Ok(table)
    }
}
