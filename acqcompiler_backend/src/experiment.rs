//! Shared vocabulary of every experiment generator.
//!
//! ## Overview
//!
//! An experiment is described by its [`ExperimentParams`] (how many times the whole table is
//! replayed, optional period between replays, and the exposure groups it images with) plus
//! whatever it sweeps: Z positions for [`ZStackExperiment`] and [`StormExperiment`], a voltage
//! for [`RotatorSweepExperiment`]. The behavior shared by all of them lives in the [`Experiment`]
//! trait, which only asks implementors for accessors and the generator itself.
//!
//! Generators are pure: calling [`Experiment::generate_actions`] twice with the same exposer
//! yields identical tables. The cost of moving an axis is delegated to an [`Actuator`], so that
//! the same generator drives a piezo, a motorised stage or an analog line.
//!
//! [`ZStackExperiment`]: crate::zstack::ZStackExperiment
//! [`StormExperiment`]: crate::storm::StormExperiment
//! [`RotatorSweepExperiment`]: crate::rotator::RotatorSweepExperiment

use std::cmp::max;

use crate::action::HandlerRef;
use crate::error::{ScheduleError, ScheduleResult};
use crate::exposure::{all_cameras, ExposureSettings, Exposer};
use crate::table::ActionTable;
use crate::time::Time;

/// Evenly spaced positions starting at `start`.
///
/// Returns `ceil(stack_height / |step|) + 1` positions, each computed as `start + i * step` so
/// that rounding error does not accumulate. A zero-height stack with a zero step is a single
/// 2D position. A negative step walks downwards.
///
/// ```
/// use acqcompiler_backend::experiment::compute_z_positions;
///
/// assert_eq!(compute_z_positions(0.0, 4.0, 1.0).unwrap(), vec![0.0, 1.0, 2.0, 3.0, 4.0]);
/// assert_eq!(compute_z_positions(5.0, 0.0, 0.0).unwrap(), vec![5.0]);
/// assert_eq!(compute_z_positions(1.0, 2.0, -1.5).unwrap(), vec![1.0, -0.5, -2.0]);
/// assert!(compute_z_positions(0.0, -1.0, 1.0).is_err());
/// assert!(compute_z_positions(0.0, 1.0, 0.0).is_err());
/// ```
pub fn compute_z_positions(start: f64, stack_height: f64, step: f64) -> ScheduleResult<Vec<f64>> {
    if !start.is_finite() || !step.is_finite() || stack_height.is_nan() {
        return Err(ScheduleError::InvalidParameter(format!(
            "Z positions need finite inputs, got start={start}, height={stack_height}, step={step}"
        )));
    }
    if stack_height < 0.0 {
        return Err(ScheduleError::InvalidHeight(stack_height));
    }
    if step == 0.0 {
        if stack_height == 0.0 {
            return Ok(vec![start]);
        }
        return Err(ScheduleError::InvalidStep {
            step,
            height: stack_height,
        });
    }

    let intervals = (stack_height / step.abs()).ceil();
    if !intervals.is_finite() || intervals >= u32::MAX as f64 {
        return Err(ScheduleError::InvalidParameter(format!(
            "a stack of height {stack_height} with step {step} has too many slices"
        )));
    }
    let num_slices = intervals as usize + 1;
    Ok((0..num_slices).map(|i| start + i as f64 * step).collect())
}

/// Parameters common to every experiment.
#[derive(Clone, Debug, PartialEq)]
pub struct ExperimentParams {
    num_reps: usize,
    rep_duration: Option<Time>,
    exposures: Vec<ExposureSettings>,
}

impl ExperimentParams {
    pub fn new(
        num_reps: usize,
        rep_duration: Option<Time>,
        exposures: Vec<ExposureSettings>,
    ) -> ScheduleResult<Self> {
        if num_reps == 0 {
            return Err(ScheduleError::InvalidParameter(
                "'num_reps' must be at least 1".to_string(),
            ));
        }
        if let Some(period) = rep_duration {
            if period.is_negative() {
                return Err(ScheduleError::InvalidParameter(format!(
                    "'rep_duration' must be non-negative, got {period} ms"
                )));
            }
        }
        Ok(Self {
            num_reps,
            rep_duration,
            exposures,
        })
    }

    pub fn num_reps(&self) -> usize {
        self.num_reps
    }

    /// Minimum time between the starts of consecutive replays, if any.
    pub fn rep_duration(&self) -> Option<Time> {
        self.rep_duration
    }

    pub fn exposures(&self) -> &[ExposureSettings] {
        &self.exposures
    }
}

/// Cost model of a positioner: how long a move from one target to another takes to complete
/// (motion) and to settle (stabilization).
pub trait Actuator {
    fn handler(&self) -> &HandlerRef;

    fn movement_time(&self, from: f64, to: f64) -> ScheduleResult<(Time, Time)>;
}

/// Constant-speed stage: motion time is distance over speed, settling time is fixed.
#[derive(Clone, Debug)]
pub struct LinearStage {
    handler: HandlerRef,
    speed: f64,
    settle_time: Time,
}

impl LinearStage {
    /// `speed` is in position units per millisecond and must be strictly positive.
    pub fn new(handler: HandlerRef, speed: f64, settle_time: Time) -> ScheduleResult<Self> {
        if !(speed.is_finite() && speed > 0.0) {
            return Err(ScheduleError::InvalidParameter(format!(
                "stage speed must be positive, got {speed}"
            )));
        }
        if settle_time.is_negative() {
            return Err(ScheduleError::InvalidParameter(format!(
                "settling time must be non-negative, got {settle_time} ms"
            )));
        }
        Ok(Self {
            handler,
            speed,
            settle_time,
        })
    }
}

impl Actuator for LinearStage {
    fn handler(&self) -> &HandlerRef {
        &self.handler
    }

    fn movement_time(&self, from: f64, to: f64) -> ScheduleResult<(Time, Time)> {
        let motion = Time::from_millis((to - from).abs() / self.speed)?;
        Ok((motion, self.settle_time))
    }
}

/// Positioner whose moves always cost the same, whatever the distance.
///
/// A zero motion time is allowed: the move then lands on the hold that ends the previous
/// position and replaces it.
#[derive(Clone, Debug)]
pub struct FixedSettle {
    handler: HandlerRef,
    motion_time: Time,
    settle_time: Time,
}

impl FixedSettle {
    pub fn new(handler: HandlerRef, motion_time: Time, settle_time: Time) -> ScheduleResult<Self> {
        if motion_time.is_negative() || settle_time.is_negative() {
            return Err(ScheduleError::InvalidParameter(format!(
                "movement times must be non-negative, got {motion_time} ms and {settle_time} ms"
            )));
        }
        Ok(Self {
            handler,
            motion_time,
            settle_time,
        })
    }
}

impl Actuator for FixedSettle {
    fn handler(&self) -> &HandlerRef {
        &self.handler
    }

    fn movement_time(&self, _from: f64, _to: f64) -> ScheduleResult<(Time, Time)> {
        Ok((self.motion_time, self.settle_time))
    }
}

/// Behavior shared by all experiment generators.
///
/// Implementors provide [`name`](Experiment::name), [`params`](Experiment::params) and
/// [`generate_actions`](Experiment::generate_actions); the remaining methods have default
/// implementations in terms of those.
pub trait Experiment {
    fn name(&self) -> &str;

    fn params(&self) -> &ExperimentParams;

    /// Builds the raw action table for one repetition of the experiment.
    fn generate_actions(&self, exposer: &dyn Exposer) -> ScheduleResult<ActionTable>;

    fn num_reps(&self) -> usize {
        self.params().num_reps()
    }

    /// Latest time, over every camera this experiment images with, at which the camera can next
    /// be triggered. Only meaningful when the table is replayed, so single-repetition experiments
    /// report zero.
    fn camera_ready_time(&self, exposer: &dyn Exposer, table: &ActionTable) -> Time {
        if self.num_reps() <= 1 {
            return Time::ZERO;
        }
        all_cameras(self.params().exposures())
            .iter()
            .map(|camera| exposer.camera_ready_time(table, camera))
            .fold(Time::ZERO, max)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn z_positions_are_multiplied_not_accumulated() {
        let step = 0.1;
        let positions = compute_z_positions(0.0, 10.0, step).unwrap();
        assert_eq!(positions.len(), 101);
        for (i, z) in positions.iter().enumerate() {
            assert_eq!(*z, i as f64 * step);
        }
        // Repeated addition drifts away from the multiplied value
        let accumulated = (0..100).fold(0.0, |acc, _| acc + step);
        assert_ne!(accumulated, positions[100]);
    }

    #[test]
    fn z_positions_overshoot_instead_of_clipping() {
        assert_eq!(
            compute_z_positions(0.0, 4.0, 3.0).unwrap(),
            vec![0.0, 3.0, 6.0]
        );
        assert_eq!(compute_z_positions(2.0, 0.0, 1.0).unwrap(), vec![2.0]);
    }

    #[test]
    fn z_positions_reference_cases() {
        assert_eq!(
            compute_z_positions(3.0, 1.0, 0.2).unwrap(),
            vec![3.0, 3.2, 3.4, 3.6, 3.8, 4.0]
        );
        assert_eq!(compute_z_positions(1.0, 0.0, 0.0).unwrap(), vec![1.0]);
        assert_eq!(compute_z_positions(1.0, 0.0, 0.2).unwrap(), vec![1.0]);
    }

    #[test]
    fn z_position_errors() {
        assert_eq!(
            compute_z_positions(0.0, -0.5, 1.0).unwrap_err(),
            ScheduleError::InvalidHeight(-0.5)
        );
        assert_eq!(
            compute_z_positions(0.0, 2.0, 0.0).unwrap_err(),
            ScheduleError::InvalidStep {
                step: 0.0,
                height: 2.0
            }
        );
        assert!(compute_z_positions(f64::NAN, 1.0, 1.0).is_err());
        assert!(compute_z_positions(0.0, f64::INFINITY, 1.0).is_err());
        assert!(compute_z_positions(0.0, 1e300, 1e-300).is_err());
    }

    #[test]
    fn params_validation() {
        assert!(ExperimentParams::new(0, None, vec![]).is_err());
        assert!(ExperimentParams::new(1, Some(Time::from_whole_millis(-1)), vec![]).is_err());
        let params = ExperimentParams::new(3, None, vec![]).unwrap();
        assert_eq!(params.num_reps(), 3);
        assert_eq!(params.rep_duration(), None);
    }

    #[test]
    fn linear_stage_cost() {
        let stage = LinearStage::new(HandlerRef::stage("z"), 2.0, Time::from_whole_millis(5))
            .unwrap();
        let (motion, settle) = stage.movement_time(1.0, -2.0).unwrap();
        assert_eq!(motion, "1.5".parse::<Time>().unwrap());
        assert_eq!(settle, Time::from_whole_millis(5));
        assert!(LinearStage::new(HandlerRef::stage("z"), 0.0, Time::ZERO).is_err());
        assert!(LinearStage::new(HandlerRef::stage("z"), 1.0, Time::from_whole_millis(-1)).is_err());
    }
}
