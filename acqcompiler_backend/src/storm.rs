//! Repeated single-molecule imaging: at each Z slice, cycle through a list of light/camera rows
//! a fixed number of times before moving on.

use std::cmp::max;
use tracing::debug;

use crate::action::{ActionPayload, HandlerRef};
use crate::error::{ScheduleError, ScheduleResult};
use crate::experiment::{compute_z_positions, Actuator, Experiment, ExperimentParams};
use crate::exposure::{ExposureSettings, Exposer};
use crate::table::ActionTable;
use crate::time::Time;
use crate::zstack::EXPOSURE_EPSILON;

/// One row of a STORM plan: a light pulse, optionally read out by a camera.
#[derive(Clone, Debug, PartialEq)]
pub struct StormSequence {
    pub light: HandlerRef,
    pub exposure: Time,
    pub camera: Option<HandlerRef>,
}

impl StormSequence {
    pub fn new(light: HandlerRef, exposure: Time, camera: Option<HandlerRef>) -> Self {
        Self {
            light,
            exposure,
            camera,
        }
    }

    fn to_settings(&self) -> ScheduleResult<ExposureSettings> {
        let mut settings = ExposureSettings::new();
        if let Some(camera) = &self.camera {
            settings.add_camera(camera.clone());
        }
        settings.add_light(self.light.clone(), self.exposure)?;
        Ok(settings)
    }
}

#[derive(Clone, Debug)]
pub struct StormExperiment<A: Actuator> {
    params: ExperimentParams,
    stage: A,
    positions: Vec<f64>,
    repetitions: usize,
}

impl<A: Actuator> StormExperiment<A> {
    /// The exposure groups of the experiment are derived from `sequences`, one group per row.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        num_reps: usize,
        rep_duration: Option<Time>,
        stage: A,
        start: f64,
        stack_height: f64,
        step: f64,
        repetitions: usize,
        sequences: &[StormSequence],
    ) -> ScheduleResult<Self> {
        if repetitions == 0 {
            return Err(ScheduleError::InvalidParameter(
                "'repetitions' must be at least 1".to_string(),
            ));
        }
        let exposures = sequences
            .iter()
            .map(StormSequence::to_settings)
            .collect::<ScheduleResult<Vec<_>>>()?;
        Ok(Self {
            params: ExperimentParams::new(num_reps, rep_duration, exposures)?,
            stage,
            positions: compute_z_positions(start, stack_height, step)?,
            repetitions,
        })
    }

    pub fn positions(&self) -> &[f64] {
        &self.positions
    }

    pub fn repetitions(&self) -> usize {
        self.repetitions
    }
}

impl<A: Actuator> Experiment for StormExperiment<A> {
    fn name(&self) -> &str {
        "storm"
    }

    fn params(&self) -> &ExperimentParams {
        &self.params
    }

    fn generate_actions(&self, exposer: &dyn Exposer) -> ScheduleResult<ActionTable> {
        let z = self.stage.handler();
        let mut table = ActionTable::new();
        let mut cur = Time::ZERO;
        let mut prev = None;

        for &target in &self.positions {
            let (motion, settle) = match prev {
                Some(from) => self.stage.movement_time(from, target)?,
                None => (Time::ZERO, Time::ZERO),
            };
            table.add_move_superseding(cur + motion, z.clone(), target)?;
            cur += motion + settle;
            prev = Some(target);

            for _ in 0..self.repetitions {
                for group in self.params.exposures() {
                    cur = exposer.expose(cur, group, &mut table)?;
                    cur += EXPOSURE_EPSILON;
                    table.add_action(cur, z.clone(), ActionPayload::Move(target))?;
                }
            }
        }

        let (first, last) = match (self.positions.first(), self.positions.last()) {
            (Some(&first), Some(&last)) => (first, last),
            _ => return Err(ScheduleError::EmptyTable),
        };
        let (motion, settle) = self.stage.movement_time(last, first)?;
        cur += motion;
        table.add_move_superseding(cur, z.clone(), first)?;
        let ready = self.camera_ready_time(exposer, &table);
        table.add_action(max(cur + settle, ready), z.clone(), ActionPayload::Move(first))?;

        debug!(
            "storm: {} slices x {} repetitions x {} rows, {} actions",
            self.positions.len(),
            self.repetitions,
            self.params.exposures().len(),
            table.len()
        );
        Ok(table)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::action::LineState;
    use crate::experiment::FixedSettle;
    use crate::exposure::BasicExposer;

    fn ms(v: i64) -> Time {
        Time::from_whole_millis(v)
    }

    fn plan() -> Vec<StormSequence> {
        vec![
            StormSequence::new(
                HandlerRef::light("647"),
                ms(20),
                Some(HandlerRef::camera("emccd")),
            ),
            StormSequence::new(HandlerRef::light("405"), ms(1), None),
        ]
    }

    #[test]
    fn every_row_is_imaged_per_repetition() {
        let stage = FixedSettle::new(HandlerRef::stage("z"), ms(1), ms(1)).unwrap();
        let exp = StormExperiment::new(1, None, stage, 0.0, 1.0, 1.0, 3, &plan()).unwrap();
        assert_eq!(exp.positions(), &[0.0, 1.0]);
        let table = exp.generate_actions(&BasicExposer::new()).unwrap();
        assert!(table.is_sorted());

        let pulses = |name: &str| {
            let light = HandlerRef::light(name);
            table
                .entries_for(&light)
                .filter(|(_, a)| a.payload == ActionPayload::Trigger(LineState::High))
                .count()
        };
        assert_eq!(pulses("647"), 6);
        assert_eq!(pulses("405"), 6);

        // one move per slice, one hold per row and repetition, return and final hold
        let z = HandlerRef::stage("z");
        assert_eq!(table.entries_for(&z).count(), 2 + 2 * 3 * 2 + 2);
    }

    #[test]
    fn dark_rows_still_advance_by_one_toggle() {
        let stage = FixedSettle::new(HandlerRef::stage("z"), Time::ZERO, Time::ZERO).unwrap();
        let rows = [StormSequence::new(HandlerRef::light("405"), Time::ZERO, None)];
        let exp = StormExperiment::new(1, None, stage, 0.0, 0.0, 0.0, 2, &rows).unwrap();
        let table = exp.generate_actions(&BasicExposer::new()).unwrap();
        let (_, end) = table.first_and_last_times().unwrap();
        let per_row = table.toggle_time() + EXPOSURE_EPSILON;
        assert_eq!(end, per_row + per_row);
    }

    #[test]
    fn zero_motion_stage_is_schedulable() {
        let stage = FixedSettle::new(HandlerRef::stage("z"), Time::ZERO, Time::ZERO).unwrap();
        let rows = [StormSequence::new(HandlerRef::light("405"), ms(1), None)];
        let exp = StormExperiment::new(1, None, stage, 0.0, 1.0, 1.0, 1, &rows).unwrap();
        let table = exp.generate_actions(&BasicExposer::new()).unwrap();
        table.validate().unwrap();

        // Holds that coincide with the next move are replaced by it
        let z = HandlerRef::stage("z");
        let targets: Vec<f64> = table
            .entries_for(&z)
            .filter_map(|(_, a)| a.payload.as_move())
            .collect();
        assert_eq!(targets, vec![0.0, 1.0, 0.0, 0.0]);
    }

    #[test]
    fn rejects_bad_plans() {
        let stage = || FixedSettle::new(HandlerRef::stage("z"), Time::ZERO, Time::ZERO).unwrap();
        assert!(StormExperiment::new(1, None, stage(), 0.0, 1.0, 1.0, 0, &plan()).is_err());
        let negative = [StormSequence::new(HandlerRef::light("405"), ms(-1), None)];
        assert!(StormExperiment::new(1, None, stage(), 0.0, 1.0, 1.0, 1, &negative).is_err());
        assert!(StormExperiment::new(0, None, stage(), 0.0, 1.0, 1.0, 1, &plan()).is_err());
    }
}
