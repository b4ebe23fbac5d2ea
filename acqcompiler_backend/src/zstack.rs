//! Z-stack acquisition: image every exposure group at each slice of an evenly spaced stack.

use std::cmp::max;
use tracing::debug;

use crate::action::ActionPayload;
use crate::error::{ScheduleError, ScheduleResult};
use crate::experiment::{compute_z_positions, Actuator, Experiment, ExperimentParams};
use crate::exposure::Exposer;
use crate::table::ActionTable;
use crate::time::{Time, TICKS_PER_MS};

/// Offset of 1e-10 ms inserted after every exposure group so that groups which would otherwise
/// start at the same instant stay strictly ordered.
pub const EXPOSURE_EPSILON: Time = Time::from_ticks(TICKS_PER_MS / 10_000_000_000);

#[derive(Clone, Debug)]
pub struct ZStackExperiment<A: Actuator> {
    params: ExperimentParams,
    stage: A,
    positions: Vec<f64>,
}

impl<A: Actuator> ZStackExperiment<A> {
    pub fn new(
        params: ExperimentParams,
        stage: A,
        start: f64,
        stack_height: f64,
        step: f64,
    ) -> ScheduleResult<Self> {
        let positions = compute_z_positions(start, stack_height, step)?;
        Self::with_positions(params, stage, positions)
    }

    /// Uses an explicit list of slice positions instead of an evenly spaced one.
    pub fn with_positions(
        params: ExperimentParams,
        stage: A,
        positions: Vec<f64>,
    ) -> ScheduleResult<Self> {
        if positions.is_empty() {
            return Err(ScheduleError::InvalidParameter(
                "a Z-stack needs at least one position".to_string(),
            ));
        }
        Ok(Self {
            params,
            stage,
            positions,
        })
    }

    pub fn positions(&self) -> &[f64] {
        &self.positions
    }
}

impl<A: Actuator> Experiment for ZStackExperiment<A> {
    fn name(&self) -> &str {
        "zstack"
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
            cur += motion;
            table.add_move_superseding(cur, z.clone(), target)?;
            cur += settle;
            prev = Some(target);

            for group in self.params.exposures() {
                cur = exposer.expose(cur, group, &mut table)?;
                cur += EXPOSURE_EPSILON;
            }
            // Hold flat for the exposures
            table.add_action(cur, z.clone(), ActionPayload::Move(target))?;
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
            "zstack: {} slices, {} actions, {} ms",
            self.positions.len(),
            table.len(),
            table.duration()?
        );
        Ok(table)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::action::{HandlerRef, LineState};
    use crate::camera::CameraTiming;
    use crate::experiment::{FixedSettle, LinearStage};
    use crate::exposure::{BasicExposer, ExposureSettings};

    fn ms(v: i64) -> Time {
        Time::from_whole_millis(v)
    }

    fn one_group(exposure: i64) -> Vec<ExposureSettings> {
        vec![ExposureSettings::new()
            .with_camera(HandlerRef::camera("cam"))
            .with_light(HandlerRef::light("488"), ms(exposure))
            .unwrap()]
    }

    fn z_moves(table: &ActionTable) -> Vec<(Time, f64)> {
        let z = HandlerRef::stage("z");
        table
            .entries_for(&z)
            .filter_map(|(_, a)| a.payload.as_move().map(|v| (a.time, v)))
            .collect()
    }

    #[test]
    fn flat_stack_images_once() {
        let params = ExperimentParams::new(1, None, one_group(10)).unwrap();
        let stage = FixedSettle::new(HandlerRef::stage("z"), ms(2), ms(3)).unwrap();
        let exp = ZStackExperiment::new(params, stage, 7.0, 0.0, 0.0).unwrap();
        let table = exp.generate_actions(&BasicExposer::new()).unwrap();

        let eps = EXPOSURE_EPSILON;
        assert_eq!(
            z_moves(&table),
            vec![
                (ms(0), 7.0),
                (ms(10) + eps, 7.0),
                (ms(12) + eps, 7.0),
                (ms(15) + eps, 7.0),
            ]
        );
        let triggers = table
            .iter()
            .filter(|a| a.payload == ActionPayload::Trigger(LineState::High))
            .count();
        assert_eq!(triggers, 2);
    }

    #[test]
    fn exposure_groups_are_strictly_ordered() {
        let groups = vec![one_group(5).remove(0), one_group(5).remove(0)];
        let params = ExperimentParams::new(1, None, groups).unwrap();
        let stage = LinearStage::new(HandlerRef::stage("z"), 1.0, ms(1)).unwrap();
        let exp = ZStackExperiment::new(params, stage, 0.0, 1.0, 1.0).unwrap();
        let table = exp.generate_actions(&BasicExposer::new()).unwrap();

        let cam = HandlerRef::camera("cam");
        let rises: Vec<Time> = table
            .entries_for(&cam)
            .filter(|(_, a)| a.payload == ActionPayload::Trigger(LineState::High))
            .map(|(_, a)| a.time)
            .collect();
        assert_eq!(rises.len(), 4);
        assert_eq!(rises[1] - rises[0], ms(5) + EXPOSURE_EPSILON);
        assert!(rises.windows(2).all(|w| w[0] < w[1]));
        assert!(table.is_sorted());
    }

    #[test]
    fn camera_ready_only_matters_when_repeating() {
        let cam = HandlerRef::camera("cam");
        let exposer = BasicExposer::new().with_camera(cam, CameraTiming::new(ms(100)));
        let stage = || FixedSettle::new(HandlerRef::stage("z"), Time::ZERO, ms(1)).unwrap();

        let once = ExperimentParams::new(1, None, one_group(10)).unwrap();
        let table = ZStackExperiment::new(once, stage(), 0.0, 0.0, 0.0)
            .unwrap()
            .generate_actions(&exposer)
            .unwrap();
        assert_eq!(z_moves(&table).last().unwrap().0, ms(11) + EXPOSURE_EPSILON);

        let repeated = ExperimentParams::new(2, None, one_group(10)).unwrap();
        let table = ZStackExperiment::new(repeated, stage(), 0.0, 0.0, 0.0)
            .unwrap()
            .generate_actions(&exposer)
            .unwrap();
        assert_eq!(z_moves(&table).last().unwrap().0, ms(110));
    }

    #[test]
    fn zero_motion_stage_replaces_holds_with_moves() {
        let params = ExperimentParams::new(1, None, one_group(10)).unwrap();
        let stage = FixedSettle::new(HandlerRef::stage("z"), Time::ZERO, ms(2)).unwrap();
        let exp = ZStackExperiment::new(params, stage, 0.0, 2.0, 1.0).unwrap();
        let table = exp.generate_actions(&BasicExposer::new()).unwrap();

        let eps = EXPOSURE_EPSILON;
        assert_eq!(
            z_moves(&table),
            vec![
                (ms(0), 0.0),
                (ms(10) + eps, 1.0),
                (ms(22) + eps + eps, 2.0),
                (ms(34) + eps + eps + eps, 0.0),
                (ms(36) + eps + eps + eps, 0.0),
            ]
        );
        table.validate().unwrap();
        assert!(FixedSettle::new(HandlerRef::stage("z"), ms(-1), Time::ZERO).is_err());
    }

    #[test]
    fn rejects_empty_position_list() {
        let params = ExperimentParams::new(1, None, vec![]).unwrap();
        let stage = FixedSettle::new(HandlerRef::stage("z"), Time::ZERO, Time::ZERO).unwrap();
        assert!(ZStackExperiment::with_positions(params, stage, vec![]).is_err());
    }
}
