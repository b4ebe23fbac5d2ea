//! Exposure groups and the primitive that turns one group into table rows.
//!
//! An [`ExposureSettings`] is one imaging step: the set of cameras to trigger together and, for
//! each light, how long it stays on. Generators hand each group to an [`Exposer`], which writes
//! the trigger and illumination edges and reports when the group has finished.

use indexmap::{IndexMap, IndexSet};
use std::cmp::max;
use tracing::trace;

use crate::action::{ActionPayload, HandlerRef, LineState};
use crate::camera::CameraTiming;
use crate::error::{ScheduleError, ScheduleResult};
use crate::table::ActionTable;
use crate::time::Time;

/// One exposure group. Insertion order of cameras and lights is kept so that generated tables
/// are reproducible.
///
/// ```
/// use acqcompiler_backend::action::HandlerRef;
/// use acqcompiler_backend::exposure::ExposureSettings;
/// use acqcompiler_backend::time::Time;
///
/// let mut group = ExposureSettings::new();
/// group.add_camera(HandlerRef::camera("cam0"));
/// group.add_light(HandlerRef::light("488"), Time::from_whole_millis(30)).unwrap();
/// group.add_light(HandlerRef::light("561"), Time::from_whole_millis(50)).unwrap();
/// assert_eq!(group.longest_exposure(), Time::from_whole_millis(50));
/// assert!(group.add_light(HandlerRef::light("488"), Time::ZERO).is_err());
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExposureSettings {
    cameras: IndexSet<HandlerRef>,
    exposures: IndexMap<HandlerRef, Time>,
}

impl ExposureSettings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adding the same camera twice is a no-op.
    pub fn add_camera(&mut self, camera: HandlerRef) {
        self.cameras.insert(camera);
    }

    pub fn add_light(&mut self, light: HandlerRef, duration: Time) -> ScheduleResult<()> {
        if self.exposures.contains_key(&light) {
            return Err(ScheduleError::DuplicateLight(light));
        }
        if duration.is_negative() {
            return Err(ScheduleError::InvalidParameter(format!(
                "exposure time for {} must be non-negative, got {} ms",
                light, duration
            )));
        }
        self.exposures.insert(light, duration);
        Ok(())
    }

    pub fn with_camera(mut self, camera: HandlerRef) -> Self {
        self.add_camera(camera);
        self
    }

    pub fn with_light(mut self, light: HandlerRef, duration: Time) -> ScheduleResult<Self> {
        self.add_light(light, duration)?;
        Ok(self)
    }

    pub fn cameras(&self) -> &IndexSet<HandlerRef> {
        &self.cameras
    }

    pub fn exposures(&self) -> &IndexMap<HandlerRef, Time> {
        &self.exposures
    }

    /// Longest light duration in the group, zero when it has no lights.
    pub fn longest_exposure(&self) -> Time {
        self.exposures.values().copied().max().unwrap_or(Time::ZERO)
    }
}

/// Union of the cameras used by every group, in order of first use.
pub fn all_cameras<'a>(
    settings: impl IntoIterator<Item = &'a ExposureSettings>,
) -> IndexSet<HandlerRef> {
    settings
        .into_iter()
        .flat_map(|s| s.cameras.iter().cloned())
        .collect()
}

/// Union of the lights used by every group, in order of first use.
pub fn all_lights<'a>(
    settings: impl IntoIterator<Item = &'a ExposureSettings>,
) -> IndexSet<HandlerRef> {
    settings
        .into_iter()
        .flat_map(|s| s.exposures.keys().cloned())
        .collect()
}

/// Writes exposure groups into a table and models when cameras can be triggered again.
pub trait Exposer {
    /// Schedules one exposure group no earlier than `start` and returns the time at which the
    /// group's acquisition is complete.
    fn expose(
        &self,
        start: Time,
        settings: &ExposureSettings,
        table: &mut ActionTable,
    ) -> ScheduleResult<Time>;

    /// Earliest time at which `camera` can be triggered again given what `table` already asks
    /// of it.
    fn camera_ready_time(&self, table: &ActionTable, camera: &HandlerRef) -> Time;
}

/// Reference exposer for edge-triggered cameras.
///
/// Cameras are held high for the whole exposure window, each light is held high for its own
/// duration from the window start. A camera that is still reading out from an earlier group
/// delays the window.
#[derive(Clone, Debug, Default)]
pub struct BasicExposer {
    cameras: IndexMap<HandlerRef, CameraTiming>,
    default_timing: CameraTiming,
}

impl BasicExposer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Timing used for cameras that were never registered.
    pub fn with_default_timing(mut self, timing: CameraTiming) -> Self {
        self.default_timing = timing;
        self
    }

    pub fn with_camera(mut self, camera: HandlerRef, timing: CameraTiming) -> Self {
        self.cameras.insert(camera, timing);
        self
    }

    pub fn timing(&self, camera: &HandlerRef) -> CameraTiming {
        self.cameras
            .get(camera)
            .copied()
            .unwrap_or(self.default_timing)
    }
}

impl Exposer for BasicExposer {
    fn expose(
        &self,
        start: Time,
        settings: &ExposureSettings,
        table: &mut ActionTable,
    ) -> ScheduleResult<Time> {
        let begin = settings
            .cameras()
            .iter()
            .map(|cam| self.camera_ready_time(table, cam))
            .fold(start, max);
        let window = max(settings.longest_exposure(), table.toggle_time());
        trace!(
            "expose at {} ms (requested {} ms) for {} ms",
            begin,
            start,
            window
        );

        for camera in settings.cameras() {
            table.add_action(
                begin,
                camera.clone(),
                ActionPayload::Trigger(LineState::High),
            )?;
            table.add_action(
                begin + window,
                camera.clone(),
                ActionPayload::Trigger(LineState::Low),
            )?;
        }
        for (light, &duration) in settings.exposures() {
            if duration == Time::ZERO {
                continue;
            }
            table.add_action(
                begin,
                light.clone(),
                ActionPayload::Trigger(LineState::High),
            )?;
            table.add_action(
                begin + duration,
                light.clone(),
                ActionPayload::Trigger(LineState::Low),
            )?;
        }
        Ok(begin + window)
    }

    fn camera_ready_time(&self, table: &ActionTable, camera: &HandlerRef) -> Time {
        table
            .iter()
            .rev()
            .find(|a| {
                &a.handler == camera && a.payload == ActionPayload::Trigger(LineState::Low)
            })
            .map(|a| a.time + self.timing(camera).readout_time)
            .unwrap_or(Time::ZERO)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use maplit::hashset;
    use std::collections::HashSet;

    fn ms(v: i64) -> Time {
        Time::from_whole_millis(v)
    }

    fn group(camera: &str, lights: &[(&str, i64)]) -> ExposureSettings {
        let mut settings = ExposureSettings::new().with_camera(HandlerRef::camera(camera));
        for (light, t) in lights {
            settings.add_light(HandlerRef::light(light), ms(*t)).unwrap();
        }
        settings
    }

    #[test]
    fn unions_across_groups() {
        let groups = vec![
            group("a", &[("405", 10)]),
            group("b", &[("488", 20), ("405", 5)]),
            group("a", &[]),
        ];
        let cameras: HashSet<_> = all_cameras(&groups).into_iter().collect();
        assert_eq!(
            cameras,
            hashset! {HandlerRef::camera("a"), HandlerRef::camera("b")}
        );
        let lights: Vec<_> = all_lights(&groups)
            .iter()
            .map(|l| l.name().to_string())
            .collect();
        assert_eq!(lights, ["405", "488"]);
    }

    #[test]
    fn empty_group_has_zero_longest_exposure() {
        assert_eq!(ExposureSettings::new().longest_exposure(), Time::ZERO);
        let err = ExposureSettings::new()
            .with_light(HandlerRef::light("x"), ms(-1))
            .unwrap_err();
        assert!(matches!(err, ScheduleError::InvalidParameter(_)));
    }

    #[test]
    fn expose_writes_camera_window_and_lights() {
        let exposer = BasicExposer::new();
        let mut table = ActionTable::new();
        let done = exposer
            .expose(ms(5), &group("cam", &[("488", 30), ("561", 10)]), &mut table)
            .unwrap();
        assert_eq!(done, ms(35));
        assert!(table.is_sorted());

        let rows: Vec<_> = table
            .iter()
            .map(|a| (a.time, a.handler.name().to_string(), a.payload.clone()))
            .collect();
        let high = ActionPayload::Trigger(LineState::High);
        let low = ActionPayload::Trigger(LineState::Low);
        assert_eq!(
            rows,
            vec![
                (ms(5), "cam".to_string(), high.clone()),
                (ms(5), "488".to_string(), high.clone()),
                (ms(5), "561".to_string(), high),
                (ms(15), "561".to_string(), low.clone()),
                (ms(35), "cam".to_string(), low.clone()),
                (ms(35), "488".to_string(), low),
            ]
        );
    }

    #[test]
    fn window_is_at_least_one_toggle() {
        let exposer = BasicExposer::new();
        let mut table = ActionTable::new().with_toggle_time(ms(2));
        let done = exposer
            .expose(ms(0), &group("cam", &[("dark", 0)]), &mut table)
            .unwrap();
        assert_eq!(done, ms(2));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn readout_delays_next_group() {
        let cam = HandlerRef::camera("cam");
        let exposer = BasicExposer::new().with_camera(cam.clone(), CameraTiming::new(ms(7)));
        let mut table = ActionTable::new();
        assert_eq!(exposer.camera_ready_time(&table, &cam), Time::ZERO);

        let done = exposer
            .expose(ms(0), &group("cam", &[("488", 10)]), &mut table)
            .unwrap();
        assert_eq!(exposer.camera_ready_time(&table, &cam), ms(17));
        let done = exposer
            .expose(done, &group("cam", &[("488", 10)]), &mut table)
            .unwrap();
        assert_eq!(done, ms(27));
    }
}
