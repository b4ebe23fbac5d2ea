//! Deformable mirror used for remote focusing.
//!
//! During an experiment the mirror is driven like a Z positioner: generators emit `Move` rows
//! with logical focus positions. Before execution, [`DeformableMirror`] rewrites those rows:
//! the distinct positions are reduced to one repeating cycle, every position of the cycle is
//! encoded into an actuator vector through the calibration fit, the whole cycle is queued on
//! the mirror with a single [`Marker::QueuePatterns`], and each `Move` becomes the number of
//! trigger pulses it takes to step the mirror to that position.
//!
//! At playback, [`DeformableMirror::execute_actions`] forwards markers to a [`MirrorDriver`]
//! and, for calibration runs, records new lookup-table rows which are persisted through a
//! [`CalibrationStore`] afterwards.

use std::cmp::max;

use acqcompiler_backend::action::{Action, ActionPayload, HandlerRef, Marker};
use acqcompiler_backend::device::{
    append_flush_triggers, detect_cycle, expand_triggers, reduce_targets, ActionRewriter,
    CyclePlan, Device,
};
use acqcompiler_backend::error::{ScheduleError, ScheduleResult};
use acqcompiler_backend::experiment::Actuator;
use acqcompiler_backend::table::ActionTable;
use acqcompiler_backend::time::Time;
use ndarray::Array2;
use tracing::{debug, info, trace, warn};

use crate::calibration::{
    ActuatorFit, CalibrationLog, CalibrationStore, CalibrationTable, FileCalibrationStore,
};
use crate::config::MirrorConfig;
use crate::error::{DeviceError, DeviceResult};

/// Iterations of the phase-flattening routine run for each calibration point.
pub const FLATTEN_ITERATIONS: usize = 5;

/// Hardware side of the mirror.
pub trait MirrorDriver {
    fn n_actuators(&self) -> usize;

    /// Loads a sequence of actuator vectors, one per row; each trigger steps to the next row,
    /// wrapping around at the end.
    fn queue_patterns(&mut self, patterns: &Array2<f64>) -> DeviceResult<()>;

    fn send(&mut self, values: &[f64]) -> DeviceResult<()>;

    /// Runs the closed-loop flattening routine and returns the resulting actuator values.
    fn flatten_phase(&mut self, iterations: usize) -> DeviceResult<Vec<f64>>;

    fn reset(&mut self) -> DeviceResult<()>;
}

/// In-memory driver recording every call, for dry runs and tests.
#[derive(Clone, Debug, Default)]
pub struct SimulatedMirror {
    n_actuators: usize,
    flat: Vec<f64>,
    pub queued: Vec<Array2<f64>>,
    pub sent: Vec<Vec<f64>>,
    pub resets: usize,
}

impl SimulatedMirror {
    pub fn new(n_actuators: usize) -> Self {
        Self {
            n_actuators,
            flat: vec![0.0; n_actuators],
            ..Self::default()
        }
    }

    /// Values returned by [`MirrorDriver::flatten_phase`].
    pub fn with_flat(mut self, flat: Vec<f64>) -> Self {
        self.flat = flat;
        self
    }
}

impl MirrorDriver for SimulatedMirror {
    fn n_actuators(&self) -> usize {
        self.n_actuators
    }

    fn queue_patterns(&mut self, patterns: &Array2<f64>) -> DeviceResult<()> {
        if patterns.ncols() != self.n_actuators {
            return Err(DeviceError::Driver(format!(
                "patterns have {} columns, mirror has {} actuators",
                patterns.ncols(),
                self.n_actuators
            )));
        }
        self.queued.push(patterns.clone());
        Ok(())
    }

    fn send(&mut self, values: &[f64]) -> DeviceResult<()> {
        if values.len() != self.n_actuators {
            return Err(DeviceError::Driver(format!(
                "got {} values for {} actuators",
                values.len(),
                self.n_actuators
            )));
        }
        self.sent.push(values.to_vec());
        Ok(())
    }

    fn flatten_phase(&mut self, _iterations: usize) -> DeviceResult<Vec<f64>> {
        Ok(self.flat.clone())
    }

    fn reset(&mut self) -> DeviceResult<()> {
        self.resets += 1;
        Ok(())
    }
}

/// Cost model of a focus change on the mirror: a fixed settling time, no motion.
#[derive(Clone, Debug)]
pub struct MirrorPositioner {
    handler: HandlerRef,
    settling_time: Time,
}

impl Actuator for MirrorPositioner {
    fn handler(&self) -> &HandlerRef {
        &self.handler
    }

    fn movement_time(&self, _from: f64, _to: f64) -> ScheduleResult<(Time, Time)> {
        Ok((self.settling_time, Time::ZERO))
    }
}

pub struct DeformableMirror {
    handler: HandlerRef,
    fit: ActuatorFit,
    settling_time: Time,
    trigger: Option<HandlerRef>,
    log: CalibrationLog,
    store: Option<Box<dyn CalibrationStore>>,
    last_patterns: Option<Array2<f64>>,
}

impl DeformableMirror {
    pub fn new(name: &str, fit: ActuatorFit) -> Self {
        Self {
            handler: HandlerRef::device(name),
            fit,
            settling_time: Time::from_whole_millis(10),
            trigger: None,
            log: CalibrationLog::new(),
            store: None,
            last_patterns: None,
        }
    }

    /// Builds the mirror from its configuration section.
    ///
    /// A missing or unreadable calibration table at `lut_path` falls back to an all-zero fit.
    /// When both `lut_path` and `user_config_path` are set, new calibrations are written back
    /// to them. A configured trigger line receives the stepping pulses.
    pub fn from_config(config: &MirrorConfig) -> DeviceResult<Self> {
        let fit = match &config.lut_path {
            Some(path) => match CalibrationTable::load(path) {
                Ok(table) if table.n_actuators() == config.n_actuators => {
                    info!("{}: loaded calibration from {}", config.name, path.display());
                    ActuatorFit::from_table(&table)
                }
                Ok(table) => {
                    warn!(
                        "{} has {} actuator columns, mirror has {}; using a flat fit",
                        path.display(),
                        table.n_actuators(),
                        config.n_actuators
                    );
                    ActuatorFit::zeros(config.n_actuators)
                }
                Err(err) => {
                    warn!("could not load {}: {}; using a flat fit", path.display(), err);
                    ActuatorFit::zeros(config.n_actuators)
                }
            },
            None => ActuatorFit::zeros(config.n_actuators),
        };

        let mut mirror = Self::new(&config.name, fit).with_settling_time(config.settling_time_ms)?;
        if let Some(trigger) = config.trigger_handler() {
            mirror = mirror.with_trigger(trigger);
        }
        if let (Some(lut), Some(user)) = (&config.lut_path, &config.user_config_path) {
            mirror = mirror.with_store(Box::new(FileCalibrationStore::new(lut, user)));
        }
        Ok(mirror)
    }

    /// Time a focus change takes to settle. Zero is allowed; negative times are not.
    pub fn with_settling_time(mut self, settling_time: Time) -> DeviceResult<Self> {
        if settling_time.is_negative() {
            return Err(ScheduleError::InvalidParameter(format!(
                "{}: settling time must be non-negative, got {} ms",
                self.handler, settling_time
            ))
            .into());
        }
        self.settling_time = settling_time;
        Ok(self)
    }

    /// Sends the stepping pulses to `trigger` instead of the mirror's own handler.
    pub fn with_trigger(mut self, trigger: HandlerRef) -> Self {
        self.trigger = Some(trigger);
        self
    }

    pub fn trigger(&self) -> Option<&HandlerRef> {
        self.trigger.as_ref()
    }

    pub fn with_store(mut self, store: Box<dyn CalibrationStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn fit(&self) -> &ActuatorFit {
        &self.fit
    }

    /// Shared handle on the calibration rows recorded so far.
    pub fn calibration_log(&self) -> CalibrationLog {
        self.log.clone()
    }

    /// Actuator patterns queued by the most recent rewrite.
    pub fn last_patterns(&self) -> Option<&Array2<f64>> {
        self.last_patterns.as_ref()
    }

    /// Actuator to hand to a generator so that it schedules focus changes on this mirror.
    pub fn positioner(&self) -> MirrorPositioner {
        MirrorPositioner {
            handler: self.handler.clone(),
            settling_time: self.settling_time,
        }
    }

    /// Plays back the rows of `actions` addressed to this mirror.
    ///
    /// Trigger edges are carried out by the trigger hardware and skipped here. Once all rows
    /// are done, a non-empty calibration log is persisted; a failure to persist is logged and
    /// the log kept in memory.
    pub fn execute_actions(
        &mut self,
        actions: &[Action],
        driver: &mut dyn MirrorDriver,
    ) -> DeviceResult<()> {
        for (index, action) in actions.iter().enumerate() {
            if action.handler != self.handler {
                continue;
            }
            match &action.payload {
                ActionPayload::Trigger(_) => {}
                ActionPayload::Move(value) => {
                    debug!("{}: ignoring leftover move to {}", self.handler, value);
                }
                ActionPayload::Marker(Marker::QueuePatterns(rows)) => {
                    let patterns = to_array(rows, driver.n_actuators())?;
                    driver.queue_patterns(&patterns)?;
                }
                ActionPayload::Marker(Marker::SetActuators(values)) => driver.send(values)?,
                ActionPayload::Marker(Marker::ClearCalibration) => {
                    trace!("{}: clearing calibration log", self.handler);
                    self.log.clear();
                }
                ActionPayload::Marker(Marker::FlattenAndRecord(position)) => {
                    let values = driver.flatten_phase(FLATTEN_ITERATIONS)?;
                    driver.reset()?;
                    driver.send(&values)?;
                    let mut entry = Vec::with_capacity(values.len() + 1);
                    entry.push(*position);
                    entry.extend(values);
                    self.log.push(entry);
                }
                ActionPayload::Removed => {
                    return Err(ScheduleError::UnsupportedPayload {
                        handler: self.handler.clone(),
                        payload: action.payload.to_string(),
                        index,
                    }
                    .into())
                }
            }
        }
        self.persist_calibration();
        Ok(())
    }

    fn persist_calibration(&self) {
        if self.log.is_empty() {
            return;
        }
        let entries = self.log.snapshot();
        match &self.store {
            Some(store) => match store.save(&entries) {
                Ok(()) => info!(
                    "{}: saved {} calibration rows",
                    self.handler,
                    entries.len()
                ),
                Err(err) => warn!(
                    "{}: failed to save {} calibration rows: {}",
                    self.handler,
                    entries.len(),
                    err
                ),
            },
            None => warn!(
                "{}: no calibration store configured, keeping {} rows in memory",
                self.handler,
                entries.len()
            ),
        }
    }
}

fn to_array(rows: &[Vec<f64>], n_actuators: usize) -> DeviceResult<Array2<f64>> {
    let flat: Vec<f64> = rows.iter().flatten().copied().collect();
    Array2::from_shape_vec((rows.len(), n_actuators), flat)
        .map_err(|e| DeviceError::Driver(format!("bad pattern matrix: {e}")))
}

impl Device for DeformableMirror {
    fn handler(&self) -> &HandlerRef {
        &self.handler
    }

    fn as_rewriter(&mut self) -> Option<&mut dyn ActionRewriter> {
        Some(self)
    }
}

impl ActionRewriter for DeformableMirror {
    fn examine_actions(&mut self, table: &mut ActionTable) -> ScheduleResult<()> {
        if table.entries_for(&self.handler).next().is_none() {
            return Ok(());
        }

        let (start, _) = table.first_and_last_times()?;
        let reduced = reduce_targets(table, &self.handler);
        let cycle = detect_cycle(&reduced).to_vec();
        let patterns = self.fit.encode(&cycle);

        let mut plan = CyclePlan::new(self.handler.clone(), cycle);
        if let Some(trigger) = &self.trigger {
            plan = plan.with_trigger(trigger.clone());
        }
        let end = expand_triggers(table, &mut plan)?;
        // Patterns must be loaded before anything else happens at the start
        if !plan.cycle().is_empty() {
            let rows = patterns.outer_iter().map(|r| r.to_vec()).collect();
            table.add_action_first(
                start,
                self.handler.clone(),
                ActionPayload::Marker(Marker::QueuePatterns(rows)),
            )?;
        }
        table.clear_bad_entries();
        let (_, last) = table.first_and_last_times()?;
        append_flush_triggers(table, plan.trigger(), end.map_or(last, |e| max(e, last)))?;

        debug!(
            "{}: {} distinct targets, cycle of {}",
            self.handler,
            reduced.len(),
            plan.cycle().len()
        );
        self.last_patterns = Some(patterns);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use acqcompiler_backend::action::{HandlerKind, LineState};
    use acqcompiler_backend::device::FLUSH_TRIGGER_COUNT;
    use std::path::PathBuf;
    use tracing_test::traced_test;

    fn ms(v: i64) -> Time {
        Time::from_whole_millis(v)
    }

    fn mirror() -> DeformableMirror {
        let lut = CalibrationTable::from_rows(vec![vec![0.0, 0.0, 1.0], vec![1.0, 2.0, 1.0]])
            .unwrap();
        DeformableMirror::new("dm", ActuatorFit::from_table(&lut))
    }

    fn table_with_moves(dm: &HandlerRef, rows: &[(i64, f64)]) -> ActionTable {
        let mut table = ActionTable::new();
        for &(t, v) in rows {
            table
                .add_action(ms(t), dm.clone(), ActionPayload::Move(v))
                .unwrap();
        }
        table
    }

    struct FailingStore;
    impl CalibrationStore for FailingStore {
        fn save(&self, _entries: &[Vec<f64>]) -> DeviceResult<()> {
            Err(DeviceError::Calibration("disk full".to_string()))
        }
    }

    #[test]
    fn rewrite_queues_cycle_and_emits_triggers() {
        let mut dm = mirror();
        let h = dm.handler().clone();
        let mut table = table_with_moves(&h, &[(0, 0.0), (10, 1.0), (20, 0.0), (30, 1.0)]);
        dm.examine_actions(&mut table).unwrap();

        assert!(table.is_sorted());
        assert!(table.iter().all(|a| a.payload.as_move().is_none()));
        match &table.get(0).unwrap().payload {
            ActionPayload::Marker(Marker::QueuePatterns(rows)) => {
                assert_eq!(rows, &vec![vec![0.0, 1.0], vec![2.0, 1.0]]);
            }
            other => panic!("expected queued patterns, got {other}"),
        }
        let rises = table
            .iter()
            .filter(|a| a.payload == ActionPayload::Trigger(LineState::High))
            .count();
        assert_eq!(rises, 3 + FLUSH_TRIGGER_COUNT);
        assert_eq!(dm.last_patterns().unwrap().nrows(), 2);
    }

    #[test]
    fn patterns_are_queued_before_the_first_exposure() {
        let mut dm = mirror();
        let h = dm.handler().clone();
        let cam = HandlerRef::camera("cam");
        let mut table = ActionTable::new();
        table.add_toggle(ms(0), cam.clone()).unwrap();
        table
            .add_action(ms(0), HandlerRef::light("488"), ActionPayload::Trigger(LineState::High))
            .unwrap();
        table.add_action(ms(0), h.clone(), ActionPayload::Move(0.0)).unwrap();
        table.add_action(ms(10), h.clone(), ActionPayload::Move(1.0)).unwrap();
        dm.examine_actions(&mut table).unwrap();

        let first = table.get(0).unwrap();
        assert_eq!(first.handler, h);
        assert!(matches!(
            first.payload,
            ActionPayload::Marker(Marker::QueuePatterns(_))
        ));
        assert_eq!(table.get(1).unwrap().handler, cam);
        assert!(table.is_sorted());
        table.validate().unwrap();
    }

    #[test]
    fn configured_trigger_line_receives_the_pulses() {
        let config = MirrorConfig {
            name: "dm".to_string(),
            n_actuators: 2,
            trigger_source: Some("dio".to_string()),
            trigger_line: Some("1".to_string()),
            settling_time_ms: Time::ZERO,
            lut_path: None,
            user_config_path: None,
        };
        let mut dm = DeformableMirror::from_config(&config).unwrap();
        let line = HandlerRef::new(HandlerKind::Trigger, "dio/1");
        assert_eq!(dm.trigger(), Some(&line));

        let h = dm.handler().clone();
        let mut table = table_with_moves(&h, &[(0, 0.0), (10, 1.0)]);
        dm.examine_actions(&mut table).unwrap();
        let rises = table
            .entries_for(&line)
            .filter(|(_, a)| a.payload == ActionPayload::Trigger(LineState::High))
            .count();
        assert_eq!(rises, 1 + FLUSH_TRIGGER_COUNT);
        // Only the queued patterns stay on the mirror itself
        assert_eq!(table.entries_for(&h).count(), 1);
    }

    #[test]
    fn negative_settling_time_is_rejected() {
        assert!(mirror().with_settling_time(ms(-1)).is_err());
        let dm = mirror().with_settling_time(Time::ZERO).unwrap();
        let (motion, _) = dm.positioner().movement_time(0.0, 1.0).unwrap();
        assert_eq!(motion, Time::ZERO);
    }

    #[test]
    fn calibration_only_table_still_flushes() {
        let mut dm = mirror();
        let h = dm.handler().clone();
        let mut table = ActionTable::new();
        table
            .add_action(ms(0), h.clone(), ActionPayload::Marker(Marker::ClearCalibration))
            .unwrap();
        table
            .add_action(ms(5), h.clone(), ActionPayload::Marker(Marker::FlattenAndRecord(1.5)))
            .unwrap();
        dm.examine_actions(&mut table).unwrap();
        assert_eq!(table.len(), 2 + 2 * FLUSH_TRIGGER_COUNT);
        assert_eq!(table.get(2).unwrap().time, ms(5));
    }

    #[test]
    fn untouched_when_mirror_is_unused() {
        let mut dm = mirror();
        let mut table = table_with_moves(&HandlerRef::stage("z"), &[(0, 1.0)]);
        dm.examine_actions(&mut table).unwrap();
        assert_eq!(table.len(), 1);
        assert!(dm.last_patterns().is_none());
    }

    #[test]
    fn execute_records_calibration_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let lut_path = dir.path().join("remote_focus_LUT.txt");
        let mut dm = mirror().with_store(Box::new(FileCalibrationStore::new(
            &lut_path,
            dir.path().join("user.json"),
        )));
        let h = dm.handler().clone();
        let mut driver = SimulatedMirror::new(2).with_flat(vec![0.25, -0.25]);

        let actions = vec![
            Action::new(ms(0), 0, h.clone(), ActionPayload::Marker(Marker::FlattenAndRecord(9.0))),
            Action::new(ms(1), 1, h.clone(), ActionPayload::Marker(Marker::ClearCalibration)),
            Action::new(ms(2), 2, h.clone(), ActionPayload::Marker(Marker::FlattenAndRecord(1.0))),
            Action::new(ms(3), 3, h.clone(), ActionPayload::Trigger(LineState::High)),
            Action::new(ms(4), 4, h.clone(), ActionPayload::Marker(Marker::FlattenAndRecord(2.0))),
            Action::new(ms(5), 5, HandlerRef::stage("z"), ActionPayload::Removed),
        ];
        dm.execute_actions(&actions, &mut driver).unwrap();

        assert_eq!(
            dm.calibration_log().snapshot(),
            vec![vec![1.0, 0.25, -0.25], vec![2.0, 0.25, -0.25]]
        );
        assert_eq!(driver.resets, 3);
        assert_eq!(driver.sent.len(), 3);
        let saved = CalibrationTable::load(&lut_path).unwrap();
        assert_eq!(saved.rows().len(), 2);
    }

    #[test]
    fn execute_forwards_patterns_and_rejects_tombstones() {
        let mut dm = mirror();
        let h = dm.handler().clone();
        let mut driver = SimulatedMirror::new(2);
        let actions = vec![
            Action::new(
                ms(0),
                0,
                h.clone(),
                ActionPayload::Marker(Marker::QueuePatterns(vec![vec![1.0, 2.0], vec![3.0, 4.0]])),
            ),
            Action::new(ms(1), 1, h.clone(), ActionPayload::Marker(Marker::SetActuators(vec![0.5, 0.5]))),
        ];
        dm.execute_actions(&actions, &mut driver).unwrap();
        assert_eq!(driver.queued.len(), 1);
        assert_eq!(driver.queued[0].shape(), &[2, 2]);
        assert_eq!(driver.sent, vec![vec![0.5, 0.5]]);

        let tombstone = [Action::new(ms(0), 0, h, ActionPayload::Removed)];
        assert!(matches!(
            dm.execute_actions(&tombstone, &mut driver).unwrap_err(),
            DeviceError::Schedule(ScheduleError::UnsupportedPayload { .. })
        ));
    }

    #[traced_test]
    #[test]
    fn failed_persistence_is_logged_and_log_kept() {
        let mut dm = mirror().with_store(Box::new(FailingStore));
        let h = dm.handler().clone();
        let mut driver = SimulatedMirror::new(2);
        let actions = [Action::new(ms(0), 0, h, ActionPayload::Marker(Marker::FlattenAndRecord(3.0)))];
        dm.execute_actions(&actions, &mut driver).unwrap();

        assert!(logs_contain("failed to save 1 calibration rows"));
        assert!(logs_contain("disk full"));
        assert_eq!(dm.calibration_log().len(), 1);
    }

    #[traced_test]
    #[test]
    fn config_without_lut_uses_flat_fit() {
        let config = MirrorConfig {
            name: "dm".to_string(),
            n_actuators: 3,
            trigger_source: None,
            trigger_line: None,
            settling_time_ms: ms(4),
            lut_path: Some(PathBuf::from("/nonexistent/remote_focus_LUT.txt")),
            user_config_path: None,
        };
        let dm = DeformableMirror::from_config(&config).unwrap();
        assert!(dm.trigger().is_none());
        assert_eq!(dm.fit(), &ActuatorFit::zeros(3));
        assert!(logs_contain("using a flat fit"));
        let (motion, settle) = dm.positioner().movement_time(0.0, 1.0).unwrap();
        assert_eq!((motion, settle), (ms(4), Time::ZERO));
    }
}
