//! Compile pipeline: generate, let devices rewrite, freeze.
//!
//! [`compile_experiment`] is the only way to obtain an [`ExperimentSession`]. A session owns the
//! finished table and is read-only from then on; executors receive it explicitly instead of
//! looking up a process-wide "current experiment".

use std::cmp::max;
use tracing::{debug, info};

use crate::action::Action;
use crate::device::Device;
use crate::error::ScheduleResult;
use crate::experiment::Experiment;
use crate::exposure::Exposer;
use crate::table::ActionTable;
use crate::time::Time;

/// Builds the table of `experiment` and runs the rewrite hook of every device in `devices` that
/// exposes one, in order.
///
/// Any error aborts compilation; a partially rewritten table never leaves this function.
pub fn compile_experiment(
    experiment: &dyn Experiment,
    exposer: &dyn Exposer,
    devices: &mut [&mut dyn Device],
) -> ScheduleResult<ExperimentSession> {
    let mut table = experiment.generate_actions(exposer)?;
    debug!(
        "{}: generated {} actions",
        experiment.name(),
        table.len()
    );

    for device in devices.iter_mut() {
        let handler = device.handler().clone();
        if let Some(rewriter) = device.as_rewriter() {
            let before = table.len();
            rewriter.examine_actions(&mut table)?;
            debug!(
                "{}: {} rewrote the table ({} -> {} actions)",
                experiment.name(),
                handler,
                before,
                table.len()
            );
        }
    }

    let swept = table.clear_bad_entries();
    if swept > 0 {
        debug!("{}: swept {} leftover tombstones", experiment.name(), swept);
    }
    table.validate()?;

    let session = ExperimentSession {
        name: experiment.name().to_string(),
        table,
        num_reps: experiment.num_reps(),
        rep_duration: experiment.params().rep_duration(),
    };
    info!(
        "compiled {}: {} actions, {} ms per repetition, {} repetition(s)",
        session.name,
        session.len(),
        session.duration()?,
        session.num_reps
    );
    Ok(session)
}

/// A compiled, immutable experiment ready to hand to an executor.
#[derive(Clone, Debug)]
pub struct ExperimentSession {
    name: String,
    table: ActionTable,
    num_reps: usize,
    rep_duration: Option<Time>,
}

impl ExperimentSession {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn table(&self) -> &ActionTable {
        &self.table
    }

    pub fn actions(&self) -> &[Action] {
        self.table.actions()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Action> {
        self.table.iter()
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn num_reps(&self) -> usize {
        self.num_reps
    }

    pub fn rep_duration(&self) -> Option<Time> {
        self.rep_duration
    }

    /// Time between the first and last action of one repetition.
    pub fn duration(&self) -> ScheduleResult<Time> {
        self.table.duration()
    }

    /// Time from the start of one repetition to the start of the next.
    pub fn rep_period(&self) -> ScheduleResult<Time> {
        Ok(max(
            self.duration()?,
            self.rep_duration.unwrap_or(Time::ZERO),
        ))
    }

    /// Wall time of all repetitions back to back.
    pub fn total_time(&self) -> ScheduleResult<Time> {
        let period = self.rep_period()?;
        Ok(Time::from_ticks(period.ticks() * self.num_reps as i128))
    }
}

impl<'a> IntoIterator for &'a ExperimentSession {
    type Item = &'a Action;
    type IntoIter = std::slice::Iter<'a, Action>;

    fn into_iter(self) -> Self::IntoIter {
        self.table.iter()
    }
}
