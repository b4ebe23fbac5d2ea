//! Devices that take part in an experiment and the optional hook through which they rewrite
//! their own rows of the action table before execution.
//!
//! ## Capability
//!
//! Every participant implements [`Device`]. Devices that need to post-process the generated
//! table (typically to replace analog `Move` rows with trigger pulses that step the hardware
//! through a preloaded sequence) also implement [`ActionRewriter`] and return themselves from
//! [`Device::as_rewriter`]. The compile pipeline only calls the hook on devices that opt in.
//!
//! ## Building blocks
//!
//! A trigger-stepped device usually composes the helpers in this module:
//!
//! 1. [`reduce_targets`] isolates the distinct values requested of the device, in order.
//! 2. [`detect_cycle`] finds the repeating unit of that sequence; this is what gets loaded into
//!    the hardware.
//! 3. [`expand_triggers`] walks the table, tombstones the device's `Move` rows and inserts as
//!    many toggles at each row as it takes to step the hardware to the requested value
//!    (tracked by a [`CyclePlan`]).
//! 4. [`ActionTable::clear_bad_entries`] compacts the table.
//! 5. [`append_flush_triggers`] pads the end with [`FLUSH_TRIGGER_COUNT`] spare toggles so that
//!    any buffered trigger in the hardware is drained.

use tracing::{debug, trace};

use crate::action::{ActionPayload, HandlerRef, Marker};
use crate::error::{ScheduleError, ScheduleResult};
use crate::table::ActionTable;
use crate::time::Time;

/// Spare toggles appended after a rewritten sequence.
pub const FLUSH_TRIGGER_COUNT: usize = 12;

/// A participant of an experiment.
pub trait Device {
    fn handler(&self) -> &HandlerRef;

    /// Rewrite capability. Devices that do not post-process the table keep the default.
    fn as_rewriter(&mut self) -> Option<&mut dyn ActionRewriter> {
        None
    }
}

/// Hook invoked once per compile, after generation and before the table is frozen.
pub trait ActionRewriter {
    fn examine_actions(&mut self, table: &mut ActionTable) -> ScheduleResult<()>;
}

// Collapses runs of equal items to their first element.
fn dedup_consecutive<T: PartialEq>(items: impl IntoIterator<Item = T>) -> Vec<T> {
    let mut out: Vec<T> = Vec::new();
    for item in items {
        if out.last() != Some(&item) {
            out.push(item);
        }
    }
    out
}

/// Distinct consecutive target values requested of `handler`.
///
/// Runs of identical payloads (holds) collapse to one, then only `Move` values are kept, so a
/// marker between two equal moves still separates them.
///
/// ```
/// use acqcompiler_backend::action::*;
/// use acqcompiler_backend::device::reduce_targets;
/// use acqcompiler_backend::table::ActionTable;
/// use acqcompiler_backend::time::Time;
///
/// let dm = HandlerRef::device("dm");
/// let mut table = ActionTable::new();
/// for (t, v) in [(0, 1.0), (1, 1.0), (2, 2.0), (3, 1.0)] {
///     table.add_action(Time::from_whole_millis(t), dm.clone(), ActionPayload::Move(v)).unwrap();
/// }
/// assert_eq!(reduce_targets(&table, &dm), vec![1.0, 2.0, 1.0]);
/// ```
pub fn reduce_targets(table: &ActionTable, handler: &HandlerRef) -> Vec<f64> {
    let payloads = table
        .entries_for(handler)
        .map(|(_, a)| &a.payload)
        .filter(|p| !p.is_removed());
    dedup_consecutive(payloads)
        .into_iter()
        .filter_map(ActionPayload::as_move)
        .collect()
}

/// Repeating unit of `values`: the first length `L` in `2..=len/2` whose first `L` elements
/// equal the next `L`. Sequences without such a unit are their own cycle.
pub fn detect_cycle(values: &[f64]) -> &[f64] {
    let n = values.len();
    (2..=n / 2)
        .find(|&len| values[..len] == values[len..2 * len])
        .map_or(values, |len| &values[..len])
}

/// Tracks where in its loaded cycle a trigger-stepped device currently is.
///
/// Pulses go to the device's own handler unless a separate trigger line is set with
/// [`with_trigger`](CyclePlan::with_trigger).
#[derive(Clone, Debug, PartialEq)]
pub struct CyclePlan {
    handler: HandlerRef,
    trigger: HandlerRef,
    cycle: Vec<f64>,
    position: usize,
}

impl CyclePlan {
    pub fn new(handler: HandlerRef, cycle: Vec<f64>) -> Self {
        Self {
            trigger: handler.clone(),
            handler,
            cycle,
            position: 0,
        }
    }

    pub fn with_trigger(mut self, trigger: HandlerRef) -> Self {
        self.trigger = trigger;
        self
    }

    /// Handler the pulses are addressed to.
    pub fn trigger(&self) -> &HandlerRef {
        &self.trigger
    }

    pub fn cycle(&self) -> &[f64] {
        &self.cycle
    }

    pub fn position(&self) -> usize {
        self.position
    }

    /// Number of triggers needed to step forward, wrapping around the cycle, to the next
    /// occurrence of `value`. Advances the plan.
    pub fn triggers_to(&mut self, value: f64) -> ScheduleResult<usize> {
        let len = self.cycle.len();
        let distance = (0..len)
            .find(|k| self.cycle[(self.position + k) % len] == value)
            .ok_or_else(|| ScheduleError::ValueOutsideCycle {
                handler: self.handler.clone(),
                value,
            })?;
        self.position = (self.position + distance) % len;
        Ok(distance)
    }
}

/// Replaces the `Move` rows of the plan's handler with trigger pulses.
///
/// Each pulse occupies two toggle times, and the pulses for one row start at
/// that row's time. `ClearCalibration` and `FlattenAndRecord` markers are left in place; any
/// other payload on the handler's rows fails with [`ScheduleError::UnsupportedPayload`]. The
/// table is left unmodified on error.
///
/// Returns the time right after the last inserted pulse, or after the last row of the handler
/// if no pulse was needed; `None` when the handler has no rows at all.
pub fn expand_triggers(
    table: &mut ActionTable,
    plan: &mut CyclePlan,
) -> ScheduleResult<Option<Time>> {
    let handler = plan.handler.clone();
    let mut steps: Vec<(usize, Time, usize)> = Vec::new();
    let mut end = None;
    for (index, action) in table.entries_for(&handler) {
        match &action.payload {
            ActionPayload::Move(value) => {
                steps.push((index, action.time, plan.triggers_to(*value)?));
            }
            ActionPayload::Marker(Marker::ClearCalibration)
            | ActionPayload::Marker(Marker::FlattenAndRecord(_)) => {}
            ActionPayload::Removed => continue,
            other => {
                return Err(ScheduleError::UnsupportedPayload {
                    handler: handler.clone(),
                    payload: other.to_string(),
                    index,
                })
            }
        }
        end = Some(action.time);
    }

    for &(index, _, _) in &steps {
        table.mark_removed(index)?;
    }
    let toggle = table.toggle_time();
    let trigger = plan.trigger.clone();
    for (_, time, count) in steps {
        let mut t = time;
        for _ in 0..count {
            t = table.add_toggle(t, trigger.clone())? + toggle;
        }
        trace!("{}: {} trigger(s) on {} at {} ms", handler, count, trigger, time);
        end = end.max(Some(t));
    }
    Ok(end)
}

/// Appends [`FLUSH_TRIGGER_COUNT`] pulses for `handler` starting at `start`, returning the time
/// after the last one.
pub fn append_flush_triggers(
    table: &mut ActionTable,
    handler: &HandlerRef,
    start: Time,
) -> ScheduleResult<Time> {
    let toggle = table.toggle_time();
    let mut t = start;
    for _ in 0..FLUSH_TRIGGER_COUNT {
        t = table.add_toggle(t, handler.clone())? + toggle;
    }
    debug!(
        "{}: {} flush triggers from {} ms",
        handler, FLUSH_TRIGGER_COUNT, start
    );
    Ok(t)
}
