//! The action table: the ordered timeline every generator writes and every device hook rewrites.
//!
//! ## Ordering
//! Actions are stored sorted by `(time, seq)`, where `seq` is a per-table monotonic insertion
//! counter. Two actions at the same time therefore keep the order in which they were added,
//! independently of where in the vector they happen to land.
//!
//! ## Tombstones
//! Rewrite hooks never delete in place, they replace payloads with [`ActionPayload::Removed`]
//! via [`ActionTable::mark_removed`] so that indices they computed earlier stay valid. A final
//! [`ActionTable::clear_bad_entries`] compacts the table.
//!
//! ## Conflicts
//! A handler cannot be asked to move to two different values at the same instant; such an
//! insertion fails with [`ScheduleError::ConflictingActions`]. Identical duplicates (a hold at a
//! position the handler is already moving to) are allowed.

use indexmap::IndexSet;
use tracing::trace;

use crate::action::*;
use crate::error::{ScheduleError, ScheduleResult};
use crate::time::{Time, TICKS_PER_MS};

/// Minimum spacing between two trigger edges unless configured otherwise: 0.1 ms.
pub const DEFAULT_TOGGLE_TIME: Time = Time::from_ticks(TICKS_PER_MS / 10);

#[derive(Clone, Debug)]
pub struct ActionTable {
    actions: Vec<Action>,
    next_seq: u64,
    start: Option<Time>,
    toggle_time: Time,
}

impl Default for ActionTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ActionTable {
    pub fn new() -> Self {
        Self {
            actions: Vec::new(),
            next_seq: 0,
            start: None,
            toggle_time: DEFAULT_TOGGLE_TIME,
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            actions: Vec::with_capacity(capacity),
            ..Self::new()
        }
    }

    /// Declares the earliest admissible action time.
    pub fn with_start(mut self, start: Time) -> Self {
        self.start = Some(start);
        self
    }

    pub fn with_toggle_time(mut self, toggle_time: Time) -> Self {
        self.toggle_time = toggle_time;
        self
    }

    pub fn toggle_time(&self) -> Time {
        self.toggle_time
    }

    pub fn start(&self) -> Option<Time> {
        self.start
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Action> {
        self.actions.get(index)
    }

    pub fn actions(&self) -> &[Action] {
        &self.actions
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Action> {
        self.actions.iter()
    }

    /// Inserts an action, keeping `(time, seq)` order, and returns its index.
    ///
    /// # Errors
    /// - [`ScheduleError::TimeBeforeStart`] when `time` precedes the declared start.
    /// - [`ScheduleError::ConflictingActions`] when `handler` already has a different `Move` at
    ///   exactly `time`.
    ///
    /// ```
    /// use acqcompiler_backend::action::*;
    /// use acqcompiler_backend::table::ActionTable;
    /// use acqcompiler_backend::time::Time;
    ///
    /// let z = HandlerRef::stage("z");
    /// let mut table = ActionTable::new();
    /// table.add_action(Time::from_whole_millis(5), z.clone(), ActionPayload::Move(1.0)).unwrap();
    /// let idx = table.add_action(Time::from_whole_millis(2), z.clone(), ActionPayload::Move(0.0)).unwrap();
    /// assert_eq!(idx, 0);
    /// assert!(table
    ///     .add_action(Time::from_whole_millis(5), z, ActionPayload::Move(2.0))
    ///     .is_err());
    /// ```
    pub fn add_action(
        &mut self,
        time: Time,
        handler: HandlerRef,
        payload: ActionPayload,
    ) -> ScheduleResult<usize> {
        if let Some(start) = self.start {
            if time < start {
                return Err(ScheduleError::TimeBeforeStart {
                    time: time.to_string(),
                    start: start.to_string(),
                    handler,
                });
            }
        }
        let first_same = self.actions.partition_point(|a| a.time < time);
        let index = self.actions.partition_point(|a| a.time <= time);
        if let ActionPayload::Move(requested) = payload {
            for existing in &self.actions[first_same..index] {
                check_move_conflict(existing, &handler, time, requested)?;
            }
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        trace!("add_action #{} at {} ms: {} {}", seq, time, handler, payload);
        self.actions
            .insert(index, Action::new(time, seq, handler, payload));
        Ok(index)
    }

    /// Inserts a rising edge at `time` and a falling edge one toggle time later, returning the
    /// time of the falling edge so that callers can chain pulses.
    pub fn add_toggle(&mut self, time: Time, handler: HandlerRef) -> ScheduleResult<Time> {
        let fall = time + self.toggle_time;
        self.add_action(
            time,
            handler.clone(),
            ActionPayload::Trigger(LineState::High),
        )?;
        self.add_action(fall, handler, ActionPayload::Trigger(LineState::Low))?;
        Ok(fall)
    }

    /// Like [`add_action`](Self::add_action), but the new action is placed ahead of every action
    /// already at `time`. Sequence numbers are reassigned in table order.
    pub fn add_action_first(
        &mut self,
        time: Time,
        handler: HandlerRef,
        payload: ActionPayload,
    ) -> ScheduleResult<usize> {
        let index = self.add_action(time, handler, payload)?;
        let first_same = self.actions.partition_point(|a| a.time < time);
        self.actions[first_same..=index].rotate_right(1);
        for (seq, action) in self.actions.iter_mut().enumerate() {
            action.seq = seq as u64;
        }
        self.next_seq = self.actions.len() as u64;
        Ok(first_same)
    }

    /// Adds a `Move` that supersedes any other target `handler` holds at exactly `time`: those
    /// conflicting moves are dropped instead of failing the insertion.
    ///
    /// Generators use this for a move that follows a hold with no motion time in between.
    pub fn add_move_superseding(
        &mut self,
        time: Time,
        handler: HandlerRef,
        value: f64,
    ) -> ScheduleResult<usize> {
        if self.start.map_or(false, |start| time < start) {
            return self.add_action(time, handler, ActionPayload::Move(value));
        }
        let before = self.actions.len();
        self.actions.retain(|a| {
            !(a.time == time
                && a.handler == handler
                && matches!(a.payload, ActionPayload::Move(v) if v != value))
        });
        if self.actions.len() != before {
            trace!("{}: move to {} at {} ms supersedes the hold", handler, value, time);
        }
        self.add_action(time, handler, ActionPayload::Move(value))
    }

    /// Merges `other` into this table by time.
    ///
    /// On equal times, entries already in `self` come first; entries of `other` keep their
    /// relative order and are given fresh sequence numbers from this table's counter. Nothing
    /// is modified if the merge fails.
    pub fn interleave(&mut self, other: ActionTable) -> ScheduleResult<()> {
        if let (Some(start), Some(first)) = (self.start, other.actions.first()) {
            if first.time < start {
                return Err(ScheduleError::TimeBeforeStart {
                    time: first.time.to_string(),
                    start: start.to_string(),
                    handler: first.handler.clone(),
                });
            }
        }

        let mut merged = Vec::with_capacity(self.actions.len() + other.actions.len());
        let mut next_seq = self.next_seq;
        let mut mine = self.actions.iter().cloned().peekable();
        let mut theirs = other.actions.into_iter().peekable();
        loop {
            let take_mine = match (mine.peek(), theirs.peek()) {
                (Some(a), Some(b)) => a.time <= b.time,
                (Some(_), None) => true,
                (None, Some(_)) => false,
                (None, None) => break,
            };
            if take_mine {
                merged.extend(mine.next());
            } else if let Some(mut action) = theirs.next() {
                action.seq = next_seq;
                next_seq += 1;
                merged.push(action);
            }
        }
        find_conflict(&merged)?;

        self.actions = merged;
        self.next_seq = next_seq;
        Ok(())
    }

    /// Tombstones the action at `index`, returning the payload it carried.
    pub fn mark_removed(&mut self, index: usize) -> ScheduleResult<ActionPayload> {
        let len = self.actions.len();
        let action = self
            .actions
            .get_mut(index)
            .ok_or(ScheduleError::IndexOutOfRange {
                start: index,
                stop: index + 1,
                len,
            })?;
        Ok(std::mem::replace(&mut action.payload, ActionPayload::Removed))
    }

    /// Drops every tombstone, preserving the order of the remaining actions.
    /// Returns the number of entries removed.
    pub fn clear_bad_entries(&mut self) -> usize {
        let before = self.actions.len();
        self.actions.retain(|a| !a.payload.is_removed());
        before - self.actions.len()
    }

    /// Read-only view of the actions in `start..stop`.
    pub fn slice(&self, start: usize, stop: usize) -> ScheduleResult<&[Action]> {
        if start > stop || stop > self.actions.len() {
            return Err(ScheduleError::IndexOutOfRange {
                start,
                stop,
                len: self.actions.len(),
            });
        }
        Ok(&self.actions[start..stop])
    }

    /// Indexed iterator over the actions addressed to `handler`.
    pub fn entries_for<'a>(
        &'a self,
        handler: &'a HandlerRef,
    ) -> impl Iterator<Item = (usize, &'a Action)> + 'a {
        self.actions
            .iter()
            .enumerate()
            .filter(move |(_, a)| &a.handler == handler)
    }

    /// Splits the table into (actions for `handler`, actions for everyone else).
    pub fn split_by_handler(&self, handler: &HandlerRef) -> (Vec<&Action>, Vec<&Action>) {
        self.actions.iter().partition(|a| &a.handler == handler)
    }

    /// Every handler that appears in the table, in order of first appearance.
    pub fn handlers(&self) -> IndexSet<HandlerRef> {
        self.actions.iter().map(|a| a.handler.clone()).collect()
    }

    /// Times of the first and last live (non-tombstoned) actions.
    pub fn first_and_last_times(&self) -> ScheduleResult<(Time, Time)> {
        let mut live = self.actions.iter().filter(|a| !a.payload.is_removed());
        let first = live.next().ok_or(ScheduleError::EmptyTable)?;
        let last = live.last().unwrap_or(first);
        Ok((first.time, last.time))
    }

    pub fn duration(&self) -> ScheduleResult<Time> {
        let (first, last) = self.first_and_last_times()?;
        Ok(last - first)
    }

    pub fn is_sorted(&self) -> bool {
        self.actions
            .windows(2)
            .all(|pair| pair[0].sort_key() < pair[1].sort_key())
    }

    /// Checks ordering and move conflicts over the whole table.
    pub fn validate(&self) -> ScheduleResult<()> {
        if let Some(i) = self
            .actions
            .windows(2)
            .position(|pair| pair[0].sort_key() >= pair[1].sort_key())
        {
            return Err(ScheduleError::Unsorted(i + 1));
        }
        find_conflict(&self.actions)
    }
}

impl<'a> IntoIterator for &'a ActionTable {
    type Item = &'a Action;
    type IntoIter = std::slice::Iter<'a, Action>;

    fn into_iter(self) -> Self::IntoIter {
        self.actions.iter()
    }
}

fn check_move_conflict(
    existing: &Action,
    handler: &HandlerRef,
    time: Time,
    requested: f64,
) -> ScheduleResult<()> {
    if &existing.handler != handler {
        return Ok(());
    }
    match existing.payload {
        ActionPayload::Move(value) if value != requested => Err(ScheduleError::ConflictingActions {
            handler: handler.clone(),
            time: time.to_string(),
            existing: value,
            requested,
        }),
        _ => Ok(()),
    }
}

// Assumes `actions` is sorted by time; checks every run of equal times.
fn find_conflict(actions: &[Action]) -> ScheduleResult<()> {
    let mut run_start = 0;
    for i in 0..actions.len() {
        if actions[i].time != actions[run_start].time {
            run_start = i;
        }
        if let ActionPayload::Move(requested) = actions[i].payload {
            for earlier in &actions[run_start..i] {
                check_move_conflict(earlier, &actions[i].handler, actions[i].time, requested)?;
            }
        }
    }
    Ok(())
}
