//! Provides definitions for the entries of an action table.
//!
//! ## Main Structures and Enumerations:
//!
//! - [`HandlerRef`]: An opaque, comparable identity for whatever an action is addressed to: a stage
//!   axis, a camera, a light, a trigger line or a whole device.
//!
//! - [`ActionPayload`]: What the handler is asked to do. A tagged variant: continuous moves,
//!   discrete trigger edges, device control markers and the `Removed` tombstone left behind by
//!   rewrite hooks until the table is compacted.
//!
//! - [`Action`]: A payload for a handler at an exact [`Time`], plus the insertion sequence number
//!   used to order actions that share a timestamp.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use crate::time::Time;

/// Broad category of a handler. Only used for display and for sanity checks in generators.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HandlerKind {
    Stage,
    Camera,
    Light,
    Trigger,
    Analog,
    Device,
}
impl fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                HandlerKind::Stage => "stage",
                HandlerKind::Camera => "camera",
                HandlerKind::Light => "light",
                HandlerKind::Trigger => "trigger",
                HandlerKind::Analog => "analog",
                HandlerKind::Device => "device",
            }
        )
    }
}

/// Identity of an action's target. Cloning is cheap (the name is reference counted).
///
/// Two handlers are equal when both kind and name match:
/// ```
/// use acqcompiler_backend::action::*;
///
/// let z = HandlerRef::stage("z");
/// assert_eq!(z, HandlerRef::new(HandlerKind::Stage, "z"));
/// assert_ne!(z, HandlerRef::analog("z"));
/// assert_eq!(z.to_string(), "stage:z");
/// ```
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HandlerRef {
    kind: HandlerKind,
    name: Arc<str>,
}
impl HandlerRef {
    pub fn new(kind: HandlerKind, name: &str) -> Self {
        Self {
            kind,
            name: Arc::from(name),
        }
    }
    pub fn stage(name: &str) -> Self {
        Self::new(HandlerKind::Stage, name)
    }
    pub fn camera(name: &str) -> Self {
        Self::new(HandlerKind::Camera, name)
    }
    pub fn light(name: &str) -> Self {
        Self::new(HandlerKind::Light, name)
    }
    pub fn analog(name: &str) -> Self {
        Self::new(HandlerKind::Analog, name)
    }
    pub fn device(name: &str) -> Self {
        Self::new(HandlerKind::Device, name)
    }

    pub fn kind(&self) -> HandlerKind {
        self.kind
    }
    pub fn name(&self) -> &str {
        &self.name
    }
}
impl fmt::Display for HandlerRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.name)
    }
}

/// Level of a trigger line after an edge.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LineState {
    High,
    Low,
}

/// Device-specific control messages carried through the table untouched by generic code.
#[derive(Clone, Debug, PartialEq)]
pub enum Marker {
    /// Discard any calibration entries accumulated so far.
    ClearCalibration,
    /// Flatten the device at the given logical position and record the result as a calibration
    /// entry.
    FlattenAndRecord(f64),
    /// Load a sequence of actuator vectors; each trigger then steps to the next one.
    QueuePatterns(Vec<Vec<f64>>),
    /// Apply a single actuator vector immediately.
    SetActuators(Vec<f64>),
}
impl fmt::Display for Marker {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Marker::ClearCalibration => write!(f, "clear-calibration"),
            Marker::FlattenAndRecord(pos) => write!(f, "flatten-and-record({pos})"),
            Marker::QueuePatterns(patterns) => write!(f, "queue-patterns({})", patterns.len()),
            Marker::SetActuators(values) => write!(f, "set-actuators({})", values.len()),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ActionPayload {
    /// Move, or hold, a continuous actuator at a value.
    Move(f64),
    /// One edge on a hardware trigger line.
    Trigger(LineState),
    Marker(Marker),
    /// Tombstone for a superseded action, swept by [`crate::table::ActionTable::clear_bad_entries`].
    Removed,
}
impl ActionPayload {
    pub fn is_removed(&self) -> bool {
        matches!(self, ActionPayload::Removed)
    }

    pub fn as_move(&self) -> Option<f64> {
        match self {
            ActionPayload::Move(value) => Some(*value),
            _ => None,
        }
    }
}
impl fmt::Display for ActionPayload {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ActionPayload::Move(value) => write!(f, "move({value})"),
            ActionPayload::Trigger(LineState::High) => write!(f, "trigger(high)"),
            ActionPayload::Trigger(LineState::Low) => write!(f, "trigger(low)"),
            ActionPayload::Marker(marker) => write!(f, "{marker}"),
            ActionPayload::Removed => write!(f, "removed"),
        }
    }
}

/// One row of an action table.
///
/// Actions order by `time` first and by insertion sequence number `seq` second, so that
/// logically simultaneous actions keep the order in which a generator emitted them.
#[derive(Clone, Debug)]
pub struct Action {
    pub time: Time,
    pub seq: u64,
    pub handler: HandlerRef,
    pub payload: ActionPayload,
}
impl Action {
    pub fn new(time: Time, seq: u64, handler: HandlerRef, payload: ActionPayload) -> Self {
        Action {
            time,
            seq,
            handler,
            payload,
        }
    }

    pub fn sort_key(&self) -> (Time, u64) {
        (self.time, self.seq)
    }
}
// Support total ordering for Action (payloads do not participate)
impl Ord for Action {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}
impl PartialOrd for Action {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl PartialEq for Action {
    fn eq(&self, other: &Self) -> bool {
        self.sort_key() == other.sort_key()
    }
}
impl Eq for Action {}
impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Action({} ms #{}, {}, {})",
            self.time, self.seq, self.handler, self.payload
        )
    }
}
