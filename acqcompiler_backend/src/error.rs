//! Error type shared by every stage of table construction.
//!
//! Errors fall into three groups, all surfaced before a table reaches an executor:
//!
//! - **Parameter errors** ([`ScheduleError::InvalidHeight`], [`ScheduleError::InvalidStep`],
//!   [`ScheduleError::DuplicateLight`], [`ScheduleError::InvalidParameter`]): the experiment
//!   description itself is unusable. Raised before any table exists.
//! - **Structural errors** ([`ScheduleError::InvalidTime`], [`ScheduleError::TimeBeforeStart`],
//!   [`ScheduleError::ConflictingActions`], [`ScheduleError::EmptyTable`],
//!   [`ScheduleError::IndexOutOfRange`], [`ScheduleError::Unsorted`]): a generator or device
//!   produced an inconsistent table. These indicate bugs and are never retried.
//! - **Rewrite errors** ([`ScheduleError::UnsupportedPayload`],
//!   [`ScheduleError::ValueOutsideCycle`]): a device hook met something it cannot encode.
//!   Finalization is aborted; a partially rewritten table is never executed.

use thiserror::Error;

use crate::action::HandlerRef;

/// Convenience alias for results carrying a [`ScheduleError`].
pub type ScheduleResult<T> = std::result::Result<T, ScheduleError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScheduleError {
    #[error("'stack_height' must be non-negative, got {0}")]
    InvalidHeight(f64),

    #[error("'step' must be non-zero for a stack height of {height}, got {step}")]
    InvalidStep { step: f64, height: f64 },

    #[error("already have an exposure time for light '{0}'")]
    DuplicateLight(HandlerRef),

    #[error("invalid experiment parameter: {0}")]
    InvalidParameter(String),

    #[error("invalid time value: {0}")]
    InvalidTime(String),

    #[error("action at {time} ms for {handler} precedes the table start {start} ms")]
    TimeBeforeStart {
        time: String,
        start: String,
        handler: HandlerRef,
    },

    #[error("{handler} already moves to {existing} at {time} ms, cannot also move to {requested}")]
    ConflictingActions {
        handler: HandlerRef,
        time: String,
        existing: f64,
        requested: f64,
    },

    #[error("action table is empty")]
    EmptyTable,

    #[error("slice {start}..{stop} is out of range for a table of {len} actions")]
    IndexOutOfRange { start: usize, stop: usize, len: usize },

    #[error("action table is out of order at index {0}")]
    Unsorted(usize),

    #[error("{handler} cannot rewrite payload {payload} at index {index}")]
    UnsupportedPayload {
        handler: HandlerRef,
        payload: String,
        index: usize,
    },

    #[error("{handler} was asked for value {value}, which is not part of its detected cycle")]
    ValueOutsideCycle { handler: HandlerRef, value: f64 },

    #[error("invalid camera transform '{0}'")]
    InvalidTransform(String),

    #[error("device {handler} failed: {message}")]
    Device { handler: HandlerRef, message: String },
}
