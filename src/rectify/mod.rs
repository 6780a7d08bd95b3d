//! Rectification: turning diffs into scheduler calls.
//!
//! This module contains the per-diff state machine and the per-resource queue
//! set that serialises rectifications for the same deployment.

mod deployable;
mod queue_set;
mod rectification;

pub use deployable::Deployable;
pub use queue_set::{
    Executor, QueueSet, QueueStatus, QueuedRectification, RectificationHandler, Resolution,
};
pub use rectification::{
    OutcomeTag, Rectification, RectificationOutcome, RectificationState, RectifyContext,
};
